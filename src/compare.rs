//! Pairwise comparison of one story across both origins
//!
//! The story is captured on the baseline and the candidate origin, compared
//! with the run's [`DiffEngine`], and only when the two differ composed into a
//! three-panel [`ComparisonArtifact`]: baseline, candidate, highlighted diff.

use crate::capture::{Capturer, Side};
use crate::diff::{decode_png, DiffEngine, DiffResult};
use crate::utils::story_url;
use crate::{CompositeLayout, DiffError, StoryRef};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{imageops, Rgba, RgbaImage};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Composite of a story that renders differently on the two origins
#[derive(Debug, Clone)]
pub struct ComparisonArtifact {
    pub story: StoryRef,
    pub image: RgbaImage,
    pub diff: DiffResult,
}

pub struct Comparator {
    capturer: Arc<dyn Capturer>,
    constant_url: String,
    variable_url: String,
    engine: DiffEngine,
    layout: CompositeLayout,
    cpu_permits: Arc<Semaphore>,
}

impl Comparator {
    pub fn new(
        capturer: Arc<dyn Capturer>,
        constant_url: impl Into<String>,
        variable_url: impl Into<String>,
        engine: DiffEngine,
        layout: CompositeLayout,
    ) -> Self {
        Self {
            capturer,
            constant_url: constant_url.into(),
            variable_url: variable_url.into(),
            engine,
            layout,
            cpu_permits: Arc::new(Semaphore::new(num_cpus::get())),
        }
    }

    /// Capture and compare one story
    ///
    /// `Ok(None)` means both renders are equal under the diff options.
    pub async fn compare(&self, story: &StoryRef) -> Result<Option<ComparisonArtifact>, DiffError> {
        let baseline_url = story_url(&self.constant_url, &story.query);
        let candidate_url = story_url(&self.variable_url, &story.query);

        // both captures run to completion so each one closes its own page,
        // even when the other side fails
        let (baseline, candidate) = tokio::join!(
            self.capturer.capture(story, &baseline_url, Side::Baseline),
            self.capturer.capture(story, &candidate_url, Side::Candidate),
        );
        let (baseline, candidate) = (baseline?, candidate?);

        // decoding and diffing full-page captures is CPU bound
        let _permit = self
            .cpu_permits
            .acquire()
            .await
            .map_err(|e| DiffError::Comparison(e.to_string()))?;

        let engine = self.engine.clone();
        let layout = self.layout.clone();
        let label = story.label();
        let outcome = tokio::task::spawn_blocking(move || {
            diff_story(&engine, &layout, &label, &baseline.data, &candidate.data)
        })
        .await
        .map_err(|e| DiffError::Comparison(e.to_string()))??;

        Ok(match outcome {
            None => {
                debug!("{} unchanged", story.label());
                None
            }
            Some((image, diff)) => {
                info!(
                    "{} differs in {} pixels",
                    story.label(),
                    diff.differing_pixels
                );
                Some(ComparisonArtifact {
                    story: story.clone(),
                    image,
                    diff,
                })
            }
        })
    }
}

fn diff_story(
    engine: &DiffEngine,
    layout: &CompositeLayout,
    label: &str,
    baseline: &[u8],
    candidate: &[u8],
) -> Result<Option<(RgbaImage, DiffResult)>, DiffError> {
    if baseline == candidate {
        return Ok(None);
    }

    let comparison = |e: DiffError| DiffError::Comparison(e.to_string());
    let reference = decode_png(baseline).map_err(comparison)?;
    let candidate = decode_png(candidate).map_err(comparison)?;

    let mask = engine.mask(&reference, &candidate);
    if mask.is_equal() {
        return Ok(None);
    }

    let diff = mask.render(&reference, engine.options().highlight_color.to_rgba());
    let composite = compose_panels(&reference, &candidate, &diff, layout, Some(label));
    Ok(Some((composite, mask.result())))
}

/// Lay out baseline, candidate and diff side by side
///
/// Panels are top-aligned at `margin + gap` and separated by `gap`; the whole
/// composite is surrounded by `margin`. The label goes into the top gap.
pub fn compose_panels(
    baseline: &RgbaImage,
    candidate: &RgbaImage,
    diff: &RgbaImage,
    layout: &CompositeLayout,
    label: Option<&str>,
) -> RgbaImage {
    let margin = layout.margin;
    let gap = layout.gap;
    let top = margin + gap;

    let width = 2 * margin + baseline.width() + candidate.width() + diff.width() + 2 * gap;
    let height = 2 * margin + gap + baseline.height().max(candidate.height()).max(diff.height());

    let mut canvas = RgbaImage::from_pixel(width, height, layout.background.to_rgba());

    let mut x = margin;
    for panel in [baseline, candidate, diff] {
        imageops::replace(&mut canvas, panel, i64::from(x), i64::from(top));
        x += panel.width() + gap;
    }

    if let Some(label) = label.filter(|_| layout.draw_label) {
        let scale = layout.label_scale.max(1);
        let glyph_height = 8 * scale;
        let y = margin + gap.saturating_sub(glyph_height) / 2;
        draw_label(&mut canvas, margin, y, label, scale, layout.label_color.to_rgba());
    }

    canvas
}

/// Draw `text` with 8x8 glyphs upscaled by `scale`, clipped to the canvas
pub fn draw_label(canvas: &mut RgbaImage, x: u32, y: u32, text: &str, scale: u32, color: Rgba<u8>) {
    let advance = 8 * scale;
    let mut cursor_x = x;

    for ch in text.chars() {
        if cursor_x >= canvas.width() {
            break;
        }
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            for bit in 0..8 {
                // font8x8 stores LSB as leftmost pixel
                if (row >> bit) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + bit * scale;
                let py = y + row_idx as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        if px + dx < canvas.width() && py + dy < canvas.height() {
                            canvas.put_pixel(px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
        cursor_x += advance;
    }
}
