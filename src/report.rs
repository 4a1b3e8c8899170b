//! Final report: every differing composite stacked vertically
//!
//! The stack is as wide as the widest composite, narrower composites are
//! left-aligned, and there is no spacing between them. The stack is
//! downsampled to the configured output width before encoding.

use crate::diff::encode_png;
use crate::metrics::record_report;
use crate::utils::format_bytes;
use crate::{ComparisonArtifact, DiffError, ReportOptions};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::info;

/// Encoded report ready for publishing
#[derive(Debug, Clone)]
pub struct Report {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub artifact_count: usize,
}

/// Stack composites top to bottom in the given order
///
/// Returns `None` for an empty list.
pub fn stack_artifacts(artifacts: &[ComparisonArtifact]) -> Option<RgbaImage> {
    if artifacts.is_empty() {
        return None;
    }

    let width = artifacts.iter().map(|a| a.image.width()).max().unwrap_or(0);
    let height = artifacts.iter().map(|a| a.image.height()).sum();
    let mut canvas = RgbaImage::new(width, height);

    let mut y = 0u32;
    for artifact in artifacts {
        imageops::replace(&mut canvas, &artifact.image, 0, i64::from(y));
        y += artifact.image.height();
    }
    Some(canvas)
}

/// Shrink to `output_width` keeping the aspect ratio; narrower images are kept
pub fn fit_width(image: RgbaImage, output_width: u32) -> RgbaImage {
    if image.width() <= output_width {
        return image;
    }

    let ratio = f64::from(output_width) / f64::from(image.width());
    let height = ((f64::from(image.height()) * ratio).round() as u32).max(1);
    imageops::resize(&image, output_width, height, FilterType::Lanczos3)
}

/// Assemble and encode the report
///
/// Returns `Ok(None)` when there is nothing to report.
pub fn assemble(
    mut artifacts: Vec<ComparisonArtifact>,
    options: &ReportOptions,
) -> Result<Option<Report>, DiffError> {
    if options.sort_artifacts {
        artifacts.sort_by(|a, b| {
            (&a.story.kind, &a.story.name).cmp(&(&b.story.kind, &b.story.name))
        });
    }

    let Some(stacked) = stack_artifacts(&artifacts) else {
        return Ok(None);
    };

    let report = fit_width(stacked, options.output_width);
    let png = encode_png(&report)?;

    info!(
        "Report assembled: {} composites, {}x{}, {}",
        artifacts.len(),
        report.width(),
        report.height(),
        format_bytes(png.len())
    );
    record_report(png.len(), artifacts.len());

    Ok(Some(Report {
        width: report.width(),
        height: report.height(),
        artifact_count: artifacts.len(),
        png,
    }))
}
