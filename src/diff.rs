//! Perceptual image comparison
//!
//! Two screenshots are equal when every pixel pair is within the CIEDE2000
//! tolerance, optionally forgiving anti-aliased edges and a blinking text
//! caret. The equality verdict and the highlighted diff image come from the
//! same [`DiffMask`], so they can never disagree.

use crate::{DiffError, DiffOptions};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, ImageEncoder, Rgba, RgbaImage};
use std::sync::OnceLock;

/// Widest vertical run of differing pixels still treated as a text caret
pub const CARET_MAX_WIDTH: u32 = 1;

/// Summary of one comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult {
    pub equal: bool,
    pub same_size: bool,
    pub differing_pixels: usize,
    /// `(x, y, width, height)` of the differing area
    pub bounds: Option<(u32, u32, u32, u32)>,
}

/// Per-pixel verdict over the union of both image sizes
#[derive(Debug, Clone)]
pub struct DiffMask {
    width: u32,
    height: u32,
    same_size: bool,
    different: Vec<bool>,
    count: usize,
}

impl DiffMask {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_different(&self, x: u32, y: u32) -> bool {
        self.different[y as usize * self.width as usize + x as usize]
    }

    pub fn is_equal(&self) -> bool {
        self.same_size && self.count == 0
    }

    pub fn result(&self) -> DiffResult {
        DiffResult {
            equal: self.is_equal(),
            same_size: self.same_size,
            differing_pixels: self.count,
            bounds: self.bounds(),
        }
    }

    fn bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (idx, _) in self.different.iter().enumerate().filter(|(_, d)| **d) {
            let x = idx as u32 % self.width;
            let y = idx as u32 / self.width;
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        bounds.map(|(x0, y0, x1, y1)| (x0, y0, x1 - x0 + 1, y1 - y0 + 1))
    }

    /// Reference pixels where equal, `highlight` where different
    pub fn render(&self, reference: &RgbaImage, highlight: Rgba<u8>) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            if self.is_different(x, y) {
                highlight
            } else {
                // equal pixels are always inside the reference
                *reference.get_pixel(x, y)
            }
        })
    }

    /// A single vertical run at most [`CARET_MAX_WIDTH`] wide
    fn is_caret(&self) -> bool {
        if self.count == 0 {
            return false;
        }

        let mut column: Option<(u32, u32)> = None;
        let mut rows: Option<(u32, u32)> = None;
        for (idx, _) in self.different.iter().enumerate().filter(|(_, d)| **d) {
            let x = idx as u32 % self.width;
            let y = idx as u32 / self.width;
            column = Some(column.map_or((x, x), |(lo, hi)| (lo.min(x), hi.max(x))));
            rows = Some(rows.map_or((y, y), |(lo, hi)| (lo.min(y), hi.max(y))));
        }

        match (column, rows) {
            (Some((x0, x1)), Some((y0, y1))) => {
                let width = x1 - x0 + 1;
                let height = (y1 - y0 + 1) as usize;
                // every row of the run must be filled
                width <= CARET_MAX_WIDTH && self.count == height * width as usize
            }
            _ => false,
        }
    }

    fn clear(&mut self) {
        self.different.iter_mut().for_each(|d| *d = false);
        self.count = 0;
    }
}

/// Image differ configured once per run
#[derive(Debug, Clone)]
pub struct DiffEngine {
    options: DiffOptions,
}

impl DiffEngine {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    /// Compare two encoded images
    pub fn compare_images(&self, reference: &[u8], candidate: &[u8]) -> Result<DiffResult, DiffError> {
        if reference == candidate {
            return Ok(DiffResult {
                equal: true,
                same_size: true,
                differing_pixels: 0,
                bounds: None,
            });
        }

        let reference = decode_png(reference)?;
        let candidate = decode_png(candidate)?;
        Ok(self.mask(&reference, &candidate).result())
    }

    /// Highlighted diff of two encoded images, sized to the union of both
    pub fn create_diff(&self, reference: &[u8], candidate: &[u8]) -> Result<RgbaImage, DiffError> {
        let reference = decode_png(reference)?;
        let candidate = decode_png(candidate)?;
        let mask = self.mask(&reference, &candidate);
        Ok(mask.render(&reference, self.options.highlight_color.to_rgba()))
    }

    /// Classify every pixel of the union of both sizes
    ///
    /// Pixels outside either image are always different.
    pub fn mask(&self, reference: &RgbaImage, candidate: &RgbaImage) -> DiffMask {
        let (w1, h1) = reference.dimensions();
        let (w2, h2) = candidate.dimensions();
        let width = w1.max(w2);
        let height = h1.max(h2);
        let shared_width = w1.min(w2);
        let shared_height = h1.min(h2);

        let mut different = vec![false; width as usize * height as usize];
        let mut count = 0;

        for y in 0..height {
            for x in 0..width {
                let outside = x >= shared_width || y >= shared_height;
                if outside || !self.pixels_match(reference, candidate, x, y, shared_width, shared_height) {
                    different[y as usize * width as usize + x as usize] = true;
                    count += 1;
                }
            }
        }

        let mut mask = DiffMask {
            width,
            height,
            same_size: w1 == w2 && h1 == h2,
            different,
            count,
        };

        if mask.same_size && self.options.ignore_caret && !self.options.strict && mask.is_caret() {
            mask.clear();
        }
        mask
    }

    fn pixels_match(&self, a: &RgbaImage, b: &RgbaImage, x: u32, y: u32, w: u32, h: u32) -> bool {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        if pa == pb {
            return true;
        }
        if self.options.strict {
            return false;
        }
        if ciede2000(to_lab(pa), to_lab(pb)) <= self.options.tolerance {
            return true;
        }

        self.options.ignore_antialiasing
            && (self.antialiased(a, b, x, y, w, h) || self.antialiased(b, a, x, y, w, h))
    }

    /// Whether the pixel at `(x1, y1)` of `img` sits on an anti-aliased edge
    ///
    /// The pixel must have neighbours both darker and brighter than itself,
    /// at most two neighbours of equal brightness, and the darkest or the
    /// brightest neighbour must lie inside a flat area in both images.
    fn antialiased(&self, img: &RgbaImage, other: &RgbaImage, x1: u32, y1: u32, w: u32, h: u32) -> bool {
        let x0 = x1.saturating_sub(1);
        let y0 = y1.saturating_sub(1);
        let x2 = (x1 + 1).min(w - 1);
        let y2 = (y1 + 1).min(h - 1);

        let on_edge = x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2;
        let mut zeroes = usize::from(on_edge);
        let mut min = 0.0;
        let mut max = 0.0;
        let mut min_pos = (0, 0);
        let mut max_pos = (0, 0);
        let center = brightness(img.get_pixel(x1, y1));

        for x in x0..=x2 {
            for y in y0..=y2 {
                if x == x1 && y == y1 {
                    continue;
                }

                let delta = center - brightness(img.get_pixel(x, y));
                if delta.abs() <= self.options.antialiasing_tolerance {
                    zeroes += 1;
                    if zeroes > 2 {
                        return false;
                    }
                } else if delta < min {
                    min = delta;
                    min_pos = (x, y);
                } else if delta > max {
                    max = delta;
                    max_pos = (x, y);
                }
            }
        }

        if min == 0.0 || max == 0.0 {
            return false;
        }

        (has_many_siblings(img, min_pos, w, h) && has_many_siblings(other, min_pos, w, h))
            || (has_many_siblings(img, max_pos, w, h) && has_many_siblings(other, max_pos, w, h))
    }
}

/// More than two identical neighbours
fn has_many_siblings(img: &RgbaImage, (x1, y1): (u32, u32), w: u32, h: u32) -> bool {
    let x0 = x1.saturating_sub(1);
    let y0 = y1.saturating_sub(1);
    let x2 = (x1 + 1).min(w - 1);
    let y2 = (y1 + 1).min(h - 1);

    let on_edge = x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2;
    let mut zeroes = usize::from(on_edge);
    let center = img.get_pixel(x1, y1);

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            if img.get_pixel(x, y) == center {
                zeroes += 1;
                if zeroes > 2 {
                    return true;
                }
            }
        }
    }
    false
}

/// Channel blended over white
fn blend(channel: u8, alpha: u8) -> f64 {
    let alpha = f64::from(alpha) / 255.0;
    255.0 + (f64::from(channel) - 255.0) * alpha
}

fn brightness(pixel: &Rgba<u8>) -> f64 {
    let [r, g, b, a] = pixel.0;
    blend(r, a) * 0.29889531 + blend(g, a) * 0.58662247 + blend(b, a) * 0.11448223
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

fn srgb_to_linear(value: f64) -> f64 {
    let v = value / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_table() -> &'static [f64; 256] {
    static TABLE: OnceLock<[f64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = srgb_to_linear(i as f64);
        }
        table
    })
}

/// sRGB (blended over white) to CIE L*a*b*, D65 white point
pub fn to_lab(pixel: &Rgba<u8>) -> Lab {
    let [r, g, b, a] = pixel.0;
    let (r, g, b) = if a == 0xff {
        let table = linear_table();
        (table[r as usize], table[g as usize], table[b as usize])
    } else {
        (
            srgb_to_linear(blend(r, a)),
            srgb_to_linear(blend(g, a)),
            srgb_to_linear(blend(b, a)),
        )
    };

    let x = (0.4124564 * r + 0.3575761 * g + 0.1804375 * b) / 0.95047;
    let y = 0.2126729 * r + 0.7151522 * g + 0.0721750 * b;
    let z = (0.0193339 * r + 0.1191920 * g + 0.9503041 * b) / 1.08883;

    fn f(t: f64) -> f64 {
        const EPSILON: f64 = 216.0 / 24389.0;
        const KAPPA: f64 = 24389.0 / 27.0;
        if t > EPSILON {
            t.cbrt()
        } else {
            (KAPPA * t + 16.0) / 116.0
        }
    }

    let (fx, fy, fz) = (f(x), f(y), f(z));
    Lab {
        l: 116.0 * fy - 16.0,
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}

/// CIEDE2000 colour difference
pub fn ciede2000(lab1: Lab, lab2: Lab) -> f64 {
    const POW25_7: f64 = 6_103_515_625.0;

    let c1 = lab1.a.hypot(lab1.b);
    let c2 = lab2.a.hypot(lab2.b);
    let c_bar7 = ((c1 + c2) / 2.0).powi(7);
    let g = 0.5 * (1.0 - (c_bar7 / (c_bar7 + POW25_7)).sqrt());

    let a1p = (1.0 + g) * lab1.a;
    let a2p = (1.0 + g) * lab2.a;
    let c1p = a1p.hypot(lab1.b);
    let c2p = a2p.hypot(lab2.b);

    let hue = |b: f64, ap: f64| {
        if b == 0.0 && ap == 0.0 {
            0.0
        } else {
            let h = b.atan2(ap).to_degrees();
            if h < 0.0 {
                h + 360.0
            } else {
                h
            }
        }
    };
    let h1p = hue(lab1.b, a1p);
    let h2p = hue(lab2.b, a2p);

    let delta_lp = lab2.l - lab1.l;
    let delta_cp = c2p - c1p;
    let chroma_product = c1p * c2p;

    let delta_hp = if chroma_product == 0.0 {
        0.0
    } else {
        let d = h2p - h1p;
        if d > 180.0 {
            d - 360.0
        } else if d < -180.0 {
            d + 360.0
        } else {
            d
        }
    };
    let delta_big_hp = 2.0 * chroma_product.sqrt() * (delta_hp / 2.0).to_radians().sin();

    let l_bar = (lab1.l + lab2.l) / 2.0;
    let c_bar_p = (c1p + c2p) / 2.0;
    let h_bar_p = if chroma_product == 0.0 {
        h1p + h2p
    } else if (h1p - h2p).abs() <= 180.0 {
        (h1p + h2p) / 2.0
    } else if h1p + h2p < 360.0 {
        (h1p + h2p + 360.0) / 2.0
    } else {
        (h1p + h2p - 360.0) / 2.0
    };

    let t = 1.0 - 0.17 * (h_bar_p - 30.0).to_radians().cos()
        + 0.24 * (2.0 * h_bar_p).to_radians().cos()
        + 0.32 * (3.0 * h_bar_p + 6.0).to_radians().cos()
        - 0.20 * (4.0 * h_bar_p - 63.0).to_radians().cos();

    let delta_theta = 30.0 * (-((h_bar_p - 275.0) / 25.0).powi(2)).exp();
    let c_bar_p7 = c_bar_p.powi(7);
    let r_c = 2.0 * (c_bar_p7 / (c_bar_p7 + POW25_7)).sqrt();
    let l_offset = (l_bar - 50.0).powi(2);
    let s_l = 1.0 + 0.015 * l_offset / (20.0 + l_offset).sqrt();
    let s_c = 1.0 + 0.045 * c_bar_p;
    let s_h = 1.0 + 0.015 * c_bar_p * t;
    let r_t = -(2.0 * delta_theta).to_radians().sin() * r_c;

    let dl = delta_lp / s_l;
    let dc = delta_cp / s_c;
    let dh = delta_big_hp / s_h;

    (dl * dl + dc * dc + dh * dh + r_t * dc * dh).sqrt()
}

pub fn decode_png(data: &[u8]) -> Result<RgbaImage, DiffError> {
    Ok(image::load_from_memory(data)?.to_rgba8())
}

/// PNG with maximum compression
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, DiffError> {
    let mut buffer = Vec::new();
    PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, FilterType::Adaptive)
        .write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgba8)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    fn solid(width: u32, height: u32, color: Rgba<u8>) -> RgbaImage {
        RgbaImage::from_pixel(width, height, color)
    }

    fn engine() -> DiffEngine {
        DiffEngine::new(DiffOptions::default())
    }

    fn engine_with(configure: impl FnOnce(&mut DiffOptions)) -> DiffEngine {
        let mut options = DiffOptions::default();
        configure(&mut options);
        DiffEngine::new(options)
    }

    #[test]
    fn test_ciede2000_reference_pair() {
        let a = Lab { l: 50.0, a: 2.6772, b: -79.7751 };
        let b = Lab { l: 50.0, a: 0.0, b: -82.7485 };
        assert!((ciede2000(a, b) - 2.0425).abs() < 1e-4);
        assert_eq!(ciede2000(a, a), 0.0);
    }

    #[test]
    fn test_lab_of_white_and_black() {
        let white = to_lab(&WHITE);
        assert!((white.l - 100.0).abs() < 0.01);
        assert!(white.a.abs() < 0.01 && white.b.abs() < 0.01);
        assert!(to_lab(&BLACK).l.abs() < 0.01);
    }

    #[test]
    fn test_identical_images_are_equal() {
        let image = solid(20, 10, Rgba([10, 120, 200, 255]));
        let encoded = encode_png(&image).unwrap();

        let result = engine().compare_images(&encoded, &encoded).unwrap();
        assert!(result.equal);
        assert_eq!(result.differing_pixels, 0);

        let diff = engine().create_diff(&encoded, &encoded).unwrap();
        assert_eq!(diff, image);
    }

    #[test]
    fn test_small_color_shift_within_tolerance() {
        let a = solid(8, 8, Rgba([100, 100, 100, 255]));
        let b = solid(8, 8, Rgba([101, 100, 100, 255]));

        assert!(engine().mask(&a, &b).is_equal());
        assert!(!engine_with(|o| o.strict = true).mask(&a, &b).is_equal());
    }

    #[test]
    fn test_block_difference_is_highlighted() {
        let a = solid(10, 10, WHITE);
        let mut b = a.clone();
        for x in 2..5 {
            for y in 3..6 {
                b.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }

        let engine = engine();
        let mask = engine.mask(&a, &b);
        let result = mask.result();
        assert!(!result.equal);
        assert_eq!(result.differing_pixels, 9);
        assert_eq!(result.bounds, Some((2, 3, 3, 3)));

        let diff = mask.render(&a, engine.options().highlight_color.to_rgba());
        assert_eq!(*diff.get_pixel(3, 4), Rgba([255, 0, 255, 255]));
        assert_eq!(*diff.get_pixel(0, 0), WHITE);
    }

    #[test]
    fn test_equal_iff_diff_has_no_highlight() {
        let a = solid(6, 6, WHITE);
        let mut b = a.clone();
        b.put_pixel(1, 1, BLACK);
        b.put_pixel(4, 4, BLACK);

        let engine = engine();
        for candidate in [&a, &b] {
            let mask = engine.mask(&a, candidate);
            let diff = mask.render(&a, engine.options().highlight_color.to_rgba());
            let highlighted = diff.pixels().any(|p| *p == Rgba([255, 0, 255, 255]));
            assert_eq!(mask.is_equal(), !highlighted);
        }
    }

    #[test]
    fn test_different_sizes_are_never_equal() {
        let a = solid(10, 10, WHITE);
        let b = solid(10, 14, WHITE);

        let mask = engine().mask(&a, &b);
        assert!(!mask.is_equal());
        assert_eq!((mask.width(), mask.height()), (10, 14));
        assert!(!mask.is_different(5, 9));
        assert!(mask.is_different(5, 12));
        assert_eq!(mask.result().differing_pixels, 40);

        let diff = engine()
            .create_diff(&encode_png(&a).unwrap(), &encode_png(&b).unwrap())
            .unwrap();
        assert_eq!(diff.dimensions(), (10, 14));
        assert_eq!(*diff.get_pixel(0, 13), Rgba([255, 0, 255, 255]));
    }

    #[test]
    fn test_caret_is_ignored() {
        let a = solid(10, 10, WHITE);
        let mut b = a.clone();
        for y in 2..7 {
            b.put_pixel(5, y, BLACK);
        }

        assert!(engine().mask(&a, &b).is_equal());
        assert!(!engine_with(|o| o.ignore_caret = false).mask(&a, &b).is_equal());

        let mut wide = b.clone();
        for y in 2..7 {
            wide.put_pixel(6, y, BLACK);
        }
        assert!(!engine().mask(&a, &wide).is_equal());
    }

    #[test]
    fn test_broken_caret_is_a_difference() {
        let a = solid(10, 10, WHITE);
        let mut b = a.clone();
        b.put_pixel(5, 1, BLACK);
        b.put_pixel(5, 7, BLACK);

        assert!(!engine().mask(&a, &b).is_equal());
    }

    #[test]
    fn test_antialiased_edge_is_ignored() {
        // black left half, white right half
        let a = RgbaImage::from_fn(10, 10, |x, _| if x < 5 { BLACK } else { WHITE });
        let mut b = a.clone();
        b.put_pixel(5, 5, Rgba([128, 128, 128, 255]));

        let forgiving = engine_with(|o| o.ignore_caret = false);
        assert!(forgiving.mask(&a, &b).is_equal());

        let exact = engine_with(|o| {
            o.ignore_caret = false;
            o.ignore_antialiasing = false;
        });
        assert_eq!(exact.mask(&a, &b).result().differing_pixels, 1);
    }

    #[test]
    fn test_encode_png_round_trips_pixels() {
        let image = RgbaImage::from_fn(4, 3, |x, y| Rgba([x as u8 * 40, y as u8 * 60, 7, 200]));
        let decoded = decode_png(&encode_png(&image).unwrap()).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn test_invalid_png_is_an_error() {
        assert!(matches!(
            engine().compare_images(b"not a png", b"also not"),
            Err(DiffError::Image(_))
        ));
    }
}
