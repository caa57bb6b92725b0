//! Template matching - Zero-mean normalized cross-correlation on grayscale
//! frames
//!
//! Window sums come from integral images so each candidate position only
//! pays for the cross term. Large templates are first located on a
//! downscaled copy, then refined at full resolution around that spot.

use image::imageops::{self, FilterType};
use image::GrayImage;

/// Templates whose shorter side spans at least twice this are matched
/// coarse-to-fine
const COARSE_SIDE: u32 = 12;

/// Variance below this counts as a flat window
const FLAT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub x: u32,
    pub y: u32,
    /// Correlation in `[-1, 1]`; flat windows score 0
    pub score: f64,
}

/// Best position of `template` inside `frame`, or `None` when the template
/// is empty or does not fit
pub fn best_match(frame: &GrayImage, template: &GrayImage) -> Option<MatchResult> {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return None;
    }

    let full = SearchWindow {
        x0: 0,
        y0: 0,
        x1: fw - tw,
        y1: fh - th,
    };

    let scale = tw.min(th) / COARSE_SIDE;
    if scale < 2 {
        return Some(search(frame, template, full));
    }

    let small_frame = imageops::resize(frame, fw / scale, fh / scale, FilterType::Triangle);
    let small_template = imageops::resize(template, tw / scale, th / scale, FilterType::Triangle);
    let coarse = search(
        &small_frame,
        &small_template,
        SearchWindow {
            x0: 0,
            y0: 0,
            x1: small_frame.width() - small_template.width(),
            y1: small_frame.height() - small_template.height(),
        },
    );

    let margin = 2 * scale;
    let (cx, cy) = (coarse.x * scale, coarse.y * scale);
    let refine = SearchWindow {
        x0: cx.saturating_sub(margin).min(full.x1),
        y0: cy.saturating_sub(margin).min(full.y1),
        x1: (cx + margin).min(full.x1),
        y1: (cy + margin).min(full.y1),
    };
    Some(search(frame, template, refine))
}

/// Inclusive range of top-left positions to try
#[derive(Debug, Clone, Copy)]
struct SearchWindow {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

/// Summed-area tables of pixel values and their squares
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    squares: Vec<f64>,
}

impl Integral {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut squares = vec![0.0; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_squares = 0.0;
            for x in 0..w {
                let v = f64::from(raw[y * w + x]);
                row_sum += v;
                row_squares += v * v;
                let at = (y + 1) * stride + x + 1;
                sum[at] = sum[at - stride] + row_sum;
                squares[at] = squares[at - stride] + row_squares;
            }
        }

        Self { stride, sum, squares }
    }

    /// Sum and sum of squares of the `w`x`h` window at `(x, y)`
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let corners = |table: &[f64]| {
            table[(y + h) * s + x + w] - table[y * s + x + w] - table[(y + h) * s + x] + table[y * s + x]
        };
        (corners(&self.sum), corners(&self.squares))
    }
}

fn search(frame: &GrayImage, template: &GrayImage, window: SearchWindow) -> MatchResult {
    let fw = frame.width() as usize;
    let (tw, th) = (template.width() as usize, template.height() as usize);
    let n = (tw * th) as f64;

    let raw_template = template.as_raw();
    let mean = raw_template.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let centered: Vec<f64> = raw_template.iter().map(|&v| f64::from(v) - mean).collect();
    let template_energy: f64 = centered.iter().map(|v| v * v).sum();

    let integral = Integral::new(frame);
    let raw_frame = frame.as_raw();

    let mut best = MatchResult {
        x: window.x0,
        y: window.y0,
        score: f64::MIN,
    };

    for y in window.y0..=window.y1 {
        for x in window.x0..=window.x1 {
            let (xu, yu) = (x as usize, y as usize);
            let (sum, squares) = integral.window(xu, yu, tw, th);
            let variance = squares - sum * sum / n;

            let score = if variance <= FLAT_EPSILON || template_energy <= FLAT_EPSILON {
                0.0
            } else {
                let mut cross = 0.0;
                for j in 0..th {
                    let row = (yu + j) * fw + xu;
                    let pixels = &raw_frame[row..row + tw];
                    let weights = &centered[j * tw..(j + 1) * tw];
                    cross += pixels
                        .iter()
                        .zip(weights)
                        .map(|(&p, &w)| f64::from(p) * w)
                        .sum::<f64>();
                }
                cross / (variance * template_energy).sqrt()
            };

            if score > best.score {
                best = MatchResult { x, y, score };
            }
        }
    }

    best
}
