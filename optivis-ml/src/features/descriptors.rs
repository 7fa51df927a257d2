//! Built-in local descriptors.
//!
//! Descriptor names are `<descriptor>`, `<space>-<descriptor>` or a bare
//! colour space (its intensity histogram). Multi-channel spaces compute the
//! descriptor per channel and concatenate the results.

use super::plane::{ColorSpace, Plane, blurred, gradients, planes};
use super::sampling::KeyPoint;
use crate::error::MlError;
use image::DynamicImage;
use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

const HISTOGRAM_BINS: usize = 16;
const SIFT_CELLS: usize = 4;
const SIFT_BINS: usize = 8;
const HOG_CELLS: usize = 3;
const HOG_BINS: usize = 9;
const KAZE_CELLS: usize = 4;
const KAZE_SIGMA: f32 = 1.0;
const LBP_BINS: usize = 10;

/// Descriptor algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// 4x4 cells of 8-bin signed gradient orientation histograms.
    Sift,
    /// 4x4 cells of `(sum dx, sum dy, sum |dx|, sum |dy|)` on a smoothed plane.
    Kaze,
    /// 3x3 cells of 9-bin unsigned gradient orientation histograms.
    Hog,
    /// Rotation-invariant uniform local binary pattern histogram.
    Lbp,
    /// Intensity histogram.
    Histogram,
}

impl DescriptorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sift => "sift",
            Self::Kaze => "kaze",
            Self::Hog => "hog",
            Self::Lbp => "lbp",
            Self::Histogram => "hist",
        }
    }

    /// Length of the descriptor on a single plane.
    pub fn dims(&self) -> usize {
        match self {
            Self::Sift => SIFT_CELLS * SIFT_CELLS * SIFT_BINS,
            Self::Kaze => KAZE_CELLS * KAZE_CELLS * 4,
            Self::Hog => HOG_CELLS * HOG_CELLS * HOG_BINS,
            Self::Lbp => LBP_BINS,
            Self::Histogram => HISTOGRAM_BINS,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sift" => Some(Self::Sift),
            "kaze" => Some(Self::Kaze),
            "hog" => Some(Self::Hog),
            "lbp" => Some(Self::Lbp),
            "hist" => Some(Self::Histogram),
            _ => None,
        }
    }
}

fn parse_space(s: &str) -> Option<ColorSpace> {
    match s {
        "gray" => Some(ColorSpace::Gray),
        "hsv" => Some(ColorSpace::Hsv),
        "rgb" => Some(ColorSpace::Rgb),
        _ => None,
    }
}

/// A descriptor in a colour space, e.g. `hsv-sift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSpec {
    pub space: ColorSpace,
    pub kind: DescriptorKind,
}

impl DescriptorSpec {
    /// Columns produced per key point.
    pub fn dims(&self) -> usize {
        let channels = match self.space {
            ColorSpace::Gray => 1,
            ColorSpace::Hsv | ColorSpace::Rgb => 3,
        };
        channels * self.kind.dims()
    }
}

impl FromStr for DescriptorSpec {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || MlError::UnknownDescriptor(s.to_string());
        if let Some(space) = parse_space(s) {
            return Ok(Self {
                space,
                kind: DescriptorKind::Histogram,
            });
        }
        if let Some(kind) = DescriptorKind::parse(s) {
            return Ok(Self {
                space: ColorSpace::Gray,
                kind,
            });
        }
        let (space, kind) = s.split_once('-').ok_or_else(unknown)?;
        Ok(Self {
            space: parse_space(space).ok_or_else(unknown)?,
            kind: DescriptorKind::parse(kind).ok_or_else(unknown)?,
        })
    }
}

impl fmt::Display for DescriptorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.space.name(), self.kind.name())
    }
}

/// External descriptor capability: encode the regions around key points.
pub trait DescriptorCapability: Send + Sync {
    fn name(&self) -> String;

    /// One row per key point, or `None` when nothing can be described.
    fn compute(&self, image: &DynamicImage, keypoints: &[KeyPoint]) -> Option<Vec<Vec<f64>>>;
}

struct PlaneContext {
    plane: Plane,
    dx: Plane,
    dy: Plane,
}

impl PlaneContext {
    fn new(plane: Plane, kind: DescriptorKind) -> Self {
        let source = if kind == DescriptorKind::Kaze {
            blurred(&plane, KAZE_SIGMA)
        } else {
            plane.clone()
        };
        let (dx, dy) = gradients(&source);
        Self { plane, dx, dy }
    }
}

impl DescriptorCapability for DescriptorSpec {
    fn name(&self) -> String {
        self.to_string()
    }

    fn compute(&self, image: &DynamicImage, keypoints: &[KeyPoint]) -> Option<Vec<Vec<f64>>> {
        if keypoints.is_empty() {
            return None;
        }
        let contexts: Vec<PlaneContext> = planes(image, self.space)
            .into_iter()
            .map(|p| PlaneContext::new(p, self.kind))
            .collect();
        let (w, h) = (image.width(), image.height());

        let rows: Vec<Vec<f64>> = keypoints
            .iter()
            .map(|kp| {
                let window = kp.window(w, h);
                let mut row = Vec::with_capacity(self.dims());
                for ctx in &contexts {
                    row.extend(describe(self.kind, ctx, window));
                }
                row
            })
            .collect();
        Some(rows)
    }
}

type Window = (u32, u32, u32, u32);

fn describe(kind: DescriptorKind, ctx: &PlaneContext, window: Window) -> Vec<f64> {
    match kind {
        DescriptorKind::Histogram => intensity_histogram(&ctx.plane, window),
        DescriptorKind::Sift => orientation_cells(ctx, window, SIFT_CELLS, SIFT_BINS, true),
        DescriptorKind::Hog => orientation_cells(ctx, window, HOG_CELLS, HOG_BINS, false),
        DescriptorKind::Kaze => derivative_cells(ctx, window),
        DescriptorKind::Lbp => lbp_histogram(&ctx.plane, window),
    }
}

fn cell_of(v: u32, v0: u32, v1: u32, cells: usize) -> usize {
    let span = (v1 - v0).max(1) as usize;
    (((v - v0) as usize) * cells / span).min(cells - 1)
}

fn intensity_histogram(plane: &Plane, (x0, y0, x1, y1): Window) -> Vec<f64> {
    let mut hist = vec![0.0; HISTOGRAM_BINS];
    let mut count = 0.0;
    for y in y0..y1 {
        for x in x0..x1 {
            let v = plane.get_pixel(x, y)[0].clamp(0.0, 1.0);
            let bin = ((v * HISTOGRAM_BINS as f32) as usize).min(HISTOGRAM_BINS - 1);
            hist[bin] += 1.0;
            count += 1.0;
        }
    }
    if count > 0.0 {
        hist.iter_mut().for_each(|b| *b /= count);
    }
    hist
}

fn orientation_cells(
    ctx: &PlaneContext,
    (x0, y0, x1, y1): Window,
    cells: usize,
    bins: usize,
    signed: bool,
) -> Vec<f64> {
    let mut out = vec![0.0; cells * cells * bins];
    let range = if signed { 2.0 * PI } else { PI };
    for y in y0..y1 {
        for x in x0..x1 {
            let gx = ctx.dx.get_pixel(x, y)[0];
            let gy = ctx.dy.get_pixel(x, y)[0];
            let magnitude = (gx * gx + gy * gy).sqrt();
            if magnitude == 0.0 {
                continue;
            }
            let angle = gy.atan2(gx).rem_euclid(range);
            let bin = ((angle / range * bins as f32) as usize).min(bins - 1);
            let cx = cell_of(x, x0, x1, cells);
            let cy = cell_of(y, y0, y1, cells);
            out[(cy * cells + cx) * bins + bin] += magnitude as f64;
        }
    }
    out
}

fn derivative_cells(ctx: &PlaneContext, (x0, y0, x1, y1): Window) -> Vec<f64> {
    let mut out = vec![0.0; KAZE_CELLS * KAZE_CELLS * 4];
    for y in y0..y1 {
        for x in x0..x1 {
            let gx = ctx.dx.get_pixel(x, y)[0] as f64;
            let gy = ctx.dy.get_pixel(x, y)[0] as f64;
            let cell = cell_of(y, y0, y1, KAZE_CELLS) * KAZE_CELLS + cell_of(x, x0, x1, KAZE_CELLS);
            let slot = &mut out[cell * 4..cell * 4 + 4];
            slot[0] += gx;
            slot[1] += gy;
            slot[2] += gx.abs();
            slot[3] += gy.abs();
        }
    }
    out
}

fn lbp_histogram(plane: &Plane, (x0, y0, x1, y1): Window) -> Vec<f64> {
    const NEIGHBOURS: [(i32, i32); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];
    let (w, h) = plane.dimensions();
    let mut hist = vec![0.0; LBP_BINS];
    let mut count = 0.0;
    for y in y0.max(1)..y1.min(h.saturating_sub(1)) {
        for x in x0.max(1)..x1.min(w.saturating_sub(1)) {
            let centre = plane.get_pixel(x, y)[0];
            let bits: Vec<bool> = NEIGHBOURS
                .iter()
                .map(|(dx, dy)| {
                    let v = plane.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0];
                    v >= centre
                })
                .collect();
            let transitions = (0..8).filter(|&i| bits[i] != bits[(i + 1) % 8]).count();
            let bin = if transitions <= 2 {
                bits.iter().filter(|b| **b).count()
            } else {
                LBP_BINS - 1
            };
            hist[bin] += 1.0;
            count += 1.0;
        }
    }
    if count > 0.0 {
        hist.iter_mut().for_each(|b| *b /= count);
    }
    hist
}
