//! Text region detection
//!
//! Finds the part of a capture most likely to hold text. Maximally stable
//! extremal regions are collected for both polarities (dark text on light and
//! light text on dark), their boxes are merged into one padded rectangle. If
//! no region qualifies, a contour-based detector on the Otsu-binarized image
//! is tried. Both paths are deterministic.

use crate::capture::{CaptureRegion, RawImage};
use crate::config::DetectionSettings;
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::morphology::close;
use tracing::debug;

/// Axis-aligned box in pixel coordinates, inclusive bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl BoundingBox {
    fn point(x: u32, y: u32) -> Self {
        Self { min_x: x, min_y: y, max_x: x, max_y: y }
    }

    fn merge(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn to_region(&self) -> CaptureRegion {
        CaptureRegion::new(self.min_x as i32, self.min_y as i32, self.width(), self.height())
    }
}

/// Finds text areas inside a captured image
#[derive(Debug, Clone)]
pub struct RegionDetector {
    settings: DetectionSettings,
}

impl RegionDetector {
    pub fn new(settings: DetectionSettings) -> Self {
        Self { settings }
    }

    /// Text rectangle relative to the image, or `None` when inconclusive
    pub fn detect(&self, image: &RawImage) -> Option<CaptureRegion> {
        let gray = image.to_gray()?;
        if gray.width() == 0 || gray.height() == 0 {
            return None;
        }
        let bounds = CaptureRegion::new(0, 0, gray.width(), gray.height());

        let boxes = self.mser_boxes(&gray);
        if let Some(union) = boxes.iter().copied().reduce(|a, b| a.merge(&b)) {
            debug!("MSER found {} regions", boxes.len());
            let region = union.to_region().padded(self.settings.margin).clamp_to(&bounds);
            return Some(region);
        }

        debug!("MSER found nothing usable, trying contours");
        let contour = self.largest_contour(&gray)?;
        Some(contour.to_region().padded(self.settings.contour_margin).clamp_to(&bounds))
    }

    /// Stable regions of both polarities, noise-sized boxes removed
    pub fn mser_boxes(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let params = MserParams::from_settings(&self.settings, gray.width(), gray.height());

        let mut boxes = mser(gray, &params);
        let mut inverted = gray.clone();
        for p in inverted.pixels_mut() {
            p[0] = 255 - p[0];
        }
        boxes.extend(mser(&inverted, &params));

        boxes.retain(|b| b.area() >= self.settings.min_area as u64);
        boxes
    }

    /// Bounding box of the largest outer contour on the binarized image,
    /// if it is big enough to be a line of text
    fn largest_contour(&self, gray: &GrayImage) -> Option<BoundingBox> {
        let level = otsu_level(gray);

        // Foreground (255) = dark pixels
        let mut binary = gray.clone();
        let mut foreground = 0u64;
        for p in binary.pixels_mut() {
            if p[0] <= level {
                p[0] = 255;
                foreground += 1;
            } else {
                p[0] = 0;
            }
        }

        // Glyphs are the minority; flip when the "foreground" is the background
        let total = gray.width() as u64 * gray.height() as u64;
        if foreground * 2 > total {
            for p in binary.pixels_mut() {
                p[0] = 255 - p[0];
            }
        }

        let closed = close(&binary, Norm::LInf, 1);

        let best = find_contours::<u32>(&closed)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .filter_map(|c| {
                let mut points = c.points.iter();
                let first = points.next()?;
                Some(points.fold(BoundingBox::point(first.x, first.y), |acc, p| {
                    acc.merge(&BoundingBox::point(p.x, p.y))
                }))
            })
            .max_by_key(|b| b.area())?;

        if best.width() > self.settings.contour_min_width
            && best.height() > self.settings.contour_min_height
        {
            Some(best)
        } else {
            debug!("Largest contour {}x{} too small", best.width(), best.height());
            None
        }
    }
}

/// MSER thresholds resolved for one image size
#[derive(Debug, Clone, Copy)]
struct MserParams {
    delta: u8,
    max_variation: f32,
    min_area: u32,
    max_area: u32,
}

impl MserParams {
    fn from_settings(s: &DetectionSettings, width: u32, height: u32) -> Self {
        let total = width as f64 * height as f64;
        Self {
            delta: s.delta.max(1),
            max_variation: s.max_variation,
            min_area: s.min_area.max(1),
            max_area: (total * s.max_area_ratio.clamp(0.0, 1.0) as f64) as u32,
        }
    }
}

/// One extremal region of the component tree
struct Component {
    /// Level at which the region first appeared
    created: u8,
    area: u32,
    bbox: BoundingBox,
    /// (level, area, bbox) at the end of every level the region changed
    history: Vec<(u8, u32, BoundingBox)>,
    /// Level at which the region was absorbed, and by whom
    merged: Option<(u8, usize)>,
    /// Last level this component was modified, to record history once
    touched: Option<u8>,
}

struct ComponentTree {
    parent: Vec<usize>,
    /// Component index for a union-find root pixel
    component: Vec<usize>,
    components: Vec<Component>,
}

impl ComponentTree {
    fn find(&mut self, mut p: usize) -> usize {
        while self.parent[p] != p {
            self.parent[p] = self.parent[self.parent[p]];
            p = self.parent[p];
        }
        p
    }

    /// Area of the region containing `node` at `level`, following merges
    fn area_at(&self, mut node: usize, level: u8) -> u32 {
        loop {
            let c = &self.components[node];
            if let Some((merged_at, into)) = c.merged {
                if level >= merged_at {
                    node = into;
                    continue;
                }
            }
            return c
                .history
                .iter()
                .rev()
                .find(|(l, _, _)| *l <= level)
                .map(|(_, a, _)| *a)
                .unwrap_or(0);
        }
    }
}

/// Dark extremal regions (pixels at or below a level) that stay stable over
/// `2 * delta` levels. Returns one box per region, at its most stable level.
fn mser(gray: &GrayImage, params: &MserParams) -> Vec<BoundingBox> {
    let (width, height) = gray.dimensions();
    let w = width as usize;
    let n = w * height as usize;
    if n == 0 {
        return Vec::new();
    }
    let pixels = gray.as_raw();

    // Counting sort by intensity
    let mut counts = [0usize; 257];
    for &v in pixels {
        counts[v as usize + 1] += 1;
    }
    for i in 1..257 {
        counts[i] += counts[i - 1];
    }
    let mut order = vec![0usize; n];
    let mut next = counts;
    for (i, &v) in pixels.iter().enumerate() {
        order[next[v as usize]] = i;
        next[v as usize] += 1;
    }

    let mut tree = ComponentTree {
        parent: (0..n).collect(),
        component: vec![usize::MAX; n],
        components: Vec::new(),
    };
    let mut processed = vec![false; n];
    let mut touched_now: Vec<usize> = Vec::new();

    for level in 0..=255u8 {
        let start = counts[level as usize];
        let end = counts[level as usize + 1];

        for &p in &order[start..end] {
            processed[p] = true;
            let x = (p % w) as u32;
            let y = (p / w) as u32;

            let idx = tree.components.len();
            tree.components.push(Component {
                created: level,
                area: 1,
                bbox: BoundingBox::point(x, y),
                history: Vec::new(),
                merged: None,
                touched: None,
            });
            tree.component[p] = idx;
            mark(&mut tree.components[idx], idx, level, &mut touched_now);

            let mut neighbors = [usize::MAX; 4];
            if x > 0 {
                neighbors[0] = p - 1;
            }
            if x + 1 < width {
                neighbors[1] = p + 1;
            }
            if y > 0 {
                neighbors[2] = p - w;
            }
            if y + 1 < height {
                neighbors[3] = p + w;
            }

            for q in neighbors {
                if q == usize::MAX || !processed[q] {
                    continue;
                }
                let rp = tree.find(p);
                let rq = tree.find(q);
                if rp == rq {
                    continue;
                }

                let cp = tree.component[rp];
                let cq = tree.component[rq];
                // Larger region survives; ties keep the older one
                let (keep_root, keep, drop_root, drop) = {
                    let a = &tree.components[cp];
                    let b = &tree.components[cq];
                    if a.area > b.area || (a.area == b.area && a.created <= b.created) {
                        (rp, cp, rq, cq)
                    } else {
                        (rq, cq, rp, cp)
                    }
                };

                tree.parent[drop_root] = keep_root;
                let (drop_area, drop_bbox) = {
                    let d = &mut tree.components[drop];
                    d.merged = Some((level, keep));
                    (d.area, d.bbox)
                };
                let k = &mut tree.components[keep];
                k.area += drop_area;
                k.bbox = k.bbox.merge(&drop_bbox);
                mark(k, keep, level, &mut touched_now);
            }
        }

        for idx in touched_now.drain(..) {
            let c = &mut tree.components[idx];
            if c.merged.is_none() {
                c.history.push((level, c.area, c.bbox));
            }
        }
    }

    let mut boxes = Vec::new();
    for (idx, c) in tree.components.iter().enumerate() {
        let mut best: Option<(f32, BoundingBox)> = None;

        for &(level, area, bbox) in &c.history {
            if area < params.min_area || area > params.max_area {
                continue;
            }
            let upper = level.saturating_add(params.delta);
            let lower = level.saturating_sub(params.delta).max(c.created);

            let grown = tree.area_at(idx, upper);
            let base = tree.area_at(idx, lower);
            let variation = grown.saturating_sub(base) as f32 / area as f32;

            if variation <= params.max_variation
                && best.map_or(true, |(v, _)| variation < v)
            {
                best = Some((variation, bbox));
            }
        }

        if let Some((_, bbox)) = best {
            boxes.push(bbox);
        }
    }

    boxes
}

fn mark(c: &mut Component, idx: usize, level: u8, touched: &mut Vec<usize>) {
    if c.touched != Some(level) {
        c.touched = Some(level);
        touched.push(idx);
    }
}
