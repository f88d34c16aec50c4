//! Region merger.
//!
//! A batch of damage rectangles can go out as-is, as one merged
//! rectangle, or as a single full-window update. The decision is a
//! byte-cost estimate: every packet pays a fixed overhead on top of
//! its pixels, so many small rectangles can cost more than one big
//! one.

use std::collections::HashSet;

use tracing::debug;

use crate::encoding::Encoding;
use crate::geometry::{merge_all, total_pixels, Rectangle};

/// Windows at or below this area always send full frames.
pub const MIN_WINDOW_AREA: u64 = 1024;

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Try to coalesce rectangles at all.
    pub merge_regions: bool,
    /// More rectangles than this collapse to a full-window update.
    pub max_small_regions: usize,
    /// Fixed per-packet overhead, in pixel-equivalent units.
    pub small_packet_cost: u64,
    /// Full-window promotion threshold, as a percentage of the
    /// window area.
    pub max_bytes_percent: u64,
    /// Client can only handle whole frames.
    pub full_frames_only: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_regions: true,
            max_small_regions: 40,
            small_packet_cost: 1024,
            max_bytes_percent: 60,
            full_frames_only: false,
        }
    }
}

/// One rectangle ready for the encode queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSend {
    pub rect: Rectangle,
    pub encoding: Encoding,
    /// How many more packets of this batch follow. The last one
    /// carries zero so the client repaints exactly once per batch.
    pub flush: usize,
}

/// Turn a batch of damage rectangles into an ordered send plan.
///
/// `get_encoding` resolves the encoding for a given size; it may be
/// called once per surviving rectangle plus once for a full-window
/// promotion.
pub fn plan_regions(
    cfg: &MergeConfig,
    ww: u32,
    wh: u32,
    rects: &[Rectangle],
    exclude: Option<Rectangle>,
    mmap_active: bool,
    mut get_encoding: impl FnMut(u32, u32) -> Encoding,
) -> Vec<PlannedSend> {
    let window_area = ww as u64 * wh as u64;
    let full = Rectangle::new(0, 0, ww as i32, wh as i32);

    let mut regions: Vec<Rectangle> = match exclude {
        None => {
            if cfg.full_frames_only {
                debug!("full window update: full-frames-only set");
                return full_plan(full, &mut get_encoding);
            }
            if rects.len() > cfg.max_small_regions {
                debug!(count = rects.len(), "full window update: too many regions");
                return full_plan(full, &mut get_encoding);
            }
            if window_area <= MIN_WINDOW_AREA {
                debug!(ww, wh, "full window update: small window");
                return full_plan(full, &mut get_encoding);
            }
            dedup(rects.iter().copied())
        }
        Some(ex) => dedup(rects.iter().flat_map(|r| r.subtract(&ex))),
    };

    if cfg.merge_regions && regions.len() > 1 {
        let merge_threshold = window_area * cfg.max_bytes_percent / 100;
        let pixel_count = total_pixels(&regions);
        let packet_cost = pixel_count + cfg.small_packet_cost * regions.len() as u64;
        debug!(packet_cost, merge_threshold, pixel_count, "merge cost");
        if packet_cost >= merge_threshold {
            match exclude {
                None => {
                    debug!(packet_cost, "full window update: packet cost too high");
                    return full_plan(full, &mut get_encoding);
                }
                // cheaper to re-derive from the window itself
                Some(ex) => regions = full.subtract(&ex),
            }
        } else if let Some(merged) = merge_all(&regions) {
            let (merged_rects, merged_pixels) = match exclude {
                Some(ex) => {
                    let v = merged.subtract(&ex);
                    let p = total_pixels(&v);
                    (v, p)
                }
                None => (vec![merged], merged.pixel_count()),
            };
            let merged_cost = merged_pixels + cfg.small_packet_cost * merged_rects.len() as u64;
            if mmap_active || merged_cost < packet_cost || merged_pixels < pixel_count {
                debug!(merged_cost, packet_cost, "replacing batch with merged region");
                regions = merged_rects;
            }
        }
    }

    if regions.is_empty() {
        // everything fell inside the excluded area
        return Vec::new();
    }
    if let [merged] = regions[..] {
        // the pipeline mask can round dimensions down by a pixel;
        // treat near-full coverage as the whole window
        if merged.x <= 1
            && merged.y <= 1
            && (ww as i32 - merged.w).abs() < 2
            && (wh as i32 - merged.h).abs() < 2
        {
            debug!(?merged, "full window update: region covers almost the whole window");
            return full_plan(full, &mut get_encoding);
        }
    }

    let mut planned = Vec::with_capacity(regions.len());
    for rect in &regions {
        let encoding = get_encoding(rect.w as u32, rect.h as u32);
        if cfg.full_frames_only || encoding.requires_full_frame() {
            // a full-frame send covers the remaining regions too
            debug!(%encoding, "full window update: encoding requires whole frames");
            return vec![PlannedSend {
                rect: full,
                encoding,
                flush: 0,
            }];
        }
        planned.push((*rect, encoding));
    }

    // reversed so the first planned rectangle goes out last, with
    // flush=0 triggering the client repaint
    planned
        .into_iter()
        .enumerate()
        .rev()
        .map(|(i, (rect, encoding))| PlannedSend {
            rect,
            encoding,
            flush: i,
        })
        .collect()
}

fn full_plan(
    full: Rectangle,
    get_encoding: &mut impl FnMut(u32, u32) -> Encoding,
) -> Vec<PlannedSend> {
    vec![PlannedSend {
        rect: full,
        encoding: get_encoding(full.w as u32, full.h as u32),
        flush: 0,
    }]
}

fn dedup(rects: impl Iterator<Item = Rectangle>) -> Vec<Rectangle> {
    let mut seen = HashSet::new();
    rects.filter(|r| !r.is_empty() && seen.insert(*r)).collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb(_w: u32, _h: u32) -> Encoding {
        Encoding::Rgb24
    }

    #[test]
    fn overlapping_rects_merge_into_one_packet() {
        // two 50x50 rects overlapping at (25,25): separate cost
        // 5000 + 2048 > merged cost 5625 + 1024
        let cfg = MergeConfig::default();
        let rects = [Rectangle::new(0, 0, 50, 50), Rectangle::new(25, 25, 50, 50)];
        let plan = plan_regions(&cfg, 800, 600, &rects, None, false, rgb);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rectangle::new(0, 0, 75, 75));
        assert_eq!(plan[0].flush, 0);
    }

    #[test]
    fn distant_rects_stay_separate() {
        // merging would cover 800x600 worth of pixels for two tiny
        // corners, so the plan keeps them apart
        let cfg = MergeConfig::default();
        let rects = [
            Rectangle::new(0, 0, 10, 10),
            Rectangle::new(790, 590, 10, 10),
        ];
        let plan = plan_regions(&cfg, 800, 600, &rects, None, false, rgb);
        assert_eq!(plan.len(), 2);
        // reversed enqueue order: last packet has flush 0
        assert_eq!(plan[0].flush, 1);
        assert_eq!(plan[1].flush, 0);
        assert_eq!(plan[1].rect, rects[0]);
    }

    #[test]
    fn high_cost_promotes_to_full_window() {
        let cfg = MergeConfig::default();
        // 40 rects of 100x100 over a 400x300 window: cost way past 60%
        let rects: Vec<Rectangle> = (0..12)
            .map(|i| Rectangle::new((i % 4) * 100, (i / 4) * 100, 100, 100))
            .collect();
        let plan = plan_regions(&cfg, 400, 300, &rects, None, false, rgb);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rectangle::new(0, 0, 400, 300));
    }

    #[test]
    fn too_many_regions_promotes_to_full_window() {
        let cfg = MergeConfig::default();
        let rects: Vec<Rectangle> = (0..41)
            .map(|i| Rectangle::new(i * 10, 0, 5, 5))
            .collect();
        let plan = plan_regions(&cfg, 1920, 1080, &rects, None, false, rgb);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rectangle::new(0, 0, 1920, 1080));
    }

    #[test]
    fn tiny_window_always_full_frame() {
        let cfg = MergeConfig::default();
        let rects = [Rectangle::new(0, 0, 4, 4)];
        let plan = plan_regions(&cfg, 32, 32, &rects, None, false, rgb);
        assert_eq!(plan, vec![PlannedSend {
            rect: Rectangle::new(0, 0, 32, 32),
            encoding: Encoding::Rgb24,
            flush: 0,
        }]);
    }

    #[test]
    fn near_full_single_rect_promotes() {
        let cfg = MergeConfig::default();
        // masked dimensions one pixel short of the window
        let rects = [Rectangle::new(0, 0, 639, 479)];
        let plan = plan_regions(&cfg, 640, 480, &rects, None, false, rgb);
        assert_eq!(plan[0].rect, Rectangle::new(0, 0, 640, 480));
    }

    #[test]
    fn exclude_region_is_subtracted() {
        let cfg = MergeConfig::default();
        let rects = [Rectangle::new(0, 0, 100, 100)];
        let exclude = Rectangle::new(0, 0, 100, 50);
        let plan = plan_regions(&cfg, 800, 600, &rects, Some(exclude), false, rgb);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rectangle::new(0, 50, 100, 50));
    }

    #[test]
    fn rect_inside_exclude_yields_nothing() {
        let cfg = MergeConfig::default();
        let rects = [Rectangle::new(10, 10, 20, 20)];
        let exclude = Rectangle::new(0, 0, 100, 100);
        let plan = plan_regions(&cfg, 800, 600, &rects, Some(exclude), false, rgb);
        assert!(plan.is_empty());
    }

    #[test]
    fn full_frame_encoding_escalates_batch() {
        let cfg = MergeConfig::default();
        let rects = [
            Rectangle::new(0, 0, 64, 64),
            Rectangle::new(200, 200, 64, 64),
        ];
        let plan = plan_regions(&cfg, 800, 600, &rects, None, false, |_, _| Encoding::H264);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rectangle::new(0, 0, 800, 600));
        assert_eq!(plan[0].encoding, Encoding::H264);
    }

    #[test]
    fn duplicate_rects_collapse() {
        let cfg = MergeConfig::default();
        let r = Rectangle::new(5, 5, 30, 30);
        let plan = plan_regions(&cfg, 800, 600, &[r, r, r], None, false, rgb);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, r);
    }

    #[test]
    fn mmap_prefers_merged_even_when_costlier() {
        let cfg = MergeConfig::default();
        let rects = [
            Rectangle::new(0, 0, 10, 10),
            Rectangle::new(100, 100, 10, 10),
        ];
        let plan = plan_regions(&cfg, 800, 600, &rects, None, true, rgb);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rectangle::new(0, 0, 110, 110));
    }
}
