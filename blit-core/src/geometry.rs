//! Integer rectangle arithmetic for damage regions.
//!
//! Damage arrives as axis-aligned rectangles in window coordinates.
//! The batcher accumulates them, the merger unions or splits them, and
//! the refresh scheduler subtracts freshly repainted areas from its
//! pending set. All of that reduces to the handful of operations here:
//! containment, intersection, bounding union, and subtraction (which
//! yields up to four remainder strips).

// ── Rectangle ────────────────────────────────────────────────────

/// An axis-aligned rectangle: left edge, top edge, width, height.
///
/// Coordinates are signed because override-redirect windows can hang
/// partially off-screen; widths and heights are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rectangle {
    /// Create a rectangle, clamping negative dimensions to zero.
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            x,
            y,
            w: w.max(0),
            h: h.max(0),
        }
    }

    /// Right edge (exclusive).
    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    /// Bottom edge (exclusive).
    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    /// Area in pixels.
    pub fn pixel_count(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// True when the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// True when `other` lies entirely within this rectangle.
    pub fn contains(&self, other: &Rectangle) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    /// True when the two rectangles share at least one pixel.
    pub fn intersects(&self, other: &Rectangle) -> bool {
        self.intersection(other).is_some()
    }

    /// Overlapping area, if any.
    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        let ix = self.x.max(other.x);
        let iy = self.y.max(other.y);
        let iw = self.right().min(other.right()) - ix;
        let ih = self.bottom().min(other.bottom()) - iy;
        if iw <= 0 || ih <= 0 {
            None
        } else {
            Some(Rectangle::new(ix, iy, iw, ih))
        }
    }

    /// Smallest rectangle covering both inputs.
    pub fn union(&self, other: &Rectangle) -> Rectangle {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rectangle::new(x, y, right - x, bottom - y)
    }

    /// Remove `other` from this rectangle.
    ///
    /// Returns the uncovered remainder as zero to four strips: the full-
    /// width bands above and below the overlap, then the left and right
    /// slivers of the middle band. The pieces never overlap each other.
    pub fn subtract(&self, other: &Rectangle) -> Vec<Rectangle> {
        let overlap = match self.intersection(other) {
            Some(o) => o,
            None => return vec![*self],
        };
        if overlap == *self {
            return Vec::new();
        }

        let mut pieces = Vec::with_capacity(4);
        if overlap.y > self.y {
            pieces.push(Rectangle::new(self.x, self.y, self.w, overlap.y - self.y));
        }
        if overlap.bottom() < self.bottom() {
            pieces.push(Rectangle::new(
                self.x,
                overlap.bottom(),
                self.w,
                self.bottom() - overlap.bottom(),
            ));
        }
        if overlap.x > self.x {
            pieces.push(Rectangle::new(
                self.x,
                overlap.y,
                overlap.x - self.x,
                overlap.h,
            ));
        }
        if overlap.right() < self.right() {
            pieces.push(Rectangle::new(
                overlap.right(),
                overlap.y,
                self.right() - overlap.right(),
                overlap.h,
            ));
        }
        pieces
    }
}

// ── Region lists ─────────────────────────────────────────────────

/// Add `rect` to a non-overlapping region list, splitting it against
/// existing entries so the list stays non-overlapping.
///
/// Returns `false` when the rectangle was already fully covered.
pub fn add_rectangle(regions: &mut Vec<Rectangle>, rect: Rectangle) -> bool {
    if rect.is_empty() {
        return false;
    }
    for i in 0..regions.len() {
        let existing = regions[i];
        if existing.contains(&rect) {
            return false;
        }
        if existing.intersects(&rect) {
            let mut changed = false;
            for piece in rect.subtract(&existing) {
                changed |= add_rectangle(regions, piece);
            }
            return changed;
        }
    }
    regions.push(rect);
    true
}

/// Bounding union of every rectangle in the list.
pub fn merge_all(regions: &[Rectangle]) -> Option<Rectangle> {
    let mut iter = regions.iter().filter(|r| !r.is_empty());
    let first = *iter.next()?;
    Some(iter.fold(first, |acc, r| acc.union(r)))
}

/// Subtract `rect` from every rectangle in the list.
pub fn remove_rectangle(regions: &mut Vec<Rectangle>, rect: Rectangle) {
    let old = std::mem::take(regions);
    for r in old {
        regions.extend(r.subtract(&rect));
    }
}

/// Total pixel area of the list (entries assumed non-overlapping).
pub fn total_pixels(regions: &[Rectangle]) -> u64 {
    regions.iter().map(Rectangle::pixel_count).sum()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn r(x: i32, y: i32, w: i32, h: i32) -> Rectangle {
        Rectangle::new(x, y, w, h)
    }

    #[test]
    fn union_is_bounding_box() {
        assert_eq!(r(0, 0, 50, 50).union(&r(25, 25, 50, 50)), r(0, 0, 75, 75));
        assert_eq!(r(10, 10, 5, 5).union(&r(100, 0, 1, 1)), r(10, 0, 91, 15));
    }

    #[test]
    fn union_with_empty_keeps_other_side() {
        assert_eq!(r(5, 5, 10, 10).union(&r(0, 0, 0, 0)), r(5, 5, 10, 10));
        assert_eq!(r(0, 0, 0, 0).union(&r(5, 5, 10, 10)), r(5, 5, 10, 10));
    }

    #[test]
    fn intersection_of_disjoint_is_none() {
        assert!(r(0, 0, 10, 10).intersection(&r(10, 0, 10, 10)).is_none());
        assert!(r(0, 0, 10, 10).intersection(&r(0, 10, 10, 10)).is_none());
    }

    #[test]
    fn intersection_of_overlap() {
        assert_eq!(
            r(0, 0, 50, 50).intersection(&r(25, 25, 50, 50)),
            Some(r(25, 25, 25, 25))
        );
    }

    #[test]
    fn containment() {
        assert!(r(0, 0, 100, 100).contains(&r(10, 10, 20, 20)));
        assert!(r(0, 0, 100, 100).contains(&r(0, 0, 100, 100)));
        assert!(!r(0, 0, 100, 100).contains(&r(90, 90, 20, 20)));
    }

    #[test]
    fn subtract_hole_in_the_middle_gives_four_strips() {
        let pieces = r(0, 0, 100, 100).subtract(&r(25, 25, 50, 50));
        assert_eq!(pieces.len(), 4);
        assert_eq!(total_pixels(&pieces), 100 * 100 - 50 * 50);
        // The strips must not overlap each other.
        for (i, a) in pieces.iter().enumerate() {
            for b in pieces.iter().skip(i + 1) {
                assert!(!a.intersects(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn subtract_corner_gives_two_strips() {
        let pieces = r(0, 0, 100, 100).subtract(&r(50, 50, 100, 100));
        assert_eq!(pieces.len(), 2);
        assert_eq!(total_pixels(&pieces), 100 * 100 - 50 * 50);
    }

    #[test]
    fn subtract_disjoint_returns_self() {
        assert_eq!(r(0, 0, 10, 10).subtract(&r(50, 50, 10, 10)), vec![r(0, 0, 10, 10)]);
    }

    #[test]
    fn subtract_covering_returns_nothing() {
        assert!(r(10, 10, 5, 5).subtract(&r(0, 0, 100, 100)).is_empty());
    }

    #[test]
    fn add_rectangle_skips_covered() {
        let mut regions = vec![r(0, 0, 100, 100)];
        assert!(!add_rectangle(&mut regions, r(10, 10, 20, 20)));
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn add_rectangle_splits_overlap() {
        let mut regions = vec![r(0, 0, 50, 50)];
        assert!(add_rectangle(&mut regions, r(25, 25, 50, 50)));
        // List stays non-overlapping and covers exactly the union area.
        assert_eq!(total_pixels(&regions), 50 * 50 + 50 * 50 - 25 * 25);
        for (i, a) in regions.iter().enumerate() {
            for b in regions.iter().skip(i + 1) {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn add_rectangle_twice_is_idempotent() {
        let mut regions = Vec::new();
        assert!(add_rectangle(&mut regions, r(0, 0, 50, 50)));
        let snapshot = regions.clone();
        assert!(!add_rectangle(&mut regions, r(0, 0, 50, 50)));
        assert_eq!(regions, snapshot);
    }

    #[test]
    fn merge_all_bounding_box() {
        let regions = vec![r(0, 0, 10, 10), r(90, 90, 10, 10)];
        assert_eq!(merge_all(&regions), Some(r(0, 0, 100, 100)));
        assert_eq!(merge_all(&[]), None);
    }

    #[test]
    fn remove_rectangle_punches_hole() {
        let mut regions = vec![r(0, 0, 100, 100)];
        remove_rectangle(&mut regions, r(25, 25, 50, 50));
        assert_eq!(total_pixels(&regions), 100 * 100 - 50 * 50);
        remove_rectangle(&mut regions, r(0, 0, 100, 100));
        assert!(regions.is_empty());
    }
}
