//! Visible signature placement.
//!
//! Placement works in PDF user space (origin bottom-left, points). The
//! automatic mode starts from a default rectangle near the bottom-left
//! corner and walks right, then up a row, until it finds space not covered
//! by an existing signature widget.

use crate::types::SignPosition;

/// Default widget width in points.
const WIDTH: f64 = 60.0;
/// Default widget height in points.
const HEIGHT: f64 = 40.0;
/// Iteration cap; placement gives up on a pathologically crowded page.
const MAX_STEPS: usize = 1000;

/// Axis-aligned rectangle, lower-left and upper-right corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    /// Lower-left x.
    pub llx: f64,
    /// Lower-left y.
    pub lly: f64,
    /// Upper-right x.
    pub urx: f64,
    /// Upper-right y.
    pub ury: f64,
}

impl Rect {
    /// Construct from corners.
    pub const fn new(llx: f64, lly: f64, urx: f64, ury: f64) -> Self {
        Self { llx, lly, urx, ury }
    }

    /// The degenerate rectangle used for invisible signatures.
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    /// Width of the rectangle.
    pub fn width(&self) -> f64 {
        self.urx - self.llx
    }

    /// Height of the rectangle.
    pub fn height(&self) -> f64 {
        self.ury - self.lly
    }

    /// True when the interiors intersect. Shared edges do not count.
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.llx < other.urx && other.llx < self.urx && self.lly < other.ury && other.lly < self.ury
    }
}

/// Fixed rectangle for [`SignPosition::Left`].
const LEFT_RECT: Rect = Rect::new(110.0, 160.0, 170.0, 200.0);
/// Fixed rectangle for [`SignPosition::Right`].
const RIGHT_RECT: Rect = Rect::new(440.0, 160.0, 500.0, 200.0);

/// Choose the widget rectangle for a new visible signature.
pub fn widget_rect(position: SignPosition, existing: &[Rect], page: Rect) -> Rect {
    match position {
        SignPosition::Left => LEFT_RECT,
        SignPosition::Right => RIGHT_RECT,
        SignPosition::Auto => free_area(existing, page),
    }
}

/// Find an unoccupied rectangle of the default size.
///
/// Starting from (50, 50): while the candidate overlaps an existing widget,
/// slide it to the right edge of the overlapped widget; when that leaves the
/// page, start a new row on top of the overlapped widget instead. Falls back
/// to the starting rectangle if the page is too crowded.
pub fn free_area(existing: &[Rect], page: Rect) -> Rect {
    let start = Rect::new(50.0, 50.0, 50.0 + WIDTH, 50.0 + HEIGHT);
    let mut candidate = start;
    for _ in 0..MAX_STEPS {
        let Some(overlapped) = existing.iter().find(|r| r.overlaps(&candidate)) else {
            return candidate;
        };
        let shifted = Rect::new(
            overlapped.urx,
            candidate.lly,
            overlapped.urx + WIDTH,
            candidate.ury,
        );
        candidate = if shifted.urx > page.urx {
            Rect::new(
                overlapped.llx,
                overlapped.ury,
                overlapped.llx + WIDTH,
                overlapped.ury + HEIGHT,
            )
        } else {
            shifted
        };
        if candidate.ury > page.ury {
            return start;
        }
    }
    start
}
