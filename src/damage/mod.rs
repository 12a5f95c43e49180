//! Damage Tracking and Partial Redraw Planning
//!
//! The producer publishes, with every frame, the set of rectangles that
//! changed since the previous publication. The consumer keeps a short
//! history of those sets and, on each render pass, asks the render backend
//! how stale the presentation surface is (`buffer_age`). From the two it
//! decides between a full redraw and a partial redraw of the union of all
//! damage the surface missed.
//!
//! # Decision
//!
//! ```text
//! buffer_age == 0 or > history length          → full redraw
//! any walked history entry invalid (format     → full redraw
//!   change at that generation)
//! otherwise                                    → union of the last
//!                                                `buffer_age` entries,
//!                                                expanded by 1px, merged
//! ```
//!
//! The one-pixel expansion absorbs filtering/interpolation bleed at the
//! edges of redrawn boxes.
//!
//! Coordinate remapping between frame space and screen space lives in
//! [`transform`].

pub mod transform;

pub use transform::{Rotation, Viewport, ViewportTransform};

// =============================================================================
// Types
// =============================================================================

/// Maximum damage rectangles carried per frame descriptor
///
/// A publication with more changed regions than this collapses to full
/// damage on the producer side.
pub const MAX_DAMAGE_RECTS: usize = 16;

/// An axis-aligned changed region in frame-pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DamageRect {
    /// X coordinate in pixels from the left
    pub x: u32,
    /// Y coordinate in pixels from the top
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl DamageRect {
    /// Create a new damage rectangle
    #[inline]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle covering the entire frame
    #[inline]
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Area in pixels
    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether the rectangle covers no pixels
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether this rectangle overlaps or touches another
    pub fn touches(&self, other: &DamageRect) -> bool {
        self.x <= other.x + other.width
            && self.x + self.width >= other.x
            && self.y <= other.y + other.height
            && self.y + self.height >= other.y
    }

    /// Bounding box of two rectangles
    pub fn union(&self, other: &DamageRect) -> DamageRect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        DamageRect {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }

    /// Whether this rectangle fully contains another
    pub fn contains(&self, other: &DamageRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }

    /// Grow by `px` in every direction, clamped to the given bounds
    pub fn expanded(&self, px: u32, bound_w: u32, bound_h: u32) -> DamageRect {
        let x = self.x.saturating_sub(px);
        let y = self.y.saturating_sub(px);
        let right = (self.x + self.width).saturating_add(px).min(bound_w);
        let bottom = (self.y + self.height).saturating_add(px).min(bound_h);
        DamageRect {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
        }
    }
}

/// Merge all overlapping or touching rectangles
///
/// Iterates until a fixpoint; the result covers at least the input area.
pub fn merge_rects(mut rects: Vec<DamageRect>) -> Vec<DamageRect> {
    rects.retain(|r| !r.is_degenerate());
    if rects.len() <= 1 {
        return rects;
    }

    let mut changed = true;
    while changed {
        changed = false;
        let mut merged: Vec<DamageRect> = Vec::with_capacity(rects.len());
        let mut used = vec![false; rects.len()];

        for i in 0..rects.len() {
            if used[i] {
                continue;
            }
            let mut current = rects[i];
            used[i] = true;

            for j in (i + 1)..rects.len() {
                if used[j] {
                    continue;
                }
                if current.touches(&rects[j]) {
                    current = current.union(&rects[j]);
                    used[j] = true;
                    changed = true;
                }
            }
            merged.push(current);
        }
        rects = merged;
    }
    rects
}

// =============================================================================
// Damage history
// =============================================================================

/// One publication's worth of damage
#[derive(Debug, Clone, PartialEq, Eq)]
enum HistoryEntry {
    /// Nothing known about this generation (format change, overflow, reset)
    Invalid,
    /// The whole frame changed
    Full,
    /// Only these rectangles changed
    Rects(Vec<DamageRect>),
}

/// Fixed-length ring of recent damage sets, newest first when walked
#[derive(Debug)]
pub struct DamageHistory {
    entries: Vec<HistoryEntry>,
    head: usize,
}

impl DamageHistory {
    /// Create a history ring of `len` generations, all invalid
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "history length must be non-zero");
        Self {
            entries: vec![HistoryEntry::Invalid; len],
            head: 0,
        }
    }

    /// Number of generations the ring can answer for
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, entry: HistoryEntry) {
        self.head = (self.head + 1) % self.entries.len();
        self.entries[self.head] = entry;
    }

    /// Entry `back` generations behind the newest (0 = newest)
    fn walk(&self, back: usize) -> &HistoryEntry {
        let len = self.entries.len();
        &self.entries[(self.head + len - (back % len)) % len]
    }

    /// Invalidate every generation
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            *entry = HistoryEntry::Invalid;
        }
    }
}

// =============================================================================
// Redraw planning
// =============================================================================

/// What the render backend should repaint this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedrawPlan {
    /// Repaint the entire surface
    Full,
    /// Repaint only these frame-space rectangles (already expanded and merged)
    Partial(Vec<DamageRect>),
}

impl RedrawPlan {
    /// Whether the plan is a full repaint
    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, RedrawPlan::Full)
    }
}

/// Per-stream damage accounting and redraw planning
///
/// One tracker per presented stream. Feed it every publication's damage via
/// [`record`](Self::record), overlay invalidations via
/// [`report_overlay_damage`](Self::report_overlay_damage), then ask for a
/// [`RedrawPlan`] with the render backend's buffer age.
#[derive(Debug)]
pub struct DamageTracker {
    history: DamageHistory,
    frame_width: u32,
    frame_height: u32,
    /// Frame-space damage reported by the UI layer, folded into the next
    /// recorded generation
    overlay: Vec<DamageRect>,
}

impl DamageTracker {
    /// Create a tracker with the given history depth
    pub fn new(history_len: usize) -> Self {
        Self {
            history: DamageHistory::new(history_len),
            frame_width: 0,
            frame_height: 0,
            overlay: Vec::new(),
        }
    }

    /// Set the frame dimensions, invalidating all history on change
    pub fn set_frame_size(&mut self, width: u32, height: u32) {
        if width != self.frame_width || height != self.frame_height {
            self.frame_width = width;
            self.frame_height = height;
            self.history.reset();
        }
    }

    /// Record one publication's damage
    ///
    /// An empty `rects` means the producer reported full damage, matching
    /// the wire convention (damage count 0 = everything changed).
    pub fn record(&mut self, rects: &[DamageRect]) {
        if rects.is_empty() || rects.len() > MAX_DAMAGE_RECTS {
            self.overlay.clear();
            self.history.push(HistoryEntry::Full);
            return;
        }
        let mut all: Vec<DamageRect> = rects.to_vec();
        all.append(&mut self.overlay);
        self.history.push(HistoryEntry::Rects(all));
    }

    /// Record a generation whose damage cannot be known (format change)
    pub fn record_invalid(&mut self) {
        self.overlay.clear();
        self.history.push(HistoryEntry::Invalid);
    }

    /// Fold UI-overlay invalidations (already in frame space) into the next
    /// recorded generation
    pub fn report_overlay_damage(&mut self, rects: &[DamageRect]) {
        self.overlay.extend_from_slice(rects);
    }

    /// Decide full vs. partial redraw for a surface `buffer_age` generations
    /// behind
    pub fn plan(&self, buffer_age: u32) -> RedrawPlan {
        if buffer_age == 0 || buffer_age as usize > self.history.capacity() {
            return RedrawPlan::Full;
        }

        let mut rects: Vec<DamageRect> = Vec::new();
        for back in 0..buffer_age as usize {
            match self.history.walk(back) {
                HistoryEntry::Invalid | HistoryEntry::Full => return RedrawPlan::Full,
                HistoryEntry::Rects(entry) => rects.extend_from_slice(entry),
            }
        }

        let expanded = rects
            .into_iter()
            .map(|r| r.expanded(1, self.frame_width, self.frame_height))
            .collect();
        RedrawPlan::Partial(merge_rects(expanded))
    }
}

// =============================================================================
// Tests
// =============================================================================
