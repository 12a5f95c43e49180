//! Frame ↔ Screen Coordinate Remapping
//!
//! Damage rectangles live in two spaces: the producer's pixel grid (frame
//! space) and the on-screen pixels after rotation, letterboxing and scaling
//! (screen space). Both conversions are needed: frame damage becomes
//! on-screen invalidated regions for presentation, and UI-overlay damage
//! (e.g. the cursor) is translated back into frame space so it lands in the
//! same accumulated-damage accounting.
//!
//! Both directions go through one affine transform, recomputed whenever the
//! viewport geometry changes. The four right-angle rotations are folded into
//! the matrix; the damage logic never special-cases them.

use serde::{Deserialize, Serialize};

use super::DamageRect;

// =============================================================================
// Rotation
// =============================================================================

/// Display rotation, one of four right-angle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    /// No rotation
    #[default]
    Rot0,
    /// 90° clockwise
    Rot90,
    /// 180°
    Rot180,
    /// 270° clockwise
    Rot270,
}

impl Rotation {
    /// Decode the wire tag, rejecting unknown values
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Rotation::Rot0),
            1 => Some(Rotation::Rot90),
            2 => Some(Rotation::Rot180),
            3 => Some(Rotation::Rot270),
            _ => None,
        }
    }

    /// Encode for the wire
    #[inline]
    pub fn to_wire(self) -> u32 {
        match self {
            Rotation::Rot0 => 0,
            Rotation::Rot90 => 1,
            Rotation::Rot180 => 2,
            Rotation::Rot270 => 3,
        }
    }

    /// Whether width and height trade places on screen
    #[inline]
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Rot90 | Rotation::Rot270)
    }
}

// =============================================================================
// Viewport
// =============================================================================

/// Where and how the frame is presented on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    /// Source frame width in pixels
    pub frame_width: u32,
    /// Source frame height in pixels
    pub frame_height: u32,
    /// Destination rectangle X (letterbox offset)
    pub dest_x: u32,
    /// Destination rectangle Y (letterbox offset)
    pub dest_y: u32,
    /// Destination rectangle width on screen
    pub dest_width: u32,
    /// Destination rectangle height on screen
    pub dest_height: u32,
    /// Total window width (clamp bound for screen-space rects)
    pub window_width: u32,
    /// Total window height (clamp bound for screen-space rects)
    pub window_height: u32,
    /// Display rotation applied at presentation
    pub rotation: Rotation,
}

/// Affine mapping between frame space and screen space
///
/// Recomputed whenever viewport size, destination rectangle or rotation
/// changes. Rectangle mapping rounds outward, so converting in either
/// direction never loses covered pixels.
#[derive(Debug, Clone)]
pub struct ViewportTransform {
    viewport: Viewport,
    /// Row-major [a, b, c, d, tx, ty]: screen = (a·x + b·y + tx, c·x + d·y + ty)
    forward: [f64; 6],
    inverse: [f64; 6],
}

impl ViewportTransform {
    /// Build the transform for a viewport
    ///
    /// Degenerate viewports (zero frame or destination extent) map
    /// everything to empty rectangles.
    pub fn new(viewport: Viewport) -> Self {
        let fw = viewport.frame_width as f64;
        let fh = viewport.frame_height as f64;
        let (rot_w, rot_h) = if viewport.rotation.swaps_axes() {
            (fh, fw)
        } else {
            (fw, fh)
        };

        let sx = if rot_w > 0.0 {
            viewport.dest_width as f64 / rot_w
        } else {
            0.0
        };
        let sy = if rot_h > 0.0 {
            viewport.dest_height as f64 / rot_h
        } else {
            0.0
        };
        let dx = viewport.dest_x as f64;
        let dy = viewport.dest_y as f64;

        let forward = match viewport.rotation {
            Rotation::Rot0 => [sx, 0.0, 0.0, sy, dx, dy],
            Rotation::Rot90 => [0.0, -sx, sy, 0.0, dx + fh * sx, dy],
            Rotation::Rot180 => [-sx, 0.0, 0.0, -sy, dx + fw * sx, dy + fh * sy],
            Rotation::Rot270 => [0.0, sx, -sy, 0.0, dx, dy + fw * sy],
        };

        let inverse = invert(&forward);
        Self {
            viewport,
            forward,
            inverse,
        }
    }

    /// The viewport this transform was built for
    #[inline]
    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Map frame-space damage to an on-screen invalidated region
    pub fn frame_to_screen(&self, rect: DamageRect) -> DamageRect {
        map_rect(
            &self.forward,
            rect,
            self.viewport.window_width,
            self.viewport.window_height,
        )
    }

    /// Map a screen-space invalidated region back into frame space
    pub fn screen_to_frame(&self, rect: DamageRect) -> DamageRect {
        map_rect(
            &self.inverse,
            rect,
            self.viewport.frame_width,
            self.viewport.frame_height,
        )
    }
}

fn invert(m: &[f64; 6]) -> [f64; 6] {
    let det = m[0] * m[3] - m[1] * m[2];
    if det == 0.0 {
        return [0.0; 6];
    }
    let ia = m[3] / det;
    let ib = -m[1] / det;
    let ic = -m[2] / det;
    let id = m[0] / det;
    [
        ia,
        ib,
        ic,
        id,
        -(ia * m[4] + ib * m[5]),
        -(ic * m[4] + id * m[5]),
    ]
}

#[inline]
fn apply(m: &[f64; 6], x: f64, y: f64) -> (f64, f64) {
    (m[0] * x + m[1] * y + m[4], m[2] * x + m[3] * y + m[5])
}

/// Map a rectangle through an affine, rounding outward and clamping
///
/// The matrices here are axis-preserving (rotation by right angles plus
/// scale), so the two diagonal corners bound the image.
fn map_rect(m: &[f64; 6], rect: DamageRect, bound_w: u32, bound_h: u32) -> DamageRect {
    let (x0, y0) = apply(m, rect.x as f64, rect.y as f64);
    let (x1, y1) = apply(
        m,
        (rect.x + rect.width) as f64,
        (rect.y + rect.height) as f64,
    );

    let min_x = x0.min(x1).floor().max(0.0) as u32;
    let min_y = y0.min(y1).floor().max(0.0) as u32;
    let max_x = (x0.max(x1).ceil().max(0.0) as u32).min(bound_w);
    let max_y = (y0.max(y1).ceil().max(0.0) as u32).min(bound_h);

    DamageRect {
        x: min_x.min(max_x),
        y: min_y.min(max_y),
        width: max_x.saturating_sub(min_x),
        height: max_y.saturating_sub(min_y),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity_viewport(w: u32, h: u32, rotation: Rotation) -> Viewport {
        let (dw, dh) = if rotation.swaps_axes() { (h, w) } else { (w, h) };
        Viewport {
            frame_width: w,
            frame_height: h,
            dest_x: 0,
            dest_y: 0,
            dest_width: dw,
            dest_height: dh,
            window_width: dw,
            window_height: dh,
            rotation,
        }
    }

    #[test]
    fn test_rotation_wire_roundtrip() {
        for rot in [
            Rotation::Rot0,
            Rotation::Rot90,
            Rotation::Rot180,
            Rotation::Rot270,
        ] {
            assert_eq!(Rotation::from_wire(rot.to_wire()), Some(rot));
        }
        assert_eq!(Rotation::from_wire(4), None);
    }

    #[test]
    fn test_identity_transform() {
        let t = ViewportTransform::new(identity_viewport(1920, 1080, Rotation::Rot0));
        let r = DamageRect::new(10, 20, 30, 40);
        assert_eq!(t.frame_to_screen(r), r);
        assert_eq!(t.screen_to_frame(r), r);
    }

    #[test]
    fn test_rot90_maps_top_left_to_top_right() {
        let t = ViewportTransform::new(identity_viewport(100, 50, Rotation::Rot90));
        let mapped = t.frame_to_screen(DamageRect::new(0, 0, 10, 5));
        assert_eq!(mapped, DamageRect::new(45, 0, 5, 10));
    }

    #[test]
    fn test_rot180_maps_top_left_to_bottom_right() {
        let t = ViewportTransform::new(identity_viewport(100, 50, Rotation::Rot180));
        let mapped = t.frame_to_screen(DamageRect::new(0, 0, 10, 5));
        assert_eq!(mapped, DamageRect::new(90, 45, 10, 5));
    }

    #[test]
    fn test_rot270_maps_top_left_to_bottom_left() {
        let t = ViewportTransform::new(identity_viewport(100, 50, Rotation::Rot270));
        let mapped = t.frame_to_screen(DamageRect::new(0, 0, 10, 5));
        assert_eq!(mapped, DamageRect::new(0, 90, 5, 10));
    }

    #[test]
    fn test_letterbox_offset_and_scale() {
        // 640x480 frame shown 2x inside a larger window with a 100,50 offset
        let t = ViewportTransform::new(Viewport {
            frame_width: 640,
            frame_height: 480,
            dest_x: 100,
            dest_y: 50,
            dest_width: 1280,
            dest_height: 960,
            window_width: 1600,
            window_height: 1200,
            rotation: Rotation::Rot0,
        });
        let mapped = t.frame_to_screen(DamageRect::new(10, 10, 20, 20));
        assert_eq!(mapped, DamageRect::new(120, 70, 40, 40));
        let back = t.screen_to_frame(mapped);
        assert!(back.contains(&DamageRect::new(10, 10, 20, 20)));
    }

    #[test]
    fn test_screen_rect_outside_dest_clamps() {
        let t = ViewportTransform::new(identity_viewport(100, 100, Rotation::Rot0));
        let mapped = t.screen_to_frame(DamageRect::new(90, 90, 50, 50));
        assert_eq!(mapped, DamageRect::new(90, 90, 10, 10));
    }

    #[test]
    fn test_degenerate_viewport_maps_empty() {
        let t = ViewportTransform::new(Viewport {
            frame_width: 0,
            frame_height: 0,
            dest_x: 0,
            dest_y: 0,
            dest_width: 0,
            dest_height: 0,
            window_width: 0,
            window_height: 0,
            rotation: Rotation::Rot0,
        });
        assert!(t.frame_to_screen(DamageRect::new(1, 1, 5, 5)).is_degenerate());
    }

    proptest! {
        // Round-trip containment: outward rounding in both directions means
        // frame → screen → frame always covers the original rectangle.
        #[test]
        fn prop_roundtrip_contains_original(
            fw in 2600u32..4096,
            fh in 2600u32..4096,
            dest_scale_num in 1u32..40,
            rot in 0u32..4,
            x in 0u32..2048,
            y in 0u32..2048,
            w in 1u32..512,
            h in 1u32..512,
        ) {
            let rotation = Rotation::from_wire(rot).unwrap();
            let (rw, rh) = if rotation.swaps_axes() { (fh, fw) } else { (fw, fh) };
            // Scale between 0.1x and 4x in tenths.
            let dw = (rw * dest_scale_num / 10).max(1);
            let dh = (rh * dest_scale_num / 10).max(1);
            let t = ViewportTransform::new(Viewport {
                frame_width: fw,
                frame_height: fh,
                dest_x: 13,
                dest_y: 7,
                dest_width: dw,
                dest_height: dh,
                window_width: 13 + dw,
                window_height: 7 + dh,
                rotation,
            });

            let original = DamageRect::new(x, y, w, h);
            let back = t.screen_to_frame(t.frame_to_screen(original));
            prop_assert!(back.contains(&original),
                "{:?} -> {:?} does not contain original", original, back);
        }
    }
}
