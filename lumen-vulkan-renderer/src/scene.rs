//! Data model shared with the windowing collaborator.
//!
//! The session layer owns surfaces, outputs and input focus; this module
//! defines the read-only shapes it hands to the renderer each frame, plus
//! the depth-ordering rules the renderer applies to them. Nothing here
//! touches the GPU.

use std::cmp::Ordering;
use std::os::unix::io::RawFd;
use std::time::Instant;

use ash::vk;
use glam::Mat4;
use uuid::Uuid;

/// Stable identity of an imported client texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(Uuid);

impl TextureId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TextureId {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable identity of a presentable output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(Uuid);

impl OutputId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OutputId {
    fn default() -> Self {
        Self::new()
    }
}

/// A dmabuf plane handed over by the buffer producer.
///
/// The renderer duplicates the fd on import; the caller keeps ownership of
/// the original descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DmabufSource {
    pub fd: RawFd,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane.
    pub stride: u32,
    pub format: vk::Format,
    pub modifier: Option<u64>,
}

/// One drawable window surface for one frame.
///
/// `transform` maps the unit quad to screen pixels; `blur_transform` maps
/// the region the backdrop blur samples from, which the session layer keeps
/// separate so decorations can blur a slightly larger area than they cover.
#[derive(Debug, Clone)]
pub struct RenderSurface {
    pub texture: TextureId,
    pub transform: Mat4,
    pub blur_transform: Mat4,
    pub width: u32,
    pub height: u32,
    /// Monotonic creation time, drives the map-in animation.
    pub spawned: Instant,
    /// Signed stacking depth; smaller draws first (further back).
    pub depth: f32,
    /// False for passthrough decoration layers that never take clicks.
    pub absorbs_input: bool,
}

impl RenderSurface {
    /// A surface with no drawable area at all is skipped for the frame.
    pub fn is_drawable(&self) -> bool {
        self.width != 0 || self.height != 0
    }

    pub fn seconds_since_spawn(&self, now: Instant) -> f32 {
        now.saturating_duration_since(self.spawned).as_secs_f32()
    }
}

/// A presentable buffer belonging to one output (or one cursor size).
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub id: OutputId,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub dmabuf: DmabufSource,
}

/// Seam to the display collaborator: supplies the buffer being drawn into
/// and commits it for presentation once the frame is finished.
pub trait CompositorOutput {
    fn buffer(&self) -> &OutputBuffer;
    /// Requests presentation of the just-rendered buffer. Returns whether
    /// the commit was accepted.
    fn commit(&mut self) -> bool;
}

/// Per-frame parameters from the session layer.
#[derive(Debug, Clone, Copy)]
pub struct FrameParams {
    pub cursor_x: u32,
    pub cursor_y: u32,
    /// Blend position between the two schemes, 0.0 = source, 1.0 = destination.
    pub colorscheme_ratio: f32,
    pub src_scheme: usize,
    pub dst_scheme: usize,
}

/// Depth comparison: `(a > b) - (a < b)`. NaN depths compare equal to
/// everything and fall back to input order.
pub fn depth_order(a: f32, b: f32) -> Ordering {
    let sign = (a > b) as i32 - (a < b) as i32;
    sign.cmp(&0)
}

/// Indices of the surfaces to draw this frame, back-to-front.
///
/// Zero-area surfaces are dropped; ties in depth keep input order (stable
/// sort), which is what gives hit-test ids their frame-to-frame coherence.
pub fn plan_draw_order(surfaces: &[RenderSurface]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..surfaces.len())
        .filter(|&index| surfaces[index].is_drawable())
        .collect();
    order.sort_by(|&a, &b| depth_order(surfaces[a].depth, surfaces[b].depth));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(depth: f32, width: u32, height: u32) -> RenderSurface {
        RenderSurface {
            texture: TextureId::new(),
            transform: Mat4::IDENTITY,
            blur_transform: Mat4::IDENTITY,
            width,
            height,
            spawned: Instant::now(),
            depth,
            absorbs_input: true,
        }
    }

    #[test]
    fn draws_in_non_decreasing_depth_order() {
        let surfaces = vec![surface(2.0, 10, 10), surface(-1.0, 10, 10), surface(0.5, 10, 10)];
        assert_eq!(plan_draw_order(&surfaces), vec![1, 2, 0]);
    }

    #[test]
    fn equal_depths_keep_input_order() {
        let surfaces = vec![surface(1.0, 10, 10), surface(1.0, 10, 10), surface(1.0, 10, 10)];
        assert_eq!(plan_draw_order(&surfaces), vec![0, 1, 2]);
    }

    #[test]
    fn zero_area_surfaces_are_skipped() {
        let surfaces = vec![surface(0.0, 0, 0), surface(1.0, 10, 10)];
        assert_eq!(plan_draw_order(&surfaces), vec![1]);
    }

    #[test]
    fn one_sided_zero_dimension_still_draws() {
        // only width==0 AND height==0 is skipped
        let surfaces = vec![surface(0.0, 0, 10), surface(1.0, 10, 0)];
        assert_eq!(plan_draw_order(&surfaces), vec![0, 1]);
    }

    #[test]
    fn depth_order_matches_sign_convention() {
        assert_eq!(depth_order(1.0, 2.0), Ordering::Less);
        assert_eq!(depth_order(2.0, 1.0), Ordering::Greater);
        assert_eq!(depth_order(1.0, 1.0), Ordering::Equal);
        assert_eq!(depth_order(f32::NAN, 1.0), Ordering::Equal);
    }

    #[test]
    fn seconds_since_spawn_is_monotonic() {
        let s = surface(0.0, 1, 1);
        let later = s.spawned + std::time::Duration::from_millis(1500);
        assert!((s.seconds_since_spawn(later) - 1.5).abs() < 1e-3);
    }
}
