//! Surface handles exchanged with the host compositor and the render
//! callback.

/// Vertical origin of the shared color texture. GL framebuffer contents
/// are bottom-up; the host compositor flips at composite time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalOrigin {
    BottomLeft,
}

/// A lightweight reference to the shared color texture, displayable by
/// the host compositor.
///
/// A handle is issued once per render-target allocation and replaced,
/// never mutated, when the target is recreated. A handle referencing a
/// destroyed texture is a defect; the bridge recreates the target
/// before re-issuing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceHandle {
    /// GL color texture name.
    pub texture: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    pub origin: VerticalOrigin,
}

/// Read-only view of the render target handed to the render callback.
///
/// The framebuffer is already bound and the viewport already set when
/// the callback runs; the handles are informational.
#[derive(Debug, Clone, Copy)]
pub struct TargetView {
    pub framebuffer: u32,
    pub color_texture: u32,
    pub width: i32,
    pub height: i32,
}
