//! GPU Surface Bridge: zero-copy embedding of a GL map renderer's
//! output into a host UI toolkit's compositor.
//!
//! The bridge owns a GL render target (color texture + depth/stencil +
//! framebuffer) inside the host's context, drives the map renderer once
//! per host frame, and hands the host a borrowed texture handle to
//! composite. The pixels never leave the GPU.
//!
//! Two render paths exist, fixed at initialization:
//!
//! - same-thread: the renderer draws on the host render thread, in the
//!   host context, between snapshot and restore of the host's GL state;
//! - isolated: on platforms where the host context must not be used
//!   reentrantly, the renderer lives on a worker thread with its own
//!   context sharing the host's object namespace ([`isolated`]).
//!
//! Entry-point resolution, safe-mode driver workarounds, and the
//! dispatch-table liveness probe live in the `mapgl-dispatch` crate.

pub mod bridge;
pub mod config;
pub mod gl_api;
pub mod isolated;
pub mod render_target;
pub mod scheduler;
pub mod surface;

pub use bridge::{HostLoop, RedrawSignal, SizeSetter, SurfaceBridge};
pub use config::{BridgeConfig, RenderPathChoice};
pub use scheduler::RenderingStage;
pub use surface::{SurfaceHandle, TargetView, VerticalOrigin};

/// The map renderer's per-frame draw hook. The target framebuffer is
/// bound and the viewport set before it runs.
pub type RenderFn = Box<dyn FnMut(TargetView) -> anyhow::Result<()> + Send>;

/// Deferred renderer constructor, invoked once on the rendering thread.
pub type RendererFactory = Box<dyn FnOnce() -> anyhow::Result<RenderFn> + Send>;
