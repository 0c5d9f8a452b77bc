//! Shared render target lifecycle: color texture + depth/stencil
//! renderbuffer + framebuffer, sized to the current drawing area.

use anyhow::{bail, Result};
use tracing::debug;

use crate::gl_api::GlApi;
use crate::surface::TargetView;

/// One drawable GPU surface.
///
/// Either all handles are non-zero and dimensions positive ("valid"),
/// or everything is zero ("empty"). No partially constructed state is
/// observable outside [`RenderTarget::ensure`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub framebuffer: u32,
    pub color_texture: u32,
    pub depth_stencil: u32,
    pub width: i32,
    pub height: i32,
}

/// Result of an [`ensure`](RenderTarget::ensure) call that succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Target already valid at the requested size; nothing touched.
    Unchanged,
    /// Target was (re)allocated; any previously issued surface handle
    /// is now stale and must be re-issued.
    Recreated,
}

impl RenderTarget {
    pub fn is_valid(&self) -> bool {
        self.framebuffer != 0
            && self.color_texture != 0
            && self.depth_stencil != 0
            && self.width > 0
            && self.height > 0
    }

    pub fn view(&self) -> TargetView {
        TargetView {
            framebuffer: self.framebuffer,
            color_texture: self.color_texture,
            width: self.width,
            height: self.height,
        }
    }

    /// Release all GPU handles and return to the empty state.
    ///
    /// Deletion order matters on some drivers: unbind first, then
    /// framebuffer, renderbuffer, texture.
    pub fn destroy(&mut self, gl: &impl GlApi) {
        if self.framebuffer == 0 && self.color_texture == 0 && self.depth_stencil == 0 {
            return;
        }
        debug!(
            fbo = self.framebuffer,
            tex = self.color_texture,
            width = self.width,
            height = self.height,
            "destroying render target"
        );
        if self.framebuffer != 0 {
            gl.bind_framebuffer(0);
            gl.delete_framebuffer(self.framebuffer);
        }
        if self.depth_stencil != 0 {
            gl.delete_renderbuffer(self.depth_stencil);
        }
        if self.color_texture != 0 {
            gl.bind_texture_2d(0);
            gl.delete_texture(self.color_texture);
        }
        *self = RenderTarget::default();
    }

    /// Guarantee a valid target of exactly `width` x `height`, or leave
    /// the target empty on driver failure (logged by the caller; the
    /// next frame retries). Idempotent for an unchanged size.
    ///
    /// Host bindings observed on entry are restored before returning,
    /// so the host's renderer never sees our scratch bindings.
    pub fn ensure(&mut self, gl: &impl GlApi, width: i32, height: i32) -> Result<EnsureOutcome> {
        if width <= 0 || height <= 0 {
            bail!("invalid target size {width}x{height}");
        }
        if self.is_valid() && self.width == width && self.height == height {
            return Ok(EnsureOutcome::Unchanged);
        }

        self.destroy(gl);

        let prev_texture = gl.bound_texture_2d();
        let prev_framebuffer = gl.bound_framebuffer();

        let color_texture = gl.gen_texture();
        gl.bind_texture_2d(color_texture);
        gl.color_texture_storage(width, height);

        let framebuffer = gl.gen_framebuffer();
        gl.bind_framebuffer(framebuffer);
        gl.attach_color_texture(color_texture);

        let depth_stencil = gl.gen_renderbuffer();
        gl.depth_stencil_storage(depth_stencil, width, height);
        gl.attach_depth_stencil(depth_stencil);

        let complete = gl.framebuffer_complete();

        gl.bind_framebuffer(prev_framebuffer);
        gl.bind_texture_2d(prev_texture);

        if !complete {
            // Tear down the partial allocation; the target stays empty
            // and the next frame retries.
            gl.delete_framebuffer(framebuffer);
            gl.delete_renderbuffer(depth_stencil);
            gl.delete_texture(color_texture);
            bail!("framebuffer incomplete at {width}x{height}");
        }

        debug!(
            fbo = framebuffer,
            tex = color_texture,
            width,
            height,
            "render target allocated"
        );
        *self = RenderTarget {
            framebuffer,
            color_texture,
            depth_stencil,
            width,
            height,
        };
        Ok(EnsureOutcome::Recreated)
    }
}
