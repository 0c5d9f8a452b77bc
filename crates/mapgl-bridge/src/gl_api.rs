//! GL access seam for the render-target lifecycle.
//!
//! The scheduler and target code never call the driver directly; they
//! go through [`GlApi`] so the lifecycle invariants are testable
//! without a live context. [`LiveGl`] is the production implementation,
//! loading every entry point through the symbol resolver.

use anyhow::{bail, Result};
use std::sync::Once;

use mapgl_dispatch::resolve_with_fallbacks;

/// The GL operations the bridge needs. One method per driver call the
/// target lifecycle performs; implementations do no bookkeeping beyond
/// the call itself.
pub trait GlApi {
    fn gen_texture(&self) -> u32;
    fn delete_texture(&self, tex: u32);
    fn bound_texture_2d(&self) -> u32;
    fn bind_texture_2d(&self, tex: u32);
    /// Set filtering/wrap parameters and allocate RGBA8 storage for the
    /// currently bound 2D texture.
    fn color_texture_storage(&self, width: i32, height: i32);

    fn gen_renderbuffer(&self) -> u32;
    fn delete_renderbuffer(&self, rb: u32);
    /// Bind `rb` and allocate DEPTH24_STENCIL8 storage, then unbind.
    fn depth_stencil_storage(&self, rb: u32, width: i32, height: i32);

    fn gen_framebuffer(&self) -> u32;
    fn delete_framebuffer(&self, fbo: u32);
    fn bound_framebuffer(&self) -> u32;
    fn bind_framebuffer(&self, fbo: u32);
    /// Attach a color texture to the currently bound framebuffer.
    fn attach_color_texture(&self, tex: u32);
    /// Attach a depth+stencil renderbuffer to the currently bound
    /// framebuffer.
    fn attach_depth_stencil(&self, rb: u32);
    /// Completeness status of the currently bound framebuffer.
    fn framebuffer_complete(&self) -> bool;

    fn viewport(&self) -> [i32; 4];
    fn set_viewport(&self, rect: [i32; 4]);
    fn flush(&self);
}

/// Production [`GlApi`] backed by `gl::load_with` and the resolver.
///
/// Construction fails if any required FBO entry point is missing from
/// the active backend family; the caller retries on a later frame, when
/// a context may be current.
pub struct LiveGl {
    _priv: (),
}

static GL_LOAD_ONCE: Once = Once::new();

impl LiveGl {
    /// Load GL entry points through the resolver. Must be called with
    /// the host's context current on this thread.
    pub fn load() -> Result<Self> {
        GL_LOAD_ONCE.call_once(|| {
            gl::load_with(|name| {
                resolve_with_fallbacks(name)
                    .map_or(std::ptr::null(), |p| p.as_ptr() as *const _)
            });
        });

        let missing: Vec<&str> = [
            ("glGenFramebuffers", gl::GenFramebuffers::is_loaded()),
            ("glDeleteFramebuffers", gl::DeleteFramebuffers::is_loaded()),
            ("glBindFramebuffer", gl::BindFramebuffer::is_loaded()),
            ("glFramebufferTexture2D", gl::FramebufferTexture2D::is_loaded()),
            ("glCheckFramebufferStatus", gl::CheckFramebufferStatus::is_loaded()),
            ("glGenRenderbuffers", gl::GenRenderbuffers::is_loaded()),
            ("glBindRenderbuffer", gl::BindRenderbuffer::is_loaded()),
            ("glRenderbufferStorage", gl::RenderbufferStorage::is_loaded()),
            ("glFramebufferRenderbuffer", gl::FramebufferRenderbuffer::is_loaded()),
            ("glDeleteRenderbuffers", gl::DeleteRenderbuffers::is_loaded()),
            ("glGenTextures", gl::GenTextures::is_loaded()),
            ("glTexImage2D", gl::TexImage2D::is_loaded()),
            ("glGetIntegerv", gl::GetIntegerv::is_loaded()),
            ("glViewport", gl::Viewport::is_loaded()),
        ]
        .iter()
        .filter_map(|&(name, loaded)| (!loaded).then_some(name))
        .collect();

        if !missing.is_empty() {
            bail!("missing GL entry points: {}", missing.join(", "));
        }
        Ok(Self { _priv: () })
    }
}

impl GlApi for LiveGl {
    fn gen_texture(&self) -> u32 {
        let mut tex = 0;
        unsafe { gl::GenTextures(1, &mut tex) };
        tex
    }

    fn delete_texture(&self, tex: u32) {
        unsafe { gl::DeleteTextures(1, &tex) };
    }

    fn bound_texture_2d(&self) -> u32 {
        let mut tex = 0;
        unsafe { gl::GetIntegerv(gl::TEXTURE_BINDING_2D, &mut tex) };
        tex as u32
    }

    fn bind_texture_2d(&self, tex: u32) {
        unsafe { gl::BindTexture(gl::TEXTURE_2D, tex) };
    }

    fn color_texture_storage(&self, width: i32, height: i32) {
        unsafe {
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA8 as i32,
                width,
                height,
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                std::ptr::null(),
            );
        }
    }

    fn gen_renderbuffer(&self) -> u32 {
        let mut rb = 0;
        unsafe { gl::GenRenderbuffers(1, &mut rb) };
        rb
    }

    fn delete_renderbuffer(&self, rb: u32) {
        unsafe {
            gl::BindRenderbuffer(gl::RENDERBUFFER, 0);
            gl::DeleteRenderbuffers(1, &rb);
        }
    }

    fn depth_stencil_storage(&self, rb: u32, width: i32, height: i32) {
        unsafe {
            gl::BindRenderbuffer(gl::RENDERBUFFER, rb);
            gl::RenderbufferStorage(gl::RENDERBUFFER, gl::DEPTH24_STENCIL8, width, height);
            gl::BindRenderbuffer(gl::RENDERBUFFER, 0);
        }
    }

    fn gen_framebuffer(&self) -> u32 {
        let mut fbo = 0;
        unsafe { gl::GenFramebuffers(1, &mut fbo) };
        fbo
    }

    fn delete_framebuffer(&self, fbo: u32) {
        unsafe { gl::DeleteFramebuffers(1, &fbo) };
    }

    fn bound_framebuffer(&self) -> u32 {
        let mut fbo = 0;
        unsafe { gl::GetIntegerv(gl::FRAMEBUFFER_BINDING, &mut fbo) };
        fbo as u32
    }

    fn bind_framebuffer(&self, fbo: u32) {
        unsafe { gl::BindFramebuffer(gl::FRAMEBUFFER, fbo) };
    }

    fn attach_color_texture(&self, tex: u32) {
        unsafe {
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                tex,
                0,
            );
        }
    }

    fn attach_depth_stencil(&self, rb: u32) {
        unsafe {
            gl::FramebufferRenderbuffer(
                gl::FRAMEBUFFER,
                gl::DEPTH_STENCIL_ATTACHMENT,
                gl::RENDERBUFFER,
                rb,
            );
        }
    }

    fn framebuffer_complete(&self) -> bool {
        let status = unsafe { gl::CheckFramebufferStatus(gl::FRAMEBUFFER) };
        if status != gl::FRAMEBUFFER_COMPLETE {
            tracing::error!(status = format!("{status:#x}"), "framebuffer incomplete");
        }
        status == gl::FRAMEBUFFER_COMPLETE
    }

    fn viewport(&self) -> [i32; 4] {
        let mut vp = [0; 4];
        unsafe { gl::GetIntegerv(gl::VIEWPORT, vp.as_mut_ptr()) };
        vp
    }

    fn set_viewport(&self, rect: [i32; 4]) {
        unsafe { gl::Viewport(rect[0], rect[1], rect[2], rect[3]) };
    }

    fn flush(&self) {
        unsafe { gl::Flush() };
    }
}
