//! Windows backend for the isolated render thread.
//!
//! The worker owns a WGL context created against a hidden 16x16 window
//! and shares object namespaces with the host context through
//! `wglShareLists`, so the color texture allocated by the host thread
//! is directly attachable here. The context is made current once, on
//! the worker thread, and destroyed there too.

use std::sync::Once;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, warn};

use windows::core::w;
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Gdi::{GetDC, ReleaseDC, HDC};
use windows::Win32::Graphics::OpenGL::{
    wglCreateContext, wglDeleteContext, wglGetCurrentContext, wglGetCurrentDC, wglMakeCurrent,
    wglShareLists, ChoosePixelFormat, SetPixelFormat, HGLRC, PFD_DOUBLEBUFFER, PFD_DRAW_TO_WINDOW,
    PFD_MAIN_PLANE, PFD_SUPPORT_OPENGL, PFD_TYPE_RGBA, PIXELFORMATDESCRIPTOR,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, RegisterClassW, WINDOW_EX_STYLE, WNDCLASSW,
    WS_OVERLAPPED,
};

use crate::gl_api::{GlApi, LiveGl};
use crate::isolated::{IsolatedBackend, RenderRequest, WorkerTarget};
use crate::surface::TargetView;
use crate::RenderFn;

/// Host context handles captured on the host render thread, consumed on
/// the worker thread.
pub struct HostContext {
    hglrc: HGLRC,
    hdc: HDC,
}

// SAFETY: HGLRC and HDC are plain driver handles. The worker never
// makes the host context current; it only passes the HGLRC to
// `wglShareLists` and keeps the HDC for diagnostics.
unsafe impl Send for HostContext {}

/// Capture the WGL context current on the calling thread. Must run on
/// the host render thread while the host's context is current.
pub fn capture_current() -> Result<HostContext> {
    let hglrc = unsafe { wglGetCurrentContext() };
    if hglrc.is_invalid() {
        bail!("no WGL context current on the calling thread");
    }
    Ok(HostContext {
        hglrc,
        hdc: unsafe { wglGetCurrentDC() },
    })
}

/// Everything the worker needs to stand up its context.
pub struct WglHost {
    pub context: HostContext,
    /// Clear the target a solid color before each render, to make the
    /// surface visibly alive while diagnosing a renderer that draws
    /// nothing.
    pub debug_clear: bool,
}

/// The worker-side half: hidden window, shared context, and a private
/// framebuffer wrapping the host-allocated color texture.
pub struct WglBackend {
    window: HWND,
    hdc: HDC,
    context: HGLRC,
    gl: LiveGl,
    target: WorkerTarget,
    debug_clear: bool,
}

unsafe extern "system" fn wndproc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

fn register_window_class() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| unsafe {
        let class = WNDCLASSW {
            lpfnWndProc: Some(wndproc),
            hInstance: GetModuleHandleW(None).map(Into::into).unwrap_or_default(),
            lpszClassName: w!("MapglIsolatedRender"),
            ..Default::default()
        };
        if RegisterClassW(&class) == 0 {
            error!("hidden window class registration failed");
        }
    });
}

fn create_hidden_window() -> Result<HWND> {
    register_window_class();
    unsafe {
        CreateWindowExW(
            WINDOW_EX_STYLE::default(),
            w!("MapglIsolatedRender"),
            w!("mapgl isolated render"),
            WS_OVERLAPPED,
            0,
            0,
            16,
            16,
            None,
            None,
            None,
            None,
        )
    }
    .context("hidden window creation failed")
}

impl WglBackend {
    fn release_native(window: HWND, hdc: HDC, context: HGLRC) {
        unsafe {
            if !context.is_invalid() {
                let _ = wglMakeCurrent(HDC::default(), HGLRC::default());
                let _ = wglDeleteContext(context);
            }
            if !hdc.is_invalid() {
                ReleaseDC(Some(window), hdc);
            }
            if !window.is_invalid() {
                let _ = DestroyWindow(window);
            }
        }
    }
}

impl IsolatedBackend for WglBackend {
    type Host = WglHost;

    fn create(host: WglHost) -> Result<Self> {
        let window = create_hidden_window()?;
        let hdc = unsafe { GetDC(Some(window)) };
        if hdc.is_invalid() {
            Self::release_native(window, HDC::default(), HGLRC::default());
            bail!("no device context for the hidden window");
        }

        let pfd = PIXELFORMATDESCRIPTOR {
            nSize: std::mem::size_of::<PIXELFORMATDESCRIPTOR>() as u16,
            nVersion: 1,
            dwFlags: PFD_DRAW_TO_WINDOW | PFD_SUPPORT_OPENGL | PFD_DOUBLEBUFFER,
            iPixelType: PFD_TYPE_RGBA,
            cColorBits: 32,
            cDepthBits: 24,
            cStencilBits: 8,
            iLayerType: PFD_MAIN_PLANE.0 as u8,
            ..Default::default()
        };
        let format = unsafe { ChoosePixelFormat(hdc, &pfd) };
        if format == 0 {
            Self::release_native(window, hdc, HGLRC::default());
            bail!("no matching pixel format for the worker context");
        }
        if let Err(err) = unsafe { SetPixelFormat(hdc, format, &pfd) } {
            Self::release_native(window, hdc, HGLRC::default());
            return Err(err).context("SetPixelFormat failed");
        }

        let context = match unsafe { wglCreateContext(hdc) } {
            Ok(context) => context,
            Err(err) => {
                Self::release_native(window, hdc, HGLRC::default());
                return Err(err).context("worker context creation failed");
            }
        };
        // Sharing must happen before the context is ever current.
        if let Err(err) = unsafe { wglShareLists(host.context.hglrc, context) } {
            Self::release_native(window, hdc, context);
            return Err(err).context("wglShareLists with the host context failed");
        }
        if let Err(err) = unsafe { wglMakeCurrent(hdc, context) } {
            Self::release_native(window, hdc, context);
            return Err(err).context("making the worker context current failed");
        }

        let gl = match LiveGl::load() {
            Ok(gl) => gl,
            Err(err) => {
                Self::release_native(window, hdc, context);
                return Err(err);
            }
        };

        debug!(host_dc = ?host.context.hdc, "isolated WGL context sharing with host");
        Ok(Self {
            window,
            hdc,
            context,
            gl,
            target: WorkerTarget::default(),
            debug_clear: host.debug_clear,
        })
    }

    fn render(&mut self, request: &RenderRequest, draw: &mut RenderFn) -> Result<()> {
        let (width, height) = (request.width, request.height);
        self.target.bind(&self.gl, request)?;

        if self.debug_clear {
            unsafe {
                gl::ClearColor(0.0, 0.5, 0.5, 1.0);
                gl::Clear(gl::COLOR_BUFFER_BIT | gl::DEPTH_BUFFER_BIT | gl::STENCIL_BUFFER_BIT);
            }
        }

        draw(TargetView {
            framebuffer: self.target.framebuffer(),
            color_texture: request.texture,
            width,
            height,
        })?;

        // Publish the frame to the host context before the request is
        // retired.
        self.gl.flush();
        Ok(())
    }
}

impl Drop for WglBackend {
    fn drop(&mut self) {
        if unsafe { wglGetCurrentContext() } != self.context {
            warn!("worker context not current at teardown; skipping GL object deletion");
        } else {
            self.target.destroy(&self.gl);
        }
        Self::release_native(self.window, self.hdc, self.context);
    }
}
