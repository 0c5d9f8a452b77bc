//! Runtime resolution of GL driver entry points.
//!
//! Two mutually exclusive backend families exist on Windows:
//!
//! - the desktop family: `wglGetProcAddress` + `opengl32.dll` exports,
//!   authoritative whenever a WGL context is current on the calling
//!   thread;
//! - the ANGLE/EGL family: `libGLESv2.dll` exports + `eglGetProcAddress`,
//!   used only when *no* WGL context is current and the caller has not
//!   forced the desktop family via `MAPGL_FORCE_DESKTOP_GL`.
//!
//! Mixing handles from the two families silently corrupts GPU state, so
//! when the desktop family is active there is **no** fallback to EGL: a
//! miss resolves to `None` and the caller takes its baseline path.
//!
//! On non-Windows targets resolution delegates to `gl_loader`, which
//! wraps the platform's native GL library.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::safe_mode::{self, SafeMode};

/// Alternate suffixes tried by [`resolve_with_fallbacks`]. Legacy
/// drivers export the FBO entry points only under their extension
/// names.
const FALLBACK_SUFFIXES: [&str; 2] = ["EXT", "OES"];

/// Entry points that are never handed to the embedded renderer,
/// regardless of safe-mode level. Debug callback registration from a
/// guest renderer has crashed host drivers in the wild.
const GUEST_ALWAYS_DENIED: [&str; 6] = [
    "glDebugMessageControl",
    "glDebugMessageCallback",
    "glDebugMessageControlARB",
    "glDebugMessageCallbackARB",
    "glPushDebugGroup",
    "glPopDebugGroup",
];

/// Resolve a GL entry point from the currently authoritative backend
/// family. Returns `None` when the symbol is unavailable; callers treat
/// that as a capability gap, not an error.
pub fn resolve(name: &str) -> Option<NonNull<c_void>> {
    platform::resolve(name)
}

/// Resolve `name`, then retry with `EXT`/`OES` suffixes on a miss.
pub fn resolve_with_fallbacks(name: &str) -> Option<NonNull<c_void>> {
    if let Some(p) = resolve(name) {
        return Some(p);
    }
    FALLBACK_SUFFIXES
        .iter()
        .find_map(|suffix| resolve(&format!("{name}{suffix}")))
}

/// Resolve an entry point on behalf of the embedded renderer.
///
/// Applies the safe-mode overlay (denylist, then stub substitution) on
/// top of [`resolve_with_fallbacks`], plus an unconditional denial of
/// the debug-message entry points. Returns a raw nullable pointer as
/// expected by the renderer's `getProcAddress` hook.
pub fn resolve_guest(name: &str) -> *const c_void {
    if GUEST_ALWAYS_DENIED.contains(&name) {
        return std::ptr::null();
    }

    match safe_mode::overlay(name, SafeMode::global()) {
        safe_mode::Overlay::Deny => {
            tracing::debug!(name, "guest symbol forced null (safe mode)");
            std::ptr::null()
        }
        safe_mode::Overlay::Stub(p) => {
            tracing::debug!(name, "guest symbol stubbed (safe mode)");
            p.as_ptr()
        }
        safe_mode::Overlay::Passthrough => resolve_with_fallbacks(name)
            .map_or(std::ptr::null(), |p| p.as_ptr() as *const c_void),
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use super::*;
    use std::ffi::CString;
    use std::sync::OnceLock;

    use windows::core::PCSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::Graphics::OpenGL::{wglGetCurrentContext, wglGetProcAddress};
    use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress, LoadLibraryA};

    /// `wglGetProcAddress` may return small sentinel values instead of
    /// null on a miss, per the WGL spec.
    fn is_sentinel(addr: usize) -> bool {
        matches!(addr, 1 | 2 | 3) || addr == usize::MAX
    }

    fn module_proc(module: HMODULE, name: &CString) -> Option<NonNull<c_void>> {
        let p = unsafe { GetProcAddress(module, PCSTR(name.as_ptr() as *const u8)) }?;
        NonNull::new(p as *mut c_void)
    }

    fn opengl32() -> Option<HMODULE> {
        unsafe { GetModuleHandleA(PCSTR(c"opengl32.dll".as_ptr() as *const u8)) }.ok()
    }

    fn desktop_context_current() -> bool {
        !unsafe { wglGetCurrentContext() }.is_invalid()
    }

    fn force_desktop_gl() -> bool {
        static FORCE: OnceLock<bool> = OnceLock::new();
        *FORCE.get_or_init(|| {
            std::env::var("MAPGL_FORCE_DESKTOP_GL")
                .map(|v| crate::safe_mode::truthy(&v))
                .unwrap_or(false)
        })
    }

    /// Resolve from the desktop family only: `wglGetProcAddress`, then
    /// `opengl32.dll` exports for GL 1.1 core symbols.
    fn resolve_desktop(name: &CString) -> Option<NonNull<c_void>> {
        let p = unsafe { wglGetProcAddress(PCSTR(name.as_ptr() as *const u8)) };
        if let Some(p) = p {
            let addr = p as usize;
            if !is_sentinel(addr) {
                return NonNull::new(addr as *mut c_void);
            }
        }
        module_proc(opengl32()?, name)
    }

    /// Resolve from the EGL family: `libGLESv2.dll` exports for core
    /// symbols, `eglGetProcAddress` for extensions.
    fn resolve_egl(name: &CString) -> Option<NonNull<c_void>> {
        type EglGetProcAddress = unsafe extern "system" fn(*const u8) -> *mut c_void;

        static GLES: OnceLock<Option<HMODULE>> = OnceLock::new();
        static EGL_LOOKUP: OnceLock<Option<EglGetProcAddress>> = OnceLock::new();

        let gles = *GLES.get_or_init(|| unsafe {
            [c"libGLESv2.dll", c"GLESv2.dll"].iter().find_map(|lib| {
                let name = PCSTR(lib.as_ptr() as *const u8);
                GetModuleHandleA(name).or_else(|_| LoadLibraryA(name)).ok()
            })
        });
        if let Some(module) = gles {
            if let Some(p) = module_proc(module, name) {
                return Some(p);
            }
        }

        let lookup = *EGL_LOOKUP.get_or_init(|| unsafe {
            let egl = [c"libEGL.dll", c"EGL.dll"].iter().find_map(|lib| {
                GetModuleHandleA(PCSTR(lib.as_ptr() as *const u8)).ok()
            })?;
            let p = GetProcAddress(egl, PCSTR(c"eglGetProcAddress".as_ptr() as *const u8))?;
            Some(std::mem::transmute::<_, EglGetProcAddress>(p))
        });
        let lookup = lookup?;
        NonNull::new(unsafe { lookup(name.as_ptr() as *const u8) })
    }

    pub(super) fn resolve(name: &str) -> Option<NonNull<c_void>> {
        let cname = CString::new(name).ok()?;

        // Bootstrap: WGL entry points come straight from opengl32.dll.
        if name.starts_with("wgl") {
            return module_proc(opengl32()?, &cname);
        }

        if desktop_context_current() {
            return resolve_desktop(&cname);
        }
        if force_desktop_gl() {
            return None;
        }
        resolve_egl(&cname)
    }
}

#[cfg(not(target_os = "windows"))]
mod platform {
    use super::*;
    use std::sync::Once;

    static GL_INIT_ONCE: Once = Once::new();

    pub(super) fn resolve(name: &str) -> Option<NonNull<c_void>> {
        GL_INIT_ONCE.call_once(|| {
            gl_loader::init_gl();
        });
        NonNull::new(gl_loader::get_proc_address(name) as *mut c_void)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_denies_debug_entry_points_unconditionally() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        for name in GUEST_ALWAYS_DENIED {
            assert!(resolve_guest(name).is_null(), "{name} must resolve null");
        }
    }

    #[test]
    fn fallback_suffixes_cover_legacy_names() {
        assert_eq!(FALLBACK_SUFFIXES, ["EXT", "OES"]);
    }
}
