//! Safe-mode overlay for guest symbol resolution.
//!
//! Some drivers crash when the embedded renderer uses modern entry
//! points (debug callbacks, VAO/instancing, DSA, persistent mapping)
//! inside a context it does not own. `MAPGL_SAFE_MODE` gates two
//! independent mitigations:
//!
//! - level 1 (`DenyRisky`): the denylist below resolves to null, so the
//!   renderer takes its own conservative fallback paths;
//! - level 2 (`StubRisky`): additionally, a fixed subset resolves to
//!   local no-op stubs, for drivers that crash on a *missing* symbol
//!   but tolerate a no-op one.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::OnceLock;

use gl::types::{GLbitfield, GLchar, GLenum, GLint, GLintptr, GLsizei, GLsizeiptr, GLubyte, GLuint};

/// Safe-mode level, parsed once from `MAPGL_SAFE_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SafeMode {
    /// No overlay; every symbol resolves normally.
    Off,
    /// Denylisted symbols resolve to null.
    DenyRisky,
    /// Denylist plus no-op stubs for a fixed subset.
    StubRisky,
}

impl SafeMode {
    /// Parse an environment value. `"2"` selects [`SafeMode::StubRisky`],
    /// any other truthy value selects [`SafeMode::DenyRisky`], anything
    /// else (including unset) is [`SafeMode::Off`].
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("2") => SafeMode::StubRisky,
            Some(v) if truthy(v) => SafeMode::DenyRisky,
            _ => SafeMode::Off,
        }
    }

    /// The process-wide level from `MAPGL_SAFE_MODE`, read once.
    pub fn global() -> Self {
        static MODE: OnceLock<SafeMode> = OnceLock::new();
        *MODE.get_or_init(|| {
            let mode = SafeMode::parse(std::env::var("MAPGL_SAFE_MODE").ok().as_deref());
            if mode != SafeMode::Off {
                tracing::warn!(?mode, "GL safe mode enabled");
            }
            mode
        })
    }
}

/// Case-insensitive truthiness used by all `MAPGL_*` switches.
pub fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Entry points withheld from the embedded renderer at level >= 1.
/// Debug callbacks, client-side VAO/instancing, immutable storage, DSA,
/// buffer mapping, and fences have all destabilized host drivers when
/// driven from a guest renderer.
const DENYLIST: [&str; 38] = [
    "glDebugMessageControl",
    "glDebugMessageCallback",
    "glDebugMessageControlARB",
    "glDebugMessageCallbackARB",
    "glBindVertexArray",
    "glGenVertexArrays",
    "glDeleteVertexArrays",
    "glVertexAttribDivisor",
    "glDrawArraysInstanced",
    "glDrawElementsInstanced",
    "glTexStorage2D",
    "glTexStorage3D",
    "glInvalidateFramebuffer",
    "glInvalidateSubFramebuffer",
    "glMapBufferRange",
    "glFlushMappedBufferRange",
    "glCreateBuffers",
    "glNamedBufferData",
    "glNamedBufferSubData",
    "glMapNamedBufferRange",
    "glFlushMappedNamedBufferRange",
    "glCreateVertexArrays",
    "glVertexArrayVertexBuffer",
    "glVertexArrayAttribFormat",
    "glEnableVertexArrayAttrib",
    "glVertexArrayAttribBinding",
    "glVertexArrayElementBuffer",
    "glCreateFramebuffers",
    "glNamedFramebufferTexture",
    "glNamedFramebufferRenderbuffer",
    "glCheckNamedFramebufferStatus",
    "glCreateRenderbuffers",
    "glNamedRenderbufferStorage",
    "glFenceSync",
    "glClientWaitSync",
    "glWaitSync",
    "glDeleteSync",
    "glBindFragDataLocation",
];

/// Result of applying the overlay to one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    /// Not covered; resolve normally.
    Passthrough,
    /// Resolve to null.
    Deny,
    /// Resolve to a local no-op stub.
    Stub(NonNull<c_void>),
}

/// Apply the safe-mode overlay for `name` at `mode`.
///
/// Stubs take precedence over denial at level 2, matching the original
/// driver workarounds: a stubbed symbol must be *callable*, not absent.
pub fn overlay(name: &str, mode: SafeMode) -> Overlay {
    if mode >= SafeMode::StubRisky {
        if let Some(stub) = stub_for(name) {
            return Overlay::Stub(stub);
        }
    }
    if mode >= SafeMode::DenyRisky && DENYLIST.contains(&name) {
        return Overlay::Deny;
    }
    Overlay::Passthrough
}

fn stub_for(name: &str) -> Option<NonNull<c_void>> {
    let p: *mut c_void = match name {
        "glGetStringi" => stub_get_stringi as *mut c_void,
        "glBindFragDataLocation" => stub_bind_frag_data_location as *mut c_void,
        "glMapBufferRange" => stub_map_buffer_range as *mut c_void,
        "glFlushMappedBufferRange" => stub_flush_mapped_buffer_range as *mut c_void,
        "glInvalidateFramebuffer" => stub_invalidate_framebuffer as *mut c_void,
        "glInvalidateSubFramebuffer" => stub_invalidate_sub_framebuffer as *mut c_void,
        _ => return None,
    };
    NonNull::new(p)
}

// Stub implementations. Signatures must match the GL prototypes
// exactly; the renderer calls these through a raw pointer.

extern "system" fn stub_get_stringi(_name: GLenum, _index: GLuint) -> *const GLubyte {
    // Report no extensions.
    static EMPTY: &[u8] = b"\0";
    EMPTY.as_ptr()
}

extern "system" fn stub_bind_frag_data_location(
    _program: GLuint,
    _color: GLuint,
    _name: *const GLchar,
) {
}

extern "system" fn stub_map_buffer_range(
    _target: GLenum,
    _offset: GLintptr,
    _length: GLsizeiptr,
    _access: GLbitfield,
) -> *mut c_void {
    // Null forces the renderer's non-mapped upload path.
    std::ptr::null_mut()
}

extern "system" fn stub_flush_mapped_buffer_range(
    _target: GLenum,
    _offset: GLintptr,
    _length: GLsizeiptr,
) {
}

extern "system" fn stub_invalidate_framebuffer(
    _target: GLenum,
    _count: GLsizei,
    _attachments: *const GLenum,
) {
}

extern "system" fn stub_invalidate_sub_framebuffer(
    _target: GLenum,
    _count: GLsizei,
    _attachments: *const GLenum,
    _x: GLint,
    _y: GLint,
    _width: GLsizei,
    _height: GLsizei,
) {
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(SafeMode::parse(None), SafeMode::Off);
        assert_eq!(SafeMode::parse(Some("0")), SafeMode::Off);
        assert_eq!(SafeMode::parse(Some("off")), SafeMode::Off);
        assert_eq!(SafeMode::parse(Some("1")), SafeMode::DenyRisky);
        assert_eq!(SafeMode::parse(Some("true")), SafeMode::DenyRisky);
        assert_eq!(SafeMode::parse(Some("on")), SafeMode::DenyRisky);
        assert_eq!(SafeMode::parse(Some("2")), SafeMode::StubRisky);
    }

    #[test]
    fn overlay_off_is_passthrough() {
        assert_eq!(overlay("glFenceSync", SafeMode::Off), Overlay::Passthrough);
        assert_eq!(overlay("glGetStringi", SafeMode::Off), Overlay::Passthrough);
    }

    #[test]
    fn level_one_denies_risky_symbols() {
        assert_eq!(overlay("glFenceSync", SafeMode::DenyRisky), Overlay::Deny);
        assert_eq!(
            overlay("glBindVertexArray", SafeMode::DenyRisky),
            Overlay::Deny
        );
        assert_eq!(
            overlay("glDrawArrays", SafeMode::DenyRisky),
            Overlay::Passthrough
        );
    }

    #[test]
    fn level_two_stubs_take_precedence() {
        // glMapBufferRange is both denylisted and stubbed; at level 2
        // the stub wins so the renderer sees a callable symbol.
        assert!(matches!(
            overlay("glMapBufferRange", SafeMode::StubRisky),
            Overlay::Stub(_)
        ));
        // Non-stubbed denylist entries still resolve null.
        assert_eq!(overlay("glFenceSync", SafeMode::StubRisky), Overlay::Deny);
    }

    #[test]
    fn stubbed_get_stringi_reports_no_extensions() {
        let p = stub_get_stringi(0, 0);
        assert!(!p.is_null());
        assert_eq!(unsafe { *p }, 0);
    }

    #[test]
    fn stubbed_map_buffer_range_forces_fallback() {
        assert!(stub_map_buffer_range(0, 0, 0, 0).is_null());
    }
}
