//! GPU driver entry-point resolution for an embedded GL renderer.
//!
//! The embedded map renderer was not written to run as a guest inside
//! another renderer's context, so every driver symbol it touches goes
//! through this crate:
//!
//! - [`resolver`] decides, per call, which backend family is
//!   authoritative (desktop WGL vs ANGLE/EGL on Windows; the platform
//!   loader elsewhere) and never mixes the two.
//! - [`safe_mode`] overlays a denylist / stub substitution for entry
//!   points known to destabilize specific host drivers.
//! - [`liveness`] is a best-effort probe that a native object's
//!   dispatch table still points into live executable memory.

pub mod liveness;
pub mod resolver;
pub mod safe_mode;

pub use liveness::{looks_valid, GuardMode};
pub use resolver::{resolve, resolve_guest, resolve_with_fallbacks};
pub use safe_mode::SafeMode;
