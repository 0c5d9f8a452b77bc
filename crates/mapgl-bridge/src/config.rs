//! Environment-driven bridge configuration.
//!
//! Everything here is a platform graphics workaround switch, not part
//! of the rendering contract. Values are parsed once at bridge
//! construction; the lookup function is injectable so tests never
//! mutate process environment.

use std::time::Duration;

use mapgl_dispatch::liveness::GuardMode;
use mapgl_dispatch::safe_mode::truthy;

/// Which render path the bridge uses, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPathChoice {
    /// Render on the host's thread, in the host's context.
    SameThread,
    /// Render on a dedicated worker thread with a shared context.
    Isolated,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// `MAPGL_ISOLATE_CONTEXT`: run the map renderer on an isolated
    /// worker context. Default on where the platform requires it
    /// (Windows), off elsewhere.
    pub isolate_context: bool,
    /// `MAPGL_VPTR_GUARD`: liveness-probe policy (default warn).
    pub guard_mode: GuardMode,
    /// `MAPGL_ISO_READY_TIMEOUT_MS`: bounded wait for worker-context
    /// readiness. The original left this implementation-chosen; it is
    /// configurable here.
    pub iso_ready_timeout: Duration,
    /// `MAPGL_WARMUP_FRAMES`: extra render-skipped frames after a
    /// (re)allocation, beyond the mandatory allocation-frame skip.
    /// Some drivers need the host to observe the new texture for more
    /// than one frame.
    pub warmup_frames: u32,
    /// `MAPGL_DEBUG_CLEAR`: clear the target a solid color before each
    /// isolated render, to make the surface visibly alive while
    /// diagnosing a renderer that draws nothing.
    pub debug_clear: bool,
}

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(1000);

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            isolate_context: cfg!(target_os = "windows"),
            guard_mode: GuardMode::Warn,
            iso_ready_timeout: DEFAULT_READY_TIMEOUT,
            warmup_frames: 0,
            debug_clear: false,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            isolate_context: lookup("MAPGL_ISOLATE_CONTEXT")
                .map(|v| !falsy(&v))
                .unwrap_or(defaults.isolate_context),
            guard_mode: GuardMode::parse(lookup("MAPGL_VPTR_GUARD").as_deref()),
            iso_ready_timeout: lookup("MAPGL_ISO_READY_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.iso_ready_timeout),
            warmup_frames: lookup("MAPGL_WARMUP_FRAMES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.warmup_frames),
            debug_clear: lookup("MAPGL_DEBUG_CLEAR")
                .map(|v| truthy(&v))
                .unwrap_or(defaults.debug_clear),
        }
    }

    /// Resolve the render path once. Isolation is only meaningful where
    /// the platform forbids reentrant use of the host context; on other
    /// targets the same-thread path is always selected.
    pub fn render_path(&self) -> RenderPathChoice {
        if cfg!(target_os = "windows") && self.isolate_context {
            RenderPathChoice::Isolated
        } else {
            RenderPathChoice::SameThread
        }
    }
}

fn falsy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}
