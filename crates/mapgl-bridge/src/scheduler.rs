//! Per-frame state machine driving the render target and the map
//! renderer from the host's rendering notifications.
//!
//! The host owns the cadence: every frame it reports `BeforeDraw`
//! before its own drawing and `AfterDraw` after compositing. All GPU
//! mutation happens inside `BeforeDraw`; `AfterDraw` only requests the
//! next frame, which keeps the map animating while tiles stream in.

use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use mapgl_dispatch::{looks_valid, GuardMode};

use crate::bridge::HostLoop;
use crate::gl_api::GlApi;
use crate::render_target::{EnsureOutcome, RenderTarget};
use crate::surface::{SurfaceHandle, VerticalOrigin};
use crate::RenderFn;

/// Host rendering notification stages, in frame order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderingStage {
    /// Graphics resources are available; no drawing yet.
    Setup,
    /// The host is about to draw this frame.
    BeforeDraw,
    /// The host finished compositing this frame.
    AfterDraw,
    /// Graphics resources are about to disappear.
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// No target allocated.
    Empty,
    /// Target allocated this frame or still warming up; rendering is
    /// skipped until the host has observed the new texture.
    Allocating,
    /// Target valid and warmed up.
    Ready,
    /// The render callback is on the stack.
    Rendering,
}

/// Desired surface size, settable from any thread.
///
/// Resize is recorded here and applied by the scheduler on the next
/// `BeforeDraw`; setting it performs no GPU work. Width and height are
/// packed into one atomic word so a reader never observes a mixed
/// pair from two interleaved updates.
#[derive(Debug, Default)]
pub struct DesiredSize {
    packed: AtomicU64,
}

impl DesiredSize {
    pub fn set(&self, width: u32, height: u32) {
        let packed = (u64::from(width) << 32) | u64::from(height);
        self.packed.store(packed, Ordering::Release);
    }

    pub fn get(&self) -> (i32, i32) {
        let packed = self.packed.load(Ordering::Acquire);
        let clamp = |v: u32| v.min(i32::MAX as u32) as i32;
        (clamp((packed >> 32) as u32), clamp(packed as u32))
    }
}

/// Consumer of render work on the isolated path. Fire-and-forget; the
/// implementation coalesces.
pub trait Submit {
    fn submit(&self, texture: u32, width: i32, height: i32);
}

/// Where a frame's rendering goes once the target is ready.
pub enum RenderPath {
    /// Invoke the map renderer here, on the host thread, in the host
    /// context.
    Direct(RenderFn),
    /// Hand the frame to the isolated worker.
    Queued(Box<dyn Submit>),
}

pub struct SchedulerOptions {
    /// Extra render-skipped frames after each (re)allocation.
    pub warmup_frames: u32,
    pub guard_mode: GuardMode,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            warmup_frames: 0,
            guard_mode: GuardMode::Warn,
        }
    }
}

type ReadyCallback = Arc<dyn Fn(SurfaceHandle) + Send + Sync>;

pub struct FrameScheduler<G: GlApi> {
    gl: G,
    host: Arc<dyn HostLoop>,
    desired: Arc<DesiredSize>,
    target: RenderTarget,
    state: FrameState,
    warmup_remaining: u32,
    options: SchedulerOptions,
    path: Option<RenderPath>,
    on_ready: Option<ReadyCallback>,
    probe_targets: Vec<*const c_void>,
}

impl<G: GlApi> FrameScheduler<G> {
    pub fn new(
        gl: G,
        host: Arc<dyn HostLoop>,
        desired: Arc<DesiredSize>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            gl,
            host,
            desired,
            target: RenderTarget::default(),
            state: FrameState::Empty,
            warmup_remaining: 0,
            options,
            path: None,
            on_ready: None,
            probe_targets: Vec::new(),
        }
    }

    /// Install the render path. Until one is set, frames allocate and
    /// issue surface handles but render nothing.
    pub fn set_path(&mut self, path: RenderPath) {
        self.path = Some(path);
    }

    pub fn set_on_ready(&mut self, callback: ReadyCallback) {
        self.on_ready = Some(callback);
    }

    /// Register objects whose dispatch tables are probed before each
    /// rendered frame.
    pub fn set_probe_targets(&mut self, targets: Vec<*const c_void>) {
        self.probe_targets = targets;
    }

    pub fn notify(&mut self, stage: RenderingStage) {
        match stage {
            RenderingStage::Setup => {
                trace!("rendering setup");
            }
            RenderingStage::BeforeDraw => self.before_draw(),
            RenderingStage::AfterDraw => {
                // Continuous repaint: the map animates and streams
                // tiles, so every composited frame schedules the next.
                self.host.request_redraw();
            }
            RenderingStage::Teardown => {
                debug!("rendering teardown");
                self.target.destroy(&self.gl);
                self.state = FrameState::Empty;
                self.warmup_remaining = 0;
            }
        }
    }

    fn before_draw(&mut self) {
        if self.state == FrameState::Rendering {
            warn!("re-entrant frame notification skipped");
            return;
        }

        let (width, height) = self.desired.get();
        if width <= 0 || height <= 0 {
            trace!(width, height, "no drawable area yet");
            return;
        }

        match self.target.ensure(&self.gl, width, height) {
            Ok(EnsureOutcome::Recreated) => {
                self.issue_handle();
                self.state = FrameState::Allocating;
                self.warmup_remaining = self.options.warmup_frames;
                // The host must composite the new texture once before
                // we draw into it.
                self.host.request_redraw();
                return;
            }
            Ok(EnsureOutcome::Unchanged) => {}
            Err(err) => {
                error!(error = %err, "render target allocation failed; retrying next frame");
                self.state = FrameState::Empty;
                return;
            }
        }

        if self.state == FrameState::Allocating && self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            trace!(remaining = self.warmup_remaining, "warm-up frame skipped");
            self.host.request_redraw();
            return;
        }
        self.state = FrameState::Ready;

        if !self.probe_passes() {
            return;
        }
        self.render_frame();
    }

    fn issue_handle(&self) {
        let Some(on_ready) = self.on_ready.clone() else {
            return;
        };
        let handle = SurfaceHandle {
            texture: self.target.color_texture,
            width: self.target.width as u32,
            height: self.target.height as u32,
            origin: VerticalOrigin::BottomLeft,
        };
        debug!(texture = handle.texture, width = handle.width, height = handle.height,
            "issuing surface handle");
        // Delivered through the event loop, never synchronously from
        // inside a rendering notification.
        self.host.post(Box::new(move || on_ready(handle)));
    }

    fn probe_passes(&self) -> bool {
        if self.options.guard_mode == GuardMode::Off || self.probe_targets.is_empty() {
            return true;
        }
        for &target in &self.probe_targets {
            if looks_valid(target) {
                continue;
            }
            match self.options.guard_mode {
                GuardMode::Off => unreachable!(),
                GuardMode::Warn => {
                    warn!(?target, "dispatch table probe failed; rendering anyway");
                }
                GuardMode::Strict => {
                    warn!(?target, "dispatch table probe failed; frame skipped");
                    return false;
                }
            }
        }
        true
    }

    fn render_frame(&mut self) {
        let view = self.target.view();
        match &mut self.path {
            None => {}
            Some(RenderPath::Queued(submit)) => {
                submit.submit(view.color_texture, view.width, view.height);
            }
            Some(RenderPath::Direct(draw)) => {
                self.state = FrameState::Rendering;

                let prev_framebuffer = self.gl.bound_framebuffer();
                let prev_viewport = self.gl.viewport();
                self.gl.bind_framebuffer(view.framebuffer);
                self.gl.set_viewport([0, 0, view.width, view.height]);

                match catch_unwind(AssertUnwindSafe(|| draw(view))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(error = %err, "render callback failed; frame dropped"),
                    Err(_) => error!("render callback panicked; frame dropped"),
                }

                self.gl.bind_framebuffer(prev_framebuffer);
                self.gl.set_viewport(prev_viewport);
                self.gl.flush();
                self.state = FrameState::Ready;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl_api::testing::FakeGl;
    use crate::surface::TargetView;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestLoop {
        posted: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
        redraws: AtomicU32,
    }

    impl HostLoop for TestLoop {
        fn post(&self, event: Box<dyn FnOnce() + Send>) {
            self.posted.lock().unwrap().push(event);
        }

        fn request_redraw(&self) {
            self.redraws.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl TestLoop {
        fn drain(&self) {
            let events: Vec<_> = std::mem::take(&mut *self.posted.lock().unwrap());
            for event in events {
                event();
            }
        }
    }

    struct Recorder {
        handles: Arc<Mutex<Vec<SurfaceHandle>>>,
        frames: Arc<Mutex<Vec<TargetView>>>,
    }

    fn scheduler_with(
        options: SchedulerOptions,
    ) -> (FrameScheduler<FakeGl>, Arc<TestLoop>, Arc<DesiredSize>, Recorder) {
        let host = Arc::new(TestLoop::default());
        let desired = Arc::new(DesiredSize::default());
        let mut scheduler = FrameScheduler::new(
            FakeGl::default(),
            host.clone() as Arc<dyn HostLoop>,
            desired.clone(),
            options,
        );

        let handles = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(Mutex::new(Vec::new()));
        {
            let handles = Arc::clone(&handles);
            scheduler.set_on_ready(Arc::new(move |handle| handles.lock().unwrap().push(handle)));
        }
        {
            let frames = Arc::clone(&frames);
            scheduler.set_path(RenderPath::Direct(Box::new(move |view| {
                frames.lock().unwrap().push(view);
                Ok(())
            })));
        }
        (scheduler, host, desired, Recorder { handles, frames })
    }

    #[test]
    fn allocation_frame_never_renders() {
        let (mut scheduler, host, desired, rec) = scheduler_with(SchedulerOptions::default());
        desired.set(800, 600);

        scheduler.notify(RenderingStage::BeforeDraw);
        host.drain();
        assert_eq!(rec.handles.lock().unwrap().len(), 1, "handle issued");
        assert!(rec.frames.lock().unwrap().is_empty(), "no render on allocation frame");
        assert!(host.redraws.load(Ordering::SeqCst) >= 1, "follow-up frame requested");

        scheduler.notify(RenderingStage::BeforeDraw);
        let frames = rec.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].width, frames[0].height), (800, 600));
    }

    #[test]
    fn resize_reissues_handle_then_renders_next_frame() {
        let (mut scheduler, host, desired, rec) = scheduler_with(SchedulerOptions::default());
        desired.set(800, 600);
        scheduler.notify(RenderingStage::BeforeDraw);
        scheduler.notify(RenderingStage::BeforeDraw);
        host.drain();
        let first = rec.handles.lock().unwrap()[0];

        desired.set(1024, 768);
        scheduler.notify(RenderingStage::BeforeDraw);
        host.drain();
        {
            let handles = rec.handles.lock().unwrap();
            assert_eq!(handles.len(), 2, "resize re-issues the handle");
            assert_ne!(handles[1].texture, first.texture);
            assert_eq!((handles[1].width, handles[1].height), (1024, 768));
        }
        assert_eq!(rec.frames.lock().unwrap().len(), 1, "resize frame skips rendering");

        scheduler.notify(RenderingStage::BeforeDraw);
        let frames = rec.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[1].width, frames[1].height), (1024, 768));
    }

    #[test]
    fn extra_warmup_frames_are_skipped() {
        let (mut scheduler, _host, desired, rec) = scheduler_with(SchedulerOptions {
            warmup_frames: 2,
            ..SchedulerOptions::default()
        });
        desired.set(320, 240);

        for _ in 0..3 {
            scheduler.notify(RenderingStage::BeforeDraw);
            assert!(rec.frames.lock().unwrap().is_empty());
        }
        scheduler.notify(RenderingStage::BeforeDraw);
        assert_eq!(rec.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn desired_size_updates_are_never_torn() {
        let desired = Arc::new(DesiredSize::default());
        let writer = {
            let desired = Arc::clone(&desired);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    if i % 2 == 0 {
                        desired.set(100, 200);
                    } else {
                        desired.set(300, 400);
                    }
                }
            })
        };
        for _ in 0..10_000 {
            let pair = desired.get();
            assert!(
                matches!(pair, (0, 0) | (100, 200) | (300, 400)),
                "mixed pair observed: {pair:?}"
            );
        }
        writer.join().unwrap();
    }

    #[test]
    fn zero_size_frames_do_nothing() {
        let (mut scheduler, host, _desired, rec) = scheduler_with(SchedulerOptions::default());
        scheduler.notify(RenderingStage::BeforeDraw);
        host.drain();
        assert!(rec.handles.lock().unwrap().is_empty());
        assert!(rec.frames.lock().unwrap().is_empty());
        assert_eq!(scheduler.gl.live_handles(), 0);
    }

    #[test]
    fn after_draw_requests_next_frame() {
        let (mut scheduler, host, _desired, _rec) = scheduler_with(SchedulerOptions::default());
        scheduler.notify(RenderingStage::AfterDraw);
        assert_eq!(host.redraws.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_releases_everything_and_recovers() {
        let (mut scheduler, host, desired, rec) = scheduler_with(SchedulerOptions::default());
        desired.set(800, 600);
        scheduler.notify(RenderingStage::BeforeDraw);
        assert_eq!(scheduler.gl.live_handles(), 3);

        scheduler.notify(RenderingStage::Teardown);
        assert_eq!(scheduler.gl.live_handles(), 0);

        scheduler.notify(RenderingStage::BeforeDraw);
        host.drain();
        assert_eq!(scheduler.gl.live_handles(), 3);
        assert_eq!(rec.handles.lock().unwrap().len(), 2, "fresh handle after teardown");
    }

    #[test]
    fn render_binds_target_then_restores_host_state() {
        let (mut scheduler, _host, desired, rec) = scheduler_with(SchedulerOptions::default());
        desired.set(640, 480);
        scheduler.notify(RenderingStage::BeforeDraw);

        scheduler.gl.bind_framebuffer(42);
        scheduler.gl.set_viewport([1, 2, 3, 4]);
        scheduler.gl.state.borrow_mut().framebuffer_binds.clear();

        scheduler.notify(RenderingStage::BeforeDraw);
        let frames = rec.frames.lock().unwrap();
        let binds = scheduler.gl.state.borrow().framebuffer_binds.clone();
        assert_eq!(binds, vec![frames[0].framebuffer, 42]);
        assert_eq!(scheduler.gl.state.borrow().viewport, [1, 2, 3, 4]);
    }

    #[test]
    fn callback_failure_restores_state_and_next_frame_renders() {
        let (mut scheduler, _host, desired, _rec) = scheduler_with(SchedulerOptions::default());
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = Arc::clone(&calls);
            scheduler.set_path(RenderPath::Direct(Box::new(move |_view| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("style failed to load");
                }
                Ok(())
            })));
        }
        desired.set(400, 300);
        scheduler.notify(RenderingStage::BeforeDraw);
        scheduler.notify(RenderingStage::BeforeDraw);
        scheduler.notify(RenderingStage::BeforeDraw);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "failure did not stop the loop");
    }

    #[test]
    fn callback_panic_is_contained() {
        let (mut scheduler, _host, desired, _rec) = scheduler_with(SchedulerOptions::default());
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = Arc::clone(&calls);
            scheduler.set_path(RenderPath::Direct(Box::new(move |_view| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("renderer blew up");
                }
                Ok(())
            })));
        }
        scheduler.gl.bind_framebuffer(7);
        desired.set(400, 300);
        scheduler.notify(RenderingStage::BeforeDraw);
        scheduler.notify(RenderingStage::BeforeDraw);
        assert_eq!(scheduler.gl.state.borrow().bound_framebuffer, 7, "binding restored after panic");
        scheduler.notify(RenderingStage::BeforeDraw);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "panic did not wedge the scheduler");
    }

    #[test]
    fn strict_guard_skips_frame_on_dead_probe_target() {
        let (mut scheduler, _host, desired, rec) = scheduler_with(SchedulerOptions {
            guard_mode: GuardMode::Strict,
            ..SchedulerOptions::default()
        });
        scheduler.set_probe_targets(vec![std::ptr::null()]);
        desired.set(200, 200);
        scheduler.notify(RenderingStage::BeforeDraw);
        scheduler.notify(RenderingStage::BeforeDraw);
        assert!(rec.frames.lock().unwrap().is_empty(), "strict guard must skip");
    }

    #[test]
    fn warn_guard_renders_despite_dead_probe_target() {
        let (mut scheduler, _host, desired, rec) = scheduler_with(SchedulerOptions {
            guard_mode: GuardMode::Warn,
            ..SchedulerOptions::default()
        });
        scheduler.set_probe_targets(vec![std::ptr::null()]);
        desired.set(200, 200);
        scheduler.notify(RenderingStage::BeforeDraw);
        scheduler.notify(RenderingStage::BeforeDraw);
        assert_eq!(rec.frames.lock().unwrap().len(), 1);
    }

    struct CountingSubmit {
        submitted: Arc<Mutex<Vec<(u32, i32, i32)>>>,
    }

    impl Submit for CountingSubmit {
        fn submit(&self, texture: u32, width: i32, height: i32) {
            self.submitted.lock().unwrap().push((texture, width, height));
        }
    }

    #[test]
    fn queued_path_forwards_texture_and_size() {
        let (mut scheduler, _host, desired, _rec) = scheduler_with(SchedulerOptions::default());
        let submitted = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_path(RenderPath::Queued(Box::new(CountingSubmit {
            submitted: Arc::clone(&submitted),
        })));
        desired.set(512, 256);
        scheduler.notify(RenderingStage::BeforeDraw);
        assert!(submitted.lock().unwrap().is_empty(), "allocation frame not submitted");
        scheduler.notify(RenderingStage::BeforeDraw);
        scheduler.notify(RenderingStage::BeforeDraw);

        let submitted = submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        let texture = scheduler.target.color_texture;
        assert_eq!(submitted[0], (texture, 512, 256));
    }
}
