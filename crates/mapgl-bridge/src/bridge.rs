//! Host-facing facade tying configuration, the frame scheduler, and the
//! render path together.
//!
//! The bridge is owned by the host's render thread. Everything the rest
//! of the application touches goes through the `Send`-able side
//! handles: [`SizeSetter`] for resize and [`RedrawSignal`] for the map
//! engine's repaint observers.

use std::cell::RefCell;
use std::os::raw::c_void;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, warn};

use crate::config::{BridgeConfig, RenderPathChoice};
use crate::gl_api::{GlApi, LiveGl};
use crate::scheduler::{DesiredSize, FrameScheduler, RenderPath, RenderingStage, SchedulerOptions, Submit};
use crate::surface::SurfaceHandle;
use crate::RendererFactory;

/// The host toolkit's event loop, as seen by the bridge.
pub trait HostLoop: Send + Sync {
    /// Run `event` on the host's event loop thread.
    fn post(&self, event: Box<dyn FnOnce() + Send>);
    /// Schedule another host frame.
    fn request_redraw(&self);
}

/// Records the desired surface size; usable from any thread, performs
/// no GPU work. The scheduler applies it on the next frame.
#[derive(Clone)]
pub struct SizeSetter {
    desired: Arc<DesiredSize>,
}

impl SizeSetter {
    pub fn set(&self, width: u32, height: u32) {
        self.desired.set(width, height);
    }
}

/// Repaint trigger for the map engine's observer glue. The engine calls
/// this on style load, tile arrival, and animation ticks; the bridge
/// does not interpret which.
#[derive(Clone)]
pub struct RedrawSignal {
    host: Arc<dyn HostLoop>,
}

impl RedrawSignal {
    pub fn redraw(&self) {
        self.host.request_redraw();
    }
}

impl Submit for crate::isolated::IsolatedWorker {
    fn submit(&self, texture: u32, width: i32, height: i32) {
        crate::isolated::IsolatedWorker::submit(self, texture, width, height);
    }
}

type GlLoader<G> = Box<dyn FnMut() -> Result<G>>;
type ReadyCallback = Arc<dyn Fn(SurfaceHandle) + Send + Sync>;

struct Inner<G: GlApi> {
    config: BridgeConfig,
    host: Arc<dyn HostLoop>,
    desired: Arc<DesiredSize>,
    loader: GlLoader<G>,
    scheduler: Option<FrameScheduler<G>>,
    factory: Option<RendererFactory>,
    on_ready: Option<ReadyCallback>,
    probe_targets: Vec<*const c_void>,
    gl_failure_logged: bool,
    #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
    path_failure_logged: bool,
}

/// The GPU Surface Bridge. Lives on the host render thread; cheap to
/// clone (shared state).
pub struct SurfaceBridge<G: GlApi = LiveGl> {
    inner: Rc<RefCell<Inner<G>>>,
}

impl<G: GlApi> Clone for SurfaceBridge<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl SurfaceBridge<LiveGl> {
    pub fn new(host: Arc<dyn HostLoop>, config: BridgeConfig) -> Self {
        Self::with_loader(host, config, Box::new(LiveGl::load))
    }
}

impl<G: GlApi> SurfaceBridge<G> {
    pub(crate) fn with_loader(
        host: Arc<dyn HostLoop>,
        config: BridgeConfig,
        loader: GlLoader<G>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                host,
                desired: Arc::new(DesiredSize::default()),
                loader,
                scheduler: None,
                factory: None,
                on_ready: None,
                probe_targets: Vec::new(),
                gl_failure_logged: false,
                path_failure_logged: false,
            })),
        }
    }

    /// Install the map renderer constructor. Invoked once, lazily, on
    /// the thread that will render (host thread on the same-thread
    /// path, the worker thread on the isolated path).
    pub fn set_renderer(&self, factory: RendererFactory) {
        self.inner.borrow_mut().factory = Some(factory);
    }

    /// Register the recipient of surface handles. Delivered through the
    /// host event loop after every (re)allocation.
    pub fn on_surface_ready(&self, callback: impl Fn(SurfaceHandle) + Send + Sync + 'static) {
        let callback: ReadyCallback = Arc::new(callback);
        let mut inner = self.inner.borrow_mut();
        if let Some(scheduler) = &mut inner.scheduler {
            scheduler.set_on_ready(Arc::clone(&callback));
        }
        inner.on_ready = Some(callback);
    }

    /// Register objects probed by the liveness guard before each
    /// rendered frame.
    pub fn probe_targets(&self, targets: Vec<*const c_void>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(scheduler) = &mut inner.scheduler {
            scheduler.set_probe_targets(targets.clone());
        }
        inner.probe_targets = targets;
    }

    pub fn size_setter(&self) -> SizeSetter {
        SizeSetter {
            desired: Arc::clone(&self.inner.borrow().desired),
        }
    }

    pub fn redraw_signal(&self) -> RedrawSignal {
        RedrawSignal {
            host: Arc::clone(&self.inner.borrow().host),
        }
    }

    /// Per-frame entry point, called from the host's rendering
    /// notifications. A genuinely re-entrant notification degrades to a
    /// logged skip.
    pub fn notify(&self, stage: RenderingStage) {
        let Ok(mut inner) = self.inner.try_borrow_mut() else {
            warn!(?stage, "re-entrant rendering notification skipped");
            return;
        };
        inner.notify(stage);
    }
}

impl<G: GlApi> Inner<G> {
    fn notify(&mut self, stage: RenderingStage) {
        if matches!(stage, RenderingStage::Setup | RenderingStage::BeforeDraw) {
            self.ensure_scheduler();
            // The renderer may be registered after the first frame;
            // install the path as soon as both sides exist.
            if self.scheduler.is_some() && self.factory.is_some() {
                let path = self.build_path();
                if let (Some(scheduler), Some(path)) = (&mut self.scheduler, path) {
                    scheduler.set_path(path);
                }
            }
        }
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.notify(stage);
        }
    }

    /// Build the scheduler on the first frame with a usable GL. Entry
    /// points can only be resolved once the host's context is current,
    /// which is not the case at construction time.
    fn ensure_scheduler(&mut self) {
        if self.scheduler.is_some() {
            return;
        }
        let gl = match (self.loader)() {
            Ok(gl) => gl,
            Err(err) => {
                if !self.gl_failure_logged {
                    error!(error = %err, "GL entry points unavailable; surface stays empty");
                    self.gl_failure_logged = true;
                }
                return;
            }
        };
        self.gl_failure_logged = false;

        let mut scheduler = FrameScheduler::new(
            gl,
            Arc::clone(&self.host),
            Arc::clone(&self.desired),
            SchedulerOptions {
                warmup_frames: self.config.warmup_frames,
                guard_mode: self.config.guard_mode,
            },
        );
        if let Some(on_ready) = &self.on_ready {
            scheduler.set_on_ready(Arc::clone(on_ready));
        }
        scheduler.set_probe_targets(self.probe_targets.clone());
        self.scheduler = Some(scheduler);
    }

    /// Resolve the render path once. A failure leaves the path unset:
    /// frames keep allocating and issuing handles, rendering stays off.
    fn build_path(&mut self) -> Option<RenderPath> {
        let factory = self.factory.take()?;
        match self.config.render_path() {
            RenderPathChoice::SameThread => {
                debug!("render path: same-thread");
                match factory() {
                    Ok(draw) => Some(RenderPath::Direct(draw)),
                    Err(err) => {
                        error!(error = %err, "map renderer construction failed");
                        None
                    }
                }
            }
            RenderPathChoice::Isolated => self.spawn_isolated(factory),
        }
    }

    #[cfg(target_os = "windows")]
    fn spawn_isolated(&mut self, factory: RendererFactory) -> Option<RenderPath> {
        use crate::isolated::wgl::{capture_current, WglBackend, WglHost};
        use crate::isolated::IsolatedWorker;

        debug!("render path: isolated worker context");
        let spawn = || -> Result<IsolatedWorker> {
            let host = WglHost {
                context: capture_current()?,
                debug_clear: self.config.debug_clear,
            };
            IsolatedWorker::spawn::<WglBackend>(host, factory, self.config.iso_ready_timeout)
        };
        match spawn() {
            Ok(worker) => Some(RenderPath::Queued(Box::new(worker))),
            Err(err) => {
                if !self.path_failure_logged {
                    error!(error = %err, "context isolation unavailable; map rendering disabled");
                    self.path_failure_logged = true;
                }
                None
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn spawn_isolated(&mut self, _factory: RendererFactory) -> Option<RenderPath> {
        // render_path() never selects isolation off Windows.
        unreachable!("isolated path selected on a platform without it")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl_api::testing::FakeGl;
    use crate::RenderFn;
    use anyhow::bail;
    use std::sync::atomic::{AtomicU32, Ordering};
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

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fake_bridge(config: BridgeConfig) -> (SurfaceBridge<FakeGl>, Arc<TestLoop>) {
        let host = Arc::new(TestLoop::default());
        let bridge = SurfaceBridge::with_loader(
            host.clone() as Arc<dyn HostLoop>,
            config,
            Box::new(|| Ok(FakeGl::default())),
        );
        (bridge, host)
    }

    fn same_thread_config() -> BridgeConfig {
        BridgeConfig {
            isolate_context: false,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn renderer_factory_runs_lazily_on_first_usable_frame() {
        let (bridge, _host) = fake_bridge(same_thread_config());
        let built = Arc::new(AtomicU32::new(0));
        {
            let built = Arc::clone(&built);
            bridge.set_renderer(Box::new(move || {
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(|_view| Ok(())) as RenderFn)
            }));
        }
        assert_eq!(built.load(Ordering::SeqCst), 0, "not built at registration");
        bridge.notify(RenderingStage::Setup);
        assert_eq!(built.load(Ordering::SeqCst), 1, "built on first notification");
        bridge.notify(RenderingStage::BeforeDraw);
        assert_eq!(built.load(Ordering::SeqCst), 1, "built exactly once");
    }

    #[test]
    fn surface_handles_arrive_through_the_event_loop() {
        let (bridge, host) = fake_bridge(same_thread_config());
        let handles = Arc::new(Mutex::new(Vec::new()));
        {
            let handles = Arc::clone(&handles);
            bridge.on_surface_ready(move |handle| handles.lock().unwrap().push(handle));
        }
        bridge.size_setter().set(800, 600);
        bridge.notify(RenderingStage::BeforeDraw);
        assert!(handles.lock().unwrap().is_empty(), "not delivered synchronously");
        host.drain();
        let handles = handles.lock().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!((handles[0].width, handles[0].height), (800, 600));
    }

    #[test]
    fn size_setter_works_from_another_thread() {
        let (bridge, host) = fake_bridge(same_thread_config());
        let handles = Arc::new(Mutex::new(Vec::new()));
        {
            let handles = Arc::clone(&handles);
            bridge.on_surface_ready(move |handle| handles.lock().unwrap().push(handle));
        }
        let setter = bridge.size_setter();
        std::thread::spawn(move || setter.set(640, 480))
            .join()
            .unwrap();
        bridge.notify(RenderingStage::BeforeDraw);
        host.drain();
        assert_eq!(handles.lock().unwrap().len(), 1);
    }

    #[test]
    fn reentrant_notification_is_skipped() {
        init_tracing();
        let (bridge, _host) = fake_bridge(same_thread_config());
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = Arc::clone(&calls);
            let reenter = bridge.clone();
            // Not Send, but the same-thread path never moves the
            // callback off the host thread.
            struct NotSendable<T>(T);
            unsafe impl<T> Send for NotSendable<T> {}
            let reenter = NotSendable(reenter);
            bridge.set_renderer(Box::new(move || {
                Ok(Box::new(move |_view| {
                    // Capture the whole wrapper, not just `.0`, so the
                    // `Send` impl on `NotSendable` applies.
                    let reenter = &reenter;
                    calls.fetch_add(1, Ordering::SeqCst);
                    reenter.0.notify(RenderingStage::BeforeDraw);
                    Ok(())
                }) as RenderFn)
            }));
        }
        bridge.size_setter().set(400, 300);
        bridge.notify(RenderingStage::BeforeDraw);
        bridge.notify(RenderingStage::BeforeDraw);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "nested notification must not render");
    }

    #[test]
    fn gl_load_failure_keeps_frames_inert() {
        let host = Arc::new(TestLoop::default());
        let bridge: SurfaceBridge<FakeGl> = SurfaceBridge::with_loader(
            host.clone() as Arc<dyn HostLoop>,
            same_thread_config(),
            Box::new(|| bail!("no context current")),
        );
        bridge.size_setter().set(800, 600);
        for _ in 0..3 {
            bridge.notify(RenderingStage::BeforeDraw);
        }
        bridge.notify(RenderingStage::Teardown);
        host.drain();
        assert!(host.posted.lock().unwrap().is_empty());
    }

    #[test]
    fn renderer_construction_failure_still_issues_handles() {
        let (bridge, host) = fake_bridge(same_thread_config());
        bridge.set_renderer(Box::new(|| bail!("style URL unreachable")));
        let handles = Arc::new(Mutex::new(Vec::new()));
        {
            let handles = Arc::clone(&handles);
            bridge.on_surface_ready(move |handle| handles.lock().unwrap().push(handle));
        }
        bridge.size_setter().set(800, 600);
        bridge.notify(RenderingStage::BeforeDraw);
        bridge.notify(RenderingStage::BeforeDraw);
        host.drain();
        assert_eq!(handles.lock().unwrap().len(), 1, "surface still available to the host");
    }

    #[test]
    fn redraw_signal_forwards_to_host() {
        let (bridge, host) = fake_bridge(same_thread_config());
        let signal = bridge.redraw_signal();
        std::thread::spawn(move || signal.redraw()).join().unwrap();
        assert_eq!(host.redraws.load(Ordering::SeqCst), 1);
    }
}
