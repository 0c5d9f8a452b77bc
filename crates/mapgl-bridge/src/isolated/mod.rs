//! Context isolation: a dedicated worker thread owning a second GL
//! context that shares the host context's object namespace.
//!
//! Some platforms forbid reentrant use of one native context by two
//! logical renderers. There, the map renderer lives on this worker: the
//! host thread is a fire-and-forget producer of [`RenderRequest`]s and
//! the worker renders into the shared color texture through its own
//! framebuffer.
//!
//! The queue is a single coalescing slot: the producer overwrites the
//! pending request, the worker only ever renders the highest sequence
//! number it has observed. No request is waited on individually; only
//! the latest one is guaranteed to eventually render.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, trace, warn};

use crate::gl_api::GlApi;
use crate::RenderFn;
use crate::RendererFactory;

#[cfg(target_os = "windows")]
pub mod wgl;

/// One frame's worth of work for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    /// Shared color texture to attach and render into.
    pub texture: u32,
    pub width: i32,
    pub height: i32,
    /// Monotonically increasing per slot; assigned at submit time.
    pub seq: u64,
}

#[derive(Default)]
struct SlotState {
    latest: Option<RenderRequest>,
    submitted_seq: u64,
    done_seq: u64,
    stop: bool,
}

/// Single-slot coalescing queue between the host thread and the worker.
pub struct RequestSlot {
    state: Mutex<SlotState>,
    wake: Condvar,
}

impl RequestSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            wake: Condvar::new(),
        }
    }

    /// Overwrite the pending request and wake the worker. Returns the
    /// assigned sequence number.
    pub fn submit(&self, texture: u32, width: i32, height: i32) -> u64 {
        let mut s = self.state.lock().expect("request slot poisoned");
        s.submitted_seq += 1;
        let seq = s.submitted_seq;
        s.latest = Some(RenderRequest {
            texture,
            width,
            height,
            seq,
        });
        self.wake.notify_one();
        seq
    }

    /// Block until there is a request newer than the last completed
    /// one, or until stopped. Worker-side only.
    pub fn next(&self) -> Option<RenderRequest> {
        let mut s = self.state.lock().expect("request slot poisoned");
        loop {
            if s.stop {
                return None;
            }
            if let Some(req) = s.latest {
                if req.seq > s.done_seq {
                    return Some(req);
                }
            }
            s = self.wake.wait(s).expect("request slot poisoned");
        }
    }

    /// Record `seq` as completed. Monotonic: never moves backwards.
    pub fn complete(&self, seq: u64) {
        let mut s = self.state.lock().expect("request slot poisoned");
        s.done_seq = s.done_seq.max(seq);
    }

    pub fn completed_seq(&self) -> u64 {
        self.state.lock().expect("request slot poisoned").done_seq
    }

    pub fn submitted_seq(&self) -> u64 {
        self.state.lock().expect("request slot poisoned").submitted_seq
    }

    /// Set the stop flag and wake the worker. Cooperative: a render in
    /// progress finishes first.
    pub fn stop(&self) {
        let mut s = self.state.lock().expect("request slot poisoned");
        s.stop = true;
        self.wake.notify_all();
    }
}

impl Default for RequestSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-side framebuffer wrapping the host-allocated color texture.
///
/// The depth/stencil attachment is cached per size. The color texture
/// is **not** cached: the host recycles texture names across
/// reallocations, so a remembered name can compare equal to the
/// incoming one while referring to an orphaned object. It is
/// re-attached on every request.
#[derive(Default)]
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(crate) struct WorkerTarget {
    framebuffer: u32,
    depth_stencil: u32,
    size: (i32, i32),
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
impl WorkerTarget {
    pub(crate) fn framebuffer(&self) -> u32 {
        self.framebuffer
    }

    /// Bind the worker framebuffer, attach the request's texture, and
    /// set the viewport.
    pub(crate) fn bind(&mut self, gl: &impl GlApi, request: &RenderRequest) -> Result<()> {
        if self.framebuffer == 0 {
            self.framebuffer = gl.gen_framebuffer();
        }
        gl.bind_framebuffer(self.framebuffer);

        if self.size != (request.width, request.height) {
            if self.depth_stencil != 0 {
                gl.delete_renderbuffer(self.depth_stencil);
            }
            self.depth_stencil = gl.gen_renderbuffer();
            gl.depth_stencil_storage(self.depth_stencil, request.width, request.height);
            gl.attach_depth_stencil(self.depth_stencil);
            self.size = (request.width, request.height);
            debug!(
                width = request.width,
                height = request.height,
                "worker depth/stencil resized"
            );
        }

        gl.attach_color_texture(request.texture);

        if !gl.framebuffer_complete() {
            self.size = (0, 0);
            bail!("worker framebuffer incomplete for texture {}", request.texture);
        }
        gl.set_viewport([0, 0, request.width, request.height]);
        Ok(())
    }

    pub(crate) fn destroy(&mut self, gl: &impl GlApi) {
        if self.framebuffer != 0 {
            gl.bind_framebuffer(0);
            gl.delete_framebuffer(self.framebuffer);
            self.framebuffer = 0;
        }
        if self.depth_stencil != 0 {
            gl.delete_renderbuffer(self.depth_stencil);
            self.depth_stencil = 0;
        }
        self.size = (0, 0);
    }
}

/// Platform half of the isolated worker: owns the shared context and
/// performs one render per request. Constructed and dropped on the
/// worker thread only.
pub trait IsolatedBackend: Sized {
    /// Host context handles captured on the caller thread.
    type Host: Send + 'static;

    /// Create the shared context. Runs on the worker thread.
    fn create(host: Self::Host) -> Result<Self>;

    /// Render one request through `draw`. An error drops the frame;
    /// the worker loop continues.
    fn render(&mut self, request: &RenderRequest, draw: &mut RenderFn) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed,
}

type ReadySignal = Arc<(Mutex<Readiness>, Condvar)>;

/// Handle to the isolated render thread. Dropping it stops and joins
/// the worker; all worker-context GPU objects are destroyed on the
/// worker's own thread.
pub struct IsolatedWorker {
    slot: Arc<RequestSlot>,
    thread: Option<JoinHandle<()>>,
}

impl IsolatedWorker {
    /// Spawn the worker and wait (bounded) for its context to come up.
    ///
    /// On timeout the worker is told to stop and detached; isolation is
    /// reported unavailable rather than blocking the host thread.
    pub fn spawn<B: IsolatedBackend + 'static>(
        host: B::Host,
        factory: RendererFactory,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let slot = Arc::new(RequestSlot::new());
        let ready: ReadySignal = Arc::new((Mutex::new(Readiness::Pending), Condvar::new()));

        let thread = {
            let slot = Arc::clone(&slot);
            let ready = Arc::clone(&ready);
            std::thread::Builder::new()
                .name("mapgl-isolated-render".into())
                .spawn(move || worker_main::<B>(host, factory, slot, ready))
                .context("failed to spawn isolated render thread")?
        };

        let (lock, cond) = &*ready;
        let (state, timeout) = cond
            .wait_timeout_while(
                lock.lock().expect("readiness lock poisoned"),
                ready_timeout,
                |r| *r == Readiness::Pending,
            )
            .expect("readiness lock poisoned");
        let state = *state;

        match state {
            Readiness::Ready => Ok(Self {
                slot,
                thread: Some(thread),
            }),
            Readiness::Failed => {
                // The worker is already exiting; reclaim it.
                let _ = thread.join();
                bail!("isolated context construction failed");
            }
            Readiness::Pending => {
                debug_assert!(timeout.timed_out());
                warn!(?ready_timeout, "isolated context not ready in time; abandoning");
                // Detach: the worker observes the stop flag once its
                // construction finishes and cleans up on its own thread.
                slot.stop();
                bail!("isolated context readiness timed out");
            }
        }
    }

    /// Fire-and-forget: enqueue the latest frame, superseding any
    /// pending one.
    pub fn submit(&self, texture: u32, width: i32, height: i32) {
        let seq = self.slot.submit(texture, width, height);
        trace!(seq, texture, width, height, "isolated render submitted");
    }

    pub fn completed_seq(&self) -> u64 {
        self.slot.completed_seq()
    }
}

impl Drop for IsolatedWorker {
    fn drop(&mut self) {
        self.slot.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("isolated render thread panicked during shutdown");
            }
        }
    }
}

fn worker_main<B: IsolatedBackend>(
    host: B::Host,
    factory: RendererFactory,
    slot: Arc<RequestSlot>,
    ready: ReadySignal,
) {
    let signal = |state: Readiness| {
        let (lock, cond) = &*ready;
        *lock.lock().expect("readiness lock poisoned") = state;
        cond.notify_all();
    };

    let mut backend = match B::create(host) {
        Ok(backend) => backend,
        Err(err) => {
            error!(error = %err, "isolated context creation failed");
            signal(Readiness::Failed);
            return;
        }
    };
    // The map renderer is constructed here so every object it owns
    // lives and dies on this thread.
    let mut draw = match factory() {
        Ok(draw) => draw,
        Err(err) => {
            error!(error = %err, "isolated renderer construction failed");
            signal(Readiness::Failed);
            return;
        }
    };
    signal(Readiness::Ready);
    debug!("isolated render thread ready");

    while let Some(request) = slot.next() {
        trace!(seq = request.seq, "isolated render begin");
        match catch_unwind(AssertUnwindSafe(|| backend.render(&request, &mut draw))) {
            Ok(Ok(())) => trace!(seq = request.seq, "isolated render end"),
            Ok(Err(err)) => error!(seq = request.seq, error = %err, "render failed; frame dropped"),
            Err(_) => error!(seq = request.seq, "render panicked; frame dropped"),
        }
        // Completed even on failure: a request is retired, never
        // retried, so one bad frame cannot wedge the loop.
        slot.complete(request.seq);
    }
    debug!("isolated render thread stopping");
    // `backend` and `draw` drop here, on the worker thread.
}
