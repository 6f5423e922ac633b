//! The single-threaded notification loop.

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::backend::{GraphEngine, NotificationSource, RegistryService};
use crate::error::DispatchError;
use crate::lifecycle::PipelineManager;
use crate::notification::{Notification, RawNotification, PCM_INTERFACE};
use crate::poll::PollSet;
use crate::registry::WorkerRegistry;

/// Cooperative cancellation flag, checked once per loop iteration.
///
/// With a wake pipe, a request also makes the loop's pending wait return, so
/// a request that lands between the check and the wait is not lost.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
    wake: Option<Arc<WakePipe>>,
}

#[derive(Debug)]
struct WakePipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakePipe {
    fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 fills in.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are open and unowned.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    fn clear(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a local buffer of the given length.
            let read = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if read <= 0 {
                break;
            }
        }
    }
}

/// Writes one wake byte to `fd`. Async-signal-safe.
///
/// A full pipe already wakes the reader, so a failed write is ignored.
fn notify_wake_pipe(fd: RawFd) {
    let byte = 1u8;
    // SAFETY: writes one byte from a live local.
    unsafe {
        libc::write(fd, (&byte as *const u8).cast(), 1);
    }
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token whose requests interrupt a blocked dispatch loop.
    pub fn with_wake_pipe() -> io::Result<Self> {
        Ok(Self {
            requested: Arc::default(),
            wake: Some(Arc::new(WakePipe::new()?)),
        })
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(fd) = self.notify_fd() {
            notify_wake_pipe(fd);
        }
    }

    /// Read end of the wake pipe, registered by the dispatch loop.
    pub fn wake_fd(&self) -> Option<RawFd> {
        self.wake.as_ref().map(|pipe| pipe.read.as_raw_fd())
    }

    fn notify_fd(&self) -> Option<RawFd> {
        self.wake.as_ref().map(|pipe| pipe.write.as_raw_fd())
    }

    fn clear_wake(&self) {
        if let Some(pipe) = &self.wake {
            pipe.clear();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Everything the handlers mutate: workers, the services that act on them,
/// and the shutdown flag.
pub struct BridgeContext<R, E> {
    pub workers: WorkerRegistry,
    pub pipelines: PipelineManager<R, E>,
    shutdown: ShutdownToken,
}

impl<R: RegistryService, E: GraphEngine> BridgeContext<R, E> {
    pub fn new(pipelines: PipelineManager<R, E>, shutdown: ShutdownToken) -> Self {
        Self {
            workers: WorkerRegistry::new(),
            pipelines,
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> &ShutdownToken {
        &self.shutdown
    }

    /// Seeds the registry with the devices the service already knows about.
    ///
    /// A failed listing is not fatal: the service may simply have no PCMs yet.
    pub fn seed(&mut self) -> usize {
        match self.pipelines.registry_service_mut().enumerate_devices() {
            Ok(devices) => {
                let count = devices.len();
                for descriptor in devices {
                    self.workers.upsert(descriptor, &mut self.pipelines);
                }
                count
            }
            Err(err) => {
                warn!("Couldn't get BlueALSA PCM list: {err}");
                0
            }
        }
    }

    /// Decodes and handles one raw notification. Malformed input is logged and dropped.
    pub fn handle_raw(&mut self, raw: &RawNotification) {
        match Notification::decode(raw) {
            Ok(notification) => self.handle(notification),
            Err(err) => {
                error!(path = %raw.path, member = %raw.member, "discarding notification: {err}");
            }
        }
    }

    pub fn handle(&mut self, notification: Notification) {
        match notification {
            Notification::DeviceAdded(descriptor) => {
                self.workers.upsert(descriptor, &mut self.pipelines);
            }
            Notification::DeviceRemoved(device) => {
                if !self.workers.remove(&device, &mut self.pipelines) {
                    debug!(device = %device, "removal of unknown PCM ignored");
                }
            }
            Notification::PropertyChanged {
                device,
                interface,
                changes,
            } => {
                if interface != PCM_INTERFACE {
                    trace!(device = %device, %interface, "ignoring foreign property change");
                    return;
                }
                if !self.workers.update(&device, &changes, &mut self.pipelines) {
                    debug!(device = %device, "property change for unknown PCM ignored");
                }
            }
        }
    }

    /// Tears down every worker.
    pub fn teardown(&mut self) {
        self.workers.teardown_all(&mut self.pipelines);
    }
}

/// Waits on the transport and feeds every notification into a [`BridgeContext`].
pub struct DispatchLoop<S> {
    source: S,
    max_descriptors: usize,
    state: LoopState,
}

impl<S: NotificationSource> DispatchLoop<S> {
    pub fn new(source: S, max_descriptors: usize) -> Self {
        Self {
            source,
            max_descriptors,
            state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Runs until shutdown is requested or the transport fails.
    ///
    /// Every worker is torn down before this returns, on both paths.
    pub fn run<R, E>(&mut self, ctx: &mut BridgeContext<R, E>) -> Result<(), DispatchError>
    where
        R: RegistryService,
        E: GraphEngine,
    {
        debug!("Starting main loop");
        let result = self.run_until_shutdown(ctx);
        self.state = LoopState::ShuttingDown;
        ctx.teardown();
        self.state = LoopState::Terminated;
        match &result {
            Ok(()) => info!("main loop terminated"),
            Err(err) => error!("main loop aborted: {err}"),
        }
        result
    }

    fn run_until_shutdown<R, E>(&mut self, ctx: &mut BridgeContext<R, E>) -> Result<(), DispatchError>
    where
        R: RegistryService,
        E: GraphEngine,
    {
        loop {
            if ctx.shutdown.is_requested() {
                return Ok(());
            }

            self.drain(ctx);

            let wake_fd = ctx.shutdown.wake_fd();
            let mut set =
                PollSet::with_capacity(self.max_descriptors + usize::from(wake_fd.is_some()));
            if let Some(fd) = wake_fd {
                set.register(fd)?;
            }
            self.source.poll_fds(&mut set)?;

            match self.source.wait(&mut set) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {
                    trace!("wait interrupted");
                    continue;
                }
                Err(err) => return Err(DispatchError::Poll(err)),
            }
            if wake_fd.is_some_and(|fd| set.is_ready(fd)) {
                ctx.shutdown.clear_wake();
            }

            self.source.dispatch(&set)?;
            self.drain(ctx);
        }
    }

    /// Handles every buffered notification, including ones buffered while a
    /// handler was running.
    pub fn drain<R, E>(&mut self, ctx: &mut BridgeContext<R, E>) -> usize
    where
        R: RegistryService,
        E: GraphEngine,
    {
        let mut handled = 0;
        while let Some(raw) = self.source.next_notification() {
            ctx.handle_raw(&raw);
            handled += 1;
        }
        handled
    }
}
