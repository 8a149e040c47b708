use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

const EVENT_BATCH: usize = 256;
// Bounded so that `stop()` is noticed; the loop never waits on anything else.
const WAIT_TIMEOUT_MS: u16 = 200;

/// Target of readiness events for one registered descriptor.
///
/// Called on the reactor thread: implementations must not block.
pub trait EpollHandler: Send + Sync {
    fn on_event(&self, events: EpollFlags);

    /// Short description for diagnostics.
    fn describe(&self) -> String;
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<RawFd, Arc<dyn EpollHandler>>,
    // Descriptors removed since the current batch was fetched.
    cleanup: HashSet<RawFd>,
}

/// One epoll instance driven by a dedicated OS thread.
pub struct Epoller {
    name: String,
    epoll: Epoll,
    registry: RwLock<Registry>,
    running: Mutex<Option<(RawFd, Arc<dyn EpollHandler>)>>,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Read-only view of a reactor, for operational inspection.
#[derive(Debug, Clone, Serialize)]
pub struct EpollerSnapshot {
    pub name: String,
    pub handlers: Vec<(RawFd, String)>,
    pub running: Option<(RawFd, String)>,
}

impl Epoller {
    /// Creates the epoll instance and starts its thread.
    pub fn start(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(std::io::Error::from)?;
        let this = Arc::new(Self {
            name: name.clone(),
            epoll,
            registry: RwLock::new(Registry::default()),
            running: Mutex::new(None),
            stopping: AtomicBool::new(false),
            thread: Mutex::new(None),
        });
        let worker = this.clone();
        let handle = std::thread::Builder::new()
            .name(format!("epoller-{}", name))
            .spawn(move || worker.run())?;
        *lock(&this.thread) = Some(handle);
        debug!("epoller {} started", name);
        Ok(this)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `fd` with `interest`. Registering a descriptor twice is a
    /// programming error and fails.
    pub fn add_fd(
        &self,
        fd: BorrowedFd<'_>,
        interest: EpollFlags,
        handler: Arc<dyn EpollHandler>,
    ) -> Result<()> {
        let raw = fd.as_raw_fd();
        let mut reg = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if reg.handlers.contains_key(&raw) {
            error!("{}: fd {} registered twice", self.name, raw);
            return Err(Error::protocol(format!("fd {} already registered", raw)));
        }
        if reg.cleanup.remove(&raw) {
            trace!("{}: fd {} reused within one batch", self.name, raw);
        }
        if let Err(e) = self.epoll.add(fd, EpollEvent::new(interest, raw as u64)) {
            error!("{}: epoll add fd {} failed: {}", self.name, raw, e);
            return Err(std::io::Error::from(e).into());
        }
        reg.handlers.insert(raw, handler);
        trace!("{}: added fd {} {:?}", self.name, raw, interest);
        Ok(())
    }

    /// Changes the interest of a registered descriptor; re-arms `ONESHOT`.
    pub fn modify_fd(&self, fd: BorrowedFd<'_>, interest: EpollFlags) -> Result<()> {
        let raw = fd.as_raw_fd();
        let reg = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if !reg.handlers.contains_key(&raw) {
            return Err(Error::protocol(format!("fd {} is not registered", raw)));
        }
        let mut event = EpollEvent::new(interest, raw as u64);
        self.epoll
            .modify(fd, &mut event)
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Unregisters `fd`. Must happen before the descriptor is closed.
    /// Events for it still queued in the current batch are dropped.
    pub fn remove_fd(&self, fd: BorrowedFd<'_>) {
        let raw = fd.as_raw_fd();
        let mut reg = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if reg.handlers.remove(&raw).is_none() {
            debug!("{}: removing unregistered fd {}", self.name, raw);
            return;
        }
        if let Err(e) = self.epoll.delete(fd) {
            debug!("{}: epoll delete fd {}: {}", self.name, raw, e);
        }
        reg.cleanup.insert(raw);
        trace!("{}: removed fd {}", self.name, raw);
    }

    pub fn len(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> EpollerSnapshot {
        let mut handlers: Vec<_> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .iter()
            .map(|(fd, h)| (*fd, h.describe()))
            .collect();
        handlers.sort_by_key(|(fd, _)| *fd);
        let running = lock(&self.running)
            .as_ref()
            .map(|(fd, h)| (*fd, h.describe()));
        EpollerSnapshot {
            name: self.name.clone(),
            handlers,
            running,
        }
    }

    /// Asks the thread to exit and waits for it.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("{}: reactor thread panicked", self.name);
            }
        }
        debug!("epoller {} stopped", self.name);
    }

    fn run(self: Arc<Self>) {
        let mut events = vec![EpollEvent::empty(); EVENT_BATCH];
        while !self.stopping.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("{}: epoll_wait failed: {}", self.name, e);
                    break;
                }
            };
            for ev in &events[..n] {
                let _ = self.dispatch(ev.data() as RawFd, ev.events());
            }
            if n > 0 {
                self.registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .cleanup
                    .clear();
            }
        }
    }

    fn dispatch(&self, fd: RawFd, events: EpollFlags) -> Dispatch {
        let handler = {
            let reg = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            match reg.handlers.get(&fd) {
                Some(h) => h.clone(),
                None if reg.cleanup.contains(&fd) => return Dispatch::Stale,
                None => {
                    warn!(
                        "{}: event {:?} for unknown fd {}, not removed in this batch",
                        self.name, events, fd
                    );
                    return Dispatch::Unknown;
                }
            }
        };
        *lock(&self.running) = Some((fd, handler.clone()));
        handler.on_event(events);
        *lock(&self.running) = None;
        Dispatch::Handled
    }
}

/// What became of one fetched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Handled,
    // Removed earlier in the same batch.
    Stale,
    Unknown,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The reactor pair a socket registers with: one for read readiness
/// (edge-triggered), one for write readiness (one-shot).
#[derive(Clone)]
pub struct Reactors {
    pub read: Arc<Epoller>,
    pub write: Arc<Epoller>,
}

impl Reactors {
    pub fn start(prefix: &str) -> Result<Self> {
        Ok(Self {
            read: Epoller::start(format!("{}-read", prefix))?,
            write: Epoller::start(format!("{}-write", prefix))?,
        })
    }

    /// Process-wide pair, started on first use.
    pub fn global() -> Result<Self> {
        static GLOBAL: Mutex<Option<Reactors>> = Mutex::new(None);
        let mut global = lock(&GLOBAL);
        if let Some(r) = global.as_ref() {
            return Ok(r.clone());
        }
        let r = Reactors::start("global")?;
        *global = Some(r.clone());
        Ok(r)
    }

    pub fn snapshot(&self) -> [EpollerSnapshot; 2] {
        [self.read.snapshot(), self.write.snapshot()]
    }

    pub fn stop(&self) {
        self.read.stop();
        self.write.stop();
    }
}
