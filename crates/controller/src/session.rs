//! Attaching to a target process and owning what that attachment creates.

use crate::remote::CaptureInterface;
use crate::server::PipeServer;
use crossbeam_channel::Receiver;
use framehook_core::channel::Transport;
use framehook_core::protocol::{Envelope, ProtocolError};
use framehook_core::{log_debug, log_error, log_info, log_warn, CaptureConfig, CaptureError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Raw top-level window handle.
pub type WindowHandle = isize;

/// Loads the agent module into another process.
pub trait Injector: Send + Sync {
    fn inject(&self, pid: u32, module: &Path) -> anyhow::Result<()>;
}

pub trait WindowControl: Send + Sync {
    fn main_window(&self, pid: u32) -> Option<WindowHandle>;
    fn is_minimized(&self, window: WindowHandle) -> bool;
    fn restore(&self, window: WindowHandle) -> bool;
    fn bring_to_front(&self, window: WindowHandle) -> bool;
}

pub trait ProcessWatch: Send + Sync {
    /// Runs `callback` once, on any thread, after `pid` exits.
    fn on_exit(&self, pid: u32, callback: Box<dyn FnOnce() + Send>) -> anyhow::Result<()>;
}

/// Channel end created before the agent exists.
pub trait ChannelListener: Send + Sync {
    /// Blocks until the agent joins.
    fn accept(&self) -> Result<Arc<dyn Transport>, ProtocolError>;

    /// Unblocks a pending `accept`, which then fails.
    fn cancel(&self);
}

pub trait ChannelHost: Send + Sync {
    fn listen(&self, pid: u32) -> Result<Arc<dyn ChannelListener>, ProtocolError>;
}

#[derive(Debug, Clone)]
pub struct Target {
    pub pid: u32,
    pub agent_module: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long to keep trying to bring the target window forward.
    pub focus_timeout: Duration,
    pub focus_poll: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            focus_timeout: Duration::from_secs(30),
            focus_poll: Duration::from_millis(250),
        }
    }
}

/// Collaborators a [`SessionManager`] drives.
#[derive(Clone)]
pub struct SessionHost {
    pub channels: Arc<dyn ChannelHost>,
    pub windows: Arc<dyn WindowControl>,
    pub processes: Arc<dyn ProcessWatch>,
}

type Registry = Arc<Mutex<HashSet<u32>>>;

/// One attached process: its capture interface plus the channel serving it.
pub struct Session {
    pid: u32,
    interface: Arc<CaptureInterface>,
    listener: Arc<dyn ChannelListener>,
    outbound: Mutex<Option<Receiver<Envelope>>>,
    server: Mutex<Option<PipeServer>>,
    acceptor: Mutex<Option<thread::JoinHandle<()>>>,
    registry: Registry,
    disposed: AtomicBool,
}

impl Session {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn interface(&self) -> &Arc<CaptureInterface> {
        &self.interface
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn start_accepting(self: &Arc<Self>) -> anyhow::Result<()> {
        let session = Arc::downgrade(self);
        let listener = self.listener.clone();
        let handle = thread::Builder::new()
            .name(format!("framehook-accept-{}", self.pid))
            .spawn(move || match listener.accept() {
                Ok(transport) => {
                    if let Some(session) = session.upgrade() {
                        session.serve(transport);
                    } else {
                        transport.close();
                    }
                }
                Err(e) => log_debug!("Stopped waiting for agent: {}", e),
            })?;
        *self.acceptor.lock() = Some(handle);
        Ok(())
    }

    fn serve(&self, transport: Arc<dyn Transport>) {
        if self.is_disposed() {
            transport.close();
            return;
        }
        let Some(outbound) = self.outbound.lock().take() else {
            transport.close();
            return;
        };
        match PipeServer::start(transport.clone(), self.interface.clone(), outbound) {
            Ok(server) => *self.server.lock() = Some(server),
            Err(e) => {
                log_error!("Failed to start server for {}: {}", self.pid, e);
                transport.close();
                self.interface.mark_disconnected();
            }
        }
    }

    /// Disconnects the agent, tears the channel down and frees the registry slot.
    /// Safe to call more than once and from any thread.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.interface.disconnect();
        self.listener.cancel();

        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            if acceptor.thread().id() != thread::current().id() {
                let _ = acceptor.join();
            }
        }
        if let Some(server) = self.server.lock().take() {
            server.stop();
        }
        self.interface.mark_disconnected();
        self.registry.lock().remove(&self.pid);
        log_info!("Session for process {} disposed", self.pid);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Attaches to processes. Each PID can be attached at most once per manager.
pub struct SessionManager {
    host: SessionHost,
    options: SessionOptions,
    registry: Registry,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl SessionManager {
    pub fn new(host: SessionHost, options: SessionOptions) -> Self {
        Self {
            host,
            options,
            registry: Arc::new(Mutex::new(HashSet::new())),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn is_hooked(&self, pid: u32) -> bool {
        self.registry.lock().contains(&pid)
    }

    pub fn hooked(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.registry.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn session(&self, pid: u32) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|s| s.pid == pid && !s.is_disposed())
    }

    pub fn attach(
        &self,
        target: &Target,
        config: CaptureConfig,
        injector: &dyn Injector,
    ) -> Result<Arc<Session>, CaptureError> {
        let pid = target.pid;
        let window = self
            .host
            .windows
            .main_window(pid)
            .ok_or(CaptureError::NoWindowHandle(pid))?;

        if !self.registry.lock().insert(pid) {
            return Err(CaptureError::AlreadyHooked(pid));
        }

        let listener = match self.host.channels.listen(pid) {
            Ok(listener) => listener,
            Err(e) => {
                self.registry.lock().remove(&pid);
                return Err(CaptureError::Channel(format!("cannot open channel for {}: {}", pid, e)));
            }
        };

        let (interface, outbound) = CaptureInterface::new(pid, config);
        let session = Arc::new(Session {
            pid,
            interface,
            listener,
            outbound: Mutex::new(Some(outbound)),
            server: Mutex::new(None),
            acceptor: Mutex::new(None),
            registry: self.registry.clone(),
            disposed: AtomicBool::new(false),
        });

        if let Err(e) = session.start_accepting() {
            session.dispose();
            return Err(CaptureError::Channel(format!("cannot wait for agent: {}", e)));
        }

        log_info!("Injecting {} into process {}", target.agent_module.display(), pid);
        if let Err(e) = injector.inject(pid, &target.agent_module) {
            session.dispose();
            return Err(CaptureError::InjectionFailure(format!("{:#}", e)));
        }

        self.bring_forward(window);

        let watched = Arc::downgrade(&session);
        let registered = self.host.processes.on_exit(
            pid,
            Box::new(move || {
                if let Some(session) = watched.upgrade() {
                    log_info!("Process {} exited", session.pid);
                    session.dispose();
                }
            }),
        );
        if let Err(e) = registered {
            session.dispose();
            return Err(CaptureError::Configuration(format!("cannot watch process {}: {:#}", pid, e)));
        }

        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        Ok(session)
    }

    /// Restores a minimized window, otherwise brings it to the foreground.
    /// Stops at the first call that succeeds.
    fn bring_forward(&self, window: WindowHandle) {
        let windows = &self.host.windows;
        let deadline = Instant::now() + self.options.focus_timeout;
        loop {
            let done = if windows.is_minimized(window) {
                windows.restore(window)
            } else {
                windows.bring_to_front(window)
            };
            if done {
                return;
            }
            if Instant::now() >= deadline {
                log_warn!("Target window {:#x} never came to the foreground", window);
                return;
            }
            thread::sleep(self.options.focus_poll);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for session in self.sessions.lock().drain(..).filter_map(|s| s.upgrade()) {
            session.dispose();
        }
    }
}
