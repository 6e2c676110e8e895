//! Agent end of the controller channel.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use framehook_core::channel::Transport;
use framehook_core::protocol::{AgentEvent, ControllerEvent, Envelope, ProtocolError};
use framehook_core::{log_debug, log_warn, CaptureConfig, CaptureError, EventBus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub trait AgentLink: Send + Sync {
    /// Round-trips a ping; the controller answers with its current time.
    fn ping(&self, timeout: Duration) -> Result<DateTime<Utc>, CaptureError>;

    fn send(&self, event: AgentEvent) -> Result<(), CaptureError>;

    /// Controller events arriving on the reverse direction.
    fn events(&self) -> &EventBus<ControllerEvent>;

    /// Configuration received in the handshake.
    fn config(&self) -> CaptureConfig;

    fn close(&self);
}

struct LinkInner<T: Transport> {
    transport: T,
    events: EventBus<ControllerEvent>,
    waiters: Mutex<HashMap<u64, Sender<DateTime<Utc>>>>,
    welcome: Mutex<Option<Sender<CaptureConfig>>>,
    config: RwLock<CaptureConfig>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl<T: Transport> LinkInner<T> {
    fn read_loop(&self) {
        loop {
            match self.transport.recv() {
                Ok(Envelope::Pong { seq, time }) => {
                    if let Some(waiter) = self.waiters.lock().remove(&seq) {
                        let _ = waiter.send(time);
                    }
                }
                Ok(Envelope::Controller(event)) => {
                    self.events.publish(&event);
                }
                Ok(Envelope::Welcome(config)) => {
                    *self.config.write() = config.clone();
                    if let Some(tx) = self.welcome.lock().take() {
                        let _ = tx.send(config);
                    }
                }
                Ok(Envelope::Ping { seq }) => {
                    let _ = self.transport.send(&Envelope::Pong { seq, time: Utc::now() });
                }
                Ok(other) => log_debug!("Ignoring unexpected envelope: {:?}", other),
                Err(ProtocolError::Closed) => break,
                Err(e) => {
                    if !self.closed.load(Ordering::Acquire) {
                        log_warn!("Controller channel failed: {}", e);
                    }
                    break;
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        // Dropping the senders fails every outstanding ping at once
        self.waiters.lock().clear();
        self.welcome.lock().take();
    }
}

/// [`AgentLink`] over any [`Transport`]. A reader thread routes pongs to
/// waiting pings and controller events to the event bus.
pub struct TransportLink<T: Transport + 'static> {
    inner: Arc<LinkInner<T>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<T: Transport + 'static> TransportLink<T> {
    /// Sends the handshake and waits up to `timeout` for the controller's configuration.
    pub fn connect(transport: T, pid: u32, timeout: Duration) -> Result<Self, CaptureError> {
        let (welcome_tx, welcome_rx) = bounded(1);
        let inner = Arc::new(LinkInner {
            transport,
            events: EventBus::new(),
            waiters: Mutex::new(HashMap::new()),
            welcome: Mutex::new(Some(welcome_tx)),
            config: RwLock::new(CaptureConfig::default()),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let reader_inner = inner.clone();
        let reader = thread::Builder::new()
            .name("framehook-link".into())
            .spawn(move || reader_inner.read_loop())
            .map_err(|e| CaptureError::Channel(format!("failed to spawn link reader: {}", e)))?;

        let link = Self {
            inner,
            reader: Mutex::new(Some(reader)),
        };

        let hello = Envelope::Hello {
            pid,
            version: framehook_core::VERSION.to_string(),
        };
        if let Err(e) = link.inner.transport.send(&hello) {
            link.close();
            return Err(CaptureError::Channel(format!("handshake failed: {}", e)));
        }

        match welcome_rx.recv_timeout(timeout) {
            Ok(_) => Ok(link),
            Err(_) => {
                link.close();
                Err(CaptureError::Channel("controller did not answer the handshake".into()))
            }
        }
    }
}

impl<T: Transport + 'static> AgentLink for TransportLink<T> {
    fn ping(&self, timeout: Duration) -> Result<DateTime<Utc>, CaptureError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CaptureError::Channel("link closed".into()));
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.inner.waiters.lock().insert(seq, tx);

        if let Err(e) = self.inner.transport.send(&Envelope::Ping { seq }) {
            self.inner.waiters.lock().remove(&seq);
            return Err(CaptureError::Channel(format!("ping failed: {}", e)));
        }

        let result = rx.recv_timeout(timeout);
        self.inner.waiters.lock().remove(&seq);
        result.map_err(|_| CaptureError::Channel(format!("no pong for ping {}", seq)))
    }

    fn send(&self, event: AgentEvent) -> Result<(), CaptureError> {
        self.inner
            .transport
            .send(&Envelope::Agent(event))
            .map_err(|e| CaptureError::Channel(e.to_string()))
    }

    fn events(&self) -> &EventBus<ControllerEvent> {
        &self.inner.events
    }

    fn config(&self) -> CaptureConfig {
        self.inner.config.read().clone()
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.transport.close();
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
    }
}

impl<T: Transport + 'static> Drop for TransportLink<T> {
    fn drop(&mut self) {
        self.close();
    }
}
