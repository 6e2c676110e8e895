//! Controller-side surface of one attached agent.
//!
//! Commands are queued as envelopes on the outbound channel drained by the
//! [`PipeServer`](crate::server::PipeServer). Agent events come back through
//! [`CaptureInterface::on_agent_event`].

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use framehook_core::bus::SubscriptionId;
use framehook_core::overlay::InputEvent;
use framehook_core::protocol::{AgentEvent, ControllerEvent, Envelope};
use framehook_core::{
    log_debug, log_error, log_info, log_warn, CaptureConfig, CaptureError, Direct3DVersion, EventBus, ImageFormat,
    MessageSeverity, Overlay, Rect, RequestId, Screenshot, ScreenshotRequest, Size,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type RemoteMessage = (MessageSeverity, String);

#[derive(Default)]
struct ScreenshotSlot {
    pending: Option<(RequestId, ImageFormat)>,
    response: Option<Screenshot>,
}

#[derive(Default)]
struct AgentState {
    version: Option<Direct3DVersion>,
    closed: bool,
}

/// Clears the pending request however `get_screenshot` returns.
struct PendingGuard<'a> {
    slot: &'a Mutex<ScreenshotSlot>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.response = None;
    }
}

/// Result of [`CaptureInterface::begin_get_screenshot`].
pub struct ScreenshotHandle {
    request: thread::JoinHandle<Option<Screenshot>>,
}

impl ScreenshotHandle {
    pub fn is_finished(&self) -> bool {
        self.request.is_finished()
    }
}

pub struct CaptureInterface {
    pid: u32,
    outbound: Sender<Envelope>,
    config: RwLock<CaptureConfig>,
    exclusive: Mutex<()>,
    screenshot: Mutex<ScreenshotSlot>,
    screenshot_ready: Condvar,
    agent: Mutex<AgentState>,
    agent_changed: Condvar,
    messages: EventBus<RemoteMessage>,
    recording: AtomicBool,
}

impl CaptureInterface {
    /// Returns the interface and the queue of envelopes bound for the agent.
    pub fn new(pid: u32, config: CaptureConfig) -> (Arc<Self>, Receiver<Envelope>) {
        let (outbound, outbound_rx) = unbounded();
        let interface = Arc::new(Self {
            pid,
            outbound,
            config: RwLock::new(config),
            exclusive: Mutex::new(()),
            screenshot: Mutex::new(ScreenshotSlot::default()),
            screenshot_ready: Condvar::new(),
            agent: Mutex::new(AgentState::default()),
            agent_changed: Condvar::new(),
            messages: EventBus::new(),
            recording: AtomicBool::new(false),
        });
        (interface, outbound_rx)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Configuration sent in the handshake reply.
    pub fn config(&self) -> CaptureConfig {
        self.config.read().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        let agent = self.agent.lock();
        agent.version.is_some() && !agent.closed
    }

    /// API the agent hooked, once it reported `Connected`.
    pub fn direct3d_version(&self) -> Option<Direct3DVersion> {
        self.agent.lock().version
    }

    /// Blocks until the agent reports its hooks, the channel closes, or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> Option<Direct3DVersion> {
        let deadline = Instant::now() + timeout;
        let mut agent = self.agent.lock();
        while agent.version.is_none() && !agent.closed {
            if self.agent_changed.wait_until(&mut agent, deadline).timed_out() {
                break;
            }
        }
        if agent.closed {
            return None;
        }
        agent.version
    }

    pub(crate) fn queue(&self, envelope: Envelope) -> Result<(), CaptureError> {
        if self.agent.lock().closed {
            return Err(CaptureError::Channel(format!("agent {} is disconnected", self.pid)));
        }
        self.outbound
            .send(envelope)
            .map_err(|_| CaptureError::Channel("outbound queue closed".into()))
    }

    fn send(&self, event: ControllerEvent) -> Result<(), CaptureError> {
        self.queue(Envelope::Controller(event))
    }

    pub fn start_recording(&self, config: CaptureConfig) -> Result<(), CaptureError> {
        *self.config.write() = config.clone();
        self.send(ControllerEvent::RecordingStarted(config))?;
        self.recording.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<(), CaptureError> {
        self.send(ControllerEvent::RecordingStopped)?;
        self.recording.store(false, Ordering::Release);
        Ok(())
    }

    /// Requests one frame and waits up to `timeout` for the matching reply.
    /// Calls are serialized, so at most one request is ever outstanding.
    pub fn get_screenshot(
        &self,
        region: Option<Rect>,
        timeout: Duration,
        resize: Option<Size>,
        format: ImageFormat,
    ) -> Option<Screenshot> {
        let _exclusive = self.exclusive.lock();
        let request = ScreenshotRequest::new(region, resize, format);
        let request_id = request.request_id;
        let deadline = Instant::now() + timeout;

        let mut slot = self.screenshot.lock();
        slot.pending = Some((request_id, format));
        slot.response = None;
        drop(slot);
        let _guard = PendingGuard { slot: &self.screenshot };

        if let Err(e) = self.send(ControllerEvent::ScreenshotRequested(request)) {
            log_warn!("Screenshot request not sent: {}", e);
            return None;
        }

        let mut slot = self.screenshot.lock();
        loop {
            if let Some(screenshot) = slot.response.take() {
                return Some(screenshot);
            }
            if self.agent.lock().closed {
                return None;
            }
            if self.screenshot_ready.wait_until(&mut slot, deadline).timed_out() {
                let late = slot.response.take();
                if late.is_none() {
                    log_debug!("Screenshot {:?} timed out", request_id);
                }
                return late;
            }
        }
    }

    /// Runs [`get_screenshot`](Self::get_screenshot) on its own thread.
    pub fn begin_get_screenshot(
        self: &Arc<Self>,
        region: Option<Rect>,
        timeout: Duration,
        resize: Option<Size>,
        format: ImageFormat,
    ) -> ScreenshotHandle {
        let interface = self.clone();
        let request = thread::spawn(move || interface.get_screenshot(region, timeout, resize, format));
        ScreenshotHandle { request }
    }

    pub fn end_get_screenshot(&self, handle: ScreenshotHandle) -> Option<Screenshot> {
        handle.request.join().ok().flatten()
    }

    /// Accepts `screenshot` only when it answers the outstanding request.
    pub fn on_screenshot_received(&self, screenshot: Screenshot) -> bool {
        let mut slot = self.screenshot.lock();
        match slot.pending {
            Some((id, format)) if id == screenshot.request_id && format == screenshot.format => {
                slot.response = Some(screenshot);
                self.screenshot_ready.notify_all();
                true
            }
            _ => {
                log_debug!(
                    "Dropping unsolicited screenshot {:?} ({:?})",
                    screenshot.request_id,
                    screenshot.format
                );
                false
            }
        }
    }

    pub fn display_in_game_text(&self, text: impl Into<String>, duration: Duration) -> Result<(), CaptureError> {
        self.send(ControllerEvent::DisplayText {
            text: text.into(),
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// `None` clears whatever overlay is currently drawn.
    pub fn draw_overlay_in_game(&self, overlay: Option<Overlay>) -> Result<(), CaptureError> {
        self.send(ControllerEvent::DrawOverlay(overlay))
    }

    pub fn forward_input(&self, event: InputEvent) -> Result<(), CaptureError> {
        self.send(ControllerEvent::Input(event))
    }

    /// New receiver of every agent message. Dropping it unsubscribes.
    pub fn message_stream(&self) -> Receiver<RemoteMessage> {
        let (tx, rx) = unbounded();
        self.messages.subscribe(move |message: &RemoteMessage| {
            tx.send(message.clone()).map_err(|_| anyhow::anyhow!("message stream dropped"))
        });
        rx
    }

    pub fn subscribe_messages<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RemoteMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.messages.subscribe(callback)
    }

    pub fn unsubscribe_messages(&self, id: SubscriptionId) -> bool {
        self.messages.unsubscribe(id)
    }

    /// Tells the agent to unhook. Later commands fail with `Channel`.
    pub fn disconnect(&self) {
        let _ = self.send(ControllerEvent::Disconnected);
        self.recording.store(false, Ordering::Release);
        log_info!("Disconnect sent to agent {}", self.pid);
    }

    /// Liveness probe; the agent only needs an answer, so this is the current time.
    pub fn ping(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn on_agent_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::RemoteMessage { severity, text } => {
                match severity {
                    MessageSeverity::Error => log_error!("[agent {}] {}", self.pid, text),
                    MessageSeverity::Warning => log_warn!("[agent {}] {}", self.pid, text),
                    MessageSeverity::Information => log_info!("[agent {}] {}", self.pid, text),
                    MessageSeverity::Debug => log_debug!("[agent {}] {}", self.pid, text),
                }
                self.messages.publish(&(severity, text));
            }
            AgentEvent::ScreenshotReceived(screenshot) => {
                self.on_screenshot_received(screenshot);
            }
            AgentEvent::Connected { pid, direct3d_version } => {
                log_info!("Agent in process {} hooked {}", pid, direct3d_version);
                self.agent.lock().version = Some(direct3d_version);
                self.agent_changed.notify_all();
            }
        }
    }

    /// Called by the server once the channel is gone. Wakes every waiter.
    pub fn mark_disconnected(&self) {
        {
            let mut agent = self.agent.lock();
            if agent.closed {
                return;
            }
            agent.closed = true;
        }
        self.recording.store(false, Ordering::Release);
        self.agent_changed.notify_all();
        // Take the slot lock so a waiter cannot miss the wakeup
        let _slot = self.screenshot.lock();
        self.screenshot_ready.notify_all();
        log_info!("Agent {} disconnected", self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framehook_core::ScreenshotData;

    fn reply(request: &ScreenshotRequest, format: ImageFormat) -> Screenshot {
        Screenshot {
            request_id: request.request_id,
            format,
            data: ScreenshotData::Encoded(vec![1, 2, 3]),
        }
    }

    /// Answers every screenshot request on the outbound queue with `answer`.
    fn fake_agent(
        interface: Arc<CaptureInterface>,
        outbound: Receiver<Envelope>,
        answer: impl Fn(&ScreenshotRequest) -> Option<Screenshot> + Send + 'static,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(envelope) = outbound.recv_timeout(Duration::from_secs(2)) {
                if let Envelope::Controller(ControllerEvent::ScreenshotRequested(request)) = envelope {
                    if let Some(screenshot) = answer(&request) {
                        interface.on_agent_event(AgentEvent::ScreenshotReceived(screenshot));
                    }
                }
            }
        })
    }

    #[test]
    fn matching_reply_is_returned() {
        let (interface, outbound) = CaptureInterface::new(7, CaptureConfig::default());
        let _agent = fake_agent(interface.clone(), outbound, |r| Some(reply(r, r.format)));

        let shot = interface.get_screenshot(None, Duration::from_secs(2), None, ImageFormat::Png);
        assert_eq!(shot.map(|s| s.format), Some(ImageFormat::Png));
        assert!(interface.screenshot.lock().pending.is_none());
    }

    #[test]
    fn wrong_format_is_ignored_until_timeout() {
        let (interface, outbound) = CaptureInterface::new(7, CaptureConfig::default());
        let _agent = fake_agent(interface.clone(), outbound, |r| Some(reply(r, ImageFormat::Jpeg)));

        let started = Instant::now();
        let shot = interface.get_screenshot(None, Duration::from_millis(100), None, ImageFormat::Png);
        assert!(shot.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(interface.screenshot.lock().pending.is_none());
    }

    #[test]
    fn reply_without_request_is_dropped() {
        let (interface, _outbound) = CaptureInterface::new(7, CaptureConfig::default());
        let request = ScreenshotRequest::new(None, None, ImageFormat::Bitmap);
        assert!(!interface.on_screenshot_received(reply(&request, ImageFormat::Bitmap)));
    }

    #[test]
    fn begin_and_end_wrap_the_blocking_call() {
        let (interface, outbound) = CaptureInterface::new(7, CaptureConfig::default());
        let _agent = fake_agent(interface.clone(), outbound, |r| Some(reply(r, r.format)));

        let handle = interface.begin_get_screenshot(None, Duration::from_secs(2), None, ImageFormat::Bitmap);
        let shot = interface.end_get_screenshot(handle);
        assert_eq!(shot.map(|s| s.format), Some(ImageFormat::Bitmap));
    }

    #[test]
    fn disconnect_wakes_a_waiting_request() {
        let (interface, _outbound) = CaptureInterface::new(7, CaptureConfig::default());
        let waiter = interface.begin_get_screenshot(None, Duration::from_secs(10), None, ImageFormat::Png);

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        interface.mark_disconnected();
        assert!(interface.end_get_screenshot(waiter).is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(interface.display_in_game_text("late", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn messages_reach_stream_and_subscribers() {
        let (interface, _outbound) = CaptureInterface::new(7, CaptureConfig::default());
        let stream = interface.message_stream();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        interface.subscribe_messages(move |(_, text)| {
            sink.lock().push(text.clone());
            Ok(())
        });

        interface.on_agent_event(AgentEvent::RemoteMessage {
            severity: MessageSeverity::Warning,
            text: "device lost".into(),
        });

        assert_eq!(
            stream.try_recv().unwrap(),
            (MessageSeverity::Warning, "device lost".to_string())
        );
        assert_eq!(*seen.lock(), vec!["device lost".to_string()]);
    }

    #[test]
    fn connected_event_releases_waiters() {
        let (interface, _outbound) = CaptureInterface::new(7, CaptureConfig::default());
        let notifier = interface.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.on_agent_event(AgentEvent::Connected {
                pid: 7,
                direct3d_version: Direct3DVersion::Direct3D9,
            });
        });
        assert_eq!(
            interface.wait_connected(Duration::from_secs(2)),
            Some(Direct3DVersion::Direct3D9)
        );
        assert!(interface.is_connected());
    }

    #[test]
    fn commands_are_queued_as_controller_events() {
        let (interface, outbound) = CaptureInterface::new(7, CaptureConfig::default());
        interface.display_in_game_text("hello", Duration::from_millis(1500)).unwrap();
        interface.draw_overlay_in_game(None).unwrap();
        interface.disconnect();

        let events: Vec<Envelope> = outbound.try_iter().collect();
        assert_eq!(
            events,
            vec![
                Envelope::Controller(ControllerEvent::DisplayText {
                    text: "hello".into(),
                    duration_ms: 1500
                }),
                Envelope::Controller(ControllerEvent::DrawOverlay(None)),
                Envelope::Controller(ControllerEvent::Disconnected),
            ]
        );
    }
}
