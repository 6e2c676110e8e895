//! State shared by every backend and the per-present frame step.

use crate::overlay::OverlayFrame;
use crate::readback::{EventSink, ReadbackSource, ReadbackWorker};
use framehook_core::capture::{
    resolve_region, resolve_resize, CapturePhase, CaptureState, FramesPerSecond, PendingRequest, TextDisplay,
};
use framehook_core::overlay::Overlay;
use framehook_core::protocol::{AgentEvent, ControllerEvent, Rect, Size};
use framehook_core::{log_debug, log_error, log_info, log_warn, AgentSettings, CaptureConfig, CaptureError};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The GPU side of one intercepted present.
pub trait FrameTarget {
    fn backbuffer_size(&self) -> anyhow::Result<Size>;

    /// Resolves, optionally resizes and copies `region` into CPU-readable memory.
    fn capture(&mut self, region: Rect, resize: Option<Size>) -> anyhow::Result<Box<dyn ReadbackSource>>;

    fn draw_overlay(&mut self, frame: &OverlayFrame) -> anyhow::Result<()>;
}

struct OverlaySlot {
    overlay: Option<Overlay>,
    version: u64,
}

pub struct BackendContext {
    pending: PendingRequest,
    state: Arc<CaptureState>,
    overlay: RwLock<OverlaySlot>,
    text: Mutex<Option<TextDisplay>>,
    fps: Mutex<FramesPerSecond>,
    config: RwLock<CaptureConfig>,
    recording: AtomicBool,
    sink: EventSink,
    worker: ReadbackWorker,
    settings: AgentSettings,
}

impl BackendContext {
    pub fn new(config: CaptureConfig, settings: AgentSettings, sink: EventSink) -> Arc<Self> {
        let state = Arc::new(CaptureState::new());
        let worker = ReadbackWorker::start(sink.clone(), state.clone(), settings.readback_timeout);
        Arc::new(Self {
            pending: PendingRequest::new(),
            state,
            overlay: RwLock::new(OverlaySlot {
                overlay: None,
                version: 0,
            }),
            text: Mutex::new(None),
            fps: Mutex::new(FramesPerSecond::new()),
            config: RwLock::new(config),
            recording: AtomicBool::new(false),
            sink,
            worker,
            settings,
        })
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn config(&self) -> CaptureConfig {
        self.config.read().clone()
    }

    pub fn capture_state(&self) -> &CaptureState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending.is_pending()
    }

    pub fn send(&self, event: AgentEvent) -> Result<(), CaptureError> {
        (self.sink)(event)
    }

    /// Applies a controller event. `Disconnected` is handled by the entry point.
    pub fn handle_event(&self, event: &ControllerEvent) {
        match event {
            ControllerEvent::ScreenshotRequested(request) => {
                if let Some(replaced) = self.pending.set(request.clone()) {
                    log_debug!("Request {} replaced by {}", replaced.request_id, request.request_id);
                }
                self.state.advance(CapturePhase::RequestPending);
            }
            ControllerEvent::DisplayText { text, duration_ms } => {
                *self.text.lock() = Some(TextDisplay::new(text.clone(), Duration::from_millis(*duration_ms)));
            }
            ControllerEvent::DrawOverlay(overlay) => {
                let mut slot = self.overlay.write();
                slot.overlay = overlay.clone();
                slot.version += 1;
            }
            ControllerEvent::Input(input) => {
                if let Some(overlay) = self.overlay.read().overlay.as_ref() {
                    let handled = overlay.dispatch_input(input);
                    log_debug!("Input {:?} dispatched to elements {:?}", input, handled);
                }
            }
            ControllerEvent::RecordingStarted(config) => {
                *self.config.write() = config.clone();
                self.recording.store(true, Ordering::Release);
                log_info!("Recording started ({} fps target)", config.target_fps);
            }
            ControllerEvent::RecordingStopped => {
                self.recording.store(false, Ordering::Release);
                log_info!("Recording stopped");
            }
            ControllerEvent::Disconnected => {}
        }
    }

    /// Snapshot of what the compositor should draw this frame.
    pub fn overlay_frame(&self) -> OverlayFrame {
        let slot = self.overlay.read();
        let now = Instant::now();
        let text = {
            let mut text = self.text.lock();
            if text.as_ref().is_some_and(|t| !t.is_visible(now)) {
                *text = None;
            }
            text.as_ref().map(|t| t.text.clone())
        };
        OverlayFrame {
            overlay: slot.overlay.clone(),
            version: slot.version,
            text,
            fps: Some(self.fps.lock().fps()),
        }
    }

    /// Runs the capture and overlay work for one present. Never unwinds into the caller.
    pub fn frame_step<T: FrameTarget + ?Sized>(&self, target: &mut T) {
        let result = catch_unwind(AssertUnwindSafe(|| self.frame_step_inner(target)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_warn!("Frame step failed: {:#}", e),
            Err(_) => log_error!("Frame step panicked"),
        }
    }

    fn frame_step_inner<T: FrameTarget + ?Sized>(&self, target: &mut T) -> anyhow::Result<()> {
        self.fps.lock().frame();

        if let Some(request) = self.pending.take() {
            let bounds = target.backbuffer_size()?;
            match resolve_region(request.region, bounds) {
                None => {
                    self.state.advance(CapturePhase::Dropped);
                    log_warn!(
                        "Region {:?} lies outside the {}x{} backbuffer; dropping request {}",
                        request.region,
                        bounds.width,
                        bounds.height,
                        request.request_id
                    );
                }
                Some(region) => {
                    self.state.advance(CapturePhase::Capturing);
                    match target.capture(region, resolve_resize(request.resize)) {
                        Ok(source) => {
                            if !self.worker.submit(request, source) {
                                self.state.advance(CapturePhase::Dropped);
                                log_warn!("Readback worker is gone; screenshot dropped");
                            }
                        }
                        Err(e) => {
                            self.state.advance(CapturePhase::Dropped);
                            log_warn!("Capture of request {} failed: {:#}", request.request_id, e);
                        }
                    }
                }
            }
        }

        if self.config.read().show_overlay {
            target.draw_overlay(&self.overlay_frame())?;
        }
        Ok(())
    }

    /// Drains outstanding readbacks.
    pub fn shutdown(&self) {
        self.worker.shutdown();
        self.pending.clear();
    }
}
