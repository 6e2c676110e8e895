//! Off-render-thread readback: waits for the GPU copy, maps it, encodes it
//! and hands the screenshot to the outbound sink.

use crossbeam_channel::{unbounded, Sender};
use framehook_core::capture::{encode, CapturePhase, CaptureState, FrameReadback};
use framehook_core::protocol::{AgentEvent, ScreenshotRequest};
use framehook_core::{log_debug, log_warn, CaptureError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A GPU copy that can be mapped once the device has finished it.
pub trait ReadbackSource: Send {
    fn is_ready(&mut self) -> anyhow::Result<bool>;

    fn read(self: Box<Self>) -> anyhow::Result<FrameReadback>;
}

pub type EventSink = Arc<dyn Fn(AgentEvent) -> Result<(), CaptureError> + Send + Sync>;

struct ReadbackJob {
    request: ScreenshotRequest,
    source: Box<dyn ReadbackSource>,
}

pub struct ReadbackWorker {
    jobs: Mutex<Option<Sender<ReadbackJob>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReadbackWorker {
    const POLL: Duration = Duration::from_millis(1);

    pub fn start(sink: EventSink, state: Arc<CaptureState>, timeout: Duration) -> Self {
        let (tx, rx) = unbounded::<ReadbackJob>();

        let handle = thread::Builder::new()
            .name("framehook-readback".into())
            .spawn(move || {
                for job in rx.iter() {
                    let id = job.request.request_id;
                    match complete(job, &sink, &state, timeout) {
                        Ok(()) => {
                            state.advance(CapturePhase::Delivered);
                            log_debug!("Delivered screenshot {}", id);
                        }
                        Err(e) => {
                            state.advance(CapturePhase::Dropped);
                            log_warn!("Dropped screenshot {}: {}", id, e);
                        }
                    }
                }
            })
            .ok();

        if handle.is_none() {
            log_warn!("Failed to spawn readback worker");
        }

        Self {
            jobs: Mutex::new(Some(tx)),
            handle: Mutex::new(handle),
        }
    }

    pub fn submit(&self, request: ScreenshotRequest, source: Box<dyn ReadbackSource>) -> bool {
        match self.jobs.lock().as_ref() {
            Some(tx) => tx.send(ReadbackJob { request, source }).is_ok(),
            None => false,
        }
    }

    /// Finishes queued jobs and joins the worker.
    pub fn shutdown(&self) {
        self.jobs.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReadbackWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn complete(job: ReadbackJob, sink: &EventSink, state: &CaptureState, timeout: Duration) -> anyhow::Result<()> {
    let ReadbackJob { request, mut source } = job;

    let deadline = Instant::now() + timeout;
    while !source.is_ready()? {
        if Instant::now() >= deadline {
            anyhow::bail!("GPU copy not finished after {:?}", timeout);
        }
        spin_sleep::sleep(ReadbackWorker::POLL);
    }

    let frame = source.read()?;
    state.advance(CapturePhase::Encoding);
    let screenshot = encode(&request, frame)?;
    sink(AgentEvent::ScreenshotReceived(screenshot))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use framehook_core::protocol::{ImageFormat, PixelFormat};

    /// Source that becomes ready after a number of polls.
    pub(crate) struct FakeSource {
        pub(crate) polls_until_ready: Option<usize>,
        pub(crate) frame: FrameReadback,
    }

    impl FakeSource {
        pub(crate) fn solid(width: u32, height: u32) -> Self {
            Self {
                polls_until_ready: Some(2),
                frame: FrameReadback {
                    width,
                    height,
                    stride: width * 4,
                    pixel_format: PixelFormat::Bgra8,
                    data: vec![0x80; (width * height * 4) as usize],
                },
            }
        }
    }

    impl ReadbackSource for FakeSource {
        fn is_ready(&mut self) -> anyhow::Result<bool> {
            match &mut self.polls_until_ready {
                Some(0) => Ok(true),
                Some(n) => {
                    *n -= 1;
                    Ok(false)
                }
                None => Ok(false),
            }
        }

        fn read(self: Box<Self>) -> anyhow::Result<FrameReadback> {
            Ok(self.frame)
        }
    }

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<AgentEvent>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink_sent = sent.clone();
        let sink: EventSink = Arc::new(move |event: AgentEvent| -> Result<(), CaptureError> {
            sink_sent.lock().push(event);
            Ok(())
        });
        (sink, sent)
    }

    #[test]
    fn finished_copy_is_encoded_and_sent() {
        let (sink, sent) = collecting_sink();
        let state = Arc::new(CaptureState::new());
        let worker = ReadbackWorker::start(sink, state.clone(), Duration::from_secs(1));

        let request = ScreenshotRequest::new(None, None, ImageFormat::Png);
        assert!(worker.submit(request.clone(), Box::new(FakeSource::solid(16, 8))));
        worker.shutdown();

        let sent = sent.lock();
        match sent.as_slice() {
            [AgentEvent::ScreenshotReceived(shot)] => {
                assert_eq!(shot.request_id, request.request_id);
                let decoded = image::load_from_memory(shot.bytes()).unwrap();
                assert_eq!((decoded.width(), decoded.height()), (16, 8));
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(state.stats().delivered, 1);
    }

    #[test]
    fn copy_that_never_finishes_is_dropped() {
        let (sink, sent) = collecting_sink();
        let state = Arc::new(CaptureState::new());
        let worker = ReadbackWorker::start(sink, state.clone(), Duration::from_millis(20));

        let mut source = FakeSource::solid(4, 4);
        source.polls_until_ready = None;
        worker.submit(ScreenshotRequest::new(None, None, ImageFormat::Png), Box::new(source));
        worker.shutdown();

        assert!(sent.lock().is_empty());
        assert_eq!(state.stats().dropped, 1);
    }
}
