use framehook_agent::context::{BackendContext, FrameTarget};
use framehook_agent::detect::ModuleProbe;
use framehook_agent::overlay::OverlayFrame;
use framehook_agent::readback::ReadbackSource;
use framehook_agent::{Backend, BackendFactory, EntryPoint, TransportLink};
use crossbeam_channel::Receiver;
use framehook_controller::{CaptureInterface, PipeServer, RemoteMessage};
use framehook_core::capture::FrameReadback;
use framehook_core::{
    AgentSettings, CaptureConfig, CaptureError, Direct3DVersion, ImageFormat, MemoryTransport, MessageSeverity,
    PixelFormat, Rect, ScreenshotData, Size,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PID: u32 = 99;

struct ReadySource(FrameReadback);

impl ReadbackSource for ReadySource {
    fn is_ready(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn read(self: Box<Self>) -> anyhow::Result<FrameReadback> {
        Ok(self.0)
    }
}

/// 64x32 opaque red backbuffer.
struct SolidTarget;

impl FrameTarget for SolidTarget {
    fn backbuffer_size(&self) -> anyhow::Result<Size> {
        Ok(Size::new(64, 32))
    }

    fn capture(&mut self, region: Rect, resize: Option<Size>) -> anyhow::Result<Box<dyn ReadbackSource>> {
        let size = resize.unwrap_or(Size::new(region.width, region.height));
        Ok(Box::new(ReadySource(FrameReadback {
            width: size.width,
            height: size.height,
            stride: size.width * 4,
            pixel_format: PixelFormat::Bgra8,
            data: [0, 0, 255, 255].repeat((size.width * size.height) as usize),
        })))
    }

    fn draw_overlay(&mut self, _frame: &OverlayFrame) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Presents a frame every few milliseconds while hooked.
struct RenderLoop {
    context: Arc<BackendContext>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Backend for RenderLoop {
    fn version(&self) -> Direct3DVersion {
        Direct3DVersion::Direct3D11
    }

    fn hook(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::Release);
        let (context, running) = (self.context.clone(), self.running.clone());
        self.thread = Some(thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                context.frame_step(&mut SolidTarget);
                thread::sleep(Duration::from_millis(5));
            }
        }));
        Ok(())
    }

    fn hook_count(&self) -> usize {
        2
    }

    fn unhook(&mut self, _grace: Duration) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn release(&mut self) {}
}

struct RenderLoopFactory;

impl BackendFactory for RenderLoopFactory {
    fn create(&self, _version: Direct3DVersion, context: Arc<BackendContext>) -> Result<Box<dyn Backend>, CaptureError> {
        Ok(Box::new(RenderLoop {
            context,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }))
    }
}

struct NoModules;

impl ModuleProbe for NoModules {
    fn is_loaded(&self, _module: &str) -> bool {
        false
    }
}

struct Harness {
    interface: Arc<CaptureInterface>,
    messages: Receiver<RemoteMessage>,
    _server: PipeServer,
    agent: Option<thread::JoinHandle<Result<(), CaptureError>>>,
}

impl Harness {
    fn start() -> Self {
        let (controller_side, agent_side) = MemoryTransport::pair();
        let config = CaptureConfig {
            direct3d_version: Direct3DVersion::Direct3D11,
            ..CaptureConfig::default()
        };
        let (interface, outbound) = CaptureInterface::new(PID, config);
        let messages = interface.message_stream();
        let server = PipeServer::start(Arc::new(controller_side), interface.clone(), outbound).unwrap();

        let agent = thread::spawn(move || {
            let link = TransportLink::connect(agent_side, PID, Duration::from_secs(2))?;
            let settings = AgentSettings {
                watchdog_interval: Duration::from_millis(100),
                ..AgentSettings::default()
            };
            EntryPoint::new(Arc::new(link), settings, PID).run(&NoModules, &RenderLoopFactory)
        });

        Self {
            interface,
            messages,
            _server: server,
            agent: Some(agent),
        }
    }

    fn finish(mut self) -> Result<(), CaptureError> {
        self.interface.disconnect();
        self.agent.take().unwrap().join().unwrap()
    }
}

#[test]
fn screenshot_round_trip_through_agent() {
    let harness = Harness::start();
    assert_eq!(
        harness.interface.wait_connected(Duration::from_secs(5)),
        Some(Direct3DVersion::Direct3D11)
    );

    let shot = harness
        .interface
        .get_screenshot(Some(Rect::new(8, 4, 32, 16)), Duration::from_secs(5), None, ImageFormat::Png)
        .expect("screenshot");
    let decoded = image::load_from_memory(shot.bytes()).unwrap().to_rgba8();
    assert_eq!(decoded.dimensions(), (32, 16));
    assert_eq!(decoded.get_pixel(0, 0).0, [255, 0, 0, 255]);

    // Other agents in this binary may share the process-wide log forwarding
    let hooked = harness
        .messages
        .try_iter()
        .any(|(severity, text)| severity == MessageSeverity::Information && text.contains("hooks installed"));
    assert!(hooked);

    harness.finish().unwrap();
}

#[test]
fn pixel_data_is_returned_raw_at_requested_size() {
    let harness = Harness::start();
    assert!(harness.interface.wait_connected(Duration::from_secs(5)).is_some());

    let shot = harness
        .interface
        .get_screenshot(None, Duration::from_secs(5), Some(Size::new(16, 8)), ImageFormat::PixelData)
        .expect("screenshot");
    match shot.data {
        ScreenshotData::Raw {
            width,
            height,
            pixel_format,
            ..
        } => {
            assert_eq!((width, height), (16, 8));
            assert_eq!(pixel_format, PixelFormat::Bgra8);
        }
        other => panic!("expected raw pixels, got {:?}", other),
    }

    harness.finish().unwrap();
}

#[test]
fn request_outside_backbuffer_times_out() {
    let harness = Harness::start();
    assert!(harness.interface.wait_connected(Duration::from_secs(5)).is_some());

    let shot = harness.interface.get_screenshot(
        Some(Rect::new(500, 500, 10, 10)),
        Duration::from_millis(300),
        None,
        ImageFormat::Bitmap,
    );
    assert!(shot.is_none());

    harness.finish().unwrap();
}
