use framehook_agent::context::BackendContext;
use framehook_agent::detect::ModuleProbe;
use framehook_agent::{Backend, BackendFactory, EntryPoint, TransportLink};
use framehook_core::channel::Transport;
use framehook_core::protocol::{AgentEvent, ControllerEvent, Envelope};
use framehook_core::{AgentSettings, CaptureConfig, CaptureError, Direct3DVersion, MemoryTransport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Journal = Arc<Mutex<Vec<String>>>;

/// Answers the handshake and pings, and records every agent event.
struct FakeController {
    transport: Arc<MemoryTransport>,
    events: Arc<Mutex<Vec<AgentEvent>>>,
    mute: Arc<AtomicBool>,
}

impl FakeController {
    fn start(transport: MemoryTransport, config: CaptureConfig) -> Self {
        let transport = Arc::new(transport);
        let events = Arc::new(Mutex::new(Vec::new()));
        let mute = Arc::new(AtomicBool::new(false));

        let (t, e, m) = (transport.clone(), events.clone(), mute.clone());
        thread::spawn(move || {
            while let Ok(envelope) = t.recv() {
                match envelope {
                    Envelope::Hello { .. } => {
                        let _ = t.send(&Envelope::Welcome(config.clone()));
                    }
                    Envelope::Ping { seq } if !m.load(Ordering::Acquire) => {
                        let _ = t.send(&Envelope::Pong {
                            seq,
                            time: chrono::Utc::now(),
                        });
                    }
                    Envelope::Agent(event) => e.lock().push(event),
                    _ => {}
                }
            }
        });

        Self { transport, events, mute }
    }

    fn wait_for_connected(&self) -> Option<Direct3DVersion> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let found = self.events.lock().iter().find_map(|event| match event {
                AgentEvent::Connected { direct3d_version, .. } => Some(*direct3d_version),
                _ => None,
            });
            if found.is_some() {
                return found;
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }
}

struct FakeBackend {
    version: Direct3DVersion,
    journal: Journal,
    fail_hook: bool,
}

impl Backend for FakeBackend {
    fn version(&self) -> Direct3DVersion {
        self.version
    }

    fn hook(&mut self) -> anyhow::Result<()> {
        self.journal.lock().push("hook".into());
        if self.fail_hook {
            anyhow::bail!("method table not found");
        }
        Ok(())
    }

    fn activate(&mut self) -> anyhow::Result<()> {
        self.journal.lock().push("activate".into());
        Ok(())
    }

    fn hook_count(&self) -> usize {
        2
    }

    fn unhook(&mut self, _grace: Duration) {
        self.journal.lock().push("unhook".into());
    }

    fn release(&mut self) {
        self.journal.lock().push("release".into());
    }
}

struct FakeFactory {
    journal: Journal,
    fail_hook: bool,
}

impl BackendFactory for FakeFactory {
    fn create(&self, version: Direct3DVersion, _context: Arc<BackendContext>) -> Result<Box<dyn Backend>, CaptureError> {
        self.journal.lock().push(format!("create {}", version));
        Ok(Box::new(FakeBackend {
            version,
            journal: self.journal.clone(),
            fail_hook: self.fail_hook,
        }))
    }
}

struct FakeModules(&'static [&'static str]);

impl ModuleProbe for FakeModules {
    fn is_loaded(&self, module: &str) -> bool {
        self.0.contains(&module)
    }
}

fn settings() -> AgentSettings {
    AgentSettings {
        watchdog_interval: Duration::from_millis(200),
        detect_poll: Duration::from_millis(5),
        detect_timeout: Duration::from_millis(50),
        teardown_grace: Duration::ZERO,
        readback_timeout: Duration::from_millis(200),
    }
}

fn config(version: Direct3DVersion) -> CaptureConfig {
    CaptureConfig {
        direct3d_version: version,
        ..CaptureConfig::default()
    }
}

fn spawn_agent(
    agent_side: MemoryTransport,
    modules: &'static [&'static str],
    journal: Journal,
    fail_hook: bool,
) -> thread::JoinHandle<Result<(), CaptureError>> {
    let link = TransportLink::connect(agent_side, 4242, Duration::from_secs(2)).expect("handshake");
    let entry = EntryPoint::new(Arc::new(link), settings(), 4242);
    thread::spawn(move || entry.run(&FakeModules(modules), &FakeFactory { journal, fail_hook }))
}

#[test]
fn disconnect_unhooks_before_releasing() {
    let (agent_side, controller_side) = MemoryTransport::pair();
    let controller = FakeController::start(controller_side, config(Direct3DVersion::Direct3D11));
    let journal = Journal::default();

    let agent = spawn_agent(agent_side, &[], journal.clone(), false);
    assert_eq!(controller.wait_for_connected(), Some(Direct3DVersion::Direct3D11));

    controller
        .transport
        .send(&Envelope::Controller(ControllerEvent::Disconnected))
        .unwrap();
    agent.join().unwrap().unwrap();

    assert_eq!(
        *journal.lock(),
        vec!["create Direct3D 11", "hook", "activate", "unhook", "release"]
    );
}

#[test]
fn silent_controller_triggers_teardown() {
    let (agent_side, controller_side) = MemoryTransport::pair();
    let controller = FakeController::start(controller_side, config(Direct3DVersion::Direct3D9));
    let journal = Journal::default();

    let agent = spawn_agent(agent_side, &[], journal.clone(), false);
    assert!(controller.wait_for_connected().is_some());

    controller.mute.store(true, Ordering::Release);
    let muted = Instant::now();
    agent.join().unwrap().unwrap();
    let elapsed = muted.elapsed();

    let settings = settings();
    let bound = settings.watchdog_interval + settings.teardown_grace + Duration::from_millis(150);
    assert!(elapsed <= bound, "teardown took {:?}", elapsed);
    assert_eq!(journal.lock().last().map(String::as_str), Some("release"));
}

#[test]
fn auto_detect_uses_loaded_modules() {
    let (agent_side, controller_side) = MemoryTransport::pair();
    let controller = FakeController::start(controller_side, config(Direct3DVersion::AutoDetect));
    let journal = Journal::default();

    let agent = spawn_agent(agent_side, &["d3d10.dll"], journal.clone(), false);
    assert_eq!(controller.wait_for_connected(), Some(Direct3DVersion::Direct3D10));

    controller
        .transport
        .send(&Envelope::Controller(ControllerEvent::Disconnected))
        .unwrap();
    agent.join().unwrap().unwrap();
}

#[test]
fn failed_hook_is_rolled_back() {
    let (agent_side, controller_side) = MemoryTransport::pair();
    let controller = FakeController::start(controller_side, config(Direct3DVersion::Direct3D11));
    let journal = Journal::default();

    let agent = spawn_agent(agent_side, &[], journal.clone(), true);
    let result = agent.join().unwrap();

    assert!(matches!(result, Err(CaptureError::Configuration(_))));
    assert_eq!(*journal.lock(), vec!["create Direct3D 11", "hook", "unhook", "release"]);
    assert!(!controller
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, AgentEvent::Connected { .. })));
}

#[test]
fn missing_runtime_fails_without_hooking() {
    let (agent_side, controller_side) = MemoryTransport::pair();
    let _controller = FakeController::start(controller_side, config(Direct3DVersion::AutoDetect));
    let journal = Journal::default();

    let agent = spawn_agent(agent_side, &[], journal.clone(), false);
    let result = agent.join().unwrap();

    assert!(matches!(result, Err(CaptureError::Configuration(_))));
    assert!(journal.lock().is_empty());
}
