//! Agent lifecycle: connect, pick a backend, hook, wait for exit, unhook.

use crate::context::BackendContext;
use crate::detect::{resolve_version, ModuleProbe};
use crate::link::AgentLink;
use crate::readback::EventSink;
use crate::watchdog::{ExitSignal, Watchdog};
use framehook_core::logger;
use framehook_core::protocol::{AgentEvent, ControllerEvent, MessageSeverity};
use framehook_core::{log_error, log_info, AgentSettings, CaptureError, Direct3DVersion};
use std::sync::Arc;
use std::time::Duration;

/// One graphics API's set of hooks and GPU resources.
pub trait Backend: Send {
    fn version(&self) -> Direct3DVersion;

    /// Resolves addresses and installs hooks. A second call installs nothing.
    fn hook(&mut self) -> anyhow::Result<()>;

    fn activate(&mut self) -> anyhow::Result<()>;

    fn hook_count(&self) -> usize;

    /// Deactivates every hook, waits `grace`, then disposes them.
    fn unhook(&mut self, grace: Duration);

    /// Drops cached GPU resources. Called after `unhook`.
    fn release(&mut self);
}

pub trait BackendFactory {
    fn create(&self, version: Direct3DVersion, context: Arc<BackendContext>) -> Result<Box<dyn Backend>, CaptureError>;
}

pub struct EntryPoint {
    link: Arc<dyn AgentLink>,
    settings: AgentSettings,
    pid: u32,
    exit: Arc<ExitSignal>,
}

impl EntryPoint {
    pub fn new(link: Arc<dyn AgentLink>, settings: AgentSettings, pid: u32) -> Self {
        Self {
            link,
            settings,
            pid,
            exit: Arc::new(ExitSignal::new()),
        }
    }

    /// Signal that ends `run`. Exposed for unload paths outside the controller.
    pub fn exit_signal(&self) -> Arc<ExitSignal> {
        self.exit.clone()
    }

    /// Blocks until the controller disconnects or stops answering pings.
    pub fn run(&self, probe: &dyn ModuleProbe, factory: &dyn BackendFactory) -> Result<(), CaptureError> {
        self.link
            .ping(self.settings.watchdog_interval.max(Duration::from_secs(1)))
            .map_err(|e| CaptureError::Channel(format!("controller did not answer initial ping: {}", e)))?;

        let sink_link = self.link.clone();
        let sink: EventSink = Arc::new(move |event: AgentEvent| sink_link.send(event));
        let context = BackendContext::new(self.link.config(), self.settings.clone(), sink);

        let forward = self.link.clone();
        logger::set_remote_sink(move |severity, text| {
            let _ = forward.send(AgentEvent::RemoteMessage {
                severity,
                text: text.to_string(),
            });
        });

        let listener = {
            let context = context.clone();
            let exit = self.exit.clone();
            self.link.events().subscribe(move |event: &ControllerEvent| {
                match event {
                    ControllerEvent::Disconnected => {
                        if exit.set() {
                            log_info!("Controller disconnected");
                        }
                    }
                    other => context.handle_event(other),
                }
                Ok(())
            })
        };

        let result = self.run_backend(probe, factory, context.clone());

        self.link.events().unsubscribe(listener);
        context.shutdown();
        if let Err(e) = &result {
            log_error!("Agent stopped: {}", e);
        }
        logger::clear_remote_sink();
        self.link.close();
        result
    }

    fn run_backend(
        &self,
        probe: &dyn ModuleProbe,
        factory: &dyn BackendFactory,
        context: Arc<BackendContext>,
    ) -> Result<(), CaptureError> {
        let configured = context.config().direct3d_version;
        let version = resolve_version(configured, probe, &self.settings)?;

        let mut backend = factory.create(version, context)?;
        let installed = backend.hook().and_then(|_| backend.activate());
        if let Err(e) = installed {
            backend.unhook(self.settings.teardown_grace);
            backend.release();
            return Err(CaptureError::Configuration(format!("failed to hook {}: {:#}", version, e)));
        }
        log_info!("{} hooks active for {}", backend.hook_count(), version);

        let _ = self.link.send(AgentEvent::Connected {
            pid: self.pid,
            direct3d_version: backend.version(),
        });
        let _ = self.link.send(AgentEvent::RemoteMessage {
            severity: MessageSeverity::Information,
            text: format!("{} hooks installed", version),
        });

        let watchdog = Watchdog::start(self.link.clone(), self.exit.clone(), self.settings.watchdog_interval);
        self.exit.wait();

        watchdog.stop();
        backend.unhook(self.settings.teardown_grace);
        backend.release();
        log_info!("Agent unhooked from {}", version);
        Ok(())
    }
}
