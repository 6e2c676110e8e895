use crate::remote::CaptureInterface;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use framehook_core::channel::Transport;
use framehook_core::protocol::{Envelope, ProtocolError};
use framehook_core::{log_debug, log_error, log_info, log_warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Serves one agent over a connected transport.
///
/// The reader thread answers handshakes and pings and routes agent events
/// into the [`CaptureInterface`]. The writer thread drains the interface's
/// outbound queue. Either side failing marks the agent disconnected.
pub struct PipeServer {
    transport: Arc<dyn Transport>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PipeServer {
    pub fn start(
        transport: Arc<dyn Transport>,
        interface: Arc<CaptureInterface>,
        outbound: Receiver<Envelope>,
    ) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let transport = transport.clone();
            let interface = interface.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("framehook-server-write".into())
                .spawn(move || write_loop(transport.as_ref(), &interface, &outbound, &stop))?
        };

        let reader = {
            let transport = transport.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("framehook-server-read".into())
                .spawn(move || {
                    if let Err(e) = read_loop(transport.as_ref(), &interface) {
                        if !stop.load(Ordering::Acquire) {
                            log_warn!("Agent {} channel failed: {}", interface.pid(), e);
                        }
                    }
                    interface.mark_disconnected();
                    stop.store(true, Ordering::Release);
                })?
        };

        log_info!("Serving agent channel");
        Ok(Self {
            transport,
            stop,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Lets the writer flush what is queued, then closes the transport.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.join();
        }
        self.transport.close();
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(transport: &dyn Transport, interface: &CaptureInterface) -> Result<(), ProtocolError> {
    loop {
        let envelope = match transport.recv() {
            Ok(envelope) => envelope,
            Err(ProtocolError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        match envelope {
            Envelope::Hello { pid, version } => {
                log_info!("Agent {} says hello (version {})", pid, version);
                if pid != interface.pid() {
                    log_warn!("Agent reports pid {} on the channel for {}", pid, interface.pid());
                }
                let _ = interface.queue(Envelope::Welcome(interface.config()));
            }
            Envelope::Ping { seq } => {
                let _ = interface.queue(Envelope::Pong { seq, time: Utc::now() });
            }
            Envelope::Agent(event) => interface.on_agent_event(event),
            other => log_debug!("Ignoring unexpected envelope: {:?}", other),
        }
    }
}

fn write_loop(transport: &dyn Transport, interface: &CaptureInterface, outbound: &Receiver<Envelope>, stop: &AtomicBool) {
    loop {
        match outbound.recv_timeout(Duration::from_millis(100)) {
            Ok(envelope) => {
                if let Err(e) = transport.send(&envelope) {
                    log_error!("Failed to send to agent {}: {}", interface.pid(), e);
                    interface.mark_disconnected();
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framehook_core::protocol::{AgentEvent, ControllerEvent};
    use framehook_core::{CaptureConfig, Direct3DVersion, MemoryTransport};

    fn serve() -> (Arc<CaptureInterface>, PipeServer, MemoryTransport) {
        let (controller, agent) = MemoryTransport::pair();
        let config = CaptureConfig {
            show_overlay: true,
            ..CaptureConfig::default()
        };
        let (interface, outbound) = CaptureInterface::new(11, config);
        let server = PipeServer::start(Arc::new(controller), interface.clone(), outbound).unwrap();
        (interface, server, agent)
    }

    #[test]
    fn hello_and_ping_are_answered() {
        let (_interface, _server, agent) = serve();

        agent
            .send(&Envelope::Hello {
                pid: 11,
                version: "test".into(),
            })
            .unwrap();
        match agent.recv().unwrap() {
            Envelope::Welcome(config) => assert!(config.show_overlay),
            other => panic!("expected welcome, got {:?}", other),
        }

        agent.send(&Envelope::Ping { seq: 9 }).unwrap();
        assert!(matches!(agent.recv().unwrap(), Envelope::Pong { seq: 9, .. }));
    }

    #[test]
    fn agent_events_reach_the_interface() {
        let (interface, _server, agent) = serve();
        agent
            .send(&Envelope::Agent(AgentEvent::Connected {
                pid: 11,
                direct3d_version: Direct3DVersion::Direct3D11,
            }))
            .unwrap();
        assert_eq!(
            interface.wait_connected(Duration::from_secs(2)),
            Some(Direct3DVersion::Direct3D11)
        );
    }

    #[test]
    fn commands_are_written_in_order() {
        let (interface, _server, agent) = serve();
        interface.stop_recording().unwrap();
        interface.disconnect();

        assert_eq!(
            agent.recv().unwrap(),
            Envelope::Controller(ControllerEvent::RecordingStopped)
        );
        assert_eq!(agent.recv().unwrap(), Envelope::Controller(ControllerEvent::Disconnected));
    }

    #[test]
    fn closed_peer_marks_agent_disconnected() {
        let (interface, server, agent) = serve();
        agent.close();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.is_running());
        assert!(interface.wait_connected(Duration::from_millis(10)).is_none());
        assert!(interface.stop_recording().is_err());
    }
}
