//! FrameHook agent: loaded into the target process, hooks the active
//! Direct3D API and serves capture and overlay requests from the controller.

pub mod boundary;
pub mod context;
pub mod detect;
pub mod entry;
pub mod link;
pub mod overlay;
pub mod readback;
pub mod vtable;
pub mod watchdog;

#[cfg(windows)]
pub mod backend;
#[cfg(windows)]
pub mod patch;

pub use context::{BackendContext, FrameTarget};
pub use entry::{Backend, BackendFactory, EntryPoint};
pub use link::{AgentLink, TransportLink};

#[cfg(windows)]
mod dll {
    use crate::backend::D3DBackendFactory;
    use crate::detect::LoadedModules;
    use crate::entry::EntryPoint;
    use crate::link::TransportLink;
    use anyhow::{Context, Result};
    use framehook_core::logger::{finalize_logs, init_logger};
    use framehook_core::{log_error, log_info, Config, PipeTransport};
    use std::ffi::c_void;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use windows::core::BOOL;
    use windows::Win32::Foundation::HINSTANCE;
    use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
    use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;
    use windows::Win32::System::Threading::GetCurrentProcessId;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    fn run_agent() -> Result<()> {
        let config = Config::new()?;
        let app_config = config.load()?;
        init_logger(config.log_dir.clone(), "agent", app_config.log_retention_count, false)?;

        let pid = unsafe { GetCurrentProcessId() };
        log_info!("Agent loaded into process {}", pid);

        let transport = PipeTransport::connect(pid, CONNECT_TIMEOUT).context("Failed to open controller pipes")?;
        let link = TransportLink::connect(transport, pid, CONNECT_TIMEOUT)?;

        let entry = EntryPoint::new(Arc::new(link), app_config.agent, pid);
        entry.run(&LoadedModules, &D3DBackendFactory)?;
        Ok(())
    }

    #[no_mangle]
    pub extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
        if reason == DLL_PROCESS_ATTACH {
            unsafe {
                let _ = DisableThreadLibraryCalls(module.into());
            }
            // Loader lock is held here; everything else happens on our own thread
            let spawned = thread::Builder::new().name("framehook-agent".into()).spawn(|| {
                if let Err(e) = run_agent() {
                    log_error!("Agent terminated: {:#}", e);
                }
                let _ = finalize_logs();
            });
            if spawned.is_err() {
                return false.into();
            }
        }
        true.into()
    }
}
