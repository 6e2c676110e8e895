use crate::session::ProcessWatch;
use anyhow::Context;
use framehook_core::log_debug;
use std::thread;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Threading::{OpenProcess, WaitForSingleObject, INFINITE, PROCESS_SYNCHRONIZE};

struct SendHandle(HANDLE);
unsafe impl Send for SendHandle {}

/// Waits on the process handle from a dedicated thread.
pub struct ProcessExitWatch;

impl ProcessWatch for ProcessExitWatch {
    fn on_exit(&self, pid: u32, callback: Box<dyn FnOnce() + Send>) -> anyhow::Result<()> {
        let handle = unsafe { OpenProcess(PROCESS_SYNCHRONIZE, false, pid) }
            .with_context(|| format!("Failed to open process {}", pid))?;
        let handle = SendHandle(handle);

        thread::Builder::new()
            .name(format!("framehook-exit-{}", pid))
            .spawn(move || {
                let handle = handle;
                let waited = unsafe { WaitForSingleObject(handle.0, INFINITE) };
                unsafe { CloseHandle(handle.0).ok() };
                if waited == WAIT_OBJECT_0 {
                    callback();
                } else {
                    log_debug!("Wait on process {} ended with {:?}", pid, waited);
                }
            })
            .context("Failed to spawn exit watcher")?;
        Ok(())
    }
}
