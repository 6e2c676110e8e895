use crate::session::Injector;
use anyhow::{anyhow, bail, Context, Result};
use framehook_core::log_info;
use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;
use windows::core::{s, w};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::{VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, OpenProcess, WaitForSingleObject, LPTHREAD_START_ROUTINE,
    PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
};

/// Loads the agent with a remote `LoadLibraryW` call.
pub struct RemoteThreadInjector {
    pub timeout: Duration,
}

impl Default for RemoteThreadInjector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0).ok() };
    }
}

/// Memory committed in the target; released on drop.
struct RemoteBuffer<'a> {
    process: &'a OwnedHandle,
    address: *mut c_void,
}

impl Drop for RemoteBuffer<'_> {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFreeEx(self.process.0, self.address, 0, MEM_RELEASE);
        }
    }
}

impl Injector for RemoteThreadInjector {
    fn inject(&self, pid: u32, module: &Path) -> Result<()> {
        let module = module
            .canonicalize()
            .with_context(|| format!("Agent module {} not found", module.display()))?;
        let wide: Vec<u16> = module.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
        let size = wide.len() * std::mem::size_of::<u16>();

        let access = PROCESS_CREATE_THREAD | PROCESS_QUERY_INFORMATION | PROCESS_VM_OPERATION | PROCESS_VM_WRITE | PROCESS_VM_READ;
        let process = OwnedHandle(
            unsafe { OpenProcess(access, false, pid) }.with_context(|| format!("Failed to open process {}", pid))?,
        );

        let address = unsafe { VirtualAllocEx(process.0, None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if address.is_null() {
            bail!("VirtualAllocEx failed: {}", std::io::Error::last_os_error());
        }
        let buffer = RemoteBuffer {
            process: &process,
            address,
        };
        unsafe { WriteProcessMemory(process.0, buffer.address, wide.as_ptr() as *const c_void, size, None) }
            .context("Failed to write agent path")?;

        // kernel32 is mapped at the same base in every process of a session
        let kernel32 = unsafe { GetModuleHandleW(w!("kernel32.dll")) }.context("kernel32 not loaded")?;
        let load_library =
            unsafe { GetProcAddress(kernel32, s!("LoadLibraryW")) }.ok_or_else(|| anyhow!("LoadLibraryW not found"))?;
        let start: LPTHREAD_START_ROUTINE = unsafe { std::mem::transmute(load_library) };

        let thread = OwnedHandle(
            unsafe { CreateRemoteThread(process.0, None, 0, start, Some(buffer.address as *const c_void), 0, None) }
                .context("CreateRemoteThread failed")?,
        );
        let waited = unsafe { WaitForSingleObject(thread.0, self.timeout.as_millis() as u32) };
        if waited != WAIT_OBJECT_0 {
            // The remote thread may still read the path; leak the buffer rather than free it under it
            std::mem::forget(buffer);
            bail!("LoadLibraryW did not return within {:?}", self.timeout);
        }

        let mut exit_code = 0u32;
        unsafe { GetExitCodeThread(thread.0, &mut exit_code) }.context("GetExitCodeThread failed")?;
        if exit_code == 0 {
            bail!("LoadLibraryW failed in process {}", pid);
        }
        log_info!("Agent loaded into process {}", pid);
        Ok(())
    }
}
