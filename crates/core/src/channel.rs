//! Envelope transports.
//!
//! [`MemoryTransport`] connects two endpoints inside one process and still runs
//! every envelope through the wire codec. [`PipeTransport`] uses two byte-mode
//! named pipes, one per direction, so a blocked read never stalls a write.

use crate::protocol::{encode_frame, read_frame, Envelope, ProtocolError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub trait Transport: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<(), ProtocolError>;

    /// Blocks until an envelope arrives, the peer closes, or `close` is called.
    fn recv(&self) -> Result<Envelope, ProtocolError>;

    fn close(&self);
}

pub struct MemoryTransport {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Receiver<Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let frame = encode_frame(envelope)?;
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ProtocolError::Closed),
            None => Err(ProtocolError::Closed),
        }
    }

    fn recv(&self) -> Result<Envelope, ProtocolError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ProtocolError::Closed);
            }
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(frame) => return read_frame(&mut Cursor::new(frame)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ProtocolError::Closed),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().take();
    }
}

/// Names of the two pipes serving the agent in process `pid`:
/// (controller to agent, agent to controller).
pub fn pipe_names(pid: u32) -> (String, String) {
    let base = format!(r"\\.\pipe\framehook-{}", pid);
    (format!("{}-c2a", base), format!("{}-a2c", base))
}

#[cfg(windows)]
pub use pipe::{PipeListener, PipeTransport};

#[cfg(windows)]
mod pipe {
    use super::*;
    use crate::{log_debug, log_info};
    use std::io::{Read, Write};
    use std::thread;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{
        CloseHandle, ERROR_BROKEN_PIPE, ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE,
        HANDLE, INVALID_HANDLE_VALUE,
    };
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FlushFileBuffers, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_NONE, OPEN_EXISTING,
        PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND,
    };
    use windows::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, WaitNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    };
    use windows::Win32::System::IO::CancelIoEx;

    const PIPE_BUFFER_SIZE: u32 = 1024 * 1024;

    /// Send-safe wrapper for HANDLE (pipe handles are safe for concurrent I/O)
    #[derive(Clone, Copy)]
    struct SendHandle(HANDLE);
    unsafe impl Send for SendHandle {}
    unsafe impl Sync for SendHandle {}

    impl SendHandle {
        fn get(&self) -> HANDLE {
            self.0
        }
    }

    struct PipeIo(HANDLE);

    impl Read for PipeIo {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut bytes_read = 0u32;
            match unsafe { ReadFile(self.0, Some(buf), Some(&mut bytes_read), None) } {
                Ok(()) => Ok(bytes_read as usize),
                Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
                Err(e) => Err(std::io::Error::other(e)),
            }
        }
    }

    impl Write for PipeIo {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut written = 0u32;
            unsafe { WriteFile(self.0, Some(buf), Some(&mut written), None) }.map_err(std::io::Error::other)?;
            Ok(written as usize)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            unsafe { FlushFileBuffers(self.0) }.map_err(std::io::Error::other)
        }
    }

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub struct PipeTransport {
        reader: Mutex<SendHandle>,
        writer: Mutex<SendHandle>,
        read_raw: SendHandle,
        write_raw: SendHandle,
        closed: AtomicBool,
    }

    impl PipeTransport {
        /// Agent side: open the pipes the controller created for `pid`.
        pub fn connect(pid: u32, timeout: Duration) -> Result<Self, ProtocolError> {
            let (c2a, a2c) = pipe_names(pid);
            let reader = open_pipe(&c2a, GENERIC_READ.0, timeout)?;
            let writer = match open_pipe(&a2c, GENERIC_WRITE.0, timeout) {
                Ok(handle) => handle,
                Err(e) => {
                    unsafe { CloseHandle(reader.get()).ok() };
                    return Err(e);
                }
            };
            log_debug!("Opened controller pipes for pid {}", pid);
            Ok(Self::from_handles(reader, writer))
        }

        fn from_handles(reader: SendHandle, writer: SendHandle) -> Self {
            Self {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                read_raw: reader,
                write_raw: writer,
                closed: AtomicBool::new(false),
            }
        }
    }

    /// Controller side: both pipes for one agent, created before the agent exists.
    pub struct PipeListener {
        pid: u32,
        outbound: SendHandle,
        inbound: SendHandle,
        taken: AtomicBool,
        cancelled: AtomicBool,
    }

    impl PipeListener {
        pub fn bind(pid: u32) -> Result<Self, ProtocolError> {
            let (c2a, a2c) = pipe_names(pid);
            let outbound = create_pipe(&c2a, true)?;
            let inbound = match create_pipe(&a2c, false) {
                Ok(handle) => handle,
                Err(e) => {
                    unsafe { CloseHandle(outbound.get()).ok() };
                    return Err(e);
                }
            };
            log_debug!("Created pipes {} and {}", c2a, a2c);
            Ok(Self {
                pid,
                outbound,
                inbound,
                taken: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            })
        }

        /// Blocks until the agent opens both pipes. Succeeds at most once.
        pub fn accept(&self) -> Result<PipeTransport, ProtocolError> {
            if self.taken.load(Ordering::Acquire) {
                return Err(ProtocolError::Closed);
            }
            log_info!("Waiting for agent on pid {}", self.pid);
            connect(self.outbound).and_then(|_| connect(self.inbound))?;
            if self.cancelled.load(Ordering::Acquire) {
                return Err(ProtocolError::Closed);
            }
            self.taken.store(true, Ordering::Release);
            log_info!("Agent connected for pid {}", self.pid);
            Ok(PipeTransport::from_handles(self.inbound, self.outbound))
        }

        /// Wakes a blocked `accept` by connecting throwaway client ends.
        pub fn cancel(&self) {
            if self.taken.load(Ordering::Acquire) || self.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            let (c2a, a2c) = pipe_names(self.pid);
            for (name, access) in [(c2a, GENERIC_READ.0), (a2c, GENERIC_WRITE.0)] {
                if let Ok(handle) = open_pipe(&name, access, Duration::ZERO) {
                    unsafe { CloseHandle(handle.get()).ok() };
                }
            }
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            if !self.taken.load(Ordering::Acquire) {
                unsafe {
                    CloseHandle(self.outbound.get()).ok();
                    CloseHandle(self.inbound.get()).ok();
                }
            }
        }
    }

    fn create_pipe(name: &str, outbound: bool) -> Result<SendHandle, ProtocolError> {
        let wide = to_wide(name);
        let access = if outbound { PIPE_ACCESS_OUTBOUND } else { PIPE_ACCESS_INBOUND };
        let handle = unsafe {
            CreateNamedPipeW(
                PCWSTR(wide.as_ptr()),
                access,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                None,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(SendHandle(handle))
    }

    fn connect(handle: SendHandle) -> Result<(), ProtocolError> {
        match unsafe { ConnectNamedPipe(handle.get(), None) } {
            Ok(()) => Ok(()),
            Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => Ok(()),
            Err(e) => Err(std::io::Error::other(e).into()),
        }
    }

    fn open_pipe(name: &str, access: u32, timeout: Duration) -> Result<SendHandle, ProtocolError> {
        let wide = to_wide(name);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let opened = unsafe {
                CreateFileW(
                    PCWSTR(wide.as_ptr()),
                    access,
                    FILE_SHARE_NONE,
                    None,
                    OPEN_EXISTING,
                    FILE_ATTRIBUTE_NORMAL,
                    None,
                )
            };
            match opened {
                Ok(handle) => return Ok(SendHandle(handle)),
                Err(e) if std::time::Instant::now() < deadline => {
                    if e.code() == ERROR_PIPE_BUSY.to_hresult() {
                        unsafe {
                            let _ = WaitNamedPipeW(PCWSTR(wide.as_ptr()), 100);
                        }
                    } else {
                        thread::sleep(Duration::from_millis(50));
                    }
                }
                Err(e) => return Err(std::io::Error::other(e).into()),
            }
        }
    }

    impl Transport for PipeTransport {
        fn send(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(ProtocolError::Closed);
            }
            let frame = encode_frame(envelope)?;
            let writer = self.writer.lock();
            let mut io = PipeIo(writer.get());
            io.write_all(&frame)?;
            Ok(())
        }

        fn recv(&self) -> Result<Envelope, ProtocolError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(ProtocolError::Closed);
            }
            let reader = self.reader.lock();
            read_frame(&mut PipeIo(reader.get()))
        }

        fn close(&self) {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            // Wake any thread blocked in ReadFile or WriteFile
            unsafe {
                let _ = CancelIoEx(self.read_raw.get(), None);
                let _ = CancelIoEx(self.write_raw.get(), None);
            }
        }
    }

    impl Drop for PipeTransport {
        fn drop(&mut self) {
            self.close();
            unsafe {
                CloseHandle(self.read_raw.get()).ok();
                CloseHandle(self.write_raw.get()).ok();
            }
        }
    }
}
