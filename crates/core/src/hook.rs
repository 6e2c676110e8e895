//! Single-writer lifecycle for patched entry points.
//!
//! A hook moves Installed -> Active -> Deactivated -> Disposed and never back.
//! Deactivation restores the original pointer and closes the gate; disposal
//! waits for callers already inside the detour to leave.

use crate::{log_debug, log_warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookState {
    Installed,
    Active,
    Deactivated,
    Disposed,
}

/// Where a detour is written. Implementations swap one pointer-sized value.
pub trait PatchSite: Send {
    /// Current value at the site.
    fn read(&self) -> usize;

    /// # Safety
    /// `value` must be a function with the ABI expected at this site.
    unsafe fn write(&self, value: usize) -> anyhow::Result<()>;

    /// Called once on disposal.
    fn release(&mut self) {}
}

/// Admission control for a detour body.
#[derive(Debug, Default)]
pub struct HookGate {
    active: AtomicBool,
    in_flight: AtomicUsize,
}

pub struct GateGuard<'a> {
    gate: &'a HookGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl HookGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits the caller while the hook is active. `None` means call straight through.
    pub fn enter(&self) -> Option<GateGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.active.load(Ordering::Acquire) {
            Some(GateGuard { gate: self })
        } else {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn open(&self) {
        self.active.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Waits until no caller is inside the detour. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

pub struct Hook<P: PatchSite> {
    name: &'static str,
    site: P,
    detour: usize,
    trampoline: usize,
    gate: Arc<HookGate>,
    state: Mutex<HookState>,
}

impl<P: PatchSite> Hook<P> {
    /// Records the original pointer at `site`. Nothing is patched until `activate`.
    pub fn install(name: &'static str, site: P, detour: usize, gate: Arc<HookGate>) -> Self {
        let trampoline = site.read();
        log_debug!("Installed hook {} (original {:#x})", name, trampoline);
        Self {
            name,
            site,
            detour,
            trampoline,
            gate,
            state: Mutex::new(HookState::Installed),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The original function, to be called after the detour body.
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    pub fn gate(&self) -> &Arc<HookGate> {
        &self.gate
    }

    pub fn state(&self) -> HookState {
        *self.state.lock()
    }

    pub fn activate(&self) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        if *state != HookState::Installed {
            return Ok(false);
        }
        self.gate.open();
        if let Err(e) = unsafe { self.site.write(self.detour) } {
            self.gate.close();
            return Err(e);
        }
        *state = HookState::Active;
        Ok(true)
    }

    pub fn deactivate(&self) -> bool {
        let mut state = self.state.lock();
        if *state != HookState::Active {
            return false;
        }
        self.gate.close();
        // Only restore if nobody re-patched the site behind our back
        if self.site.read() == self.detour {
            if let Err(e) = unsafe { self.site.write(self.trampoline) } {
                log_warn!("Failed to restore {}: {}", self.name, e);
            }
        }
        *state = HookState::Deactivated;
        true
    }

    pub fn dispose(&mut self, timeout: Duration) -> bool {
        {
            let state = self.state.lock();
            if matches!(*state, HookState::Disposed | HookState::Active) {
                return false;
            }
        }
        if !self.gate.wait_idle(timeout) {
            log_warn!("{} still has {} caller(s) in flight at dispose", self.name, self.gate.in_flight());
        }
        self.site.release();
        *self.state.lock() = HookState::Disposed;
        true
    }
}

/// Ordered hooks owned by one backend.
pub struct HookSet<P: PatchSite> {
    hooks: Vec<Hook<P>>,
}

impl<P: PatchSite> Default for HookSet<P> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<P: PatchSite> HookSet<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Hook<P>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hook<P>> {
        self.hooks.iter()
    }

    pub fn activate_all(&self) -> anyhow::Result<()> {
        for hook in &self.hooks {
            hook.activate()?;
        }
        Ok(())
    }

    /// Deactivates every hook, waits `grace`, then disposes every hook.
    pub fn teardown(&mut self, grace: Duration) {
        for hook in &self.hooks {
            hook.deactivate();
        }
        std::thread::sleep(grace);
        for hook in &mut self.hooks {
            hook.dispose(grace);
        }
        self.hooks.clear();
    }
}
