//! Vtable slot patching.

use anyhow::{bail, Result};
use framehook_core::hook::PatchSite;
use std::sync::atomic::{AtomicUsize, Ordering};
use windows::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS};

/// One pointer-sized entry in a COM vtable shared by every instance of a class.
pub struct VTableSlot {
    address: usize,
}

impl VTableSlot {
    /// # Safety
    /// `vtable` must point at a live vtable with more than `index` entries.
    pub unsafe fn new(vtable: *const usize, index: usize) -> Self {
        Self {
            address: vtable.add(index) as usize,
        }
    }

    fn cell(&self) -> &AtomicUsize {
        // Slots are pointer-aligned, so an atomic view of the entry is sound
        unsafe { &*(self.address as *const AtomicUsize) }
    }
}

// The slot lives in a module image that outlives the agent.
unsafe impl Send for VTableSlot {}

impl PatchSite for VTableSlot {
    fn read(&self) -> usize {
        self.cell().load(Ordering::Acquire)
    }

    unsafe fn write(&self, value: usize) -> Result<()> {
        let size = std::mem::size_of::<usize>();
        let mut previous = PAGE_PROTECTION_FLAGS(0);
        VirtualProtect(self.address as *const _, size, PAGE_EXECUTE_READWRITE, &mut previous)?;
        self.cell().store(value, Ordering::Release);
        let mut ignored = PAGE_PROTECTION_FLAGS(0);
        if VirtualProtect(self.address as *const _, size, previous, &mut ignored).is_err() {
            bail!("slot at {:#x} patched but protection not restored", self.address);
        }
        Ok(())
    }
}
