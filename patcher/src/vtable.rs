//! Vtable slot redirection.
//!
//! The slot lives in the class's vtable, not in the object, so hooking through one instance
//! redirects every instance of that class.  Hooks are never removed: once a trampoline is in
//! a slot it stays there for the life of the process, and there is no uninstall here.
//!
//! Installing is two steps so the caller can publish the original somewhere its trampoline will
//! find it before the slot is redirected: `read_original`, then `redirect`.  `install` does both
//! back to back.

use tracing::{error, info};

use shared_dx::error::{HookError, Result};
use util::memory::{ProcessMemory, PTR_SIZE};

use crate::code_patch::write_protected;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Uninstalled,
    Installed { original: usize },
}

#[derive(Debug, Clone)]
pub struct VTableHook {
    slot_index: usize,
    trampoline: usize,
    state: HookState,
}

impl VTableHook {
    pub fn new(slot_index: usize, trampoline: usize) -> Self {
        Self {
            slot_index,
            trampoline,
            state: HookState::Uninstalled,
        }
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    pub fn state(&self) -> HookState {
        self.state
    }

    pub fn original(&self) -> Option<usize> {
        match self.state {
            HookState::Installed { original } => Some(original),
            HookState::Uninstalled => None,
        }
    }

    /// The original as a typed function pointer.  `F` must be a pointer-sized `fn` type.
    pub unsafe fn original_fn<F: Copy>(&self) -> Option<F> {
        self.original().and_then(|p| fn_from_addr(p))
    }

    /// Address of this hook's slot in `object`'s vtable.
    pub fn slot_address<M: ProcessMemory>(&self, mem: &M, object: usize) -> Result<usize> {
        let vtable = mem.read_ptr(object)?;
        Ok(vtable + self.slot_index * PTR_SIZE)
    }

    /// What the slot currently calls.  Writes nothing.  Refuses a slot that already holds the
    /// trampoline, since calling that "original" would recurse forever.
    pub fn read_original<M: ProcessMemory>(&self, mem: &M, object: usize) -> Result<usize> {
        if let HookState::Installed { .. } = self.state {
            return Err(HookError::HookAlreadyInstalled(self.slot_index));
        }
        let slot = self.slot_address(mem, object)?;
        let original = mem.read_usize(slot)?;
        if original == self.trampoline {
            // somebody (probably us, from an earlier load) already did this
            error!(
                "error: vtable slot {} at {:x} already appears to be hooked",
                self.slot_index, slot
            );
            return Err(HookError::HookAlreadyInstalled(self.slot_index));
        }
        Ok(original)
    }

    /// Point the slot at the trampoline.  `original` must be what `read_original` returned; if
    /// the slot has changed since, nothing is written.
    pub unsafe fn redirect<M: ProcessMemory>(
        &mut self,
        mem: &M,
        object: usize,
        original: usize,
    ) -> Result<()> {
        if let HookState::Installed { .. } = self.state {
            return Err(HookError::HookAlreadyInstalled(self.slot_index));
        }
        let slot = self.slot_address(mem, object)?;
        let current = mem.read_usize(slot)?;
        if current != original {
            return Err(HookError::BadStateError(format!(
                "vtable slot {} at {:x} changed from {:x} to {:x}",
                self.slot_index, slot, original, current
            )));
        }
        write_protected(mem, slot, &self.trampoline.to_ne_bytes())?;
        info!(
            "hooked vtable slot {} at {:x}: real {:x}, hook {:x}",
            self.slot_index, slot, original, self.trampoline
        );
        self.state = HookState::Installed { original };
        Ok(())
    }

    /// Point the slot at the trampoline and return what was there.
    pub unsafe fn install<M: ProcessMemory>(&mut self, mem: &M, object: usize) -> Result<usize> {
        let original = self.read_original(mem, object)?;
        self.redirect(mem, object, original)?;
        Ok(original)
    }
}

/// `addr` as a typed function pointer.  None for null, or if `F` isn't pointer sized.
pub unsafe fn fn_from_addr<F: Copy>(addr: usize) -> Option<F> {
    if addr == 0 || std::mem::size_of::<F>() != PTR_SIZE {
        return None;
    }
    Some(std::mem::transmute_copy::<usize, F>(&addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use util::memory::*;
    use util::mock_memory::MockMemory;

    const VTBL: usize = 0x10_0000;
    const OBJ_A: usize = 0x20_0000;
    const OBJ_B: usize = 0x20_1000;

    fn class_with_two_instances() -> MockMemory {
        let mem = MockMemory::new();
        let slots: Vec<u8> = (0..16usize)
            .flat_map(|i| (0x5000_0000usize + i * 0x100).to_ne_bytes())
            .collect();
        mem.map_bytes(VTBL, &slots, PAGE_READONLY);
        mem.map(OBJ_A, 64, PAGE_READWRITE);
        mem.map(OBJ_B, 64, PAGE_READWRITE);
        mem.poke_usize(OBJ_A, VTBL);
        mem.poke_usize(OBJ_B, VTBL);
        mem
    }

    fn call_target(mem: &MockMemory, object: usize, slot: usize) -> usize {
        let vtbl = mem.read_ptr(object).unwrap();
        mem.read_usize(vtbl + slot * PTR_SIZE).unwrap()
    }

    #[test]
    fn install_returns_original_and_redirects_class() {
        let mem = class_with_two_instances();
        let mut hook = VTableHook::new(8, 0xDEAD_0000);
        assert_eq!(hook.state(), HookState::Uninstalled);
        let orig = unsafe { hook.install(&mem, OBJ_A).unwrap() };
        assert_eq!(orig, 0x5000_0800);
        assert_eq!(
            hook.state(),
            HookState::Installed {
                original: 0x5000_0800
            }
        );
        // B was never passed in but shares A's vtable
        assert_eq!(call_target(&mem, OBJ_A, 8), 0xDEAD_0000);
        assert_eq!(call_target(&mem, OBJ_B, 8), 0xDEAD_0000);
        // neighbours untouched
        assert_eq!(call_target(&mem, OBJ_B, 7), 0x5000_0700);
        assert_eq!(call_target(&mem, OBJ_B, 9), 0x5000_0900);
        // vtable page went back to read only
        assert_eq!(mem.protection_at(VTBL), Some(PAGE_READONLY));
    }

    #[test]
    fn second_install_refused() {
        let mem = class_with_two_instances();
        let mut hook = VTableHook::new(12, 0xDEAD_0000);
        unsafe {
            hook.install(&mem, OBJ_A).unwrap();
            assert!(matches!(
                hook.install(&mem, OBJ_B),
                Err(HookError::HookAlreadyInstalled(12))
            ));
            // a fresh hook object with the same trampoline sees the slot is already ours
            let mut again = VTableHook::new(12, 0xDEAD_0000);
            assert!(matches!(
                again.install(&mem, OBJ_B),
                Err(HookError::HookAlreadyInstalled(12))
            ));
            assert_eq!(again.original(), None);
        }
        assert_eq!(hook.original(), Some(0x5000_0C00));
    }

    #[test]
    fn null_object_is_a_fault() {
        let mem = class_with_two_instances();
        mem.map(0x30_0000, 16, PAGE_READWRITE);
        let mut hook = VTableHook::new(8, 0xDEAD_0000);
        unsafe {
            assert!(hook.install(&mem, 0x30_0000).is_err());
            assert!(hook.install(&mem, 0).is_err());
        }
        assert_eq!(hook.state(), HookState::Uninstalled);
    }

    #[test]
    fn typed_original() {
        let mem = class_with_two_instances();
        let mut hook = VTableHook::new(3, 0xDEAD_0000);
        type F = unsafe extern "system" fn(u32) -> u32;
        unsafe {
            assert!(hook.original_fn::<F>().is_none());
            hook.install(&mem, OBJ_A).unwrap();
            let f: Option<F> = hook.original_fn();
            assert_eq!(f.map(|f| f as usize), Some(0x5000_0300));
            assert!(hook.original_fn::<u8>().is_none());
        }
    }

    #[test]
    fn original_is_known_before_the_slot_moves() {
        let mem = class_with_two_instances();
        let mut hook = VTableHook::new(8, 0xDEAD_0000);
        let orig = hook.read_original(&mem, OBJ_A).unwrap();
        assert_eq!(orig, 0x5000_0800);
        assert_eq!(mem.write_count(), 0);
        assert_eq!(call_target(&mem, OBJ_B, 8), 0x5000_0800);
        assert_eq!(hook.state(), HookState::Uninstalled);

        unsafe { hook.redirect(&mem, OBJ_B, orig).unwrap() };
        assert_eq!(call_target(&mem, OBJ_A, 8), 0xDEAD_0000);
        assert_eq!(hook.original(), Some(orig));
    }

    #[test]
    fn redirect_refuses_a_slot_that_moved() {
        let mem = class_with_two_instances();
        let mut hook = VTableHook::new(9, 0xDEAD_0000);
        let orig = hook.read_original(&mem, OBJ_A).unwrap();
        // someone else hooks it in between
        unsafe { VTableHook::new(9, 0xBEEF_0000).install(&mem, OBJ_A).unwrap() };
        let writes = mem.write_count();
        assert!(matches!(
            unsafe { hook.redirect(&mem, OBJ_A, orig) },
            Err(HookError::BadStateError(_))
        ));
        assert_eq!(mem.write_count(), writes);
        assert_eq!(call_target(&mem, OBJ_A, 9), 0xBEEF_0000);
        assert_eq!(hook.state(), HookState::Uninstalled);
    }

    #[test]
    fn fn_from_addr_rejects_null() {
        type F = unsafe extern "system" fn(u32) -> u32;
        unsafe {
            assert!(fn_from_addr::<F>(0).is_none());
            assert_eq!(fn_from_addr::<F>(0x1234).map(|f| f as usize), Some(0x1234));
        }
    }
}
