//! A fake address space for tests: a handful of mapped regions, each with its own protection.
//!
//! Protection is tracked per region rather than per page, which is enough for the small blocks
//! tests map.  Writes to a non-writable region fail the way an access violation would, so a
//! patcher that forgets to unprotect is caught.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use shared_dx::error::{HookError, Result};

use crate::memory::*;

#[derive(Debug)]
struct Region {
    base: usize,
    data: Vec<u8>,
    protection: u32,
}

impl Region {
    fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .map_or(false, |end| end <= self.base + self.data.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectCall {
    pub address: usize,
    pub len: usize,
    pub protection: u32,
}

#[derive(Debug, Default)]
pub struct MockMemory {
    regions: RefCell<Vec<Region>>,
    modules: RefCell<HashMap<String, usize>>,
    exe_base: Cell<Option<usize>>,
    protect_log: RefCell<Vec<ProtectCall>>,
    fail_protect: Cell<bool>,
    write_count: Cell<usize>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` zeroed bytes at `base`.
    pub fn map(&self, base: usize, size: usize, protection: u32) {
        self.map_bytes(base, &vec![0u8; size], protection);
    }

    pub fn map_bytes(&self, base: usize, bytes: &[u8], protection: u32) {
        self.regions.borrow_mut().push(Region {
            base,
            data: bytes.to_vec(),
            protection,
        });
    }

    pub fn add_module(&self, name: &str, base: usize) {
        self.modules.borrow_mut().insert(name.to_lowercase(), base);
    }

    pub fn set_exe_base(&self, base: usize) {
        self.exe_base.set(Some(base));
    }

    /// Read ignoring protection; for assertions.
    pub fn peek(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        let regions = self.regions.borrow();
        let r = regions.iter().find(|r| r.contains(address, len))?;
        let off = address - r.base;
        Some(r.data[off..off + len].to_vec())
    }

    /// Write ignoring protection; for test setup.  Panics if the range isn't mapped.
    pub fn poke(&self, address: usize, bytes: &[u8]) {
        let mut regions = self.regions.borrow_mut();
        let r = regions
            .iter_mut()
            .find(|r| r.contains(address, bytes.len()))
            .unwrap_or_else(|| panic!("poke of unmapped range {:#x}+{}", address, bytes.len()));
        let off = address - r.base;
        r.data[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub fn poke_usize(&self, address: usize, value: usize) {
        self.poke(address, &value.to_ne_bytes());
    }

    pub fn poke_i32(&self, address: usize, value: i32) {
        self.poke(address, &value.to_ne_bytes());
    }

    pub fn protection_at(&self, address: usize) -> Option<u32> {
        self.regions
            .borrow()
            .iter()
            .find(|r| r.contains(address, 1))
            .map(|r| r.protection)
    }

    pub fn protect_log(&self) -> Vec<ProtectCall> {
        self.protect_log.borrow().clone()
    }

    /// Make every subsequent `protect` call fail.
    pub fn set_fail_protect(&self, fail: bool) {
        self.fail_protect.set(fail);
    }

    /// Number of successful `write_bytes` calls.
    pub fn write_count(&self) -> usize {
        self.write_count.get()
    }
}

impl ProcessMemory for MockMemory {
    fn read_into(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        let regions = self.regions.borrow();
        let r = regions
            .iter()
            .find(|r| r.contains(address, buf.len()) && is_readable(r.protection))
            .ok_or(HookError::MemoryFault {
                address,
                len: buf.len(),
            })?;
        let off = address - r.base;
        buf.copy_from_slice(&r.data[off..off + buf.len()]);
        Ok(())
    }

    unsafe fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        let mut regions = self.regions.borrow_mut();
        let r = regions
            .iter_mut()
            .find(|r| r.contains(address, bytes.len()) && is_writable(r.protection))
            .ok_or(HookError::MemoryFault {
                address,
                len: bytes.len(),
            })?;
        let off = address - r.base;
        r.data[off..off + bytes.len()].copy_from_slice(bytes);
        self.write_count.set(self.write_count.get() + 1);
        Ok(())
    }

    unsafe fn protect(&self, address: usize, len: usize, protection: u32) -> Result<u32> {
        if self.fail_protect.get() {
            return Err(HookError::ProtectFailed { address, len });
        }
        let mut regions = self.regions.borrow_mut();
        let r = regions
            .iter_mut()
            .find(|r| r.contains(address, len))
            .ok_or(HookError::ProtectFailed { address, len })?;
        let old = std::mem::replace(&mut r.protection, protection);
        self.protect_log.borrow_mut().push(ProtectCall {
            address,
            len,
            protection,
        });
        Ok(old)
    }

    fn module_base(&self, name: Option<&str>) -> Option<usize> {
        match name {
            None => self.exe_base.get(),
            Some(n) => self.modules.borrow().get(&n.to_lowercase()).copied(),
        }
    }
}
