//! Access to our own process's memory.
//!
//! Reads are fallible: an address that isn't mapped (or is a guard page) comes back as
//! `HookError::MemoryFault` instead of taking the host down.  Almost every address we read
//! belongs to some other module and was computed from an offset that is only right for one
//! build, so that matters.
//!
//! Writes and protection changes are `unsafe`.  The caller is responsible for knowing what it is
//! overwriting.

use shared_dx::error::{HookError, Result};

// winnt.h page protection constants
pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;

pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// True if `protection` allows writes (ignoring modifier bits like PAGE_GUARD).
pub fn is_writable(protection: u32) -> bool {
    protection & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
        != 0
}

pub fn is_readable(protection: u32) -> bool {
    protection
        & (PAGE_READONLY
            | PAGE_READWRITE
            | PAGE_WRITECOPY
            | PAGE_EXECUTE_READ
            | PAGE_EXECUTE_READWRITE
            | PAGE_EXECUTE_WRITECOPY)
        != 0
}

pub trait ProcessMemory {
    /// Fill `buf` from `address`.  Either the whole buffer is read or an error is returned.
    fn read_into(&self, address: usize, buf: &mut [u8]) -> Result<()>;

    /// Overwrite `bytes.len()` bytes at `address`.  The pages must already be writable.
    unsafe fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()>;

    /// Change the protection of the pages covering `address..address+len`, returning the
    /// previous protection.
    unsafe fn protect(&self, address: usize, len: usize, protection: u32) -> Result<u32>;

    /// Load address of a module, or of the host executable when `name` is None.  None if the
    /// module isn't loaded.
    fn module_base(&self, name: Option<&str>) -> Option<usize>;

    fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, address: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_into(address, &mut b)?;
        Ok(b[0])
    }

    fn read_u32(&self, address: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_into(address, &mut b)?;
        Ok(u32::from_ne_bytes(b))
    }

    fn read_i32(&self, address: usize) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_into(address, &mut b)?;
        Ok(i32::from_ne_bytes(b))
    }

    fn read_usize(&self, address: usize) -> Result<usize> {
        let mut b = [0u8; PTR_SIZE];
        self.read_into(address, &mut b)?;
        Ok(usize::from_ne_bytes(b))
    }

    /// Read a pointer and follow it: returns the address stored at `address`, or an error if it
    /// is null.
    fn read_ptr(&self, address: usize) -> Result<usize> {
        match self.read_usize(address)? {
            0 => Err(HookError::MemoryFault {
                address,
                len: PTR_SIZE,
            }),
            p => Ok(p),
        }
    }

    unsafe fn write_usize(&self, address: usize, value: usize) -> Result<()> {
        self.write_bytes(address, &value.to_ne_bytes())
    }
}

/// The process we are loaded into.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProcess;

#[cfg(windows)]
impl ProcessMemory for LocalProcess {
    fn read_into(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        use winapi::um::memoryapi::ReadProcessMemory;
        use winapi::um::processthreadsapi::GetCurrentProcess;

        let fault = HookError::MemoryFault {
            address,
            len: buf.len(),
        };
        if address == 0 {
            return Err(fault);
        }
        let mut read: usize = 0;
        // ReadProcessMemory on our own handle validates the range instead of faulting
        let ok = unsafe {
            ReadProcessMemory(
                GetCurrentProcess(),
                address as *const winapi::ctypes::c_void,
                buf.as_mut_ptr() as *mut winapi::ctypes::c_void,
                buf.len(),
                &mut read,
            )
        };
        if ok == 0 || read != buf.len() {
            return Err(fault);
        }
        Ok(())
    }

    unsafe fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        use winapi::um::processthreadsapi::{FlushInstructionCache, GetCurrentProcess};

        if address == 0 {
            return Err(HookError::MemoryFault {
                address,
                len: bytes.len(),
            });
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        FlushInstructionCache(
            GetCurrentProcess(),
            address as *const winapi::ctypes::c_void,
            bytes.len(),
        );
        Ok(())
    }

    unsafe fn protect(&self, address: usize, len: usize, protection: u32) -> Result<u32> {
        crate::util::protect_memory(address as *mut winapi::ctypes::c_void, len, protection)
    }

    fn module_base(&self, name: Option<&str>) -> Option<usize> {
        crate::util::module_handle(name).map(|h| h as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_flags() {
        assert!(is_writable(PAGE_READWRITE));
        assert!(is_writable(PAGE_EXECUTE_READWRITE));
        assert!(is_writable(PAGE_EXECUTE_WRITECOPY));
        assert!(!is_writable(PAGE_EXECUTE_READ));
        assert!(!is_writable(PAGE_READONLY));
        assert!(!is_writable(PAGE_NOACCESS));
        assert!(is_readable(PAGE_EXECUTE_READ));
        assert!(!is_readable(PAGE_EXECUTE));
        assert!(!is_readable(PAGE_NOACCESS));
    }
}
