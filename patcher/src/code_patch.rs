//! Reversible byte patches.
//!
//! Writing always happens inside a protection round trip: unprotect, write, then put back
//! whatever protection the page had before (never a fixed default).  If the unprotect fails
//! nothing has been written.

use tracing::{error, info, warn};

use shared_dx::error::{HookError, Result};
use util::memory::{ProcessMemory, PAGE_EXECUTE_READWRITE};

use crate::address::ResolvedAddress;
use crate::signature::{self, format_bytes};

/// Write `bytes` at `address` with the pages temporarily made writable.
pub unsafe fn write_protected<M: ProcessMemory>(
    mem: &M,
    address: usize,
    bytes: &[u8],
) -> Result<()> {
    let old_prot = mem.protect(address, bytes.len(), PAGE_EXECUTE_READWRITE)?;
    let written = mem.write_bytes(address, bytes);
    if let Err(e) = mem.protect(address, bytes.len(), old_prot) {
        // the bytes (if written) stay written; the page is just left more permissive than it was
        error!("failed to restore protection {:x} at {:x}: {}", old_prot, address, e);
    }
    written
}

/// Overwrite `new_bytes.len()` bytes at `address`, returning the bytes that were there.
pub unsafe fn install<M: ProcessMemory>(
    mem: &M,
    address: usize,
    new_bytes: &[u8],
) -> Result<Vec<u8>> {
    let original = mem.read_bytes(address, new_bytes.len())?;
    write_protected(mem, address, new_bytes)?;
    Ok(original)
}

/// Put `original` back at `address`.
pub unsafe fn revert<M: ProcessMemory>(mem: &M, address: usize, original: &[u8]) -> Result<()> {
    write_protected(mem, address, original)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Uninstalled,
    Installed,
    /// The signature didn't match.  Terminal for the session.
    Incompatible,
}

/// One fixed-length patch: the bytes that must be there, the bytes to put there instead, and,
/// once installed, the bytes that were really there.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    address: ResolvedAddress,
    expected: Vec<u8>,
    replacement: Vec<u8>,
    original: Option<Vec<u8>>,
    state: PatchState,
}

impl PatchRecord {
    pub fn new(address: ResolvedAddress, expected: &[u8], replacement: &[u8]) -> Result<Self> {
        if expected.len() != replacement.len() {
            return Err(HookError::PatchLengthMismatch {
                expected: expected.len(),
                actual: replacement.len(),
            });
        }
        Ok(Self {
            address,
            expected: expected.to_vec(),
            replacement: replacement.to_vec(),
            original: None,
            state: PatchState::Uninstalled,
        })
    }

    pub fn address(&self) -> ResolvedAddress {
        self.address
    }

    pub fn len(&self) -> usize {
        self.replacement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacement.is_empty()
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn is_installed(&self) -> bool {
        self.state == PatchState::Installed
    }

    /// The bytes saved by `apply`; None unless installed.
    pub fn original_bytes(&self) -> Option<&[u8]> {
        self.original.as_deref()
    }

    /// Verify the signature, then install.  A signature mismatch makes the record
    /// `Incompatible` and it will refuse every later attempt.  A protection failure leaves it
    /// `Uninstalled` with memory untouched.
    pub unsafe fn apply<M: ProcessMemory>(&mut self, mem: &M) -> Result<()> {
        let addr = self.address.absolute();
        match self.state {
            PatchState::Installed => return Err(HookError::PatchAlreadyInstalled(addr)),
            PatchState::Incompatible => return Err(HookError::PatchIncompatible(addr)),
            PatchState::Uninstalled => {}
        }
        if let Err(e) = signature::compare(mem, addr, &self.expected) {
            error!("patch at {} disabled: {}", self.address, e);
            self.state = PatchState::Incompatible;
            return Err(e);
        }
        let original = install(mem, addr, &self.replacement)?;
        info!(
            "patched {}: [{}] -> [{}]",
            self.address,
            format_bytes(&original),
            format_bytes(&self.replacement)
        );
        self.original = Some(original);
        self.state = PatchState::Installed;
        Ok(())
    }

    pub unsafe fn revert<M: ProcessMemory>(&mut self, mem: &M) -> Result<()> {
        let addr = self.address.absolute();
        let original = match (self.state, self.original.as_ref()) {
            (PatchState::Installed, Some(o)) => o,
            _ => return Err(HookError::PatchNotInstalled(addr)),
        };
        match mem.read_bytes(addr, self.replacement.len()) {
            Ok(ref cur) if *cur != self.replacement => warn!(
                "patch at {} was changed by someone else ([{}]), reverting anyway",
                self.address,
                format_bytes(cur)
            ),
            _ => {}
        }
        revert(mem, addr, original)?;
        info!("reverted patch at {}", self.address);
        self.original = None;
        self.state = PatchState::Uninstalled;
        Ok(())
    }
}
