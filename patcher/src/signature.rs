//! Check the bytes at an address before patching them.  This is the only thing standing between
//! a patch and a build it wasn't written for, so a mismatch always logs both byte strings.

use tracing::error;

use shared_dx::error::{HookError, Result};
use util::memory::ProcessMemory;

/// "0F 84 EB 01 00 00"
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ok if the bytes at `address` are exactly `expected`.  An unreadable address is a
/// `MemoryFault`, a difference is a `SignatureMismatch` carrying both dumps.
pub fn compare<M: ProcessMemory>(mem: &M, address: usize, expected: &[u8]) -> Result<()> {
    let actual = mem.read_bytes(address, expected.len())?;
    if actual != expected {
        return Err(HookError::SignatureMismatch {
            address,
            expected: format_bytes(expected),
            actual: format_bytes(&actual),
        });
    }
    Ok(())
}

pub fn verify<M: ProcessMemory>(mem: &M, address: usize, expected: &[u8]) -> bool {
    match compare(mem, address, expected) {
        Ok(()) => true,
        Err(e) => {
            error!("signature check failed: {}", e);
            false
        }
    }
}
