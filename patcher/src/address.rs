use std::fmt;

use shared_dx::error::{HookError, Result};
use util::memory::ProcessMemory;

/// Module base plus an RVA.  Only meaningful for the build the RVA was taken from, and only
/// until the module is unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub base: usize,
    pub rva: usize,
}

impl ResolvedAddress {
    pub fn absolute(&self) -> usize {
        resolve(self.base, self.rva)
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({:#x}+{:#x})", self.absolute(), self.base, self.rva)
    }
}

pub fn resolve(base: usize, rva: usize) -> usize {
    base.wrapping_add(rva)
}

/// Resolves RVAs against one module's load address.
#[derive(Debug, Clone)]
pub struct AddressResolver {
    module: Option<String>,
    base: usize,
}

impl AddressResolver {
    pub fn new(module: Option<&str>, base: usize) -> Self {
        Self {
            module: module.map(|m| m.to_owned()),
            base,
        }
    }

    /// Look up `module` (None = host executable) in the process.
    pub fn for_module<M: ProcessMemory>(mem: &M, module: Option<&str>) -> Result<Self> {
        let base = mem.module_base(module).ok_or_else(|| {
            HookError::ModuleNotFound(module.unwrap_or("<host executable>").to_owned())
        })?;
        Ok(Self::new(module, base))
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    pub fn resolve(&self, rva: usize) -> ResolvedAddress {
        ResolvedAddress {
            base: self.base,
            rva,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use util::mock_memory::MockMemory;

    #[test]
    fn resolves_against_module_base() {
        let mem = MockMemory::new();
        mem.add_module("foreign.dll", 0x7ff6_0000);
        let r = AddressResolver::for_module(&mem, Some("foreign.dll")).unwrap();
        let a = r.resolve(0x1_2345);
        assert_eq!(a.absolute(), 0x7ff7_2345);
        assert_eq!(r.module(), Some("foreign.dll"));
        assert!(matches!(
            AddressResolver::for_module(&mem, None),
            Err(HookError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn display_shows_parts() {
        let a = ResolvedAddress {
            base: 0x1000,
            rva: 0x20,
        };
        assert_eq!(a.to_string(), "0x1020 (0x1000+0x20)");
    }
}
