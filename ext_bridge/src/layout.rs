//! Where things are inside the foreign module, for one build of it.
//!
//! All of the foreign module's private layout lives in a `ForeignLayout` table: symbolic
//! "Struct.field" names to byte offsets, plus the RVAs of its globals and the one instruction we
//! patch.  Nothing else in the crate does pointer arithmetic on foreign memory; it goes through
//! `ForeignView`, whose reads are all fallible.
//!
//! The table can be replaced from config, so a new build of the foreign module can be supported
//! by editing yaml.  The patch signature is still the only thing that checks a table actually
//! matches the binary.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use shared_dx::error::{HookError, Result};
use util::memory::{ProcessMemory, PTR_SIZE};

// singletons
pub const INTEROP: &str = "Interop";

// fields of the interop singleton
pub const ENABLED: &str = "Interop.enabled";
pub const BUFFERS_READY: &str = "Interop.buffers_ready";
pub const FRAME_INDEX: &str = "Interop.frame_index";
pub const WIDTH: &str = "Interop.width";
pub const HEIGHT: &str = "Interop.height";
/// [texture; 2]
pub const MV_TEXTURES: &str = "Interop.motion_vector_textures";
/// [uav; 2]
pub const MV_UAVS: &str = "Interop.motion_vector_uavs";
/// [uav; 2]
pub const DEPTH_UAVS: &str = "Interop.depth_uavs";
pub const DEPTH_COPY_CS: &str = "Interop.depth_copy_cs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForeignLayout {
    /// Free-form label of the foreign build this table was taken from; only logged.
    pub version: String,
    pub module_name: String,
    /// RVA of the conditional jump that guards the foreign module's input buffer copy.
    pub patch_rva: usize,
    /// The bytes expected at `patch_rva`.
    pub patch_signature: Vec<u8>,
    /// Singleton name -> RVA of the global holding a pointer to it.
    pub singletons: FnvHashMap<String, usize>,
    /// "Struct.field" -> byte offset from the start of the struct.
    pub fields: FnvHashMap<String, usize>,
}

impl Default for ForeignLayout {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ForeignLayout {
    /// The build this plugin ships against.
    pub fn builtin() -> Self {
        let singletons: FnvHashMap<String, usize> =
            [(INTEROP, 0x0031_8A40usize)].iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let fields: FnvHashMap<String, usize> = [
            (ENABLED, 0x08usize),
            (BUFFERS_READY, 0x09),
            (FRAME_INDEX, 0x0C),
            (WIDTH, 0x10),
            (HEIGHT, 0x14),
            (MV_TEXTURES, 0x18),
            (MV_UAVS, 0x28),
            (DEPTH_UAVS, 0x48),
            (DEPTH_COPY_CS, 0x58),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
        Self {
            version: "1.2.0".to_string(),
            module_name: "FrameGen.dll".to_string(),
            patch_rva: 0x0004_1E7B,
            patch_signature: vec![0x0F, 0x84, 0xEB, 0x01, 0x00, 0x00],
            singletons,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Result<usize> {
        self.fields
            .get(name)
            .copied()
            .ok_or_else(|| HookError::UnknownField(name.to_string()))
    }

    pub fn singleton_rva(&self, name: &str) -> Result<usize> {
        self.singletons
            .get(name)
            .copied()
            .ok_or_else(|| HookError::UnknownField(name.to_string()))
    }

    /// Address of singleton `name`, or None if the foreign module hasn't created it yet.
    pub fn singleton<M: ProcessMemory>(
        &self,
        mem: &M,
        module_base: usize,
        name: &str,
    ) -> Result<Option<usize>> {
        let global = module_base.wrapping_add(self.singleton_rva(name)?);
        match mem.read_usize(global)? {
            0 => Ok(None),
            p => Ok(Some(p)),
        }
    }
}

/// Frame parity from the foreign module's counter.  Anything other than 0 or 1 means the layout
/// has drifted; use 0 rather than index out of the pair.
pub fn frame_parity(raw: i32) -> usize {
    match raw {
        0 => 0,
        1 => 1,
        _ => 0,
    }
}

pub fn other_parity(parity: usize) -> usize {
    1 - (parity & 1)
}

/// Accessor over one foreign struct instance.  Every read re-reads foreign memory.
pub struct ForeignView<'a, M: ProcessMemory> {
    mem: &'a M,
    layout: &'a ForeignLayout,
    base: usize,
}

impl<'a, M: ProcessMemory> ForeignView<'a, M> {
    pub fn new(mem: &'a M, layout: &'a ForeignLayout, base: usize) -> Self {
        Self { mem, layout, base }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    fn addr(&self, field: &str) -> Result<usize> {
        Ok(self.base.wrapping_add(self.layout.field(field)?))
    }

    pub fn flag(&self, field: &str) -> Result<bool> {
        Ok(self.mem.read_u8(self.addr(field)?)? != 0)
    }

    pub fn i32(&self, field: &str) -> Result<i32> {
        self.mem.read_i32(self.addr(field)?)
    }

    pub fn u32(&self, field: &str) -> Result<u32> {
        self.mem.read_u32(self.addr(field)?)
    }

    /// Raw pointer value; 0 is returned as is.
    pub fn ptr(&self, field: &str) -> Result<usize> {
        self.mem.read_usize(self.addr(field)?)
    }

    /// Element `index` of a pointer array field.
    pub fn ptr_at(&self, field: &str, index: usize) -> Result<usize> {
        self.mem
            .read_usize(self.addr(field)?.wrapping_add(index * PTR_SIZE))
    }

    pub fn frame_parity(&self) -> Result<usize> {
        Ok(frame_parity(self.i32(FRAME_INDEX)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use util::memory::*;
    use util::mock_memory::MockMemory;

    #[test]
    fn parity_is_always_zero_or_one() {
        assert_eq!(frame_parity(0), 0);
        assert_eq!(frame_parity(1), 1);
        for raw in [2, 3, -1, -2, 255, 256, i32::MAX, i32::MIN] {
            assert_eq!(frame_parity(raw), 0, "raw {}", raw);
        }
        assert_eq!(other_parity(0), 1);
        assert_eq!(other_parity(1), 0);
    }

    #[test]
    fn builtin_has_every_field() {
        let l = ForeignLayout::builtin();
        for f in [
            ENABLED,
            BUFFERS_READY,
            FRAME_INDEX,
            WIDTH,
            HEIGHT,
            MV_TEXTURES,
            MV_UAVS,
            DEPTH_UAVS,
            DEPTH_COPY_CS,
        ] {
            assert!(l.field(f).is_ok(), "{}", f);
        }
        assert!(l.singleton_rva(INTEROP).is_ok());
        assert_eq!(l.patch_signature.len(), 6);
        assert!(matches!(l.field("Interop.nope"), Err(HookError::UnknownField(_))));
    }

    #[test]
    fn view_reads_through_offsets() {
        let l = ForeignLayout::builtin();
        let mem = MockMemory::new();
        let base = 0x5000_0000;
        mem.map(base, 0x100, PAGE_READWRITE);
        mem.poke(base + l.field(ENABLED).unwrap(), &[1]);
        mem.poke_i32(base + l.field(FRAME_INDEX).unwrap(), 7);
        mem.poke_usize(base + l.field(MV_UAVS).unwrap() + PTR_SIZE, 0xABCD);
        let v = ForeignView::new(&mem, &l, base);
        assert!(v.flag(ENABLED).unwrap());
        assert!(!v.flag(BUFFERS_READY).unwrap());
        assert_eq!(v.i32(FRAME_INDEX).unwrap(), 7);
        assert_eq!(v.frame_parity().unwrap(), 0);
        assert_eq!(v.ptr_at(MV_UAVS, 0).unwrap(), 0);
        assert_eq!(v.ptr_at(MV_UAVS, 1).unwrap(), 0xABCD);
    }

    #[test]
    fn view_faults_are_errors() {
        let l = ForeignLayout::builtin();
        let mem = MockMemory::new();
        let v = ForeignView::new(&mem, &l, 0xDEAD_0000);
        assert!(matches!(v.flag(ENABLED), Err(HookError::MemoryFault { .. })));
    }

    #[test]
    fn singleton_lookup() {
        let l = ForeignLayout::builtin();
        let mem = MockMemory::new();
        let module = 0x1000_0000;
        let global = module + l.singleton_rva(INTEROP).unwrap();
        mem.map(global, 8, PAGE_READWRITE);
        assert_eq!(l.singleton(&mem, module, INTEROP).unwrap(), None);
        mem.poke_usize(global, 0x2000_0000);
        assert_eq!(l.singleton(&mem, module, INTEROP).unwrap(), Some(0x2000_0000));
    }

    #[test]
    fn layout_yaml_override() {
        let yaml = r#"
version: "1.3.0-test"
module_name: "FrameGen.dll"
patch_rva: 0x1000
patch_signature: [0x0F, 0x84, 0x10, 0x00, 0x00, 0x00]
fields:
  Interop.enabled: 0x20
"#;
        let l: ForeignLayout = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(l.version, "1.3.0-test");
        assert_eq!(l.patch_rva, 0x1000);
        assert_eq!(l.field(ENABLED).unwrap(), 0x20);
        assert!(l.field(FRAME_INDEX).is_err());
        // unspecified tables come from the builtin
        assert_eq!(l.singletons, ForeignLayout::builtin().singletons);
    }
}
