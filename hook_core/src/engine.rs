//! The host engine's renderer, as far as we need it: where its D3D objects live.

use serde::{Deserialize, Serialize};

use patcher::address::AddressResolver;
use shared_dx::error::Result;
use util::memory::ProcessMemory;

/// RVAs and offsets into the host executable for the supported runtime build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLayout {
    /// RVA of the global holding the renderer singleton pointer.
    pub renderer_rva: usize,
    pub device_offset: usize,
    pub context_offset: usize,
    pub swap_chain_offset: usize,
    /// SRV of the engine's motion vector target
    pub motion_vectors_offset: usize,
    /// SRV of the engine's main depth buffer
    pub depth_offset: usize,
}

impl Default for EngineLayout {
    fn default() -> Self {
        Self {
            renderer_rva: 0x0621_0F48,
            device_offset: 0x48,
            context_offset: 0x50,
            swap_chain_offset: 0x60,
            motion_vectors_offset: 0x0A18,
            depth_offset: 0x0A30,
        }
    }
}

/// Raw pointers to the engine's device objects.  None of them are owned here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineView {
    pub renderer: usize,
    pub device: usize,
    pub context: usize,
    pub swap_chain: usize,
}

impl EngineView {
    /// Look the renderer up.  Ok(None) until the engine has created it and all three device
    /// objects, which is the normal state for a while after the plugin loads.
    pub fn resolve<M: ProcessMemory>(mem: &M, layout: &EngineLayout) -> Result<Option<Self>> {
        let exe = AddressResolver::for_module(mem, None)?;
        let renderer = mem.read_usize(exe.resolve(layout.renderer_rva).absolute())?;
        if renderer == 0 {
            return Ok(None);
        }
        let read = |off: usize| mem.read_usize(renderer.wrapping_add(off));
        let device = read(layout.device_offset)?;
        let context = read(layout.context_offset)?;
        let swap_chain = read(layout.swap_chain_offset)?;
        if device == 0 || context == 0 || swap_chain == 0 {
            return Ok(None);
        }
        Ok(Some(EngineView {
            renderer,
            device,
            context,
            swap_chain,
        }))
    }

    /// Raw (motion vector, depth) SRV pointers for the current frame.  Either may be 0.
    pub fn frame_views<M: ProcessMemory>(
        &self,
        mem: &M,
        layout: &EngineLayout,
    ) -> Result<(usize, usize)> {
        let mv = mem.read_usize(self.renderer.wrapping_add(layout.motion_vectors_offset))?;
        let depth = mem.read_usize(self.renderer.wrapping_add(layout.depth_offset))?;
        Ok((mv, depth))
    }
}
