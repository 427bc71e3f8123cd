//! The bridge to the foreign frame generation module.
//!
//! ```text
//! NotDetected -> Detected -> (signature ok) Active -> (shutdown) Inactive
//!                   |
//!                   +-> (signature mismatch) IncompatibleVersion   (terminal)
//! ```
//!
//! The foreign module is optional.  When it isn't loaded the bridge stays `NotDetected` and
//! everything is a silent no-op.
//!
//! Per frame the bridge only reads foreign memory through `ForeignView`, so a bad offset shows
//! up as a `MemoryFault` and the frame is skipped (with one warning for the session) instead of
//! crashing the host.  The raw interface pointers we then pick up are trusted: if the foreign
//! struct says a slot holds a UAV, we AddRef it as one.

use tracing::{debug, error, info, warn};

use patcher::address::AddressResolver;
use patcher::code_patch::{PatchRecord, PatchState};
use patcher::jump::flip_jz_to_jmp;
use shared_dx::backend::*;
use shared_dx::error::{HookError, Result};
use shared_dx::util::WarnOnce;
use util::memory::ProcessMemory;

use crate::layout::*;
use crate::mask::{ensure_mask, MaskDoubleBuffer};
use crate::shaders::{MASK_CS_ENTRY, MASK_CS_HLSL, MASK_GROUP_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    NotDetected,
    Detected,
    Active,
    IncompatibleVersion,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotActive,
    NoSingleton,
    InteropDisabled,
    BuffersNotReady,
    NullSharedSlot,
    MemoryFault,
}

/// How the motion vectors got to the foreign buffer this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// mask compute shader
    Masked,
    /// plain copy; masking wasn't available
    Copied,
    /// the engine had no usable motion vector view
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Skipped(SkipReason),
    Ran { transfer: Transfer, depth_synced: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub frames: u64,
    pub masked: u64,
    pub copied: u64,
    pub depth_syncs: u64,
    pub skipped: u64,
    pub faults: u64,
}

/// The engine's own views for this frame.
pub struct EngineFrame<'a, C: GraphicsContext> {
    pub motion_vectors: Option<&'a C::ShaderResourceView>,
    pub depth: Option<&'a C::ShaderResourceView>,
}

impl<'a, C: GraphicsContext> EngineFrame<'a, C> {
    pub fn empty() -> Self {
        Self {
            motion_vectors: None,
            depth: None,
        }
    }
}

/// Raw values read out of the interop struct for one frame.
#[derive(Debug, Clone, Copy)]
struct InteropFrame {
    parity: usize,
    width: u32,
    height: u32,
    mv_texture: usize,
    mv_uav: usize,
    depth_uav: usize,
    depth_cs: usize,
}

enum ReadResult {
    Ready(InteropFrame),
    Skip(SkipReason),
}

pub struct ExternalModuleBridge<C: GraphicsContext> {
    layout: ForeignLayout,
    use_mask: bool,
    state: BridgeState,
    module_base: Option<usize>,
    patch: Option<PatchRecord>,
    mask: Option<MaskDoubleBuffer<C>>,
    mask_cs: Option<C::ComputeShader>,
    null_slot_warning: WarnOnce,
    fault_warning: WarnOnce,
    stats: BridgeStats,
}

impl<C: GraphicsContext> ExternalModuleBridge<C> {
    pub fn new(layout: ForeignLayout, use_mask: bool) -> Self {
        Self {
            layout,
            use_mask,
            state: BridgeState::NotDetected,
            module_base: None,
            patch: None,
            mask: None,
            mask_cs: None,
            null_slot_warning: WarnOnce::new(),
            fault_warning: WarnOnce::new(),
            stats: BridgeStats::default(),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == BridgeState::Active
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn layout(&self) -> &ForeignLayout {
        &self.layout
    }

    pub fn mask(&self) -> Option<&MaskDoubleBuffer<C>> {
        self.mask.as_ref()
    }

    pub fn has_mask_shader(&self) -> bool {
        self.mask_cs.is_some()
    }

    /// Find the foreign module and patch it.  Returns `is_active()`.  Only the first call does
    /// anything, whatever its outcome.
    ///
    /// `output_size`, when known, is used to create the masks up front; otherwise they are
    /// created on the first frame.
    pub unsafe fn initialize<M: ProcessMemory>(
        &mut self,
        mem: &M,
        ctx: &C,
        output_size: Option<(u32, u32)>,
    ) -> bool {
        if self.state != BridgeState::NotDetected {
            return self.is_active();
        }
        let resolver = match AddressResolver::for_module(mem, Some(&self.layout.module_name)) {
            Ok(r) => r,
            Err(_) => {
                info!("{} not loaded, bridge disabled", self.layout.module_name);
                return false;
            }
        };
        self.module_base = Some(resolver.base());
        self.state = BridgeState::Detected;
        info!(
            "{} detected at {:x}, expecting layout {}",
            self.layout.module_name,
            resolver.base(),
            self.layout.version
        );

        let expected = self.layout.patch_signature.clone();
        let replacement = match flip_jz_to_jmp(&expected) {
            Some(r) => r,
            None => {
                error!(
                    "layout signature [{}] is not a near jz; bridge disabled",
                    patcher::signature::format_bytes(&expected)
                );
                self.state = BridgeState::IncompatibleVersion;
                return false;
            }
        };
        let address = resolver.resolve(self.layout.patch_rva);
        let mut patch = match PatchRecord::new(address, &expected, &replacement) {
            Ok(p) => p,
            Err(e) => {
                error!("bad patch definition: {}", e);
                self.state = BridgeState::IncompatibleVersion;
                return false;
            }
        };
        match patch.apply(mem) {
            Ok(()) => {
                self.state = BridgeState::Active;
            }
            Err(e) if patch.state() == PatchState::Incompatible => {
                error!(
                    "{} is not the expected version ({}), bridge disabled: {}",
                    self.layout.module_name, self.layout.version, e
                );
                self.state = BridgeState::IncompatibleVersion;
            }
            Err(e) => {
                // memory untouched; stays Detected but never activates
                error!("failed to patch {}: {}", self.layout.module_name, e);
            }
        }
        self.patch = Some(patch);

        if self.is_active() && self.use_mask {
            if let Err(e) = self.create_mask_resources(ctx, output_size) {
                warn!("mask resources unavailable, falling back to plain copy: {}", e);
            }
        }
        self.is_active()
    }

    fn create_mask_resources(&mut self, ctx: &C, output_size: Option<(u32, u32)>) -> Result<()> {
        if let Some((w, h)) = output_size {
            ensure_mask(&mut self.mask, ctx, w, h)?;
        }
        self.mask_cs = Some(ctx.create_compute_shader(MASK_CS_HLSL, MASK_CS_ENTRY)?);
        info!("mask compute shader ready");
        Ok(())
    }

    /// Current frame parity per the foreign module, if it can be read.
    pub fn current_parity<M: ProcessMemory>(&self, mem: &M) -> Option<usize> {
        if !self.is_active() {
            return None;
        }
        let base = self.module_base?;
        let interop = self.layout.singleton(mem, base, INTEROP).ok()??;
        ForeignView::new(mem, &self.layout, interop).frame_parity().ok()
    }

    /// Zero the current frame's mask.  Must happen before anything draws into it this frame,
    /// which also means before `execute_with_mask`.
    pub fn clear_mask<M: ProcessMemory>(&self, mem: &M, ctx: &C) {
        if let (Some(mask), Some(parity)) = (self.mask.as_ref(), self.current_parity(mem)) {
            mask.clear(ctx, parity);
        }
    }

    /// Render target for the overlay's coverage this frame: the current parity's mask.  Anything
    /// drawn into it (after `clear_mask`, before `execute_with_mask`) has its motion vectors
    /// zeroed by the compositing pass.  None when masking isn't running.
    pub fn mask_target<M: ProcessMemory>(&self, mem: &M) -> Option<C::RenderTargetView> {
        if !self.use_mask || self.mask_cs.is_none() {
            return None;
        }
        let mask = self.mask.as_ref()?;
        let parity = self.current_parity(mem)?;
        Some(mask.current(parity).rtv.clone())
    }

    fn read_interop<M: ProcessMemory>(&self, mem: &M) -> Result<ReadResult> {
        let base = match self.module_base {
            Some(b) => b,
            None => return Ok(ReadResult::Skip(SkipReason::NotActive)),
        };
        let interop = match self.layout.singleton(mem, base, INTEROP)? {
            Some(p) => p,
            None => return Ok(ReadResult::Skip(SkipReason::NoSingleton)),
        };
        let v = ForeignView::new(mem, &self.layout, interop);
        if !v.flag(ENABLED)? {
            return Ok(ReadResult::Skip(SkipReason::InteropDisabled));
        }
        if !v.flag(BUFFERS_READY)? {
            return Ok(ReadResult::Skip(SkipReason::BuffersNotReady));
        }
        let parity = v.frame_parity()?;
        Ok(ReadResult::Ready(InteropFrame {
            parity,
            width: v.u32(WIDTH)?,
            height: v.u32(HEIGHT)?,
            mv_texture: v.ptr_at(MV_TEXTURES, parity)?,
            mv_uav: v.ptr_at(MV_UAVS, parity)?,
            depth_uav: v.ptr_at(DEPTH_UAVS, parity)?,
            depth_cs: v.ptr(DEPTH_COPY_CS)?,
        }))
    }

    fn skip(&mut self, reason: SkipReason) -> ExecuteOutcome {
        self.stats.skipped += 1;
        ExecuteOutcome::Skipped(reason)
    }

    /// Write this frame's motion vectors (masked if possible) and depth into the foreign
    /// module's shared buffers.
    pub fn execute_with_mask<M: ProcessMemory>(
        &mut self,
        mem: &M,
        ctx: &C,
        engine: &EngineFrame<C>,
    ) -> ExecuteOutcome {
        if !self.is_active() {
            return ExecuteOutcome::Skipped(SkipReason::NotActive);
        }
        self.stats.frames += 1;
        let frame = match self.read_interop(mem) {
            Ok(ReadResult::Ready(f)) => f,
            Ok(ReadResult::Skip(r)) => return self.skip(r),
            Err(e) => {
                self.stats.faults += 1;
                if self.fault_warning.first() {
                    warn!(
                        "reading {} interop state failed, skipping frames until it reads \
                         cleanly: {}",
                        self.layout.module_name, e
                    );
                }
                return self.skip(SkipReason::MemoryFault);
            }
        };

        let shared_tex = unsafe { ctx.texture_from_raw(frame.mv_texture) };
        let shared_uav = unsafe { ctx.uav_from_raw(frame.mv_uav) };
        let (shared_tex, shared_uav) = match (shared_tex, shared_uav) {
            (Some(t), Some(u)) => (t, u),
            _ => {
                if self.null_slot_warning.first() {
                    warn!(
                        "{} shared motion vector slot {} is null; skipping",
                        self.layout.module_name, frame.parity
                    );
                }
                return self.skip(SkipReason::NullSharedSlot);
            }
        };

        let transfer = match engine.motion_vectors {
            Some(mv) => self.transfer_motion_vectors(ctx, &frame, mv, &shared_tex, &shared_uav),
            None => Transfer::None,
        };
        let depth_synced = self.sync_depth(ctx, &frame, engine.depth);

        match transfer {
            Transfer::Masked => self.stats.masked += 1,
            Transfer::Copied => self.stats.copied += 1,
            Transfer::None => {}
        }
        if depth_synced {
            self.stats.depth_syncs += 1;
        }
        ExecuteOutcome::Ran {
            transfer,
            depth_synced,
        }
    }

    fn transfer_motion_vectors(
        &mut self,
        ctx: &C,
        frame: &InteropFrame,
        engine_mv: &C::ShaderResourceView,
        shared_tex: &C::Texture,
        shared_uav: &C::UnorderedAccessView,
    ) -> Transfer {
        if self.use_mask && self.mask_cs.is_some() {
            if let Err(e) = ensure_mask(&mut self.mask, ctx, frame.width, frame.height) {
                debug!("mask recreate failed: {}", e);
            }
        }
        match (self.mask_cs.as_ref(), self.mask.as_ref()) {
            (Some(cs), Some(mask)) if self.use_mask => {
                let srvs = [
                    Some(engine_mv.clone()),
                    Some(mask.current(frame.parity).srv.clone()),
                    Some(mask.previous(frame.parity).srv.clone()),
                ];
                ctx.cs_set_shader(Some(cs));
                ctx.cs_set_shader_resources(0, &srvs);
                ctx.cs_set_unordered_access_views(0, &[Some(shared_uav.clone())]);
                ctx.dispatch(
                    group_count(frame.width, MASK_GROUP_SIZE),
                    group_count(frame.height, MASK_GROUP_SIZE),
                    1,
                );
                unbind_compute(ctx, srvs.len());
                Transfer::Masked
            }
            _ => match ctx.srv_texture(engine_mv) {
                Some((engine_tex, _)) => {
                    ctx.copy_resource(shared_tex, &engine_tex);
                    Transfer::Copied
                }
                None => Transfer::None,
            },
        }
    }

    fn sync_depth(
        &mut self,
        ctx: &C,
        frame: &InteropFrame,
        engine_depth: Option<&C::ShaderResourceView>,
    ) -> bool {
        let depth = match engine_depth {
            Some(d) => d,
            None => return false,
        };
        let uav = unsafe { ctx.uav_from_raw(frame.depth_uav) };
        let cs = unsafe { ctx.compute_shader_from_raw(frame.depth_cs) };
        let (uav, cs) = match (uav, cs) {
            (Some(u), Some(c)) => (u, c),
            _ => return false,
        };
        ctx.cs_set_shader(Some(&cs));
        ctx.cs_set_shader_resources(0, &[Some(depth.clone())]);
        ctx.cs_set_unordered_access_views(0, &[Some(uav)]);
        ctx.dispatch(
            group_count(frame.width, MASK_GROUP_SIZE),
            group_count(frame.height, MASK_GROUP_SIZE),
            1,
        );
        unbind_compute(ctx, 1);
        true
    }

    /// Undo the patch and drop GPU resources.  Only an active bridge has anything to undo.
    pub unsafe fn shutdown<M: ProcessMemory>(&mut self, mem: &M) {
        if self.state != BridgeState::Active {
            return;
        }
        if let Some(patch) = self.patch.as_mut() {
            if let Err(e) = patch.revert(mem) {
                error!("failed to revert {} patch: {}", self.layout.module_name, e);
            }
        }
        self.mask = None;
        self.mask_cs = None;
        self.state = BridgeState::Inactive;
        info!("bridge shut down: {:?}", self.stats);
    }

    /// The installed patch, for diagnostics.
    pub fn patch(&self) -> Result<&PatchRecord> {
        self.patch
            .as_ref()
            .ok_or_else(|| HookError::BadStateError("bridge has no patch".to_string()))
    }
}

fn unbind_compute<C: GraphicsContext>(ctx: &C, srv_count: usize) {
    let none_srvs: Vec<Option<C::ShaderResourceView>> = vec![None; srv_count];
    ctx.cs_set_shader_resources(0, &none_srvs);
    ctx.cs_set_unordered_access_views(0, &[None]);
    ctx.cs_set_shader(None);
}
