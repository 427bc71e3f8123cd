//! Per-frame plumbing between the two hooked entry points.
//!
//! ```text
//! DrawIndexed (trigger draw, once per frame)   -> capture HDR state
//! Present, before the real call                -> clear mask, replay HDR draw (overlay coverage
//!                                                 into the mask), run the bridge
//! Present, after the real call                 -> drop the snapshot, re-arm, metrics
//! ```
//!
//! The orchestrator owns one of everything and is only ever touched from the render thread.
//! The hooks hand it the raw pointers they were called with; it never calls back into a hooked
//! slot itself (the replayed draw goes through the caller supplied `redraw`, which must call the
//! saved original).

use std::time::{Duration, Instant};

use tracing::{info, trace, warn};

use ext_bridge::{EngineFrame, ExecuteOutcome, ExternalModuleBridge};
use shared_dx::backend::{GraphicsContext, RENDER_TARGET_SLOTS};
use shared_dx::util::WarnOnce;
use state_cache::{PipelineStateCache, PipelineStateSnapshot};
use util::memory::ProcessMemory;

use crate::conf::{CaptureConf, ScopeConf};
use crate::engine::{EngineLayout, EngineView};
use crate::metrics::FrameMetrics;

/// Arguments of an indexed draw, kept so the draw can be issued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub index_count: u32,
    pub start_index: u32,
    pub base_vertex: i32,
}

pub struct Orchestrator<C: GraphicsContext, M: ProcessMemory> {
    mem: M,
    ctx: C,
    engine: EngineView,
    engine_layout: EngineLayout,
    capture: CaptureConf,
    hdr: PipelineStateCache<C>,
    hdr_draw: Option<DrawParams>,
    armed: bool,
    bridge: ExternalModuleBridge<C>,
    bridge_enabled: bool,
    engine_view_warning: WarnOnce,
    metrics: FrameMetrics,
}

impl<C: GraphicsContext, M: ProcessMemory> Orchestrator<C, M> {
    pub fn new(conf: &ScopeConf, mem: M, ctx: C, engine: EngineView) -> Self {
        Self {
            mem,
            ctx,
            engine,
            engine_layout: conf.engine.clone(),
            capture: conf.capture.clone(),
            hdr: PipelineStateCache::new(conf.capture.duplicate_slots()),
            hdr_draw: None,
            armed: true,
            bridge: ExternalModuleBridge::new(conf.bridge.effective_layout(), conf.bridge.use_mask),
            bridge_enabled: conf.bridge.enabled,
            engine_view_warning: WarnOnce::new(),
            metrics: FrameMetrics::new(
                Duration::from_secs(conf.metrics_interval_secs),
                Instant::now(),
            ),
        }
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn engine(&self) -> &EngineView {
        &self.engine
    }

    pub fn hdr_cache(&self) -> &PipelineStateCache<C> {
        &self.hdr
    }

    pub fn bridge(&self) -> &ExternalModuleBridge<C> {
        &self.bridge
    }

    pub fn metrics(&self) -> &FrameMetrics {
        &self.metrics
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_engine_swap_chain(&self, raw: usize) -> bool {
        raw == self.engine.swap_chain
    }

    /// Must run before the hooks are installed, so the patch is in place before any frame we
    /// process.
    pub unsafe fn initialize_bridge(&mut self, output_size: Option<(u32, u32)>) -> bool {
        if !self.bridge_enabled {
            info!("frame generation bridge disabled by config");
            return false;
        }
        self.bridge.initialize(&self.mem, &self.ctx, output_size)
    }

    /// DrawIndexed pre-logic.  Captures the HDR state at the first trigger draw of the frame.
    pub fn on_draw_indexed(&mut self, context: usize, draw: DrawParams) {
        self.metrics.draw_calls += 1;
        if !self.armed
            || !self.capture.enabled
            || context != self.engine.context
            || draw.index_count != self.capture.trigger_index_count
        {
            return;
        }
        // other full screen quads use the same index count; the HDR one has both inputs bound
        if !self.hdr.duplicate_sources_bound(&self.ctx) {
            return;
        }
        self.hdr.capture(&self.ctx);
        self.hdr_draw = Some(draw);
        self.armed = false;
        self.metrics.captures += 1;
    }

    /// Present pre-logic.  `redraw` must issue the draw through the original DrawIndexed.
    pub fn on_present_pre<F: FnOnce(&C, DrawParams)>(&mut self, redraw: F) {
        let start = Instant::now();
        let bridge_active = self.bridge.is_active();
        if bridge_active {
            self.bridge.clear_mask(&self.mem, &self.ctx);
        }
        self.replay(redraw);
        if bridge_active {
            let outcome = self.run_bridge();
            trace!("bridge: {:?}", outcome);
            self.metrics.record_bridge(outcome);
        }
        self.metrics.present_time += start.elapsed();
    }

    fn replay<F: FnOnce(&C, DrawParams)>(&mut self, redraw: F) {
        if !self.capture.replay || !self.hdr.is_valid() {
            return;
        }
        let draw = match self.hdr_draw {
            Some(d) => d,
            None => return,
        };
        // plain snapshot: restoring must put the engine's own views back, not copies
        let saved = PipelineStateSnapshot::capture(&self.ctx);
        self.hdr.apply(&self.ctx);
        let mut covered = self.hdr.counts();
        if let Some(slot) = self.bind_mask_target() {
            covered.render_targets = covered.render_targets.max(slot + 1);
        }
        redraw(&self.ctx, draw);
        // whatever the engine had unbound must be unbound again, not left holding HDR views
        saved.restore_over(&self.ctx, covered);
        self.metrics.replays += 1;
    }

    /// Bind the bridge's current mask as the render target after the HDR pass's own, so the
    /// replayed overlay writes its coverage there.  Returns the slot used.
    fn bind_mask_target(&self) -> Option<usize> {
        let target = self.bridge.mask_target(&self.mem)?;
        let snap = self.hdr.snapshot()?;
        let slot = snap.render_targets.count();
        if slot >= RENDER_TARGET_SLOTS {
            return None;
        }
        let mut targets = snap.render_targets.slots().to_vec();
        targets.push(Some(target));
        self.ctx
            .om_set_render_targets(&targets, snap.depth_stencil_view.as_ref());
        Some(slot)
    }

    fn run_bridge(&mut self) -> ExecuteOutcome {
        let (mv_raw, depth_raw) = match self.engine.frame_views(&self.mem, &self.engine_layout) {
            Ok(v) => v,
            Err(e) => {
                if self.engine_view_warning.first() {
                    warn!("engine motion vector/depth views unreadable: {}", e);
                }
                (0, 0)
            }
        };
        let mv = unsafe { self.ctx.srv_from_raw(mv_raw) };
        let depth = unsafe { self.ctx.srv_from_raw(depth_raw) };
        let frame = EngineFrame {
            motion_vectors: mv.as_ref(),
            depth: depth.as_ref(),
        };
        self.bridge.execute_with_mask(&self.mem, &self.ctx, &frame)
    }

    /// Present post-logic.
    pub fn on_present_post(&mut self) {
        self.hdr.clear();
        self.hdr_draw = None;
        self.armed = true;
        self.metrics.end_frame(Instant::now());
    }

    /// Revert the bridge patch and drop GPU resources.  The vtable hooks stay.
    pub unsafe fn shutdown(&mut self) {
        self.bridge.shutdown(&self.mem);
        self.hdr.release_resources();
        self.hdr_draw = None;
        self.armed = false;
        info!("orchestrator shut down after {} frames", self.metrics.total_frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_bridge::layout::*;
    use ext_bridge::BridgeState;
    use shared_dx::backend::*;
    use shared_dx::mock::*;
    use util::memory::*;
    use util::mock_memory::MockMemory;

    const CONTEXT: usize = 0x0BAD_C000;
    const SWAP_CHAIN: usize = 0x0BAD_5000;
    const RENDERER: usize = 0x3000_0000;
    const FOREIGN: usize = 0x1800_0000;
    const INTEROP_AT: usize = 0x2000_0000;

    fn engine_view() -> EngineView {
        EngineView {
            renderer: RENDERER,
            device: 0x0BAD_D000,
            context: CONTEXT,
            swap_chain: SWAP_CHAIN,
        }
    }

    fn engine_memory() -> MockMemory {
        let mem = MockMemory::new();
        mem.map(RENDERER, 0x1000, PAGE_READWRITE);
        mem
    }

    struct Hdr {
        ps: MockObject,
        bloom: MockObject,
        _textures: Vec<MockObject>,
    }

    /// Bind something that looks like the HDR composite: a pixel shader plus scene, bloom and
    /// luminance views in slots 0..3.
    fn bind_hdr(ctx: &MockContext) -> Hdr {
        let ps = ctx.new_object("ps");
        let scene = ctx.new_texture(TextureInfo::new_2d(1920, 1080, 10));
        let bloom_tex = ctx.new_texture(TextureInfo::new_2d(480, 270, 10));
        let lum_tex = ctx.new_texture(TextureInfo::new_2d(1, 1, 41));
        let bloom = ctx.new_srv_for(&bloom_tex);
        let srvs = [
            Some(ctx.new_srv_for(&scene)),
            Some(bloom.clone()),
            Some(ctx.new_srv_for(&lum_tex)),
        ];
        ctx.ps_set_shader(Some(&ps));
        ctx.ps_set_shader_resources(0, &srvs);
        ctx.om_set_render_targets(&[Some(ctx.new_object("rtv"))], None);
        ctx.clear_calls();
        Hdr {
            ps,
            bloom,
            _textures: vec![scene, bloom_tex, lum_tex],
        }
    }

    fn orchestrator(conf: &ScopeConf) -> Orchestrator<MockContext, MockMemory> {
        Orchestrator::new(conf, engine_memory(), MockContext::new(), engine_view())
    }

    fn trigger() -> DrawParams {
        DrawParams {
            index_count: 6,
            start_index: 0,
            base_vertex: 0,
        }
    }

    #[test]
    fn captures_only_the_trigger_draw() {
        let mut o = orchestrator(&ScopeConf::default());
        let _hdr = bind_hdr(o.context());

        o.on_draw_indexed(CONTEXT + 0x10, trigger());
        o.on_draw_indexed(
            CONTEXT,
            DrawParams {
                index_count: 36,
                ..trigger()
            },
        );
        assert!(!o.hdr_cache().is_valid());
        assert!(o.is_armed());

        o.on_draw_indexed(CONTEXT, trigger());
        assert!(o.hdr_cache().is_valid());
        assert!(!o.is_armed());
        // once per frame
        o.on_draw_indexed(CONTEXT, trigger());
        assert_eq!(o.hdr_cache().capture_count(), 1);
        assert_eq!(o.metrics().draw_calls, 4);
        assert_eq!(o.metrics().captures, 1);
    }

    #[test]
    fn quad_without_hdr_inputs_is_ignored() {
        let mut o = orchestrator(&ScopeConf::default());
        let ps = o.context().new_object("ps");
        o.context().ps_set_shader(Some(&ps));
        o.on_draw_indexed(CONTEXT, trigger());
        assert!(!o.hdr_cache().is_valid());
        assert!(o.is_armed());
    }

    #[test]
    fn capture_disabled() {
        let mut conf = ScopeConf::default();
        conf.capture.enabled = false;
        let mut o = orchestrator(&conf);
        let _hdr = bind_hdr(o.context());
        o.on_draw_indexed(CONTEXT, trigger());
        assert!(!o.hdr_cache().is_valid());
    }

    #[test]
    fn replay_draws_with_captured_state_then_restores() {
        let mut o = orchestrator(&ScopeConf::default());
        let hdr = bind_hdr(o.context());
        o.on_draw_indexed(CONTEXT, trigger());

        // the engine moves on: another shader, and no views or targets bound at all
        let later_ps = o.context().new_object("ps");
        o.context().ps_set_shader(Some(&later_ps));
        o.context().ps_set_shader_resources(0, &[None, None, None]);
        o.context().om_set_render_targets(&[], None);

        let mut redraws = Vec::new();
        o.on_present_pre(|ctx: &MockContext, draw| {
            ctx.with_state(|s| {
                assert_eq!(s.ps_shader.as_ref(), Some(&hdr.ps));
                // bloom is our copy, not the engine's reused target
                let bloom = s.ps_srvs[1].as_ref().unwrap();
                assert_ne!(bloom, &hdr.bloom);
            });
            redraws.push(draw);
        });
        assert_eq!(redraws, vec![trigger()]);
        o.context().with_state(|s| {
            assert_eq!(s.ps_shader.as_ref(), Some(&later_ps));
            assert!(s.ps_srvs.iter().all(|v| v.is_none()));
            assert!(s.rtvs.iter().all(|v| v.is_none()));
        });
        assert_eq!(o.metrics().replays, 1);
    }

    #[test]
    fn no_replay_without_capture_or_when_disabled() {
        let mut o = orchestrator(&ScopeConf::default());
        let mut called = false;
        o.on_present_pre(|_, _| called = true);
        assert!(!called);

        let mut conf = ScopeConf::default();
        conf.capture.replay = false;
        let mut o = orchestrator(&conf);
        let _hdr = bind_hdr(o.context());
        o.on_draw_indexed(CONTEXT, trigger());
        o.on_present_pre(|_, _| called = true);
        assert!(!called);
    }

    #[test]
    fn present_post_rearms_for_next_frame() {
        let mut o = orchestrator(&ScopeConf::default());
        let hdr = bind_hdr(o.context());
        o.on_draw_indexed(CONTEXT, trigger());
        o.on_present_pre(|_, _| {});
        o.on_present_post();
        assert!(!o.hdr_cache().is_valid());
        assert!(o.is_armed());
        assert_eq!(o.metrics().total_frames, 1);

        o.on_draw_indexed(CONTEXT, trigger());
        assert_eq!(o.hdr_cache().capture_count(), 2);
        drop(hdr);
    }

    #[test]
    fn swap_chain_identity() {
        let o = orchestrator(&ScopeConf::default());
        assert!(o.is_engine_swap_chain(SWAP_CHAIN));
        assert!(!o.is_engine_swap_chain(SWAP_CHAIN + 8));
    }

    /// Engine memory plus a loaded foreign module with its interop struct ready for frame 0.
    fn with_foreign_module(ctx: &MockContext) -> (MockMemory, MockObject) {
        let layout = ForeignLayout::builtin();
        let mem = engine_memory();
        mem.add_module(&layout.module_name, FOREIGN);
        mem.map_bytes(
            FOREIGN + layout.patch_rva,
            &[0x0F, 0x84, 0xEB, 0x01, 0x00, 0x00],
            PAGE_EXECUTE_READ,
        );
        let global = FOREIGN + layout.singleton_rva(INTEROP).unwrap();
        mem.map(global, PTR_SIZE, PAGE_READWRITE);
        mem.poke_usize(global, INTEROP_AT);
        mem.map(INTEROP_AT, 0x100, PAGE_READWRITE);
        let field = |name: &str| INTEROP_AT + layout.field(name).unwrap();
        mem.poke(field(ENABLED), &[1]);
        mem.poke(field(BUFFERS_READY), &[1]);
        mem.poke(field(WIDTH), &1920u32.to_ne_bytes());
        mem.poke(field(HEIGHT), &1080u32.to_ne_bytes());

        let shared = ctx.new_texture(TextureInfo::new_2d(1920, 1080, 34));
        let shared_uav = ctx.new_uav_for(&shared);
        mem.poke_usize(field(MV_TEXTURES), ctx.register_raw(&shared));
        mem.poke_usize(field(MV_UAVS), ctx.register_raw(&shared_uav));

        // the engine's own motion vectors
        let mv_tex = ctx.new_texture(TextureInfo::new_2d(1920, 1080, 34));
        let mv = ctx.new_srv_for(&mv_tex);
        let conf = ScopeConf::default();
        mem.poke_usize(RENDERER + conf.engine.motion_vectors_offset, ctx.register_raw(&mv));
        (mem, mv)
    }

    #[test]
    fn mask_is_cleared_before_bridge_dispatch() {
        let ctx = MockContext::new();
        let (mem, _mv) = with_foreign_module(&ctx);
        let mut o = Orchestrator::new(&ScopeConf::default(), mem, ctx, engine_view());
        assert!(unsafe { o.initialize_bridge(Some((1920, 1080))) });
        o.context().clear_calls();

        o.on_present_pre(|_, _| {});
        let calls = o.context().calls();
        let clear = calls
            .iter()
            .position(|c| matches!(c, MockCall::ClearUav { .. }))
            .unwrap();
        let dispatch = calls
            .iter()
            .position(|c| matches!(c, MockCall::Dispatch(..)))
            .unwrap();
        assert!(clear < dispatch);
        assert!(calls.contains(&MockCall::Dispatch(240, 135, 1)));
        assert_eq!(o.metrics().bridge_masked, 1);
    }

    #[test]
    fn replayed_overlay_writes_the_mask_read_by_the_dispatch() {
        let ctx = MockContext::new();
        let (mem, _mv) = with_foreign_module(&ctx);
        let mut o = Orchestrator::new(&ScopeConf::default(), mem, ctx, engine_view());
        assert!(unsafe { o.initialize_bridge(Some((1920, 1080))) });
        let _hdr = bind_hdr(o.context());
        o.on_draw_indexed(CONTEXT, trigger());
        o.context().om_set_render_targets(&[], None);

        let mut mask_bound = false;
        o.on_present_pre(|ctx: &MockContext, _| {
            // hdr target in slot 0, this frame's mask right after it
            mask_bound = ctx.with_state(|s| s.rtvs[1].is_some());
            ctx.draw();
        });
        assert!(mask_bound);
        // srvs: engine motion vectors, current mask, previous mask
        assert_eq!(o.context().dispatch_inputs(), vec![vec![false, true, false]]);
        o.context().with_state(|s| assert!(s.rtvs.iter().all(|v| v.is_none())));
    }

    #[test]
    fn bridge_disabled_by_config() {
        let ctx = MockContext::new();
        let (mem, _mv) = with_foreign_module(&ctx);
        let mut conf = ScopeConf::default();
        conf.bridge.enabled = false;
        let mut o = Orchestrator::new(&conf, mem, ctx, engine_view());
        assert!(!unsafe { o.initialize_bridge(Some((1920, 1080))) });
        assert_eq!(o.bridge().state(), BridgeState::NotDetected);
        o.on_present_pre(|_, _| {});
        assert_eq!(o.context().count_calls(|c| matches!(c, MockCall::Dispatch(..))), 0);
    }

    #[test]
    fn shutdown_reverts_bridge_and_releases() {
        let ctx = MockContext::new();
        let (mem, _mv) = with_foreign_module(&ctx);
        let mut o = Orchestrator::new(&ScopeConf::default(), mem, ctx, engine_view());
        assert!(unsafe { o.initialize_bridge(None) });
        let _hdr = bind_hdr(o.context());
        o.on_draw_indexed(CONTEXT, trigger());
        o.on_present_pre(|_, _| {});
        assert_eq!(o.metrics().bridge_masked + o.metrics().bridge_copied, 1);

        unsafe { o.shutdown() };
        assert_eq!(o.bridge().state(), BridgeState::Inactive);
        assert!(!o.hdr_cache().is_valid());
        assert!(!o.is_armed());
        let stats = o.bridge().stats();
        o.on_present_pre(|_, _| {});
        assert_eq!(o.bridge().stats(), stats);
    }
}
