//! Saves the HDR composite's pipeline state at one draw and replays it later in the frame.
//!
//! The engine has no way to re-enter its own renderer, so when we want to draw "as the HDR pass
//! would have" at Present time we have to rebuild its bindings ourselves.  Capture grabs
//! everything bound at the trigger draw; Apply puts it back.
//!
//! Two of the captured shader resources (bloom and luminance) are render targets that the engine
//! reuses after the HDR pass, so holding a reference isn't enough: by Present they contain
//! something else.  For those two slots capture copies the texture into a private one and the
//! snapshot holds a view of the copy instead.  The private textures are kept between captures
//! and only recreated when the source size or format changes.
//!
//! A capture either completes and replaces the previous snapshot, or (if it never runs) leaves
//! the old one; callers never see a half-filled snapshot.  Duplication failures are logged and
//! the snapshot keeps the engine's own view for that slot.

use tracing::{debug, trace, warn};

use shared_dx::backend::*;
use shared_dx::error::{HookError, Result};

use crate::snapshot::{ActiveCounts, PipelineStateSnapshot};

/// Shader resource slots whose contents are copied at capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateSlots {
    pub bloom: usize,
    pub luminance: usize,
}

impl Default for DuplicateSlots {
    fn default() -> Self {
        Self {
            bloom: 1,
            luminance: 2,
        }
    }
}

impl DuplicateSlots {
    fn as_array(&self) -> [usize; 2] {
        [self.bloom, self.luminance]
    }
}

struct DuplicateTexture<C: GraphicsContext> {
    info: TextureInfo,
    texture: C::Texture,
    view: C::ShaderResourceView,
}

pub struct PipelineStateCache<C: GraphicsContext> {
    snapshot: Option<PipelineStateSnapshot<C>>,
    slots: DuplicateSlots,
    duplicates: [Option<DuplicateTexture<C>>; 2],
    capture_count: u64,
    apply_count: u64,
    duplicate_failures: u64,
}

impl<C: GraphicsContext> PipelineStateCache<C> {
    pub fn new(slots: DuplicateSlots) -> Self {
        Self {
            snapshot: None,
            slots,
            duplicates: [None, None],
            capture_count: 0,
            apply_count: 0,
            duplicate_failures: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn duplicate_slots(&self) -> DuplicateSlots {
        self.slots
    }

    pub fn capture_count(&self) -> u64 {
        self.capture_count
    }

    pub fn apply_count(&self) -> u64 {
        self.apply_count
    }

    pub fn duplicate_failures(&self) -> u64 {
        self.duplicate_failures
    }

    /// Active counts of the current snapshot; all zero when invalid.
    pub fn counts(&self) -> ActiveCounts {
        self.snapshot
            .as_ref()
            .map(|s| s.counts())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<&PipelineStateSnapshot<C>> {
        self.snapshot.as_ref()
    }

    /// True if the context currently has views bound at both duplicate slots.
    pub fn duplicate_sources_bound(&self, ctx: &C) -> bool {
        let mut views: Vec<Option<C::ShaderResourceView>> = vec![None; SHADER_RESOURCE_SLOTS];
        ctx.ps_get_shader_resources(&mut views);
        self.slots
            .as_array()
            .iter()
            .all(|&i| views.get(i).map_or(false, |v| v.is_some()))
    }

    pub fn capture(&mut self, ctx: &C) {
        let mut snap = PipelineStateSnapshot::capture(ctx);
        for (which, slot) in self.slots.as_array().into_iter().enumerate() {
            let src = match snap.shader_resources.get(slot) {
                Some(v) => v.clone(),
                None => continue,
            };
            match self.duplicate(ctx, which, &src) {
                Ok(copy) => {
                    snap.shader_resources.replace(slot, copy);
                }
                Err(e) => {
                    self.duplicate_failures += 1;
                    warn!("srv slot {} not duplicated, keeping engine view: {}", slot, e);
                }
            }
        }
        // the old snapshot (if any) is released here
        self.snapshot = Some(snap);
        self.capture_count += 1;
        trace!("captured pipeline state #{}: {:?}", self.capture_count, self.counts());
    }

    /// Copy `src`'s texture into private duplicate `which`, (re)creating it if needed, and
    /// return a view of the copy.
    fn duplicate(
        &mut self,
        ctx: &C,
        which: usize,
        src: &C::ShaderResourceView,
    ) -> Result<C::ShaderResourceView> {
        if let Some(dup) = self.duplicates[which].as_ref() {
            // already our copy (e.g. the snapshot was applied and recaptured)
            if dup.view == *src {
                return Ok(dup.view.clone());
            }
        }
        let (src_tex, info) = ctx.srv_texture(src).ok_or_else(|| {
            HookError::ResourceCreateFailed(
                "view is not backed by a 2d texture".to_string(),
            )
        })?;
        let stale = match self.duplicates[which].as_ref() {
            Some(d) => d.info != info,
            None => true,
        };
        if stale {
            let texture = ctx.create_texture(&info, BIND_SHADER_RESOURCE)?;
            let view = ctx.create_shader_resource_view(&texture, Some(src))?;
            debug!(
                "created duplicate texture {}: {}x{} fmt {}",
                which, info.width, info.height, info.format
            );
            self.duplicates[which] = Some(DuplicateTexture {
                info,
                texture,
                view,
            });
        }
        let dup = self.duplicates[which].as_ref().ok_or_else(|| {
            HookError::BadStateError("duplicate texture missing".to_string())
        })?;
        ctx.copy_resource(&dup.texture, &src_tex);
        Ok(dup.view.clone())
    }

    /// Rebind the snapshot.  Nothing happens (and that's fine) when there isn't one.
    pub fn apply(&mut self, ctx: &C) {
        match self.snapshot.as_ref() {
            Some(snap) => {
                snap.apply(ctx);
                self.apply_count += 1;
            }
            None => trace!("pipeline state apply skipped: no valid snapshot"),
        }
    }

    /// Release every handle in the snapshot and invalidate it.  Safe to call repeatedly.
    pub fn clear(&mut self) {
        self.snapshot = None;
    }

    /// Clear, and also drop the private duplicate textures.
    pub fn release_resources(&mut self) {
        self.clear();
        self.duplicates = [None, None];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_dx::mock::*;

    const HDR_FMT: u32 = 10; // R16G16B16A16_FLOAT

    struct Bound {
        ps: MockObject,
        vs: MockObject,
        cbs: Vec<MockObject>,
        srvs: Vec<MockObject>,
        bloom_tex: MockObject,
        sampler: MockObject,
        rtvs: Vec<MockObject>,
        dsv: MockObject,
        blend: MockObject,
        vb: MockObject,
    }

    /// A context that looks like the HDR composite draw: bloom at 1, luminance at 2, scene at 0.
    fn hdr_context() -> (MockContext, Bound) {
        let ctx = MockContext::new();
        let ps = ctx.new_object("ps");
        let vs = ctx.new_object("vs");
        let cbs = vec![ctx.new_object("cb"), ctx.new_object("cb")];
        let scene = ctx.new_texture(TextureInfo::new_2d(1920, 1080, HDR_FMT));
        let bloom_tex = ctx.new_texture(TextureInfo::new_2d(480, 270, HDR_FMT));
        let lum_tex = ctx.new_texture(TextureInfo::new_2d(1, 1, 41));
        let srvs = vec![
            ctx.new_srv_for(&scene),
            ctx.new_srv_for(&bloom_tex),
            ctx.new_srv_for(&lum_tex),
        ];
        let sampler = ctx.new_object("sampler");
        let rtvs = vec![ctx.new_object("rtv"), ctx.new_object("rtv")];
        let dsv = ctx.new_object("dsv");
        let blend = ctx.new_object("blend");
        let vb = ctx.new_object("vb");

        ctx.ps_set_shader(Some(&ps));
        ctx.vs_set_shader(Some(&vs));
        ctx.ps_set_constant_buffers(0, &[Some(cbs[0].clone()), None, Some(cbs[1].clone())]);
        ctx.ps_set_shader_resources(0, &srvs.iter().cloned().map(Some).collect::<Vec<_>>());
        ctx.ps_set_samplers(0, &[Some(sampler.clone())]);
        ctx.om_set_render_targets(
            &[Some(rtvs[0].clone()), Some(rtvs[1].clone())],
            Some(&dsv),
        );
        ctx.om_set_blend_state(&BlendBinding {
            state: Some(blend.clone()),
            factor: [0.5; 4],
            sample_mask: 0xff,
        });
        ctx.rs_set_viewport(&Viewport {
            width: 1920.0,
            height: 1080.0,
            max_depth: 1.0,
            ..Default::default()
        });
        ctx.ia_set_primitive_topology(4);
        ctx.ia_set_vertex_buffer(&VertexBufferBinding {
            buffer: vb.clone(),
            stride: 16,
            offset: 0,
        });
        ctx.clear_calls();
        (
            ctx,
            Bound {
                ps,
                vs,
                cbs,
                srvs,
                bloom_tex,
                sampler,
                rtvs,
                dsv,
                blend,
                vb,
            },
        )
    }

    #[test]
    fn capture_records_counts_and_duplicates() {
        let (ctx, b) = hdr_context();
        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        assert!(!cache.is_valid());
        cache.capture(&ctx);
        assert!(cache.is_valid());
        assert_eq!(cache.capture_count(), 1);
        assert_eq!(
            cache.counts(),
            ActiveCounts {
                ps_constant_buffers: 3,
                vs_constant_buffers: 0,
                shader_resources: 3,
                samplers: 1,
                render_targets: 2,
            }
        );
        let snap = cache.snapshot().unwrap();
        // slot 0 is the engine's view, 1 and 2 are our copies
        assert_eq!(snap.shader_resources.get(0), Some(&b.srvs[0]));
        assert_ne!(snap.shader_resources.get(1), Some(&b.srvs[1]));
        assert_ne!(snap.shader_resources.get(2), Some(&b.srvs[2]));
        let copy_tex = ctx
            .srv_texture(snap.shader_resources.get(1).unwrap())
            .unwrap();
        assert_eq!(copy_tex.1, TextureInfo::new_2d(480, 270, HDR_FMT));
        assert!(ctx.calls().contains(&MockCall::CopyResource {
            dst: copy_tex.0.id(),
            src: b.bloom_tex.id(),
        }));
        assert_eq!(ctx.count_calls(|c| matches!(c, MockCall::CreateTexture { .. })), 2);
    }

    #[test]
    fn duplicates_are_reused_until_size_changes() {
        let (ctx, b) = hdr_context();
        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        cache.capture(&ctx);
        cache.capture(&ctx);
        assert_eq!(ctx.count_calls(|c| matches!(c, MockCall::CreateTexture { .. })), 2);
        assert_eq!(ctx.count_calls(|c| matches!(c, MockCall::CopyResource { .. })), 4);

        // bloom target resized (e.g. resolution change)
        let bigger = ctx.new_texture(TextureInfo::new_2d(960, 540, HDR_FMT));
        ctx.ps_set_shader_resources(1, &[Some(ctx.new_srv_for(&bigger))]);
        cache.capture(&ctx);
        assert_eq!(ctx.count_calls(|c| matches!(c, MockCall::CreateTexture { .. })), 3);
        drop(b);
    }

    #[test]
    fn duplication_failure_keeps_engine_view() {
        let (mut ctx, b) = hdr_context();
        ctx.fail_texture_creation = true;
        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        cache.capture(&ctx);
        assert!(cache.is_valid());
        assert_eq!(cache.duplicate_failures(), 2);
        let snap = cache.snapshot().unwrap();
        assert_eq!(snap.shader_resources.get(1), Some(&b.srvs[1]));
        assert_eq!(snap.shader_resources.get(2), Some(&b.srvs[2]));
    }

    #[test]
    fn apply_then_capture_is_a_fixed_point() {
        let (ctx, _b) = hdr_context();
        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        cache.capture(&ctx);
        cache.apply(&ctx);
        let first = PipelineStateSnapshot::capture(&ctx);
        let counts = cache.counts();
        cache.capture(&ctx);
        let second = cache.snapshot().unwrap();

        assert_eq!(second.counts(), counts);
        assert_eq!(first.counts(), counts);
        assert_eq!(second.pixel_shader, first.pixel_shader);
        assert_eq!(second.vertex_shader, first.vertex_shader);
        assert_eq!(second.ps_constant_buffers, first.ps_constant_buffers);
        assert_eq!(second.shader_resources, first.shader_resources);
        assert_eq!(second.samplers, first.samplers);
        assert_eq!(second.render_targets, first.render_targets);
        assert_eq!(second.depth_stencil_view, first.depth_stencil_view);
        assert_eq!(second.blend, first.blend);
        assert_eq!(second.viewport, first.viewport);
        assert_eq!(second.topology, first.topology);
        assert_eq!(second.vertex_buffer, first.vertex_buffer);
        // recapturing our own copies doesn't copy them onto themselves
        assert!(ctx
            .calls()
            .iter()
            .all(|c| !matches!(c, MockCall::CopyResource { dst, src } if dst == src)));
    }

    #[test]
    fn clear_releases_one_reference_per_capture() {
        let (ctx, b) = hdr_context();
        let tracked: Vec<&MockObject> = vec![
            &b.ps, &b.vs, &b.cbs[0], &b.cbs[1], &b.srvs[0], &b.sampler, &b.rtvs[0], &b.rtvs[1],
            &b.dsv, &b.blend, &b.vb,
        ];
        let before: Vec<usize> = tracked.iter().map(|o| o.refcount()).collect();

        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        cache.capture(&ctx);
        let held: Vec<usize> = tracked.iter().map(|o| o.refcount()).collect();
        for (h, b) in held.iter().zip(before.iter()) {
            assert_eq!(*h, b + 1);
        }
        // a second capture replaces the first; still one reference each
        cache.capture(&ctx);
        let held2: Vec<usize> = tracked.iter().map(|o| o.refcount()).collect();
        assert_eq!(held2, held);

        cache.clear();
        assert!(!cache.is_valid());
        assert_eq!(cache.counts(), ActiveCounts::default());
        let after: Vec<usize> = tracked.iter().map(|o| o.refcount()).collect();
        assert_eq!(after, before);

        // idempotent
        cache.clear();
        cache.clear();
        let after2: Vec<usize> = tracked.iter().map(|o| o.refcount()).collect();
        assert_eq!(after2, before);
    }

    #[test]
    fn apply_without_snapshot_is_a_no_op() {
        let (ctx, _b) = hdr_context();
        let mut cache = PipelineStateCache::<MockContext>::new(DuplicateSlots::default());
        cache.apply(&ctx);
        assert!(ctx.calls().is_empty());
        assert_eq!(cache.apply_count(), 0);
    }

    #[test]
    fn render_targets_and_depth_restored_in_one_call() {
        let (ctx, b) = hdr_context();
        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        cache.capture(&ctx);

        let other = MockContext::new();
        other.with_state(|s| {
            assert!(s.rtvs.iter().all(|r| r.is_none()));
            assert!(s.dsv.is_none());
        });
        cache.apply(&other);

        let rt_calls: Vec<MockCall> = other
            .calls()
            .into_iter()
            .filter(|c| matches!(c, MockCall::SetRenderTargets { .. }))
            .collect();
        assert_eq!(
            rt_calls,
            vec![MockCall::SetRenderTargets {
                count: 2,
                dsv: true
            }]
        );
        other.with_state(|s| {
            assert_eq!(s.rtvs[0], Some(b.rtvs[0].clone()));
            assert_eq!(s.rtvs[1], Some(b.rtvs[1].clone()));
            assert!(s.rtvs[2..].iter().all(|r| r.is_none()));
            assert_eq!(s.dsv, Some(b.dsv.clone()));
        });
    }

    #[test]
    fn apply_order() {
        let (ctx, _b) = hdr_context();
        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        cache.capture(&ctx);
        let other = MockContext::new();
        cache.apply(&other);
        let kinds: Vec<&'static str> = other
            .calls()
            .iter()
            .map(|c| match c {
                MockCall::PsSetShader => "ps",
                MockCall::VsSetShader => "vs",
                MockCall::PsSetConstantBuffers { .. } => "pscb",
                MockCall::PsSetShaderResources { .. } => "srv",
                MockCall::PsSetSamplers { .. } => "samp",
                MockCall::SetRenderTargets { .. } => "rt",
                MockCall::SetBlendState => "blend",
                MockCall::SetDepthStencilState => "depth",
                MockCall::SetRasterizerState => "raster",
                MockCall::SetViewport => "vp",
                MockCall::SetInputLayout => "il",
                MockCall::SetTopology(_) => "topo",
                MockCall::SetVertexBuffer => "vb",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "ps", "vs", "pscb", "srv", "samp", "rt", "blend", "depth", "raster", "vp", "il",
                "topo", "vb"
            ]
        );
    }

    #[test]
    fn release_resources_drops_duplicates() {
        let (ctx, _b) = hdr_context();
        let mut cache = PipelineStateCache::new(DuplicateSlots::default());
        cache.capture(&ctx);
        let copy_view = cache.snapshot().unwrap().shader_resources.get(1).unwrap().clone();
        // snapshot + duplicate cache + local
        assert_eq!(copy_view.refcount(), 3);
        cache.clear();
        assert_eq!(copy_view.refcount(), 2);
        cache.release_resources();
        assert_eq!(copy_view.refcount(), 1);
    }

    #[test]
    fn duplicate_sources_check() {
        let (ctx, _b) = hdr_context();
        let cache = PipelineStateCache::<MockContext>::new(DuplicateSlots::default());
        assert!(cache.duplicate_sources_bound(&ctx));
        ctx.ps_set_shader_resources(2, &[None]);
        assert!(!cache.duplicate_sources_bound(&ctx));
        let far = PipelineStateCache::<MockContext>::new(DuplicateSlots {
            bloom: 1,
            luminance: 40,
        });
        assert!(!far.duplicate_sources_bound(&ctx));
    }
}
