//! A snapshot of what is bound on a context, and how to bind it again.

use shared_dx::backend::*;

/// Captured contents of one slot array.  Only the prefix up to the last bound slot is kept;
/// `count()` is one past the highest non-null slot, or 0 if nothing was bound.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotBank<T> {
    slots: Vec<Option<T>>,
}

impl<T> SlotBank<T> {
    pub fn from_slots(mut slots: Vec<Option<T>>) -> Self {
        let count = slots.iter().rposition(|s| s.is_some()).map_or(0, |i| i + 1);
        slots.truncate(count);
        Self { slots }
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Option<T>] {
        &self.slots
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// Swap in `value` at an already active index.  Returns false if the index is past the
    /// active count.
    pub fn replace(&mut self, index: usize, value: T) -> bool {
        match self.slots.get_mut(index) {
            Some(s) => {
                *s = Some(value);
                true
            }
            None => false,
        }
    }
}

/// The bank's slots, extended with nulls to at least `n`.
fn padded<T: Clone>(bank: &SlotBank<T>, n: usize) -> Vec<Option<T>> {
    let mut slots = bank.slots().to_vec();
    if slots.len() < n {
        slots.resize(n, None);
    }
    slots
}

fn query<T: Clone>(n: usize, get: impl FnOnce(&mut [Option<T>])) -> SlotBank<T> {
    let mut slots = vec![None; n];
    get(&mut slots);
    SlotBank::from_slots(slots)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveCounts {
    pub ps_constant_buffers: usize,
    pub vs_constant_buffers: usize,
    pub shader_resources: usize,
    pub samplers: usize,
    pub render_targets: usize,
}

pub struct PipelineStateSnapshot<C: GraphicsContext> {
    pub pixel_shader: Option<C::PixelShader>,
    pub vertex_shader: Option<C::VertexShader>,
    pub ps_constant_buffers: SlotBank<C::Buffer>,
    pub vs_constant_buffers: SlotBank<C::Buffer>,
    pub shader_resources: SlotBank<C::ShaderResourceView>,
    pub samplers: SlotBank<C::SamplerState>,
    pub render_targets: SlotBank<C::RenderTargetView>,
    pub depth_stencil_view: Option<C::DepthStencilView>,
    pub blend: BlendBinding<C::BlendState>,
    pub depth_stencil: DepthStencilBinding<C::DepthStencilState>,
    pub rasterizer: Option<C::RasterizerState>,
    pub viewport: Option<Viewport>,
    pub input_layout: Option<C::InputLayout>,
    pub topology: u32,
    pub vertex_buffer: Option<VertexBufferBinding<C::Buffer>>,
}

impl<C: GraphicsContext> PipelineStateSnapshot<C> {
    /// Query everything currently bound.  Each held handle is a new reference.
    pub fn capture(ctx: &C) -> Self {
        let ps_constant_buffers = query(CONSTANT_BUFFER_SLOTS, |s| ctx.ps_get_constant_buffers(s));
        let vs_constant_buffers = query(CONSTANT_BUFFER_SLOTS, |s| ctx.vs_get_constant_buffers(s));
        let shader_resources = query(SHADER_RESOURCE_SLOTS, |s| ctx.ps_get_shader_resources(s));
        let samplers = query(SAMPLER_SLOTS, |s| ctx.ps_get_samplers(s));
        let mut depth_stencil_view = None;
        let render_targets = query(RENDER_TARGET_SLOTS, |s| {
            depth_stencil_view = ctx.om_get_render_targets(s);
        });
        Self {
            pixel_shader: ctx.ps_get_shader(),
            vertex_shader: ctx.vs_get_shader(),
            ps_constant_buffers,
            vs_constant_buffers,
            shader_resources,
            samplers,
            render_targets,
            depth_stencil_view,
            blend: ctx.om_get_blend_state(),
            depth_stencil: ctx.om_get_depth_stencil_state(),
            rasterizer: ctx.rs_get_state(),
            viewport: ctx.rs_get_viewport(),
            input_layout: ctx.ia_get_input_layout(),
            topology: ctx.ia_get_primitive_topology(),
            vertex_buffer: ctx.ia_get_vertex_buffer(),
        }
    }

    /// Rebind in a fixed order.  Slot arrays with a count of 0 are left alone, and so are the
    /// shaders, viewport and vertex buffer when none was captured.  Render targets and the
    /// depth view go down together in one call.
    pub fn apply(&self, ctx: &C) {
        if let Some(ps) = self.pixel_shader.as_ref() {
            ctx.ps_set_shader(Some(ps));
        }
        if let Some(vs) = self.vertex_shader.as_ref() {
            ctx.vs_set_shader(Some(vs));
        }
        if self.ps_constant_buffers.count() > 0 {
            ctx.ps_set_constant_buffers(0, self.ps_constant_buffers.slots());
        }
        if self.vs_constant_buffers.count() > 0 {
            ctx.vs_set_constant_buffers(0, self.vs_constant_buffers.slots());
        }
        if self.shader_resources.count() > 0 {
            ctx.ps_set_shader_resources(0, self.shader_resources.slots());
        }
        if self.samplers.count() > 0 {
            ctx.ps_set_samplers(0, self.samplers.slots());
        }
        if self.render_targets.count() > 0 || self.depth_stencil_view.is_some() {
            ctx.om_set_render_targets(
                self.render_targets.slots(),
                self.depth_stencil_view.as_ref(),
            );
        }
        ctx.om_set_blend_state(&self.blend);
        ctx.om_set_depth_stencil_state(&self.depth_stencil);
        ctx.rs_set_state(self.rasterizer.as_ref());
        if let Some(vp) = self.viewport.as_ref() {
            ctx.rs_set_viewport(vp);
        }
        ctx.ia_set_input_layout(self.input_layout.as_ref());
        ctx.ia_set_primitive_topology(self.topology);
        if let Some(vb) = self.vertex_buffer.as_ref() {
            ctx.ia_set_vertex_buffer(vb);
        }
    }

    /// Put this snapshot back after something with `covered` counts was bound over it.  Unlike
    /// `apply`, nothing is skipped: every slot `covered` reaches is written, with nulls past this
    /// snapshot's own counts, the shaders are set even when null, and the render targets and
    /// depth view always go down (again in one call).
    ///
    /// The viewport and vertex buffer are still only set when captured; there is no null
    /// vertex buffer binding to write.
    pub fn restore_over(&self, ctx: &C, covered: ActiveCounts) {
        ctx.ps_set_shader(self.pixel_shader.as_ref());
        ctx.vs_set_shader(self.vertex_shader.as_ref());
        let banks = [
            (self.ps_constant_buffers.count(), covered.ps_constant_buffers),
            (self.vs_constant_buffers.count(), covered.vs_constant_buffers),
            (self.shader_resources.count(), covered.shader_resources),
            (self.samplers.count(), covered.samplers),
        ];
        let [ps_cb, vs_cb, srv, smp] = banks.map(|(own, over)| own.max(over));
        if ps_cb > 0 {
            ctx.ps_set_constant_buffers(0, &padded(&self.ps_constant_buffers, ps_cb));
        }
        if vs_cb > 0 {
            ctx.vs_set_constant_buffers(0, &padded(&self.vs_constant_buffers, vs_cb));
        }
        if srv > 0 {
            ctx.ps_set_shader_resources(0, &padded(&self.shader_resources, srv));
        }
        if smp > 0 {
            ctx.ps_set_samplers(0, &padded(&self.samplers, smp));
        }
        let rt = self.render_targets.count().max(covered.render_targets);
        ctx.om_set_render_targets(
            &padded(&self.render_targets, rt),
            self.depth_stencil_view.as_ref(),
        );
        ctx.om_set_blend_state(&self.blend);
        ctx.om_set_depth_stencil_state(&self.depth_stencil);
        ctx.rs_set_state(self.rasterizer.as_ref());
        if let Some(vp) = self.viewport.as_ref() {
            ctx.rs_set_viewport(vp);
        }
        ctx.ia_set_input_layout(self.input_layout.as_ref());
        ctx.ia_set_primitive_topology(self.topology);
        if let Some(vb) = self.vertex_buffer.as_ref() {
            ctx.ia_set_vertex_buffer(vb);
        }
    }

    pub fn counts(&self) -> ActiveCounts {
        ActiveCounts {
            ps_constant_buffers: self.ps_constant_buffers.count(),
            vs_constant_buffers: self.vs_constant_buffers.count(),
            shader_resources: self.shader_resources.count(),
            samplers: self.samplers.count(),
            render_targets: self.render_targets.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_dx::mock::*;

    #[test]
    fn count_is_one_past_last_bound() {
        let b: SlotBank<u32> = SlotBank::from_slots(vec![None, Some(1), None, Some(3), None, None]);
        assert_eq!(b.count(), 4);
        assert_eq!(b.get(3), Some(&3));
        assert_eq!(b.get(2), None);
        assert_eq!(b.get(4), None);

        let empty: SlotBank<u32> = SlotBank::from_slots(vec![None; 16]);
        assert_eq!(empty.count(), 0);
        let full: SlotBank<u32> = SlotBank::from_slots((0..16).map(Some).collect());
        assert_eq!(full.count(), 16);
        let first: SlotBank<u32> = SlotBank::from_slots(vec![Some(0), None, None]);
        assert_eq!(first.count(), 1);
    }

    #[test]
    fn captured_counts_follow_highest_slot() {
        let ctx = MockContext::new();
        for last in 0..SHADER_RESOURCE_SLOTS {
            ctx.unbind_all();
            let srv = ctx.new_object("srv");
            let mut views = vec![None; last + 1];
            views[last] = Some(srv.clone());
            ctx.ps_set_shader_resources(0, &views);
            let snap = PipelineStateSnapshot::capture(&ctx);
            assert_eq!(snap.counts().shader_resources, last + 1);
            assert_eq!(snap.counts().samplers, 0);
            assert_eq!(snap.counts().render_targets, 0);
        }
        for last in 0..CONSTANT_BUFFER_SLOTS {
            ctx.unbind_all();
            let cb = ctx.new_object("cb");
            ctx.vs_set_constant_buffers(last as u32, &[Some(cb)]);
            let snap = PipelineStateSnapshot::capture(&ctx);
            assert_eq!(snap.counts().vs_constant_buffers, last + 1);
            assert_eq!(snap.counts().ps_constant_buffers, 0);
        }
    }

    #[test]
    fn apply_skips_empty_categories() {
        let src = MockContext::new();
        let snap = PipelineStateSnapshot::capture(&src);
        let dst = MockContext::new();
        let keep = dst.new_object("srv");
        dst.ps_set_shader_resources(3, &[Some(keep.clone())]);
        dst.clear_calls();
        snap.apply(&dst);
        assert_eq!(
            dst.count_calls(|c| matches!(
                c,
                MockCall::PsSetShaderResources { .. }
                    | MockCall::PsSetSamplers { .. }
                    | MockCall::SetRenderTargets { .. }
                    | MockCall::PsSetShader
                    | MockCall::SetViewport
                    | MockCall::SetVertexBuffer
            )),
            0
        );
        dst.with_state(|s| assert_eq!(s.ps_srvs[3], Some(keep.clone())));
    }

    #[test]
    fn restore_over_nulls_what_was_bound_on_top() {
        let ctx = MockContext::new();
        let engine_sampler = ctx.new_object("sampler");
        ctx.ps_set_samplers(0, &[Some(engine_sampler.clone())]);
        let saved = PipelineStateSnapshot::capture(&ctx);

        // something else binds over it
        let ps = ctx.new_object("ps");
        let cb = ctx.new_object("cb");
        let srvs: Vec<Option<MockObject>> = (0..3).map(|_| Some(ctx.new_object("srv"))).collect();
        let rtv = ctx.new_object("rtv");
        let dsv = ctx.new_object("dsv");
        ctx.ps_set_shader(Some(&ps));
        ctx.ps_set_constant_buffers(0, &[Some(cb.clone())]);
        ctx.ps_set_shader_resources(0, &srvs);
        ctx.ps_set_samplers(0, &[Some(ctx.new_object("sampler")), Some(ctx.new_object("sampler"))]);
        ctx.om_set_render_targets(&[Some(rtv.clone()), None], Some(&dsv));
        let covered = PipelineStateSnapshot::capture(&ctx).counts();

        saved.restore_over(&ctx, covered);
        ctx.with_state(|s| {
            assert_eq!(s.ps_shader, None);
            assert!(s.ps_cbs.iter().all(|c| c.is_none()));
            assert!(s.ps_srvs.iter().all(|v| v.is_none()));
            assert_eq!(s.ps_samplers[0], Some(engine_sampler.clone()));
            assert_eq!(s.ps_samplers[1], None);
            assert!(s.rtvs.iter().all(|v| v.is_none()));
            assert_eq!(s.dsv, None);
        });
        // only the locals hold references now
        assert_eq!(ps.refcount(), 1);
        assert_eq!(cb.refcount(), 1);
        assert_eq!(rtv.refcount(), 1);
        assert_eq!(dsv.refcount(), 1);
    }
}
