//! In-memory `GraphicsContext` for tests.
//!
//! Every object is a `MockObject`, an `Rc` around an id, so the strong count stands in for the
//! COM reference count.  Set calls land in a `MockCall` log in order; get calls are not logged.
//!
//! Texture contents are reduced to one bit: whether anything has drawn into the texture since
//! it was last cleared.  `draw` sets it for every bound render target, a UAV clear resets it, and
//! each dispatch records it for the compute SRVs it read.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::*;
use crate::error::{HookError, Result};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct ObjectInfo {
    pub id: u64,
    pub label: &'static str,
    /// set for textures
    pub texture: Option<TextureInfo>,
    /// set for views: the texture they look at
    pub resource: Option<MockObject>,
}

#[derive(Clone)]
pub struct MockObject(Rc<ObjectInfo>);

impl MockObject {
    fn make(
        label: &'static str,
        texture: Option<TextureInfo>,
        resource: Option<MockObject>,
    ) -> Self {
        MockObject(Rc::new(ObjectInfo {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            label,
            texture,
            resource,
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.0
    }

    /// Outstanding references, including this one.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl PartialEq for MockObject {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl fmt::Debug for MockObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.label, self.0.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    PsSetShader,
    VsSetShader,
    PsSetConstantBuffers { start: u32, count: usize },
    VsSetConstantBuffers { start: u32, count: usize },
    PsSetShaderResources { start: u32, count: usize },
    PsSetSamplers { start: u32, count: usize },
    SetRenderTargets { count: usize, dsv: bool },
    SetBlendState,
    SetDepthStencilState,
    SetRasterizerState,
    SetViewport,
    SetInputLayout,
    SetTopology(u32),
    SetVertexBuffer,
    CreateTexture { width: u32, height: u32, format: u32 },
    CreateShaderResourceView,
    CreateUnorderedAccessView,
    CopyResource { dst: u64, src: u64 },
    ClearUav { uav: u64 },
    CreateRenderTargetView,
    Draw,
    CreateComputeShader,
    CsSetShader { bound: bool },
    CsSetShaderResources { start: u32, count: usize },
    CsSetUnorderedAccessViews { start: u32, count: usize },
    Dispatch(u32, u32, u32),
}

pub const CS_SLOTS: usize = 8;

/// Everything currently bound on the mock context.
#[derive(Debug)]
pub struct MockState {
    pub ps_shader: Option<MockObject>,
    pub vs_shader: Option<MockObject>,
    pub ps_cbs: Vec<Option<MockObject>>,
    pub vs_cbs: Vec<Option<MockObject>>,
    pub ps_srvs: Vec<Option<MockObject>>,
    pub ps_samplers: Vec<Option<MockObject>>,
    pub rtvs: Vec<Option<MockObject>>,
    pub dsv: Option<MockObject>,
    pub blend: BlendBinding<MockObject>,
    pub depth: DepthStencilBinding<MockObject>,
    pub raster: Option<MockObject>,
    pub viewport: Option<Viewport>,
    pub input_layout: Option<MockObject>,
    pub topology: u32,
    pub vertex_buffer: Option<VertexBufferBinding<MockObject>>,
    pub cs_shader: Option<MockObject>,
    pub cs_srvs: Vec<Option<MockObject>>,
    pub cs_uavs: Vec<Option<MockObject>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            ps_shader: None,
            vs_shader: None,
            ps_cbs: vec![None; CONSTANT_BUFFER_SLOTS],
            vs_cbs: vec![None; CONSTANT_BUFFER_SLOTS],
            ps_srvs: vec![None; SHADER_RESOURCE_SLOTS],
            ps_samplers: vec![None; SAMPLER_SLOTS],
            rtvs: vec![None; RENDER_TARGET_SLOTS],
            dsv: None,
            blend: BlendBinding {
                state: None,
                factor: [1.0; 4],
                sample_mask: 0xffff_ffff,
            },
            depth: DepthStencilBinding {
                state: None,
                stencil_ref: 0,
            },
            raster: None,
            viewport: None,
            input_layout: None,
            topology: 0,
            vertex_buffer: None,
            cs_shader: None,
            cs_srvs: vec![None; CS_SLOTS],
            cs_uavs: vec![None; CS_SLOTS],
        }
    }
}

#[derive(Default)]
pub struct MockContext {
    state: RefCell<MockState>,
    calls: RefCell<Vec<MockCall>>,
    raw: RefCell<HashMap<usize, MockObject>>,
    bind_flags: RefCell<HashMap<u64, u32>>,
    written: RefCell<HashSet<u64>>,
    dispatch_inputs: RefCell<Vec<Vec<bool>>>,
    pub fail_texture_creation: bool,
    pub fail_view_creation: bool,
    pub fail_shader_compile: bool,
}

fn copy_into(out: &mut [Option<MockObject>], from: &[Option<MockObject>]) {
    for (o, f) in out.iter_mut().zip(from.iter()) {
        *o = f.clone();
    }
}

fn set_range(slots: &mut [Option<MockObject>], start: u32, from: &[Option<MockObject>]) {
    let start = start as usize;
    for (i, f) in from.iter().enumerate() {
        if let Some(slot) = slots.get_mut(start + i) {
            *slot = f.clone();
        }
    }
}

impl MockContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh object of any kind.  The returned handle holds the only reference.
    pub fn new_object(&self, label: &'static str) -> MockObject {
        MockObject::make(label, None, None)
    }

    pub fn new_texture(&self, info: TextureInfo) -> MockObject {
        MockObject::make("texture", Some(info), None)
    }

    pub fn new_srv_for(&self, texture: &MockObject) -> MockObject {
        MockObject::make("srv", None, Some(texture.clone()))
    }

    pub fn new_uav_for(&self, texture: &MockObject) -> MockObject {
        MockObject::make("uav", None, Some(texture.clone()))
    }

    /// Make `obj` reachable through the `*_from_raw` functions and return its fake address.
    pub fn register_raw(&self, obj: &MockObject) -> usize {
        let addr = 0x7ff0_0000_usize + (obj.id() as usize) * 0x10;
        self.raw.borrow_mut().insert(addr, obj.clone());
        addr
    }

    /// A draw: everything behind the bound render targets now has content.
    pub fn draw(&self) {
        let targets: Vec<u64> = self
            .state
            .borrow()
            .rtvs
            .iter()
            .flatten()
            .filter_map(|v| v.info().resource.as_ref().map(|t| t.id()))
            .collect();
        self.written.borrow_mut().extend(targets);
        self.log(MockCall::Draw);
    }

    pub fn is_written(&self, texture: &MockObject) -> bool {
        self.written.borrow().contains(&texture.id())
    }

    /// Per dispatch, whether each bound compute SRV looked at a texture with content.
    pub fn dispatch_inputs(&self) -> Vec<Vec<bool>> {
        self.dispatch_inputs.borrow().clone()
    }

    pub fn bind_flags(&self, texture: &MockObject) -> Option<u32> {
        self.bind_flags.borrow().get(&texture.id()).copied()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&MockState) -> R) -> R {
        f(&self.state.borrow())
    }

    /// Drop every binding, as if the context had just been created.
    pub fn unbind_all(&self) {
        *self.state.borrow_mut() = MockState::default();
    }

    fn log(&self, call: MockCall) {
        self.calls.borrow_mut().push(call);
    }

    fn from_raw(&self, raw: usize) -> Option<MockObject> {
        if raw == 0 {
            return None;
        }
        self.raw.borrow().get(&raw).cloned()
    }
}

impl GraphicsContext for MockContext {
    type PixelShader = MockObject;
    type VertexShader = MockObject;
    type ComputeShader = MockObject;
    type Buffer = MockObject;
    type ShaderResourceView = MockObject;
    type UnorderedAccessView = MockObject;
    type SamplerState = MockObject;
    type RenderTargetView = MockObject;
    type DepthStencilView = MockObject;
    type BlendState = MockObject;
    type DepthStencilState = MockObject;
    type RasterizerState = MockObject;
    type InputLayout = MockObject;
    type Texture = MockObject;

    fn ps_get_shader(&self) -> Option<MockObject> {
        self.state.borrow().ps_shader.clone()
    }
    fn ps_set_shader(&self, shader: Option<&MockObject>) {
        self.state.borrow_mut().ps_shader = shader.cloned();
        self.log(MockCall::PsSetShader);
    }
    fn vs_get_shader(&self) -> Option<MockObject> {
        self.state.borrow().vs_shader.clone()
    }
    fn vs_set_shader(&self, shader: Option<&MockObject>) {
        self.state.borrow_mut().vs_shader = shader.cloned();
        self.log(MockCall::VsSetShader);
    }

    fn ps_get_constant_buffers(&self, out: &mut [Option<MockObject>]) {
        copy_into(out, &self.state.borrow().ps_cbs);
    }
    fn ps_set_constant_buffers(&self, start: u32, buffers: &[Option<MockObject>]) {
        set_range(&mut self.state.borrow_mut().ps_cbs, start, buffers);
        self.log(MockCall::PsSetConstantBuffers {
            start,
            count: buffers.len(),
        });
    }
    fn vs_get_constant_buffers(&self, out: &mut [Option<MockObject>]) {
        copy_into(out, &self.state.borrow().vs_cbs);
    }
    fn vs_set_constant_buffers(&self, start: u32, buffers: &[Option<MockObject>]) {
        set_range(&mut self.state.borrow_mut().vs_cbs, start, buffers);
        self.log(MockCall::VsSetConstantBuffers {
            start,
            count: buffers.len(),
        });
    }
    fn ps_get_shader_resources(&self, out: &mut [Option<MockObject>]) {
        copy_into(out, &self.state.borrow().ps_srvs);
    }
    fn ps_set_shader_resources(&self, start: u32, views: &[Option<MockObject>]) {
        set_range(&mut self.state.borrow_mut().ps_srvs, start, views);
        self.log(MockCall::PsSetShaderResources {
            start,
            count: views.len(),
        });
    }
    fn ps_get_samplers(&self, out: &mut [Option<MockObject>]) {
        copy_into(out, &self.state.borrow().ps_samplers);
    }
    fn ps_set_samplers(&self, start: u32, samplers: &[Option<MockObject>]) {
        set_range(&mut self.state.borrow_mut().ps_samplers, start, samplers);
        self.log(MockCall::PsSetSamplers {
            start,
            count: samplers.len(),
        });
    }

    fn om_get_render_targets(&self, out: &mut [Option<MockObject>]) -> Option<MockObject> {
        let st = self.state.borrow();
        copy_into(out, &st.rtvs);
        st.dsv.clone()
    }
    fn om_set_render_targets(&self, targets: &[Option<MockObject>], depth: Option<&MockObject>) {
        {
            // like the real call, slots past `targets.len()` are unbound
            let mut st = self.state.borrow_mut();
            for (i, slot) in st.rtvs.iter_mut().enumerate() {
                *slot = targets.get(i).cloned().flatten();
            }
            st.dsv = depth.cloned();
        }
        self.log(MockCall::SetRenderTargets {
            count: targets.len(),
            dsv: depth.is_some(),
        });
    }
    fn om_get_blend_state(&self) -> BlendBinding<MockObject> {
        self.state.borrow().blend.clone()
    }
    fn om_set_blend_state(&self, blend: &BlendBinding<MockObject>) {
        self.state.borrow_mut().blend = blend.clone();
        self.log(MockCall::SetBlendState);
    }
    fn om_get_depth_stencil_state(&self) -> DepthStencilBinding<MockObject> {
        self.state.borrow().depth.clone()
    }
    fn om_set_depth_stencil_state(&self, depth: &DepthStencilBinding<MockObject>) {
        self.state.borrow_mut().depth = depth.clone();
        self.log(MockCall::SetDepthStencilState);
    }

    fn rs_get_state(&self) -> Option<MockObject> {
        self.state.borrow().raster.clone()
    }
    fn rs_set_state(&self, state: Option<&MockObject>) {
        self.state.borrow_mut().raster = state.cloned();
        self.log(MockCall::SetRasterizerState);
    }
    fn rs_get_viewport(&self) -> Option<Viewport> {
        self.state.borrow().viewport
    }
    fn rs_set_viewport(&self, viewport: &Viewport) {
        self.state.borrow_mut().viewport = Some(*viewport);
        self.log(MockCall::SetViewport);
    }

    fn ia_get_input_layout(&self) -> Option<MockObject> {
        self.state.borrow().input_layout.clone()
    }
    fn ia_set_input_layout(&self, layout: Option<&MockObject>) {
        self.state.borrow_mut().input_layout = layout.cloned();
        self.log(MockCall::SetInputLayout);
    }
    fn ia_get_primitive_topology(&self) -> u32 {
        self.state.borrow().topology
    }
    fn ia_set_primitive_topology(&self, topology: u32) {
        self.state.borrow_mut().topology = topology;
        self.log(MockCall::SetTopology(topology));
    }
    fn ia_get_vertex_buffer(&self) -> Option<VertexBufferBinding<MockObject>> {
        self.state.borrow().vertex_buffer.clone()
    }
    fn ia_set_vertex_buffer(&self, binding: &VertexBufferBinding<MockObject>) {
        self.state.borrow_mut().vertex_buffer = Some(binding.clone());
        self.log(MockCall::SetVertexBuffer);
    }

    fn srv_texture(&self, view: &MockObject) -> Option<(MockObject, TextureInfo)> {
        let tex = view.info().resource.as_ref()?;
        let info = tex.info().texture?;
        Some((tex.clone(), info))
    }
    fn create_texture(&self, info: &TextureInfo, bind_flags: u32) -> Result<MockObject> {
        if self.fail_texture_creation {
            return Err(HookError::ResourceCreateFailed("mock texture".to_string()));
        }
        self.log(MockCall::CreateTexture {
            width: info.width,
            height: info.height,
            format: info.format,
        });
        let texture = MockObject::make("texture", Some(*info), None);
        self.bind_flags.borrow_mut().insert(texture.id(), bind_flags);
        Ok(texture)
    }
    fn create_shader_resource_view(
        &self,
        texture: &MockObject,
        _template: Option<&MockObject>,
    ) -> Result<MockObject> {
        if self.fail_view_creation {
            return Err(HookError::ResourceCreateFailed("mock srv".to_string()));
        }
        self.log(MockCall::CreateShaderResourceView);
        Ok(MockObject::make("srv", None, Some(texture.clone())))
    }
    fn create_unordered_access_view(&self, texture: &MockObject) -> Result<MockObject> {
        if self.fail_view_creation {
            return Err(HookError::ResourceCreateFailed("mock uav".to_string()));
        }
        self.log(MockCall::CreateUnorderedAccessView);
        Ok(MockObject::make("uav", None, Some(texture.clone())))
    }
    fn create_render_target_view(&self, texture: &MockObject) -> Result<MockObject> {
        // textures made with new_texture have no recorded flags and are accepted
        let flags = self.bind_flags(texture).unwrap_or(BIND_RENDER_TARGET);
        if self.fail_view_creation || flags & BIND_RENDER_TARGET == 0 {
            return Err(HookError::ResourceCreateFailed("mock rtv".to_string()));
        }
        self.log(MockCall::CreateRenderTargetView);
        Ok(MockObject::make("rtv", None, Some(texture.clone())))
    }
    fn copy_resource(&self, dst: &MockObject, src: &MockObject) {
        if self.is_written(src) {
            self.written.borrow_mut().insert(dst.id());
        }
        self.log(MockCall::CopyResource {
            dst: dst.id(),
            src: src.id(),
        });
    }
    fn clear_unordered_access_view(&self, view: &MockObject, _value: [f32; 4]) {
        if let Some(tex) = view.info().resource.as_ref() {
            self.written.borrow_mut().remove(&tex.id());
        }
        self.log(MockCall::ClearUav { uav: view.id() });
    }

    fn create_compute_shader(&self, source: &str, entry: &str) -> Result<MockObject> {
        if self.fail_shader_compile || source.is_empty() || entry.is_empty() {
            return Err(HookError::ShaderCompileFailed("mock compile".to_string()));
        }
        self.log(MockCall::CreateComputeShader);
        Ok(MockObject::make("cs", None, None))
    }
    fn cs_set_shader(&self, shader: Option<&MockObject>) {
        self.state.borrow_mut().cs_shader = shader.cloned();
        self.log(MockCall::CsSetShader {
            bound: shader.is_some(),
        });
    }
    fn cs_set_shader_resources(&self, start: u32, views: &[Option<MockObject>]) {
        set_range(&mut self.state.borrow_mut().cs_srvs, start, views);
        self.log(MockCall::CsSetShaderResources {
            start,
            count: views.len(),
        });
    }
    fn cs_set_unordered_access_views(&self, start: u32, views: &[Option<MockObject>]) {
        set_range(&mut self.state.borrow_mut().cs_uavs, start, views);
        self.log(MockCall::CsSetUnorderedAccessViews {
            start,
            count: views.len(),
        });
    }
    fn dispatch(&self, x: u32, y: u32, z: u32) {
        let inputs = self
            .state
            .borrow()
            .cs_srvs
            .iter()
            .flatten()
            .map(|v| v.info().resource.as_ref().map_or(false, |t| self.is_written(t)))
            .collect();
        self.dispatch_inputs.borrow_mut().push(inputs);
        self.log(MockCall::Dispatch(x, y, z));
    }

    unsafe fn texture_from_raw(&self, raw: usize) -> Option<MockObject> {
        self.from_raw(raw)
    }
    unsafe fn uav_from_raw(&self, raw: usize) -> Option<MockObject> {
        self.from_raw(raw)
    }
    unsafe fn srv_from_raw(&self, raw: usize) -> Option<MockObject> {
        self.from_raw(raw)
    }
    unsafe fn compute_shader_from_raw(&self, raw: usize) -> Option<MockObject> {
        self.from_raw(raw)
    }
}
