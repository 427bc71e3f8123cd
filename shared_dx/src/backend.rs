//! The part of the D3D11 immediate context (and its device) that the state cache and the bridge
//! actually use.
//!
//! Handles follow COM rules through `Clone`/`Drop`: cloning a handle is an AddRef, dropping one
//! is a Release.  "Get" methods hand back owned handles (the API already added a reference),
//! "set" methods borrow and never take ownership.  That way a snapshot that holds handles
//! releases exactly what it acquired when it is dropped or cleared.

use std::fmt::Debug;

use crate::error::Result;

/// D3D11_COMMONSHADER_CONSTANT_BUFFER_API_SLOT_COUNT
pub const CONSTANT_BUFFER_SLOTS: usize = 14;
/// Pixel shader resource slots that are captured.  The API allows 128 but the engine never
/// binds past 16 for the passes we care about.
pub const SHADER_RESOURCE_SLOTS: usize = 16;
/// D3D11_COMMONSHADER_SAMPLER_SLOT_COUNT
pub const SAMPLER_SLOTS: usize = 16;
/// D3D11_SIMULTANEOUS_RENDER_TARGET_COUNT
pub const RENDER_TARGET_SLOTS: usize = 8;

pub const BIND_SHADER_RESOURCE: u32 = 0x8;
pub const BIND_RENDER_TARGET: u32 = 0x20;
pub const BIND_UNORDERED_ACCESS: u32 = 0x80;

/// DXGI_FORMAT_R8_UNORM
pub const FORMAT_R8_UNORM: u32 = 61;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub top_left_x: f32,
    pub top_left_y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

/// Enough of a 2D texture description to create a compatible copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    /// raw DXGI_FORMAT value
    pub format: u32,
    pub mip_levels: u32,
    pub array_size: u32,
    pub sample_count: u32,
}

impl TextureInfo {
    pub fn new_2d(width: u32, height: u32, format: u32) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
            array_size: 1,
            sample_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexBufferBinding<B> {
    pub buffer: B,
    pub stride: u32,
    pub offset: u32,
}

/// Blend state plus the two values that are set in the same call.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendBinding<S> {
    pub state: Option<S>,
    pub factor: [f32; 4],
    pub sample_mask: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthStencilBinding<S> {
    pub state: Option<S>,
    pub stencil_ref: u32,
}

/// Bounds every handle type meets.  Equality is object identity.
pub trait Handle: Clone + PartialEq + Debug {}
impl<T: Clone + PartialEq + Debug> Handle for T {}

pub trait GraphicsContext {
    type PixelShader: Handle;
    type VertexShader: Handle;
    type ComputeShader: Handle;
    type Buffer: Handle;
    type ShaderResourceView: Handle;
    type UnorderedAccessView: Handle;
    type SamplerState: Handle;
    type RenderTargetView: Handle;
    type DepthStencilView: Handle;
    type BlendState: Handle;
    type DepthStencilState: Handle;
    type RasterizerState: Handle;
    type InputLayout: Handle;
    type Texture: Handle;

    // programs
    fn ps_get_shader(&self) -> Option<Self::PixelShader>;
    fn ps_set_shader(&self, shader: Option<&Self::PixelShader>);
    fn vs_get_shader(&self) -> Option<Self::VertexShader>;
    fn vs_set_shader(&self, shader: Option<&Self::VertexShader>);

    // slot arrays; `out.len()` is the number of slots queried starting at 0
    fn ps_get_constant_buffers(&self, out: &mut [Option<Self::Buffer>]);
    fn ps_set_constant_buffers(&self, start: u32, buffers: &[Option<Self::Buffer>]);
    fn vs_get_constant_buffers(&self, out: &mut [Option<Self::Buffer>]);
    fn vs_set_constant_buffers(&self, start: u32, buffers: &[Option<Self::Buffer>]);
    fn ps_get_shader_resources(&self, out: &mut [Option<Self::ShaderResourceView>]);
    fn ps_set_shader_resources(&self, start: u32, views: &[Option<Self::ShaderResourceView>]);
    fn ps_get_samplers(&self, out: &mut [Option<Self::SamplerState>]);
    fn ps_set_samplers(&self, start: u32, samplers: &[Option<Self::SamplerState>]);

    // output merger
    /// Fills `out` with the bound render targets and returns the depth-stencil view.
    fn om_get_render_targets(
        &self,
        out: &mut [Option<Self::RenderTargetView>],
    ) -> Option<Self::DepthStencilView>;
    /// Binds render targets and the depth-stencil view together.  This is one API call; there
    /// is no way to set either half alone through this trait.
    fn om_set_render_targets(
        &self,
        targets: &[Option<Self::RenderTargetView>],
        depth: Option<&Self::DepthStencilView>,
    );
    fn om_get_blend_state(&self) -> BlendBinding<Self::BlendState>;
    fn om_set_blend_state(&self, blend: &BlendBinding<Self::BlendState>);
    fn om_get_depth_stencil_state(&self) -> DepthStencilBinding<Self::DepthStencilState>;
    fn om_set_depth_stencil_state(&self, depth: &DepthStencilBinding<Self::DepthStencilState>);

    // rasterizer
    fn rs_get_state(&self) -> Option<Self::RasterizerState>;
    fn rs_set_state(&self, state: Option<&Self::RasterizerState>);
    /// First bound viewport, if any.
    fn rs_get_viewport(&self) -> Option<Viewport>;
    fn rs_set_viewport(&self, viewport: &Viewport);

    // input assembler
    fn ia_get_input_layout(&self) -> Option<Self::InputLayout>;
    fn ia_set_input_layout(&self, layout: Option<&Self::InputLayout>);
    /// raw D3D11_PRIMITIVE_TOPOLOGY
    fn ia_get_primitive_topology(&self) -> u32;
    fn ia_set_primitive_topology(&self, topology: u32);
    /// Vertex buffer in slot 0.
    fn ia_get_vertex_buffer(&self) -> Option<VertexBufferBinding<Self::Buffer>>;
    fn ia_set_vertex_buffer(&self, binding: &VertexBufferBinding<Self::Buffer>);

    // resources
    /// The 2D texture behind a shader resource view, with its description.  None if the view
    /// is not backed by a 2D texture.
    fn srv_texture(&self, view: &Self::ShaderResourceView) -> Option<(Self::Texture, TextureInfo)>;
    fn create_texture(&self, info: &TextureInfo, bind_flags: u32) -> Result<Self::Texture>;
    /// Create a view of `texture`.  When `template` is given its view description is reused,
    /// which matters for typeless formats.
    fn create_shader_resource_view(
        &self,
        texture: &Self::Texture,
        template: Option<&Self::ShaderResourceView>,
    ) -> Result<Self::ShaderResourceView>;
    fn create_unordered_access_view(&self, texture: &Self::Texture)
        -> Result<Self::UnorderedAccessView>;
    /// Fails unless `texture` was created with `BIND_RENDER_TARGET`.
    fn create_render_target_view(&self, texture: &Self::Texture)
        -> Result<Self::RenderTargetView>;
    fn copy_resource(&self, dst: &Self::Texture, src: &Self::Texture);
    fn clear_unordered_access_view(&self, view: &Self::UnorderedAccessView, value: [f32; 4]);

    // compute
    /// Compile HLSL compute source (cs_5_0) and create the shader.
    fn create_compute_shader(&self, source: &str, entry: &str) -> Result<Self::ComputeShader>;
    fn cs_set_shader(&self, shader: Option<&Self::ComputeShader>);
    fn cs_set_shader_resources(&self, start: u32, views: &[Option<Self::ShaderResourceView>]);
    fn cs_set_unordered_access_views(
        &self,
        start: u32,
        views: &[Option<Self::UnorderedAccessView>],
    );
    fn dispatch(&self, x: u32, y: u32, z: u32);

    // Raw interface pointers read out of memory we don't own.  Each returns a new reference
    // (AddRef) so the caller's handle stays valid for as long as it is held.  Null yields None.
    unsafe fn texture_from_raw(&self, raw: usize) -> Option<Self::Texture>;
    unsafe fn uav_from_raw(&self, raw: usize) -> Option<Self::UnorderedAccessView>;
    unsafe fn srv_from_raw(&self, raw: usize) -> Option<Self::ShaderResourceView>;
    unsafe fn compute_shader_from_raw(&self, raw: usize) -> Option<Self::ComputeShader>;
}

/// Thread groups needed to cover `extent` pixels with groups of `group` threads.
pub fn group_count(extent: u32, group: u32) -> u32 {
    if group == 0 {
        return 0;
    }
    extent.div_ceil(group)
}
