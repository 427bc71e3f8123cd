//! The real `GraphicsContext`: a D3D11 immediate context plus the device that owns it.

use std::ffi::CString;
use std::ptr::{self, NonNull};

use tracing::error;
use winapi::ctypes::c_void;
use winapi::shared::dxgiformat::DXGI_FORMAT;
use winapi::shared::dxgitype::DXGI_SAMPLE_DESC;
use winapi::shared::minwindef::UINT;
use winapi::shared::winerror::SUCCEEDED;
use winapi::um::d3d11::*;
use winapi::um::d3dcommon::ID3DBlob;
use winapi::um::libloaderapi::{GetProcAddress, LoadLibraryA};
use winapi::um::unknwnbase::IUnknown;
use winapi::Interface;

use crate::backend::*;
use crate::defs_dx11::D3DCompileFn;
use crate::error::{HookError, Result};

/// Owned COM reference.  Clone is AddRef, Drop is Release.
pub struct ComRef<T: Interface> {
    ptr: NonNull<T>,
}

impl<T: Interface> ComRef<T> {
    /// Take ownership of a reference the caller already holds (e.g. an out-param from a Get
    /// call).  Null yields None.
    pub unsafe fn from_raw(raw: *mut T) -> Option<Self> {
        NonNull::new(raw).map(|ptr| ComRef { ptr })
    }

    /// Add a reference to a pointer we don't own.
    pub unsafe fn from_raw_addref(raw: *mut T) -> Option<Self> {
        let r = Self::from_raw(raw)?;
        (*(r.ptr.as_ptr() as *mut IUnknown)).AddRef();
        Some(r)
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn query<U: Interface>(&self) -> Option<ComRef<U>> {
        let mut out: *mut c_void = ptr::null_mut();
        let hr = unsafe {
            (*(self.ptr.as_ptr() as *mut IUnknown)).QueryInterface(&U::uuidof(), &mut out)
        };
        if !SUCCEEDED(hr) {
            return None;
        }
        unsafe { ComRef::from_raw(out as *mut U) }
    }
}

impl<T: Interface> Clone for ComRef<T> {
    fn clone(&self) -> Self {
        unsafe {
            (*(self.ptr.as_ptr() as *mut IUnknown)).AddRef();
        }
        ComRef { ptr: self.ptr }
    }
}

impl<T: Interface> Drop for ComRef<T> {
    fn drop(&mut self) {
        unsafe {
            (*(self.ptr.as_ptr() as *mut IUnknown)).Release();
        }
    }
}

impl<T: Interface> PartialEq for ComRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Interface> std::fmt::Debug for ComRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ComRef({:p})", self.ptr.as_ptr())
    }
}

// the biggest slot array we ever move in one call
const MAX_SLOTS: usize = 16;

fn raw_slots<T: Interface>(slots: &[Option<ComRef<T>>]) -> ([*mut T; MAX_SLOTS], UINT) {
    let mut raw = [ptr::null_mut(); MAX_SLOTS];
    let n = slots.len().min(MAX_SLOTS);
    for (r, s) in raw.iter_mut().zip(slots.iter()).take(n) {
        *r = s.as_ref().map_or(ptr::null_mut(), |c| c.as_ptr());
    }
    (raw, n as UINT)
}

/// Fill `out` from a Get call's out-array.  The API has already added a reference to each.
unsafe fn adopt_slots<T: Interface>(
    out: &mut [Option<ComRef<T>>],
    fill: impl FnOnce(UINT, *mut *mut T),
) {
    let mut raw = [ptr::null_mut(); MAX_SLOTS];
    let n = out.len().min(MAX_SLOTS);
    fill(n as UINT, raw.as_mut_ptr());
    for (o, r) in out.iter_mut().zip(raw.iter()).take(n) {
        *o = ComRef::from_raw(*r);
    }
}

fn or_null<T: Interface>(r: Option<&ComRef<T>>) -> *mut T {
    r.map_or(ptr::null_mut(), |c| c.as_ptr())
}

pub struct D3D11Context {
    ctx: ComRef<ID3D11DeviceContext>,
    device: ComRef<ID3D11Device>,
}

impl D3D11Context {
    /// Wrap an immediate context owned by the host.  Adds a reference to the context and its
    /// device so the wrapper stays valid for as long as it is held.
    pub unsafe fn from_context_ptr(raw: *mut ID3D11DeviceContext) -> Option<Self> {
        let ctx = ComRef::from_raw_addref(raw)?;
        let mut dev: *mut ID3D11Device = ptr::null_mut();
        (*ctx.as_ptr()).GetDevice(&mut dev);
        let device = ComRef::from_raw(dev)?;
        Some(D3D11Context { ctx, device })
    }

    pub fn context_ptr(&self) -> *mut ID3D11DeviceContext {
        self.ctx.as_ptr()
    }

    fn ctx(&self) -> &ID3D11DeviceContext {
        unsafe { &*self.ctx.as_ptr() }
    }

    fn dev(&self) -> &ID3D11Device {
        unsafe { &*self.device.as_ptr() }
    }
}

/// Compile HLSL with `D3DCompile` from d3dcompiler_47.dll.  The dll is loaded on demand; the
/// host may not have linked it.
pub fn compile_hlsl(source: &str, entry: &str, target: &str) -> Result<Vec<u8>> {
    let dll_name = CString::new("d3dcompiler_47.dll")?;
    let hmod = unsafe { LoadLibraryA(dll_name.as_ptr()) };
    if hmod.is_null() {
        return Err(HookError::LoadLibFailed("d3dcompiler_47.dll".to_string()));
    }
    let func_name = CString::new("D3DCompile")?;
    let proc = unsafe { GetProcAddress(hmod, func_name.as_ptr()) };
    if proc.is_null() {
        return Err(HookError::GetProcAddressFailed("D3DCompile".to_string()));
    }
    let d3d_compile: D3DCompileFn = unsafe { std::mem::transmute(proc) };

    let entry = CString::new(entry)?;
    let target = CString::new(target)?;
    let mut blob: *mut ID3DBlob = ptr::null_mut();
    let mut error_blob: *mut ID3DBlob = ptr::null_mut();
    let hr = unsafe {
        d3d_compile(
            source.as_ptr() as *const c_void,
            source.len(),
            ptr::null(),
            ptr::null(),
            ptr::null_mut(),
            entry.as_ptr(),
            target.as_ptr(),
            0,
            0,
            &mut blob,
            &mut error_blob,
        )
    };
    let blob = unsafe { ComRef::from_raw(blob) };
    let error_blob = unsafe { ComRef::from_raw(error_blob) };

    let blob_bytes = |b: &ComRef<ID3DBlob>| unsafe {
        let p = (*b.as_ptr()).GetBufferPointer() as *const u8;
        let len = (*b.as_ptr()).GetBufferSize();
        std::slice::from_raw_parts(p, len).to_vec()
    };
    match blob {
        Some(ref b) if SUCCEEDED(hr) => Ok(blob_bytes(b)),
        _ => {
            let msg = match error_blob {
                Some(ref e) => String::from_utf8_lossy(&blob_bytes(e)).into_owned(),
                None => format!("HRESULT 0x{:08X}", hr as u32),
            };
            Err(HookError::ShaderCompileFailed(msg))
        }
    }
}

/// The first viewport, given how many are bound.
fn viewport_from(bound: UINT, vp: &D3D11_VIEWPORT) -> Option<Viewport> {
    if bound == 0 {
        return None;
    }
    Some(Viewport {
        top_left_x: vp.TopLeftX,
        top_left_y: vp.TopLeftY,
        width: vp.Width,
        height: vp.Height,
        min_depth: vp.MinDepth,
        max_depth: vp.MaxDepth,
    })
}

impl GraphicsContext for D3D11Context {
    type PixelShader = ComRef<ID3D11PixelShader>;
    type VertexShader = ComRef<ID3D11VertexShader>;
    type ComputeShader = ComRef<ID3D11ComputeShader>;
    type Buffer = ComRef<ID3D11Buffer>;
    type ShaderResourceView = ComRef<ID3D11ShaderResourceView>;
    type UnorderedAccessView = ComRef<ID3D11UnorderedAccessView>;
    type SamplerState = ComRef<ID3D11SamplerState>;
    type RenderTargetView = ComRef<ID3D11RenderTargetView>;
    type DepthStencilView = ComRef<ID3D11DepthStencilView>;
    type BlendState = ComRef<ID3D11BlendState>;
    type DepthStencilState = ComRef<ID3D11DepthStencilState>;
    type RasterizerState = ComRef<ID3D11RasterizerState>;
    type InputLayout = ComRef<ID3D11InputLayout>;
    type Texture = ComRef<ID3D11Texture2D>;

    fn ps_get_shader(&self) -> Option<Self::PixelShader> {
        let mut p = ptr::null_mut();
        unsafe {
            self.ctx().PSGetShader(&mut p, ptr::null_mut(), ptr::null_mut());
            ComRef::from_raw(p)
        }
    }
    fn ps_set_shader(&self, shader: Option<&Self::PixelShader>) {
        unsafe { self.ctx().PSSetShader(or_null(shader), ptr::null(), 0) }
    }
    fn vs_get_shader(&self) -> Option<Self::VertexShader> {
        let mut p = ptr::null_mut();
        unsafe {
            self.ctx().VSGetShader(&mut p, ptr::null_mut(), ptr::null_mut());
            ComRef::from_raw(p)
        }
    }
    fn vs_set_shader(&self, shader: Option<&Self::VertexShader>) {
        unsafe { self.ctx().VSSetShader(or_null(shader), ptr::null(), 0) }
    }

    fn ps_get_constant_buffers(&self, out: &mut [Option<Self::Buffer>]) {
        unsafe { adopt_slots(out, |n, p| self.ctx().PSGetConstantBuffers(0, n, p)) }
    }
    fn ps_set_constant_buffers(&self, start: u32, buffers: &[Option<Self::Buffer>]) {
        let (raw, n) = raw_slots(buffers);
        unsafe { self.ctx().PSSetConstantBuffers(start, n, raw.as_ptr()) }
    }
    fn vs_get_constant_buffers(&self, out: &mut [Option<Self::Buffer>]) {
        unsafe { adopt_slots(out, |n, p| self.ctx().VSGetConstantBuffers(0, n, p)) }
    }
    fn vs_set_constant_buffers(&self, start: u32, buffers: &[Option<Self::Buffer>]) {
        let (raw, n) = raw_slots(buffers);
        unsafe { self.ctx().VSSetConstantBuffers(start, n, raw.as_ptr()) }
    }
    fn ps_get_shader_resources(&self, out: &mut [Option<Self::ShaderResourceView>]) {
        unsafe { adopt_slots(out, |n, p| self.ctx().PSGetShaderResources(0, n, p)) }
    }
    fn ps_set_shader_resources(&self, start: u32, views: &[Option<Self::ShaderResourceView>]) {
        let (raw, n) = raw_slots(views);
        unsafe { self.ctx().PSSetShaderResources(start, n, raw.as_ptr()) }
    }
    fn ps_get_samplers(&self, out: &mut [Option<Self::SamplerState>]) {
        unsafe { adopt_slots(out, |n, p| self.ctx().PSGetSamplers(0, n, p)) }
    }
    fn ps_set_samplers(&self, start: u32, samplers: &[Option<Self::SamplerState>]) {
        let (raw, n) = raw_slots(samplers);
        unsafe { self.ctx().PSSetSamplers(start, n, raw.as_ptr()) }
    }

    fn om_get_render_targets(
        &self,
        out: &mut [Option<Self::RenderTargetView>],
    ) -> Option<Self::DepthStencilView> {
        let mut dsv = ptr::null_mut();
        unsafe {
            adopt_slots(out, |n, p| self.ctx().OMGetRenderTargets(n, p, &mut dsv));
            ComRef::from_raw(dsv)
        }
    }
    fn om_set_render_targets(
        &self,
        targets: &[Option<Self::RenderTargetView>],
        depth: Option<&Self::DepthStencilView>,
    ) {
        let (raw, n) = raw_slots(targets);
        unsafe { self.ctx().OMSetRenderTargets(n, raw.as_ptr(), or_null(depth)) }
    }
    fn om_get_blend_state(&self) -> BlendBinding<Self::BlendState> {
        let mut p = ptr::null_mut();
        let mut factor = [0.0f32; 4];
        let mut sample_mask: UINT = 0;
        unsafe {
            self.ctx().OMGetBlendState(&mut p, &mut factor, &mut sample_mask);
            BlendBinding {
                state: ComRef::from_raw(p),
                factor,
                sample_mask,
            }
        }
    }
    fn om_set_blend_state(&self, blend: &BlendBinding<Self::BlendState>) {
        unsafe {
            self.ctx()
                .OMSetBlendState(or_null(blend.state.as_ref()), &blend.factor, blend.sample_mask)
        }
    }
    fn om_get_depth_stencil_state(&self) -> DepthStencilBinding<Self::DepthStencilState> {
        let mut p = ptr::null_mut();
        let mut stencil_ref: UINT = 0;
        unsafe {
            self.ctx().OMGetDepthStencilState(&mut p, &mut stencil_ref);
            DepthStencilBinding {
                state: ComRef::from_raw(p),
                stencil_ref,
            }
        }
    }
    fn om_set_depth_stencil_state(&self, depth: &DepthStencilBinding<Self::DepthStencilState>) {
        unsafe {
            self.ctx()
                .OMSetDepthStencilState(or_null(depth.state.as_ref()), depth.stencil_ref)
        }
    }

    fn rs_get_state(&self) -> Option<Self::RasterizerState> {
        let mut p = ptr::null_mut();
        unsafe {
            self.ctx().RSGetState(&mut p);
            ComRef::from_raw(p)
        }
    }
    fn rs_set_state(&self, state: Option<&Self::RasterizerState>) {
        unsafe { self.ctx().RSSetState(or_null(state)) }
    }
    fn rs_get_viewport(&self) -> Option<Viewport> {
        // with a null array the count is an output; with a non-null one it is only an input
        // and an unbound slot comes back zeroed
        let mut bound: UINT = 0;
        unsafe { self.ctx().RSGetViewports(&mut bound, ptr::null_mut()) };
        if bound == 0 {
            return None;
        }
        let mut n: UINT = 1;
        let mut vp: D3D11_VIEWPORT = unsafe { std::mem::zeroed() };
        unsafe { self.ctx().RSGetViewports(&mut n, &mut vp) };
        viewport_from(bound, &vp)
    }
    fn rs_set_viewport(&self, viewport: &Viewport) {
        let vp = D3D11_VIEWPORT {
            TopLeftX: viewport.top_left_x,
            TopLeftY: viewport.top_left_y,
            Width: viewport.width,
            Height: viewport.height,
            MinDepth: viewport.min_depth,
            MaxDepth: viewport.max_depth,
        };
        unsafe { self.ctx().RSSetViewports(1, &vp) }
    }

    fn ia_get_input_layout(&self) -> Option<Self::InputLayout> {
        let mut p = ptr::null_mut();
        unsafe {
            self.ctx().IAGetInputLayout(&mut p);
            ComRef::from_raw(p)
        }
    }
    fn ia_set_input_layout(&self, layout: Option<&Self::InputLayout>) {
        unsafe { self.ctx().IASetInputLayout(or_null(layout)) }
    }
    fn ia_get_primitive_topology(&self) -> u32 {
        let mut t: D3D11_PRIMITIVE_TOPOLOGY = 0;
        unsafe { self.ctx().IAGetPrimitiveTopology(&mut t) };
        t
    }
    fn ia_set_primitive_topology(&self, topology: u32) {
        unsafe { self.ctx().IASetPrimitiveTopology(topology) }
    }
    fn ia_get_vertex_buffer(&self) -> Option<VertexBufferBinding<Self::Buffer>> {
        let mut p = ptr::null_mut();
        let mut stride: UINT = 0;
        let mut offset: UINT = 0;
        unsafe {
            self.ctx()
                .IAGetVertexBuffers(0, 1, &mut p, &mut stride, &mut offset);
            ComRef::from_raw(p).map(|buffer| VertexBufferBinding {
                buffer,
                stride,
                offset,
            })
        }
    }
    fn ia_set_vertex_buffer(&self, binding: &VertexBufferBinding<Self::Buffer>) {
        let p = binding.buffer.as_ptr();
        unsafe {
            self.ctx()
                .IASetVertexBuffers(0, 1, &p, &binding.stride, &binding.offset)
        }
    }

    fn srv_texture(&self, view: &Self::ShaderResourceView) -> Option<(Self::Texture, TextureInfo)> {
        let mut res: *mut ID3D11Resource = ptr::null_mut();
        unsafe { (*view.as_ptr()).GetResource(&mut res) };
        let res = unsafe { ComRef::from_raw(res)? };
        let tex: ComRef<ID3D11Texture2D> = res.query()?;
        let mut desc: D3D11_TEXTURE2D_DESC = unsafe { std::mem::zeroed() };
        unsafe { (*tex.as_ptr()).GetDesc(&mut desc) };
        let info = TextureInfo {
            width: desc.Width,
            height: desc.Height,
            format: desc.Format,
            mip_levels: desc.MipLevels,
            array_size: desc.ArraySize,
            sample_count: desc.SampleDesc.Count,
        };
        Some((tex, info))
    }

    fn create_texture(&self, info: &TextureInfo, bind_flags: u32) -> Result<Self::Texture> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: info.width,
            Height: info.height,
            MipLevels: info.mip_levels,
            ArraySize: info.array_size,
            Format: info.format as DXGI_FORMAT,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: info.sample_count.max(1),
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: bind_flags,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let mut tex = ptr::null_mut();
        let hr = unsafe { self.dev().CreateTexture2D(&desc, ptr::null(), &mut tex) };
        if !SUCCEEDED(hr) {
            error!(
                "CreateTexture2D failed: {:x} ({}x{} fmt {})",
                hr, info.width, info.height, info.format
            );
            return Err(HookError::ResourceCreateFailed(format!("texture: {:x}", hr)));
        }
        unsafe { ComRef::from_raw(tex) }
            .ok_or_else(|| HookError::ResourceCreateFailed("null texture".to_string()))
    }

    fn create_shader_resource_view(
        &self,
        texture: &Self::Texture,
        template: Option<&Self::ShaderResourceView>,
    ) -> Result<Self::ShaderResourceView> {
        let mut desc: D3D11_SHADER_RESOURCE_VIEW_DESC = unsafe { std::mem::zeroed() };
        let pdesc = match template {
            Some(t) => {
                unsafe { (*t.as_ptr()).GetDesc(&mut desc) };
                &desc as *const D3D11_SHADER_RESOURCE_VIEW_DESC
            }
            None => ptr::null(),
        };
        let mut view = ptr::null_mut();
        let hr = unsafe {
            self.dev().CreateShaderResourceView(
                texture.as_ptr() as *mut ID3D11Resource,
                pdesc,
                &mut view,
            )
        };
        if !SUCCEEDED(hr) {
            return Err(HookError::ResourceCreateFailed(format!("srv: {:x}", hr)));
        }
        unsafe { ComRef::from_raw(view) }
            .ok_or_else(|| HookError::ResourceCreateFailed("null srv".to_string()))
    }

    fn create_unordered_access_view(
        &self,
        texture: &Self::Texture,
    ) -> Result<Self::UnorderedAccessView> {
        let mut view = ptr::null_mut();
        let hr = unsafe {
            self.dev().CreateUnorderedAccessView(
                texture.as_ptr() as *mut ID3D11Resource,
                ptr::null(),
                &mut view,
            )
        };
        if !SUCCEEDED(hr) {
            return Err(HookError::ResourceCreateFailed(format!("uav: {:x}", hr)));
        }
        unsafe { ComRef::from_raw(view) }
            .ok_or_else(|| HookError::ResourceCreateFailed("null uav".to_string()))
    }

    fn create_render_target_view(&self, texture: &Self::Texture) -> Result<Self::RenderTargetView> {
        let mut view = ptr::null_mut();
        let hr = unsafe {
            self.dev().CreateRenderTargetView(
                texture.as_ptr() as *mut ID3D11Resource,
                ptr::null(),
                &mut view,
            )
        };
        if !SUCCEEDED(hr) {
            return Err(HookError::ResourceCreateFailed(format!("rtv: {:x}", hr)));
        }
        unsafe { ComRef::from_raw(view) }
            .ok_or_else(|| HookError::ResourceCreateFailed("null rtv".to_string()))
    }

    fn copy_resource(&self, dst: &Self::Texture, src: &Self::Texture) {
        unsafe {
            self.ctx().CopyResource(
                dst.as_ptr() as *mut ID3D11Resource,
                src.as_ptr() as *mut ID3D11Resource,
            )
        }
    }

    fn clear_unordered_access_view(&self, view: &Self::UnorderedAccessView, value: [f32; 4]) {
        unsafe { self.ctx().ClearUnorderedAccessViewFloat(view.as_ptr(), &value) }
    }

    fn create_compute_shader(&self, source: &str, entry: &str) -> Result<Self::ComputeShader> {
        let code = compile_hlsl(source, entry, "cs_5_0")?;
        let mut cs = ptr::null_mut();
        let hr = unsafe {
            self.dev().CreateComputeShader(
                code.as_ptr() as *const c_void,
                code.len(),
                ptr::null_mut(),
                &mut cs,
            )
        };
        if !SUCCEEDED(hr) {
            return Err(HookError::ResourceCreateFailed(format!("compute shader: {:x}", hr)));
        }
        unsafe { ComRef::from_raw(cs) }
            .ok_or_else(|| HookError::ResourceCreateFailed("null compute shader".to_string()))
    }

    fn cs_set_shader(&self, shader: Option<&Self::ComputeShader>) {
        unsafe { self.ctx().CSSetShader(or_null(shader), ptr::null(), 0) }
    }
    fn cs_set_shader_resources(&self, start: u32, views: &[Option<Self::ShaderResourceView>]) {
        let (raw, n) = raw_slots(views);
        unsafe { self.ctx().CSSetShaderResources(start, n, raw.as_ptr()) }
    }
    fn cs_set_unordered_access_views(
        &self,
        start: u32,
        views: &[Option<Self::UnorderedAccessView>],
    ) {
        let (raw, n) = raw_slots(views);
        unsafe {
            self.ctx()
                .CSSetUnorderedAccessViews(start, n, raw.as_ptr(), ptr::null())
        }
    }
    fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe { self.ctx().Dispatch(x, y, z) }
    }

    unsafe fn texture_from_raw(&self, raw: usize) -> Option<Self::Texture> {
        ComRef::from_raw_addref(raw as *mut ID3D11Texture2D)
    }
    unsafe fn uav_from_raw(&self, raw: usize) -> Option<Self::UnorderedAccessView> {
        ComRef::from_raw_addref(raw as *mut ID3D11UnorderedAccessView)
    }
    unsafe fn srv_from_raw(&self, raw: usize) -> Option<Self::ShaderResourceView> {
        ComRef::from_raw_addref(raw as *mut ID3D11ShaderResourceView)
    }
    unsafe fn compute_shader_from_raw(&self, raw: usize) -> Option<Self::ComputeShader> {
        ComRef::from_raw_addref(raw as *mut ID3D11ComputeShader)
    }
}
