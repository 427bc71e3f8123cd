use winapi::ctypes::c_void;
use winapi::shared::basetsd::SIZE_T;
use winapi::shared::dxgi::IDXGISwapChain;
use winapi::shared::minwindef::{INT, UINT};
use winapi::um::d3d11::ID3D11DeviceContext;
use winapi::um::d3dcommon::{ID3DBlob, ID3DInclude, D3D_SHADER_MACRO};
use winapi::um::winnt::{HRESULT, LPCSTR};

/// IDXGISwapChain vtable: IUnknown(3) + IDXGIObject(4) + IDXGIDeviceSubObject(1), then Present.
pub const PRESENT_SLOT: usize = 8;
/// ID3D11DeviceContext vtable: IUnknown(3) + ID3D11DeviceChild(4), then VSSetConstantBuffers,
/// PSSetShaderResources, PSSetShader, PSSetSamplers, VSSetShader, DrawIndexed.
pub const DRAW_INDEXED_SLOT: usize = 12;

pub type PresentFn = unsafe extern "system" fn(
    THIS: *mut IDXGISwapChain,
    SyncInterval: UINT,
    Flags: UINT,
) -> HRESULT;

pub type DrawIndexedFn = unsafe extern "system" fn(
    THIS: *mut ID3D11DeviceContext,
    IndexCount: UINT,
    StartIndexLocation: UINT,
    BaseVertexLocation: INT,
) -> ();

pub type D3DCompileFn = unsafe extern "system" fn(
    pSrcData: *const c_void,
    SrcDataSize: SIZE_T,
    pSourceName: LPCSTR,
    pDefines: *const D3D_SHADER_MACRO,
    pInclude: *mut ID3DInclude,
    pEntrypoint: LPCSTR,
    pTarget: LPCSTR,
    Flags1: UINT,
    Flags2: UINT,
    ppCode: *mut *mut ID3DBlob,
    ppErrorMsgs: *mut *mut ID3DBlob,
) -> HRESULT;
