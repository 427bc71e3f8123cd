use std::ffi::OsString;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to change page protection at {address:#x} ({len} bytes)")]
    ProtectFailed { address: usize, len: usize },

    #[error("memory access fault at {address:#x} ({len} bytes)")]
    MemoryFault { address: usize, len: usize },

    #[error("signature mismatch at {address:#x}: expected [{expected}], found [{actual}]")]
    SignatureMismatch {
        address: usize,
        expected: String,
        actual: String,
    },

    #[error("patch already installed at {0:#x}")]
    PatchAlreadyInstalled(usize),

    #[error("patch not installed at {0:#x}")]
    PatchNotInstalled(usize),

    #[error("patch at {0:#x} was disabled by an earlier signature mismatch")]
    PatchIncompatible(usize),

    #[error("patch length mismatch: expected {expected} bytes, got {actual}")]
    PatchLengthMismatch { expected: usize, actual: usize },

    #[error("vtable slot {0} is already hooked")]
    HookAlreadyInstalled(usize),

    #[error("module not loaded: {0}")]
    ModuleNotFound(String),

    #[error("unknown layout field: {0}")]
    UnknownField(String),

    #[error("load library failed: {0}")]
    LoadLibFailed(String),

    #[error("get proc address failed: {0}")]
    GetProcAddressFailed(String),

    #[error("resource creation failed: {0}")]
    ResourceCreateFailed(String),

    #[error("shader compile failed: {0}")]
    ShaderCompileFailed(String),

    #[error("no d3d11 context available")]
    D3D11NoContext,

    #[error("config read failed: {0}")]
    ConfReadFailed(String),

    #[error("serde error: {0}")]
    SerdeError(String),

    #[error("global lock error")]
    GlobalLockError,

    #[error("bad state: {0}")]
    BadStateError(String),

    #[error("nul in string: {0}")]
    NulError(#[from] std::ffi::NulError),

    #[error("failed to convert os string: {0:?}")]
    FailedToConvertString(OsString),

    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
}

impl std::convert::From<OsString> for HookError {
    fn from(error: OsString) -> Self {
        HookError::FailedToConvertString(error)
    }
}

pub type Result<T> = std::result::Result<T, HookError>;
