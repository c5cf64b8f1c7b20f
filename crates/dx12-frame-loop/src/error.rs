//! Error types shared by every component.
//!
//! Setup routines return a [`SetupError`] naming the stage that failed, a
//! [`ResultCode`] and the native error code. Per-frame failures are
//! [`FrameError`]s and synchronization failures are [`SyncError`]s; both are
//! fatal to the session.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Native error code (an `HRESULT` on Direct3D 12).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeCode(pub i32);

impl NativeCode {
    /// `S_OK`
    pub const OK: NativeCode = NativeCode(0);
    /// `E_FAIL`
    pub const FAIL: NativeCode = NativeCode(0x8000_4005_u32 as i32);
    /// `E_INVALIDARG`
    pub const INVALID_ARG: NativeCode = NativeCode(0x8007_0057_u32 as i32);
}

impl fmt::Display for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.0 as u32)
    }
}

impl fmt::Debug for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeCode({self})")
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for NativeCode {
    fn from(error: windows::core::Error) -> Self {
        Self(error.code().0)
    }
}

#[cfg(windows)]
impl From<windows::core::HRESULT> for NativeCode {
    fn from(hr: windows::core::HRESULT) -> Self {
        Self(hr.0)
    }
}

pub type NativeResult<T> = Result<T, NativeCode>;

/// What went wrong, independent of where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    // General
    ComInterfaceCastFailed,
    CreateDxgiFactoryFailed,
    MakeWindowAssociationFailed,
    CheckFeatureSupportFailed,

    // Runtime
    QueryDebugInterfaceFailed,
    EnumWarpAdapterFailed,
    NoHardwareAdapterFound,
    DeviceCreationFailed,
    PushStorageFilterFailed,

    // Renderer
    InvalidConfiguration,
    CommandQueueCreationFailed,
    CommandAllocatorCreationFailed,
    CommandListCreationFailed,
    CommandListCloseFailed,

    // Fence
    FenceCreationFailed,
    EventHandleCreationFailed,

    // Swap chain
    SwapChainCreationFailed,
    ViewHeapCreationFailed,
    ImageAcquisitionFailed,
    ResizeBuffersFailed,
}

/// Where a setup routine failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStage {
    EnableDebugLayer,
    GetAdapter,
    CreateDevice,
    ConfigureInfoQueue,
    CheckTearingSupport,

    ValidateConfig,
    CreateCommandQueue,
    CreateCommandAllocator { index: u32 },
    CreateCommandList,
    CloseCommandList,

    CreateFence,
    CreateEventHandle,

    CreateSwapChain,
    CreateRtvDescriptorHeap,
    UpdateRenderTargetViews { index: u32 },
    ResizeBuffers,
}

/// A status code paired with the native code that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFailure {
    pub status: ResultCode,
    pub code: NativeCode,
}

impl NativeFailure {
    pub fn new(status: ResultCode, code: impl Into<NativeCode>) -> Self {
        Self {
            status,
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("setup failed at {stage:?}: {status:?} (native code {code})")]
pub struct SetupError {
    pub stage: SetupStage,
    pub status: ResultCode,
    pub code: NativeCode,
}

impl SetupError {
    pub fn new(stage: SetupStage, status: ResultCode, code: impl Into<NativeCode>) -> Self {
        Self {
            stage,
            status,
            code: code.into(),
        }
    }

    pub fn from_failure(stage: SetupStage, failure: NativeFailure) -> Self {
        Self::new(stage, failure.status, failure.code)
    }
}

/// Failures of the CPU/GPU synchronization path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("fence used after release")]
    Released,

    #[error("failed to enqueue fence signal {value} (native code {code})")]
    SignalFailed { value: u64, code: NativeCode },

    #[error("failed to arm fence event for value {value} (native code {code})")]
    ArmFailed { value: u64, code: NativeCode },

    #[error("failed to wait for fence event (native code {0})")]
    WaitFailed(NativeCode),

    #[error("timed out waiting for fence value {value} after {attempts} attempts of {timeout:?}")]
    WaitTimedOut {
        value: u64,
        attempts: u32,
        timeout: Duration,
    },
}

/// Failures while producing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("renderer used after release")]
    Released,

    #[error("failed to reset command allocator for slot {slot} (native code {code})")]
    ResetAllocator { slot: u32, code: NativeCode },

    #[error("failed to reset command list (native code {0})")]
    ResetCommandList(NativeCode),

    #[error("failed to close command list (native code {0})")]
    CloseCommandList(NativeCode),

    #[error("failed to submit command list (native code {0})")]
    Submit(NativeCode),

    #[error("failed to present (native code {0})")]
    Present(NativeCode),

    #[error("failed to resize the swap chain: {0}")]
    Resize(SetupError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing value after {0}")]
    MissingValue(String),

    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: String, value: String },

    #[error("buffer count {0} is outside 2..=16")]
    BufferCount(u32),

    #[error("surface extent {width}x{height} must be non-zero")]
    Extent { width: u32, height: u32 },
}
