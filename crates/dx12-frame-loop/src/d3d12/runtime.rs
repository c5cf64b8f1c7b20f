//! One-time device setup and debug-layer helpers.

use tracing::error;
use tracing::info;
use tracing::warn;
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;

use super::adapter::adapter_info;
use super::adapter::get_hardware_adapter;
use super::D3d12;
use super::D3d12Device;
use crate::context::AdapterInfo;
use crate::context::GraphicsContext;
use crate::error::NativeCode;
use crate::error::NativeFailure;
use crate::error::ResultCode;
use crate::error::SetupError;
use crate::error::SetupStage;

/// Messages filtered out of the D3D12 info queue.
const DENIED_MESSAGES: [D3D12_MESSAGE_ID; 3] = [
    D3D12_MESSAGE_ID_CLEARRENDERTARGETVIEW_MISMATCHINGCLEARVALUE,
    // raised by graphics debugger frame capture
    D3D12_MESSAGE_ID_MAP_INVALID_NULLRANGE,
    D3D12_MESSAGE_ID_UNMAP_INVALID_NULLRANGE,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    pub use_warp_device: bool,
}

/// Creates the device and gathers the capabilities every component shares.
///
/// The debug layer and info queue are only touched in debug builds, and
/// failures there are logged without aborting.
pub fn setup(options: &RuntimeOptions) -> Result<GraphicsContext<D3d12>, SetupError> {
    let debug_flags = enable_debug_layer();

    let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(debug_flags) }.map_err(|e| {
        error!(error = %e, "Failed to create DXGI factory");
        SetupError::new(SetupStage::GetAdapter, ResultCode::CreateDxgiFactoryFailed, e)
    })?;

    let (adapter, adapter_info) = get_adapter(&factory, options.use_warp_device)?;
    let device = create_device(&adapter)?;

    if cfg!(debug_assertions) {
        if let Err(failure) = configure_info_queue(&device) {
            warn!(
                stage = ?SetupStage::ConfigureInfoQueue,
                status = ?failure.status,
                code = %failure.code,
                "Info queue left unconfigured"
            );
        }
    }

    let tearing_supported = check_tearing_support(&factory);
    info!(tearing_supported, "D3D12 runtime ready");

    Ok(GraphicsContext::new(
        D3d12Device { device, factory },
        adapter_info,
        tearing_supported,
    ))
}

fn enable_debug_layer() -> DXGI_CREATE_FACTORY_FLAGS {
    let mut debug_flags = DXGI_CREATE_FACTORY_FLAGS(0);
    if cfg!(debug_assertions) {
        unsafe {
            let mut debug: Option<ID3D12Debug> = None;
            if let Some(debug) = D3D12GetDebugInterface(&mut debug).ok().and(debug) {
                debug.EnableDebugLayer();
                debug_flags |= DXGI_CREATE_FACTORY_DEBUG;
                info!("D3D12 Debug Layer Enabled");
            } else {
                warn!(
                    stage = ?SetupStage::EnableDebugLayer,
                    status = ?ResultCode::QueryDebugInterfaceFailed,
                    "D3D12 Debug Layer unavailable"
                );
            }
        }
    }
    debug_flags
}

fn get_adapter(
    factory: &IDXGIFactory4,
    use_warp_device: bool,
) -> Result<(IDXGIAdapter1, AdapterInfo), SetupError> {
    if use_warp_device {
        let adapter: IDXGIAdapter1 = unsafe { factory.EnumWarpAdapter() }.map_err(|e| {
            error!(error = %e, "Failed to enumerate WARP adapter");
            SetupError::new(SetupStage::GetAdapter, ResultCode::EnumWarpAdapterFailed, e)
        })?;
        let info = unsafe { adapter.GetDesc1() }
            .map(|desc| adapter_info(&desc))
            .unwrap_or_else(|_| AdapterInfo {
                description: "WARP".to_owned(),
                software: true,
                ..AdapterInfo::default()
            });
        info!(adapter = %info.description, "Using WARP adapter");
        return Ok((adapter, info));
    }

    match get_hardware_adapter(factory) {
        Ok(Some(found)) => Ok(found),
        Ok(None) => {
            error!("No D3D12 capable hardware adapter found");
            Err(SetupError::new(
                SetupStage::GetAdapter,
                ResultCode::NoHardwareAdapterFound,
                DXGI_ERROR_NOT_FOUND,
            ))
        }
        Err(e) => {
            error!(error = %e, "Failed to enumerate adapters");
            Err(SetupError::new(
                SetupStage::GetAdapter,
                ResultCode::NoHardwareAdapterFound,
                e,
            ))
        }
    }
}

fn create_device(adapter: &IDXGIAdapter1) -> Result<ID3D12Device, SetupError> {
    let mut device: Option<ID3D12Device> = None;
    unsafe { D3D12CreateDevice(adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }.map_err(|e| {
        error!(error = %e, "Failed to create D3D12 device");
        SetupError::new(SetupStage::CreateDevice, ResultCode::DeviceCreationFailed, e)
    })?;
    device.ok_or_else(|| {
        SetupError::new(
            SetupStage::CreateDevice,
            ResultCode::DeviceCreationFailed,
            NativeCode::FAIL,
        )
    })
}

fn configure_info_queue(device: &ID3D12Device) -> Result<(), NativeFailure> {
    let info_queue: ID3D12InfoQueue = device
        .cast()
        .map_err(|e| NativeFailure::new(ResultCode::ComInterfaceCastFailed, e))?;

    unsafe {
        info_queue
            .SetBreakOnSeverity(D3D12_MESSAGE_SEVERITY_CORRUPTION, true)
            .and_then(|()| info_queue.SetBreakOnSeverity(D3D12_MESSAGE_SEVERITY_ERROR, true))
    }
    .map_err(|e| NativeFailure::new(ResultCode::PushStorageFilterFailed, e))?;

    let mut severities = [D3D12_MESSAGE_SEVERITY_INFO];
    let mut deny_ids = DENIED_MESSAGES;
    let filter = D3D12_INFO_QUEUE_FILTER {
        DenyList: D3D12_INFO_QUEUE_FILTER_DESC {
            NumSeverities: severities.len() as u32,
            pSeverityList: severities.as_mut_ptr(),
            NumIDs: deny_ids.len() as u32,
            pIDList: deny_ids.as_mut_ptr(),
            ..Default::default()
        },
        ..Default::default()
    };
    unsafe { info_queue.PushStorageFilter(&filter) }
        .map_err(|e| NativeFailure::new(ResultCode::PushStorageFilterFailed, e))
}

/// Whether presents may pass `DXGI_PRESENT_ALLOW_TEARING`. Any failure of
/// the query counts as unsupported.
fn check_tearing_support(factory: &IDXGIFactory4) -> bool {
    let factory5: IDXGIFactory5 = match factory.cast() {
        Ok(factory5) => factory5,
        Err(e) => {
            warn!(
                stage = ?SetupStage::CheckTearingSupport,
                status = ?ResultCode::ComInterfaceCastFailed,
                error = %e,
                "IDXGIFactory5 unavailable, tearing disabled"
            );
            return false;
        }
    };

    let mut allow_tearing: i32 = 0;
    let result = unsafe {
        factory5.CheckFeatureSupport(
            DXGI_FEATURE_PRESENT_ALLOW_TEARING,
            &mut allow_tearing as *mut i32 as *mut _,
            std::mem::size_of::<i32>() as u32,
        )
    };
    match result {
        Ok(()) => allow_tearing != 0,
        Err(e) => {
            warn!(
                stage = ?SetupStage::CheckTearingSupport,
                status = ?ResultCode::CheckFeatureSupportFailed,
                error = %e,
                "Tearing support query failed"
            );
            false
        }
    }
}

/// Dumps live DXGI/D3D12 objects to the debugger output. Debug builds only.
pub fn report_live_objects() {
    if !cfg!(debug_assertions) {
        return;
    }
    match unsafe { DXGIGetDebugInterface1::<IDXGIDebug1>(0) } {
        Ok(debug) => {
            let flags = DXGI_DEBUG_RLO_DETAIL | DXGI_DEBUG_RLO_IGNORE_INTERNAL;
            if let Err(e) = unsafe { debug.ReportLiveObjects(DXGI_DEBUG_ALL, flags) } {
                warn!(error = %e, "Failed to report live objects");
            }
        }
        Err(e) => warn!(error = %e, "DXGI debug interface unavailable"),
    }
}

/// Logs every message stored in the DXGI info queue.
pub fn log_dxgi_debug_messages() {
    let Ok(queue) = (unsafe { DXGIGetDebugInterface1::<IDXGIInfoQueue>(0) }) else {
        return;
    };

    let num_messages = unsafe { queue.GetNumStoredMessages(DXGI_DEBUG_ALL) };
    for i in 0..num_messages {
        let mut message_size: usize = 0;
        if unsafe { queue.GetMessage(DXGI_DEBUG_ALL, i, None, &mut message_size) }.is_err() {
            warn!(index = i, "Failed to get DXGI message size");
            continue;
        }

        // u64 backing keeps the message header aligned
        let mut buffer = vec![0u64; message_size.div_ceil(8)];
        let message = buffer.as_mut_ptr() as *mut DXGI_INFO_QUEUE_MESSAGE;
        if unsafe { queue.GetMessage(DXGI_DEBUG_ALL, i, Some(message), &mut message_size) }.is_err()
        {
            continue;
        }

        let (severity, description) = unsafe {
            let description = std::slice::from_raw_parts(
                (*message).pDescription as *const u8,
                (*message).DescriptionByteLength,
            );
            (
                (*message).Severity,
                String::from_utf8_lossy(description)
                    .trim_end_matches('\0')
                    .trim()
                    .to_owned(),
            )
        };
        match severity {
            DXGI_INFO_QUEUE_MESSAGE_SEVERITY_CORRUPTION | DXGI_INFO_QUEUE_MESSAGE_SEVERITY_ERROR => {
                error!("{description}")
            }
            DXGI_INFO_QUEUE_MESSAGE_SEVERITY_WARNING => warn!("{description}"),
            _ => info!("{description}"),
        }
    }
    unsafe { queue.ClearStoredMessages(DXGI_DEBUG_ALL) };
}
