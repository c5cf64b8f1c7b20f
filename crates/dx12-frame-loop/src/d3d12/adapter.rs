use tracing::debug;
use tracing::info;
use windows::core::Result;
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::D3D12CreateDevice;
use windows::Win32::Graphics::Direct3D12::ID3D12Device;
use windows::Win32::Graphics::Dxgi::*;

use crate::context::AdapterInfo;

/// Hardware adapter with the most dedicated video memory that can create a
/// feature level 11.0 device, or `None` when there is none.
pub fn get_hardware_adapter(factory: &IDXGIFactory4) -> Result<Option<(IDXGIAdapter1, AdapterInfo)>> {
    let mut best: Option<(IDXGIAdapter1, AdapterInfo)> = None;

    for i in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(i) } {
            Ok(a) => a,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => return Err(e),
        };

        let desc = unsafe { adapter.GetDesc1()? };
        let info = adapter_info(&desc);

        if is_software(&desc) {
            debug!(index = i, adapter = %info.description, "Skipping software adapter");
            continue;
        }

        let supports_d3d12 = unsafe {
            D3D12CreateDevice(
                &adapter,
                D3D_FEATURE_LEVEL_11_0,
                std::ptr::null_mut::<Option<ID3D12Device>>(),
            )
        }
        .is_ok();
        if !supports_d3d12 {
            debug!(index = i, adapter = %info.description, "Adapter lacks feature level 11.0");
            continue;
        }

        let larger = best
            .as_ref()
            .map_or(true, |(_, b)| info.dedicated_video_memory > b.dedicated_video_memory);
        if larger {
            best = Some((adapter, info));
        }
    }

    if let Some((_, info)) = &best {
        info!(
            adapter = %info.description,
            dedicated_video_memory = info.dedicated_video_memory,
            "Using hardware adapter"
        );
    }
    Ok(best)
}

pub fn adapter_info(desc: &DXGI_ADAPTER_DESC1) -> AdapterInfo {
    let len = desc
        .Description
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(desc.Description.len());
    AdapterInfo {
        description: String::from_utf16_lossy(&desc.Description[..len]),
        dedicated_video_memory: desc.DedicatedVideoMemory,
        software: is_software(desc),
    }
}

fn is_software(desc: &DXGI_ADAPTER_DESC1) -> bool {
    (DXGI_ADAPTER_FLAG(desc.Flags as i32) & DXGI_ADAPTER_FLAG_SOFTWARE) != DXGI_ADAPTER_FLAG_NONE
}
