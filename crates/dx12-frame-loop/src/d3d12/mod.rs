//! Direct3D 12 implementation of [`Backend`].

pub mod adapter;
pub mod runtime;
pub mod window;

use std::mem::ManuallyDrop;
use std::time::Duration;

use tracing::warn;
use windows::core::Interface;
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::Foundation::GetLastError;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Foundation::HWND;
use windows::Win32::Foundation::WAIT_ABANDONED;
use windows::Win32::Foundation::WAIT_FAILED;
use windows::Win32::Foundation::WAIT_OBJECT_0;
use windows::Win32::Foundation::WAIT_TIMEOUT;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::CreateEventA;
use windows::Win32::System::Threading::WaitForSingleObject;

use crate::backend::Backend;
use crate::backend::ClearColor;
use crate::backend::CommandAllocator;
use crate::backend::CommandQueue;
use crate::backend::Device;
use crate::backend::Fence;
use crate::backend::FenceEvent;
use crate::backend::GraphicsCommandList;
use crate::backend::PresentMode;
use crate::backend::ResourceState;
use crate::backend::SurfaceDescriptor;
use crate::backend::SwapChain;
use crate::backend::SwapChainDesc;
use crate::backend::ViewHandle;
use crate::backend::ViewHeap;
use crate::backend::WaitStatus;
use crate::error::NativeCode;
use crate::error::NativeFailure;
use crate::error::NativeResult;
use crate::error::ResultCode;

const BACK_BUFFER_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;

/// Backend marker for Direct3D 12 on DXGI.
pub struct D3d12;

impl Backend for D3d12 {
    type Device = D3d12Device;
    type Queue = ID3D12CommandQueue;
    type Fence = ID3D12Fence;
    type Event = D3d12Event;
    type SwapChain = D3d12SwapChain;
    type Image = ID3D12Resource;
    type ViewHeap = D3d12ViewHeap;
    type CommandAllocator = ID3D12CommandAllocator;
    type CommandList = ID3D12GraphicsCommandList;
    type Window = HWND;
}

/// The device together with the factory that created its adapter.
pub struct D3d12Device {
    pub device: ID3D12Device,
    pub factory: IDXGIFactory4,
}

impl Device<D3d12> for D3d12Device {
    fn create_command_queue(&self) -> NativeResult<ID3D12CommandQueue> {
        let queue = unsafe {
            self.device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })?
        };
        Ok(queue)
    }

    fn create_fence(&self, initial_value: u64) -> NativeResult<ID3D12Fence> {
        Ok(unsafe { self.device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)? })
    }

    fn create_event(&self) -> NativeResult<D3d12Event> {
        let handle = unsafe { CreateEventA(None, false, false, None)? };
        if handle.is_invalid() {
            return Err(NativeCode::from(unsafe { GetLastError() }.to_hresult()));
        }
        Ok(D3d12Event(handle))
    }

    fn create_swap_chain(
        &self,
        queue: &ID3D12CommandQueue,
        surface: &SurfaceDescriptor<HWND>,
        desc: &SwapChainDesc,
    ) -> Result<D3d12SwapChain, NativeFailure> {
        let flags = swap_chain_flags(desc.allow_tearing);
        let swap_chain_desc = DXGI_SWAP_CHAIN_DESC1 {
            BufferCount: desc.buffer_count,
            Width: desc.width,
            Height: desc.height,
            Format: BACK_BUFFER_FORMAT,
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                ..Default::default()
            },
            Flags: flags.0 as u32,
            ..Default::default()
        };

        let swap_chain: IDXGISwapChain1 = unsafe {
            self.factory
                .CreateSwapChainForHwnd(queue, surface.window, &swap_chain_desc, None, None)
        }
        .map_err(|e| NativeFailure::new(ResultCode::SwapChainCreationFailed, e))?;

        let swap_chain: IDXGISwapChain3 = swap_chain
            .cast()
            .map_err(|e| NativeFailure::new(ResultCode::ComInterfaceCastFailed, e))?;

        // Alt+Enter fullscreen is not handled.
        unsafe {
            self.factory
                .MakeWindowAssociation(surface.window, DXGI_MWA_NO_ALT_ENTER)
        }
        .map_err(|e| NativeFailure::new(ResultCode::MakeWindowAssociationFailed, e))?;

        Ok(D3d12SwapChain { swap_chain })
    }

    fn create_view_heap(&self, capacity: u32) -> NativeResult<D3d12ViewHeap> {
        let heap: ID3D12DescriptorHeap = unsafe {
            self.device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                NumDescriptors: capacity,
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                ..Default::default()
            })?
        };
        let increment =
            unsafe { self.device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV) };
        let start = unsafe { heap.GetCPUDescriptorHandleForHeapStart() };
        Ok(D3d12ViewHeap {
            heap,
            start,
            increment,
        })
    }

    fn create_render_target_view(&self, image: &ID3D12Resource, view: ViewHandle) {
        unsafe {
            self.device.CreateRenderTargetView(
                image,
                None,
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: view.0 },
            )
        };
    }

    fn create_command_allocator(&self) -> NativeResult<ID3D12CommandAllocator> {
        Ok(unsafe {
            self.device
                .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)?
        })
    }

    fn create_command_list(
        &self,
        allocator: &ID3D12CommandAllocator,
    ) -> NativeResult<ID3D12GraphicsCommandList> {
        Ok(unsafe {
            self.device.CreateCommandList(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                allocator,
                None::<&ID3D12PipelineState>,
            )?
        })
    }
}

impl CommandQueue<D3d12> for ID3D12CommandQueue {
    fn signal(&self, fence: &ID3D12Fence, value: u64) -> NativeResult<()> {
        unsafe { self.Signal(fence, value)? };
        Ok(())
    }

    fn execute(&self, list: &ID3D12GraphicsCommandList) -> NativeResult<()> {
        let command_lists = [Some(list.cast::<ID3D12CommandList>()?)];
        unsafe { self.ExecuteCommandLists(&command_lists) };
        Ok(())
    }
}

impl Fence<D3d12> for ID3D12Fence {
    fn completed_value(&self) -> u64 {
        unsafe { self.GetCompletedValue() }
    }

    fn set_event_on_completion(&self, value: u64, event: &D3d12Event) -> NativeResult<()> {
        unsafe { self.SetEventOnCompletion(value, event.0)? };
        Ok(())
    }
}

/// Auto-reset Win32 event, closed on drop.
pub struct D3d12Event(HANDLE);

impl FenceEvent for D3d12Event {
    fn wait(&self, timeout: Duration) -> WaitStatus {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let result = unsafe { WaitForSingleObject(self.0, millis) };
        match result {
            WAIT_OBJECT_0 => WaitStatus::Signaled,
            WAIT_TIMEOUT => WaitStatus::TimedOut,
            WAIT_ABANDONED => WaitStatus::Abandoned,
            WAIT_FAILED => WaitStatus::Failed(unsafe { GetLastError() }.to_hresult().into()),
            other => {
                warn!(result = other.0, "Unexpected wait result");
                WaitStatus::Abandoned
            }
        }
    }
}

impl Drop for D3d12Event {
    fn drop(&mut self) {
        if let Err(error) = unsafe { CloseHandle(self.0) } {
            warn!(%error, "Failed to close fence event handle");
        }
    }
}

pub struct D3d12SwapChain {
    pub swap_chain: IDXGISwapChain3,
}

impl SwapChain<D3d12> for D3d12SwapChain {
    fn buffer(&self, index: u32) -> NativeResult<ID3D12Resource> {
        Ok(unsafe { self.swap_chain.GetBuffer(index)? })
    }

    fn present(&self, mode: PresentMode) -> NativeResult<()> {
        let flags = if mode.allow_tearing {
            DXGI_PRESENT_ALLOW_TEARING
        } else {
            DXGI_PRESENT::default()
        };
        unsafe { self.swap_chain.Present(mode.sync_interval, flags) }.ok()?;
        Ok(())
    }

    fn current_back_buffer_index(&self) -> u32 {
        unsafe { self.swap_chain.GetCurrentBackBufferIndex() }
    }

    fn resize_buffers(&self, desc: &SwapChainDesc) -> NativeResult<()> {
        unsafe {
            self.swap_chain.ResizeBuffers(
                desc.buffer_count,
                desc.width,
                desc.height,
                BACK_BUFFER_FORMAT,
                swap_chain_flags(desc.allow_tearing),
            )?
        };
        Ok(())
    }
}

pub struct D3d12ViewHeap {
    pub heap: ID3D12DescriptorHeap,
    start: D3D12_CPU_DESCRIPTOR_HANDLE,
    increment: u32,
}

impl ViewHeap for D3d12ViewHeap {
    fn handle(&self, index: u32) -> ViewHandle {
        ViewHandle(self.start.ptr + (index * self.increment) as usize)
    }
}

impl CommandAllocator for ID3D12CommandAllocator {
    fn reset(&self) -> NativeResult<()> {
        unsafe { self.Reset()? };
        Ok(())
    }
}

impl GraphicsCommandList<D3d12> for ID3D12GraphicsCommandList {
    fn reset(&self, allocator: &ID3D12CommandAllocator) -> NativeResult<()> {
        unsafe { self.Reset(allocator, None::<&ID3D12PipelineState>)? };
        Ok(())
    }

    fn transition(&self, image: &ID3D12Resource, before: ResourceState, after: ResourceState) {
        let barrier = D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                // Borrowed pointer without AddRef; never released through the barrier.
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: unsafe { std::mem::transmute_copy(image) },
                    StateBefore: native_state(before),
                    StateAfter: native_state(after),
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                }),
            },
        };
        unsafe { self.ResourceBarrier(&[barrier]) };
    }

    fn clear_render_target(&self, view: ViewHandle, color: ClearColor) {
        unsafe {
            self.ClearRenderTargetView(D3D12_CPU_DESCRIPTOR_HANDLE { ptr: view.0 }, &color.0, None)
        };
    }

    fn close(&self) -> NativeResult<()> {
        unsafe { self.Close()? };
        Ok(())
    }
}

fn native_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
    }
}

fn swap_chain_flags(allow_tearing: bool) -> DXGI_SWAP_CHAIN_FLAG {
    if allow_tearing {
        DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING
    } else {
        DXGI_SWAP_CHAIN_FLAG(0)
    }
}
