//! The native API surface the frame loop is written against.
//!
//! Every method mirrors one native call. Objects are reference-like handles
//! (COM pointers on Direct3D 12), so methods take `&self`.

use std::time::Duration;

use crate::error::NativeCode;
use crate::error::NativeFailure;
use crate::error::NativeResult;

/// Family of native object types making up one graphics API.
pub trait Backend: Sized + 'static {
    type Device: Device<Self>;
    type Queue: CommandQueue<Self> + Clone;
    type Fence: Fence<Self>;
    type Event: FenceEvent;
    type SwapChain: SwapChain<Self>;
    type Image;
    type ViewHeap: ViewHeap;
    type CommandAllocator: CommandAllocator;
    type CommandList: GraphicsCommandList<Self>;
    /// OS-level window or surface target.
    type Window: Copy;
}

pub trait Device<B: Backend> {
    fn create_command_queue(&self) -> NativeResult<B::Queue>;

    fn create_fence(&self, initial_value: u64) -> NativeResult<B::Fence>;

    /// Auto-reset, initially unsignaled.
    fn create_event(&self) -> NativeResult<B::Event>;

    fn create_swap_chain(
        &self,
        queue: &B::Queue,
        surface: &SurfaceDescriptor<B::Window>,
        desc: &SwapChainDesc,
    ) -> Result<B::SwapChain, NativeFailure>;

    fn create_view_heap(&self, capacity: u32) -> NativeResult<B::ViewHeap>;

    fn create_render_target_view(&self, image: &B::Image, view: ViewHandle);

    fn create_command_allocator(&self) -> NativeResult<B::CommandAllocator>;

    /// The list is returned in the recording state.
    fn create_command_list(&self, allocator: &B::CommandAllocator) -> NativeResult<B::CommandList>;
}

pub trait CommandQueue<B: Backend> {
    /// Enqueues a GPU-side write of `value` into `fence` after all prior work.
    fn signal(&self, fence: &B::Fence, value: u64) -> NativeResult<()>;

    fn execute(&self, list: &B::CommandList) -> NativeResult<()>;
}

pub trait Fence<B: Backend> {
    fn completed_value(&self) -> u64;

    fn set_event_on_completion(&self, value: u64, event: &B::Event) -> NativeResult<()>;
}

/// OS wait primitive. Closed when dropped.
pub trait FenceEvent {
    fn wait(&self, timeout: Duration) -> WaitStatus;
}

pub trait SwapChain<B: Backend> {
    fn buffer(&self, index: u32) -> NativeResult<B::Image>;

    fn present(&self, mode: PresentMode) -> NativeResult<()>;

    /// The image the backend will hand out next. Not necessarily round-robin.
    fn current_back_buffer_index(&self) -> u32;

    /// All images obtained through [`SwapChain::buffer`] must be dropped first.
    fn resize_buffers(&self, desc: &SwapChainDesc) -> NativeResult<()>;
}

pub trait ViewHeap {
    fn handle(&self, index: u32) -> ViewHandle;
}

pub trait CommandAllocator {
    /// Only valid once the GPU has finished every list recorded from it.
    fn reset(&self) -> NativeResult<()>;
}

pub trait GraphicsCommandList<B: Backend> {
    fn reset(&self, allocator: &B::CommandAllocator) -> NativeResult<()>;

    fn transition(&self, image: &B::Image, before: ResourceState, after: ResourceState);

    fn clear_render_target(&self, view: ViewHandle, color: ClearColor);

    fn close(&self) -> NativeResult<()>;
}

/// CPU address of a render target view inside a view heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Present,
    RenderTarget,
}

/// RGBA
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor(pub [f32; 4]);

impl Default for ClearColor {
    fn default() -> Self {
        Self([0.0, 0.2, 0.4, 1.0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescriptor<W> {
    pub window: W,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub allow_tearing: bool,
}

/// Parameters of a single present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentMode {
    pub sync_interval: u32,
    pub allow_tearing: bool,
}

impl PresentMode {
    /// Vsync presents on the next vertical blank. Without vsync, tearing is
    /// requested only when the runtime advertised support for it.
    pub fn resolve(vsync: bool, tearing_supported: bool) -> Self {
        if vsync {
            Self {
                sync_interval: 1,
                allow_tearing: false,
            }
        } else {
            Self {
                sync_interval: 0,
                allow_tearing: tearing_supported,
            }
        }
    }
}

/// Why a wait on a [`FenceEvent`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
    Abandoned,
    Failed(NativeCode),
}
