//! A simulated GPU for running the frame loop without a display.
//!
//! Every object created from one [`HeadlessGpu`] shares its timeline, so
//! queue signals, fence values, event waits and presents interact the way the
//! native objects do. The simulation is deterministic: the GPU only makes
//! progress when its [`GpuBehaviour`] says so, and waits never sleep.

use std::cell::RefCell;
use std::cell::RefMut;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

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
use crate::context::AdapterInfo;
use crate::context::GraphicsContext;
use crate::error::NativeCode;
use crate::error::NativeFailure;
use crate::error::NativeResult;
use crate::error::ResultCode;

/// `DXGI_ERROR_INVALID_CALL`
const INVALID_CALL: NativeCode = NativeCode(0x887A_0001_u32 as i32);

const VIEW_HEAP_STRIDE: usize = 0x1000;
const VIEW_INCREMENT: usize = 32;

/// How the simulated GPU works through queued signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBehaviour {
    /// Signals complete as soon as they are enqueued.
    Immediate,
    /// Queued signals complete only while the CPU waits on an armed event.
    OnWait,
    /// Nothing ever completes.
    Stalled,
}

/// A native call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateCommandQueue,
    CreateFence,
    CreateEvent,
    CreateSwapChain,
    CreateViewHeap,
    AcquireImage(u32),
    CreateCommandAllocator,
    CreateCommandList,
    ResetAllocator,
    ResetCommandList,
    CloseCommandList,
    Execute,
    Present,
    Signal,
    ArmEvent,
    ResizeBuffers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub submissions: u64,
    pub presents: u64,
    pub signals: u64,
    pub event_arms: u64,
    pub event_waits: u64,
    pub events_closed: u64,
    pub allocator_resets: u64,
    /// Allocator resets issued while a list recorded from it was still in flight.
    pub allocator_hazards: u64,
    pub views_created: u64,
    pub resizes: u64,
    pub last_present: Option<PresentMode>,
}

/// One command as recorded into a headless command list.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Transition {
        image: u32,
        before: ResourceState,
        after: ResourceState,
    },
    Clear {
        view: ViewHandle,
        color: ClearColor,
    },
}

#[derive(Default)]
struct Timeline {
    completed: u64,
    queued: VecDeque<u64>,
}

#[derive(Default)]
enum EventState {
    #[default]
    Idle,
    Armed {
        fence: u64,
        value: u64,
    },
    Set,
}

struct InFlight {
    allocator: u64,
    retire: Option<(u64, u64)>,
}

struct GpuState {
    behaviour: GpuBehaviour,
    tearing_supported: bool,
    first_back_buffer: u32,
    next_id: u64,
    scripted_waits: VecDeque<WaitStatus>,
    failures: Vec<(FailPoint, NativeCode)>,
    timelines: HashMap<u64, Timeline>,
    events: HashMap<u64, EventState>,
    in_flight: Vec<InFlight>,
    live_images: HashMap<u64, u32>,
    submissions: Vec<Vec<RecordedCommand>>,
    release_log: Vec<&'static str>,
    stats: GpuStats,
}

impl GpuState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_failure(&mut self, point: FailPoint) -> NativeResult<()> {
        match self.failures.iter().position(|(p, _)| *p == point) {
            Some(index) => Err(self.failures.remove(index).1),
            None => Ok(()),
        }
    }

    /// Completes queued signals of `fence` up to and including `target`.
    fn advance(&mut self, fence: u64, target: u64) {
        let timeline = self.timelines.entry(fence).or_default();
        while let Some(&next) = timeline.queued.front() {
            if next > target {
                break;
            }
            timeline.completed = timeline.completed.max(next);
            timeline.queued.pop_front();
        }
        let completed = timeline.completed;
        self.in_flight.retain(|work| match work.retire {
            Some((f, value)) => f != fence || value > completed,
            None => true,
        });
    }

    fn completed(&self, fence: u64) -> u64 {
        self.timelines.get(&fence).map_or(0, |t| t.completed)
    }
}

/// Handle to a simulated GPU. Cloning shares the same timeline.
#[derive(Clone)]
pub struct HeadlessGpu {
    state: Rc<RefCell<GpuState>>,
}

impl HeadlessGpu {
    pub fn new(behaviour: GpuBehaviour) -> Self {
        Self {
            state: Rc::new(RefCell::new(GpuState {
                behaviour,
                tearing_supported: false,
                first_back_buffer: 0,
                next_id: 0,
                scripted_waits: VecDeque::new(),
                failures: Vec::new(),
                timelines: HashMap::new(),
                events: HashMap::new(),
                in_flight: Vec::new(),
                live_images: HashMap::new(),
                submissions: Vec::new(),
                release_log: Vec::new(),
                stats: GpuStats::default(),
            })),
        }
    }

    pub fn with_tearing_support(self, supported: bool) -> Self {
        self.state().tearing_supported = supported;
        self
    }

    /// Index reported by new swap chains before their first present.
    pub fn with_first_back_buffer(self, index: u32) -> Self {
        self.state().first_back_buffer = index;
        self
    }

    pub fn context(&self) -> GraphicsContext<Headless> {
        let tearing_supported = self.state().tearing_supported;
        GraphicsContext::new(
            HeadlessDevice { gpu: self.clone() },
            AdapterInfo {
                description: "Headless GPU".to_owned(),
                dedicated_video_memory: 0,
                software: true,
            },
            tearing_supported,
        )
    }

    pub fn set_behaviour(&self, behaviour: GpuBehaviour) {
        self.state().behaviour = behaviour;
    }

    /// The next event wait returns `status` without the GPU making progress.
    pub fn script_wait(&self, status: WaitStatus) {
        self.state().scripted_waits.push_back(status);
    }

    /// The next call at `point` fails with `code`.
    pub fn fail_next(&self, point: FailPoint, code: NativeCode) {
        self.state().failures.push((point, code));
    }

    /// Lets the GPU catch up with everything queued so far.
    pub fn complete_all(&self) {
        let mut state = self.state();
        let fences: Vec<u64> = state.timelines.keys().copied().collect();
        for fence in fences {
            state.advance(fence, u64::MAX);
        }
    }

    pub fn stats(&self) -> GpuStats {
        self.state().stats.clone()
    }

    /// Commands of every executed list, in submission order.
    pub fn submissions(&self) -> Vec<Vec<RecordedCommand>> {
        self.state().submissions.clone()
    }

    /// Native objects in the order they were destroyed.
    pub fn release_log(&self) -> Vec<&'static str> {
        self.state().release_log.clone()
    }

    pub fn released(&self, kind: &str) -> usize {
        self.state()
            .release_log
            .iter()
            .filter(|entry| **entry == kind)
            .count()
    }

    fn state(&self) -> RefMut<'_, GpuState> {
        self.state.borrow_mut()
    }

    fn log_release(&self, kind: &'static str) {
        self.state().release_log.push(kind);
    }
}

/// Backend marker for the simulated GPU.
pub struct Headless;

impl Backend for Headless {
    type Device = HeadlessDevice;
    type Queue = HeadlessQueue;
    type Fence = HeadlessFence;
    type Event = HeadlessEvent;
    type SwapChain = HeadlessSwapChain;
    type Image = HeadlessImage;
    type ViewHeap = HeadlessViewHeap;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;
    type Window = HeadlessWindow;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessWindow;

pub struct HeadlessDevice {
    gpu: HeadlessGpu,
}

impl HeadlessDevice {
    pub fn gpu(&self) -> &HeadlessGpu {
        &self.gpu
    }
}

impl Device<Headless> for HeadlessDevice {
    fn create_command_queue(&self) -> NativeResult<HeadlessQueue> {
        let id = {
            let mut state = self.gpu.state();
            state.take_failure(FailPoint::CreateCommandQueue)?;
            state.next_id()
        };
        Ok(HeadlessQueue {
            inner: Rc::new(QueueInner {
                gpu: self.gpu.clone(),
                _id: id,
            }),
        })
    }

    fn create_fence(&self, initial_value: u64) -> NativeResult<HeadlessFence> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::CreateFence)?;
        let id = state.next_id();
        state.timelines.insert(
            id,
            Timeline {
                completed: initial_value,
                queued: VecDeque::new(),
            },
        );
        Ok(HeadlessFence {
            gpu: self.gpu.clone(),
            id,
        })
    }

    fn create_event(&self) -> NativeResult<HeadlessEvent> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::CreateEvent)?;
        let id = state.next_id();
        state.events.insert(id, EventState::Idle);
        Ok(HeadlessEvent {
            gpu: self.gpu.clone(),
            id,
        })
    }

    fn create_swap_chain(
        &self,
        _queue: &HeadlessQueue,
        surface: &SurfaceDescriptor<HeadlessWindow>,
        desc: &SwapChainDesc,
    ) -> Result<HeadlessSwapChain, NativeFailure> {
        let mut state = self.gpu.state();
        state
            .take_failure(FailPoint::CreateSwapChain)
            .map_err(|code| NativeFailure::new(ResultCode::SwapChainCreationFailed, code))?;
        if desc.buffer_count == 0
            || surface.width == 0
            || surface.height == 0
            || (desc.allow_tearing && !state.tearing_supported)
        {
            return Err(NativeFailure::new(
                ResultCode::SwapChainCreationFailed,
                INVALID_CALL,
            ));
        }
        let id = state.next_id();
        let current = state.first_back_buffer % desc.buffer_count;
        Ok(HeadlessSwapChain {
            gpu: self.gpu.clone(),
            id,
            inner: RefCell::new(SwapChainState {
                desc: *desc,
                current,
            }),
        })
    }

    fn create_view_heap(&self, capacity: u32) -> NativeResult<HeadlessViewHeap> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::CreateViewHeap)?;
        let id = state.next_id();
        Ok(HeadlessViewHeap {
            gpu: self.gpu.clone(),
            base: id as usize * VIEW_HEAP_STRIDE,
            capacity,
        })
    }

    fn create_render_target_view(&self, _image: &HeadlessImage, _view: ViewHandle) {
        self.gpu.state().stats.views_created += 1;
    }

    fn create_command_allocator(&self) -> NativeResult<HeadlessCommandAllocator> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::CreateCommandAllocator)?;
        let id = state.next_id();
        Ok(HeadlessCommandAllocator {
            gpu: self.gpu.clone(),
            id,
        })
    }

    fn create_command_list(
        &self,
        allocator: &HeadlessCommandAllocator,
    ) -> NativeResult<HeadlessCommandList> {
        self.gpu.state().take_failure(FailPoint::CreateCommandList)?;
        Ok(HeadlessCommandList {
            gpu: self.gpu.clone(),
            inner: RefCell::new(ListState {
                allocator: allocator.id,
                recording: true,
                commands: Vec::new(),
            }),
        })
    }
}

struct QueueInner {
    gpu: HeadlessGpu,
    _id: u64,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.gpu.log_release("queue");
    }
}

#[derive(Clone)]
pub struct HeadlessQueue {
    inner: Rc<QueueInner>,
}

impl CommandQueue<Headless> for HeadlessQueue {
    fn signal(&self, fence: &HeadlessFence, value: u64) -> NativeResult<()> {
        let mut state = self.inner.gpu.state();
        state.take_failure(FailPoint::Signal)?;
        state.stats.signals += 1;
        for work in state.in_flight.iter_mut().filter(|w| w.retire.is_none()) {
            work.retire = Some((fence.id, value));
        }
        state
            .timelines
            .entry(fence.id)
            .or_default()
            .queued
            .push_back(value);
        if state.behaviour == GpuBehaviour::Immediate {
            state.advance(fence.id, value);
        }
        Ok(())
    }

    fn execute(&self, list: &HeadlessCommandList) -> NativeResult<()> {
        let list = list.inner.borrow();
        let mut state = self.inner.gpu.state();
        state.take_failure(FailPoint::Execute)?;
        if list.recording {
            return Err(INVALID_CALL);
        }
        state.stats.submissions += 1;
        state.submissions.push(list.commands.clone());
        state.in_flight.push(InFlight {
            allocator: list.allocator,
            retire: None,
        });
        Ok(())
    }
}

pub struct HeadlessFence {
    gpu: HeadlessGpu,
    id: u64,
}

impl Fence<Headless> for HeadlessFence {
    fn completed_value(&self) -> u64 {
        self.gpu.state().completed(self.id)
    }

    fn set_event_on_completion(&self, value: u64, event: &HeadlessEvent) -> NativeResult<()> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::ArmEvent)?;
        state.stats.event_arms += 1;
        let next = if state.completed(self.id) >= value {
            EventState::Set
        } else {
            EventState::Armed {
                fence: self.id,
                value,
            }
        };
        state.events.insert(event.id, next);
        Ok(())
    }
}

impl Drop for HeadlessFence {
    fn drop(&mut self) {
        self.gpu.log_release("fence");
    }
}

pub struct HeadlessEvent {
    gpu: HeadlessGpu,
    id: u64,
}

impl FenceEvent for HeadlessEvent {
    fn wait(&self, _timeout: Duration) -> WaitStatus {
        let mut state = self.gpu.state();
        state.stats.event_waits += 1;
        if let Some(status) = state.scripted_waits.pop_front() {
            return status;
        }

        let current = state.events.remove(&self.id).unwrap_or_default();
        match current {
            EventState::Set => WaitStatus::Signaled,
            EventState::Idle => {
                state.events.insert(self.id, EventState::Idle);
                WaitStatus::TimedOut
            }
            EventState::Armed { fence, value } => {
                if state.behaviour != GpuBehaviour::Stalled {
                    state.advance(fence, value);
                }
                if state.completed(fence) >= value {
                    state.events.insert(self.id, EventState::Idle);
                    WaitStatus::Signaled
                } else {
                    state.events.insert(self.id, EventState::Armed { fence, value });
                    WaitStatus::TimedOut
                }
            }
        }
    }
}

impl Drop for HeadlessEvent {
    fn drop(&mut self) {
        let mut state = self.gpu.state();
        state.events.remove(&self.id);
        state.stats.events_closed += 1;
        state.release_log.push("event");
    }
}

struct SwapChainState {
    desc: SwapChainDesc,
    current: u32,
}

pub struct HeadlessSwapChain {
    gpu: HeadlessGpu,
    id: u64,
    inner: RefCell<SwapChainState>,
}

impl HeadlessSwapChain {
    pub fn desc(&self) -> SwapChainDesc {
        self.inner.borrow().desc
    }
}

impl SwapChain<Headless> for HeadlessSwapChain {
    fn buffer(&self, index: u32) -> NativeResult<HeadlessImage> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::AcquireImage(index))?;
        if index >= self.inner.borrow().desc.buffer_count {
            return Err(INVALID_CALL);
        }
        *state.live_images.entry(self.id).or_default() += 1;
        Ok(HeadlessImage {
            gpu: self.gpu.clone(),
            swap_chain: self.id,
            index,
        })
    }

    fn present(&self, mode: PresentMode) -> NativeResult<()> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::Present)?;
        let mut inner = self.inner.borrow_mut();
        if mode.allow_tearing && !inner.desc.allow_tearing {
            return Err(INVALID_CALL);
        }
        state.stats.presents += 1;
        state.stats.last_present = Some(mode);
        inner.current = (inner.current + 1) % inner.desc.buffer_count;
        Ok(())
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.inner.borrow().current
    }

    fn resize_buffers(&self, desc: &SwapChainDesc) -> NativeResult<()> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::ResizeBuffers)?;
        if state.live_images.get(&self.id).copied().unwrap_or(0) > 0 {
            return Err(INVALID_CALL);
        }
        state.stats.resizes += 1;
        let mut inner = self.inner.borrow_mut();
        inner.desc = *desc;
        inner.current = 0;
        Ok(())
    }
}

impl Drop for HeadlessSwapChain {
    fn drop(&mut self) {
        self.gpu.log_release("swap_chain");
    }
}

pub struct HeadlessImage {
    gpu: HeadlessGpu,
    swap_chain: u64,
    index: u32,
}

impl HeadlessImage {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for HeadlessImage {
    fn drop(&mut self) {
        let mut state = self.gpu.state();
        if let Some(live) = state.live_images.get_mut(&self.swap_chain) {
            *live = live.saturating_sub(1);
        }
        state.release_log.push("image");
    }
}

pub struct HeadlessViewHeap {
    gpu: HeadlessGpu,
    base: usize,
    capacity: u32,
}

impl HeadlessViewHeap {
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl ViewHeap for HeadlessViewHeap {
    fn handle(&self, index: u32) -> ViewHandle {
        ViewHandle(self.base + index as usize * VIEW_INCREMENT)
    }
}

impl Drop for HeadlessViewHeap {
    fn drop(&mut self) {
        self.gpu.log_release("view_heap");
    }
}

pub struct HeadlessCommandAllocator {
    gpu: HeadlessGpu,
    id: u64,
}

impl CommandAllocator for HeadlessCommandAllocator {
    fn reset(&self) -> NativeResult<()> {
        let mut state = self.gpu.state();
        state.take_failure(FailPoint::ResetAllocator)?;
        state.stats.allocator_resets += 1;
        if state.in_flight.iter().any(|work| work.allocator == self.id) {
            state.stats.allocator_hazards += 1;
        }
        Ok(())
    }
}

impl Drop for HeadlessCommandAllocator {
    fn drop(&mut self) {
        self.gpu.log_release("allocator");
    }
}

struct ListState {
    allocator: u64,
    recording: bool,
    commands: Vec<RecordedCommand>,
}

pub struct HeadlessCommandList {
    gpu: HeadlessGpu,
    inner: RefCell<ListState>,
}

impl GraphicsCommandList<Headless> for HeadlessCommandList {
    fn reset(&self, allocator: &HeadlessCommandAllocator) -> NativeResult<()> {
        self.gpu.state().take_failure(FailPoint::ResetCommandList)?;
        let mut inner = self.inner.borrow_mut();
        if inner.recording {
            return Err(INVALID_CALL);
        }
        inner.allocator = allocator.id;
        inner.recording = true;
        inner.commands.clear();
        Ok(())
    }

    fn transition(&self, image: &HeadlessImage, before: ResourceState, after: ResourceState) {
        self.inner
            .borrow_mut()
            .commands
            .push(RecordedCommand::Transition {
                image: image.index,
                before,
                after,
            });
    }

    fn clear_render_target(&self, view: ViewHandle, color: ClearColor) {
        self.inner
            .borrow_mut()
            .commands
            .push(RecordedCommand::Clear { view, color });
    }

    fn close(&self) -> NativeResult<()> {
        self.gpu.state().take_failure(FailPoint::CloseCommandList)?;
        let mut inner = self.inner.borrow_mut();
        if !inner.recording {
            return Err(INVALID_CALL);
        }
        inner.recording = false;
        Ok(())
    }
}

impl Drop for HeadlessCommandList {
    fn drop(&mut self) {
        self.gpu.log_release("command_list");
    }
}
