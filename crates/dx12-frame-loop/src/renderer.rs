//! Per-frame protocol tying allocator reuse, recording, submission and
//! synchronization together.

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;

use crate::backend::Backend;
use crate::backend::CommandAllocator;
use crate::backend::CommandQueue;
use crate::backend::Device;
use crate::backend::GraphicsCommandList;
use crate::backend::ResourceState;
use crate::backend::SurfaceDescriptor;
use crate::config::FramePacing;
use crate::config::RendererConfig;
use crate::context::GraphicsContext;
use crate::error::FrameError;
use crate::error::NativeCode;
use crate::error::ResultCode;
use crate::error::SetupError;
use crate::error::SetupStage;
use crate::error::SyncError;
use crate::fence::FenceSynchronizer;
use crate::presentation::PresentOptions;
use crate::presentation::PresentationSurface;

/// What one call to [`Renderer::render`] handed to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSubmission {
    /// Zero-based frame number.
    pub frame: u64,
    /// Back buffer slot the frame was recorded into.
    pub slot: u32,
    /// Fence value signaled after the frame was presented.
    pub fence_value: u64,
}

pub struct Renderer<B: Backend> {
    queue: Option<B::Queue>,
    surface: PresentationSurface<B>,
    fence: FenceSynchronizer<B>,
    command_list: Option<B::CommandList>,
    allocators: Vec<B::CommandAllocator>,
    pending: Vec<u64>,
    /// Set between a successful execute and the signal that follows it.
    unsignaled_work: bool,
    frames_rendered: u64,
    config: RendererConfig,
}

impl<B: Backend> Renderer<B> {
    /// Builds the queue, presentation surface, fence, one allocator per
    /// back buffer and a closed command list. Stops at the first failure.
    pub fn setup(
        ctx: &GraphicsContext<B>,
        surface: SurfaceDescriptor<B::Window>,
        config: RendererConfig,
    ) -> Result<Self, SetupError> {
        config.validate().map_err(|error| {
            error!(%error, "Rejected renderer configuration");
            SetupError::new(
                SetupStage::ValidateConfig,
                ResultCode::InvalidConfiguration,
                NativeCode::INVALID_ARG,
            )
        })?;

        let queue = ctx.device.create_command_queue().map_err(|code| {
            error!(%code, "Failed to create command queue");
            SetupError::new(
                SetupStage::CreateCommandQueue,
                ResultCode::CommandQueueCreationFailed,
                code,
            )
        })?;

        let surface = PresentationSurface::setup(
            ctx,
            &queue,
            surface,
            PresentOptions {
                buffer_count: config.buffer_count,
                vsync: config.vsync,
            },
        )?;

        let fence = FenceSynchronizer::setup(ctx, &queue, config.wait_policy)?;

        let allocators = (0..config.buffer_count)
            .map(|index| {
                ctx.device.create_command_allocator().map_err(|code| {
                    error!(index, %code, "Failed to create command allocator");
                    SetupError::new(
                        SetupStage::CreateCommandAllocator { index },
                        ResultCode::CommandAllocatorCreationFailed,
                        code,
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let first_slot = surface.current_back_buffer_index() as usize;
        let command_list = ctx
            .device
            .create_command_list(&allocators[first_slot])
            .map_err(|code| {
                error!(%code, "Failed to create command list");
                SetupError::new(
                    SetupStage::CreateCommandList,
                    ResultCode::CommandListCreationFailed,
                    code,
                )
            })?;

        // Lists are created recording; render expects a closed one.
        command_list.close().map_err(|code| {
            error!(%code, "Failed to close command list");
            SetupError::new(
                SetupStage::CloseCommandList,
                ResultCode::CommandListCloseFailed,
                code,
            )
        })?;

        info!(
            buffers = config.buffer_count,
            pacing = ?config.pacing,
            vsync = config.vsync,
            "Renderer ready"
        );

        Ok(Self {
            queue: Some(queue),
            surface,
            fence,
            command_list: Some(command_list),
            allocators,
            pending: vec![0; config.buffer_count as usize],
            unsignaled_work: false,
            frames_rendered: 0,
            config,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn surface(&self) -> &PresentationSurface<B> {
        &self.surface
    }

    pub fn fence(&self) -> &FenceSynchronizer<B> {
        &self.fence
    }

    pub fn current_slot(&self) -> u32 {
        self.surface.current_back_buffer_index()
    }

    /// Fence value each slot's allocator was last submitted with.
    pub fn pending_values(&self) -> &[u64] {
        &self.pending
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn is_released(&self) -> bool {
        self.queue.is_none()
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.surface.set_vsync(vsync);
        debug!(vsync, "Vsync changed");
    }

    /// Records, submits and presents one frame.
    pub fn render(&mut self) -> Result<FrameSubmission, FrameError> {
        let (Some(queue), Some(command_list)) = (self.queue.as_ref(), self.command_list.as_ref())
        else {
            return Err(FrameError::Released);
        };

        let slot = self.surface.current_back_buffer_index();
        let (Some(image), Some(view)) = (
            self.surface.current_back_buffer(),
            self.surface.current_rtv_handle(),
        ) else {
            return Err(FrameError::Released);
        };
        let allocator = &self.allocators[slot as usize];

        // The wait at the end of the frame that last used this slot makes
        // the reset safe.
        allocator.reset().map_err(|code| {
            error!(slot, %code, "Failed to reset command allocator");
            FrameError::ResetAllocator { slot, code }
        })?;

        command_list.reset(allocator).map_err(|code| {
            error!(slot, %code, "Failed to reset command list");
            FrameError::ResetCommandList(code)
        })?;

        command_list.transition(image, ResourceState::Present, ResourceState::RenderTarget);
        command_list.clear_render_target(view, self.config.clear_color);
        command_list.transition(image, ResourceState::RenderTarget, ResourceState::Present);
        command_list.close().map_err(|code| {
            error!(slot, %code, "Failed to close command list");
            FrameError::CloseCommandList(code)
        })?;

        queue.execute(command_list).map_err(|code| {
            error!(slot, %code, "Failed to execute command list");
            FrameError::Submit(code)
        })?;
        self.unsignaled_work = true;

        self.surface.present().map_err(|code| {
            error!(slot, %code, "Failed to present");
            FrameError::Present(code)
        })?;

        let fence_value = self.fence.signal()?;
        self.unsignaled_work = false;
        self.pending[slot as usize] = fence_value;

        self.surface.update_back_buffer_index();
        let next = self.surface.current_back_buffer_index();

        let wait_slot = match self.config.pacing {
            FramePacing::PerSlot => next,
            FramePacing::Serialized => slot,
        };
        self.fence.wait_cpu(self.pending[wait_slot as usize])?;

        let submission = FrameSubmission {
            frame: self.frames_rendered,
            slot,
            fence_value,
        };
        self.frames_rendered += 1;
        trace!(
            frame = submission.frame,
            slot,
            value = fence_value,
            next,
            "Frame submitted"
        );
        Ok(submission)
    }

    /// Waits for the GPU to go idle, then recreates the back buffers.
    pub fn resize(
        &mut self,
        ctx: &GraphicsContext<B>,
        width: u32,
        height: u32,
    ) -> Result<(), FrameError> {
        if self.is_released() {
            return Err(FrameError::Released);
        }
        if (width, height) == self.surface.extent() {
            return Ok(());
        }

        let value = self.idle()?;
        self.surface
            .resize(ctx, width, height)
            .map_err(FrameError::Resize)?;
        self.pending.fill(value);

        info!(width, height, "Renderer resized");
        Ok(())
    }

    /// Rendezvous with the GPU, then drop the swap chain, fence, command
    /// list, allocators and queue in that order.
    ///
    /// Resources are dropped even when the flush fails; its error is
    /// returned afterwards. Calling it again does nothing.
    pub fn release(&mut self) -> Result<(), FrameError> {
        if self.is_released() {
            return Ok(());
        }

        let flushed = self.idle().map(|_| ()).map_err(|error| {
            error!(%error, "Failed to flush before release");
            FrameError::from(error)
        });

        self.surface.release();
        self.fence.release();
        drop(self.command_list.take());
        self.allocators.clear();
        drop(self.queue.take());

        info!(frames = self.frames_rendered, "Renderer released");
        flushed
    }

    /// Waits until the GPU has finished everything submitted so far.
    fn idle(&mut self) -> Result<u64, SyncError> {
        let value = match self.unsignaled_work {
            true => self.fence.rendezvous()?,
            false => self.fence.flush()?,
        };
        self.unsignaled_work = false;
        Ok(value)
    }
}

impl<B: Backend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            error!(%error, "Renderer released without a clean flush");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::ClearColor;
    use crate::backend::WaitStatus;
    use crate::headless::FailPoint;
    use crate::headless::GpuBehaviour;
    use crate::headless::Headless;
    use crate::headless::HeadlessGpu;
    use crate::headless::HeadlessWindow;
    use crate::headless::RecordedCommand;

    fn surface() -> SurfaceDescriptor<HeadlessWindow> {
        SurfaceDescriptor {
            window: HeadlessWindow,
            width: 1280,
            height: 720,
        }
    }

    fn renderer(gpu: &HeadlessGpu, config: RendererConfig) -> Renderer<Headless> {
        Renderer::setup(&gpu.context(), surface(), config).unwrap()
    }

    #[test]
    fn three_frames_cycle_through_the_slots() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let mut renderer = renderer(&gpu, RendererConfig::default());

        let slots: Vec<u32> = (0..3).map(|_| renderer.render().unwrap().slot).collect();
        assert_eq!(slots, [0, 1, 2]);
        assert_eq!(renderer.current_slot(), 0);
        assert_eq!(renderer.pending_values(), [1, 2, 3]);

        let stats = gpu.stats();
        assert_eq!(stats.submissions, 3);
        assert_eq!(stats.presents, 3);
        assert_eq!(stats.signals, 3);
        assert_eq!(stats.allocator_hazards, 0);
    }

    #[test]
    fn per_slot_pacing_keeps_frames_in_flight() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let mut renderer = renderer(&gpu, RendererConfig::default());

        renderer.render().unwrap();
        renderer.render().unwrap();
        assert_eq!(renderer.fence().completed_value().unwrap(), 0);
        assert_eq!(gpu.stats().event_waits, 0);

        // slot 0 comes round again, so its frame must be done
        renderer.render().unwrap();
        assert_eq!(renderer.fence().completed_value().unwrap(), 1);
    }

    #[test]
    fn serialized_pacing_waits_for_every_frame() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let mut renderer = renderer(
            &gpu,
            RendererConfig {
                pacing: FramePacing::Serialized,
                ..RendererConfig::default()
            },
        );

        for expected in 1..=4 {
            let submission = renderer.render().unwrap();
            assert_eq!(submission.fence_value, expected);
            assert_eq!(renderer.fence().completed_value().unwrap(), expected);
        }
        assert_eq!(gpu.stats().event_waits, 4);
    }

    #[test]
    fn allocators_are_never_reset_while_in_flight() {
        for buffer_count in [2, 3, 4] {
            let gpu = HeadlessGpu::new(GpuBehaviour::OnWait).with_first_back_buffer(1);
            let mut renderer = renderer(
                &gpu,
                RendererConfig {
                    buffer_count,
                    ..RendererConfig::default()
                },
            );
            for _ in 0..10 {
                renderer.render().unwrap();
            }
            let stats = gpu.stats();
            assert_eq!(stats.allocator_resets, 10);
            assert_eq!(stats.allocator_hazards, 0);
        }
    }

    #[test]
    fn frame_clears_the_current_back_buffer() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let mut renderer = renderer(&gpu, RendererConfig::default());
        let view = renderer.surface().current_rtv_handle().unwrap();
        renderer.render().unwrap();

        assert_eq!(
            gpu.submissions(),
            [vec![
                RecordedCommand::Transition {
                    image: 0,
                    before: ResourceState::Present,
                    after: ResourceState::RenderTarget,
                },
                RecordedCommand::Clear {
                    view,
                    color: ClearColor::default(),
                },
                RecordedCommand::Transition {
                    image: 0,
                    before: ResourceState::RenderTarget,
                    after: ResourceState::Present,
                },
            ]]
        );
    }

    #[test]
    fn frames_are_numbered_from_zero() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let mut renderer = renderer(&gpu, RendererConfig::default());
        let frames: Vec<u64> = (0..4).map(|_| renderer.render().unwrap().frame).collect();
        assert_eq!(frames, [0, 1, 2, 3]);
        assert_eq!(renderer.frames_rendered(), 4);
    }

    #[test]
    fn release_flushes_then_drops_in_order() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let mut renderer = renderer(&gpu, RendererConfig::default());
        renderer.render().unwrap();
        renderer.render().unwrap();

        renderer.release().unwrap();
        assert_eq!(gpu.stats().signals, 3);
        assert_eq!(
            gpu.release_log(),
            [
                "image",
                "image",
                "image",
                "view_heap",
                "swap_chain",
                "event",
                "fence",
                "command_list",
                "allocator",
                "allocator",
                "allocator",
                "queue",
            ]
        );
    }

    #[test]
    fn release_twice_releases_once() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let mut renderer = renderer(&gpu, RendererConfig::default());
        renderer.render().unwrap();
        renderer.release().unwrap();
        renderer.release().unwrap();
        drop(renderer);

        assert_eq!(gpu.stats().events_closed, 1);
        assert_eq!(gpu.released("queue"), 1);
        assert_eq!(gpu.released("swap_chain"), 1);
        assert_eq!(gpu.released("allocator"), 3);
    }

    #[test]
    fn render_after_release_is_an_error() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let mut renderer = renderer(&gpu, RendererConfig::default());
        renderer.release().unwrap();
        assert_eq!(renderer.render(), Err(FrameError::Released));
        assert_eq!(gpu.stats().submissions, 0);
    }

    #[test]
    fn release_still_drops_everything_when_the_flush_times_out() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let mut renderer = renderer(&gpu, RendererConfig::default());
        renderer.render().unwrap();
        gpu.set_behaviour(GpuBehaviour::Stalled);

        assert!(matches!(
            renderer.release(),
            Err(FrameError::Sync(SyncError::WaitTimedOut { .. }))
        ));
        assert!(renderer.is_released());
        assert_eq!(gpu.released("queue"), 1);
    }

    #[test]
    fn steady_state_failures_are_reported() {
        let cases = [
            (
                FailPoint::ResetAllocator,
                FrameError::ResetAllocator {
                    slot: 0,
                    code: NativeCode(3),
                },
            ),
            (FailPoint::ResetCommandList, FrameError::ResetCommandList(NativeCode(3))),
            (FailPoint::CloseCommandList, FrameError::CloseCommandList(NativeCode(3))),
            (FailPoint::Execute, FrameError::Submit(NativeCode(3))),
            (FailPoint::Present, FrameError::Present(NativeCode(3))),
            (
                FailPoint::Signal,
                FrameError::Sync(SyncError::SignalFailed {
                    value: 1,
                    code: NativeCode(3),
                }),
            ),
        ];
        for (point, expected) in cases {
            let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
            let mut renderer = renderer(&gpu, RendererConfig::default());
            gpu.fail_next(point, NativeCode(3));
            assert_eq!(renderer.render(), Err(expected));
        }
    }

    #[test]
    fn stalled_gpu_is_fatal() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Stalled);
        let mut renderer = renderer(
            &gpu,
            RendererConfig {
                pacing: FramePacing::Serialized,
                ..RendererConfig::default()
            },
        );
        assert_eq!(
            renderer.render(),
            Err(FrameError::Sync(SyncError::WaitTimedOut {
                value: 1,
                attempts: 3,
                timeout: Duration::from_millis(2000),
            }))
        );
    }

    #[test]
    fn wait_failure_is_fatal() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let mut renderer = renderer(
            &gpu,
            RendererConfig {
                pacing: FramePacing::Serialized,
                ..RendererConfig::default()
            },
        );
        gpu.script_wait(WaitStatus::Failed(NativeCode(9)));
        assert_eq!(
            renderer.render(),
            Err(FrameError::Sync(SyncError::WaitFailed(NativeCode(9))))
        );
    }

    #[test]
    fn resize_flushes_and_restarts_at_the_first_buffer() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let ctx = gpu.context();
        let mut renderer = Renderer::setup(&ctx, surface(), RendererConfig::default()).unwrap();
        renderer.render().unwrap();
        renderer.render().unwrap();

        renderer.resize(&ctx, 640, 480).unwrap();
        assert_eq!(renderer.surface().extent(), (640, 480));
        assert_eq!(renderer.current_slot(), 0);
        assert_eq!(renderer.pending_values(), [3, 3, 3]);
        assert_eq!(renderer.fence().completed_value().unwrap(), 3);

        for _ in 0..4 {
            renderer.render().unwrap();
        }
        assert_eq!(gpu.stats().allocator_hazards, 0);
    }

    #[test]
    fn resize_to_the_same_extent_does_nothing() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let mut renderer = Renderer::setup(&ctx, surface(), RendererConfig::default()).unwrap();
        renderer.resize(&ctx, 1280, 720).unwrap();
        assert_eq!(gpu.stats().resizes, 0);
        assert_eq!(gpu.stats().signals, 0);
    }

    #[test]
    fn vsync_can_be_turned_off() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate).with_tearing_support(true);
        let mut renderer = renderer(&gpu, RendererConfig::default());
        renderer.set_vsync(false);
        renderer.render().unwrap();
        let mode = gpu.stats().last_present.unwrap();
        assert_eq!(mode.sync_interval, 0);
        assert!(mode.allow_tearing);
    }

    #[test]
    fn setup_stops_at_the_first_failure() {
        let cases = [
            (
                FailPoint::CreateCommandQueue,
                SetupStage::CreateCommandQueue,
                ResultCode::CommandQueueCreationFailed,
            ),
            (
                FailPoint::CreateSwapChain,
                SetupStage::CreateSwapChain,
                ResultCode::SwapChainCreationFailed,
            ),
            (
                FailPoint::CreateFence,
                SetupStage::CreateFence,
                ResultCode::FenceCreationFailed,
            ),
            (
                FailPoint::CreateCommandAllocator,
                SetupStage::CreateCommandAllocator { index: 0 },
                ResultCode::CommandAllocatorCreationFailed,
            ),
            (
                FailPoint::CreateCommandList,
                SetupStage::CreateCommandList,
                ResultCode::CommandListCreationFailed,
            ),
            (
                FailPoint::CloseCommandList,
                SetupStage::CloseCommandList,
                ResultCode::CommandListCloseFailed,
            ),
        ];
        for (point, stage, status) in cases {
            let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
            gpu.fail_next(point, NativeCode::FAIL);
            let err = Renderer::setup(&gpu.context(), surface(), RendererConfig::default())
                .err()
                .unwrap();
            assert_eq!(err, SetupError::new(stage, status, NativeCode::FAIL));
            assert_eq!(gpu.stats().submissions, 0);
        }
    }

    #[test]
    fn setup_rejects_an_invalid_buffer_count() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let config = RendererConfig {
            buffer_count: 1,
            ..RendererConfig::default()
        };
        let err = Renderer::setup(&gpu.context(), surface(), config)
            .err()
            .unwrap();
        assert_eq!(
            err,
            SetupError::new(
                SetupStage::ValidateConfig,
                ResultCode::InvalidConfiguration,
                NativeCode::INVALID_ARG,
            )
        );
        assert_eq!(gpu.released("queue"), 0);
    }

    #[test]
    fn release_waits_for_a_frame_that_failed_to_present() {
        let gpu = HeadlessGpu::new(GpuBehaviour::OnWait);
        let ctx = gpu.context();
        let mut renderer = Renderer::setup(&ctx, surface(), RendererConfig::default()).unwrap();
        renderer.render().unwrap();
        renderer.resize(&ctx, 640, 480).unwrap();

        gpu.fail_next(FailPoint::Present, NativeCode(0x22));
        assert_eq!(renderer.render(), Err(FrameError::Present(NativeCode(0x22))));
        let before = gpu.stats();
        assert_eq!(before.submissions, 2);
        assert_eq!(before.signals, 2);

        renderer.release().unwrap();
        let after = gpu.stats();
        assert_eq!(after.signals, 3);
        assert_eq!(after.event_waits - before.event_waits, 1);
    }

    #[test]
    fn failed_resize_leaves_the_renderer_unusable() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let mut renderer = Renderer::setup(&ctx, surface(), RendererConfig::default()).unwrap();
        renderer.render().unwrap();

        gpu.fail_next(FailPoint::ResizeBuffers, NativeCode(0x31));
        assert_eq!(
            renderer.resize(&ctx, 640, 480),
            Err(FrameError::Resize(SetupError::new(
                SetupStage::ResizeBuffers,
                ResultCode::ResizeBuffersFailed,
                NativeCode(0x31),
            )))
        );
        assert!(renderer.surface().is_released());

        let before = gpu.stats();
        assert_eq!(renderer.render(), Err(FrameError::Released));
        let after = gpu.stats();
        assert_eq!(after.allocator_resets, before.allocator_resets);
        assert_eq!(after.submissions, before.submissions);

        renderer.release().unwrap();
        assert_eq!(gpu.released("swap_chain"), 1);
        assert_eq!(gpu.released("allocator"), 3);
    }
}
