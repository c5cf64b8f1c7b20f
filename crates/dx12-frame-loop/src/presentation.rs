//! The chain of presentable images and the views used to render into them.

use tracing::debug;
use tracing::error;
use tracing::info;

use crate::backend::Backend;
use crate::backend::Device;
use crate::backend::PresentMode;
use crate::backend::SurfaceDescriptor;
use crate::backend::SwapChain;
use crate::backend::SwapChainDesc;
use crate::backend::ViewHandle;
use crate::backend::ViewHeap;
use crate::context::GraphicsContext;
use crate::error::NativeCode;
use crate::error::ResultCode;
use crate::error::SetupError;
use crate::error::SetupStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentOptions {
    pub buffer_count: u32,
    pub vsync: bool,
}

impl Default for PresentOptions {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            vsync: true,
        }
    }
}

struct Chain<B: Backend> {
    swap_chain: B::SwapChain,
    view_heap: B::ViewHeap,
    images: Vec<B::Image>,
    views: Vec<ViewHandle>,
}

pub struct PresentationSurface<B: Backend> {
    chain: Option<Chain<B>>,
    surface: SurfaceDescriptor<B::Window>,
    buffer_count: u32,
    vsync: bool,
    tearing_supported: bool,
    current: u32,
}

impl<B: Backend> PresentationSurface<B> {
    /// Creates the swap chain, the view heap and one view per image.
    ///
    /// Any failure is fatal to this attempt; nothing partially built is
    /// returned.
    pub fn setup(
        ctx: &GraphicsContext<B>,
        queue: &B::Queue,
        surface: SurfaceDescriptor<B::Window>,
        options: PresentOptions,
    ) -> Result<Self, SetupError> {
        let desc = SwapChainDesc {
            buffer_count: options.buffer_count,
            width: surface.width,
            height: surface.height,
            allow_tearing: ctx.tearing_supported,
        };

        let swap_chain = ctx
            .device
            .create_swap_chain(queue, &surface, &desc)
            .map_err(|failure| {
                error!(status = ?failure.status, code = %failure.code, "Failed to create swap chain");
                SetupError::from_failure(SetupStage::CreateSwapChain, failure)
            })?;

        let view_heap = ctx
            .device
            .create_view_heap(options.buffer_count)
            .map_err(|code| {
                error!(%code, "Failed to create RTV descriptor heap");
                SetupError::new(
                    SetupStage::CreateRtvDescriptorHeap,
                    ResultCode::ViewHeapCreationFailed,
                    code,
                )
            })?;

        let (images, views) =
            populate_views::<B>(ctx, &swap_chain, &view_heap, options.buffer_count)?;
        let current = swap_chain.current_back_buffer_index();

        info!(
            width = surface.width,
            height = surface.height,
            buffers = options.buffer_count,
            vsync = options.vsync,
            "Swap chain ready"
        );

        Ok(Self {
            chain: Some(Chain {
                swap_chain,
                view_heap,
                images,
                views,
            }),
            surface,
            buffer_count: options.buffer_count,
            vsync: options.vsync,
            tearing_supported: ctx.tearing_supported,
            current,
        })
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.surface.width, self.surface.height)
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    pub fn present_mode(&self) -> PresentMode {
        PresentMode::resolve(self.vsync, self.tearing_supported)
    }

    pub fn is_released(&self) -> bool {
        self.chain.is_none()
    }

    /// Hands the current image to the display.
    pub fn present(&self) -> Result<(), NativeCode> {
        let chain = self.chain.as_ref().ok_or(NativeCode::FAIL)?;
        chain.swap_chain.present(self.present_mode())
    }

    /// Takes the next writable image from the swap chain. The backend decides
    /// the order.
    pub fn update_back_buffer_index(&mut self) {
        if let Some(chain) = &self.chain {
            self.current = chain.swap_chain.current_back_buffer_index();
        }
    }

    pub fn current_back_buffer_index(&self) -> u32 {
        self.current
    }

    pub fn current_back_buffer(&self) -> Option<&B::Image> {
        self.chain.as_ref()?.images.get(self.current as usize)
    }

    pub fn current_rtv_handle(&self) -> Option<ViewHandle> {
        self.chain.as_ref()?.views.get(self.current as usize).copied()
    }

    pub fn images(&self) -> &[B::Image] {
        self.chain
            .as_ref()
            .map(|chain| chain.images.as_slice())
            .unwrap_or_default()
    }

    pub fn views(&self) -> &[ViewHandle] {
        self.chain
            .as_ref()
            .map(|chain| chain.views.as_slice())
            .unwrap_or_default()
    }

    /// Recreates the images and views at a new size. The GPU must not be
    /// using any of the images.
    pub fn resize(
        &mut self,
        ctx: &GraphicsContext<B>,
        width: u32,
        height: u32,
    ) -> Result<(), SetupError> {
        let Some(chain) = self.chain.as_mut() else {
            return Err(SetupError::new(
                SetupStage::ResizeBuffers,
                ResultCode::ResizeBuffersFailed,
                NativeCode::FAIL,
            ));
        };

        chain.images.clear();
        chain.views.clear();

        let desc = SwapChainDesc {
            buffer_count: self.buffer_count,
            width,
            height,
            allow_tearing: self.tearing_supported,
        };
        // A chain without images is unusable, so any failure releases it.
        let current = match rebuild_chain::<B>(ctx, chain, &desc) {
            Ok(current) => current,
            Err(error) => {
                self.release();
                return Err(error);
            }
        };
        self.current = current;
        self.surface.width = width;
        self.surface.height = height;

        debug!(width, height, "Swap chain resized");
        Ok(())
    }

    /// Drops the images, the view heap and the swap chain. Calling it again
    /// does nothing.
    pub fn release(&mut self) {
        let Some(chain) = self.chain.take() else {
            return;
        };
        let Chain {
            swap_chain,
            view_heap,
            images,
            views,
        } = chain;
        drop(views);
        drop(images);
        drop(view_heap);
        drop(swap_chain);
        info!("Swap chain released");
    }
}

impl<B: Backend> Drop for PresentationSurface<B> {
    fn drop(&mut self) {
        self.release();
    }
}

fn rebuild_chain<B: Backend>(
    ctx: &GraphicsContext<B>,
    chain: &mut Chain<B>,
    desc: &SwapChainDesc,
) -> Result<u32, SetupError> {
    chain.swap_chain.resize_buffers(desc).map_err(|code| {
        error!(width = desc.width, height = desc.height, %code, "Failed to resize swap chain buffers");
        SetupError::new(SetupStage::ResizeBuffers, ResultCode::ResizeBuffersFailed, code)
    })?;

    let (images, views) =
        populate_views::<B>(ctx, &chain.swap_chain, &chain.view_heap, desc.buffer_count)?;
    chain.images = images;
    chain.views = views;
    Ok(chain.swap_chain.current_back_buffer_index())
}

fn populate_views<B: Backend>(
    ctx: &GraphicsContext<B>,
    swap_chain: &B::SwapChain,
    view_heap: &B::ViewHeap,
    buffer_count: u32,
) -> Result<(Vec<B::Image>, Vec<ViewHandle>), SetupError> {
    let mut images = Vec::with_capacity(buffer_count as usize);
    let mut views = Vec::with_capacity(buffer_count as usize);

    for index in 0..buffer_count {
        let image = swap_chain.buffer(index).map_err(|code| {
            error!(index, %code, "Failed to get swap chain buffer");
            SetupError::new(
                SetupStage::UpdateRenderTargetViews { index },
                ResultCode::ImageAcquisitionFailed,
                code,
            )
        })?;
        let view = view_heap.handle(index);
        ctx.device.create_render_target_view(&image, view);
        images.push(image);
        views.push(view);
    }

    Ok((images, views))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::headless::FailPoint;
    use crate::headless::GpuBehaviour;
    use crate::headless::Headless;
    use crate::headless::HeadlessGpu;
    use crate::headless::HeadlessQueue;
    use crate::headless::HeadlessWindow;

    fn surface(width: u32, height: u32) -> SurfaceDescriptor<HeadlessWindow> {
        SurfaceDescriptor {
            window: HeadlessWindow,
            width,
            height,
        }
    }

    fn queue(ctx: &GraphicsContext<Headless>) -> HeadlessQueue {
        ctx.device.create_command_queue().unwrap()
    }

    #[test]
    fn three_buffers_give_three_images_and_views() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let presentation = PresentationSurface::setup(
            &ctx,
            &queue(&ctx),
            surface(1280, 720),
            PresentOptions::default(),
        )
        .unwrap();

        assert_eq!(presentation.images().len(), 3);
        assert_eq!(presentation.views().len(), 3);
        assert!(presentation.current_back_buffer_index() < 3);
        assert_eq!(gpu.stats().views_created, 3);

        let views: HashSet<ViewHandle> = presentation.views().iter().copied().collect();
        assert_eq!(views.len(), 3);
    }

    #[test]
    fn current_accessors_follow_the_backend() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate).with_first_back_buffer(2);
        let ctx = gpu.context();
        let mut presentation = PresentationSurface::setup(
            &ctx,
            &queue(&ctx),
            surface(64, 64),
            PresentOptions::default(),
        )
        .unwrap();

        assert_eq!(presentation.current_back_buffer_index(), 2);
        assert_eq!(presentation.current_back_buffer().unwrap().index(), 2);
        assert_eq!(presentation.current_rtv_handle(), Some(presentation.views()[2]));

        presentation.present().unwrap();
        assert_eq!(presentation.current_back_buffer_index(), 2);
        presentation.update_back_buffer_index();
        assert_eq!(presentation.current_back_buffer_index(), 0);
    }

    #[test]
    fn present_uses_vsync_or_tearing() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate).with_tearing_support(true);
        let ctx = gpu.context();
        let mut presentation = PresentationSurface::setup(
            &ctx,
            &queue(&ctx),
            surface(64, 64),
            PresentOptions::default(),
        )
        .unwrap();

        presentation.present().unwrap();
        assert_eq!(
            gpu.stats().last_present,
            Some(PresentMode {
                sync_interval: 1,
                allow_tearing: false
            })
        );

        presentation.set_vsync(false);
        presentation.present().unwrap();
        assert_eq!(
            gpu.stats().last_present,
            Some(PresentMode {
                sync_interval: 0,
                allow_tearing: true
            })
        );
    }

    #[test]
    fn setup_failures_name_their_stage() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let queue = queue(&ctx);

        let cases = [
            (
                FailPoint::CreateSwapChain,
                SetupStage::CreateSwapChain,
                ResultCode::SwapChainCreationFailed,
            ),
            (
                FailPoint::CreateViewHeap,
                SetupStage::CreateRtvDescriptorHeap,
                ResultCode::ViewHeapCreationFailed,
            ),
            (
                FailPoint::AcquireImage(1),
                SetupStage::UpdateRenderTargetViews { index: 1 },
                ResultCode::ImageAcquisitionFailed,
            ),
        ];
        for (point, stage, status) in cases {
            gpu.fail_next(point, NativeCode(0x1234));
            let err = PresentationSurface::setup(
                &ctx,
                &queue,
                surface(64, 64),
                PresentOptions::default(),
            )
            .err()
            .unwrap();
            assert_eq!(err, SetupError::new(stage, status, NativeCode(0x1234)));
        }
    }

    #[test]
    fn resize_recreates_views() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let mut presentation = PresentationSurface::setup(
            &ctx,
            &queue(&ctx),
            surface(64, 64),
            PresentOptions {
                buffer_count: 2,
                vsync: true,
            },
        )
        .unwrap();

        presentation.resize(&ctx, 128, 32).unwrap();
        assert_eq!(presentation.extent(), (128, 32));
        assert_eq!(presentation.images().len(), 2);
        assert_eq!(presentation.current_back_buffer_index(), 0);
        assert_eq!(gpu.stats().views_created, 4);
        assert_eq!(gpu.stats().resizes, 1);
    }

    #[test]
    fn failed_resize_releases_the_chain() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let mut presentation = PresentationSurface::setup(
            &ctx,
            &queue(&ctx),
            surface(64, 64),
            PresentOptions::default(),
        )
        .unwrap();

        gpu.fail_next(FailPoint::ResizeBuffers, NativeCode(0x44));
        let err = presentation.resize(&ctx, 128, 32).err().unwrap();
        assert_eq!(err.stage, SetupStage::ResizeBuffers);
        assert_eq!(err.status, ResultCode::ResizeBuffersFailed);
        assert_eq!(err.code, NativeCode(0x44));

        assert!(presentation.is_released());
        assert!(presentation.current_back_buffer().is_none());
        assert_eq!(presentation.extent(), (64, 64));
        assert_eq!(gpu.released("swap_chain"), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let mut presentation = PresentationSurface::setup(
            &ctx,
            &queue(&ctx),
            surface(64, 64),
            PresentOptions::default(),
        )
        .unwrap();

        presentation.release();
        presentation.release();
        drop(presentation);

        assert_eq!(gpu.released("swap_chain"), 1);
        assert_eq!(gpu.released("image"), 3);
        assert_eq!(gpu.released("view_heap"), 1);
    }

    #[test]
    fn released_surface_has_no_current_target() {
        let gpu = HeadlessGpu::new(GpuBehaviour::Immediate);
        let ctx = gpu.context();
        let mut presentation = PresentationSurface::setup(
            &ctx,
            &queue(&ctx),
            surface(64, 64),
            PresentOptions::default(),
        )
        .unwrap();

        presentation.release();
        assert!(presentation.current_back_buffer().is_none());
        assert!(presentation.current_rtv_handle().is_none());
        assert_eq!(presentation.present(), Err(NativeCode::FAIL));
    }
}
