use dx12_frame_loop::config::build_command_line;
use dx12_frame_loop::config::LaunchOptions;
use dx12_frame_loop::logging::init_logging;
use dx12_frame_loop::report::AppResult;
use tracing::info;

pub fn main() -> AppResult<()> {
    color_eyre::install()?;
    init_logging();

    let options = build_command_line()?;
    info!(?options, "Starting frame loop");
    run(options)
}

#[cfg(windows)]
fn run(options: LaunchOptions) -> AppResult<()> {
    use dx12_frame_loop::backend::SurfaceDescriptor;
    use dx12_frame_loop::d3d12::runtime;
    use dx12_frame_loop::d3d12::runtime::RuntimeOptions;
    use dx12_frame_loop::d3d12::window::pump_messages;
    use dx12_frame_loop::d3d12::window::Window;
    use dx12_frame_loop::renderer::Renderer;
    use tracing::error;

    let ctx = runtime::setup(&RuntimeOptions {
        use_warp_device: options.use_warp_device,
    })?;

    let title = match options.use_warp_device {
        true => "Dx12 Frame Loop (WARP)",
        false => "Dx12 Frame Loop",
    };
    let window = Window::create(title, options.width, options.height)?;

    let surface = SurfaceDescriptor {
        window: window.hwnd,
        width: options.width,
        height: options.height,
    };
    let mut renderer = match Renderer::setup(&ctx, surface, options.renderer) {
        Ok(renderer) => renderer,
        Err(e) => {
            runtime::log_dxgi_debug_messages();
            return Err(e.into());
        }
    };

    window.show();

    let mut outcome = Ok(());
    while pump_messages() {
        let events = window.take_events();
        if events.toggle_vsync {
            let vsync = !renderer.surface().vsync();
            renderer.set_vsync(vsync);
            info!(vsync, "Toggled vsync");
        }
        if let Some((width, height)) = events.resize {
            if let Err(e) = renderer.resize(&ctx, width, height) {
                outcome = Err(e);
                break;
            }
        }

        // Render when idle
        match renderer.render() {
            Ok(submission) => {
                if options.frames.is_some_and(|frames| submission.frame + 1 >= frames) {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Render failed");
                runtime::log_dxgi_debug_messages();
                outcome = Err(e);
                break;
            }
        }
    }

    let released = renderer.release();
    drop(renderer);
    drop(window);
    drop(ctx);
    runtime::report_live_objects();

    outcome?;
    released?;
    Ok(())
}

#[cfg(not(windows))]
fn run(options: LaunchOptions) -> AppResult<()> {
    use dx12_frame_loop::backend::SurfaceDescriptor;
    use dx12_frame_loop::headless::GpuBehaviour;
    use dx12_frame_loop::headless::HeadlessGpu;
    use dx12_frame_loop::headless::HeadlessWindow;
    use dx12_frame_loop::renderer::Renderer;

    info!("Direct3D 12 unavailable on this host, using the headless backend");

    let gpu = HeadlessGpu::new(GpuBehaviour::OnWait).with_tearing_support(true);
    let ctx = gpu.context();
    let surface = SurfaceDescriptor {
        window: HeadlessWindow,
        width: options.width,
        height: options.height,
    };
    let mut renderer = Renderer::setup(&ctx, surface, options.renderer)?;

    for _ in 0..options.frames.unwrap_or(3) {
        let submission = renderer.render()?;
        info!(
            frame = submission.frame,
            slot = submission.slot,
            fence_value = submission.fence_value,
            "Frame submitted"
        );
    }
    renderer.release()?;

    let stats = gpu.stats();
    info!(
        submissions = stats.submissions,
        presents = stats.presents,
        signals = stats.signals,
        allocator_hazards = stats.allocator_hazards,
        "Headless run finished"
    );
    Ok(())
}
