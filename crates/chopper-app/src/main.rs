// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod assets;
mod camera;
mod config;
mod overlay;
mod scene;

use anyhow::{Context, Result};
use camera::FlyCamera;
use chopper_core::init_tracing;
use chopper_platform::{InputState, ResizeQueue};
use chopper_render::{wait_for_framebuffer, FrameDriver, FrameInput, FrameStatus, FramebufferSource, RenderSize};
use chopper_render_vk::context::ContextConfig;
use chopper_render_vk::pipeline::ShaderCode;
use chopper_render_vk::swapchain::VsyncMode;
use chopper_render_vk::{RendererConfig, SceneAssets, VkRenderer};
use clap::Parser;
use config::{load_cfg, AppCfg, WindowCfg};
use overlay::{StatusBar, StatusLevel};
use scene::Orbiters;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use chopper_platform::winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowId},
};

/// Frame time that fills the status bar.
const FRAME_BUDGET: f32 = 1.0 / 30.0;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing is fine, malformed falls back to defaults
    #[arg(long, default_value = config::DEFAULT_CONFIG)]
    config: PathBuf,
    /// OBJ model, overrides [assets].model
    #[arg(long)]
    model: Option<PathBuf>,
    /// Texture image, overrides [assets].texture
    #[arg(long)]
    texture: Option<PathBuf>,
    /// MSAA sample count, overrides [render].msaa_samples
    #[arg(long)]
    msaa: Option<u32>,
}

impl Args {
    fn apply(self, cfg: &mut AppCfg) {
        if let Some(model) = self.model {
            cfg.assets.model = Some(model);
        }
        if let Some(texture) = self.texture {
            cfg.assets.texture = Some(texture);
        }
        if let Some(msaa) = self.msaa {
            cfg.render.msaa_samples = msaa;
        }
    }
}

/// Window-side state fed by the event pump.
struct Shell {
    window_cfg: WindowCfg,
    window: Option<Window>,
    input: InputState,
    resizes: ResizeQueue,
    close_requested: bool,
    create_error: Option<anyhow::Error>,
}

impl Shell {
    fn new(window_cfg: WindowCfg) -> Self {
        Self {
            window_cfg,
            window: None,
            input: InputState::new(),
            resizes: ResizeQueue::default(),
            close_requested: false,
            create_error: None,
        }
    }
}

impl ApplicationHandler for Shell {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.window_cfg.title.clone())
            .with_inner_size(PhysicalSize::new(self.window_cfg.width, self.window_cfg.height));
        match event_loop.create_window(attrs) {
            Ok(window) => self.window = Some(window),
            Err(e) => {
                self.create_error = Some(anyhow::Error::new(e).context("create_window"));
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => self.resizes.push(size),
            other => self.input.handle_window_event(&other),
        }
    }
}

/// The event loop seen from the frame driver: size queries and blocking pumps.
struct Pump<'a> {
    event_loop: &'a mut EventLoop<()>,
    shell: &'a mut Shell,
}

impl FramebufferSource for Pump<'_> {
    fn framebuffer_size(&self) -> RenderSize {
        self.shell
            .window
            .as_ref()
            .map(|w| {
                let s = w.inner_size();
                RenderSize::new(s.width, s.height)
            })
            .unwrap_or(RenderSize::new(0, 0))
    }

    fn wait_events(&mut self) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(None, &mut *self.shell) {
            debug!(code, "event loop exited while waiting");
            self.shell.close_requested = true;
        }
    }

    fn is_closing(&self) -> bool {
        self.shell.close_requested
    }
}

fn vsync_mode(mode: config::VsyncMode) -> VsyncMode {
    match mode {
        config::VsyncMode::Fifo => VsyncMode::Fifo,
        config::VsyncMode::Mailbox => VsyncMode::Mailbox,
    }
}

fn load_scene(cfg: &AppCfg) -> Result<(chopper_render::MeshData, chopper_render::TextureData)> {
    let mesh = match &cfg.assets.model {
        Some(path) => assets::load_mesh(path)?,
        None => {
            info!("assets: no model configured; using built-in cube");
            assets::builtin_cube()
        }
    };
    let texture = match &cfg.assets.texture {
        Some(path) => assets::load_texture(path)?,
        None => {
            info!("assets: no texture configured; using built-in checkerboard");
            assets::builtin_checkerboard()?
        }
    };
    Ok((mesh, texture))
}

fn run(args: Args) -> Result<()> {
    let mut cfg = load_cfg(&args.config);
    args.apply(&mut cfg);

    let (mesh, texture) = load_scene(&cfg)?;
    let shaders = ShaderCode::mesh()?;

    let mut event_loop: EventLoop<()> = EventLoop::new()?;
    let mut shell = Shell::new(cfg.window.clone());

    // The window is created from `resumed`, delivered by the first pumps.
    while shell.window.is_none() {
        if let PumpStatus::Exit(_) =
            event_loop.pump_app_events(Some(Duration::from_millis(16)), &mut shell)
        {
            return match shell.create_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
    }

    let Some(size) = wait_for_framebuffer(&mut Pump {
        event_loop: &mut event_loop,
        shell: &mut shell,
    }) else {
        info!("window closed before it was ever shown");
        return Ok(());
    };
    let window = shell.window.as_ref().context("window vanished during startup")?;
    let render_cfg = RendererConfig {
        context: ContextConfig {
            app_name: cfg.window.title.clone(),
            validation: cfg.render.validation,
        },
        vsync: vsync_mode(cfg.render.vsync_mode),
        msaa_samples: cfg.render.msaa_samples,
        clear_color: cfg.render.clear_color,
    };
    let mut renderer = VkRenderer::new(
        window,
        window,
        size,
        &render_cfg,
        SceneAssets {
            mesh: &mesh,
            texture: &texture,
            shaders,
        },
    )?;
    info!(
        "renderer: {} ({}x MSAA, {} mip levels)",
        renderer.device_name(),
        renderer.samples(),
        renderer.mip_levels()
    );

    let level = StatusLevel::default();
    renderer.set_overlay(Box::new(StatusBar::new(level.clone())));

    let mut camera = FlyCamera::new(&cfg.camera);
    let orbiters = Orbiters::default();
    let mut driver = FrameDriver::new();

    let start = Instant::now();
    let mut last = start;
    let mut frames = 0u32;
    let mut last_fps_instant = start;

    loop {
        if let PumpStatus::Exit(code) =
            event_loop.pump_app_events(Some(Duration::ZERO), &mut shell)
        {
            debug!(code, "event loop exited");
            break;
        }
        if shell.close_requested {
            break;
        }
        if let Some(s) = shell.resizes.drain_latest() {
            debug!("resize → {}x{}", s.width, s.height);
            driver.mark_stale();
        }

        let now = Instant::now();
        let dt = (now - last).as_secs_f32();
        last = now;
        camera.update(&mut shell.input, dt);
        level.set(dt / FRAME_BUDGET);

        let mut source = Pump {
            event_loop: &mut event_loop,
            shell: &mut shell,
        };
        // Rebuild first so the projection sees the new extent.
        if !driver.recreate_if_stale(&mut renderer, &mut source)? {
            if source.is_closing() {
                break;
            }
            continue;
        }

        let models = orbiters.models((now - start).as_secs_f32());
        let input = FrameInput {
            view: camera.view(),
            proj: camera.projection(renderer.extent()),
            models: &models,
        };
        match driver.draw(&mut renderer, &mut source, &input)? {
            FrameStatus::Presented => frames = frames.saturating_add(1),
            FrameStatus::Skipped => {}
            FrameStatus::Closed => break,
        }

        if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", frames);
            frames = 0;
            last_fps_instant = now;
        }
    }

    if shell.resizes.dropped() > 0 {
        warn!("{} resize notifications were coalesced", shell.resizes.dropped());
    }
    info!(
        "exit: {} frames presented, {} skipped",
        driver.presented_frames(),
        driver.skipped_frames()
    );
    // Renderer (device idle, GPU objects, surface) goes before the window.
    drop(renderer);
    drop(shell);
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
