// SPDX-License-Identifier: CEPL-1.0
//! Swapchain rebuilds against a real window. Skips (passes) when there is no
//! display server or no Vulkan 1.3 device that can present to it.
//!
//! winit allows one event loop per process, so this binary holds one test.
#![cfg(any(target_os = "linux", target_os = "windows"))]

use chopper_render::RenderSize;
use chopper_render_vk::allocator::Allocator;
use chopper_render_vk::context::{ContextConfig, DeviceContext};
use chopper_render_vk::swapchain::{Rebuild, SwapchainConfig, SwapchainManager};
use std::time::Duration;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::EventLoopExtPumpEvents;
use winit::window::{Window, WindowId};

#[derive(Default)]
struct TestWindow {
    window: Option<Window>,
    failed: bool,
}

impl ApplicationHandler for TestWindow {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.failed {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title("chopper-swapchain-test")
            .with_inner_size(PhysicalSize::new(320u32, 240u32));
        match event_loop.create_window(attrs) {
            Ok(w) => self.window = Some(w),
            Err(e) => {
                eprintln!("create_window: {e}");
                self.failed = true;
            }
        }
    }

    fn window_event(&mut self, _: &ActiveEventLoop, _: WindowId, _: WindowEvent) {}
}

fn event_loop() -> Option<EventLoop<()>> {
    let mut builder = EventLoop::builder();
    #[cfg(target_os = "linux")]
    {
        use winit::platform::x11::EventLoopBuilderExtX11;
        builder.with_any_thread(true);
    }
    #[cfg(target_os = "windows")]
    {
        use winit::platform::windows::EventLoopBuilderExtWindows;
        builder.with_any_thread(true);
    }
    match builder.build() {
        Ok(el) => Some(el),
        Err(e) => {
            eprintln!("skipping: no display ({e})");
            None
        }
    }
}

fn pump(event_loop: &mut EventLoop<()>, app: &mut TestWindow, rounds: usize) {
    for _ in 0..rounds {
        let _ = event_loop.pump_app_events(Some(Duration::from_millis(10)), app);
    }
}

#[test]
fn recreate_keeps_views_in_step_with_images() {
    let Some(mut event_loop) = event_loop() else { return };
    let mut app = TestWindow::default();
    for _ in 0..50 {
        if app.window.is_some() || app.failed {
            break;
        }
        pump(&mut event_loop, &mut app, 1);
    }
    let Some(window) = app.window.take() else {
        eprintln!("skipping: window never appeared");
        return;
    };

    let cfg = ContextConfig {
        app_name: "chopper-swapchain-test".into(),
        validation: false,
    };
    let ctx = match DeviceContext::new(&window, &window, &cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("skipping: no presentable Vulkan device ({e:#})");
            return;
        }
    };
    let allocator = Allocator::new(&ctx).unwrap();
    let mut swapchain = SwapchainManager::create(
        &ctx,
        &allocator,
        RenderSize::new(320, 240),
        SwapchainConfig::default(),
    )
    .unwrap();
    assert_eq!(swapchain.image_count(), swapchain.views().len());
    assert!(swapchain.image_count() >= 2);

    for (w, h) in [(640u32, 480u32), (200, 150), (1024, 300), (320, 240)] {
        let _ = window.request_inner_size(PhysicalSize::new(w, h));
        pump(&mut event_loop, &mut app, 5);

        let before = swapchain.generation();
        let size = window.inner_size();
        let outcome = swapchain
            .recreate(&ctx, &allocator, RenderSize::new(size.width, size.height))
            .unwrap();

        assert!(matches!(outcome, Rebuild::Done { .. }), "{w}x{h}: {outcome:?}");
        assert_eq!(swapchain.generation(), before + 1);
        assert_eq!(swapchain.image_count(), swapchain.views().len());
        let extent = swapchain.extent();
        assert!(extent.width > 0 && extent.height > 0);
        assert!(swapchain.depth_target().is_some());
    }

    drop(swapchain);
    assert_eq!(allocator.live_resources(), 0);
    drop(allocator);
    drop(ctx);
    drop(window);
}
