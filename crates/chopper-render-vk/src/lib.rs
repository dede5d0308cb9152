// SPDX-License-Identifier: CEPL-1.0
//! Vulkan 1.3 frame core on `ash`: dynamic rendering + synchronization2,
//! a single graphics+present queue, two frames in flight.
pub mod allocator;
pub mod barrier;
pub mod context;
pub mod mipmap;
pub mod pipeline;
pub mod recorder;
pub mod swapchain;
pub mod sync;
pub mod texture;

use allocator::Allocator;
use anyhow::{Context, Result};
use ash::vk;
use chopper_render::{
    Acquired, FrameBackend, FrameInput, MeshData, Presented, RenderSize, TextureData,
};
use context::{clamp_sample_count, ContextConfig, DeviceContext};
use pipeline::{CameraUniforms, FrameDescriptors, GraphicsPipeline, RenderTargets, ShaderCode};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use recorder::{record_frame, FrameRecording, UiOverlay};
use swapchain::{Rebuild, SwapchainConfig, SwapchainManager, VsyncMode};
use sync::{FrameSynchronizer, FRAMES_IN_FLIGHT, GPU_WAIT_TIMEOUT};
use texture::{GpuMesh, GpuTexture};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub context: ContextConfig,
    pub vsync: VsyncMode,
    /// Requested MSAA sample count; clamped to what the device supports.
    pub msaa_samples: u32,
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            vsync: VsyncMode::Mailbox,
            msaa_samples: 4,
            clear_color: [0.02, 0.02, 0.04, 1.0],
        }
    }
}

/// Long-lived scene data, uploaded once at startup.
pub struct SceneAssets<'a> {
    pub mesh: &'a MeshData,
    pub texture: &'a TextureData,
    pub shaders: ShaderCode,
}

pub struct VkRenderer {
    // Field order is drop order, the reverse of creation in `new`.
    overlay: Option<Box<dyn UiOverlay>>,
    pipeline: GraphicsPipeline,
    descriptors: FrameDescriptors,
    sync: FrameSynchronizer,
    texture: GpuTexture,
    mesh: GpuMesh,
    swapchain: SwapchainManager,
    allocator: Allocator,
    ctx: DeviceContext,
    shaders: ShaderCode,
    clear_color: [f32; 4],
}

impl VkRenderer {
    /// STRICT ORDER:
    /// 1) device context (instance -> surface -> device)
    /// 2) allocator, then swapchain + attachments
    /// 3) long-lived mesh/texture uploads (block on the queue)
    /// 4) frame slots, descriptors pointing at slot uniforms + texture
    /// 5) pipeline for the swapchain's formats and sample count
    pub fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RendererConfig,
        scene: SceneAssets<'_>,
    ) -> Result<Self> {
        let ctx = DeviceContext::new(window, display, &cfg.context)?;
        let allocator = Allocator::new(&ctx)?;

        let samples = clamp_sample_count(cfg.msaa_samples, ctx.supported_sample_counts());
        if cfg.msaa_samples > 1 && samples == vk::SampleCountFlags::TYPE_1 {
            info!("vk: MSAA x{} unavailable; rendering at 1x", cfg.msaa_samples);
        }
        let swapchain = SwapchainManager::create(
            &ctx,
            &allocator,
            size,
            SwapchainConfig {
                vsync: cfg.vsync,
                samples,
                ..Default::default()
            },
        )?;

        let mesh = GpuMesh::upload(&allocator, scene.mesh).context("upload mesh")?;
        let texture = GpuTexture::upload(&ctx, &allocator, scene.texture).context("upload texture")?;

        let sync = FrameSynchronizer::new(
            &ctx,
            &allocator,
            swapchain.image_count(),
            std::mem::size_of::<CameraUniforms>() as vk::DeviceSize,
        )?;
        let descriptors = FrameDescriptors::new(&ctx.device, FRAMES_IN_FLIGHT)?;
        for (i, slot) in sync.slots().iter().enumerate() {
            descriptors.write(i, slot.uniforms.handle(), texture.view(), texture.sampler());
        }

        let pipeline = GraphicsPipeline::new(
            &ctx.device,
            &scene.shaders,
            Self::targets_of(&swapchain),
            descriptors.layout,
        )?;

        info!("vk: renderer ready on {}", ctx.device_name());
        Ok(Self {
            overlay: None,
            pipeline,
            descriptors,
            sync,
            swapchain,
            texture,
            mesh,
            allocator,
            ctx,
            shaders: scene.shaders,
            clear_color: cfg.clear_color,
        })
    }

    fn targets_of(swapchain: &SwapchainManager) -> RenderTargets {
        RenderTargets {
            color_format: swapchain.format(),
            depth_format: swapchain.depth_format(),
            samples: swapchain.samples(),
        }
    }

    pub fn set_overlay(&mut self, overlay: Box<dyn UiOverlay>) {
        self.overlay = Some(overlay);
    }

    pub fn extent(&self) -> RenderSize {
        let e = self.swapchain.extent();
        RenderSize::new(e.width, e.height)
    }

    pub fn samples(&self) -> u32 {
        self.swapchain.samples().as_raw()
    }

    pub fn device_name(&self) -> String {
        self.ctx.device_name()
    }

    /// Allocations still owned by the renderer.
    pub fn live_resources(&self) -> usize {
        self.allocator.live_resources()
    }

    pub fn mip_levels(&self) -> u32 {
        self.texture.mip_levels()
    }
}

impl FrameBackend for VkRenderer {
    fn begin_frame(&mut self) -> Result<()> {
        self.sync.begin_frame()
    }

    fn acquire(&mut self) -> Result<Acquired> {
        self.swapchain.acquire_next_image(
            GPU_WAIT_TIMEOUT.as_nanos() as u64,
            self.sync.image_available(),
        )
    }

    fn record_and_submit(&mut self, image_index: u32, input: &FrameInput<'_>) -> Result<()> {
        let cmd = self.sync.arm()?.cmd;
        let frame_index = self.sync.frame_index();
        let uniforms = CameraUniforms::new(input.view, input.proj);
        self.sync.write_uniforms(bytemuck::bytes_of(&uniforms))?;

        let depth = self
            .swapchain
            .depth_target()
            .context("swapchain has no depth target")?;
        let rec = FrameRecording {
            cmd,
            frame_index,
            swapchain_image: self.swapchain.image(image_index),
            swapchain_view: self.swapchain.view(image_index),
            extent: self.swapchain.extent(),
            color_target: self.swapchain.color_target(),
            depth,
            pipeline: &self.pipeline,
            descriptor_set: self.descriptors.sets[frame_index],
            mesh: &self.mesh,
            models: input.models,
            clear_color: self.clear_color,
        };
        unsafe { record_frame(&self.ctx.device, &rec, self.overlay.as_deref_mut())? };
        self.sync.submit(image_index)
    }

    fn present(&mut self, image_index: u32) -> Result<Presented> {
        self.sync.present(&self.swapchain, image_index)
    }

    // STRICT ORDER (recreate):
    // 1) swapchain manager idles the device and rebuilds swapchain/views/attachments
    //    (a 0x0 surface defers everything below)
    // 2) per-image present semaphores follow the new image count
    // 3) pipeline rebuilt only when color format or sample count moved
    fn recreate(&mut self, size: RenderSize) -> Result<bool> {
        let format_changed = match self.swapchain.recreate(&self.ctx, &self.allocator, size)? {
            Rebuild::Done { format_changed } => format_changed,
            Rebuild::Deferred => return Ok(false),
        };
        self.sync
            .rebuild_present_signals(self.swapchain.image_count())?;

        let targets = Self::targets_of(&self.swapchain);
        if format_changed || targets != self.pipeline.targets() {
            debug!("vk: render targets changed; rebuilding pipeline");
            self.pipeline = GraphicsPipeline::new(
                &self.ctx.device,
                &self.shaders,
                targets,
                self.descriptors.layout,
            )?;
        }
        Ok(true)
    }
}

// STRICT TEARDOWN ORDER:
// - device idle before anything is destroyed
// - then fields in declaration order: overlay, pipeline, descriptors,
//   frame sync, texture, mesh, swapchain (+ attachments), allocator
// - device context last: device, surface, messenger, instance
impl Drop for VkRenderer {
    fn drop(&mut self) {
        self.ctx.wait_idle();
        debug!("vk: renderer shutting down");
    }
}
