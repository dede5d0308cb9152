// SPDX-License-Identifier: CEPL-1.0
use crate::allocator::{Allocator, GpuImage, ImageDesc};
use crate::context::{has_stencil, DeviceContext, SurfaceBinding};
use anyhow::{ensure, Context, Result};
use ash::khr::swapchain;
use ash::vk;
use chopper_core::FatalError;
use chopper_render::{Acquired, Presented, RenderSize};
use tracing::{debug, info};

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VsyncMode {
    /// Low-latency triple buffering when the surface offers it.
    #[default]
    Mailbox,
    /// Strict vsync; always available.
    Fifo,
}

/// The preferred format when offered, otherwise whatever the surface lists first.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: VsyncMode) -> vk::PresentModeKHR {
    match vsync {
        VsyncMode::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

/// A `current_extent` of `u32::MAX` means the surface size follows the
/// swapchain; use the framebuffer size clamped to the allowed range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: framebuffer
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: framebuffer
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// A minimized window's surface reports a 0x0 extent; no swapchain can be
/// built for it.
pub fn is_presentable(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

/// `max(3, min)`, capped by `max` unless the surface reports no maximum (0).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count.max(3);
    if caps.max_image_count > 0 {
        want.min(caps.max_image_count)
    } else {
        want
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SwapchainConfig {
    pub vsync: VsyncMode,
    pub preferred_format: vk::SurfaceFormatKHR,
    /// Already clamped to what the device supports.
    pub samples: vk::SampleCountFlags,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            vsync: VsyncMode::Mailbox,
            preferred_format: PREFERRED_FORMAT,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

/// Outcome of [`SwapchainManager::recreate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rebuild {
    Done { format_changed: bool },
    /// The surface extent is zero; the old swapchain was left intact.
    Deferred,
}

/// Everything sized to the current extent. Replaced wholesale on recreation.
struct Attachments {
    /// Multisampled color target resolved into the swapchain image; absent at 1x.
    color: Option<GpuImage>,
    depth: GpuImage,
}

pub struct SwapchainManager {
    device: ash::Device,
    loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    attachments: Option<Attachments>,
    depth_format: vk::Format,
    cfg: SwapchainConfig,
    generation: u64,
}

fn surface_of(ctx: &DeviceContext) -> Result<&SurfaceBinding> {
    ctx.surface()
        .ok_or_else(|| FatalError::MissingCapability("presentation surface".into()).into())
}

impl SwapchainManager {
    pub fn create(
        ctx: &DeviceContext,
        allocator: &Allocator,
        size: RenderSize,
        cfg: SwapchainConfig,
    ) -> Result<Self> {
        let mut sc = Self {
            device: ctx.device.clone(),
            loader: swapchain::Device::new(&ctx.instance, &ctx.device),
            swapchain: vk::SwapchainKHR::null(),
            format: cfg.preferred_format,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            attachments: None,
            depth_format: ctx.depth_format,
            cfg,
            generation: 0,
        };
        sc.build(ctx, allocator, size)?;
        Ok(sc)
    }

    /// Tears down and rebuilds the swapchain, its views and the attachments for
    /// `size`. Reports whether the color format changed (pipelines depend on
    /// it), or `Deferred` without touching anything while the surface is 0x0.
    ///
    /// STRICT ORDER:
    /// 1) device idle
    /// 2) surface extent checked; zero stops here
    /// 3) destroy attachments and image views of the OLD swapchain
    /// 4) create the NEW swapchain with `old_swapchain` set, then destroy the old
    /// 5) new views, then new attachments at the new extent
    pub fn recreate(
        &mut self,
        ctx: &DeviceContext,
        allocator: &Allocator,
        size: RenderSize,
    ) -> Result<Rebuild> {
        unsafe { self.device.device_wait_idle() }.context("wait idle before recreate")?;
        let surf = surface_of(ctx)?;
        let caps = unsafe {
            surf.loader
                .get_physical_device_surface_capabilities(ctx.phys, surf.surface)
                .context("surface capabilities")?
        };
        let extent = choose_extent(&caps, size);
        if !is_presentable(extent) {
            debug!("swapchain: surface extent {}x{}; deferring", extent.width, extent.height);
            return Ok(Rebuild::Deferred);
        }
        let old_format = self.format.format;

        if let Some(old) = self.attachments.take() {
            if let Some(color) = old.color {
                allocator.destroy(color);
            }
            allocator.destroy(old.depth);
        }
        self.destroy_views();
        self.build(ctx, allocator, size)?;
        Ok(Rebuild::Done {
            format_changed: self.format.format != old_format,
        })
    }

    fn build(&mut self, ctx: &DeviceContext, allocator: &Allocator, size: RenderSize) -> Result<()> {
        let surf = surface_of(ctx)?;
        let (caps, formats, modes) = unsafe {
            (
                surf.loader
                    .get_physical_device_surface_capabilities(ctx.phys, surf.surface)
                    .context("surface capabilities")?,
                surf.loader
                    .get_physical_device_surface_formats(ctx.phys, surf.surface)
                    .context("surface formats")?,
                surf.loader
                    .get_physical_device_surface_present_modes(ctx.phys, surf.surface)
                    .context("surface present modes")?,
            )
        };

        let format = choose_surface_format(&formats, self.cfg.preferred_format).ok_or(
            FatalError::UnsupportedFormat {
                what: "swapchain",
                candidates: "any (surface reports none)".into(),
            },
        )?;
        let present_mode = choose_present_mode(&modes, self.cfg.vsync);
        let extent = choose_extent(&caps, size);
        ensure!(
            is_presentable(extent),
            "surface extent is {}x{}; window not presentable",
            extent.width,
            extent.height
        );
        let image_count = choose_image_count(&caps);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let old_swapchain = self.swapchain;
        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: surf.surface,
            min_image_count: image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain,
            ..Default::default()
        };

        unsafe {
            let swapchain = self
                .loader
                .create_swapchain(&info, None)
                .context("vkCreateSwapchainKHR")?;
            if old_swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(old_swapchain, None);
            }
            self.swapchain = swapchain;
            self.images = self
                .loader
                .get_swapchain_images(swapchain)
                .context("vkGetSwapchainImagesKHR")?;

            for &image in &self.images {
                let view_ci = vk::ImageViewCreateInfo {
                    s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                    image,
                    view_type: vk::ImageViewType::TYPE_2D,
                    format: format.format,
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    ..Default::default()
                };
                self.views.push(
                    self.device
                        .create_image_view(&view_ci, None)
                        .context("swapchain image view")?,
                );
            }
        }

        self.format = format;
        self.extent = extent;
        self.attachments = Some(self.create_attachments(allocator)?);
        self.generation += 1;

        info!(
            "swapchain #{}: {:?}/{:?}, {:?}, {}x{}, {} images (min {}, max {}), {:?}",
            self.generation,
            format.format,
            format.color_space,
            present_mode,
            extent.width,
            extent.height,
            self.images.len(),
            caps.min_image_count,
            caps.max_image_count,
            self.cfg.samples
        );
        Ok(())
    }

    fn create_attachments(&self, allocator: &Allocator) -> Result<Attachments> {
        let msaa = self.cfg.samples != vk::SampleCountFlags::TYPE_1;
        let transient = if msaa {
            vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
        } else {
            vk::ImageUsageFlags::empty()
        };

        let color = if msaa {
            Some(
                allocator.create_image(
                    &ImageDesc::new(
                        self.extent,
                        self.format.format,
                        vk::ImageUsageFlags::COLOR_ATTACHMENT | transient,
                    )
                    .samples(self.cfg.samples),
                )?,
            )
        } else {
            None
        };

        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if has_stencil(self.depth_format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        let depth = allocator.create_image(
            &ImageDesc::new(
                self.extent,
                self.depth_format,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | transient,
            )
            .samples(self.cfg.samples)
            .aspect(aspect),
        )?;
        Ok(Attachments { color, depth })
    }

    fn destroy_views(&mut self) {
        for view in self.views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
    }

    /// Tri-state acquisition. `OutOfDate` is an outcome, not an error.
    pub fn acquire_next_image(&self, timeout_ns: u64, signal: vk::Semaphore) -> Result<Acquired> {
        match unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, signal, vk::Fence::null())
        } {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(FatalError::GpuTimeout {
                what: "swapchain image",
                timeout_ms: timeout_ns / 1_000_000,
            }
            .into()),
            Err(e) => Err(e).context("vkAcquireNextImageKHR"),
        }
    }

    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> Result<Presented> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        match unsafe { self.loader.queue_present(queue, &present) } {
            Ok(false) => Ok(Presented::Ok),
            Ok(true) => Ok(Presented::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::OutOfDate),
            Err(e) => Err(e).context("vkQueuePresentKHR"),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    pub fn view(&self, index: u32) -> vk::ImageView {
        self.views[index as usize]
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.cfg.samples
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn color_target(&self) -> Option<&GpuImage> {
        self.attachments.as_ref().and_then(|a| a.color.as_ref())
    }

    pub fn depth_target(&self) -> Option<&GpuImage> {
        self.attachments.as_ref().map(|a| &a.depth)
    }

    /// Number of swapchains built so far; bumps on every recreation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        // Attachments are allocator resources; they go first.
        self.attachments = None;
        self.destroy_views();
        unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        debug!("swapchain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 48,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2160,
            },
            ..Default::default()
        }
    }

    fn within(e: vk::Extent2D, c: &vk::SurfaceCapabilitiesKHR) -> bool {
        (c.min_image_extent.width..=c.max_image_extent.width).contains(&e.width)
            && (c.min_image_extent.height..=c.max_image_extent.height).contains(&e.height)
    }

    #[test]
    fn sentinel_extent_clamps_framebuffer() {
        let c = caps(2, 8);
        for fb in [
            RenderSize::new(800, 600),
            RenderSize::new(1, 1),
            RenderSize::new(10_000, 10_000),
            RenderSize::new(5000, 100),
        ] {
            let e = choose_extent(&c, fb);
            assert!(within(e, &c), "{fb:?} -> {e:?}");
        }
        assert_eq!(
            choose_extent(&c, RenderSize::new(800, 600)),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn defined_extent_is_taken_as_is() {
        let mut c = caps(2, 8);
        c.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let e = choose_extent(&c, RenderSize::new(1920, 1080));
        assert_eq!((e.width, e.height), (1280, 720));
        assert!(within(e, &c));
    }

    #[test]
    fn image_count_bounds() {
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
        assert_eq!(choose_image_count(&caps(4, 8)), 4);
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
        assert_eq!(choose_image_count(&caps(1, 0)), 3);
        assert_eq!(choose_image_count(&caps(5, 0)), 5);
        for (min, max) in [(1, 0), (2, 3), (3, 3), (4, 16), (2, 0)] {
            let n = choose_image_count(&caps(min, max));
            assert!(n >= min.max(3).min(if max == 0 { u32::MAX } else { max }));
            assert!(max == 0 || n <= max);
        }
    }

    #[test]
    fn format_prefers_bgra_srgb_then_first() {
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(
            choose_surface_format(&[first, PREFERRED_FORMAT], PREFERRED_FORMAT),
            Some(PREFERRED_FORMAT)
        );
        let wrong_space = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        assert_eq!(
            choose_surface_format(&[first, wrong_space], PREFERRED_FORMAT),
            Some(first)
        );
        assert_eq!(choose_surface_format(&[], PREFERRED_FORMAT), None);
    }

    #[test]
    fn present_mode_prefers_mailbox_falls_back_to_fifo() {
        use vk::PresentModeKHR as P;
        assert_eq!(
            choose_present_mode(&[P::FIFO, P::MAILBOX], VsyncMode::Mailbox),
            P::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[P::FIFO, P::IMMEDIATE], VsyncMode::Mailbox),
            P::FIFO
        );
        assert_eq!(
            choose_present_mode(&[P::FIFO, P::MAILBOX], VsyncMode::Fifo),
            P::FIFO
        );
    }

    #[test]
    fn minimized_surface_is_not_presentable() {
        // What a minimized Win32 surface reports.
        let minimized = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            ..Default::default()
        };
        let extent = choose_extent(&minimized, RenderSize::new(1, 1));
        assert_eq!((extent.width, extent.height), (0, 0));
        assert!(!is_presentable(extent));
        assert!(!is_presentable(vk::Extent2D {
            width: 800,
            height: 0
        }));
        assert!(is_presentable(choose_extent(&caps(2, 8), RenderSize::new(1, 1))));
    }
}
