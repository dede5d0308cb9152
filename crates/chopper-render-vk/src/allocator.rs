// SPDX-License-Identifier: CEPL-1.0
//! GPU memory, buffer/image creation and staging uploads.
//!
//! Buffers and images come back as move-only owners of handle + memory.
//! Dropping one destroys the handle and then frees its memory; the allocator
//! keeps no registry beyond a live count used to flag leaks at shutdown.
use crate::barrier::{self, Transition};
use crate::context::DeviceContext;
use anyhow::{bail, ensure, Context, Result};
use ash::vk;
use chopper_core::FatalError;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryIntent {
    /// Staging and per-frame uniforms. Host visible + coherent, mapped for life.
    HostSequentialWrite,
    /// Anything only the GPU reads or writes.
    DeviceLocalPreferred,
}

impl MemoryIntent {
    fn name(self) -> &'static str {
        match self {
            MemoryIntent::HostSequentialWrite => "host-visible sequential write",
            MemoryIntent::DeviceLocalPreferred => "device-local preferred",
        }
    }
}

/// Index of the memory type to use for `type_bits` under `intent`.
pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    intent: MemoryIntent,
) -> Option<u32> {
    let allowed = |i: u32| type_bits & (1 << i) != 0;
    let flags = |i: u32| props.memory_types[i as usize].property_flags;
    let find = |want: vk::MemoryPropertyFlags| {
        (0..props.memory_type_count).find(|&i| allowed(i) && flags(i).contains(want))
    };

    match intent {
        MemoryIntent::HostSequentialWrite => find(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ),
        MemoryIntent::DeviceLocalPreferred => find(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .or_else(|| find(vk::MemoryPropertyFlags::empty())),
    }
}

/// Something the allocator handed out.
pub trait GpuResource {
    fn label(&self) -> String;
}

pub struct GpuBuffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
    live: Arc<AtomicUsize>,
}

impl GpuBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copies `data` to the start of a host-visible buffer.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(ptr) = self.mapped else {
            bail!("write to a buffer that is not host visible");
        };
        ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "write of {} bytes overflows a {}-byte buffer",
            data.len(),
            self.size
        );
        // SAFETY: mapping spans `size` bytes for the buffer's lifetime and the
        // memory is coherent, so no flush is needed.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
        Ok(())
    }

    /// Mapped contents of a host-visible buffer.
    pub fn mapped_bytes(&self) -> Option<&[u8]> {
        self.mapped
            .map(|p| unsafe { std::slice::from_raw_parts(p.as_ptr(), self.size as usize) })
    }
}

impl GpuResource for GpuBuffer {
    fn label(&self) -> String {
        format!("buffer {:?} ({} bytes)", self.buffer, self.size)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Creation parameters for a 2D, single-layer image and its default view.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub aspect: vk::ImageAspectFlags,
    pub intent: MemoryIntent,
}

impl ImageDesc {
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            usage,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: vk::ImageAspectFlags::COLOR,
            intent: MemoryIntent::DeviceLocalPreferred,
        }
    }

    pub fn mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.extent.width > 0 && self.extent.height > 0,
            "image extent {}x{} is empty",
            self.extent.width,
            self.extent.height
        );
        let max_levels = crate::mipmap::mip_levels(self.extent.width, self.extent.height);
        ensure!(
            (1..=max_levels).contains(&self.mip_levels),
            "{} mip levels requested; a {}x{} image allows 1..={max_levels}",
            self.mip_levels,
            self.extent.width,
            self.extent.height
        );
        ensure!(
            self.samples == vk::SampleCountFlags::TYPE_1 || self.mip_levels == 1,
            "multisampled images cannot have mip levels"
        );
        ensure!(!self.usage.is_empty(), "image usage is empty");
        ensure!(
            self.intent == MemoryIntent::DeviceLocalPreferred,
            "optimal-tiling images are device local"
        );
        Ok(())
    }
}

/// Image + memory + a view over every mip level.
pub struct GpuImage {
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    desc: ImageDesc,
    live: Arc<AtomicUsize>,
}

impl GpuImage {
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.desc.samples
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.desc.aspect
    }
}

impl GpuResource for GpuImage {
    fn label(&self) -> String {
        let e = self.desc.extent;
        format!(
            "image {:?} ({}x{} {:?}, {} mips)",
            self.image, e.width, e.height, self.desc.format, self.desc.mip_levels
        )
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        // view -> image -> memory
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Destination of a staging upload.
pub enum UploadTarget<'a> {
    Buffer(&'a GpuBuffer),
    /// Level 0 receives tightly packed pixels. Every level is left in
    /// TRANSFER_DST_OPTIMAL, ready for mip generation.
    Image(&'a GpuImage),
}

pub struct Allocator {
    device: ash::Device,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    queue: vk::Queue,
    pool: vk::CommandPool,
    live: Arc<AtomicUsize>,
}

impl Allocator {
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.queue_family,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            ..Default::default()
        };
        let pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }
            .context("create transfer command pool")?;
        Ok(Self {
            device: ctx.device.clone(),
            memory_props: ctx.memory_properties(),
            queue: ctx.queue,
            pool,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Resources created by this allocator that are still alive.
    pub fn live_resources(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// The single allocation entry point for buffers and images.
    fn allocate(
        &self,
        req: vk::MemoryRequirements,
        intent: MemoryIntent,
    ) -> Result<vk::DeviceMemory> {
        let index = select_memory_type(&self.memory_props, req.memory_type_bits, intent).ok_or(
            FatalError::NoCompatibleMemoryType {
                type_bits: req.memory_type_bits,
                intent: intent.name(),
            },
        )?;
        let info = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: index,
            ..Default::default()
        };
        let memory = unsafe { self.device.allocate_memory(&info, None) }
            .with_context(|| format!("vkAllocateMemory({} bytes, type {index})", req.size))?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(memory)
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        intent: MemoryIntent,
    ) -> Result<GpuBuffer> {
        ensure!(size > 0, "zero-sized buffer");
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let buffer = self
                .device
                .create_buffer(&bci, None)
                .context("vkCreateBuffer")?;
            let req = self.device.get_buffer_memory_requirements(buffer);
            let memory = match self.allocate(req, intent) {
                Ok(m) => m,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            // From here on, Drop cleans up.
            let mut out = GpuBuffer {
                device: self.device.clone(),
                buffer,
                memory,
                size,
                mapped: None,
                live: self.live.clone(),
            };
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .context("vkBindBufferMemory")?;
            if intent == MemoryIntent::HostSequentialWrite {
                let ptr = self
                    .device
                    .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                    .context("vkMapMemory")?;
                out.mapped = NonNull::new(ptr.cast::<u8>());
            }
            debug!("alloc: {} [{:?}, {}]", out.label(), usage, intent.name());
            Ok(out)
        }
    }

    pub fn create_image(&self, desc: &ImageDesc) -> Result<GpuImage> {
        desc.validate()?;
        let ici = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            },
            mip_levels: desc.mip_levels,
            array_layers: 1,
            samples: desc.samples,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        unsafe {
            let image = self
                .device
                .create_image(&ici, None)
                .context("vkCreateImage")?;
            let req = self.device.get_image_memory_requirements(image);
            let memory = match self.allocate(req, desc.intent) {
                Ok(m) => m,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };
            let mut out = GpuImage {
                device: self.device.clone(),
                image,
                memory,
                view: vk::ImageView::null(),
                desc: *desc,
                live: self.live.clone(),
            };
            self.device
                .bind_image_memory(image, memory, 0)
                .context("vkBindImageMemory")?;

            let view_ci = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: desc.format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: desc.aspect,
                    base_mip_level: 0,
                    level_count: desc.mip_levels,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            out.view = self
                .device
                .create_image_view(&view_ci, None)
                .context("vkCreateImageView")?;
            debug!("alloc: {} [{:?}]", out.label(), desc.usage);
            Ok(out)
        }
    }

    /// Explicit destruction; equivalent to dropping, but logged.
    pub fn destroy<R: GpuResource>(&self, resource: R) {
        debug!("free: {}", resource.label());
        drop(resource);
    }

    /// Records `record` into a one-time command buffer, submits it and blocks
    /// until the queue is idle. Load-time only.
    pub fn one_time_commands<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        unsafe {
            let cmd = self
                .device
                .allocate_command_buffers(&ai)
                .context("allocate one-time command buffer")?[0];
            let result = (|| -> Result<()> {
                let bi = vk::CommandBufferBeginInfo {
                    s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                };
                self.device.begin_command_buffer(cmd, &bi)?;
                record(cmd)?;
                self.device.end_command_buffer(cmd)?;

                let si = vk::SubmitInfo {
                    s_type: vk::StructureType::SUBMIT_INFO,
                    command_buffer_count: 1,
                    p_command_buffers: &cmd,
                    ..Default::default()
                };
                self.device
                    .queue_submit(self.queue, std::slice::from_ref(&si), vk::Fence::null())
                    .context("submit one-time commands")?;
                self.device
                    .queue_wait_idle(self.queue)
                    .context("wait for one-time commands")?;
                Ok(())
            })();
            self.device
                .free_command_buffers(self.pool, std::slice::from_ref(&cmd));
            result
        }
    }

    /// host -> staging -> `target`, synchronously. The staging buffer is sized
    /// to `data` and is gone by the time this returns.
    pub fn upload_via_staging(&self, target: UploadTarget<'_>, data: &[u8]) -> Result<()> {
        let size = data.len() as vk::DeviceSize;
        let mut staging = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryIntent::HostSequentialWrite,
        )?;
        staging.write(data)?;

        match target {
            UploadTarget::Buffer(dst) => {
                ensure!(
                    size <= dst.size(),
                    "upload of {size} bytes overflows {}",
                    dst.label()
                );
                self.one_time_commands(|cmd| {
                    let region = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size,
                    };
                    unsafe {
                        self.device.cmd_copy_buffer(
                            cmd,
                            staging.handle(),
                            dst.handle(),
                            std::slice::from_ref(&region),
                        )
                    };
                    Ok(())
                })?;
            }
            UploadTarget::Image(dst) => {
                let e = dst.extent();
                let expected = e.width as vk::DeviceSize * e.height as vk::DeviceSize * 4;
                ensure!(
                    size == expected,
                    "upload of {size} bytes does not match {} (expects {expected})",
                    dst.label()
                );
                self.one_time_commands(|cmd| unsafe {
                    barrier::transition(
                        &self.device,
                        cmd,
                        Transition::whole(
                            dst.handle(),
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            dst.aspect(),
                        ),
                    )?;
                    let region = vk::BufferImageCopy {
                        buffer_offset: 0,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: dst.aspect(),
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D::default(),
                        image_extent: vk::Extent3D {
                            width: e.width,
                            height: e.height,
                            depth: 1,
                        },
                    };
                    self.device.cmd_copy_buffer_to_image(
                        cmd,
                        staging.handle(),
                        dst.handle(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        std::slice::from_ref(&region),
                    );
                    Ok(())
                })?;
            }
        }
        self.destroy(staging);
        Ok(())
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let live = self.live_resources();
        if live != 0 {
            warn!("allocator dropped with {live} resources still alive");
        }
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}
