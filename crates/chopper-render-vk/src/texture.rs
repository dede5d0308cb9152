// SPDX-License-Identifier: CEPL-1.0
use crate::allocator::{Allocator, GpuBuffer, GpuImage, ImageDesc, MemoryIntent, UploadTarget};
use crate::context::DeviceContext;
use crate::mipmap;
use anyhow::{ensure, Context, Result};
use ash::vk;
use chopper_render::{MeshData, TextureData};
use tracing::info;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Sampled RGBA8 texture with its full mip chain and a sampler.
pub struct GpuTexture {
    device: ash::Device,
    image: GpuImage,
    sampler: vk::Sampler,
}

fn sampler_info(max_anisotropy: f32, levels: u32) -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        mip_lod_bias: 0.0,
        anisotropy_enable: vk::TRUE,
        max_anisotropy,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: levels as f32,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        ..Default::default()
    }
}

impl GpuTexture {
    /// Upload level 0 through staging, then blit the rest of the chain.
    /// Blocks until the GPU is done; load time only.
    pub fn upload(ctx: &DeviceContext, allocator: &Allocator, data: &TextureData) -> Result<Self> {
        let (w, h) = (data.width(), data.height());
        let levels = mipmap::mip_levels(w, h);
        unsafe { mipmap::ensure_linear_blit(&ctx.instance, ctx.phys, TEXTURE_FORMAT)? };

        let image = allocator.create_image(
            &ImageDesc::new(
                vk::Extent2D {
                    width: w,
                    height: h,
                },
                TEXTURE_FORMAT,
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .mip_levels(levels),
        )?;
        allocator.upload_via_staging(UploadTarget::Image(&image), data.pixels())?;
        allocator
            .one_time_commands(|cmd| unsafe {
                mipmap::generate(&ctx.device, cmd, image.handle(), w, h, levels)
            })
            .context("generate mipmaps")?;

        let info = sampler_info(ctx.properties.limits.max_sampler_anisotropy, levels);
        let sampler = unsafe { ctx.device.create_sampler(&info, None) }.context("vkCreateSampler")?;
        info!("texture: {w}x{h}, {levels} mip levels");
        Ok(Self {
            device: ctx.device.clone(),
            image,
            sampler,
        })
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels()
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.sampler, None) };
    }
}

/// Device-local, immutable vertex + index buffers.
pub struct GpuMesh {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub index_count: u32,
}

impl GpuMesh {
    pub fn upload(allocator: &Allocator, mesh: &MeshData) -> Result<Self> {
        ensure!(!mesh.is_empty(), "mesh has no triangles");

        let vbytes = mesh.vertex_bytes();
        let ibytes = mesh.index_bytes();
        let vertices = allocator.create_buffer(
            vbytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryIntent::DeviceLocalPreferred,
        )?;
        let indices = allocator.create_buffer(
            ibytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryIntent::DeviceLocalPreferred,
        )?;
        allocator.upload_via_staging(UploadTarget::Buffer(&vertices), vbytes)?;
        allocator.upload_via_staging(UploadTarget::Buffer(&indices), ibytes)?;
        info!(
            "mesh: {} vertices, {} indices",
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(Self {
            vertices,
            indices,
            index_count: mesh.indices.len() as u32,
        })
    }
}
