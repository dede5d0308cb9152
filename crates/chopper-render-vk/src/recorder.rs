// SPDX-License-Identifier: CEPL-1.0
use crate::allocator::GpuImage;
use crate::barrier::{self, Transition};
use crate::pipeline::GraphicsPipeline;
use crate::texture::GpuMesh;
use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;

/// What an overlay needs to record into the frame's render pass.
#[derive(Clone, Copy)]
pub struct OverlayContext<'a> {
    pub device: &'a ash::Device,
    pub command_buffer: vk::CommandBuffer,
    pub frame_index: usize,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub extent: vk::Extent2D,
}

/// UI drawn on top of the scene, inside the same dynamic render pass.
pub trait UiOverlay {
    fn record(&mut self, ctx: &OverlayContext<'_>) -> Result<()>;
}

/// Everything one frame's command buffer references.
pub struct FrameRecording<'a> {
    pub cmd: vk::CommandBuffer,
    pub frame_index: usize,
    pub swapchain_image: vk::Image,
    pub swapchain_view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Multisampled target; `None` renders straight into the swapchain image.
    pub color_target: Option<&'a GpuImage>,
    pub depth: &'a GpuImage,
    pub pipeline: &'a GraphicsPipeline,
    pub descriptor_set: vk::DescriptorSet,
    pub mesh: &'a GpuMesh,
    pub models: &'a [Mat4],
    pub clear_color: [f32; 4],
}

pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Color attachment for the pass: the MSAA target resolving into the
/// swapchain view, or the swapchain view itself.
fn color_attachment(rec: &FrameRecording<'_>) -> vk::RenderingAttachmentInfo<'static> {
    let clear_value = vk::ClearValue {
        color: vk::ClearColorValue {
            float32: rec.clear_color,
        },
    };
    let base = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        clear_value,
        ..Default::default()
    };
    match rec.color_target {
        Some(msaa) => vk::RenderingAttachmentInfo {
            image_view: msaa.view(),
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            resolve_mode: vk::ResolveModeFlags::AVERAGE,
            resolve_image_view: rec.swapchain_view,
            resolve_image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..base
        },
        None => vk::RenderingAttachmentInfo {
            image_view: rec.swapchain_view,
            store_op: vk::AttachmentStoreOp::STORE,
            ..base
        },
    }
}

/// Records one frame.
///
/// STRICT ORDER:
/// 1) swapchain image UNDEFINED -> COLOR_ATTACHMENT (contents discarded)
/// 2) MSAA color and depth targets UNDEFINED -> attachment layouts
/// 3) dynamic rendering with clears, one indexed draw per model
/// 4) overlay inside the same pass
/// 5) swapchain image COLOR_ATTACHMENT -> PRESENT_SRC
pub unsafe fn record_frame<O: UiOverlay + ?Sized>(
    device: &ash::Device,
    rec: &FrameRecording<'_>,
    overlay: Option<&mut O>,
) -> Result<()> {
    use vk::ImageLayout as L;
    let cmd = rec.cmd;

    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    device
        .begin_command_buffer(cmd, &begin)
        .context("vkBeginCommandBuffer")?;

    let mut pre = vec![Transition::whole(
        rec.swapchain_image,
        L::UNDEFINED,
        L::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageAspectFlags::COLOR,
    )];
    if let Some(msaa) = rec.color_target {
        pre.push(Transition::whole(
            msaa.handle(),
            L::UNDEFINED,
            L::COLOR_ATTACHMENT_OPTIMAL,
            msaa.aspect(),
        ));
    }
    pre.push(Transition::whole(
        rec.depth.handle(),
        L::UNDEFINED,
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        rec.depth.aspect(),
    ));
    barrier::record(device, cmd, &pre)?;

    let color_att = color_attachment(rec);
    let depth_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: rec.depth.view(),
        image_layout: L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        clear_value: vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
        ..Default::default()
    };
    let area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: rec.extent,
    };
    let rendering_info = vk::RenderingInfo {
        s_type: vk::StructureType::RENDERING_INFO,
        render_area: area,
        layer_count: 1,
        color_attachment_count: 1,
        p_color_attachments: &color_att,
        p_depth_attachment: &depth_att,
        ..Default::default()
    };
    device.cmd_begin_rendering(cmd, &rendering_info);

    let pipe = rec.pipeline;
    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipe.pipeline);
    device.cmd_set_viewport(cmd, 0, &[full_viewport(rec.extent)]);
    device.cmd_set_scissor(cmd, 0, &[area]);
    device.cmd_bind_vertex_buffers(cmd, 0, &[rec.mesh.vertices.handle()], &[0]);
    device.cmd_bind_index_buffer(cmd, rec.mesh.indices.handle(), 0, vk::IndexType::UINT32);
    device.cmd_bind_descriptor_sets(
        cmd,
        vk::PipelineBindPoint::GRAPHICS,
        pipe.layout,
        0,
        &[rec.descriptor_set],
        &[],
    );

    for model in rec.models {
        device.cmd_push_constants(
            cmd,
            pipe.layout,
            vk::ShaderStageFlags::VERTEX,
            0,
            bytemuck::bytes_of(&model.to_cols_array()),
        );
        device.cmd_draw_indexed(cmd, rec.mesh.index_count, 1, 0, 0, 0);
    }

    if let Some(overlay) = overlay {
        let targets = pipe.targets();
        overlay.record(&OverlayContext {
            device,
            command_buffer: cmd,
            frame_index: rec.frame_index,
            color_format: targets.color_format,
            depth_format: targets.depth_format,
            samples: targets.samples,
            extent: rec.extent,
        })?;
    }

    device.cmd_end_rendering(cmd);

    barrier::transition(
        device,
        cmd,
        Transition::whole(
            rec.swapchain_image,
            L::COLOR_ATTACHMENT_OPTIMAL,
            L::PRESENT_SRC_KHR,
            vk::ImageAspectFlags::COLOR,
        ),
    )?;

    device
        .end_command_buffer(cmd)
        .context("vkEndCommandBuffer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_covers_extent_without_flip() {
        let vp = full_viewport(vk::Extent2D {
            width: 1920,
            height: 1080,
        });
        assert_eq!((vp.x, vp.y), (0.0, 0.0));
        assert_eq!((vp.width, vp.height), (1920.0, 1080.0));
        assert_eq!((vp.min_depth, vp.max_depth), (0.0, 1.0));
    }
}
