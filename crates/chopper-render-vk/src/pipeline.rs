// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use chopper_render::Vertex;
use glam::Mat4;
use std::io::Cursor;
use tracing::debug;

/// Per-frame uniform block: shared by every object in the frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CameraUniforms {
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl CameraUniforms {
    pub fn new(view: Mat4, proj: Mat4) -> Self {
        Self {
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
        }
    }
}

/// Per-object model matrix, pushed before each draw.
pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<[[f32; 4]; 4]>() as u32;

/// SPIR-V for the mesh pipeline, decoded once and kept for rebuilds.
#[derive(Clone, Debug)]
pub struct ShaderCode {
    vertex: Vec<u32>,
    fragment: Vec<u32>,
}

impl ShaderCode {
    pub fn from_spirv(vertex: &[u8], fragment: &[u8]) -> Result<Self> {
        Ok(Self {
            vertex: read_spv(&mut Cursor::new(vertex)).context("vertex shader is not SPIR-V")?,
            fragment: read_spv(&mut Cursor::new(fragment))
                .context("fragment shader is not SPIR-V")?,
        })
    }

    /// The built-in textured mesh shaders compiled by build.rs.
    pub fn mesh() -> Result<Self> {
        Self::from_spirv(
            include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv")),
            include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv")),
        )
    }
}

/// Attachment formats the pipeline renders into; a change means a rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTargets {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

pub struct GraphicsPipeline {
    device: ash::Device,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    targets: RenderTargets,
}

fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 3] {
    let float3 = std::mem::size_of::<[f32; 3]>() as u32;
    [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: float3,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: 2 * float3,
        },
    ]
}

unsafe fn shader_module(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: words.as_ptr(),
        code_size: words.len() * 4,
        ..Default::default()
    };
    Ok(device.create_shader_module(&ci, None)?)
}

impl GraphicsPipeline {
    // STRICT: color_attachment_formats MUST match the swapchain format and
    // rasterization_samples the attachments' count. Rebuild when either moves.
    pub fn new(
        device: &ash::Device,
        shaders: &ShaderCode,
        targets: RenderTargets,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        unsafe {
            let vs = shader_module(device, &shaders.vertex)?;
            let fs = match shader_module(device, &shaders.fragment) {
                Ok(fs) => fs,
                Err(e) => {
                    device.destroy_shader_module(vs, None);
                    return Err(e);
                }
            };
            let result = Self::build(device, vs, fs, targets, set_layout);
            device.destroy_shader_module(vs, None);
            device.destroy_shader_module(fs, None);
            result
        }
    }

    unsafe fn build(
        device: &ash::Device,
        vs: vk::ShaderModule,
        fs: vk::ShaderModule,
        targets: RenderTargets,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        let entry = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: vs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
        ];

        let vb = vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        };
        let va = vertex_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            vertex_binding_description_count: 1,
            p_vertex_binding_descriptions: &vb,
            vertex_attribute_description_count: va.len() as u32,
            p_vertex_attribute_descriptions: va.as_ptr(),
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            ..Default::default()
        };
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };
        // Projection flips Y, so OBJ's counter-clockwise winding stays front facing.
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: targets.samples,
            ..Default::default()
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
            depth_test_enable: vk::TRUE,
            depth_write_enable: vk::TRUE,
            depth_compare_op: vk::CompareOp::LESS,
            ..Default::default()
        };
        let color_blend_att = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::RGBA,
            blend_enable: vk::FALSE,
            ..Default::default()
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &color_blend_att,
            ..Default::default()
        };

        let push = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: PUSH_CONSTANT_SIZE,
        };
        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            push_constant_range_count: 1,
            p_push_constant_ranges: &push,
            ..Default::default()
        };
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .context("vkCreatePipelineLayout")?;

        let rendering = vk::PipelineRenderingCreateInfo {
            s_type: vk::StructureType::PIPELINE_RENDERING_CREATE_INFO,
            color_attachment_count: 1,
            p_color_attachment_formats: &targets.color_format,
            depth_attachment_format: targets.depth_format,
            ..Default::default()
        };
        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            p_next: (&rendering as *const vk::PipelineRenderingCreateInfo<'_>).cast(),
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout,
            ..Default::default()
        };

        let pipeline = match device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        ) {
            Ok(p) => p[0],
            Err((_, err)) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(anyhow!("vkCreateGraphicsPipelines failed: {err:?}"));
            }
        };
        debug!("pipeline built for {:?}", targets);
        Ok(Self {
            device: device.clone(),
            layout,
            pipeline,
            targets,
        })
    }

    pub fn targets(&self) -> RenderTargets {
        self.targets
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Set 0: binding 0 = camera uniforms (vertex), binding 1 = texture (fragment).
/// One set per frame slot.
pub struct FrameDescriptors {
    device: ash::Device,
    pub layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
}

impl FrameDescriptors {
    pub fn new(device: &ash::Device, count: usize) -> Result<Self> {
        let bindings = [
            vk::DescriptorSetLayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
        ];
        unsafe {
            let layout = device
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo {
                        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
                        binding_count: bindings.len() as u32,
                        p_bindings: bindings.as_ptr(),
                        ..Default::default()
                    },
                    None,
                )
                .context("descriptor set layout")?;
            let mut out = Self {
                device: device.clone(),
                layout,
                pool: vk::DescriptorPool::null(),
                sets: Vec::new(),
            };

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: count as u32,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: count as u32,
                },
            ];
            out.pool = device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo {
                        s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
                        max_sets: count as u32,
                        pool_size_count: pool_sizes.len() as u32,
                        p_pool_sizes: pool_sizes.as_ptr(),
                        ..Default::default()
                    },
                    None,
                )
                .context("descriptor pool")?;

            let layouts = vec![layout; count];
            out.sets = device
                .allocate_descriptor_sets(&vk::DescriptorSetAllocateInfo {
                    s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
                    descriptor_pool: out.pool,
                    descriptor_set_count: count as u32,
                    p_set_layouts: layouts.as_ptr(),
                    ..Default::default()
                })
                .context("allocate descriptor sets")?;
            Ok(out)
        }
    }

    /// Points set `index` at its slot's uniform buffer and the shared texture.
    pub fn write(
        &self,
        index: usize,
        uniforms: vk::Buffer,
        texture_view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer: uniforms,
            offset: 0,
            range: std::mem::size_of::<CameraUniforms>() as vk::DeviceSize,
        };
        let image_info = vk::DescriptorImageInfo {
            sampler,
            image_view: texture_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let writes = [
            vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: self.sets[index],
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &buffer_info,
                ..Default::default()
            },
            vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: self.sets[index],
                dst_binding: 1,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: &image_info,
                ..Default::default()
            },
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }
}

impl Drop for FrameDescriptors {
    fn drop(&mut self) {
        unsafe {
            // Sets go with the pool.
            if self.pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.pool, None);
            }
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_match_vertex_layout() {
        let attrs = vertex_attributes();
        assert_eq!(attrs.map(|a| a.offset), [0, 12, 24]);
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(attrs[2].format, vk::Format::R32G32_SFLOAT);
    }

    #[test]
    fn uniform_block_is_two_matrices() {
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 128);
        assert_eq!(PUSH_CONSTANT_SIZE, 64);
        let u = CameraUniforms::new(Mat4::IDENTITY, Mat4::from_scale(glam::Vec3::splat(2.0)));
        assert_eq!(u.proj[0][0], 2.0);
        assert_eq!(bytemuck::bytes_of(&u).len(), 128);
    }

    #[test]
    fn garbage_is_not_spirv() {
        assert!(ShaderCode::from_spirv(&[1, 2, 3], &[]).is_err());
    }
}
