// Graphics pipeline creation
//
// Pipelines target dynamic rendering (Vulkan 1.3), so attachment formats
// come from PipelineCreateInfo rather than a render pass. Viewport and
// scissor are dynamic state set per view.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;

use super::shader::VulkanShader;
use super::{convert, VulkanDevice};
use crate::backend::handles::{ResourceTable, ShaderHandle};
use crate::backend::types::PipelineCreateInfo;

const ENTRY_POINT: &CStr = c"main";

pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub info: PipelineCreateInfo,
}

impl VulkanPipeline {
    pub fn new(
        device: &VulkanDevice,
        info: &PipelineCreateInfo,
        shaders: &ResourceTable<ShaderHandle, VulkanShader>,
    ) -> Result<Self> {
        // Shader stages
        let shader_stages = info
            .shaders
            .iter()
            .map(|&handle| {
                let shader = shaders.get(handle)?;
                Ok(vk::PipelineShaderStageCreateInfo::builder()
                    .stage(convert::shader_stage(shader.stage))
                    .module(shader.module)
                    .name(ENTRY_POINT)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;

        // Descriptor set layout, one binding per entry
        let set_bindings: Vec<vk::DescriptorSetLayoutBinding> = info
            .layout
            .iter()
            .map(|d| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(d.binding_index)
                    .descriptor_type(convert::descriptor_type(d))
                    .descriptor_count(1)
                    .stage_flags(convert::shader_stage(d.stage))
                    .build()
            })
            .collect();
        let set_layout_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(&set_bindings);
        let set_layout =
            unsafe { device.device.create_descriptor_set_layout(&set_layout_info, None) }
                .context("Failed to create descriptor set layout")?;

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = match unsafe { device.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e).context("Failed to create pipeline layout");
            }
        };

        // Vertex input
        let bindings: Vec<vk::VertexInputBindingDescription> = info
            .vertex_input_state
            .bindings
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::builder()
                    .binding(b.binding_index)
                    .stride(b.stride as u32)
                    .input_rate(vk::VertexInputRate::VERTEX)
                    .build()
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = info
            .vertex_input_state
            .attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::builder()
                    .location(a.attrib_index)
                    .binding(a.binding_index)
                    .format(convert::vertex_format(a.vertex_type))
                    .offset(a.offset as u32)
                    .build()
            })
            .collect();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(convert::topology(info.input_assembly_state.topology))
            .primitive_restart_enable(info.input_assembly_state.primitive_restart_enable);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // Rasterization
        let rs = &info.rasterisation_state;
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(rs.depth_clamp_enable)
            .rasterizer_discard_enable(rs.rasteriser_discard_enable)
            .polygon_mode(convert::polygon_mode(rs.polygon_mode))
            .cull_mode(convert::cull_mode(rs.cull_mode))
            .front_face(convert::front_face(rs.front_face))
            .depth_bias_enable(rs.depth_bias_enable)
            .depth_bias_constant_factor(rs.depth_bias_constant_factor)
            .depth_bias_clamp(rs.depth_bias_clamp)
            .depth_bias_slope_factor(rs.depth_bias_slope_factor)
            .line_width(rs.line_width);

        // Multisampling
        let ms = &info.multisample_state;
        let sample_mask = [ms.sample_mask];
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(convert::sample_count(ms.rasterisation_samples))
            .sample_shading_enable(ms.sample_shading_enable)
            .min_sample_shading(ms.min_sample_shading)
            .sample_mask(&sample_mask)
            .alpha_to_coverage_enable(ms.alpha_to_coverage_enable)
            .alpha_to_one_enable(ms.alpha_to_one_enable);

        // Depth / stencil
        let ds = &info.depth_stencil_state;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(ds.depth_test_enable)
            .depth_write_enable(ds.depth_write_enable)
            .depth_compare_op(convert::compare_op(ds.depth_compare_op))
            .depth_bounds_test_enable(ds.depth_bounds_test_enable)
            .stencil_test_enable(ds.stencil_test_enable)
            .front(convert::stencil_op_state(&ds.front))
            .back(convert::stencil_op_state(&ds.back))
            .min_depth_bounds(ds.min_depth_bounds)
            .max_depth_bounds(ds.max_depth_bounds);

        // Colour blending
        let cb = &info.colour_blend_state;
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = cb
            .attachments
            .iter()
            .map(|a| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .blend_enable(a.blend_enable)
                    .src_color_blend_factor(convert::blend_factor(a.src_colour_blend_factor))
                    .dst_color_blend_factor(convert::blend_factor(a.dst_colour_blend_factor))
                    .color_blend_op(convert::blend_op(a.colour_blend_op))
                    .src_alpha_blend_factor(convert::blend_factor(a.src_alpha_blend_factor))
                    .dst_alpha_blend_factor(convert::blend_factor(a.dst_alpha_blend_factor))
                    .alpha_blend_op(convert::blend_op(a.alpha_blend_op))
                    .color_write_mask(convert::colour_mask(a.colour_write_mask))
                    .build()
            })
            .collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(cb.logic_op_enable)
            .logic_op(convert::logic_op(cb.logic_op))
            .attachments(&blend_attachments)
            .blend_constants(cb.blend_constants);

        // Attachment formats for dynamic rendering
        let colour_formats: Vec<vk::Format> =
            info.colour_formats.iter().map(|&f| convert::format(f)).collect();
        let depth_format = convert::format(info.depth_format);
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&colour_formats)
            .depth_attachment_format(depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe {
                    device.device.destroy_pipeline_layout(layout, None);
                    device.device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(e).context("Failed to create graphics pipeline");
            }
        };

        Ok(Self {
            pipeline,
            layout,
            set_layout,
            info: info.clone(),
        })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
            device.device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}
