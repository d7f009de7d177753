use std::fs;
use std::mem::size_of;
use std::path::Path;
use std::rc::Rc;

use anyhow::Result;
use log::*;
use nalgebra_glm as glm;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::Handle;

use crate::config::MIN_SAMPLE_SHADING;
use crate::device::DeviceContext;
use crate::dynamic_state::DYNAMIC_STATE_POLYGON_MODE;
use crate::error::{LoadError, RenderError};
use crate::model::Vertex;

/// Rasterization mode of the main pipeline, switched at runtime.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PolygonMode {
    #[default]
    Fill,
    Wireframe,
}

impl PolygonMode {
    pub fn toggled(self) -> Self {
        match self {
            PolygonMode::Fill => PolygonMode::Wireframe,
            PolygonMode::Wireframe => PolygonMode::Fill,
        }
    }

    pub fn vk(self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Wireframe => vk::PolygonMode::LINE,
        }
    }
}

/// Pipelines the main pass switches between for the polygon mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolygonPipelines {
    /// A single pipeline; the mode is set while recording.
    Dynamic(vk::Pipeline),
    Fixed { fill: vk::Pipeline, wireframe: vk::Pipeline },
}

impl PolygonPipelines {
    pub fn pipeline(&self, mode: PolygonMode) -> vk::Pipeline {
        match (self, mode) {
            (PolygonPipelines::Dynamic(pipeline), _) => *pipeline,
            (PolygonPipelines::Fixed { fill, .. }, PolygonMode::Fill) => *fill,
            (PolygonPipelines::Fixed { wireframe, .. }, PolygonMode::Wireframe) => *wireframe,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, PolygonPipelines::Dynamic(_))
    }

    fn handles(&self) -> Vec<vk::Pipeline> {
        match self {
            PolygonPipelines::Dynamic(pipeline) => vec![*pipeline],
            PolygonPipelines::Fixed { fill, wireframe } => vec![*fill, *wireframe],
        }
    }
}

/// Dynamic states of the main pipeline.
pub fn dynamic_states(dynamic_polygon_mode: bool) -> Vec<vk::DynamicState> {
    let mut states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    if dynamic_polygon_mode {
        states.push(DYNAMIC_STATE_POLYGON_MODE);
    }
    states
}

/// Reads precompiled shader bytecode from disk.
pub fn read_shader(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|source| LoadError::Unreadable { path: path.to_path_buf(), source })
}

/// Reinterprets SPIR-V bytes as native-endian words.
pub fn spirv_words(bytecode: &[u8]) -> Result<Vec<u32>, RenderError> {
    if bytecode.is_empty() || bytecode.len() % 4 != 0 {
        return Err(RenderError::ShaderCompile(format!(
            "bytecode length {} is not a positive multiple of 4",
            bytecode.len()
        )));
    }
    Ok(bytecode
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub unsafe fn create_shader_module(device: &Device, bytecode: &[u8]) -> Result<vk::ShaderModule> {
    let code = spirv_words(bytecode)?;
    let info = vk::ShaderModuleCreateInfo::builder()
        .code_size(bytecode.len())
        .code(&code);
    Ok(device
        .create_shader_module(&info, None)
        .map_err(|e| RenderError::ShaderCompile(e.to_string()))?)
}

/// Destroys a shader module once pipelines have been built from it.
struct ShaderModule<'a> {
    device: &'a Device,
    handle: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    unsafe fn load(device: &'a Device, path: &Path) -> Result<Self> {
        let bytecode = read_shader(path)?;
        let handle = create_shader_module(device, &bytecode)?;
        Ok(Self { device, handle })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}

/// Render passes, layouts and pipelines. Independent of the swapchain extent.
pub struct FrameGraph {
    ctx: Rc<DeviceContext>,
    pub render_pass: vk::RenderPass,
    pub overlay_render_pass: vk::RenderPass,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipelines: PolygonPipelines,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

impl FrameGraph {
    pub unsafe fn create(
        ctx: &Rc<DeviceContext>,
        color_format: vk::Format,
        vertex_shader: &Path,
        fragment_shader: &Path,
    ) -> Result<Self> {
        // Handles start null so a partial failure only releases what exists.
        let mut graph = Self {
            ctx: ctx.clone(),
            render_pass: vk::RenderPass::null(),
            overlay_render_pass: vk::RenderPass::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipelines: PolygonPipelines::Fixed {
                fill: vk::Pipeline::null(),
                wireframe: vk::Pipeline::null(),
            },
            color_format,
            depth_format: ctx.depth_format()?,
        };

        graph.render_pass = graph.create_render_pass()?;
        graph.overlay_render_pass = graph.create_overlay_render_pass()?;
        graph.descriptor_set_layout = graph.create_descriptor_set_layout()?;
        graph.pipeline_layout = graph.create_pipeline_layout()?;

        let device = ctx.device();
        let vert = ShaderModule::load(device, vertex_shader)?;
        let frag = ShaderModule::load(device, fragment_shader)?;
        if ctx.dynamic_polygon_mode.is_available() {
            let pipeline = graph.create_pipeline(vert.handle, frag.handle, PolygonMode::Fill, true)?;
            graph.pipelines = PolygonPipelines::Dynamic(pipeline);
            ctx.name(vk::ObjectType::PIPELINE, pipeline.as_raw(), "Graphics Pipeline");
        } else {
            let fill = graph.create_pipeline(vert.handle, frag.handle, PolygonMode::Fill, false)?;
            graph.pipelines = PolygonPipelines::Fixed { fill, wireframe: vk::Pipeline::null() };
            let wireframe =
                graph.create_pipeline(vert.handle, frag.handle, PolygonMode::Wireframe, false)?;
            graph.pipelines = PolygonPipelines::Fixed { fill, wireframe };
            ctx.name(vk::ObjectType::PIPELINE, fill.as_raw(), "Graphics Pipeline (Fill)");
            ctx.name(vk::ObjectType::PIPELINE, wireframe.as_raw(), "Graphics Pipeline (Wireframe)");
        }

        ctx.name(vk::ObjectType::RENDER_PASS, graph.render_pass.as_raw(), "Main Render Pass");
        ctx.name(vk::ObjectType::RENDER_PASS, graph.overlay_render_pass.as_raw(), "Overlay Render Pass");

        debug!(
            "Created frame graph (color {:?}, depth {:?}, {:?}, dynamic polygon mode: {}).",
            color_format,
            graph.depth_format,
            ctx.msaa_samples,
            graph.pipelines.is_dynamic()
        );
        Ok(graph)
    }

    unsafe fn create_render_pass(&self) -> Result<vk::RenderPass> {
        let samples = self.ctx.msaa_samples;

        let color_attachment = vk::AttachmentDescription::builder()
            .format(self.color_format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let depth_stencil_attachment = vk::AttachmentDescription::builder()
            .format(self.depth_format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let color_resolve_attachment = vk::AttachmentDescription::builder()
            .format(self.color_format)
            .samples(vk::SampleCountFlags::_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_stencil_attachment_ref = vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        let color_resolve_attachment_ref = vk::AttachmentReference::builder()
            .attachment(2)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let color_attachments = &[color_attachment_ref];
        let resolve_attachments = &[color_resolve_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .depth_stencil_attachment(&depth_stencil_attachment_ref)
            .resolve_attachments(resolve_attachments);

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let attachments = &[color_attachment, depth_stencil_attachment, color_resolve_attachment];
        let subpasses = &[subpass];
        let dependencies = &[dependency];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        Ok(self.ctx.device().create_render_pass(&info, None)?)
    }

    /// Draws on top of the resolved image, which stays presentable.
    unsafe fn create_overlay_render_pass(&self) -> Result<vk::RenderPass> {
        let attachment = vk::AttachmentDescription::builder()
            .format(self.color_format)
            .samples(vk::SampleCountFlags::_1)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let color_attachments = &[attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments);

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );

        let attachments = &[attachment];
        let subpasses = &[subpass];
        let dependencies = &[dependency];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        Ok(self.ctx.device().create_render_pass(&info, None)?)
    }

    unsafe fn create_descriptor_set_layout(&self) -> Result<vk::DescriptorSetLayout> {
        let ubo_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX);
        let sampler_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);

        let bindings = &[ubo_binding, sampler_binding];
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        Ok(self.ctx.device().create_descriptor_set_layout(&info, None)?)
    }

    unsafe fn create_pipeline_layout(&self) -> Result<vk::PipelineLayout> {
        let model_push_constant = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(size_of::<glm::Mat4>() as u32);

        let set_layouts = &[self.descriptor_set_layout];
        let push_constant_ranges = &[model_push_constant];
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        Ok(self.ctx.device().create_pipeline_layout(&info, None)?)
    }

    unsafe fn create_pipeline(
        &self,
        vert: vk::ShaderModule,
        frag: vk::ShaderModule,
        polygon_mode: PolygonMode,
        dynamic_polygon_mode: bool,
    ) -> Result<vk::Pipeline> {
        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert)
            .name(b"main\0");
        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag)
            .name(b"main\0");

        let binding_descriptions = &[Vertex::binding_description()];
        let attribute_descriptions = Vertex::attribute_descriptions();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; these only fix the counts.
        let viewports = &[vk::Viewport::builder().width(1.0).height(1.0).max_depth(1.0)];
        let scissors = &[vk::Rect2D::builder().extent(vk::Extent2D { width: 1, height: 1 })];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(viewports)
            .scissors(scissors);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(polygon_mode.vk())
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(true)
            .min_sample_shading(MIN_SAMPLE_SHADING)
            .rasterization_samples(self.ctx.msaa_samples);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::all())
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD);
        let attachments = &[attachment];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(attachments)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = dynamic_states(dynamic_polygon_mode);
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let stages = &[vert_stage, frag_stage];
        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(self.pipeline_layout)
            .render_pass(self.render_pass)
            .subpass(0);

        Ok(self
            .ctx
            .device()
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)?
            .0)
    }
}

impl Drop for FrameGraph {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            for pipeline in self.pipelines.handles() {
                device.destroy_pipeline(pipeline, None);
            }
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            device.destroy_render_pass(self.overlay_render_pass, None);
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_mode_toggles_between_fill_and_wireframe() {
        let mode = PolygonMode::default();
        assert_eq!(mode, PolygonMode::Fill);
        assert_eq!(mode.toggled(), PolygonMode::Wireframe);
        assert_eq!(mode.toggled().toggled(), PolygonMode::Fill);
        assert_eq!(PolygonMode::Wireframe.vk(), vk::PolygonMode::LINE);
    }

    #[test]
    fn fixed_pipelines_follow_the_polygon_mode() {
        let fill = vk::Pipeline::from_raw(1);
        let wireframe = vk::Pipeline::from_raw(2);
        let fixed = PolygonPipelines::Fixed { fill, wireframe };
        assert!(!fixed.is_dynamic());
        assert_eq!(fixed.pipeline(PolygonMode::Fill), fill);
        assert_eq!(fixed.pipeline(PolygonMode::Wireframe), wireframe);

        let dynamic = PolygonPipelines::Dynamic(fill);
        assert!(dynamic.is_dynamic());
        assert_eq!(dynamic.pipeline(PolygonMode::Wireframe), fill);
        assert_eq!(dynamic.handles(), vec![fill]);
    }

    #[test]
    fn polygon_mode_is_dynamic_only_when_supported() {
        assert_eq!(dynamic_states(false), vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]);
        assert_eq!(dynamic_states(true).last(), Some(&DYNAMIC_STATE_POLYGON_MODE));
    }

    #[test]
    fn spirv_bytes_become_words() {
        let bytes = 0x0723_0203u32.to_ne_bytes();
        assert_eq!(spirv_words(&bytes).unwrap(), vec![0x0723_0203]);
    }

    #[test]
    fn misaligned_bytecode_is_rejected() {
        for bytes in [&[][..], &[1, 2, 3][..], &[0; 7][..]] {
            assert!(matches!(spirv_words(bytes), Err(RenderError::ShaderCompile(_))));
        }
    }

    #[test]
    fn missing_shader_file_names_the_path() {
        let error = read_shader(Path::new("no/such/shader.spv")).unwrap_err();
        assert!(error.to_string().contains("no/such/shader.spv"));
    }
}
