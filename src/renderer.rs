use std::ffi::c_void;
use std::mem::size_of;
use std::path::Path;
use std::ptr::copy_nonoverlapping as memcpy;
use std::rc::Rc;
use std::slice;

use anyhow::{anyhow, Result};
use log::*;
use nalgebra_glm as glm;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::Handle;

use crate::camera::UniformBufferObject;
use crate::config::{Settings, CLEAR_COLOR, CLEAR_DEPTH, MAX_FRAMES_IN_FLIGHT};
use crate::descriptors::{DescriptorManager, TextureBinding};
use crate::device::DeviceContext;
use crate::error::RenderError;
use crate::frame_graph::{FrameGraph, PolygonMode};
use crate::instance::VulkanInstance;
use crate::model::{Model, Transform};
use crate::overlay::{FrameStats, Overlay, OverlayContext};
use crate::resources::{Buffer, ResourceManager};
use crate::scheduler::{AcquireStatus, FrameBackend, PresentStatus, RecreateOutcome};
use crate::swapchain::{Presentation, RenderTargets, Swapchain, SwapchainPlan};

const GEOMETRY_LABEL_COLOR: [f32; 4] = [0.2, 0.6, 1.0, 1.0];
const OVERLAY_LABEL_COLOR: [f32; 4] = [1.0, 0.8, 0.2, 1.0];

/// Per-slot command buffer, uniform buffer and synchronization objects.
struct FrameSlot {
    uniform_buffer: Buffer,
    /// Persistently mapped, host-coherent.
    uniforms: *mut c_void,
    command_buffer: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

/// The frame slots and the pool their command buffers come from.
struct Frames {
    ctx: Rc<DeviceContext>,
    command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
}

impl Frames {
    unsafe fn create(ctx: &Rc<DeviceContext>, resources: &ResourceManager, count: usize) -> Result<Self> {
        let device = ctx.device();
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.queue_families.graphics);
        let mut frames = Self {
            ctx: ctx.clone(),
            command_pool: device.create_command_pool(&info, None)?,
            slots: Vec::with_capacity(count),
        };

        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(frames.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let command_buffers = device.allocate_command_buffers(&info)?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        for (i, command_buffer) in command_buffers.into_iter().enumerate() {
            let uniform_buffer = resources.create_buffer(
                size_of::<UniformBufferObject>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let uniforms = uniform_buffer.map()?;
            // Pushed before the sync objects so a failure below still releases them.
            frames.slots.push(FrameSlot {
                uniform_buffer,
                uniforms,
                command_buffer,
                image_available: vk::Semaphore::null(),
                render_finished: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
            });
            let slot = frames.slots.last_mut().ok_or_else(|| anyhow!("Frame slot vanished."))?;
            slot.image_available = device.create_semaphore(&semaphore_info, None)?;
            slot.render_finished = device.create_semaphore(&semaphore_info, None)?;
            slot.in_flight = device.create_fence(&fence_info, None)?;

            ctx.name(vk::ObjectType::BUFFER, slot.uniform_buffer.buffer.as_raw(), &format!("Uniform Buffer {}", i));
            ctx.name(vk::ObjectType::COMMAND_BUFFER, command_buffer.as_raw() as u64, &format!("Frame Command Buffer {}", i));
            ctx.name(vk::ObjectType::SEMAPHORE, slot.image_available.as_raw(), &format!("Image Available {}", i));
            ctx.name(vk::ObjectType::SEMAPHORE, slot.render_finished.as_raw(), &format!("Render Finished {}", i));
            ctx.name(vk::ObjectType::FENCE, slot.in_flight.as_raw(), &format!("In Flight {}", i));
        }

        Ok(frames)
    }

    fn uniform_buffers(&self) -> Vec<vk::Buffer> {
        self.slots.iter().map(|s| s.uniform_buffer.buffer).collect()
    }
}

impl Drop for Frames {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            for slot in &self.slots {
                device.destroy_fence(slot.in_flight, None);
                device.destroy_semaphore(slot.render_finished, None);
                device.destroy_semaphore(slot.image_available, None);
            }
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Owns every GPU object of the application and performs the steps of a frame.
///
/// Field order is teardown order.
pub struct Renderer {
    overlay: Box<dyn Overlay>,
    models: Vec<Model>,
    descriptors: DescriptorManager,
    frames: Frames,
    presentation: Option<Presentation>,
    graph: FrameGraph,
    resources: ResourceManager,
    ctx: Rc<DeviceContext>,
    settings: Settings,
    images_in_flight: Vec<vk::Fence>,
    polygon_mode: PolygonMode,
    framebuffer: vk::Extent2D,
    view: glm::Mat4,
    stats: FrameStats,
}

impl Renderer {
    /// Builds the device, swapchain, pipeline and the default model.
    pub unsafe fn create(
        instance: VulkanInstance,
        settings: &Settings,
        framebuffer: vk::Extent2D,
        mut overlay: Box<dyn Overlay>,
    ) -> Result<Self> {
        let ctx = DeviceContext::create(Rc::new(instance))?;
        let resources = ResourceManager::create(&ctx)?;

        let swapchain = Swapchain::create(&ctx, framebuffer)?;
        let graph = FrameGraph::create(
            &ctx,
            swapchain.format,
            &settings.vertex_shader,
            &settings.fragment_shader,
        )?;
        let targets = RenderTargets::create(&ctx, &resources, &swapchain, &graph)?;
        let images_in_flight = vec![vk::Fence::null(); swapchain.image_count()];
        let presentation = Presentation { targets, swapchain };

        let frames = Frames::create(&ctx, &resources, MAX_FRAMES_IN_FLIGHT)?;
        let model = Model::load(&resources, &settings.model, &settings.texture, Transform::default())?;
        let models = vec![model];
        let descriptors = DescriptorManager::create(
            &ctx,
            graph.descriptor_set_layout,
            &frames.uniform_buffers(),
            &texture_bindings(&models),
        )?;
        overlay.pool_replaced(descriptors.pool());

        Ok(Self {
            overlay,
            models,
            descriptors,
            frames,
            presentation: Some(presentation),
            graph,
            resources,
            ctx,
            settings: settings.clone(),
            images_in_flight,
            polygon_mode: PolygonMode::default(),
            framebuffer,
            view: glm::identity(),
            stats: FrameStats::default(),
        })
    }

    /// Sets the state the next frame is rendered with.
    pub fn prepare(&mut self, view: glm::Mat4, stats: FrameStats) {
        self.view = view;
        self.stats = stats;
    }

    /// Records the new window size; the swapchain follows on recreation.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.framebuffer = vk::Extent2D { width, height };
    }

    pub fn toggle_polygon_mode(&mut self) -> PolygonMode {
        self.polygon_mode = self.polygon_mode.toggled();
        self.polygon_mode
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn descriptor_sets(&self) -> usize {
        self.descriptors.live_sets()
    }

    /// Loads a model and makes it part of the next frame.
    pub unsafe fn add_model(&mut self, mesh: &Path, texture: &Path, transform: Transform) -> Result<&Model> {
        let model = Model::load(&self.resources, mesh, texture, transform)?;
        self.ctx.device().device_wait_idle()?;
        self.models.push(model);
        if let Err(error) = self.rebuild_descriptors() {
            // Keep sets and models in step: drop the newcomer and rebind the rest.
            self.models.pop();
            if let Err(restore) = self.rebuild_descriptors() {
                error!("Restoring descriptor sets failed; models without sets are skipped: {:#}", restore);
            }
            return Err(error);
        }
        self.models.last().ok_or_else(|| anyhow!("Model list is empty."))
    }

    /// Drops the most recently added model, returning its name.
    pub unsafe fn remove_model(&mut self) -> Result<Option<String>> {
        if self.models.is_empty() {
            return Ok(None);
        }
        self.ctx.device().device_wait_idle()?;
        let model = self.models.pop().map(|m| m.name.clone());
        self.rebuild_descriptors()?;
        Ok(model)
    }

    /// The overlay hears about the new pool even when allocation fails.
    unsafe fn rebuild_descriptors(&mut self) -> Result<()> {
        let result = self.descriptors.rebuild(
            self.graph.descriptor_set_layout,
            &self.frames.uniform_buffers(),
            &texture_bindings(&self.models),
        );
        self.overlay.pool_replaced(self.descriptors.pool());
        result
    }

    fn presentation(&self) -> Result<&Presentation> {
        self.presentation
            .as_ref()
            .ok_or_else(|| anyhow!("No swapchain; the last recreation failed."))
    }

    unsafe fn rebuild_presentation(&mut self) -> Result<RecreateOutcome> {
        let support = self.ctx.swapchain_support()?;
        let plan = SwapchainPlan::new(&support, self.framebuffer)?;
        if plan.extent.width == 0 || plan.extent.height == 0 {
            debug!("Surface has no area; deferring swapchain recreation.");
            return Ok(RecreateOutcome::Deferred);
        }

        self.ctx.device().device_wait_idle()?;
        self.presentation = None;

        let swapchain = Swapchain::create(&self.ctx, self.framebuffer)?;
        if swapchain.format != self.graph.color_format {
            info!(
                "Surface format changed from {:?} to {:?}; rebuilding pipeline.",
                self.graph.color_format, swapchain.format
            );
            self.graph = FrameGraph::create(
                &self.ctx,
                swapchain.format,
                &self.settings.vertex_shader,
                &self.settings.fragment_shader,
            )?;
            self.rebuild_descriptors()?;
        }
        info!(
            "Swapchain recreated at {}x{} ({:?}).",
            swapchain.extent.width, swapchain.extent.height, swapchain.present_mode
        );
        let targets = RenderTargets::create(&self.ctx, &self.resources, &swapchain, &self.graph)?;
        self.images_in_flight = vec![vk::Fence::null(); swapchain.image_count()];
        self.presentation = Some(Presentation { targets, swapchain });
        Ok(RecreateOutcome::Recreated)
    }

    unsafe fn record_commands(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let presentation = self
            .presentation
            .as_ref()
            .ok_or_else(|| anyhow!("No swapchain; the last recreation failed."))?;
        let device = self.ctx.device();
        let instance = self.ctx.instance();
        let debug = self.ctx.debug();
        let command_buffer = self.frames.slots[slot].command_buffer;
        let extent = presentation.extent();
        let image = image_index as usize;

        device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(command_buffer, &info)?;

        let render_area = vk::Rect2D { offset: vk::Offset2D::default(), extent };

        // Geometry
        debug.begin_label(instance, command_buffer, "Geometry Pass", GEOMETRY_LABEL_COLOR);
        let color_clear_value = vk::ClearValue {
            color: vk::ClearColorValue { float32: CLEAR_COLOR },
        };
        let depth_clear_value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: CLEAR_DEPTH, stencil: 0 },
        };
        let clear_values = &[color_clear_value, depth_clear_value, color_clear_value];
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.graph.render_pass)
            .framebuffer(presentation.targets.framebuffers[image])
            .render_area(render_area)
            .clear_values(clear_values);
        device.cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);

        device.cmd_bind_pipeline(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            self.graph.pipelines.pipeline(self.polygon_mode),
        );
        if self.graph.pipelines.is_dynamic() {
            self.ctx.dynamic_polygon_mode.set(command_buffer, self.polygon_mode);
        }
        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        device.cmd_set_viewport(command_buffer, 0, &[viewport]);
        device.cmd_set_scissor(command_buffer, 0, &[render_area]);

        for (i, model) in self.models.iter().enumerate() {
            let set = match self.descriptors.set(slot, i) {
                Some(set) => set,
                None => {
                    trace!("No descriptor set for model {}; skipping its draw.", i);
                    continue;
                }
            };
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[model.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(command_buffer, model.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.graph.pipeline_layout,
                0,
                &[set],
                &[],
            );
            let matrix = model.transform.matrix();
            let bytes = slice::from_raw_parts(&matrix as *const glm::Mat4 as *const u8, size_of::<glm::Mat4>());
            device.cmd_push_constants(
                command_buffer,
                self.graph.pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytes,
            );
            device.cmd_draw_indexed(command_buffer, model.index_count, 1, 0, 0, 0);
        }

        device.cmd_end_render_pass(command_buffer);
        debug.end_label(instance, command_buffer);

        // Overlay
        debug.begin_label(instance, command_buffer, "Overlay Pass", OVERLAY_LABEL_COLOR);
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.graph.overlay_render_pass)
            .framebuffer(presentation.targets.overlay_framebuffers[image])
            .render_area(render_area);
        device.cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);
        let overlay_ctx = OverlayContext {
            device,
            command_buffer,
            extent,
            slot,
            descriptor_pool: self.descriptors.pool(),
            stats: &self.stats,
            models: &self.models,
            polygon_mode: self.polygon_mode,
        };
        self.overlay.record(&overlay_ctx)?;
        device.cmd_end_render_pass(command_buffer);
        debug.end_label(instance, command_buffer);

        device.end_command_buffer(command_buffer)?;
        Ok(())
    }
}

impl FrameBackend for Renderer {
    fn wait_for_frame(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames.slots[slot].in_flight;
        unsafe { self.ctx.device().wait_for_fences(&[fence], true, u64::MAX)? };
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireStatus> {
        let semaphore = self.frames.slots[slot].image_available;
        unsafe { self.presentation()?.swapchain.acquire_next_image(semaphore, u64::MAX) }
    }

    fn begin_frame(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let device = self.ctx.device();
        let fence = self.frames.slots[slot].in_flight;
        let image_fence = self.images_in_flight[image_index as usize];
        unsafe {
            if !image_fence.is_null() && image_fence != fence {
                device.wait_for_fences(&[image_fence], true, u64::MAX)?;
            }
            self.images_in_flight[image_index as usize] = fence;
            device.reset_fences(&[fence])?;
        }
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        unsafe { self.record_commands(slot, image_index) }
    }

    fn update_uniforms(&mut self, slot: usize) -> Result<()> {
        let ubo = UniformBufferObject::new(self.view, self.presentation()?.extent());
        let uniforms = self.frames.slots[slot].uniforms;
        unsafe { memcpy(&ubo, uniforms.cast(), 1) };
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.frames.slots[slot];
        let wait_semaphores = &[frame.image_available];
        let wait_stages = &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = &[frame.command_buffer];
        let signal_semaphores = &[frame.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);
        unsafe {
            self.ctx
                .device()
                .queue_submit(self.ctx.graphics_queue, &[submit_info], frame.in_flight)
                .map_err(RenderError::QueueSubmit)?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentStatus> {
        let wait = self.frames.slots[slot].render_finished;
        unsafe {
            self.presentation()?
                .swapchain
                .present(self.ctx.present_queue, wait, image_index)
        }
    }

    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
        if self.framebuffer.width == 0 || self.framebuffer.height == 0 {
            return Ok(RecreateOutcome::Deferred);
        }
        unsafe { self.rebuild_presentation() }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(error) = unsafe { self.ctx.device().device_wait_idle() } {
            warn!("Waiting for the device before teardown failed: {}", error);
        }
        debug!("Releasing renderer resources.");
    }
}

fn texture_bindings(models: &[Model]) -> Vec<TextureBinding> {
    models
        .iter()
        .map(|m| TextureBinding { view: m.texture.image.view, sampler: m.texture.sampler })
        .collect()
}
