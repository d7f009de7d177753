use std::ffi::c_void;
use std::mem::size_of_val;
use std::ptr::copy_nonoverlapping as memcpy;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::Handle;

use crate::device::DeviceContext;
use crate::error::RenderError;
use crate::model::TextureData;

/// Index of the first memory type allowed by `type_bits` that has every flag in `properties`.
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..memory.memory_type_count)
        .find(|i| {
            let allowed = (type_bits & (1 << i)) != 0;
            let memory_type = memory.memory_types[*i as usize];
            allowed && memory_type.property_flags.contains(properties)
        })
        .ok_or(RenderError::NoSuitableMemoryType { type_bits, properties })
}

/// Number of levels in a full mip chain: `floor(log2(max(width, height))) + 1`.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Access and stage masks for one supported layout transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for the known transitions; anything else is rejected.
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, RenderError> {
    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        _ => return Err(RenderError::UnsupportedLayoutTransition { old, new }),
    };
    Ok(TransitionMasks { src_access, dst_access, src_stage, dst_stage })
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    format == vk::Format::D32_SFLOAT_S8_UINT || format == vk::Format::D24_UNORM_S8_UINT
}

/// Aspects touched by a barrier that moves an image of `format` into `new_layout`.
pub fn transition_aspect(format: vk::Format, new_layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    if new_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub unsafe fn create_image_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspects: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let subresource_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(aspects)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(1);
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::_2D)
        .format(format)
        .subresource_range(subresource_range);
    Ok(device.create_image_view(&info, None)?)
}

/// A buffer and the memory bound to it.
pub struct Buffer {
    ctx: Rc<DeviceContext>,
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl Buffer {
    /// Maps the whole buffer. Only valid for host-visible memory.
    pub unsafe fn map(&self) -> Result<*mut c_void> {
        Ok(self
            .ctx
            .device()
            .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())?)
    }

    pub unsafe fn unmap(&self) {
        self.ctx.device().unmap_memory(self.memory);
    }

    /// Copies `data` into the start of a host-visible buffer.
    pub unsafe fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        if size_of_val(data) as u64 > self.size {
            return Err(anyhow!("{} bytes do not fit into a {} byte buffer.", size_of_val(data), self.size));
        }
        let memory = self.map()?;
        memcpy(data.as_ptr(), memory.cast(), data.len());
        self.unmap();
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// An image, its memory and a view over all of its mip levels.
pub struct Image {
    ctx: Rc<DeviceContext>,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
}

impl Drop for Image {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            if !self.view.is_null() {
                device.destroy_image_view(self.view, None);
            }
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// A sampled texture: mipmapped image plus sampler.
pub struct Texture {
    ctx: Rc<DeviceContext>,
    pub sampler: vk::Sampler,
    pub image: Image,
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_sampler(self.sampler, None) };
    }
}

/// Allocates buffers and images and runs one-time transfer commands.
pub struct ResourceManager {
    ctx: Rc<DeviceContext>,
    command_pool: vk::CommandPool,
}

impl ResourceManager {
    pub unsafe fn create(ctx: &Rc<DeviceContext>) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(ctx.queue_families.graphics);
        let command_pool = ctx.device().create_command_pool(&info, None)?;
        Ok(Self { ctx: ctx.clone(), command_pool })
    }

    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        let device = self.ctx.device();
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = device.create_buffer(&info, None)?;

        let requirements = device.get_buffer_memory_requirements(buffer);
        let memory_type = match find_memory_type(
            &self.ctx.memory_properties,
            requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(error) => {
                device.destroy_buffer(buffer, None);
                return Err(error.into());
            }
        };

        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = match device.allocate_memory(&info, None) {
            Ok(memory) => memory,
            Err(error) => {
                device.destroy_buffer(buffer, None);
                return Err(error.into());
            }
        };

        let buffer = Buffer { ctx: self.ctx.clone(), buffer, memory, size };
        device.bind_buffer_memory(buffer.buffer, buffer.memory, 0)?;
        Ok(buffer)
    }

    pub unsafe fn create_image(
        &self,
        width: u32,
        height: u32,
        mip_levels: u32,
        samples: vk::SampleCountFlags,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
        aspects: vk::ImageAspectFlags,
    ) -> Result<Image> {
        let device = self.ctx.device();
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(format)
            .tiling(tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(samples);
        let image = device.create_image(&info, None)?;

        let requirements = device.get_image_memory_requirements(image);
        let memory_type = match find_memory_type(
            &self.ctx.memory_properties,
            requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(error) => {
                device.destroy_image(image, None);
                return Err(error.into());
            }
        };

        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = match device.allocate_memory(&info, None) {
            Ok(memory) => memory,
            Err(error) => {
                device.destroy_image(image, None);
                return Err(error.into());
            }
        };

        let mut image = Image {
            ctx: self.ctx.clone(),
            image,
            memory,
            view: vk::ImageView::null(),
            format,
            width,
            height,
            mip_levels,
        };
        device.bind_image_memory(image.image, image.memory, 0)?;
        image.view = create_image_view(device, image.image, format, aspects, mip_levels)?;
        Ok(image)
    }

    /// Copies `data` into `destination` through a temporary host-visible buffer.
    pub unsafe fn upload_via_staging<T: Copy>(&self, data: &[T], destination: &Buffer) -> Result<()> {
        let staging = self.staging_buffer(data)?;
        let size = staging.size;
        self.one_time_commands(|device, command_buffer| {
            let region = vk::BufferCopy::builder().size(size);
            device.cmd_copy_buffer(command_buffer, staging.buffer, destination.buffer, &[region]);
        })
    }

    /// A device-local buffer with `usage` filled with `data`.
    pub unsafe fn create_device_local_buffer<T: Copy>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Buffer> {
        let buffer = self.create_buffer(
            size_of_val(data) as u64,
            vk::BufferUsageFlags::TRANSFER_DST | usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        self.ctx.name(vk::ObjectType::BUFFER, buffer.buffer.as_raw(), name);
        self.upload_via_staging(data, &buffer)?;
        Ok(buffer)
    }

    pub unsafe fn transition_image_layout(
        &self,
        image: &Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let masks = transition_masks(old_layout, new_layout)?;
        let subresource = vk::ImageSubresourceRange::builder()
            .aspect_mask(transition_aspect(image.format, new_layout))
            .base_mip_level(0)
            .level_count(image.mip_levels)
            .base_array_layer(0)
            .layer_count(1);
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(subresource)
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        self.one_time_commands(|device, command_buffer| {
            device.cmd_pipeline_barrier(
                command_buffer,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[] as &[vk::MemoryBarrier],
                &[] as &[vk::BufferMemoryBarrier],
                &[barrier],
            );
        })
    }

    pub unsafe fn copy_buffer_to_image(&self, buffer: &Buffer, image: &Image) -> Result<()> {
        let subresource = vk::ImageSubresourceLayers::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(subresource)
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D { width: image.width, height: image.height, depth: 1 });

        self.one_time_commands(|device, command_buffer| {
            device.cmd_copy_buffer_to_image(
                command_buffer,
                buffer.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }

    unsafe fn check_blit_support(&self, format: vk::Format) -> Result<()> {
        let supported = self
            .ctx
            .format_properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR);
        if supported {
            Ok(())
        } else {
            Err(anyhow!(RenderError::UnsupportedBlitFormat(format)))
        }
    }

    /// Blits every level from the previous one and leaves all levels shader-readable.
    ///
    /// Expects every level in `TRANSFER_DST_OPTIMAL`.
    pub unsafe fn generate_mipmaps(&self, image: &Image) -> Result<()> {
        self.check_blit_support(image.format)?;

        let subresource = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_array_layer(0)
            .layer_count(1)
            .level_count(1);
        let mut barrier = vk::ImageMemoryBarrier::builder()
            .image(image.image)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(subresource);

        self.one_time_commands(|device, command_buffer| {
            let mut mip_width = image.width as i32;
            let mut mip_height = image.height as i32;

            for level in 1..image.mip_levels {
                barrier.subresource_range.base_mip_level = level - 1;
                barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
                barrier.new_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
                barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
                barrier.dst_access_mask = vk::AccessFlags::TRANSFER_READ;
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[] as &[vk::MemoryBarrier],
                    &[] as &[vk::BufferMemoryBarrier],
                    &[barrier],
                );

                let next_width = (mip_width / 2).max(1);
                let next_height = (mip_height / 2).max(1);
                let src_subresource = vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(level - 1)
                    .base_array_layer(0)
                    .layer_count(1);
                let dst_subresource = vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(level)
                    .base_array_layer(0)
                    .layer_count(1);
                let blit = vk::ImageBlit::builder()
                    .src_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D { x: mip_width, y: mip_height, z: 1 },
                    ])
                    .src_subresource(src_subresource)
                    .dst_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D { x: next_width, y: next_height, z: 1 },
                    ])
                    .dst_subresource(dst_subresource);
                device.cmd_blit_image(
                    command_buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );

                barrier.old_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
                barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
                barrier.src_access_mask = vk::AccessFlags::TRANSFER_READ;
                barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[] as &[vk::MemoryBarrier],
                    &[] as &[vk::BufferMemoryBarrier],
                    &[barrier],
                );

                mip_width = next_width;
                mip_height = next_height;
            }

            barrier.subresource_range.base_mip_level = image.mip_levels - 1;
            barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
            barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[] as &[vk::MemoryBarrier],
                &[] as &[vk::BufferMemoryBarrier],
                &[barrier],
            );
        })
    }

    /// Uploads RGBA pixels into a mipmapped, sampled texture.
    pub unsafe fn create_texture(&self, data: &TextureData, name: &str) -> Result<Texture> {
        let format = vk::Format::R8G8B8A8_SRGB;
        self.check_blit_support(format)?;

        let mip_levels = mip_level_count(data.width, data.height);
        let staging = self.staging_buffer(&data.pixels)?;
        let image = self.create_image(
            data.width,
            data.height,
            mip_levels,
            vk::SampleCountFlags::_1,
            format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::ImageAspectFlags::COLOR,
        )?;
        self.ctx.name(vk::ObjectType::IMAGE, image.image.as_raw(), name);

        self.transition_image_layout(
            &image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        self.copy_buffer_to_image(&staging, &image)?;
        drop(staging);
        self.generate_mipmaps(&image)?;

        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(self.ctx.max_sampler_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(mip_levels as f32)
            .mip_lod_bias(0.0);
        let sampler = self.ctx.device().create_sampler(&info, None)?;

        debug!("Created texture `{}` ({}x{}, {} mip levels).", name, data.width, data.height, mip_levels);
        Ok(Texture { ctx: self.ctx.clone(), sampler, image })
    }

    unsafe fn staging_buffer<T: Copy>(&self, data: &[T]) -> Result<Buffer> {
        if data.is_empty() {
            return Err(anyhow!("Refusing to stage an empty upload."));
        }
        let staging = self.create_buffer(
            size_of_val(data) as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write(data)?;
        Ok(staging)
    }

    /// Records commands into a throwaway command buffer, submits them and waits for the queue.
    unsafe fn one_time_commands(
        &self,
        record: impl FnOnce(&Device, vk::CommandBuffer),
    ) -> Result<()> {
        let device = self.ctx.device();
        let info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_pool(self.command_pool)
            .command_buffer_count(1);
        let command_buffer = device.allocate_command_buffers(&info)?[0];

        let result = (|| -> Result<()> {
            let info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(command_buffer, &info)?;
            record(device, command_buffer);
            device.end_command_buffer(command_buffer)?;

            let command_buffers = &[command_buffer];
            let info = vk::SubmitInfo::builder().command_buffers(command_buffers);
            device
                .queue_submit(self.ctx.graphics_queue, &[info], vk::Fence::null())
                .map_err(RenderError::QueueSubmit)?;
            device.queue_wait_idle(self.ctx.graphics_queue)?;
            Ok(())
        })();

        device.free_command_buffers(self.command_pool, &[command_buffer]);
        result
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_command_pool(self.command_pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            properties.memory_types[i] = vk::MemoryType { property_flags: *flags, heap_index: 0 };
        }
        properties
    }

    #[test]
    fn memory_type_round_trip() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        let requirement_bits = 0b111;
        let device_local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let chosen = find_memory_type(&properties, requirement_bits, device_local).unwrap();
        assert_eq!(chosen, 1);

        // A later search with any mask containing that type finds it again.
        let again = find_memory_type(&properties, (1 << chosen) | 0b100, device_local).unwrap();
        assert_eq!(again, chosen);
    }

    #[test]
    fn memory_type_needs_superset_of_properties() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&properties, 0b11, wanted).unwrap(), 1);
    }

    #[test]
    fn no_memory_type_is_an_error() {
        let properties = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let error = find_memory_type(&properties, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap_err();
        assert!(matches!(error, RenderError::NoSuitableMemoryType { type_bits: 0b10, .. }));

        let error = find_memory_type(&properties, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap_err();
        assert!(matches!(error, RenderError::NoSuitableMemoryType { .. }));
    }

    #[test]
    fn mip_levels() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(1024, 1024), 11);
        assert_eq!(mip_level_count(1000, 600), 10);
        assert_eq!(mip_level_count(300, 4096), 13);
        assert_eq!(mip_level_count(0, 0), 1);
        for size in 1..2048u32 {
            let expected = (size as f32).log2().floor() as u32 + 1;
            assert_eq!(mip_level_count(size, 1), expected, "size {}", size);
        }
    }

    #[test]
    fn known_transitions() {
        let upload = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .unwrap();
        assert_eq!(upload.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let sample = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(sample.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);

        let depth = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);

        let color = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .unwrap();
        assert!(color.dst_access.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn unknown_transitions_fail_fast() {
        let pairs = [
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::UNDEFINED),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::PRESENT_SRC_KHR),
        ];
        for (old, new) in pairs {
            let error = transition_masks(old, new).unwrap_err();
            assert!(matches!(
                error,
                RenderError::UnsupportedLayoutTransition { old: o, new: n } if o == old && n == new
            ));
        }
    }

    #[test]
    fn depth_aspects_include_stencil_when_present() {
        let layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        assert_eq!(transition_aspect(vk::Format::D32_SFLOAT, layout), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            transition_aspect(vk::Format::D24_UNORM_S8_UINT, layout),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            transition_aspect(vk::Format::R8G8B8A8_SRGB, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
    }
}
