use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::{Handle, KhrSurfaceExtension, KhrSwapchainExtension};

use crate::device::{DeviceContext, QueueFamilyIndices};
use crate::error::RenderError;
use crate::frame_graph::FrameGraph;
use crate::resources::{create_image_view, Image, ResourceManager};
use crate::scheduler::{AcquireStatus, PresentStatus};

/// Surface capabilities, formats and present modes of a physical device.
#[derive(Clone, Debug, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: instance
                .get_physical_device_surface_capabilities_khr(physical_device, surface)?,
            formats: instance.get_physical_device_surface_formats_khr(physical_device, surface)?,
            present_modes: instance
                .get_physical_device_surface_present_modes_khr(physical_device, surface)?,
        })
    }
}

/// Prefers 8-bit BGRA sRGB with a nonlinear sRGB color space, else the first format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .cloned()
}

/// Prefers mailbox, falls back to FIFO which is always available.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .cloned()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's fixed extent, or the framebuffer size clamped to the surface limits.
pub fn choose_swap_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let clamp = |min: u32, max: u32, v: u32| v.max(min).min(max);
    vk::Extent2D {
        width: clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
            framebuffer.width,
        ),
        height: clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
            framebuffer.height,
        ),
    }
}

/// One image more than the minimum, capped by the maximum when there is one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

/// Exclusive sharing for a shared family, concurrent across both otherwise.
pub fn choose_sharing(indices: QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if indices.graphics != indices.present {
        (vk::SharingMode::CONCURRENT, vec![indices.graphics, indices.present])
    } else {
        (vk::SharingMode::EXCLUSIVE, vec![])
    }
}

/// Every choice that goes into a swapchain, derived from surface support alone.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SwapchainPlan {
    pub fn new(support: &SwapchainSupport, framebuffer: vk::Extent2D) -> Result<Self> {
        let surface_format = choose_surface_format(&support.formats)
            .ok_or_else(|| anyhow!("Surface reports no formats."))?;
        Ok(Self {
            surface_format,
            present_mode: choose_present_mode(&support.present_modes),
            extent: choose_swap_extent(&support.capabilities, framebuffer),
            image_count: choose_image_count(&support.capabilities),
        })
    }
}

/// The presentable image chain and its views.
pub struct Swapchain {
    ctx: Rc<DeviceContext>,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    pub unsafe fn create(ctx: &Rc<DeviceContext>, framebuffer: vk::Extent2D) -> Result<Self> {
        let support = ctx.swapchain_support()?;
        let plan = SwapchainPlan::new(&support, framebuffer)?;
        let (sharing_mode, queue_family_indices) = choose_sharing(ctx.queue_families);

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(ctx.surface())
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let device = ctx.device();
        let handle = device.create_swapchain_khr(&info, None)?;
        let mut swapchain = Self {
            ctx: ctx.clone(),
            handle,
            images: Vec::new(),
            views: Vec::new(),
            format: plan.surface_format.format,
            extent: plan.extent,
            present_mode: plan.present_mode,
        };
        ctx.name(vk::ObjectType::SWAPCHAIN_KHR, handle.as_raw(), "Swapchain");

        swapchain.images = device.get_swapchain_images_khr(handle)?;
        for (i, image) in swapchain.images.iter().enumerate() {
            let view = create_image_view(
                device,
                *image,
                swapchain.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            swapchain.views.push(view);
            ctx.name(vk::ObjectType::IMAGE_VIEW, view.as_raw(), &format!("Swapchain View {}", i));
        }

        info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}.",
            plan.extent.width,
            plan.extent.height,
            swapchain.images.len(),
            plan.surface_format.format,
            plan.present_mode,
        );
        Ok(swapchain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub unsafe fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout: u64,
    ) -> Result<AcquireStatus> {
        let result = self.ctx.device().acquire_next_image_khr(
            self.handle,
            timeout,
            semaphore,
            vk::Fence::null(),
        );
        match result {
            Ok((index, code)) if code == vk::SuccessCode::SUBOPTIMAL_KHR => {
                Ok(AcquireStatus::Suboptimal(index))
            }
            Ok((index, _)) => Ok(AcquireStatus::Ready(index)),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(error) => Err(anyhow!(error)),
        }
    }

    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        wait: vk::Semaphore,
        image_index: u32,
    ) -> Result<PresentStatus> {
        let wait_semaphores = &[wait];
        let swapchains = &[self.handle];
        let image_indices = &[image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        match self.ctx.device().queue_present_khr(queue, &info) {
            Ok(code) if code == vk::SuccessCode::SUBOPTIMAL_KHR => Ok(PresentStatus::Suboptimal),
            Ok(_) => Ok(PresentStatus::Presented),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(error) => Err(anyhow!(RenderError::Present(error))),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            self.views.iter().for_each(|v| device.destroy_image_view(*v, None));
            device.destroy_swapchain_khr(self.handle, None);
        }
    }
}

/// Extent-dependent attachments and the framebuffers that use them.
pub struct RenderTargets {
    ctx: Rc<DeviceContext>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub overlay_framebuffers: Vec<vk::Framebuffer>,
    pub color: Image,
    pub depth: Image,
}

impl RenderTargets {
    pub unsafe fn create(
        ctx: &Rc<DeviceContext>,
        resources: &ResourceManager,
        swapchain: &Swapchain,
        graph: &FrameGraph,
    ) -> Result<Self> {
        let extent = swapchain.extent;

        let color = resources.create_image(
            extent.width,
            extent.height,
            1,
            ctx.msaa_samples,
            swapchain.format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::ImageAspectFlags::COLOR,
        )?;
        resources.transition_image_layout(
            &color,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )?;
        ctx.name(vk::ObjectType::IMAGE, color.image.as_raw(), "MSAA Color Target");

        let depth = resources.create_image(
            extent.width,
            extent.height,
            1,
            ctx.msaa_samples,
            graph.depth_format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::ImageAspectFlags::DEPTH,
        )?;
        resources.transition_image_layout(
            &depth,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;
        ctx.name(vk::ObjectType::IMAGE, depth.image.as_raw(), "Depth Target");

        let mut targets = Self {
            ctx: ctx.clone(),
            framebuffers: Vec::with_capacity(swapchain.views.len()),
            overlay_framebuffers: Vec::with_capacity(swapchain.views.len()),
            color,
            depth,
        };

        let device = ctx.device();
        for view in &swapchain.views {
            let attachments = &[targets.color.view, targets.depth.view, *view];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(graph.render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            targets.framebuffers.push(device.create_framebuffer(&info, None)?);

            let attachments = &[*view];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(graph.overlay_render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            targets.overlay_framebuffers.push(device.create_framebuffer(&info, None)?);
        }

        Ok(targets)
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            self.framebuffers.iter().for_each(|f| device.destroy_framebuffer(*f, None));
            self.overlay_framebuffers.iter().for_each(|f| device.destroy_framebuffer(*f, None));
        }
    }
}

/// Everything that is torn down and rebuilt when the surface changes size.
///
/// Field order is teardown order: framebuffers and attachments go before the
/// swapchain whose views they reference.
pub struct Presentation {
    pub targets: RenderTargets,
    pub swapchain: Swapchain,
}

impl Presentation {
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        }
    }

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn preferred_srgb_format_wins() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[1]));
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            surface_format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
            surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        for _ in 0..3 {
            assert_eq!(choose_surface_format(&formats), Some(formats[0]));
        }
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_preference() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn fixed_current_extent_is_used_as_is() {
        let mut caps = capabilities((1, 1), (4096, 4096));
        caps.current_extent = vk::Extent2D { width: 800, height: 600 };
        let extent = choose_swap_extent(&caps, vk::Extent2D { width: 1920, height: 1080 });
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_stays_within_surface_limits() {
        let caps = capabilities((64, 48), (2560, 1440));
        let inputs = [(0, 0), (1, 1), (1280, 720), (2560, 1440), (10_000, 20), (u32::MAX - 1, u32::MAX - 1)];
        for (width, height) in inputs {
            let extent = choose_swap_extent(&caps, vk::Extent2D { width, height });
            assert!(extent.width >= 64 && extent.width <= 2560, "{:?}", extent);
            assert!(extent.height >= 48 && extent.height <= 1440, "{:?}", extent);
        }
        let extent = choose_swap_extent(&caps, vk::Extent2D { width: 1280, height: 720 });
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn image_count_respects_cap() {
        let mut caps = capabilities((1, 1), (1, 1));
        assert_eq!(choose_image_count(&caps), 3);
        caps.min_image_count = 3;
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 4);
    }

    #[test]
    fn sharing_mode_follows_queue_families() {
        let (mode, indices) = choose_sharing(QueueFamilyIndices { graphics: 0, present: 0 });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());
        let (mode, indices) = choose_sharing(QueueFamilyIndices { graphics: 0, present: 2 });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn repeated_plans_without_resize_match() {
        let support = SwapchainSupport {
            capabilities: capabilities((1, 1), (4096, 4096)),
            formats: vec![surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let framebuffer = vk::Extent2D { width: 1280, height: 720 };
        let first = SwapchainPlan::new(&support, framebuffer).unwrap();
        let second = SwapchainPlan::new(&support, framebuffer).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.image_count, 3);
    }
}
