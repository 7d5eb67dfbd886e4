// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The chain is never patched in place: on invalidation the renderer drops
// it and builds a fresh one from the current surface capabilities.

use super::surface::{Surface, SurfaceSupport};
use super::VulkanDevice;
use crate::error::RendererError;
use crate::frame::{AcquireOutcome, PresentOutcome};
use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

/// Anything that can report the drawable size of a window, in pixels
pub trait FramebufferSource {
    fn framebuffer_size(&self) -> (u32, u32);
}

/// The framebuffer size, or `None` while it is degenerate (minimized)
pub fn visible_framebuffer(source: &dyn FramebufferSource) -> Option<(u32, u32)> {
    match source.framebuffer_size() {
        (0, _) | (_, 0) => None,
        size => Some(size),
    }
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first().copied())
}

/// Preferred mode if offered, otherwise FIFO (always supported)
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], preferred: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, (width, height): (u32, u32)) -> vk::Extent2D {
    // u32::MAX means the surface size is decided by the swapchain
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 = unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Exclusive,
    Concurrent([u32; 2]),
}

impl Sharing {
    pub fn for_families(graphics: u32, present: u32) -> Self {
        if graphics == present {
            Sharing::Exclusive
        } else {
            Sharing::Concurrent([graphics, present])
        }
    }
}

/// Everything negotiated against the surface before creating a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub sharing: Sharing,
}

impl SwapchainPlan {
    pub fn negotiate(
        support: &SurfaceSupport,
        framebuffer: (u32, u32),
        preferred_present_mode: vk::PresentModeKHR,
        (graphics_family, present_family): (u32, u32),
    ) -> Result<Self> {
        let surface_format = choose_surface_format(&support.formats).context("Surface advertises no formats")?;

        Ok(Self {
            surface_format,
            present_mode: choose_present_mode(&support.present_modes, preferred_present_mode),
            extent: choose_extent(&support.capabilities, framebuffer),
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
            sharing: Sharing::for_families(graphics_family, present_family),
        })
    }
}

pub struct Swapchain {
    // Dropped in this order by `Drop`: framebuffers, views, chain
    pub framebuffers: Vec<vk::Framebuffer>,
    pub image_views: Vec<vk::ImageView>,
    pub images: Vec<vk::Image>,
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: &Surface,
        render_pass: vk::RenderPass,
        framebuffer: (u32, u32),
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let support = surface.support(device.physical_device)?;
        let plan = SwapchainPlan::negotiate(
            &support,
            framebuffer,
            preferred_present_mode,
            (device.graphics_queue_family, device.present_queue_family),
        )?;

        log::info!(
            "Creating swapchain: {}x{} ({:?}, {:?}, {} images)",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.present_mode,
            plan.image_count
        );

        let swapchain_loader = khr::Swapchain::new(&device.instance().instance, &device.device);

        let families = match plan.sharing {
            Sharing::Concurrent(families) => families.to_vec(),
            Sharing::Exclusive => Vec::new(),
        };
        let sharing_mode = match plan.sharing {
            Sharing::Concurrent(_) => vk::SharingMode::CONCURRENT,
            Sharing::Exclusive => vk::SharingMode::EXCLUSIVE,
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on `Drop` cleans up whatever was built so far
        let mut this = Self {
            framebuffers: Vec::new(),
            image_views: Vec::new(),
            images: Vec::new(),
            swapchain,
            swapchain_loader,
            format: plan.surface_format.format,
            extent: plan.extent,
            device,
        };

        this.images = unsafe { this.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &this.images {
            let view = super::texture::create_image_view(&this.device, image, this.format)?;
            this.image_views.push(view);
        }

        for &view in &this.image_views {
            let attachments = [view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(this.extent.width)
                .height(this.extent.height)
                .layers(1);

            let framebuffer = unsafe { this.device.device.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")?;
            this.framebuffers.push(framebuffer);
        }

        log::info!("Created swapchain with {} images", this.images.len());
        Ok(this)
    }

    /// Acquire next image for rendering, signalling `semaphore` when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome, RendererError> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(RendererError::Acquire(e)),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome, RendererError> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(RendererError::Present(e)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain ({} images)", self.images.len());
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min_images: u32, max_images: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 64, height: 32 },
            max_image_extent: vk::Extent2D { width: 1920, height: 1080 },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        }
    }

    fn srgb() -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn unorm() -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    struct FixedWindow(u32, u32);

    impl FramebufferSource for FixedWindow {
        fn framebuffer_size(&self) -> (u32, u32) {
            (self.0, self.1)
        }
    }

    #[test]
    fn sentinel_extent_clamps_framebuffer_size() {
        let caps = caps(2, 3);
        let sizes = [(0, 0), (10, 5000), (800, 600), (1920, 1080), (4000, 40), (u32::MAX, 1)];
        for (w, h) in sizes {
            let extent = choose_extent(&caps, (w, h));
            assert_eq!(extent.width, w.clamp(64, 1920), "width for {w}x{h}");
            assert_eq!(extent.height, h.clamp(32, 1080), "height for {w}x{h}");
        }
    }

    #[test]
    fn fixed_current_extent_wins() {
        let mut caps = caps(2, 3);
        caps.current_extent = vk::Extent2D { width: 1024, height: 768 };
        assert_eq!(choose_extent(&caps, (10, 10)), caps.current_extent);
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(choose_image_count(&caps(2, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
        // 0 means no limit
        assert_eq!(choose_image_count(&caps(3, 0)), 4);
    }

    #[test]
    fn prefers_srgb_then_first_format() {
        assert_eq!(choose_surface_format(&[unorm(), srgb()]), Some(srgb()));
        assert_eq!(choose_surface_format(&[unorm()]), Some(unorm()));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn unavailable_present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn distinct_families_share_concurrently() {
        assert_eq!(Sharing::for_families(0, 0), Sharing::Exclusive);
        assert_eq!(Sharing::for_families(0, 2), Sharing::Concurrent([0, 2]));
    }

    #[test]
    fn negotiation_is_repeatable() {
        let support = SurfaceSupport {
            capabilities: caps(2, 3),
            formats: vec![unorm(), srgb()],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        let first = SwapchainPlan::negotiate(&support, (800, 600), vk::PresentModeKHR::MAILBOX, (0, 1)).unwrap();
        let second = SwapchainPlan::negotiate(&support, (800, 600), vk::PresentModeKHR::MAILBOX, (0, 1)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.image_count, 3);
        assert_eq!(first.surface_format, srgb());
        assert_eq!(first.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(first.sharing, Sharing::Concurrent([0, 1]));
    }

    #[test]
    fn negotiation_needs_a_format() {
        let support = SurfaceSupport {
            capabilities: caps(2, 3),
            formats: Vec::new(),
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(SwapchainPlan::negotiate(&support, (800, 600), vk::PresentModeKHR::FIFO, (0, 0)).is_err());
    }

    #[test]
    fn minimized_window_has_no_visible_framebuffer() {
        assert_eq!(visible_framebuffer(&FixedWindow(0, 0)), None);
        assert_eq!(visible_framebuffer(&FixedWindow(800, 0)), None);
        assert_eq!(visible_framebuffer(&FixedWindow(800, 600)), Some((800, 600)));
    }
}
