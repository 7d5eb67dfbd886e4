// =============================================================================
// RENDERER - owns every GPU object and implements the per-frame operations
// =============================================================================
//
// CREATION ORDER:
//   Instance -> Surface -> Device -> Render pass -> Swapchain -> Commands
//   -> Pipeline -> Vertex/Index buffers -> Texture -> Uniforms -> Descriptors
//   -> Frame slots
//
// Teardown is the reverse, driven by field declaration order below.
//
// =============================================================================

use crate::assets::Assets;
use crate::backend::buffer::{Buffer, MappedUniformBuffer};
use crate::backend::command::CommandPool;
use crate::backend::descriptor::DescriptorPool;
use crate::backend::diagnostics::DiagnosticsSink;
use crate::backend::pipeline::{GraphicsPipeline, RenderPass};
use crate::backend::swapchain::{choose_surface_format, visible_framebuffer, FramebufferSource};
use crate::backend::sync::FrameSync;
use crate::backend::texture::Texture;
use crate::backend::{Instance, Surface, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::error::RendererError;
use crate::frame::{AcquireOutcome, FrameBackend, PresentOutcome, RecreateOutcome};
use crate::mesh::{UniformBufferObject, QUAD_INDICES, QUAD_VERTICES};
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

impl FramebufferSource for Window {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}

/// Everything one frame in flight touches, used only during its own turn
struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
    uniform: MappedUniformBuffer,
    descriptor_set: vk::DescriptorSet,
}

/// IMPORTANT: Field order matters for Drop! Fields drop top to bottom, so
/// every resource is listed before the ones it was created from.
pub struct Renderer {
    frames: Vec<FrameSlot>,
    // Only held so they live as long as the descriptor sets pointing at them
    _descriptor_pool: DescriptorPool,
    _texture: Texture,
    index_buffer: Buffer,
    vertex_buffer: Buffer,
    /// `None` while the window is minimized
    swapchain: Option<Swapchain>,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    _command_pool: CommandPool,
    device: Arc<VulkanDevice>,
    surface: Surface,
    window: Arc<Window>,

    start: Instant,
    clear_color: [f32; 4],
    preferred_present_mode: vk::PresentModeKHR,
}

impl Renderer {
    pub fn new(
        window: Arc<Window>,
        config: &Config,
        assets: &Assets,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // ─────────────────────────────────────────────────────────────────────
        // Instance, surface, device
        // ─────────────────────────────────────────────────────────────────────
        let instance = Instance::new(
            &config.window.title,
            Some(display_handle),
            config.validation_enabled(),
            diagnostics,
        )?;
        let surface = Surface::new(instance.clone(), display_handle, window_handle)?;
        let device = VulkanDevice::new(instance, Some(&surface))?;

        // ─────────────────────────────────────────────────────────────────────
        // Render pass + swapchain
        // ─────────────────────────────────────────────────────────────────────
        let support = surface.support(device.physical_device)?;
        let surface_format = choose_surface_format(&support.formats).context("Surface advertises no formats")?;
        let render_pass = RenderPass::new(device.clone(), surface_format.format)?;

        let preferred_present_mode = config.preferred_present_mode();
        let swapchain = match visible_framebuffer(&*window) {
            Some(size) => Some(Swapchain::new(
                device.clone(),
                &surface,
                render_pass.render_pass,
                size,
                preferred_present_mode,
            )?),
            None => {
                log::info!("Window starts minimized, swapchain creation deferred");
                None
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // Pipeline and static resources
        // ─────────────────────────────────────────────────────────────────────
        let command_pool = CommandPool::new(device.clone())?;
        let pipeline = GraphicsPipeline::new(
            device.clone(),
            &render_pass,
            &assets.vertex_shader,
            &assets.fragment_shader,
        )?;

        let vertex_buffer = Buffer::device_local_with_data(
            device.clone(),
            &command_pool,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(&QUAD_VERTICES),
        )
        .context("Failed to upload vertex buffer")?;
        let index_buffer = Buffer::device_local_with_data(
            device.clone(),
            &command_pool,
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(&QUAD_INDICES),
        )
        .context("Failed to upload index buffer")?;
        let texture = Texture::from_encoded(device.clone(), &command_pool, &assets.texture)?;

        // ─────────────────────────────────────────────────────────────────────
        // Per-frame resources
        // ─────────────────────────────────────────────────────────────────────
        let frame_count = config.frames_in_flight();
        let uniforms = (0..frame_count)
            .map(|_| {
                MappedUniformBuffer::new(
                    device.clone(),
                    std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let descriptor_pool = DescriptorPool::new(device.clone(), frame_count as u32)?;
        let uniform_ranges: Vec<_> = uniforms.iter().map(|u| (u.buffer(), u.size())).collect();
        let descriptor_sets = descriptor_pool.allocate_frame_sets(
            pipeline.descriptor_set_layout,
            &uniform_ranges,
            texture.view,
            texture.sampler,
        )?;

        let command_buffers = command_pool.allocate(frame_count as u32)?;

        let frames = uniforms
            .into_iter()
            .zip(descriptor_sets)
            .zip(command_buffers)
            .map(|((uniform, descriptor_set), command_buffer)| {
                Ok(FrameSlot {
                    sync: FrameSync::new(device.clone())?,
                    command_buffer,
                    uniform,
                    descriptor_set,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Vulkan initialized ({} frames in flight)", frame_count);

        Ok(Self {
            frames,
            _descriptor_pool: descriptor_pool,
            _texture: texture,
            index_buffer,
            vertex_buffer,
            swapchain,
            pipeline,
            render_pass,
            _command_pool: command_pool,
            device,
            surface,
            window,
            start: Instant::now(),
            clear_color: config.graphics.clear_color,
            preferred_present_mode,
        })
    }

    pub fn has_swapchain(&self) -> bool {
        self.swapchain.is_some()
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not created")
    }

    fn record(&self, slot: &FrameSlot, swapchain: &Swapchain, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let cmd = slot.command_buffer;
        let extent = swapchain.extent;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.render_pass)
            .framebuffer(swapchain.framebuffers[image_index as usize])
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT16);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[slot.descriptor_set],
                &[],
            );

            device.cmd_draw_indexed(cmd, QUAD_INDICES.len() as u32, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to record command buffer")?;
        }

        Ok(())
    }
}

impl FrameBackend for Renderer {
    fn wait_for_frame(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].sync.wait()
    }

    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.frames[slot].sync.image_available;
        Ok(self.swapchain()?.acquire_next_image(semaphore)?)
    }

    fn update_uniforms(&mut self, slot: usize) -> Result<()> {
        let extent = self.swapchain()?.extent;
        let ubo = UniformBufferObject::spinning(self.start.elapsed().as_secs_f32(), extent);
        self.frames[slot].uniform.write(&ubo);
        Ok(())
    }

    fn record_and_submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let frame = &self.frames[slot];
        let swapchain = self.swapchain()?;
        let device = &self.device.device;

        // Only reset once we know work will be submitted that signals it again
        frame.sync.reset()?;
        unsafe { device.reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty()) }
            .context("Failed to reset command buffer")?;

        self.record(frame, swapchain, image_index)?;

        let wait_semaphores = [frame.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe { device.queue_submit(self.device.graphics_queue, &[submit_info], frame.sync.in_flight_fence) }
            .map_err(RendererError::Submit)?;

        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let render_finished = self.frames[slot].sync.render_finished;
        Ok(self
            .swapchain()?
            .present(self.device.present_queue, image_index, render_finished)?)
    }

    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
        let Some(size) = visible_framebuffer(&*self.window) else {
            log::debug!("Framebuffer is zero-sized, deferring swapchain recreation");
            return Ok(RecreateOutcome::Deferred);
        };

        self.device.wait_idle()?;

        // Old chain (framebuffers, views, swapchain) goes before the new one is built
        self.swapchain = None;
        let swapchain = Swapchain::new(
            self.device.clone(),
            &self.surface,
            self.render_pass.render_pass,
            size,
            self.preferred_present_mode,
        )?;

        if swapchain.format != self.render_pass.format {
            log::warn!(
                "Surface format changed from {:?} to {:?}; render pass not rebuilt",
                self.render_pass.format,
                swapchain.format
            );
        }

        log::info!(
            "Swapchain recreated: {}x{}",
            swapchain.extent.width,
            swapchain.extent.height
        );
        self.swapchain = Some(swapchain);

        Ok(RecreateOutcome::Recreated)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle during cleanup: {:#}", e);
        }
    }
}
