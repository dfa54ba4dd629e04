//! The per-frame renderer.
//!
//! One [`FrameRenderer`] drives one output per frame through
//! `begin → draw… → end`: it sorts the surface list by depth, draws the
//! frame-boundary diagnostic rect, pushes every visible surface through the
//! backdrop-blur/composite pipeline, then runs the full-target blur and the
//! postprocess pass, submits the single command stream and blocks until the
//! GPU retires it. Because nothing outlives the fence wait, end-of-frame is
//! also where staging memory is rewound and destroyed textures are freed.

use ash::vk;
use glam::{Mat4, Vec3};
use log::{debug, error, warn};

use crate::config::{DisplayMode, RendererConfig, COLOR_SCHEME_SIZE};
use crate::descriptors::{DescriptorAllocator, ImageBinding};
use crate::device::VulkanContext;
use crate::error::{Result, VulkanError};
use crate::pipelines::{
    PipelineCache, PushConstants, BLUR_MODE_DOWN, BLUR_MODE_DOWN_THRESHOLD, BLUR_MODE_UP,
};
use crate::render_target::RenderTargetSet;
use crate::scene::{
    plan_draw_order, CompositorOutput, DmabufSource, FrameParams, OutputBuffer, OutputId,
    RenderSurface, TextureId,
};
use crate::staging::StagingArena;
use crate::sync;
use crate::texture::{AcquireAction, TextureRegistry};
use crate::timers::{GpuTimers, Timer};

/// Pixels added around a surface's screen rect before it becomes the blur
/// clear/scissor region.
const BLUR_REGION_PADDING: f32 = 64.0;

/// Side length of the frame-boundary diagnostic rect.
const DIAGNOSTIC_RECT_SIZE: f32 = 16.0;

const PALETTE_BYTES: u64 = (2 * COLOR_SCHEME_SIZE * 16) as u64;

/// Target indices for a blur of `passes` passes: `passes` downsample draws
/// through chain images `0..passes`, then `passes - 1` upsample draws back
/// up to image 0. `2 * passes - 1` draws total.
pub fn blur_target_sequence(passes: u32) -> Vec<usize> {
    let p = passes as usize;
    debug_assert!(p >= 1);
    (0..2 * p - 1).map(|i| if i < p { i } else { 2 * p - i - 2 }).collect()
}

/// Scales a clip rectangle down to a blur stage's resolution, 1×1 floor.
pub fn scale_rect(rect: vk::Rect2D, shift: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: rect.offset.x >> shift, y: rect.offset.y >> shift },
        extent: vk::Extent2D {
            width: (rect.extent.width >> shift).max(1),
            height: (rect.extent.height >> shift).max(1),
        },
    }
}

/// Intersects a rect with `bounds`, keeping at least one pixel.
pub fn clamp_rect(rect: vk::Rect2D, bounds: vk::Extent2D) -> vk::Rect2D {
    let x = (rect.offset.x.max(0) as u32).min(bounds.width.saturating_sub(1));
    let y = (rect.offset.y.max(0) as u32).min(bounds.height.saturating_sub(1));
    vk::Rect2D {
        offset: vk::Offset2D { x: x as i32, y: y as i32 },
        extent: vk::Extent2D {
            width: rect.extent.width.min(bounds.width - x).max(1),
            height: rect.extent.height.min(bounds.height - y).max(1),
        },
    }
}

/// Screen-space bounding rect of the unit quad under `transform`, padded
/// and clamped to the target bounds.
pub fn surface_clip_rect(transform: &Mat4, padding: f32, bounds: vk::Extent2D) -> vk::Rect2D {
    let corners = [
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(1.0, 1.0, 0.0),
    ];
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    for corner in corners {
        let p = transform.transform_point3(corner);
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let min_x = (min_x - padding).max(0.0);
    let min_y = (min_y - padding).max(0.0);
    let max_x = (max_x + padding).min(bounds.width as f32);
    let max_y = (max_y + padding).min(bounds.height as f32);
    vk::Rect2D {
        offset: vk::Offset2D { x: min_x as i32, y: min_y as i32 },
        extent: vk::Extent2D {
            width: ((max_x - min_x).max(1.0)) as u32,
            height: ((max_y - min_y).max(1.0)) as u32,
        },
    }
}

/// Diagnostic rect color for a frame: cycles so dropped frames are visible.
pub fn diagnostic_color(frame: u64) -> [f32; 4] {
    let phase = (frame % 120) as f32 / 120.0;
    let angle = phase * std::f32::consts::TAU;
    [
        0.5 + 0.5 * angle.sin(),
        0.5 + 0.5 * (angle + 2.0 * std::f32::consts::FRAC_PI_3).sin(),
        0.5 + 0.5 * (angle + 4.0 * std::f32::consts::FRAC_PI_3).sin(),
        1.0,
    ]
}

/// Decoded identity pixel from under the cursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceHit {
    /// Index into last frame's draw order.
    pub surface: u32,
    pub u: f32,
    pub v: f32,
}

/// Decodes a mirror pixel: id 0 means background, the hit flag gates
/// passthrough decoration layers.
pub fn decode_hit(pixel: [f32; 4]) -> Option<SurfaceHit> {
    let id = pixel[0].round();
    if id < 0.5 || pixel[3] < 0.5 {
        return None;
    }
    Some(SurfaceHit { surface: id as u32 - 1, u: pixel[1], v: pixel[2] })
}

struct ActiveFrame {
    output: OutputId,
    extent: vk::Extent2D,
    drawn: u32,
    intermediate: usize,
    bound_pipeline: vk::Pipeline,
}

/// Handle copies for one composite draw, so no borrow of the target set or
/// pipeline cache survives into command recording.
#[derive(Clone, Copy)]
struct CompositeHandles {
    pass_clear: vk::RenderPass,
    pass_load: vk::RenderPass,
    fill_pipeline: vk::Pipeline,
    composite_pipeline: vk::Pipeline,
    framebuffer: vk::Framebuffer,
    intermediate_image: vk::Image,
    intermediate_binding: ImageBinding,
    blur0_image: vk::Image,
    blur0_binding: ImageBinding,
}

/// Handle copies for one blur chain stage.
#[derive(Clone, Copy)]
struct BlurStage {
    image: vk::Image,
    binding: ImageBinding,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

/// The renderer. Single-threaded, fully synchronous per frame.
pub struct FrameRenderer {
    config: RendererConfig,
    timers: GpuTimers,
    staging: StagingArena,
    textures: TextureRegistry,
    targets: RenderTargetSet,
    pipelines: PipelineCache,
    descriptors: DescriptorAllocator,

    command_buffer: vk::CommandBuffer,
    frame_fence: vk::Fence,

    palette_buffer: vk::Buffer,
    palette_memory: vk::DeviceMemory,
    palette_pool: vk::DescriptorPool,
    palette_set: vk::DescriptorSet,

    frame_counter: u64,
    active: Option<ActiveFrame>,

    // dropped last, after everything created from it
    context: VulkanContext,
}

impl FrameRenderer {
    pub fn new(mut config: RendererConfig) -> Result<Self> {
        config.sanitize();
        let context = VulkanContext::new(config.validation)?;
        let device = context.device.clone();

        let descriptors = DescriptorAllocator::new(&device, config.descriptor_pool_size)?;
        let depth_format = context
            .find_supported_format(
                &[
                    vk::Format::D32_SFLOAT,
                    vk::Format::D32_SFLOAT_S8_UINT,
                    vk::Format::D24_UNORM_S8_UINT,
                ],
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            )
            .ok_or_else(|| {
                VulkanError::UnsupportedFormat("no depth attachment format".to_string())
            })?;
        let pipelines = PipelineCache::new(
            &device,
            descriptors.layout(),
            depth_format,
            config.shader_dir.clone(),
        )?;
        let targets = RenderTargetSet::new(&context)?;
        let staging = StagingArena::new(&context, config.staging_min_size, config.staging_max_size);
        let timers =
            GpuTimers::new(&device, context.timestamp_period(), config.timing_summary_interval)?;

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(context.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info) }?[0];
        let frame_fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }?;

        let (palette_buffer, palette_memory) = create_palette_buffer(&context)?;
        let (palette_pool, palette_set) =
            create_palette_binding(&device, pipelines.ubo_layout, palette_buffer)?;

        Ok(Self {
            config,
            timers,
            staging,
            textures: TextureRegistry::new(),
            targets,
            pipelines,
            descriptors,
            command_buffer,
            frame_fence,
            palette_buffer,
            palette_memory,
            palette_pool,
            palette_set,
            frame_counter: 0,
            active: None,
            context,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Imports a client texture; it becomes sampleable this frame.
    pub fn import_texture(&mut self, source: &DmabufSource) -> Result<TextureId> {
        self.textures.import(&self.context, &mut self.descriptors, source)
    }

    /// Queues a texture for destruction once its last frame has retired.
    pub fn destroy_texture(&mut self, id: TextureId) {
        self.textures.queue_destroy(id);
    }

    /// Destroy notification for a presentable buffer; tears down its render
    /// target. Safe between frames only (nothing is in flight then).
    pub fn buffer_destroyed(&mut self, id: OutputId) {
        debug_assert!(self.active.is_none(), "buffer destroyed mid-frame");
        self.targets.buffer_destroyed(id, &mut self.descriptors);
    }

    /// Identity pixel under the cursor as of the last finished frame.
    pub fn surface_under_cursor(&self, output: OutputId) -> Option<SurfaceHit> {
        let target = self.targets.get(output)?;
        decode_hit(target.mirror.read())
    }

    /// Rolling GPU average for one named timer, in milliseconds.
    pub fn timer_average_ms(&self, timer: Timer) -> f64 {
        self.timers.average_ms(timer)
    }

    /// Top-level frame driver. Returns whether the output commit succeeded.
    pub fn draw_frame(
        &mut self,
        output: &mut dyn CompositorOutput,
        surfaces: &[RenderSurface],
        focused: Option<usize>,
        params: FrameParams,
    ) -> Result<bool> {
        let buffer = output.buffer().clone();
        self.begin(&buffer)?;

        let order = plan_draw_order(surfaces);
        self.draw_diagnostic_rect();

        let command_buffer = self.command_buffer;
        self.timers.start(command_buffer, Timer::Surfaces);
        for (draw_index, &surface_index) in order.iter().enumerate() {
            let surface = &surfaces[surface_index];
            let synthetic_id = (draw_index + 1) as u32;
            let is_focused = focused == Some(surface_index);
            self.draw_surface(surface, synthetic_id, is_focused)?;
        }
        self.timers.end(command_buffer, Timer::Surfaces);

        self.end(&params)?;
        Ok(output.commit())
    }

    /// Opens the frame: acquires the final image and resets per-frame state.
    fn begin(&mut self, buffer: &OutputBuffer) -> Result<()> {
        debug_assert!(self.active.is_none(), "begin() while a frame is open");
        let (extent, output, final_image, acquire) = {
            let target = self.targets.get_or_create(
                &self.context,
                &mut self.descriptors,
                &mut self.pipelines,
                &self.config,
                buffer,
            )?;
            (target.extent, target.buffer_id, target.final_image, target.final_state.acquire())
        };

        {
            let device = &self.context.device;
            unsafe {
                device.reset_command_buffer(
                    self.command_buffer,
                    vk::CommandBufferResetFlags::empty(),
                )?;
                let begin_info = vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                device.begin_command_buffer(self.command_buffer, &begin_info)?;
            }
        }

        let command_buffer = self.command_buffer;
        self.timers.reset(command_buffer);
        self.timers.start(command_buffer, Timer::Frame);

        // first use comes out of UNDEFINED, every later frame reacquires
        // from the scanout engine
        let old_layout = match acquire {
            AcquireAction::FromUndefined => vk::ImageLayout::UNDEFINED,
            AcquireAction::FromForeign => vk::ImageLayout::GENERAL,
            AcquireAction::None => {
                return Err(VulkanError::Initialization(
                    "final image already acquired; unbalanced begin/end".to_string(),
                ))
            }
        };
        sync::acquire_from_foreign(
            &self.context.device,
            command_buffer,
            final_image,
            self.context.graphics_family,
            old_layout,
            vk::ImageLayout::GENERAL,
            // the read bit is never exercised by this pipeline; kept as a
            // conservative mask
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
        );

        let intermediate = if self.config.double_intermediate {
            (self.frame_counter % 2) as usize
        } else {
            0
        };
        self.active = Some(ActiveFrame {
            output,
            extent,
            drawn: 0,
            intermediate,
            bound_pipeline: vk::Pipeline::null(),
        });
        Ok(())
    }

    fn composite_handles(&self) -> CompositeHandles {
        let active = self.active.as_ref().expect("no frame open");
        let target = self.targets.get(active.output).expect("active target");
        let set = self.pipelines.get(target.pipeline_index);
        CompositeHandles {
            pass_clear: set.composite_pass_clear,
            pass_load: set.composite_pass_load,
            fill_pipeline: set.fill,
            composite_pipeline: set.composite,
            framebuffer: target.composite_framebuffers[active.intermediate],
            intermediate_image: target.intermediates[active.intermediate].image,
            intermediate_binding: target.intermediates[active.intermediate].binding,
            blur0_image: target.blur_chain[0].image,
            blur0_binding: target.blur_chain[0].binding,
        }
    }

    fn blur_stages(&self) -> (vk::Pipeline, vk::RenderPass, Vec<BlurStage>) {
        let active = self.active.as_ref().expect("no frame open");
        let target = self.targets.get(active.output).expect("active target");
        let set = self.pipelines.get(target.pipeline_index);
        let stages = target
            .blur_chain
            .iter()
            .zip(&target.blur_framebuffers)
            .map(|(stage, &framebuffer)| BlurStage {
                image: stage.image,
                binding: stage.binding,
                framebuffer,
                extent: stage.extent,
            })
            .collect();
        (set.blur, set.blur_pass, stages)
    }

    /// Unconditional frame-boundary marker: a small color-cycling quad that
    /// always clears its own mini render pass.
    fn draw_diagnostic_rect(&mut self) {
        let extent = self.active.as_ref().expect("no frame open").extent;
        let handles = self.composite_handles();

        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: (DIAGNOSTIC_RECT_SIZE as u32).min(extent.width),
                height: (DIAGNOSTIC_RECT_SIZE as u32).min(extent.height),
            },
        };
        let transform =
            Mat4::from_scale(Vec3::new(DIAGNOSTIC_RECT_SIZE, DIAGNOSTIC_RECT_SIZE, 1.0));
        let constants = PushConstants {
            transform: transform.to_cols_array_2d(),
            color: diagnostic_color(self.frame_counter),
            screen_extent: [extent.width as f32, extent.height as f32],
            ..Default::default()
        };

        self.begin_pass(handles.pass_clear, handles.framebuffer, rect, true);
        self.bind_pipeline(handles.fill_pipeline);
        self.set_viewport_scissor(extent, rect);
        self.push_constants(&constants);
        unsafe {
            self.context.device.cmd_draw(self.command_buffer, 4, 1, 0, 0);
            self.context.device.cmd_end_render_pass(self.command_buffer);
        }
    }

    /// Draws one surface: backdrop blur from the current intermediate, then
    /// the textured quad composited on top of it.
    fn draw_surface(
        &mut self,
        surface: &RenderSurface,
        synthetic_id: u32,
        is_focused: bool,
    ) -> Result<()> {
        if self.textures.get(surface.texture).is_none() {
            debug!("surface skipped: texture {:?} unavailable", surface.texture);
            return Ok(());
        }

        let (extent, first_surface) = {
            let active = self.active.as_ref().expect("draw_surface outside a frame");
            (active.extent, active.drawn == 0)
        };

        // (b) acquire the client texture from its producer, at most once
        let (texture_image, texture_binding, acquire) = {
            let texture = self.textures.get_mut(surface.texture).expect("texture exists");
            (texture.image, texture.binding, texture.ownership.acquire())
        };
        match acquire {
            AcquireAction::FromUndefined | AcquireAction::FromForeign => {
                let old_layout = if acquire == AcquireAction::FromUndefined {
                    vk::ImageLayout::UNDEFINED
                } else {
                    vk::ImageLayout::GENERAL
                };
                sync::acquire_from_foreign(
                    &self.context.device,
                    self.command_buffer,
                    texture_image,
                    self.context.graphics_family,
                    old_layout,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::SHADER_READ,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                );
            }
            AcquireAction::None => {}
        }

        // (c) blur region from the destination transform
        let clip = surface_clip_rect(&surface.transform, BLUR_REGION_PADDING, extent);

        let handles = self.composite_handles();

        // (d) the intermediate becomes the blur source
        self.transition_color_to_sampled(handles.intermediate_image);

        // (e) backdrop blur over the clipped region
        self.run_blur(handles.intermediate_binding, self.config.blur_passes, false, clip);

        // (f) first blur-chain image feeds the composite shader
        self.transition_color_to_sampled(handles.blur0_image);

        // (g) composite the surface quad over the blurred backdrop
        let pass = if first_surface { handles.pass_clear } else { handles.pass_load };
        let full = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
        let constants = PushConstants {
            transform: surface.transform.to_cols_array_2d(),
            color: [0.0; 4],
            surface_id_alpha: [
                synthetic_id as f32,
                if surface.absorbs_input { 1.0 } else { 0.0 },
            ],
            surface_extent: [surface.width as f32, surface.height as f32],
            screen_extent: [extent.width as f32, extent.height as f32],
            focused: if is_focused { 1.0 } else { 0.0 },
            seconds_since_spawn: surface.seconds_since_spawn(std::time::Instant::now()),
        };
        self.begin_pass(pass, handles.framebuffer, full, first_surface);
        self.bind_pipeline(handles.composite_pipeline);
        self.set_viewport_scissor(extent, full);
        self.bind_image_sets(&[handles.blur0_binding, texture_binding]);
        self.push_constants(&constants);
        unsafe {
            self.context.device.cmd_draw(self.command_buffer, 4, 1, 0, 0);
            self.context.device.cmd_end_render_pass(self.command_buffer);
        }

        // (h) hand the texture back to its producer, (i) stamp it
        let frame = self.frame_counter;
        let release = {
            let texture = self.textures.get_mut(surface.texture).expect("texture exists");
            texture.last_used_frame = frame;
            texture.ownership.release()
        };
        if release {
            sync::release_to_foreign(
                &self.context.device,
                self.command_buffer,
                texture_image,
                self.context.graphics_family,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            );
        }

        self.active.as_mut().expect("frame open").drawn += 1;
        Ok(())
    }

    /// Closes the frame: cursor readback, full-target blur, postprocess,
    /// submit, wait, and end-of-frame reclamation.
    fn end(&mut self, params: &FrameParams) -> Result<()> {
        let (output, extent, intermediate_index) = {
            let active = self.active.as_ref().expect("end() without begin()");
            (active.output, active.extent, active.intermediate)
        };
        let command_buffer = self.command_buffer;

        struct EndHandles {
            identity_image: vk::Image,
            identity_binding: ImageBinding,
            mirror_image: vk::Image,
            mirror_binding: ImageBinding,
            depth_image: vk::Image,
            depth_binding: ImageBinding,
            intermediate_image: vk::Image,
            intermediate_binding: ImageBinding,
            blur0_image: vk::Image,
            blur0_binding: ImageBinding,
            final_image: vk::Image,
            postprocess_pass: vk::RenderPass,
            postprocess_pipeline: vk::Pipeline,
            postprocess_framebuffer: vk::Framebuffer,
        }
        let handles = {
            let target = self.targets.get(output).expect("active target");
            let set = self.pipelines.get(target.pipeline_index);
            EndHandles {
                identity_image: target.identity.image,
                identity_binding: target.identity.binding,
                mirror_image: target.mirror.image,
                mirror_binding: target.mirror.binding,
                depth_image: target.depth.image,
                depth_binding: target.depth.binding,
                intermediate_image: target.intermediates[intermediate_index].image,
                intermediate_binding: target.intermediates[intermediate_index].binding,
                blur0_image: target.blur_chain[0].image,
                blur0_binding: target.blur_chain[0].binding,
                final_image: target.final_image,
                postprocess_pass: set.postprocess_pass,
                postprocess_pipeline: set.postprocess,
                postprocess_framebuffer: target.postprocess_framebuffer,
            }
        };

        // copy the identity pixel under the cursor into the host mirror
        let cursor_x = params.cursor_x.min(extent.width.saturating_sub(1));
        let cursor_y = params.cursor_y.min(extent.height.saturating_sub(1));
        sync::transition(
            &self.context.device,
            command_buffer,
            handles.identity_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::TRANSFER,
            1,
        );
        sync::copy_image(
            &self.context.device,
            command_buffer,
            handles.identity_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            handles.mirror_image,
            vk::ImageLayout::GENERAL,
            vk::ImageAspectFlags::COLOR,
            vk::Offset3D { x: cursor_x as i32, y: cursor_y as i32, z: 0 },
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Extent3D { width: 1, height: 1, depth: 1 },
        );
        sync::transition(
            &self.context.device,
            command_buffer,
            handles.identity_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            1,
        );

        // full-target thresholded blur over the finished composite
        self.timers.start(command_buffer, Timer::Blur);
        self.transition_color_to_sampled(handles.intermediate_image);
        let full = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
        self.run_blur(
            handles.intermediate_binding,
            self.config.final_blur_passes,
            true,
            full,
        );
        self.transition_color_to_sampled(handles.blur0_image);
        self.timers.end(command_buffer, Timer::Blur);

        if self.config.display_mode == DisplayMode::Depth {
            sync::transition(
                &self.context.device,
                command_buffer,
                handles.depth_image,
                vk::ImageAspectFlags::DEPTH,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                1,
            );
        }

        self.upload_palettes(params)?;

        // postprocess into the presentable image
        self.timers.start(command_buffer, Timer::Postprocess);
        let aux_binding = match self.config.display_mode {
            DisplayMode::Normal => handles.blur0_binding,
            DisplayMode::Depth => handles.depth_binding,
            DisplayMode::Identity => handles.identity_binding,
        };
        let constants = PushConstants {
            surface_id_alpha: [
                self.config.display_mode.shader_value(),
                params.colorscheme_ratio.clamp(0.0, 1.0),
            ],
            surface_extent: [params.src_scheme as f32, params.dst_scheme as f32],
            screen_extent: [extent.width as f32, extent.height as f32],
            ..Default::default()
        };
        self.begin_pass(handles.postprocess_pass, handles.postprocess_framebuffer, full, false);
        self.bind_pipeline(handles.postprocess_pipeline);
        self.set_viewport_scissor(extent, full);
        self.bind_image_sets(&[
            handles.intermediate_binding,
            handles.mirror_binding,
            aux_binding,
        ]);
        self.bind_palette_set();
        self.push_constants(&constants);
        unsafe {
            self.context.device.cmd_draw(command_buffer, 4, 1, 0, 0);
            self.context.device.cmd_end_render_pass(command_buffer);
        }
        self.timers.end(command_buffer, Timer::Postprocess);

        // hand the final image to the scanout engine
        let release = {
            let target = self.targets.get_mut(output).expect("active target");
            target.final_state.release()
        };
        if release {
            sync::release_to_foreign(
                &self.context.device,
                command_buffer,
                handles.final_image,
                self.context.graphics_family,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            );
        }

        self.timers.end(command_buffer, Timer::Frame);
        unsafe {
            self.context.device.end_command_buffer(command_buffer)?;
        }

        // synchronous submit: nothing proceeds until this frame retires
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            self.context.device.queue_submit(
                self.context.graphics_queue,
                &[submit_info.build()],
                self.frame_fence,
            )?;
            self.context.device.wait_for_fences(&[self.frame_fence], true, u64::MAX)?;
            self.context.device.reset_fences(&[self.frame_fence])?;
        }

        self.timers.collect(self.frame_counter)?;
        let device = self.context.device.clone();
        self.textures.drain_retired(&device, &mut self.descriptors, self.frame_counter);
        self.frame_counter += 1;
        self.staging.reset();
        self.active = None;
        Ok(())
    }

    /// The shared downsample/upsample ping-pong over the blur chain. The
    /// caller has already made `source_binding`'s image sampleable.
    fn run_blur(
        &mut self,
        source_binding: ImageBinding,
        passes: u32,
        threshold: bool,
        region: vk::Rect2D,
    ) {
        let sequence = blur_target_sequence(passes);
        let (pipeline, pass, stages) = self.blur_stages();
        debug_assert!(
            sequence.iter().all(|&index| index < stages.len()),
            "blur pass count exceeds chain length"
        );
        let passes = passes as usize;

        let mut previous: Option<usize> = None;
        for (i, &target_index) in sequence.iter().enumerate() {
            let source = match previous {
                None => source_binding,
                Some(prev_index) => {
                    // the previous stage was just written; make it sampleable
                    self.transition_color_to_sampled(stages[prev_index].image);
                    stages[prev_index].binding
                }
            };
            let mode = if i == 0 && threshold {
                BLUR_MODE_DOWN_THRESHOLD
            } else if i >= passes {
                BLUR_MODE_UP
            } else {
                BLUR_MODE_DOWN
            };
            let stage = stages[target_index];
            let scissor = clamp_rect(scale_rect(region, (target_index + 1) as u32), stage.extent);
            let constants = PushConstants {
                color: [1.5, self.config.blur_brightness_threshold, 0.0, mode],
                screen_extent: [stage.extent.width as f32, stage.extent.height as f32],
                ..Default::default()
            };
            // the scaled clip region doubles as the pass's clear region
            self.begin_pass(pass, stage.framebuffer, scissor, true);
            self.bind_pipeline(pipeline);
            self.set_viewport_scissor(stage.extent, scissor);
            self.bind_image_sets(&[source]);
            self.push_constants(&constants);
            unsafe {
                self.context.device.cmd_draw(self.command_buffer, 4, 1, 0, 0);
                self.context.device.cmd_end_render_pass(self.command_buffer);
            }
            previous = Some(target_index);
        }
    }

    /// Stages both active palettes and copies them into the device-local
    /// uniform buffer read by the postprocess shader.
    fn upload_palettes(&mut self, params: &FrameParams) -> Result<()> {
        let bytes = {
            let schemes = &self.config.color_schemes;
            let pick = |index: usize| schemes.get(index).unwrap_or(&schemes[0]);
            let mut bytes = Vec::with_capacity(PALETTE_BYTES as usize);
            for scheme in [pick(params.src_scheme), pick(params.dst_scheme)] {
                for color in scheme.padded() {
                    bytes.extend_from_slice(bytemuck::bytes_of(&color));
                }
            }
            bytes
        };
        debug_assert_eq!(bytes.len() as u64, PALETTE_BYTES);

        let allocation = self.staging.allocate(&self.context, PALETTE_BYTES)?;
        allocation.write_bytes(&bytes);

        let device = &self.context.device;
        let region = vk::BufferCopy::builder()
            .src_offset(allocation.offset)
            .dst_offset(0)
            .size(PALETTE_BYTES)
            .build();
        unsafe {
            device.cmd_copy_buffer(
                self.command_buffer,
                allocation.buffer,
                self.palette_buffer,
                &[region],
            );
            let barrier = vk::BufferMemoryBarrier::builder()
                .buffer(self.palette_buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::UNIFORM_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .build();
            device.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        Ok(())
    }

    fn transition_color_to_sampled(&self, image: vk::Image) {
        sync::transition(
            &self.context.device,
            self.command_buffer,
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            1,
        );
    }

    fn begin_pass(
        &self,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear: bool,
    ) {
        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 1.0] } },
            vk::ClearValue { color: vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 0.0] } },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(if clear { &clear_values } else { &[] });
        unsafe {
            self.context.device.cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        let active = self.active.as_mut().expect("bind outside a frame");
        if active.bound_pipeline == pipeline {
            return;
        }
        unsafe {
            self.context.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
        active.bound_pipeline = pipeline;
    }

    fn bind_image_sets(&self, bindings: &[ImageBinding]) {
        let sets: Vec<vk::DescriptorSet> = bindings.iter().map(|binding| binding.set).collect();
        unsafe {
            self.context.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.pipeline_layout,
                0,
                &sets,
                &[],
            );
        }
    }

    fn bind_palette_set(&self) {
        unsafe {
            self.context.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipelines.pipeline_layout,
                3,
                &[self.palette_set],
                &[],
            );
        }
    }

    fn set_viewport_scissor(&self, extent: vk::Extent2D, scissor: vk::Rect2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.context.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.context.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn push_constants(&self, constants: &PushConstants) {
        unsafe {
            self.context.device.cmd_push_constants(
                self.command_buffer,
                self.pipelines.pipeline_layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(constants),
            );
        }
    }
}

fn create_palette_buffer(context: &VulkanContext) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let device = &context.device;
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(PALETTE_BYTES)
        .usage(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.create_buffer(&buffer_info, None) }?;
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let memory_type = context.find_memory_type_index(
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    let allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);
    let memory = unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| {
        unsafe { device.destroy_buffer(buffer, None) };
        VulkanError::ResourceCreation { resource: "palette buffer", message: e.to_string() }
    })?;
    unsafe { device.bind_buffer_memory(buffer, memory, 0) }?;
    Ok((buffer, memory))
}

fn create_palette_binding(
    device: &ash::Device,
    layout: vk::DescriptorSetLayout,
    buffer: vk::Buffer,
) -> Result<(vk::DescriptorPool, vk::DescriptorSet)> {
    let pool_sizes = [vk::DescriptorPoolSize::builder()
        .ty(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .build()];
    let pool_info = vk::DescriptorPoolCreateInfo::builder().max_sets(1).pool_sizes(&pool_sizes);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }?;

    let layouts = [layout];
    let allocate_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let set = unsafe { device.allocate_descriptor_sets(&allocate_info) }?[0];

    let buffer_info = vk::DescriptorBufferInfo::builder()
        .buffer(buffer)
        .offset(0)
        .range(PALETTE_BYTES)
        .build();
    let buffer_infos = [buffer_info];
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(0)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(&buffer_infos)
        .build();
    unsafe { device.update_descriptor_sets(&[write], &[]) };
    Ok((pool, set))
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        let device = self.context.device.clone();
        unsafe {
            if let Err(e) = device.device_wait_idle() {
                error!("device_wait_idle failed in FrameRenderer drop: {}", e);
            }
            device.destroy_fence(self.frame_fence, None);
            device.free_command_buffers(self.context.command_pool, &[self.command_buffer]);
            device.destroy_descriptor_pool(self.palette_pool, None);
            device.destroy_buffer(self.palette_buffer, None);
            device.free_memory(self.palette_memory, None);
        }
        self.textures.destroy_all(&device, &mut self.descriptors);
        self.targets.destroy_all(&mut self.descriptors);
        if self.active.is_some() {
            warn!("FrameRenderer dropped with an open frame");
        }
        debug!("FrameRenderer dropped after {} frames.", self.frame_counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blur_sequence_has_2p_minus_1_draws() {
        for passes in 1..=8u32 {
            let sequence = blur_target_sequence(passes);
            assert_eq!(sequence.len(), (2 * passes - 1) as usize);
        }
    }

    #[test]
    fn blur_sequence_descends_then_climbs_back() {
        assert_eq!(blur_target_sequence(1), vec![0]);
        assert_eq!(blur_target_sequence(3), vec![0, 1, 2, 1, 0]);
        assert_eq!(blur_target_sequence(4), vec![0, 1, 2, 3, 2, 1, 0]);
    }

    #[test]
    fn blur_sequence_matches_index_formula() {
        let passes = 5usize;
        let sequence = blur_target_sequence(passes as u32);
        for (i, &target) in sequence.iter().enumerate() {
            if i < passes {
                assert_eq!(target, i);
            } else {
                assert_eq!(target, 2 * passes - i - 2);
            }
        }
    }

    #[test]
    fn blur_sequence_fits_the_chain() {
        // the chain holds 2×passes images, the sequence only touches the
        // first `passes` of them
        for passes in 1..=8u32 {
            let chain_len = (passes * 2) as usize;
            assert!(blur_target_sequence(passes).iter().all(|&index| index < chain_len));
        }
    }

    #[test]
    fn scaled_rects_never_collapse_to_zero() {
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 100, y: 50 },
            extent: vk::Extent2D { width: 3, height: 3 },
        };
        let scaled = scale_rect(rect, 4);
        assert_eq!(scaled.offset, vk::Offset2D { x: 6, y: 3 });
        assert_eq!(scaled.extent, vk::Extent2D { width: 1, height: 1 });
    }

    #[test]
    fn clamp_rect_stays_inside_bounds() {
        let bounds = vk::Extent2D { width: 100, height: 100 };
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 90, y: 120 },
            extent: vk::Extent2D { width: 50, height: 50 },
        };
        let clamped = clamp_rect(rect, bounds);
        assert_eq!(clamped.offset, vk::Offset2D { x: 90, y: 99 });
        assert_eq!(clamped.extent, vk::Extent2D { width: 10, height: 1 });
    }

    #[test]
    fn clip_rect_is_padded_and_clamped() {
        let bounds = vk::Extent2D { width: 1920, height: 1080 };
        let transform = Mat4::from_scale_rotation_translation(
            Vec3::new(400.0, 300.0, 1.0),
            glam::Quat::IDENTITY,
            Vec3::new(100.0, 50.0, 0.0),
        );
        let rect = surface_clip_rect(&transform, 64.0, bounds);
        // 100..500 padded to 36..564, 50..350 padded to -14..414 clamps to 0
        assert_eq!(rect.offset, vk::Offset2D { x: 36, y: 0 });
        assert_eq!(rect.extent, vk::Extent2D { width: 528, height: 414 });
    }

    #[test]
    fn clip_rect_clamps_to_target_bounds() {
        let bounds = vk::Extent2D { width: 800, height: 600 };
        let transform = Mat4::from_scale_rotation_translation(
            Vec3::new(2000.0, 2000.0, 1.0),
            glam::Quat::IDENTITY,
            Vec3::new(-500.0, -500.0, 0.0),
        );
        let rect = surface_clip_rect(&transform, 64.0, bounds);
        assert_eq!(rect.offset, vk::Offset2D { x: 0, y: 0 });
        assert_eq!(rect.extent, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn hit_decoding_respects_background_and_passthrough() {
        assert_eq!(decode_hit([0.0, 0.0, 0.0, 0.0]), None);
        // passthrough decoration: id set but hit flag clear
        assert_eq!(decode_hit([2.0, 0.5, 0.5, 0.0]), None);
        let hit = decode_hit([2.0, 0.25, 0.75, 1.0]).unwrap();
        assert_eq!(hit.surface, 1);
        assert!((hit.u - 0.25).abs() < 1e-6);
        assert!((hit.v - 0.75).abs() < 1e-6);
    }

    #[test]
    fn diagnostic_color_cycles_and_stays_in_range() {
        let a = diagnostic_color(0);
        let b = diagnostic_color(40);
        assert_ne!(a, b);
        for frame in [0u64, 17, 59, 119, 120, 500] {
            for channel in diagnostic_color(frame) {
                assert!((0.0..=1.0).contains(&channel));
            }
        }
        // period of 120 frames
        assert_eq!(diagnostic_color(7), diagnostic_color(127));
    }
}
