//! Format-keyed render passes and graphics pipelines.
//!
//! Presentable buffers arrive in whatever pixel format the display stack
//! hands us; render passes and pipelines are immutable once built, so a
//! [`PipelineCache`] lazily builds one [`FormatPipelines`] per distinct
//! format and every render target of that format shares it. Four pipelines
//! cover the whole frame: a solid quad fill, the textured surface quad,
//! the blur stage and the postprocess stage. All of them share one
//! pipeline layout and one 112-byte push-constant block.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::{debug, info};

use crate::error::{Result, VulkanError};

/// Format of the per-pixel identity/UV attachment: surface id, u, v, flags.
pub const IDENTITY_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Blur shader modes, pushed in `PushConstants::color[3]`.
pub const BLUR_MODE_DOWN: f32 = 0.0;
pub const BLUR_MODE_DOWN_THRESHOLD: f32 = 1.0;
pub const BLUR_MODE_UP: f32 = 2.0;

/// The push-constant block shared by every shader stage.
///
/// The byte layout is load-bearing: all eight SPIR-V modules declare this
/// exact block, and the blur/postprocess stages reinterpret `color` and
/// `surface_id_alpha` as their mode parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PushConstants {
    /// Maps the unit quad to clip space.
    pub transform: [[f32; 4]; 4],
    /// Fill color; blur passes reuse it as (radius, threshold, _, mode).
    pub color: [f32; 4],
    /// Hit-test id and whether hits register; postprocess reuses it as
    /// (display mode, colorscheme ratio).
    pub surface_id_alpha: [f32; 2],
    /// Surface size in pixels; postprocess reuses it as scheme indices.
    pub surface_extent: [f32; 2],
    pub screen_extent: [f32; 2],
    pub focused: f32,
    pub seconds_since_spawn: f32,
}

pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;
const _: () = assert!(std::mem::size_of::<PushConstants>() == 112);

impl Default for PushConstants {
    fn default() -> Self {
        Self {
            transform: glam::Mat4::IDENTITY.to_cols_array_2d(),
            color: [0.0; 4],
            surface_id_alpha: [0.0; 2],
            surface_extent: [0.0; 2],
            screen_extent: [0.0; 2],
            focused: 0.0,
            seconds_since_spawn: 0.0,
        }
    }
}

/// Loads SPIR-V bytecode from disk. The word stream must be 4-byte sized.
pub fn load_spirv_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| {
        VulkanError::ShaderLoading(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    if buffer.len() % 4 != 0 {
        return Err(VulkanError::ShaderLoading(format!(
            "{} is not a multiple of 4 bytes",
            path.display()
        )));
    }
    Ok(buffer)
}

fn create_shader_module(device: &ash::Device, spirv: &[u8]) -> Result<vk::ShaderModule> {
    debug_assert!(spirv.len() % 4 == 0);
    let words =
        unsafe { std::slice::from_raw_parts(spirv.as_ptr() as *const u32, spirv.len() / 4) };
    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| VulkanError::ShaderLoading(format!("shader module creation failed: {}", e)))
}

/// Creates one framebuffer for `render_pass` over the given attachments.
pub fn create_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    attachments: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let create_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);
    unsafe { device.create_framebuffer(&create_info, None) }.map_err(|e| {
        VulkanError::ResourceCreation { resource: "framebuffer", message: e.to_string() }
    })
}

/// Growth-free table keyed by `vk::Format`; entry indices are stable, so an
/// index held by a render target identifies one shared entry for good.
pub struct FormatTable<T> {
    entries: Vec<(vk::Format, T)>,
}

impl<T> FormatTable<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn index_of(&self, format: vk::Format) -> Option<usize> {
        self.entries.iter().position(|(key, _)| *key == format)
    }

    pub fn get_or_insert_with(
        &mut self,
        format: vk::Format,
        build: impl FnOnce() -> Result<T>,
    ) -> Result<usize> {
        if let Some(index) = self.index_of(format) {
            return Ok(index);
        }
        let entry = build()?;
        self.entries.push((format, entry));
        Ok(self.entries.len() - 1)
    }

    pub fn get(&self, index: usize) -> &T {
        &self.entries[index].1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, entry)| entry)
    }
}

impl<T> Default for FormatTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct ShaderSet {
    fill_vert: vk::ShaderModule,
    fill_frag: vk::ShaderModule,
    composite_vert: vk::ShaderModule,
    composite_frag: vk::ShaderModule,
    blur_vert: vk::ShaderModule,
    blur_frag: vk::ShaderModule,
    post_vert: vk::ShaderModule,
    post_frag: vk::ShaderModule,
}

impl ShaderSet {
    fn load(device: &ash::Device, dir: &Path) -> Result<Self> {
        let load = |name: &str| -> Result<vk::ShaderModule> {
            let code = load_spirv_file(&dir.join(name))?;
            create_shader_module(device, &code)
        };
        Ok(Self {
            fill_vert: load("fill.vert.spv")?,
            fill_frag: load("fill.frag.spv")?,
            composite_vert: load("composite.vert.spv")?,
            composite_frag: load("composite.frag.spv")?,
            blur_vert: load("blur.vert.spv")?,
            blur_frag: load("blur.frag.spv")?,
            post_vert: load("post.vert.spv")?,
            post_frag: load("post.frag.spv")?,
        })
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_shader_module(self.fill_vert, None);
            device.destroy_shader_module(self.fill_frag, None);
            device.destroy_shader_module(self.composite_vert, None);
            device.destroy_shader_module(self.composite_frag, None);
            device.destroy_shader_module(self.blur_vert, None);
            device.destroy_shader_module(self.blur_frag, None);
            device.destroy_shader_module(self.post_vert, None);
            device.destroy_shader_module(self.post_frag, None);
        }
    }
}

/// Render passes and pipelines for one presentable pixel format.
pub struct FormatPipelines {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    /// Composite pass that clears its render area (first draw of a frame,
    /// diagnostic rect).
    pub composite_pass_clear: vk::RenderPass,
    /// Composite pass that preserves existing content.
    pub composite_pass_load: vk::RenderPass,
    pub blur_pass: vk::RenderPass,
    pub postprocess_pass: vk::RenderPass,
    pub fill: vk::Pipeline,
    pub composite: vk::Pipeline,
    pub blur: vk::Pipeline,
    pub postprocess: vk::Pipeline,
}

impl FormatPipelines {
    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.fill, None);
            device.destroy_pipeline(self.composite, None);
            device.destroy_pipeline(self.blur, None);
            device.destroy_pipeline(self.postprocess, None);
            device.destroy_render_pass(self.composite_pass_clear, None);
            device.destroy_render_pass(self.composite_pass_load, None);
            device.destroy_render_pass(self.blur_pass, None);
            device.destroy_render_pass(self.postprocess_pass, None);
        }
    }
}

/// Lazily builds and owns one [`FormatPipelines`] per pixel format, plus
/// the pipeline layout they all share.
pub struct PipelineCache {
    device: ash::Device,
    shader_dir: PathBuf,
    shaders: Option<ShaderSet>,
    pub depth_format: vk::Format,
    pub pipeline_layout: vk::PipelineLayout,
    /// Set layout for the palette uniform buffer (set 3).
    pub ubo_layout: vk::DescriptorSetLayout,
    sets: FormatTable<FormatPipelines>,
}

impl PipelineCache {
    pub fn new(
        device: &ash::Device,
        sampler_layout: vk::DescriptorSetLayout,
        depth_format: vk::Format,
        shader_dir: PathBuf,
    ) -> Result<Self> {
        let ubo_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build();
        let ubo_bindings = [ubo_binding];
        let ubo_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&ubo_bindings);
        let ubo_layout = unsafe { device.create_descriptor_set_layout(&ubo_layout_info, None) }?;

        // set 0: backdrop, set 1: surface texture, set 2: identity/extra,
        // set 3: palette UBO
        let set_layouts = [sampler_layout, sampler_layout, sampler_layout, ubo_layout];
        let push_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)
            .build();
        let push_ranges = [push_range];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }?;
        debug!("Shared pipeline layout created: {:?}", pipeline_layout);

        Ok(Self {
            device: device.clone(),
            shader_dir,
            shaders: None,
            depth_format,
            pipeline_layout,
            ubo_layout,
            sets: FormatTable::new(),
        })
    }

    /// Index of the pipeline set for `format`, building it on first use.
    pub fn get_or_create(&mut self, format: vk::Format) -> Result<usize> {
        if let Some(index) = self.sets.index_of(format) {
            return Ok(index);
        }
        if self.shaders.is_none() {
            self.shaders = Some(ShaderSet::load(&self.device, &self.shader_dir)?);
            info!("Shader modules loaded from {}", self.shader_dir.display());
        }
        let shaders = self.shaders.as_ref().unwrap();
        let device = self.device.clone();
        let depth_format = self.depth_format;
        let pipeline_layout = self.pipeline_layout;
        let index = self.sets.get_or_insert_with(format, || {
            build_format_pipelines(&device, shaders, pipeline_layout, format, depth_format)
        })?;
        info!("Pipeline set {} built for format {:?}", index, format);
        Ok(index)
    }

    pub fn get(&self, index: usize) -> &FormatPipelines {
        self.sets.get(index)
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        for set in self.sets.iter() {
            set.destroy(&self.device);
        }
        if let Some(shaders) = self.shaders.take() {
            shaders.destroy(&self.device);
        }
        unsafe {
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(self.ubo_layout, None);
        }
        debug!("PipelineCache destroyed.");
    }
}

fn build_format_pipelines(
    device: &ash::Device,
    shaders: &ShaderSet,
    pipeline_layout: vk::PipelineLayout,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<FormatPipelines> {
    let composite_pass_clear =
        create_composite_pass(device, color_format, depth_format, true)?;
    let composite_pass_load = create_composite_pass(device, color_format, depth_format, false)?;
    // each blur draw clears its render area (the scaled clip region)
    let blur_pass = create_single_color_pass(
        device,
        color_format,
        vk::AttachmentLoadOp::CLEAR,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    )?;
    // final image lives in GENERAL from the begin-of-frame acquire barrier
    let postprocess_pass = create_single_color_pass(
        device,
        color_format,
        vk::AttachmentLoadOp::DONT_CARE,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::GENERAL,
    )?;

    let fill = build_pipeline(
        device,
        pipeline_layout,
        shaders.fill_vert,
        shaders.fill_frag,
        composite_pass_clear,
        2,
        true,
        false,
    )?;
    let composite = build_pipeline(
        device,
        pipeline_layout,
        shaders.composite_vert,
        shaders.composite_frag,
        composite_pass_load,
        2,
        true,
        true,
    )?;
    let blur = build_pipeline(
        device,
        pipeline_layout,
        shaders.blur_vert,
        shaders.blur_frag,
        blur_pass,
        1,
        false,
        false,
    )?;
    let postprocess = build_pipeline(
        device,
        pipeline_layout,
        shaders.post_vert,
        shaders.post_frag,
        postprocess_pass,
        1,
        false,
        false,
    )?;

    Ok(FormatPipelines {
        color_format,
        depth_format,
        composite_pass_clear,
        composite_pass_load,
        blur_pass,
        postprocess_pass,
        fill,
        composite,
        blur,
        postprocess,
    })
}

/// The per-surface pass: intermediate color + identity/UV + depth.
fn create_composite_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
    clear: bool,
) -> Result<vk::RenderPass> {
    let (load_op, color_initial) = if clear {
        (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED)
    } else {
        // the intermediate was last sampled by the blur stage
        (vk::AttachmentLoadOp::LOAD, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    };
    let identity_initial = if clear {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    };
    let depth_initial = if clear {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    };

    let attachments = [
        vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(color_initial)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build(),
        vk::AttachmentDescription::builder()
            .format(IDENTITY_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(identity_initial)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build(),
        vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(depth_initial)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build(),
    ];

    let color_refs = [
        vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build(),
        vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build(),
    ];
    let depth_ref = vk::AttachmentReference::builder()
        .attachment(2)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build();
    let subpasses = [subpass];

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::SHADER_READ)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();
    let dependencies = [dependency];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&create_info, None) }.map_err(|e| {
        VulkanError::ResourceCreation { resource: "composite render pass", message: e.to_string() }
    })
}

/// One-attachment pass used by both the blur stages and postprocess.
fn create_single_color_pass(
    device: &ash::Device,
    color_format: vk::Format,
    load_op: vk::AttachmentLoadOp,
    initial_layout: vk::ImageLayout,
    final_layout: vk::ImageLayout,
) -> Result<vk::RenderPass> {
    let attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(initial_layout)
        .final_layout(final_layout)
        .build();
    let attachments = [attachment];

    let color_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();
    let color_refs = [color_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .build();
    let subpasses = [subpass];

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
        .src_access_mask(vk::AccessFlags::SHADER_READ)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();
    let dependencies = [dependency];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&create_info, None) }.map_err(|e| {
        VulkanError::ResourceCreation { resource: "color render pass", message: e.to_string() }
    })
}

#[allow(clippy::too_many_arguments)]
fn build_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    vertex_shader: vk::ShaderModule,
    fragment_shader: vk::ShaderModule,
    render_pass: vk::RenderPass,
    color_attachment_count: usize,
    with_depth: bool,
    alpha_blend: bool,
) -> Result<vk::Pipeline> {
    let entry_point = std::ffi::CString::new("main").unwrap();
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_shader)
            .name(&entry_point)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_shader)
            .name(&entry_point)
            .build(),
    ];

    // quads come out of gl_VertexIndex, no vertex buffers anywhere
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_FAN)
        .primitive_restart_enable(false);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    // surfaces arrive pre-sorted back to front, the depth attachment only
    // records which surface ended up on top
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(with_depth)
        .depth_write_enable(with_depth)
        .depth_compare_op(vk::CompareOp::ALWAYS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_attachment = if alpha_blend {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()
    };
    let mut blend_attachments = vec![blend_attachment; color_attachment_count];
    if alpha_blend && color_attachment_count > 1 {
        // identity attachment carries ids, never blend it
        blend_attachments[1] = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
    }
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    }
    .map_err(|(created, result)| {
        for pipeline in created {
            unsafe { device.destroy_pipeline(pipeline, None) };
        }
        VulkanError::PipelineCreation(format!("{:?}", result))
    })?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_block_is_112_bytes() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 112);
        assert_eq!(PUSH_CONSTANT_SIZE, 112);
    }

    #[test]
    fn push_constant_field_offsets_are_fixed() {
        use std::mem::offset_of;
        assert_eq!(offset_of!(PushConstants, transform), 0);
        assert_eq!(offset_of!(PushConstants, color), 64);
        assert_eq!(offset_of!(PushConstants, surface_id_alpha), 80);
        assert_eq!(offset_of!(PushConstants, surface_extent), 88);
        assert_eq!(offset_of!(PushConstants, screen_extent), 96);
        assert_eq!(offset_of!(PushConstants, focused), 104);
        assert_eq!(offset_of!(PushConstants, seconds_since_spawn), 108);
    }

    #[test]
    fn format_table_shares_one_entry_per_format() {
        let mut table: FormatTable<u32> = FormatTable::new();
        let a = table
            .get_or_insert_with(vk::Format::B8G8R8A8_UNORM, || Ok(1))
            .unwrap();
        let b = table
            .get_or_insert_with(vk::Format::R8G8B8A8_UNORM, || Ok(2))
            .unwrap();
        // second lookup of an existing format must not build again
        let a_again = table
            .get_or_insert_with(vk::Format::B8G8R8A8_UNORM, || panic!("rebuilt"))
            .unwrap();
        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(*table.get(a), 1);
    }
}
