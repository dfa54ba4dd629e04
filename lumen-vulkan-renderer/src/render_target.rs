//! Per-output render targets.
//!
//! Each distinct presentable buffer (one per output, plus one per cursor
//! size) owns a [`RenderTarget`]: the imported final image, the depth and
//! identity/UV images, the intermediate composite image(s) and the blur
//! chain, together with the framebuffers and descriptor bindings that
//! reference them. Targets are created lazily the first time a buffer id is
//! seen and torn down exactly once, when the buffer's destroy notification
//! arrives. Bindings are freed before their images.

use std::collections::HashMap;
use std::ffi::c_void;

use ash::vk;
use log::{debug, info, warn};

use crate::config::RendererConfig;
use crate::descriptors::{DescriptorAllocator, ImageBinding};
use crate::device::VulkanContext;
use crate::error::{Result, VulkanError};
use crate::pipelines::{create_framebuffer, PipelineCache, IDENTITY_FORMAT};
use crate::scene::{OutputBuffer, OutputId};
use crate::texture::{import_dmabuf_image, Ownership};

/// Extent of blur-chain image `index`: each step halves the linear
/// resolution of the target, floored at 1×1.
pub fn blur_extent(base: vk::Extent2D, index: usize) -> vk::Extent2D {
    let shift = (index + 1).min(31) as u32;
    vk::Extent2D {
        width: (base.width >> shift).max(1),
        height: (base.height >> shift).max(1),
    }
}

/// A GPU-only image owned by a render target, with its sampled binding.
pub struct TargetImage {
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub binding: ImageBinding,
}

impl TargetImage {
    #[allow(clippy::too_many_arguments)]
    fn new(
        context: &VulkanContext,
        descriptors: &mut DescriptorAllocator,
        sampler: vk::Sampler,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        sampled_layout: vk::ImageLayout,
    ) -> Result<Self> {
        let device = &context.device;
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = unsafe { device.create_image(&image_info, None) }.map_err(|e| {
            VulkanError::ResourceCreation { resource: "target image", message: e.to_string() }
        })?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = context
            .find_memory_type_index(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .map_err(|e| {
                unsafe { device.destroy_image(image, None) };
                e
            })?;
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| {
            unsafe { device.destroy_image(image, None) };
            VulkanError::ResourceCreation {
                resource: "target image memory",
                message: e.to_string(),
            }
        })?;
        unsafe { device.bind_image_memory(image, memory, 0) }?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { device.create_image_view(&view_info, None) }?;

        let binding = descriptors.allocate_binding()?;
        descriptors.write_sampled_image(&binding, view, sampler, sampled_layout);

        Ok(Self { image, memory, view, extent, binding })
    }

    fn destroy(self, device: &ash::Device, descriptors: &mut DescriptorAllocator) {
        descriptors.free(self.binding);
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// The 1×1 host-readable mirror of the identity pixel under the cursor.
pub struct MirrorImage {
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    mapped: *mut c_void,
    pub binding: ImageBinding,
}

impl MirrorImage {
    fn new(
        context: &VulkanContext,
        descriptors: &mut DescriptorAllocator,
        sampler: vk::Sampler,
    ) -> Result<Self> {
        let device = &context.device;
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(IDENTITY_FORMAT)
            .extent(vk::Extent3D { width: 1, height: 1, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = unsafe { device.create_image(&image_info, None) }?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = context.find_memory_type_index(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe { device.allocate_memory(&allocate_info, None) }?;
        unsafe { device.bind_image_memory(image, memory, 0) }?;
        let mapped = unsafe {
            device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(IDENTITY_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { device.create_image_view(&view_info, None) }?;

        let binding = descriptors.allocate_binding()?;
        descriptors.write_sampled_image(&binding, view, sampler, vk::ImageLayout::GENERAL);

        Ok(Self { image, memory, view, mapped, binding })
    }

    /// Reads the mirrored identity pixel: (surface id, u, v, hit flag).
    pub fn read(&self) -> [f32; 4] {
        let mut out = [0.0f32; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.mapped as *const f32, out.as_mut_ptr(), 4);
        }
        out
    }

    fn destroy(self, device: &ash::Device, descriptors: &mut DescriptorAllocator) {
        descriptors.free(self.binding);
        unsafe {
            device.destroy_image_view(self.view, None);
            device.unmap_memory(self.memory);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Complete per-buffer image set. See module docs.
pub struct RenderTarget {
    pub buffer_id: OutputId,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    /// Index into the [`PipelineCache`]; shared across same-format targets.
    pub pipeline_index: usize,

    pub final_image: vk::Image,
    final_memory: vk::DeviceMemory,
    pub final_view: vk::ImageView,
    /// Acquire tracking for the final image; `Uninitialized` until the
    /// first frame ever drawn into this target.
    pub final_state: Ownership,

    pub depth: TargetImage,
    pub identity: TargetImage,
    pub mirror: MirrorImage,
    pub intermediates: Vec<TargetImage>,
    pub blur_chain: Vec<TargetImage>,

    /// One composite framebuffer per intermediate, usable with both the
    /// clear and load variants of the composite pass.
    pub composite_framebuffers: Vec<vk::Framebuffer>,
    pub blur_framebuffers: Vec<vk::Framebuffer>,
    pub postprocess_framebuffer: vk::Framebuffer,
}

impl RenderTarget {
    #[allow(clippy::too_many_arguments)]
    fn new(
        context: &VulkanContext,
        descriptors: &mut DescriptorAllocator,
        pipelines: &mut PipelineCache,
        config: &RendererConfig,
        linear_sampler: vk::Sampler,
        nearest_sampler: vk::Sampler,
        buffer: &OutputBuffer,
    ) -> Result<Self> {
        let device = &context.device;
        let extent = vk::Extent2D { width: buffer.width, height: buffer.height };
        info!(
            "creating render target for buffer {:?}: {}x{} {:?}",
            buffer.id, buffer.width, buffer.height, buffer.format
        );

        let pipeline_index = pipelines.get_or_create(buffer.format)?;
        let depth_format = pipelines.depth_format;

        let (final_image, final_memory) = import_dmabuf_image(
            context,
            &buffer.dmabuf,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )?;
        let final_view_info = vk::ImageViewCreateInfo::builder()
            .image(final_image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(buffer.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let final_view = unsafe { device.create_image_view(&final_view_info, None) }?;

        let depth = TargetImage::new(
            context,
            descriptors,
            nearest_sampler,
            extent,
            depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        let identity = TargetImage::new(
            context,
            descriptors,
            nearest_sampler,
            extent,
            IDENTITY_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        let mirror = MirrorImage::new(context, descriptors, nearest_sampler)?;

        let intermediate_count = if config.double_intermediate { 2 } else { 1 };
        let mut intermediates = Vec::with_capacity(intermediate_count);
        for _ in 0..intermediate_count {
            intermediates.push(TargetImage::new(
                context,
                descriptors,
                linear_sampler,
                extent,
                buffer.format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?);
        }

        let chain_len = config.blur_chain_len();
        let mut blur_chain = Vec::with_capacity(chain_len);
        for index in 0..chain_len {
            blur_chain.push(TargetImage::new(
                context,
                descriptors,
                linear_sampler,
                blur_extent(extent, index),
                buffer.format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?);
        }

        let format_set = pipelines.get(pipeline_index);
        let mut composite_framebuffers = Vec::with_capacity(intermediates.len());
        for intermediate in &intermediates {
            composite_framebuffers.push(create_framebuffer(
                device,
                format_set.composite_pass_clear,
                &[intermediate.view, identity.view, depth.view],
                extent,
            )?);
        }
        let mut blur_framebuffers = Vec::with_capacity(blur_chain.len());
        for stage in &blur_chain {
            blur_framebuffers.push(create_framebuffer(
                device,
                format_set.blur_pass,
                &[stage.view],
                stage.extent,
            )?);
        }
        let postprocess_framebuffer = create_framebuffer(
            device,
            format_set.postprocess_pass,
            &[final_view],
            extent,
        )?;

        debug!(
            "render target {:?} ready: {} intermediates, {} blur stages",
            buffer.id,
            intermediates.len(),
            blur_chain.len()
        );
        Ok(Self {
            buffer_id: buffer.id,
            extent,
            format: buffer.format,
            pipeline_index,
            final_image,
            final_memory,
            final_view,
            final_state: Ownership::Uninitialized,
            depth,
            identity,
            mirror,
            intermediates,
            blur_chain,
            composite_framebuffers,
            blur_framebuffers,
            postprocess_framebuffer,
        })
    }

    fn destroy(self, device: &ash::Device, descriptors: &mut DescriptorAllocator) {
        unsafe {
            for framebuffer in self.composite_framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for framebuffer in self.blur_framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            device.destroy_framebuffer(self.postprocess_framebuffer, None);
        }
        for stage in self.blur_chain {
            stage.destroy(device, descriptors);
        }
        for intermediate in self.intermediates {
            intermediate.destroy(device, descriptors);
        }
        self.mirror.destroy(device, descriptors);
        self.identity.destroy(device, descriptors);
        self.depth.destroy(device, descriptors);
        unsafe {
            device.destroy_image_view(self.final_view, None);
            device.destroy_image(self.final_image, None);
            device.free_memory(self.final_memory, None);
        }
        debug!("render target destroyed");
    }
}

/// Live render targets keyed by buffer id, plus the shared samplers.
pub struct RenderTargetSet {
    device: ash::Device,
    targets: HashMap<OutputId, RenderTarget>,
    linear_sampler: vk::Sampler,
    nearest_sampler: vk::Sampler,
}

impl RenderTargetSet {
    pub fn new(context: &VulkanContext) -> Result<Self> {
        let make_sampler = |filter: vk::Filter| -> Result<vk::Sampler> {
            let info = vk::SamplerCreateInfo::builder()
                .mag_filter(filter)
                .min_filter(filter)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
                .unnormalized_coordinates(false);
            Ok(unsafe { context.device.create_sampler(&info, None) }?)
        };
        Ok(Self {
            device: context.device.clone(),
            targets: HashMap::new(),
            linear_sampler: make_sampler(vk::Filter::LINEAR)?,
            nearest_sampler: make_sampler(vk::Filter::NEAREST)?,
        })
    }

    /// Looks up the target for `buffer`, importing and building it on miss.
    pub fn get_or_create(
        &mut self,
        context: &VulkanContext,
        descriptors: &mut DescriptorAllocator,
        pipelines: &mut PipelineCache,
        config: &RendererConfig,
        buffer: &OutputBuffer,
    ) -> Result<&mut RenderTarget> {
        if !self.targets.contains_key(&buffer.id) {
            let target = RenderTarget::new(
                context,
                descriptors,
                pipelines,
                config,
                self.linear_sampler,
                self.nearest_sampler,
                buffer,
            )?;
            // the mirror lives its whole life in GENERAL; setup path, so the
            // one-shot submit-and-wait variant is fine here
            crate::sync::transition_one_shot(
                &context.device,
                context.command_pool,
                context.graphics_queue,
                target.mirror.image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                1,
            )?;
            self.targets.insert(buffer.id, target);
        }
        Ok(self.targets.get_mut(&buffer.id).unwrap())
    }

    pub fn get(&self, id: OutputId) -> Option<&RenderTarget> {
        self.targets.get(&id)
    }

    pub fn get_mut(&mut self, id: OutputId) -> Option<&mut RenderTarget> {
        self.targets.get_mut(&id)
    }

    /// Destroy notification from the buffer owner: tears the target down
    /// exactly once. Call only when no frame using it is in flight.
    pub fn buffer_destroyed(&mut self, id: OutputId, descriptors: &mut DescriptorAllocator) {
        match self.targets.remove(&id) {
            Some(target) => {
                info!("tearing down render target for destroyed buffer {:?}", id);
                target.destroy(&self.device, descriptors);
            }
            None => warn!("destroy notification for unknown buffer {:?}", id),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn destroy_all(&mut self, descriptors: &mut DescriptorAllocator) {
        let ids: Vec<OutputId> = self.targets.keys().copied().collect();
        for id in ids {
            if let Some(target) = self.targets.remove(&id) {
                target.destroy(&self.device, descriptors);
            }
        }
        unsafe {
            self.device.destroy_sampler(self.linear_sampler, None);
            self.device.destroy_sampler(self.nearest_sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blur_chain_halves_each_step() {
        let base = vk::Extent2D { width: 1920, height: 1080 };
        assert_eq!(blur_extent(base, 0), vk::Extent2D { width: 960, height: 540 });
        assert_eq!(blur_extent(base, 1), vk::Extent2D { width: 480, height: 270 });
        assert_eq!(blur_extent(base, 2), vk::Extent2D { width: 240, height: 135 });
    }

    #[test]
    fn blur_extent_floors_at_one_pixel() {
        let base = vk::Extent2D { width: 4, height: 2 };
        assert_eq!(blur_extent(base, 5), vk::Extent2D { width: 1, height: 1 });
        assert_eq!(blur_extent(base, 30), vk::Extent2D { width: 1, height: 1 });
    }
}
