//! Imported client textures: zero-copy dmabuf import, queue-ownership
//! tracking and deferred destruction.
//!
//! Client buffers are produced on a foreign queue (the dmabuf producer), so
//! sampling one inside the frame requires an acquire barrier first and a
//! release barrier afterwards. The [`Ownership`] tag makes that pairing a
//! state machine instead of scattered booleans: acquire only ever fires on
//! an `Uninitialized` or `Foreign` texture, release only on an `Owned` one,
//! so the at-most-once-per-frame invariant holds by construction.
//!
//! Destruction is deferred: the session layer may drop a texture while the
//! frame that sampled it is still in flight, so destroy requests park the
//! texture on a pending list that is drained only after the frame's fence
//! wait.

use std::collections::HashMap;

use ash::vk;
use log::{debug, warn};

use crate::descriptors::{DescriptorAllocator, ImageBinding};
use crate::device::VulkanContext;
use crate::error::{Result, VulkanError};
use crate::scene::{DmabufSource, TextureId};

/// Queue-ownership state of an imported image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Never touched by this renderer; layout is undefined.
    Uninitialized,
    /// Acquired by the graphics queue for this frame.
    Owned,
    /// Resting state between frames: the producer owns it.
    Foreign,
}

/// Barrier required to begin sampling, as decided by [`Ownership::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireAction {
    /// Already owned this frame; no barrier.
    None,
    /// First ever use: transition out of `UNDEFINED`.
    FromUndefined,
    /// Reacquire from the foreign queue.
    FromForeign,
}

impl Ownership {
    /// Marks the image owned, reporting which acquire barrier is needed.
    pub fn acquire(&mut self) -> AcquireAction {
        match *self {
            Ownership::Uninitialized => {
                *self = Ownership::Owned;
                AcquireAction::FromUndefined
            }
            Ownership::Foreign => {
                *self = Ownership::Owned;
                AcquireAction::FromForeign
            }
            Ownership::Owned => AcquireAction::None,
        }
    }

    /// Hands the image back to the producer. Returns whether a release
    /// barrier must be recorded.
    pub fn release(&mut self) -> bool {
        if *self == Ownership::Owned {
            *self = Ownership::Foreign;
            true
        } else {
            false
        }
    }
}

/// Imports a dmabuf as a Vulkan image bound to imported device memory.
///
/// The fd is duplicated first; the caller keeps its descriptor. On success
/// the returned memory owns the dup'd fd.
pub fn import_dmabuf_image(
    context: &VulkanContext,
    source: &DmabufSource,
    usage: vk::ImageUsageFlags,
) -> Result<(vk::Image, vk::DeviceMemory)> {
    let device = &context.device;
    let fd = unsafe { libc::dup(source.fd) };
    if fd < 0 {
        return Err(VulkanError::Io(std::io::Error::last_os_error()));
    }

    let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

    // single-plane layout for the explicit-modifier path
    let plane_layouts = [vk::SubresourceLayout {
        offset: 0,
        size: 0,
        row_pitch: source.stride as u64,
        array_pitch: 0,
        depth_pitch: 0,
    }];
    let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
        .drm_format_modifier(source.modifier.unwrap_or(0))
        .plane_layouts(&plane_layouts);

    let tiling = if source.modifier.is_some() {
        vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT
    } else {
        vk::ImageTiling::OPTIMAL
    };

    let mut image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(source.format)
        .extent(vk::Extent3D { width: source.width, height: source.height, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(tiling)
        .usage(usage)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .push_next(&mut external_info);
    if source.modifier.is_some() {
        image_info = image_info.push_next(&mut modifier_info);
    }

    let image = unsafe { device.create_image(&image_info, None) }.map_err(|e| {
        unsafe { libc::close(fd) };
        VulkanError::ResourceCreation { resource: "dmabuf image", message: e.to_string() }
    })?;

    let mut dedicated_requirements = vk::MemoryDedicatedRequirements::default();
    let mut requirements2 =
        vk::MemoryRequirements2::builder().push_next(&mut dedicated_requirements);
    let requirements_info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
    unsafe {
        device.get_image_memory_requirements2(&requirements_info, &mut requirements2);
    }
    let requirements = requirements2.memory_requirements;
    let needs_dedicated = dedicated_requirements.requires_dedicated_allocation == vk::TRUE
        || dedicated_requirements.prefers_dedicated_allocation == vk::TRUE;

    let memory_type = context
        .find_memory_type_index(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .map_err(|e| {
            unsafe {
                device.destroy_image(image, None);
                libc::close(fd);
            }
            e
        })?;

    let mut import_info = vk::ImportMemoryFdInfoKHR::builder()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(fd);
    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);
    let mut allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type)
        .push_next(&mut import_info);
    if needs_dedicated {
        allocate_info = allocate_info.push_next(&mut dedicated_info);
    }

    let memory = unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| {
        unsafe {
            device.destroy_image(image, None);
            libc::close(fd);
        }
        VulkanError::ResourceCreation { resource: "dmabuf memory import", message: e.to_string() }
    })?;

    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.free_memory(memory, None);
            device.destroy_image(image, None);
        }
        return Err(VulkanError::ResourceCreation {
            resource: "dmabuf image binding",
            message: e.to_string(),
        });
    }

    debug!(
        "imported dmabuf (fd {}) as {:?}: {}x{} {:?}, modifier {:?}, dedicated {}",
        source.fd, image, source.width, source.height, source.format, source.modifier,
        needs_dedicated
    );
    Ok((image, memory))
}

/// A client texture resident on the GPU via dmabuf import.
pub struct ImportedTexture {
    pub id: TextureId,
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub ownership: Ownership,
    /// Frame counter value of the last frame that sampled this texture.
    pub last_used_frame: u64,
    pub binding: ImageBinding,
}

impl ImportedTexture {
    pub fn import(
        context: &VulkanContext,
        descriptors: &mut DescriptorAllocator,
        id: TextureId,
        source: &DmabufSource,
    ) -> Result<Self> {
        let (image, memory) =
            import_dmabuf_image(context, source, vk::ImageUsageFlags::SAMPLED)?;
        let device = &context.device;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(source.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { device.create_image_view(&view_info, None) }?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .unnormalized_coordinates(false);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }?;

        let binding = descriptors.allocate_binding()?;
        descriptors.write_sampled_image(
            &binding,
            view,
            sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        Ok(Self {
            id,
            image,
            memory,
            view,
            sampler,
            width: source.width,
            height: source.height,
            format: source.format,
            ownership: Ownership::Uninitialized,
            last_used_frame: 0,
            binding,
        })
    }

    fn destroy(self, device: &ash::Device, descriptors: &mut DescriptorAllocator) {
        descriptors.free(self.binding);
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
        debug!("imported texture {:?} destroyed", self.id);
    }
}

/// Whether a texture parked at frame stamp `last_used` may be freed once
/// the frame `completed` has finished its GPU wait.
pub fn retired(last_used: u64, completed: u64) -> bool {
    last_used <= completed
}

/// Id-keyed store of live textures plus the deferred-destruction list.
pub struct TextureRegistry {
    live: HashMap<TextureId, ImportedTexture>,
    pending_destroy: Vec<ImportedTexture>,
}

impl TextureRegistry {
    pub fn new() -> Self {
        Self { live: HashMap::new(), pending_destroy: Vec::new() }
    }

    pub fn import(
        &mut self,
        context: &VulkanContext,
        descriptors: &mut DescriptorAllocator,
        source: &DmabufSource,
    ) -> Result<TextureId> {
        let id = TextureId::new();
        let texture = ImportedTexture::import(context, descriptors, id, source)?;
        self.live.insert(id, texture);
        Ok(id)
    }

    pub fn get(&self, id: TextureId) -> Option<&ImportedTexture> {
        self.live.get(&id)
    }

    pub fn get_mut(&mut self, id: TextureId) -> Option<&mut ImportedTexture> {
        self.live.get_mut(&id)
    }

    /// Parks a texture for destruction; it stays alive until the frame that
    /// last sampled it has retired.
    pub fn queue_destroy(&mut self, id: TextureId) {
        match self.live.remove(&id) {
            Some(texture) => self.pending_destroy.push(texture),
            None => warn!("destroy requested for unknown texture {:?}", id),
        }
    }

    /// Frees every pending texture whose last use is retired. Call only
    /// after the fence wait for `completed_frame`.
    pub fn drain_retired(
        &mut self,
        device: &ash::Device,
        descriptors: &mut DescriptorAllocator,
        completed_frame: u64,
    ) {
        let mut index = 0;
        while index < self.pending_destroy.len() {
            if retired(self.pending_destroy[index].last_used_frame, completed_frame) {
                let texture = self.pending_destroy.swap_remove(index);
                texture.destroy(device, descriptors);
            } else {
                index += 1;
            }
        }
    }

    /// Destroys everything immediately; caller must have idled the device.
    pub fn destroy_all(&mut self, device: &ash::Device, descriptors: &mut DescriptorAllocator) {
        for (_, texture) in self.live.drain() {
            texture.destroy(device, descriptors);
        }
        for texture in self.pending_destroy.drain(..) {
            texture.destroy(device, descriptors);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending_destroy.len()
    }
}

impl Default for TextureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_pairing_is_once_per_frame() {
        let mut ownership = Ownership::Uninitialized;
        assert_eq!(ownership.acquire(), AcquireAction::FromUndefined);
        // further samples in the same frame are no-ops
        assert_eq!(ownership.acquire(), AcquireAction::None);
        assert_eq!(ownership.acquire(), AcquireAction::None);
        assert!(ownership.release());
        // double release never fires a second barrier
        assert!(!ownership.release());
        assert_eq!(ownership, Ownership::Foreign);
    }

    #[test]
    fn reacquire_after_release_comes_from_foreign() {
        let mut ownership = Ownership::Uninitialized;
        ownership.acquire();
        ownership.release();
        assert_eq!(ownership.acquire(), AcquireAction::FromForeign);
    }

    #[test]
    fn release_without_acquire_is_a_no_op() {
        let mut ownership = Ownership::Uninitialized;
        assert!(!ownership.release());
        assert_eq!(ownership, Ownership::Uninitialized);
    }

    #[test]
    fn retirement_requires_completed_frame_at_or_past_stamp() {
        assert!(!retired(5, 4));
        assert!(retired(5, 5));
        assert!(retired(5, 6));
    }
}
