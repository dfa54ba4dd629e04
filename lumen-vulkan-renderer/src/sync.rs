//! Barrier issuance and one-shot command submission helpers.
//!
//! Every layout transition in the renderer goes through [`transition`] (or
//! its queue-ownership variants), which issues exactly one
//! `vkCmdPipelineBarrier` for one image. The one-shot variant exists only
//! for setup and import paths that run before the per-frame command stream;
//! the hot path always records into the frame's open command buffer.
//!
//! Layout bookkeeping is the caller's job: requesting a transition into a
//! layout the consuming operation does not expect is a programmer error,
//! guarded by debug assertions, not a recoverable condition.

use ash::vk;
use log::debug;

use crate::error::Result;

/// Records a single layout-transition barrier for `image` into an already
/// open command buffer.
#[allow(clippy::too_many_arguments)]
pub fn transition(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    mip_levels: u32,
) {
    debug_assert!(mip_levels > 0, "transition with zero mip levels");
    debug_assert!(
        old_layout != new_layout || old_layout == vk::ImageLayout::GENERAL,
        "no-op layout transition requested: {:?}",
        old_layout
    );
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

/// Acquire barrier: takes ownership of a foreign-queue image (dmabuf
/// producer) and moves it into a shader- or attachment-usable layout.
#[allow(clippy::too_many_arguments)]
pub fn acquire_from_foreign(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    graphics_family: u32,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    dst_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_FOREIGN_EXT)
        .dst_queue_family_index(graphics_family)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(dst_access);
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

/// Release barrier: hands an image back to the foreign queue once this
/// frame's reads of it are finished.
pub fn release_to_foreign(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    graphics_family: u32,
    old_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(vk::ImageLayout::GENERAL)
        .src_queue_family_index(graphics_family)
        .dst_queue_family_index(vk::QUEUE_FAMILY_FOREIGN_EXT)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(vk::AccessFlags::empty());
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

/// Copies one region between two images. Both images must already be in
/// `TRANSFER_SRC_OPTIMAL` / `TRANSFER_DST_OPTIMAL` (or `GENERAL`); this
/// helper does not transition anything.
#[allow(clippy::too_many_arguments)]
pub fn copy_image(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    src: vk::Image,
    src_layout: vk::ImageLayout,
    dst: vk::Image,
    dst_layout: vk::ImageLayout,
    aspect: vk::ImageAspectFlags,
    src_offset: vk::Offset3D,
    dst_offset: vk::Offset3D,
    extent: vk::Extent3D,
) {
    debug_assert!(
        src_layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL
            || src_layout == vk::ImageLayout::GENERAL,
        "copy_image source in non-transfer layout {:?}",
        src_layout
    );
    debug_assert!(
        dst_layout == vk::ImageLayout::TRANSFER_DST_OPTIMAL
            || dst_layout == vk::ImageLayout::GENERAL,
        "copy_image destination in non-transfer layout {:?}",
        dst_layout
    );
    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let region = vk::ImageCopy::builder()
        .src_subresource(subresource)
        .src_offset(src_offset)
        .dst_subresource(subresource)
        .dst_offset(dst_offset)
        .extent(extent);
    unsafe {
        device.cmd_copy_image(command_buffer, src, src_layout, dst, dst_layout, &[region.build()]);
    }
}

/// Allocates a primary command buffer, records into it via `executor`,
/// submits it and blocks on a fence until the GPU is done.
///
/// Setup/import paths only — never called from the per-frame stream.
pub fn record_one_time_submit<F>(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    executor: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let allocate_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info) }?[0];

    let begin_info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.begin_command_buffer(command_buffer, &begin_info) }?;
    executor(command_buffer);
    unsafe { device.end_command_buffer(command_buffer) }?;

    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
    let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }?;

    let submit_result = unsafe {
        device
            .queue_submit(queue, &[submit_info.build()], fence)
            .and_then(|_| device.wait_for_fences(&[fence], true, u64::MAX))
    };

    unsafe {
        device.destroy_fence(fence, None);
        device.free_command_buffers(command_pool, &[command_buffer]);
    }
    submit_result?;
    debug!("One-time submit completed.");
    Ok(())
}

/// One-shot variant of [`transition`]: opens a short-lived command buffer,
/// issues the barrier, submits and waits. Setup/import paths only.
#[allow(clippy::too_many_arguments)]
pub fn transition_one_shot(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    mip_levels: u32,
) -> Result<()> {
    record_one_time_submit(device, command_pool, queue, |command_buffer| {
        transition(
            device,
            command_buffer,
            image,
            aspect,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
            mip_levels,
        );
    })
}
