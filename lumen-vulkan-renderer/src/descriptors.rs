//! Descriptor pool management for "sample this image" bindings.
//!
//! Every image the shaders sample — intermediates, blur chain stages,
//! client textures, the identity buffer — gets one combined-image-sampler
//! set from here. Pools grow geometrically on demand and sets are
//! individually freeable; pools themselves live until renderer teardown,
//! so handles borrowed from them stay valid for the renderer's life.

use ash::vk;
use log::{debug, info};

use crate::error::{Result, VulkanError};

/// A sampled-image binding: the set plus the pool it came from.
#[derive(Debug, Clone, Copy)]
pub struct ImageBinding {
    pub set: vk::DescriptorSet,
    pool_index: usize,
}

#[derive(Debug, Clone, Copy)]
struct PoolSpace {
    capacity: u32,
    free: u32,
}

/// CPU-side pool bookkeeping; owns no GPU objects.
#[derive(Debug)]
struct PoolLedger {
    pools: Vec<PoolSpace>,
    start_size: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum PoolPlacement {
    Existing(usize),
    /// A new pool of `capacity` sets was appended at `index`.
    Fresh { index: usize, capacity: u32 },
}

impl PoolLedger {
    fn new(start_size: u32) -> Self {
        Self { pools: Vec::new(), start_size }
    }

    fn plan(&mut self) -> PoolPlacement {
        for (index, pool) in self.pools.iter_mut().enumerate() {
            if pool.free > 0 {
                pool.free -= 1;
                return PoolPlacement::Existing(index);
            }
        }
        let previous = self.pools.last().map_or(0, |pool| pool.capacity);
        let capacity = self.start_size.max(previous * 2);
        self.pools.push(PoolSpace { capacity, free: capacity - 1 });
        PoolPlacement::Fresh { index: self.pools.len() - 1, capacity }
    }

    fn give_back(&mut self, index: usize) {
        let pool = &mut self.pools[index];
        debug_assert!(pool.free < pool.capacity, "descriptor pool free-count underflow");
        pool.free += 1;
    }
}

/// Pool-of-pools for combined-image-sampler descriptor sets.
pub struct DescriptorAllocator {
    device: ash::Device,
    layout: vk::DescriptorSetLayout,
    ledger: PoolLedger,
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorAllocator {
    pub fn new(device: &ash::Device, start_size: u32) -> Result<Self> {
        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build();
        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;
        debug!("Sampled-image descriptor set layout created: {:?}", layout);
        Ok(Self {
            device: device.clone(),
            layout,
            ledger: PoolLedger::new(start_size),
            pools: Vec::new(),
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Allocates one sampled-image binding, growing the pool set if needed.
    pub fn allocate_binding(&mut self) -> Result<ImageBinding> {
        let pool_index = match self.ledger.plan() {
            PoolPlacement::Existing(index) => index,
            PoolPlacement::Fresh { index, capacity } => {
                let pool = self.create_pool(capacity)?;
                info!("descriptor pool {} created ({} sets)", index, capacity);
                self.pools.push(pool);
                index
            }
        };

        let layouts = [self.layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pools[pool_index])
            .set_layouts(&layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&allocate_info) }
            .map_err(|e| VulkanError::ResourceCreation {
                resource: "descriptor set",
                message: e.to_string(),
            })?[0];
        Ok(ImageBinding { set, pool_index })
    }

    /// Returns a binding to its pool. The set handle is invalid afterwards.
    pub fn free(&mut self, binding: ImageBinding) {
        unsafe {
            // Allocation of this set succeeded from this pool, so the free
            // cannot fail in a way we can act on.
            let _ = self
                .device
                .free_descriptor_sets(self.pools[binding.pool_index], &[binding.set]);
        }
        self.ledger.give_back(binding.pool_index);
    }

    /// Points `binding` at `view` sampled through `sampler` in `layout`.
    pub fn write_sampled_image(
        &self,
        binding: &ImageBinding,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        let image_info = vk::DescriptorImageInfo::builder()
            .sampler(sampler)
            .image_view(view)
            .image_layout(layout)
            .build();
        let image_infos = [image_info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(binding.set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos)
            .build();
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
    }

    fn create_pool(&self, capacity: u32) -> Result<vk::DescriptorPool> {
        let pool_sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)
            .build()];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(capacity)
            .pool_sizes(&pool_sizes);
        unsafe { self.device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
            VulkanError::ResourceCreation { resource: "descriptor pool", message: e.to_string() }
        })
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        unsafe {
            for pool in self.pools.drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("DescriptorAllocator destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_creates_start_sized_pool() {
        let mut ledger = PoolLedger::new(4);
        assert_eq!(ledger.plan(), PoolPlacement::Fresh { index: 0, capacity: 4 });
    }

    #[test]
    fn pools_grow_geometrically_when_exhausted() {
        let mut ledger = PoolLedger::new(2);
        ledger.plan(); // fresh pool of 2, one used
        ledger.plan(); // second set from pool 0
        assert_eq!(ledger.plan(), PoolPlacement::Fresh { index: 1, capacity: 4 });
    }

    #[test]
    fn freed_bindings_are_reused_before_growth() {
        let mut ledger = PoolLedger::new(1);
        ledger.plan();
        ledger.give_back(0);
        assert_eq!(ledger.plan(), PoolPlacement::Existing(0));
    }
}
