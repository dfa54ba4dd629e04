//! Growable pool of host-visible staging buffers.
//!
//! Allocations are bump-carved out of persistently mapped buffers and are
//! only ever valid for the current frame: there is no per-allocation free,
//! the whole arena is rewound at end-of-frame once the frame's submitted
//! work has been waited on. A request that no existing buffer can satisfy
//! grows the pool geometrically; a single request larger than the
//! configured cap is a hard allocation failure.

use std::ffi::c_void;

use ash::vk;
use log::{debug, info};

use crate::device::VulkanContext;
use crate::error::{Result, VulkanError};

/// Offset alignment for suballocations; covers uniform and copy alignment
/// requirements on all targeted hardware.
const SUBALLOC_ALIGN: u64 = 256;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// One region carved from a staging buffer, valid until the frame rewind.
#[derive(Debug, Clone, Copy)]
pub struct StagingAllocation {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    ptr: *mut c_void,
}

impl StagingAllocation {
    /// Copies `data` into the mapped region. Panics if `data` is larger
    /// than the allocation, which is a programmer error.
    pub fn write_bytes(&self, data: &[u8]) {
        assert!(data.len() as u64 <= self.size, "staging allocation overflow");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr as *mut u8, data.len());
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BufferSpace {
    capacity: u64,
    used: u64,
}

/// Where a planned suballocation landed.
#[derive(Debug, PartialEq, Eq)]
enum Placement {
    /// Fits in an existing buffer at `offset`.
    Existing { index: usize, offset: u64 },
    /// A new buffer of `capacity` bytes was appended; allocation at offset 0.
    Fresh { index: usize, capacity: u64 },
}

/// CPU-side bookkeeping for the arena; owns no GPU objects.
#[derive(Debug)]
struct ArenaLedger {
    buffers: Vec<BufferSpace>,
    min_size: u64,
    max_size: u64,
}

impl ArenaLedger {
    fn new(min_size: u64, max_size: u64) -> Self {
        Self { buffers: Vec::new(), min_size, max_size }
    }

    fn plan(&mut self, size: u64) -> Result<Placement> {
        if size > self.max_size {
            return Err(VulkanError::StagingExhausted { requested: size, max: self.max_size });
        }
        for (index, space) in self.buffers.iter_mut().enumerate() {
            let offset = align_up(space.used, SUBALLOC_ALIGN);
            if offset + size <= space.capacity {
                space.used = offset + size;
                return Ok(Placement::Existing { index, offset });
            }
        }
        let previous = self.buffers.last().map_or(0, |space| space.capacity);
        let capacity = (size * 2).max(previous * 2).max(self.min_size).min(self.max_size);
        debug_assert!(capacity >= size);
        self.buffers.push(BufferSpace { capacity, used: size });
        Ok(Placement::Fresh { index: self.buffers.len() - 1, capacity })
    }

    fn reset(&mut self) {
        for space in &mut self.buffers {
            space.used = 0;
        }
    }
}

struct StagingBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped: *mut c_void,
}

/// The staging arena: a [`ArenaLedger`] plus the GPU buffers it describes.
pub struct StagingArena {
    device: ash::Device,
    ledger: ArenaLedger,
    buffers: Vec<StagingBuffer>,
}

impl StagingArena {
    pub fn new(context: &VulkanContext, min_size: u64, max_size: u64) -> Self {
        Self {
            device: context.device.clone(),
            ledger: ArenaLedger::new(min_size, max_size),
            buffers: Vec::new(),
        }
    }

    /// Carves `size` bytes out of the arena, growing it if needed.
    pub fn allocate(&mut self, context: &VulkanContext, size: u64) -> Result<StagingAllocation> {
        debug_assert!(size > 0, "zero-sized staging allocation");
        match self.ledger.plan(size)? {
            Placement::Existing { index, offset } => {
                let backing = &self.buffers[index];
                Ok(StagingAllocation {
                    buffer: backing.buffer,
                    offset,
                    size,
                    ptr: unsafe { (backing.mapped as *mut u8).add(offset as usize) as *mut c_void },
                })
            }
            Placement::Fresh { index, capacity } => {
                let backing = self.create_buffer(context, capacity)?;
                info!(
                    "staging arena grew: buffer {} of {} bytes ({} buffers total)",
                    index,
                    capacity,
                    index + 1
                );
                self.buffers.push(backing);
                let backing = &self.buffers[index];
                Ok(StagingAllocation {
                    buffer: backing.buffer,
                    offset: 0,
                    size,
                    ptr: backing.mapped,
                })
            }
        }
    }

    /// Rewinds every buffer to empty. Only call after the frame's GPU work
    /// has been waited on.
    pub fn reset(&mut self) {
        self.ledger.reset();
    }

    fn create_buffer(&self, context: &VulkanContext, capacity: u64) -> Result<StagingBuffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(capacity)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory_type = context
            .find_memory_type_index(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .map_err(|e| {
                unsafe { self.device.destroy_buffer(buffer, None) };
                e
            })?;
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }.map_err(|e| {
            unsafe { self.device.destroy_buffer(buffer, None) };
            VulkanError::ResourceCreation {
                resource: "staging buffer memory",
                message: e.to_string(),
            }
        })?;
        unsafe {
            self.device.bind_buffer_memory(buffer, memory, 0)?;
        }
        let mapped =
            unsafe { self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }?;
        debug!("staging buffer created: {:?} ({} bytes, mapped)", buffer, capacity);
        Ok(StagingBuffer { buffer, memory, mapped })
    }
}

impl Drop for StagingArena {
    fn drop(&mut self) {
        for backing in self.buffers.drain(..) {
            unsafe {
                self.device.unmap_memory(backing.memory);
                self.device.destroy_buffer(backing.buffer, None);
                self.device.free_memory(backing.memory, None);
            }
        }
        debug!("StagingArena destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 1024;
    const MAX: u64 = 8192;

    #[test]
    fn first_allocation_creates_minimum_sized_buffer() {
        let mut ledger = ArenaLedger::new(MIN, MAX);
        let placement = ledger.plan(64).unwrap();
        assert_eq!(placement, Placement::Fresh { index: 0, capacity: MIN });
    }

    #[test]
    fn allocations_bump_within_one_buffer() {
        let mut ledger = ArenaLedger::new(MIN, MAX);
        ledger.plan(64).unwrap();
        let second = ledger.plan(64).unwrap();
        assert_eq!(second, Placement::Existing { index: 0, offset: SUBALLOC_ALIGN });
    }

    #[test]
    fn growth_doubles_previous_capacity() {
        let mut ledger = ArenaLedger::new(MIN, MAX);
        ledger.plan(MIN).unwrap(); // buffer 0, capacity 2*MIN
        ledger.plan(MIN).unwrap(); // fills buffer 0 exactly
        let placement = ledger.plan(MIN).unwrap();
        match placement {
            Placement::Fresh { capacity, .. } => assert_eq!(capacity, 4 * MIN),
            other => panic!("expected fresh buffer, got {:?}", other),
        }
    }

    #[test]
    fn max_sized_request_succeeds_without_exceeding_cap() {
        let mut ledger = ArenaLedger::new(MIN, MAX);
        let placement = ledger.plan(MAX).unwrap();
        assert_eq!(placement, Placement::Fresh { index: 0, capacity: MAX });
    }

    #[test]
    fn oversized_request_fails() {
        let mut ledger = ArenaLedger::new(MIN, MAX);
        let err = ledger.plan(MAX + 1).unwrap_err();
        match err {
            VulkanError::StagingExhausted { requested, max } => {
                assert_eq!(requested, MAX + 1);
                assert_eq!(max, MAX);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reset_rewinds_every_buffer() {
        let mut ledger = ArenaLedger::new(MIN, MAX);
        ledger.plan(64).unwrap();
        ledger.plan(4096).unwrap();
        ledger.reset();
        for space in &ledger.buffers {
            assert_eq!(space.used, 0);
        }
        // after rewind the first buffer is reusable from offset zero
        assert_eq!(ledger.plan(64).unwrap(), Placement::Existing { index: 0, offset: 0 });
    }

    #[test]
    fn align_up_is_idempotent_on_aligned_values() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }
}
