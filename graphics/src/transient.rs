//! Transient GPU resources: per-frame buffers and descriptor sets.
//!
//! Uploads and descriptor sets live for one submission. Instead of freeing
//! them, the owning [`CommandContext`](crate::context::CommandContext)
//! recycles them: at `begin()`, after the previous submission's timeline
//! value is reached, every checkout whose caller has let go is returned to a
//! free list. A checkout the caller still holds (a second `Arc` owner) is
//! dropped from the pool instead; it must never be handed out again.
//!
//! Buffers are bucketed by exact usage flags and each bucket is kept sorted
//! ascending by capacity, so acquisition is a best-fit scan. Descriptor sets
//! are pooled per pipeline layout identity.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::RenderDevice;
use crate::error::RenderError;

/// A pooled GPU buffer with an optional host mapping.
pub struct TransientBuffer {
    device: Option<Arc<RenderDevice>>,
    buffer: vk::Buffer,
    allocation: Mutex<Option<Allocation>>,
    size: u64,
    usage: vk::BufferUsageFlags,
}

impl TransientBuffer {
    /// Create a buffer and bind fresh memory to it.
    pub fn create(
        device: &Arc<RenderDevice>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self, RenderError> {
        if size == 0 {
            return Err(RenderError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.ash().create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { device.ash().get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { device.ash().destroy_buffer(buffer, None) };
                RenderError::Allocation(e.to_string())
            })?;

        if let Err(e) = unsafe {
            device
                .ash()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let _ = device.allocator().lock().free(allocation);
            unsafe { device.ash().destroy_buffer(buffer, None) };
            return Err(RenderError::Vulkan(e));
        }

        device.set_debug_name(buffer, name);
        log::trace!("TransientBuffer: created {name} ({size} bytes, {usage:?})");

        Ok(Self {
            device: Some(Arc::clone(device)),
            buffer,
            allocation: Mutex::new(Some(allocation)),
            size,
            usage,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Capacity in bytes. May exceed what the current checkout asked for.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Copy `data` into the buffer through its host mapping.
    ///
    /// Fails if the buffer was not allocated host visible or the range is out
    /// of bounds.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), RenderError> {
        if offset + data.len() as u64 > self.size {
            return Err(RenderError::InvalidParameter(format!(
                "write of {} bytes at {} exceeds buffer size {}",
                data.len(),
                offset,
                self.size
            )));
        }
        let guard = self.allocation.lock();
        let mapped = guard
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .ok_or_else(|| {
                RenderError::InvalidParameter("buffer is not host visible".to_string())
            })?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.as_ptr().cast::<u8>().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes out of the buffer through its host mapping.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), RenderError> {
        if offset + out.len() as u64 > self.size {
            return Err(RenderError::InvalidParameter(format!(
                "read of {} bytes at {} exceeds buffer size {}",
                out.len(),
                offset,
                self.size
            )));
        }
        let guard = self.allocation.lock();
        let mapped = guard
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .ok_or_else(|| {
                RenderError::InvalidParameter("buffer is not host visible".to_string())
            })?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.as_ptr().cast::<u8>().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Build a buffer around a fabricated handle, with no device or memory
    /// behind it. Pool logic under test never dereferences the handle.
    #[cfg(test)]
    pub(crate) fn test_new(raw: u64, size: u64, usage: vk::BufferUsageFlags) -> Self {
        use vk::Handle;
        Self {
            device: None,
            buffer: vk::Buffer::from_raw(raw),
            allocation: Mutex::new(None),
            size,
            usage,
        }
    }
}

impl Drop for TransientBuffer {
    fn drop(&mut self) {
        let Some(device) = &self.device else {
            return;
        };
        if let Some(allocation) = self.allocation.lock().take() {
            let _ = device.allocator().lock().free(allocation);
        }
        unsafe { device.ash().destroy_buffer(self.buffer, None) };
    }
}

impl std::fmt::Debug for TransientBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientBuffer")
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

/// Free lists of transient buffers, bucketed by usage flags.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: HashMap<vk::BufferUsageFlags, Vec<Arc<TransientBuffer>>>,
    checked_out: Vec<Arc<TransientBuffer>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out the smallest pooled buffer with at least `size` bytes and
    /// matching usage. Returns `None` on a pool miss; the caller creates a
    /// fresh buffer and registers it with [`track`](Self::track).
    pub fn acquire(
        &mut self,
        usage: vk::BufferUsageFlags,
        size: u64,
    ) -> Option<Arc<TransientBuffer>> {
        let bucket = self.free.get_mut(&usage)?;
        // Sorted ascending, so the first fit is the best fit.
        let index = bucket.iter().position(|buffer| buffer.size() >= size)?;
        let buffer = bucket.remove(index);
        self.checked_out.push(Arc::clone(&buffer));
        Some(buffer)
    }

    /// Register an externally created buffer as checked out this frame.
    pub fn track(&mut self, buffer: Arc<TransientBuffer>) {
        self.checked_out.push(buffer);
    }

    /// Recycle the frame's checkouts.
    ///
    /// Must only be called once the submission that used these buffers has
    /// completed. Buffers the caller still references are dropped from the
    /// pool instead of being recycled.
    pub fn sweep(&mut self) {
        let mut recycled = 0usize;
        let mut dropped = 0usize;
        for buffer in self.checked_out.drain(..) {
            if Arc::strong_count(&buffer) == 1 {
                let bucket = self.free.entry(buffer.usage()).or_default();
                let position = bucket.partition_point(|b| b.size() < buffer.size());
                bucket.insert(position, buffer);
                recycled += 1;
            } else {
                dropped += 1;
            }
        }
        if recycled + dropped > 0 {
            log::trace!("BufferPool: sweep recycled {recycled}, dropped {dropped}");
        }
    }

    /// Drop every pooled and checked-out buffer. Only valid on an idle
    /// device.
    pub fn clear(&mut self) {
        self.free.clear();
        self.checked_out.clear();
    }

    #[cfg(test)]
    fn free_count(&self, usage: vk::BufferUsageFlags) -> usize {
        self.free.get(&usage).map_or(0, Vec::len)
    }
}

/// One descriptor set per set-layout of a pipeline layout, allocated and
/// recycled together.
#[derive(Debug)]
pub struct DescriptorSetGroup {
    pub sets: Vec<vk::DescriptorSet>,
    pub layout: vk::PipelineLayout,
}

/// Free lists of descriptor set groups, keyed by pipeline layout identity.
///
/// Set layouts are deduplicated upstream, so the pipeline layout handle is a
/// sound pooling key.
#[derive(Debug, Default)]
pub struct DescriptorSetPool {
    free: HashMap<vk::PipelineLayout, Vec<Arc<DescriptorSetGroup>>>,
    checked_out: Vec<Arc<DescriptorSetGroup>>,
}

impl DescriptorSetPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, layout: vk::PipelineLayout) -> Option<Arc<DescriptorSetGroup>> {
        let group = self.free.get_mut(&layout)?.pop()?;
        self.checked_out.push(Arc::clone(&group));
        Some(group)
    }

    pub fn track(&mut self, group: Arc<DescriptorSetGroup>) {
        self.checked_out.push(group);
    }

    /// Recycle this frame's checkouts; same ownership rule as
    /// [`BufferPool::sweep`].
    pub fn sweep(&mut self) {
        for group in self.checked_out.drain(..) {
            if Arc::strong_count(&group) == 1 {
                self.free.entry(group.layout).or_default().push(group);
            }
            // A dropped group's sets stay allocated in their descriptor pool
            // until the chain is destroyed.
        }
    }

    pub fn clear(&mut self) {
        self.free.clear();
        self.checked_out.clear();
    }

    #[cfg(test)]
    fn free_count(&self, layout: vk::PipelineLayout) -> usize {
        self.free.get(&layout).map_or(0, Vec::len)
    }
}

const DESCRIPTORS_PER_TYPE: u32 = 16384;
const MAX_SETS_PER_POOL: u32 = 8192;

/// A growable chain of raw `vk::DescriptorPool`s.
///
/// Individual sets are never freed; exhaustion grows the chain by one pool
/// and the allocation is retried exactly once.
#[derive(Debug, Default)]
pub struct DescriptorPoolChain {
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorPoolChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_pool(&mut self, device: &RenderDevice) -> Result<vk::DescriptorPool, RenderError> {
        let limits = device.limits();
        let count = |limit: u32| DESCRIPTORS_PER_TYPE.min(limit.max(1));
        let pool_sizes = [
            (vk::DescriptorType::SAMPLER, count(limits.max_descriptor_set_samplers)),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count(limits.max_descriptor_set_sampled_images),
            ),
            (
                vk::DescriptorType::SAMPLED_IMAGE,
                count(limits.max_descriptor_set_sampled_images),
            ),
            (
                vk::DescriptorType::STORAGE_IMAGE,
                count(limits.max_descriptor_set_storage_images),
            ),
            (
                vk::DescriptorType::UNIFORM_BUFFER,
                count(limits.max_descriptor_set_uniform_buffers),
            ),
            (
                vk::DescriptorType::STORAGE_BUFFER,
                count(limits.max_descriptor_set_storage_buffers),
            ),
        ]
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        });

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(MAX_SETS_PER_POOL)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.ash().create_descriptor_pool(&pool_info, None) }?;
        device.set_debug_name(pool, "transient descriptor pool");
        log::debug!("DescriptorPoolChain: grew to {} pools", self.pools.len() + 1);
        self.pools.push(pool);
        Ok(pool)
    }

    /// Allocate one set per layout from the newest pool.
    ///
    /// On pool exhaustion a new pool is added and the allocation retried
    /// once; a second exhaustion is fatal.
    pub fn allocate(
        &mut self,
        device: &RenderDevice,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, RenderError> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }

        let pool = match self.pools.last() {
            Some(pool) => *pool,
            None => self.add_pool(device)?,
        };

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        match unsafe { device.ash().allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => Ok(sets),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                let pool = self.add_pool(device)?;
                let alloc_info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(layouts);
                match unsafe { device.ash().allocate_descriptor_sets(&alloc_info) } {
                    Ok(sets) => Ok(sets),
                    Err(
                        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
                    ) => Err(RenderError::DescriptorPoolExhausted),
                    Err(e) => Err(RenderError::Vulkan(e)),
                }
            }
            Err(e) => Err(RenderError::Vulkan(e)),
        }
    }

    /// Destroy every pool in the chain, freeing all sets allocated from it.
    pub fn destroy(&mut self, device: &ash::Device) {
        for pool in self.pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }
}
