//! Resource state tracking and barrier batching.
//!
//! Each buffer and image has a last-declared usage state. Callers declare the
//! state their next access needs; the tracker diffs it against the last
//! declared state and enqueues a synchronization2 barrier only when something
//! actually changes. Pending barriers are flushed as a single
//! `vkCmdPipelineBarrier2` call before the dependent commands are recorded.
//!
//! Tracking is keyed by raw handle identity, so the diff logic runs (and is
//! tested) without a device.

use std::collections::HashMap;

use ash::vk;

/// Identity of a buffer, derived from its raw handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<vk::Buffer> for BufferId {
    fn from(buffer: vk::Buffer) -> Self {
        use vk::Handle;
        Self(buffer.as_raw())
    }
}

/// Identity of an image, derived from its raw handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(u64);

impl ImageId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<vk::Image> for ImageId {
    fn from(image: vk::Image) -> Self {
        use vk::Handle;
        Self(image.as_raw())
    }
}

/// Declared usage state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub queue_family: u32,
}

impl BufferState {
    pub fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self {
            stage,
            access,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    pub fn with_queue_family(mut self, queue_family: u32) -> Self {
        self.queue_family = queue_family;
        self
    }
}

impl Default for BufferState {
    fn default() -> Self {
        Self::new(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
    }
}

/// Declared usage state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub queue_family: u32,
}

impl ImageState {
    pub fn new(
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Self {
        Self {
            layout,
            stage,
            access,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    pub fn with_queue_family(mut self, queue_family: u32) -> Self {
        self.queue_family = queue_family;
        self
    }
}

impl Default for ImageState {
    fn default() -> Self {
        Self::new(
            vk::ImageLayout::UNDEFINED,
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
        )
    }
}

/// Last-declared usage states for every tracked resource.
///
/// States change only through the barrier request path; untracked resources
/// report the default state (no prior access, undefined layout).
#[derive(Debug, Default)]
pub struct ResourceStates {
    buffers: HashMap<BufferId, BufferState>,
    images: HashMap<ImageId, ImageState>,
}

impl ResourceStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self, id: BufferId) -> BufferState {
        self.buffers.get(&id).copied().unwrap_or_default()
    }

    pub fn image(&self, id: ImageId) -> ImageState {
        self.images.get(&id).copied().unwrap_or_default()
    }

    fn set_buffer(&mut self, id: BufferId, state: BufferState) {
        self.buffers.insert(id, state);
    }

    fn set_image(&mut self, id: ImageId, state: ImageState) {
        self.images.insert(id, state);
    }

    /// Stop tracking a destroyed resource so a recycled handle value does not
    /// inherit stale state.
    pub fn forget_buffer(&mut self, id: BufferId) {
        self.buffers.remove(&id);
    }

    pub fn forget_image(&mut self, id: ImageId) {
        self.images.remove(&id);
    }
}

#[derive(Debug, Clone)]
struct PendingBufferBarrier {
    buffer: vk::Buffer,
    offset: u64,
    size: u64,
    src: BufferState,
    dst: BufferState,
}

#[derive(Debug, Clone)]
struct PendingImageBarrier {
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    src: ImageState,
    dst: ImageState,
}

/// A batch of pending barriers, submitted together.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    // Keyed to replace a still-pending barrier for the same resource/range
    // instead of accumulating duplicates.
    buffer_barriers: HashMap<(BufferId, u64, u64), PendingBufferBarrier>,
    image_barriers: HashMap<ImageId, PendingImageBarrier>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next use of a buffer range.
    ///
    /// Diffs against the tracked state: a request identical to the last
    /// declared state enqueues nothing. The tracked state is updated either
    /// way.
    pub fn request_buffer(
        &mut self,
        states: &mut ResourceStates,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        new_state: BufferState,
    ) {
        let id = BufferId::from(buffer);
        let old_state = states.buffer(id);
        if old_state == new_state {
            return;
        }
        states.set_buffer(id, new_state);

        let key = (id, offset, size);
        match self.buffer_barriers.get_mut(&key) {
            // Fold into the still-pending barrier, keeping its source state.
            Some(pending) => pending.dst = new_state,
            None => {
                self.buffer_barriers.insert(
                    key,
                    PendingBufferBarrier {
                        buffer,
                        offset,
                        size,
                        src: old_state,
                        dst: new_state,
                    },
                );
            }
        }
    }

    /// Declare the next use of an image.
    ///
    /// Same diffing rule as [`request_buffer`](Self::request_buffer); an
    /// identical state enqueues nothing, a layout or access change enqueues a
    /// transition.
    pub fn request_image(
        &mut self,
        states: &mut ResourceStates,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        new_state: ImageState,
    ) {
        let id = ImageId::from(image);
        let old_state = states.image(id);
        if old_state == new_state {
            return;
        }
        states.set_image(id, new_state);

        match self.image_barriers.get_mut(&id) {
            Some(pending) => pending.dst = new_state,
            None => {
                self.image_barriers.insert(
                    id,
                    PendingImageBarrier {
                        image,
                        aspect,
                        src: old_state,
                        dst: new_state,
                    },
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_barriers.is_empty() && self.image_barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer_barriers.len() + self.image_barriers.len()
    }

    pub fn clear(&mut self) {
        self.buffer_barriers.clear();
        self.image_barriers.clear();
    }

    /// Record all pending barriers as one `vkCmdPipelineBarrier2` and clear
    /// the batch. Does nothing when empty.
    pub fn flush(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }

        let buffer_barriers: Vec<vk::BufferMemoryBarrier2> = self
            .buffer_barriers
            .values()
            .map(|pending| {
                vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(pending.src.stage)
                    .src_access_mask(pending.src.access)
                    .dst_stage_mask(pending.dst.stage)
                    .dst_access_mask(pending.dst.access)
                    .src_queue_family_index(pending.src.queue_family)
                    .dst_queue_family_index(pending.dst.queue_family)
                    .buffer(pending.buffer)
                    .offset(pending.offset)
                    .size(pending.size)
            })
            .collect();

        let image_barriers: Vec<vk::ImageMemoryBarrier2> = self
            .image_barriers
            .values()
            .map(|pending| {
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(pending.src.stage)
                    .src_access_mask(pending.src.access)
                    .dst_stage_mask(pending.dst.stage)
                    .dst_access_mask(pending.dst.access)
                    .old_layout(pending.src.layout)
                    .new_layout(pending.dst.layout)
                    .src_queue_family_index(pending.src.queue_family)
                    .dst_queue_family_index(pending.dst.queue_family)
                    .image(pending.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: pending.aspect,
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    })
            })
            .collect();

        let dependency_info = vk::DependencyInfo::default()
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);

        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };

        self.clear();
    }
}
