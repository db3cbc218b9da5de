//! Command recording context.
//!
//! A [`CommandContext`] owns one primary command buffer plus the transient
//! state of everything recorded into it: buffer and descriptor set pools,
//! resource state tracking, and the pending barrier batch.
//!
//! # Frame lifecycle
//!
//! `begin()` waits for the context's previous submission (the only routine
//! CPU block in the frame), then sweeps the pools so transients from that
//! submission become reusable. `submit()` appends a signal of the next
//! timeline value to whatever semaphores the caller passes and returns that
//! value.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::barrier::{BarrierBatch, BufferState, ImageState, ResourceStates};
use crate::bind::{plan_bindings, BarrierRequest, BindingPlan, PlannedWrite};
use crate::device::{RenderDevice, TimelineValue};
use crate::error::RenderError;
use crate::shader::{PipelineLayoutInfo, ShaderParameter};
use crate::transient::{
    BufferPool, DescriptorPoolChain, DescriptorSetGroup, DescriptorSetPool, TransientBuffer,
};

/// Minimum size for transient buffer creation; tiny uploads round up so the
/// pool converges on a few reusable sizes.
const MIN_TRANSIENT_BUFFER_SIZE: u64 = 256;

/// Records commands and manages the transient resources they use.
pub struct CommandContext {
    device: Arc<RenderDevice>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    buffers: BufferPool,
    descriptor_sets: DescriptorSetPool,
    descriptor_pools: DescriptorPoolChain,
    states: ResourceStates,
    barriers: BarrierBatch,
    last_submit: TimelineValue,
}

impl CommandContext {
    /// Create a context. No Vulkan objects are allocated until the first
    /// [`begin`](Self::begin).
    pub fn new(device: Arc<RenderDevice>) -> Self {
        Self {
            device,
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            buffers: BufferPool::new(),
            descriptor_sets: DescriptorSetPool::new(),
            descriptor_pools: DescriptorPoolChain::new(),
            states: ResourceStates::new(),
            barriers: BarrierBatch::new(),
            last_submit: TimelineValue::default(),
        }
    }

    pub fn device(&self) -> &Arc<RenderDevice> {
        &self.device
    }

    pub fn queue_family(&self) -> u32 {
        self.device.queue_family()
    }

    /// The raw command buffer, for recording draws and dispatches directly.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// The timeline value of this context's most recent submission.
    pub fn last_submit(&self) -> TimelineValue {
        self.last_submit
    }

    /// Start recording a new command buffer.
    ///
    /// Waits until the previous submission from this context has completed,
    /// then recycles its transient buffers and descriptor sets. If that value
    /// is already reached the wait returns immediately and the sweep still
    /// runs.
    pub fn begin(&mut self) -> Result<(), RenderError> {
        if self.command_pool == vk::CommandPool::null() {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(self.device.queue_family())
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            self.command_pool =
                unsafe { self.device.ash().create_command_pool(&pool_info, None) }?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            self.command_buffer =
                unsafe { self.device.ash().allocate_command_buffers(&alloc_info) }?[0];
        }

        if self.last_submit > TimelineValue::default() {
            self.device.wait(self.last_submit)?;
        }

        unsafe {
            self.device.ash().reset_command_buffer(
                self.command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .ash()
                .begin_command_buffer(self.command_buffer, &begin_info)?;
        }

        self.buffers.sweep();
        self.descriptor_sets.sweep();
        self.barriers.clear();
        Ok(())
    }

    /// Declare the next use of a buffer range; see
    /// [`BarrierBatch::request_buffer`].
    pub fn add_buffer_barrier(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        new_state: BufferState,
    ) {
        self.barriers
            .request_buffer(&mut self.states, buffer, offset, size, new_state);
    }

    /// Declare the next use of an image; see
    /// [`BarrierBatch::request_image`].
    pub fn add_image_barrier(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        new_state: ImageState,
    ) {
        self.barriers
            .request_image(&mut self.states, image, aspect, new_state);
    }

    /// Record all pending barriers before dependent commands.
    pub fn execute_barriers(&mut self) {
        self.barriers.flush(self.device.ash(), self.command_buffer);
    }

    /// Acquire a transient buffer, creating one on pool miss.
    pub fn transient_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Arc<TransientBuffer>, RenderError> {
        if let Some(buffer) = self.buffers.acquire(usage, size) {
            return Ok(buffer);
        }
        let capacity = size
            .next_power_of_two()
            .max(MIN_TRANSIENT_BUFFER_SIZE);
        let buffer = Arc::new(TransientBuffer::create(
            &self.device,
            capacity,
            usage,
            location,
            name,
        )?);
        self.buffers.track(Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Upload bytes into a host-visible transient buffer.
    pub fn upload(
        &mut self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<Arc<TransientBuffer>, RenderError> {
        let buffer = self.transient_buffer(
            data.len() as u64,
            usage,
            MemoryLocation::CpuToGpu,
            "transient upload",
        )?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Fill a buffer range with a repeated 32-bit value.
    pub fn fill_buffer(&mut self, buffer: vk::Buffer, offset: u64, size: u64, value: u32) {
        self.execute_barriers();
        unsafe {
            self.device
                .ash()
                .cmd_fill_buffer(self.command_buffer, buffer, offset, size, value)
        };
    }

    /// Get a pooled or freshly allocated descriptor set group for a layout.
    pub fn get_descriptor_sets(
        &mut self,
        layout: &PipelineLayoutInfo,
    ) -> Result<Arc<DescriptorSetGroup>, RenderError> {
        if let Some(group) = self.descriptor_sets.acquire(layout.layout) {
            log::trace!("CommandContext: reusing descriptor sets");
            return Ok(group);
        }
        let sets = self
            .descriptor_pools
            .allocate(&self.device, &layout.set_layouts)?;
        let group = Arc::new(DescriptorSetGroup {
            sets,
            layout: layout.layout,
        });
        self.descriptor_sets.track(Arc::clone(&group));
        Ok(group)
    }

    /// Resolve `parameter` against `layout` and write the results into
    /// `group` with a single batched descriptor update.
    ///
    /// Constant blobs are uploaded to transient buffers first; barrier
    /// requests from the walk are queued but not yet recorded. Returns the
    /// plan so callers can apply its push constants after binding.
    pub fn update_descriptor_sets(
        &mut self,
        group: &DescriptorSetGroup,
        parameter: &ShaderParameter,
        layout: &PipelineLayoutInfo,
    ) -> Result<BindingPlan, RenderError> {
        let mut plan = plan_bindings(parameter, layout, self.device.queue_family());

        // Constants destined for buffer descriptors become real buffers now.
        let uniforms = std::mem::take(&mut plan.uniforms);
        for blob in uniforms {
            let buffer = self.upload(&blob.data, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
            plan.writes.push(PlannedWrite::Buffer {
                set: blob.set,
                binding: blob.binding,
                array_element: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                buffer: buffer.handle(),
                offset: 0,
                range: blob.data.len() as u64,
            });
            plan.barriers.push(BarrierRequest::Buffer {
                buffer: buffer.handle(),
                offset: 0,
                size: blob.data.len() as u64,
                state: BufferState::new(
                    layout.pipeline_stages,
                    vk::AccessFlags2::UNIFORM_READ,
                )
                .with_queue_family(self.device.queue_family()),
            });
        }

        let promoted = std::mem::take(&mut plan.promoted);
        for constant in promoted {
            let usage = match constant.descriptor_type {
                vk::DescriptorType::STORAGE_BUFFER => vk::BufferUsageFlags::STORAGE_BUFFER,
                _ => vk::BufferUsageFlags::UNIFORM_BUFFER,
            };
            let access = match constant.descriptor_type {
                vk::DescriptorType::STORAGE_BUFFER => {
                    vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
                }
                _ => vk::AccessFlags2::UNIFORM_READ,
            };
            let buffer = self.upload(&constant.data, usage)?;
            plan.writes.push(PlannedWrite::Buffer {
                set: constant.set,
                binding: constant.binding,
                array_element: constant.array_element,
                descriptor_type: constant.descriptor_type,
                buffer: buffer.handle(),
                offset: 0,
                range: constant.data.len() as u64,
            });
            plan.barriers.push(BarrierRequest::Buffer {
                buffer: buffer.handle(),
                offset: 0,
                size: constant.data.len() as u64,
                state: BufferState::new(layout.pipeline_stages, access)
                    .with_queue_family(self.device.queue_family()),
            });
        }

        for request in &plan.barriers {
            match *request {
                BarrierRequest::Buffer {
                    buffer,
                    offset,
                    size,
                    state,
                } => self.add_buffer_barrier(buffer, offset, size, state),
                BarrierRequest::Image {
                    image,
                    aspect,
                    state,
                } => self.add_image_barrier(image, aspect, state),
            }
        }

        self.write_descriptors(group, &plan.writes);
        Ok(plan)
    }

    /// One batched `vkUpdateDescriptorSets` for every planned write.
    fn write_descriptors(&self, group: &DescriptorSetGroup, planned: &[PlannedWrite]) {
        if planned.is_empty() {
            return;
        }

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut accel_handles = Vec::new();
        for write in planned {
            match *write {
                PlannedWrite::Buffer {
                    buffer,
                    offset,
                    range,
                    ..
                } => buffer_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(buffer)
                        .offset(offset)
                        .range(range),
                ),
                PlannedWrite::Image {
                    view,
                    layout,
                    sampler,
                    ..
                } => image_infos.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(layout)
                        .sampler(sampler),
                ),
                PlannedWrite::AccelerationStructure {
                    acceleration_structure,
                    ..
                } => accel_handles.push(acceleration_structure),
            }
        }

        let mut accel_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = accel_handles
            .chunks(1)
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(handle)
            })
            .collect();

        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(planned.len());
        let (mut buffer_index, mut image_index) = (0usize, 0usize);
        let mut accel_iter = accel_infos.iter_mut();
        for write in planned {
            match write {
                PlannedWrite::Buffer {
                    set,
                    binding,
                    array_element,
                    descriptor_type,
                    ..
                } => {
                    writes.push(
                        vk::WriteDescriptorSet::default()
                            .dst_set(group.sets[*set as usize])
                            .dst_binding(*binding)
                            .dst_array_element(*array_element)
                            .descriptor_type(*descriptor_type)
                            .buffer_info(std::slice::from_ref(&buffer_infos[buffer_index])),
                    );
                    buffer_index += 1;
                }
                PlannedWrite::Image {
                    set,
                    binding,
                    array_element,
                    descriptor_type,
                    ..
                } => {
                    writes.push(
                        vk::WriteDescriptorSet::default()
                            .dst_set(group.sets[*set as usize])
                            .dst_binding(*binding)
                            .dst_array_element(*array_element)
                            .descriptor_type(*descriptor_type)
                            .image_info(std::slice::from_ref(&image_infos[image_index])),
                    );
                    image_index += 1;
                }
                PlannedWrite::AccelerationStructure {
                    set,
                    binding,
                    array_element,
                    ..
                } => {
                    // push_next does not set the count for extension writes.
                    let Some(info) = accel_iter.next() else {
                        continue;
                    };
                    writes.push(
                        vk::WriteDescriptorSet::default()
                            .dst_set(group.sets[*set as usize])
                            .dst_binding(*binding)
                            .dst_array_element(*array_element)
                            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                            .descriptor_count(1)
                            .push_next(info),
                    );
                }
            }
        }

        unsafe { self.device.ash().update_descriptor_sets(&writes, &[]) };
    }

    /// Bind a pipeline.
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .ash()
                .cmd_bind_pipeline(self.command_buffer, bind_point, pipeline)
        };
    }

    /// Bind an already-updated descriptor set group.
    pub fn bind_descriptor_sets(
        &mut self,
        layout: &PipelineLayoutInfo,
        group: &DescriptorSetGroup,
    ) {
        unsafe {
            self.device.ash().cmd_bind_descriptor_sets(
                self.command_buffer,
                layout.bind_point,
                layout.layout,
                0,
                &group.sets,
                &[],
            )
        };
    }

    /// Get, update and bind descriptor sets for `parameter`, then apply its
    /// push constants.
    ///
    /// Pending barriers (including those the walk produced) are recorded
    /// before the bind. A layout with no descriptor sets makes the whole
    /// call a no-op.
    pub fn bind_parameters(
        &mut self,
        layout: &PipelineLayoutInfo,
        parameter: &ShaderParameter,
    ) -> Result<Option<Arc<DescriptorSetGroup>>, RenderError> {
        if layout.set_layouts.is_empty() {
            return Ok(None);
        }

        let group = self.get_descriptor_sets(layout)?;
        let plan = self.update_descriptor_sets(&group, parameter, layout)?;
        self.execute_barriers();
        self.bind_descriptor_sets(layout, &group);
        for push in &plan.push_constants {
            unsafe {
                self.device.ash().cmd_push_constants(
                    self.command_buffer,
                    layout.layout,
                    layout.shader_stages,
                    push.offset,
                    &push.data,
                )
            };
        }
        Ok(Some(group))
    }

    /// Record a compute dispatch.
    pub fn dispatch(&mut self, group_count: [u32; 3]) {
        unsafe {
            self.device.ash().cmd_dispatch(
                self.command_buffer,
                group_count[0],
                group_count[1],
                group_count[2],
            )
        };
    }

    /// Open a debug label region. No-op without debug utils.
    pub fn push_debug_label(&mut self, name: &str) {
        self.device.cmd_begin_label(self.command_buffer, name);
    }

    /// Close the innermost debug label region. Must balance
    /// [`push_debug_label`](Self::push_debug_label).
    pub fn pop_debug_label(&mut self) {
        self.device.cmd_end_label(self.command_buffer);
    }

    /// End recording and submit to the device queue.
    ///
    /// One timeline signal of the next counter value is appended to the
    /// caller's semaphores; the returned value is reached when this
    /// submission completes.
    pub fn submit(
        &mut self,
        waits: &[vk::SemaphoreSubmitInfo],
        signals: &[vk::SemaphoreSubmitInfo],
    ) -> Result<TimelineValue, RenderError> {
        unsafe { self.device.ash().end_command_buffer(self.command_buffer) }?;

        let value = self.device.next_signal();
        let mut signal_infos = signals.to_vec();
        signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(self.device.timeline_semaphore())
                .value(value.0)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        );

        let command_buffer_infos =
            [vk::CommandBufferSubmitInfo::default().command_buffer(self.command_buffer)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(waits)
            .command_buffer_infos(&command_buffer_infos)
            .signal_semaphore_infos(&signal_infos);

        unsafe {
            self.device
                .ash()
                .queue_submit2(self.device.queue(), &[submit_info], vk::Fence::null())
        }?;

        self.last_submit = value;
        log::trace!("CommandContext: submitted, signals {}", value.0);
        Ok(value)
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        // The caller is responsible for draining the device before dropping
        // a context (wait_idle at shutdown).
        self.buffers.clear();
        self.descriptor_sets.clear();
        self.descriptor_pools.destroy(self.device.ash());
        if self.command_pool != vk::CommandPool::null() {
            unsafe {
                self.device
                    .ash()
                    .destroy_command_pool(self.command_pool, None)
            };
        }
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("last_submit", &self.last_submit)
            .finish()
    }
}
