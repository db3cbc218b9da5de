//! Render device and timeline synchronization.
//!
//! [`RenderDevice`] wraps an already-created `ash::Device` together with the
//! single timeline semaphore that orders all GPU work. Instance and logical
//! device bootstrap happen outside this crate; the device arrives here ready
//! to use.
//!
//! # Timeline
//!
//! Every submission signals the next value of one monotonically increasing
//! counter. A [`TimelineValue`] is "reached" once the device-side counter is
//! greater than or equal to it, which proves all work submitted with smaller
//! values has completed. CPU-side code never blocks on the timeline except in
//! [`CommandContext::begin`](crate::context::CommandContext::begin) and
//! [`RenderDevice::wait_idle`].

use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;

use crate::error::RenderError;

/// A point on the device timeline.
///
/// Values are issued in strictly increasing order; the default value `0` is
/// already reached on a fresh timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimelineValue(pub u64);

/// CPU-side source of timeline signal values.
///
/// The counter only ever increments. The first issued value is `1`; the
/// semaphore starts at `0`.
#[derive(Debug)]
pub struct TimelineCounter {
    next: AtomicU64,
}

impl TimelineCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Issue the next signal value.
    pub fn next_signal(&self) -> TimelineValue {
        TimelineValue(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The value the next call to [`next_signal`](Self::next_signal) will
    /// return, without issuing it.
    ///
    /// Used to tag retired resources with the submission that will retire
    /// them.
    pub fn next_value(&self) -> TimelineValue {
        TimelineValue(self.next.load(Ordering::Relaxed))
    }
}

impl Default for TimelineCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The rendering device: queue, limits, allocator and timeline.
pub struct RenderDevice {
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    limits: vk::PhysicalDeviceLimits,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    timeline_semaphore: vk::Semaphore,
    counter: TimelineCounter,
    pipeline_cache: Mutex<vk::PipelineCache>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl RenderDevice {
    /// Wrap a logical device created by the application's bootstrap code.
    ///
    /// Takes ownership of `device`; it is destroyed when the `RenderDevice`
    /// is dropped. The device must have been created with timeline semaphore
    /// and synchronization2 features enabled.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family: u32,
        queue: vk::Queue,
        enable_debug_utils: bool,
    ) -> Result<Self, RenderError> {
        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::Allocation(e.to_string()))?;

        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let timeline_semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }?;

        let pipeline_cache =
            unsafe { device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None) }?;

        let debug_utils =
            enable_debug_utils.then(|| ash::ext::debug_utils::Device::new(instance, &device));

        let render_device = Self {
            device,
            queue,
            queue_family,
            limits,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            timeline_semaphore,
            counter: TimelineCounter::new(),
            pipeline_cache: Mutex::new(pipeline_cache),
            debug_utils,
        };
        render_device.set_debug_name(timeline_semaphore, "device timeline");
        Ok(render_device)
    }

    pub fn ash(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    pub fn timeline_semaphore(&self) -> vk::Semaphore {
        self.timeline_semaphore
    }

    /// Issue the next timeline signal value.
    pub fn next_signal(&self) -> TimelineValue {
        self.counter.next_signal()
    }

    /// The value the next submission will signal, without issuing it.
    pub fn next_value(&self) -> TimelineValue {
        self.counter.next_value()
    }

    /// The device-side completed timeline value.
    pub fn completed_value(&self) -> Result<TimelineValue, RenderError> {
        let value = unsafe { self.device.get_semaphore_counter_value(self.timeline_semaphore) }
            .map_err(RenderError::DeviceWait)?;
        Ok(TimelineValue(value))
    }

    /// Whether `value` has been reached, without blocking.
    pub fn is_reached(&self, value: TimelineValue) -> Result<bool, RenderError> {
        Ok(self.completed_value()? >= value)
    }

    /// Block until `value` is reached.
    pub fn wait(&self, value: TimelineValue) -> Result<(), RenderError> {
        let semaphores = [self.timeline_semaphore];
        let values = [value.0];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }
            .map_err(RenderError::DeviceWait)
    }

    /// Block until every submitted command buffer has completed.
    ///
    /// Used before swapping pipelines that in-flight work may reference, and
    /// at shutdown.
    pub fn wait_idle(&self) -> Result<(), RenderError> {
        unsafe { self.device.device_wait_idle() }.map_err(RenderError::DeviceWait)
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        *self.pipeline_cache.lock()
    }

    /// Replace the pipeline cache with one seeded from a blob on disk.
    ///
    /// A missing or unreadable blob is not an error; compilation simply
    /// starts cold.
    pub fn load_pipeline_cache(&self, path: &Path) {
        let data = match std::fs::read(path) {
            Ok(data) => {
                log::info!(
                    "Read pipeline cache ({:.2} KiB)",
                    data.len() as f32 / 1024.0
                );
                data
            }
            Err(e) => {
                log::warn!("Failed to read pipeline cache: {e}");
                Vec::new()
            }
        };

        let cache_info = vk::PipelineCacheCreateInfo::default().initial_data(&data);
        match unsafe { self.device.create_pipeline_cache(&cache_info, None) } {
            Ok(cache) => {
                let old = std::mem::replace(&mut *self.pipeline_cache.lock(), cache);
                unsafe { self.device.destroy_pipeline_cache(old, None) };
            }
            Err(e) => log::warn!("Failed to create pipeline cache: {e:?}"),
        }
    }

    /// Write the pipeline cache blob to disk.
    ///
    /// Failures are logged; shutdown proceeds either way.
    pub fn store_pipeline_cache(&self, path: &Path) {
        let data = match unsafe { self.device.get_pipeline_cache_data(self.pipeline_cache()) } {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Failed to query pipeline cache data: {e:?}");
                return;
            }
        };
        if data.is_empty() {
            return;
        }
        if let Err(e) = std::fs::write(path, &data) {
            log::warn!("Failed to write pipeline cache: {e}");
        }
    }

    /// Attach a debug name to a Vulkan object. No-op without debug utils.
    pub fn set_debug_name<T: vk::Handle + Copy>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            log::warn!("Failed to set debug name: {e:?}");
        }
    }

    /// Open a debug label region in a command buffer. No-op without debug
    /// utils.
    pub fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
        unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
    }

    /// Close the innermost debug label region. No-op without debug utils.
    pub fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        unsafe {
            // The allocator must release its memory before the device goes away.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_semaphore(self.timeline_semaphore, None);
            self.device
                .destroy_pipeline_cache(*self.pipeline_cache.lock(), None);
            self.device.destroy_device(None);
        }
    }
}

impl std::fmt::Debug for RenderDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderDevice")
            .field("queue_family", &self.queue_family)
            .finish()
    }
}

// SAFETY: all interior mutability goes through Mutex or atomics, and ash
// device handles are externally synchronized per-call where required.
unsafe impl Send for RenderDevice {}
unsafe impl Sync for RenderDevice {}

static_assertions::assert_impl_all!(RenderDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_one() {
        let counter = TimelineCounter::new();
        assert_eq!(counter.next_value(), TimelineValue(1));
        assert_eq!(counter.next_signal(), TimelineValue(1));
    }

    #[test]
    fn test_counter_is_strictly_increasing() {
        let counter = TimelineCounter::new();
        let mut previous = TimelineValue(0);
        for _ in 0..100 {
            let value = counter.next_signal();
            assert!(value > previous);
            assert_eq!(value.0, previous.0 + 1);
            previous = value;
        }
    }

    #[test]
    fn test_next_value_does_not_issue() {
        let counter = TimelineCounter::new();
        let peeked = counter.next_value();
        assert_eq!(counter.next_value(), peeked);
        assert_eq!(counter.next_signal(), peeked);
        assert_eq!(counter.next_value(), TimelineValue(peeked.0 + 1));
    }

    #[test]
    fn test_counter_across_threads() {
        let counter = std::sync::Arc::new(TimelineCounter::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = std::sync::Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                (0..256).map(|_| counter.next_signal().0).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        // No value is ever issued twice.
        assert_eq!(all.len(), 4 * 256);
    }

    #[test]
    fn test_default_value_is_reached_ordering() {
        assert!(TimelineValue::default() < TimelineValue(1));
        assert_eq!(TimelineValue::default(), TimelineValue(0));
    }
}
