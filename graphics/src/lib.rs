//! Vulkan rendering core.
//!
//! The building blocks of the renderer, bottom up:
//!
//! - [`device`]: logical device wrapper, GPU allocator, the timeline
//!   semaphore and its monotonic counter, pipeline cache persistence.
//! - [`barrier`]: declared resource states and minimal `synchronization2`
//!   barrier batching.
//! - [`transient`]: timeline-gated buffer and descriptor set pooling.
//! - [`shader`] and [`bind`]: named parameter trees resolved against
//!   reflected pipeline layouts into descriptor writes, push constants and
//!   barrier requests.
//! - [`context`]: command buffer recording tying the above together.
//! - [`pipeline`]: pipeline creation and background compilation.
//! - [`terrain`] and [`tonemap`]: the renderer features built on the core.
//!
//! GPU ordering is expressed exclusively through one timeline semaphore;
//! the CPU blocks only in [`context::CommandContext::begin`] and explicit
//! shutdown paths.

pub mod barrier;
pub mod bind;
pub mod context;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod shader;
pub mod terrain;
pub mod tonemap;
pub mod transient;

pub use context::CommandContext;
pub use device::{RenderDevice, TimelineValue};
pub use error::RenderError;
