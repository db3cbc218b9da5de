//! The binding engine: resolving a parameter tree against a binding tree.
//!
//! [`plan_bindings`] performs a recursive lock-step walk of the two trees and
//! produces a [`BindingPlan`]: descriptor writes, uniform data blobs, push
//! constant updates, barrier requests and warnings. The plan is pure data;
//! [`CommandContext`](crate::context::CommandContext) applies it with one
//! batched `vkUpdateDescriptorSets` call after uploading the constant blobs.
//!
//! # Walk rules
//!
//! - A purely numeric key is an array index into the binding its parent
//!   resolved to. An out-of-range index warns but the write still happens;
//!   the shader-side declaration may be an unsized array.
//! - An unknown named key warns and that subtree is skipped.
//! - Constants resolve to push constant ranges or uniform blobs via their
//!   reflected offsets, accumulated down nested constant blocks. A constant
//!   assigned directly to a buffer descriptor
//!   is promoted: uploaded to a transient buffer by the apply pass.
//! - Buffer and image values produce a descriptor write and a barrier
//!   request. Access masks for storage bindings are a conservative
//!   read-and-write regardless of the reflected writable flag; callers rely
//!   on the resulting ordering.
//! - Empty buffer ranges and image parameters carrying neither a view nor a
//!   sampler are skipped silently.

use ash::vk;

use crate::barrier::{BufferState, ImageState};
use crate::shader::{
    BindingKind, BufferRange, ConstantBinding, ConstantTarget, DescriptorBinding, ImageParameter,
    ParameterValue, PipelineLayoutInfo, ShaderParameter, ShaderParameterBinding,
};

/// A recoverable problem found during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingWarning {
    /// A parameter name has no counterpart in the binding tree.
    UnknownParameter { path: String },
    /// A numeric key exceeds the reflected array size.
    ArrayIndexOutOfBounds { path: String, index: u32, size: u32 },
    /// A constant's byte size differs from the reflected type size.
    ConstantSizeMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },
    /// A value kind cannot be bound to what reflection declared.
    TypeMismatch { path: String },
}

impl std::fmt::Display for BindingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownParameter { path } => write!(f, "unknown shader parameter '{path}'"),
            Self::ArrayIndexOutOfBounds { path, index, size } => {
                write!(f, "'{path}': index {index} exceeds array size {size}")
            }
            Self::ConstantSizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "'{path}': constant is {actual} bytes, shader declares {expected}"
            ),
            Self::TypeMismatch { path } => {
                write!(f, "'{path}': value kind does not match shader binding")
            }
        }
    }
}

/// One descriptor write, resolved but not yet turned into Vulkan structs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedWrite {
    Buffer {
        set: u32,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        set: u32,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    AccelerationStructure {
        set: u32,
        binding: u32,
        array_element: u32,
        acceleration_structure: vk::AccelerationStructureKHR,
    },
}

/// Constant data destined for a uniform buffer descriptor, keyed by slot.
/// Grown on demand as constants land at their reflected offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlob {
    pub set: u32,
    pub binding: u32,
    pub data: Vec<u8>,
}

/// A constant assigned directly to a buffer descriptor binding; the apply
/// pass uploads it to a transient buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedConstant {
    pub set: u32,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub data: Vec<u8>,
}

/// One push constant update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstantRange {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// A barrier the bound resources need before the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierRequest {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        state: BufferState,
    },
    Image {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        state: ImageState,
    },
}

/// Everything needed to apply one parameter tree to one descriptor set group.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BindingPlan {
    pub writes: Vec<PlannedWrite>,
    pub uniforms: Vec<UniformBlob>,
    pub promoted: Vec<PromotedConstant>,
    pub push_constants: Vec<PushConstantRange>,
    pub barriers: Vec<BarrierRequest>,
    pub warnings: Vec<BindingWarning>,
}

impl BindingPlan {
    fn warn(&mut self, warning: BindingWarning) {
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    fn uniform_blob(&mut self, set: u32, binding: u32) -> &mut UniformBlob {
        let index = self
            .uniforms
            .iter()
            .position(|blob| blob.set == set && blob.binding == binding)
            .unwrap_or_else(|| {
                self.uniforms.push(UniformBlob {
                    set,
                    binding,
                    data: Vec::new(),
                });
                self.uniforms.len() - 1
            });
        &mut self.uniforms[index]
    }
}

/// Resolve `parameter` against the reflected bindings of `layout`.
///
/// A layout with zero descriptor set layouts short-circuits to an empty
/// plan; binding against it is a no-op. Warnings never abort the walk.
pub fn plan_bindings(
    parameter: &ShaderParameter,
    layout: &PipelineLayoutInfo,
    queue_family: u32,
) -> BindingPlan {
    let mut plan = BindingPlan::default();
    if layout.set_layouts.is_empty() {
        return plan;
    }

    let walker = Walker {
        pipeline_stages: layout.pipeline_stages,
        queue_family,
    };
    walker.walk(parameter, &layout.bindings, "", 0, 0, &mut plan);
    plan
}

struct Walker {
    pipeline_stages: vk::PipelineStageFlags2,
    queue_family: u32,
}

impl Walker {
    fn walk(
        &self,
        parameter: &ShaderParameter,
        binding: &ShaderParameterBinding,
        path: &str,
        array_element: u32,
        inherited_offset: u32,
        plan: &mut BindingPlan,
    ) {
        self.apply_value(parameter, binding, path, array_element, inherited_offset, plan);

        // Members of a constant block carry offsets relative to the block;
        // descending into one accumulates its offset for the whole subtree.
        let child_offset = match &binding.kind {
            BindingKind::Constant(constant) => inherited_offset + constant.offset,
            _ => inherited_offset,
        };

        for (key, child) in parameter.children() {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };

            if let Some(index) = parse_array_index(key) {
                // Array element: same binding node, explicit element index.
                if let BindingKind::Descriptor(descriptor) = &binding.kind {
                    if index >= descriptor.array_size {
                        plan.warn(BindingWarning::ArrayIndexOutOfBounds {
                            path: child_path.clone(),
                            index,
                            size: descriptor.array_size,
                        });
                    }
                }
                self.walk(child, binding, &child_path, index, inherited_offset, plan);
            } else if let Some(child_binding) = binding.get(key) {
                self.walk(child, child_binding, &child_path, 0, child_offset, plan);
            } else {
                plan.warn(BindingWarning::UnknownParameter { path: child_path });
            }
        }
    }

    fn apply_value(
        &self,
        parameter: &ShaderParameter,
        binding: &ShaderParameterBinding,
        path: &str,
        array_element: u32,
        inherited_offset: u32,
        plan: &mut BindingPlan,
    ) {
        match (&parameter.value, &binding.kind) {
            (ParameterValue::Empty, _) => {}

            (ParameterValue::Constant(data), BindingKind::Constant(constant)) => {
                if data.len() as u32 != constant.type_size {
                    plan.warn(BindingWarning::ConstantSizeMismatch {
                        path: path.to_string(),
                        expected: constant.type_size,
                        actual: data.len() as u32,
                    });
                }
                let offset = inherited_offset + constant.offset;
                match constant.target {
                    ConstantTarget::PushConstant => plan.push_constants.push(PushConstantRange {
                        offset,
                        data: data.clone(),
                    }),
                    ConstantTarget::Uniform { set, binding } => {
                        let blob = plan.uniform_blob(set, binding);
                        let end = offset as usize + data.len();
                        if blob.data.len() < end {
                            blob.data.resize(end, 0);
                        }
                        blob.data[offset as usize..end].copy_from_slice(data);
                    }
                }
            }

            (ParameterValue::Constant(data), BindingKind::Descriptor(descriptor)) => {
                if matches!(
                    descriptor.descriptor_type,
                    vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER
                ) {
                    plan.promoted.push(PromotedConstant {
                        set: descriptor.set,
                        binding: descriptor.binding,
                        array_element,
                        descriptor_type: descriptor.descriptor_type,
                        data: data.clone(),
                    });
                } else {
                    plan.warn(BindingWarning::TypeMismatch {
                        path: path.to_string(),
                    });
                }
            }

            (ParameterValue::Buffer(range), BindingKind::Descriptor(descriptor)) => {
                self.apply_buffer(range, descriptor, path, array_element, plan);
            }

            (ParameterValue::Image(image), BindingKind::Descriptor(descriptor)) => {
                self.apply_image(image, descriptor, path, array_element, plan);
            }

            (
                ParameterValue::AccelerationStructure(acceleration_structure),
                BindingKind::Descriptor(descriptor),
            ) => {
                if descriptor.descriptor_type == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR {
                    plan.writes.push(PlannedWrite::AccelerationStructure {
                        set: descriptor.set,
                        binding: descriptor.binding,
                        array_element,
                        acceleration_structure: *acceleration_structure,
                    });
                } else {
                    plan.warn(BindingWarning::TypeMismatch {
                        path: path.to_string(),
                    });
                }
            }

            _ => plan.warn(BindingWarning::TypeMismatch {
                path: path.to_string(),
            }),
        }
    }

    fn apply_buffer(
        &self,
        range: &BufferRange,
        descriptor: &DescriptorBinding,
        path: &str,
        array_element: u32,
        plan: &mut BindingPlan,
    ) {
        let access = match descriptor.descriptor_type {
            vk::DescriptorType::UNIFORM_BUFFER => vk::AccessFlags2::UNIFORM_READ,
            vk::DescriptorType::STORAGE_BUFFER => {
                // Conservative: ignore the reflected writable flag.
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
            }
            _ => {
                plan.warn(BindingWarning::TypeMismatch {
                    path: path.to_string(),
                });
                return;
            }
        };

        // Unbound ranges are an expected way to express "nothing here".
        if range.is_empty() {
            return;
        }

        plan.writes.push(PlannedWrite::Buffer {
            set: descriptor.set,
            binding: descriptor.binding,
            array_element,
            descriptor_type: descriptor.descriptor_type,
            buffer: range.buffer,
            offset: range.offset,
            range: range.size,
        });
        plan.barriers.push(BarrierRequest::Buffer {
            buffer: range.buffer,
            offset: range.offset,
            size: range.size,
            state: BufferState::new(self.pipeline_stages, access)
                .with_queue_family(self.queue_family),
        });
    }

    fn apply_image(
        &self,
        image: &ImageParameter,
        descriptor: &DescriptorBinding,
        path: &str,
        array_element: u32,
        plan: &mut BindingPlan,
    ) {
        let access = match descriptor.descriptor_type {
            vk::DescriptorType::STORAGE_IMAGE => {
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
            }
            vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLER => vk::AccessFlags2::SHADER_SAMPLED_READ,
            _ => {
                plan.warn(BindingWarning::TypeMismatch {
                    path: path.to_string(),
                });
                return;
            }
        };

        // A sampler-only parameter has no view; skip only when neither half
        // is present.
        if image.view == vk::ImageView::null() && image.sampler == vk::Sampler::null() {
            return;
        }

        plan.writes.push(PlannedWrite::Image {
            set: descriptor.set,
            binding: descriptor.binding,
            array_element,
            descriptor_type: descriptor.descriptor_type,
            view: image.view,
            layout: image.layout,
            sampler: image.sampler,
        });
        if image.image != vk::Image::null() {
            plan.barriers.push(BarrierRequest::Image {
                image: image.image,
                aspect: image.aspect,
                state: ImageState::new(image.layout, self.pipeline_stages, access)
                    .with_queue_family(self.queue_family),
            });
        }
    }
}

/// A key is an array index iff it is non-empty and purely ASCII digits.
fn parse_array_index(key: &str) -> Option<u32> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use rstest::rstest;

    fn storage_binding(set: u32, binding: u32, array_size: u32) -> ShaderParameterBinding {
        ShaderParameterBinding::descriptor(DescriptorBinding {
            set,
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            array_size,
            writable: false,
        })
    }

    fn test_layout(bindings: ShaderParameterBinding) -> PipelineLayoutInfo {
        PipelineLayoutInfo {
            layout: vk::PipelineLayout::from_raw(1),
            set_layouts: vec![vk::DescriptorSetLayout::from_raw(2)],
            bindings,
            shader_stages: vk::ShaderStageFlags::COMPUTE,
            pipeline_stages: vk::PipelineStageFlags2::COMPUTE_SHADER,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        }
    }

    fn some_buffer(raw: u64) -> BufferRange {
        BufferRange::new(vk::Buffer::from_raw(raw), 0, 256)
    }

    #[test]
    fn test_zero_set_layouts_short_circuit() {
        let mut layout = test_layout(ShaderParameterBinding::default().with(
            "data",
            storage_binding(0, 0, 1),
        ));
        layout.set_layouts.clear();

        let params =
            ShaderParameter::new().with("data", ShaderParameter::buffer(some_buffer(5)));
        let plan = plan_bindings(&params, &layout, 0);
        assert_eq!(plan, BindingPlan::default());
    }

    #[test]
    fn test_buffer_write_and_barrier() {
        let layout = test_layout(
            ShaderParameterBinding::default().with("data", storage_binding(0, 3, 1)),
        );
        let params = ShaderParameter::new().with("data", ShaderParameter::buffer(some_buffer(5)));

        let plan = plan_bindings(&params, &layout, 7);
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(plan.barriers.len(), 1);

        match &plan.writes[0] {
            PlannedWrite::Buffer { set, binding, array_element, range, .. } => {
                assert_eq!((*set, *binding, *array_element, *range), (0, 3, 0, 256));
            }
            other => panic!("unexpected write: {other:?}"),
        }
        match &plan.barriers[0] {
            BarrierRequest::Buffer { state, .. } => {
                // Conservative read and write, and the caller's queue family.
                assert_eq!(
                    state.access,
                    vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
                );
                assert_eq!(state.queue_family, 7);
            }
            other => panic!("unexpected barrier: {other:?}"),
        }
    }

    #[test]
    fn test_array_round_trip() {
        let n = 5u64;
        let layout = test_layout(
            ShaderParameterBinding::default().with("elements", storage_binding(0, 0, 8)),
        );

        let mut elements = ShaderParameter::new();
        for i in 0..n {
            elements.set_element(i as usize, ShaderParameter::buffer(some_buffer(100 + i)));
        }
        let params = ShaderParameter::new().with("elements", elements);

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.writes.len(), n as usize);

        // Every element lands at its own index.
        let mut seen: Vec<u32> = plan
            .writes
            .iter()
            .map(|write| match write {
                PlannedWrite::Buffer { array_element, .. } => *array_element,
                other => panic!("unexpected write: {other:?}"),
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..n as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_array_overflow_warns_but_writes() {
        let layout = test_layout(
            ShaderParameterBinding::default().with("elements", storage_binding(0, 0, 2)),
        );
        let mut elements = ShaderParameter::new();
        elements.set_element(9, ShaderParameter::buffer(some_buffer(1)));
        let params = ShaderParameter::new().with("elements", elements);

        let plan = plan_bindings(&params, &layout, 0);
        assert_eq!(plan.writes.len(), 1);
        assert!(matches!(
            plan.warnings[0],
            BindingWarning::ArrayIndexOutOfBounds { index: 9, size: 2, .. }
        ));
    }

    #[test]
    fn test_unknown_parameter_warns_and_skips() {
        let layout = test_layout(
            ShaderParameterBinding::default().with("data", storage_binding(0, 0, 1)),
        );
        let params = ShaderParameter::new()
            .with("data", ShaderParameter::buffer(some_buffer(1)))
            .with("typo", ShaderParameter::buffer(some_buffer(2)));

        let plan = plan_bindings(&params, &layout, 0);
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(
            plan.warnings,
            vec![BindingWarning::UnknownParameter {
                path: "typo".to_string()
            }]
        );
    }

    #[test]
    fn test_empty_buffer_skipped_silently() {
        let layout = test_layout(
            ShaderParameterBinding::default().with("data", storage_binding(0, 0, 1)),
        );
        let params = ShaderParameter::new().with(
            "data",
            ShaderParameter::buffer(BufferRange::new(vk::Buffer::null(), 0, 0)),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.writes.is_empty());
        assert!(plan.barriers.is_empty());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_push_constant_collected() {
        let layout = test_layout(ShaderParameterBinding::default().with(
            "time",
            ShaderParameterBinding::constant(ConstantBinding {
                offset: 4,
                type_size: 4,
                target: ConstantTarget::PushConstant,
            }),
        ));
        let params = ShaderParameter::new().with("time", ShaderParameter::constant(&0.5f32));

        let plan = plan_bindings(&params, &layout, 0);
        assert_eq!(
            plan.push_constants,
            vec![PushConstantRange {
                offset: 4,
                data: 0.5f32.to_ne_bytes().to_vec()
            }]
        );
    }

    #[test]
    fn test_uniform_blob_grows_to_fit() {
        let bindings = ShaderParameterBinding::default()
            .with(
                "near",
                ShaderParameterBinding::constant(ConstantBinding {
                    offset: 0,
                    type_size: 4,
                    target: ConstantTarget::Uniform { set: 0, binding: 1 },
                }),
            )
            .with(
                "far",
                ShaderParameterBinding::constant(ConstantBinding {
                    offset: 12,
                    type_size: 4,
                    target: ConstantTarget::Uniform { set: 0, binding: 1 },
                }),
            );
        let layout = test_layout(bindings);
        let params = ShaderParameter::new()
            .with("near", ShaderParameter::constant(&0.1f32))
            .with("far", ShaderParameter::constant(&100.0f32));

        let plan = plan_bindings(&params, &layout, 0);
        assert_eq!(plan.uniforms.len(), 1);
        let blob = &plan.uniforms[0];
        assert_eq!((blob.set, blob.binding), (0, 1));
        assert_eq!(blob.data.len(), 16);
        assert_eq!(&blob.data[0..4], &0.1f32.to_ne_bytes());
        assert_eq!(&blob.data[12..16], &100.0f32.to_ne_bytes());
    }

    #[test]
    fn test_nested_constant_offsets_accumulate() {
        // A block at offset 16 whose member "x" sits at relative offset 4
        // must land the member at absolute offset 20.
        let bindings = ShaderParameterBinding::default().with(
            "consts",
            ShaderParameterBinding::constant(ConstantBinding {
                offset: 16,
                type_size: 8,
                target: ConstantTarget::Uniform { set: 0, binding: 1 },
            })
            .with(
                "x",
                ShaderParameterBinding::constant(ConstantBinding {
                    offset: 4,
                    type_size: 4,
                    target: ConstantTarget::Uniform { set: 0, binding: 1 },
                }),
            ),
        );
        let layout = test_layout(bindings);
        let params = ShaderParameter::new().with(
            "consts",
            ShaderParameter::new().with("x", ShaderParameter::constant(&7u32)),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.uniforms.len(), 1);
        let blob = &plan.uniforms[0];
        assert_eq!(blob.data.len(), 24);
        assert_eq!(&blob.data[20..24], &7u32.to_ne_bytes());
        assert!(blob.data[..20].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_nested_push_constant_offsets_accumulate() {
        let bindings = ShaderParameterBinding::default().with(
            "frame",
            ShaderParameterBinding::constant(ConstantBinding {
                offset: 8,
                type_size: 4,
                target: ConstantTarget::PushConstant,
            })
            .with(
                "time",
                ShaderParameterBinding::constant(ConstantBinding {
                    offset: 0,
                    type_size: 4,
                    target: ConstantTarget::PushConstant,
                }),
            ),
        );
        let layout = test_layout(bindings);
        let params = ShaderParameter::new().with(
            "frame",
            ShaderParameter::new().with("time", ShaderParameter::constant(&0.5f32)),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert_eq!(
            plan.push_constants,
            vec![PushConstantRange {
                offset: 8,
                data: 0.5f32.to_ne_bytes().to_vec()
            }]
        );
    }

    #[test]
    fn test_constant_promoted_to_buffer() {
        let layout = test_layout(
            ShaderParameterBinding::default().with("lut", storage_binding(1, 2, 1)),
        );
        let params =
            ShaderParameter::new().with("lut", ShaderParameter::constant(&[1u32, 2, 3, 4]));

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.writes.is_empty());
        assert_eq!(plan.promoted.len(), 1);
        let promoted = &plan.promoted[0];
        assert_eq!((promoted.set, promoted.binding), (1, 2));
        assert_eq!(promoted.data.len(), 16);
    }

    #[test]
    fn test_constant_size_mismatch_copies_fully() {
        let layout = test_layout(ShaderParameterBinding::default().with(
            "color",
            ShaderParameterBinding::constant(ConstantBinding {
                offset: 0,
                type_size: 12,
                target: ConstantTarget::PushConstant,
            }),
        ));
        let params = ShaderParameter::new()
            .with("color", ShaderParameter::constant(&[1.0f32, 2.0, 3.0, 4.0]));

        let plan = plan_bindings(&params, &layout, 0);
        assert!(matches!(
            plan.warnings[0],
            BindingWarning::ConstantSizeMismatch {
                expected: 12,
                actual: 16,
                ..
            }
        ));
        // The full value is still written.
        assert_eq!(plan.push_constants[0].data.len(), 16);
    }

    #[test]
    fn test_nested_walk() {
        let bindings = ShaderParameterBinding::default().with(
            "scene",
            ShaderParameterBinding::default()
                .with("vertices", storage_binding(0, 0, 1))
                .with("indices", storage_binding(0, 1, 1)),
        );
        let layout = test_layout(bindings);

        let params = ShaderParameter::new().with(
            "scene",
            ShaderParameter::new()
                .with("vertices", ShaderParameter::buffer(some_buffer(1)))
                .with("indices", ShaderParameter::buffer(some_buffer(2))),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.writes.len(), 2);
    }

    #[test]
    fn test_image_write_and_barrier() {
        let layout = test_layout(ShaderParameterBinding::default().with(
            "output",
            ShaderParameterBinding::descriptor(DescriptorBinding {
                set: 0,
                binding: 0,
                descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                array_size: 1,
                writable: true,
            }),
        ));
        let params = ShaderParameter::new().with(
            "output",
            ShaderParameter::image(ImageParameter {
                image: vk::Image::from_raw(10),
                view: vk::ImageView::from_raw(11),
                layout: vk::ImageLayout::GENERAL,
                sampler: vk::Sampler::null(),
                aspect: vk::ImageAspectFlags::COLOR,
            }),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert_eq!(plan.writes.len(), 1);
        match &plan.barriers[0] {
            BarrierRequest::Image { state, .. } => {
                assert_eq!(state.layout, vk::ImageLayout::GENERAL);
            }
            other => panic!("unexpected barrier: {other:?}"),
        }
    }

    #[test]
    fn test_sampler_only_binding_written() {
        let layout = test_layout(ShaderParameterBinding::default().with(
            "point_clamp",
            ShaderParameterBinding::descriptor(DescriptorBinding {
                set: 0,
                binding: 2,
                descriptor_type: vk::DescriptorType::SAMPLER,
                array_size: 1,
                writable: false,
            }),
        ));
        let params = ShaderParameter::new().with(
            "point_clamp",
            ShaderParameter::image(ImageParameter {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
                layout: vk::ImageLayout::UNDEFINED,
                sampler: vk::Sampler::from_raw(9),
                aspect: vk::ImageAspectFlags::NONE,
            }),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.warnings.is_empty());
        assert!(plan.barriers.is_empty());
        match &plan.writes[0] {
            PlannedWrite::Image { binding, sampler, view, .. } => {
                assert_eq!(*binding, 2);
                assert_eq!(*sampler, vk::Sampler::from_raw(9));
                assert_eq!(*view, vk::ImageView::null());
            }
            other => panic!("unexpected write: {other:?}"),
        }
    }

    #[test]
    fn test_image_with_neither_view_nor_sampler_skipped() {
        let layout = test_layout(ShaderParameterBinding::default().with(
            "source",
            ShaderParameterBinding::descriptor(DescriptorBinding {
                set: 0,
                binding: 0,
                descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                array_size: 1,
                writable: false,
            }),
        ));
        let params = ShaderParameter::new().with(
            "source",
            ShaderParameter::image(ImageParameter {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
                layout: vk::ImageLayout::UNDEFINED,
                sampler: vk::Sampler::null(),
                aspect: vk::ImageAspectFlags::COLOR,
            }),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.writes.is_empty());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_type_mismatch_warns() {
        let layout = test_layout(
            ShaderParameterBinding::default().with("data", storage_binding(0, 0, 1)),
        );
        let params = ShaderParameter::new().with(
            "data",
            ShaderParameter::image(ImageParameter {
                image: vk::Image::from_raw(1),
                view: vk::ImageView::from_raw(2),
                layout: vk::ImageLayout::GENERAL,
                sampler: vk::Sampler::null(),
                aspect: vk::ImageAspectFlags::COLOR,
            }),
        );

        let plan = plan_bindings(&params, &layout, 0);
        assert!(plan.writes.is_empty());
        assert!(matches!(
            plan.warnings[0],
            BindingWarning::TypeMismatch { .. }
        ));
    }

    #[rstest]
    #[case("0", Some(0))]
    #[case("42", Some(42))]
    #[case("007", Some(7))]
    #[case("", None)]
    #[case("4x", None)]
    #[case("x4", None)]
    #[case("-1", None)]
    fn test_parse_array_index(#[case] key: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_array_index(key), expected);
    }
}
