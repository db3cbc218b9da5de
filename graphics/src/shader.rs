//! Shader parameter values and reflected binding trees.
//!
//! Parameters form a named tree built by application code; bindings form a
//! structurally similar tree produced from pipeline reflection. The binding
//! engine in [`crate::bind`] walks both in lock step.
//!
//! A purely numeric child key addresses an array element of the binding the
//! parent resolved to; named keys descend into the reflected children.

use std::collections::BTreeMap;

use ash::vk;
use bytemuck::NoUninit;

/// A sub-range of a buffer bound to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

impl BufferRange {
    pub fn new(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self {
            buffer,
            offset,
            size,
        }
    }

    /// An empty range binds nothing and produces no barrier.
    pub fn is_empty(&self) -> bool {
        self.size == 0 || self.buffer == vk::Buffer::null()
    }
}

/// An image (and optional sampler) bound to a descriptor, together with the
/// layout the shader will access it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageParameter {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub sampler: vk::Sampler,
    pub aspect: vk::ImageAspectFlags,
}

/// The value carried by one parameter tree node.
#[derive(Debug, Clone, Default)]
pub enum ParameterValue {
    /// No value; the node exists only for its children.
    #[default]
    Empty,
    /// Raw constant bytes, written to push constants or uniform data.
    Constant(Vec<u8>),
    Buffer(BufferRange),
    Image(ImageParameter),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// A named tree of shader inputs.
///
/// Every node carries a value (possibly [`ParameterValue::Empty`]) and an
/// ordered map of children.
#[derive(Debug, Clone, Default)]
pub struct ShaderParameter {
    pub value: ParameterValue,
    children: BTreeMap<String, ShaderParameter>,
}

impl ShaderParameter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A constant node from any plain-old-data value.
    pub fn constant<T: NoUninit>(value: &T) -> Self {
        Self::constant_bytes(bytemuck::bytes_of(value).to_vec())
    }

    pub fn constant_bytes(data: Vec<u8>) -> Self {
        Self {
            value: ParameterValue::Constant(data),
            children: BTreeMap::new(),
        }
    }

    pub fn buffer(range: BufferRange) -> Self {
        Self {
            value: ParameterValue::Buffer(range),
            children: BTreeMap::new(),
        }
    }

    pub fn image(image: ImageParameter) -> Self {
        Self {
            value: ParameterValue::Image(image),
            children: BTreeMap::new(),
        }
    }

    pub fn acceleration_structure(accel: vk::AccelerationStructureKHR) -> Self {
        Self {
            value: ParameterValue::AccelerationStructure(accel),
            children: BTreeMap::new(),
        }
    }

    /// Insert or replace a named child.
    pub fn set(&mut self, key: impl Into<String>, parameter: ShaderParameter) -> &mut Self {
        self.children.insert(key.into(), parameter);
        self
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, parameter: ShaderParameter) -> Self {
        self.children.insert(key.into(), parameter);
        self
    }

    /// Insert or replace an array element; numeric keys address elements of
    /// the binding the parent resolves to.
    pub fn set_element(&mut self, index: usize, parameter: ShaderParameter) -> &mut Self {
        self.children.insert(index.to_string(), parameter);
        self
    }

    /// Child accessor, creating an empty node on demand.
    pub fn entry(&mut self, key: impl Into<String>) -> &mut ShaderParameter {
        self.children.entry(key.into()).or_default()
    }

    pub fn get(&self, key: &str) -> Option<&ShaderParameter> {
        self.children.get(key)
    }

    pub fn children(&self) -> impl Iterator<Item = (&String, &ShaderParameter)> {
        self.children.iter()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A descriptor slot produced by reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Declared element count; `1` for non-arrays.
    pub array_size: u32,
    /// Whether the shader declares write access. Barrier generation does not
    /// trust this flag; see [`crate::bind`].
    pub writable: bool,
}

/// Where a reflected constant lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantTarget {
    /// Part of the pipeline's push constant block.
    PushConstant,
    /// Part of a uniform buffer descriptor at the given slot.
    Uniform { set: u32, binding: u32 },
}

/// A constant slot produced by reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBinding {
    /// Byte offset within the push block or uniform buffer.
    pub offset: u32,
    /// Declared size of the constant's type.
    pub type_size: u32,
    pub target: ConstantTarget,
}

/// What one binding tree node maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingKind {
    /// Structural node with no slot of its own.
    #[default]
    None,
    Descriptor(DescriptorBinding),
    Constant(ConstantBinding),
}

/// The reflected binding tree of a pipeline layout.
#[derive(Debug, Clone, Default)]
pub struct ShaderParameterBinding {
    pub kind: BindingKind,
    children: BTreeMap<String, ShaderParameterBinding>,
}

impl ShaderParameterBinding {
    pub fn new(kind: BindingKind) -> Self {
        Self {
            kind,
            children: BTreeMap::new(),
        }
    }

    pub fn descriptor(binding: DescriptorBinding) -> Self {
        Self::new(BindingKind::Descriptor(binding))
    }

    pub fn constant(binding: ConstantBinding) -> Self {
        Self::new(BindingKind::Constant(binding))
    }

    pub fn with(mut self, key: impl Into<String>, child: ShaderParameterBinding) -> Self {
        self.children.insert(key.into(), child);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ShaderParameterBinding> {
        self.children.get(key)
    }

    pub fn children(&self) -> impl Iterator<Item = (&String, &ShaderParameterBinding)> {
        self.children.iter()
    }
}

/// Everything the binding engine needs to know about a pipeline layout.
#[derive(Debug, Clone)]
pub struct PipelineLayoutInfo {
    pub layout: vk::PipelineLayout,
    /// One layout per descriptor set, in set order. Deduplicated upstream so
    /// `layout` is a sound identity for descriptor pooling.
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub bindings: ShaderParameterBinding,
    /// Shader stages, used for push constant updates.
    pub shader_stages: vk::ShaderStageFlags,
    /// Pipeline stages the bound resources are consumed in, used for
    /// barriers.
    pub pipeline_stages: vk::PipelineStageFlags2,
    pub bind_point: vk::PipelineBindPoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_from_pod() {
        let parameter = ShaderParameter::constant(&42u32);
        match &parameter.value {
            ParameterValue::Constant(data) => assert_eq!(data, &42u32.to_ne_bytes()),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_tree_construction() {
        let mut params = ShaderParameter::new();
        params.set("exposure", ShaderParameter::constant(&1.5f32));
        params
            .entry("lights")
            .set_element(0, ShaderParameter::constant(&[1.0f32, 0.0, 0.0]));

        assert!(params.get("exposure").is_some());
        assert!(params.get("lights").unwrap().get("0").is_some());
        assert!(params.get("missing").is_none());
    }

    #[test]
    fn test_empty_buffer_range() {
        assert!(BufferRange::new(vk::Buffer::null(), 0, 128).is_empty());
        use vk::Handle;
        assert!(BufferRange::new(vk::Buffer::from_raw(5), 0, 0).is_empty());
        assert!(!BufferRange::new(vk::Buffer::from_raw(5), 0, 128).is_empty());
    }

    #[test]
    fn test_binding_tree_lookup() {
        let bindings = ShaderParameterBinding::default().with(
            "scene",
            ShaderParameterBinding::descriptor(DescriptorBinding {
                set: 0,
                binding: 0,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                array_size: 1,
                writable: false,
            }),
        );

        assert!(matches!(
            bindings.get("scene").unwrap().kind,
            BindingKind::Descriptor(_)
        ));
        assert!(bindings.get("nope").is_none());
    }
}
