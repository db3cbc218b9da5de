//! Pipeline creation and background shader compilation.
//!
//! Compilation goes through the [`ShaderCompiler`] seam so the renderer can
//! be driven by any source-to-SPIR-V toolchain (or a stub in tests). Both
//! pipeline kinds are created against the device's persistent
//! [`vk::PipelineCache`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use ash::vk;
use parking_lot::Mutex;

use crate::device::RenderDevice;
use crate::error::RenderError;
use crate::shader::PipelineLayoutInfo;

/// A shader compilation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderRequest {
    /// Source path or inline source, compiler-defined.
    pub source: String,
    pub entry: String,
    /// Target profile, e.g. `cs_6_6`.
    pub profile: String,
    pub defines: BTreeMap<String, String>,
}

/// The result of compiling and reflecting one shader stage.
pub struct CompiledShader {
    pub module: vk::ShaderModule,
    pub layout: Arc<PipelineLayoutInfo>,
    /// Compute only; `[0, 0, 0]` for other stages.
    pub workgroup_size: [u32; 3],
}

/// Turns shader requests into modules plus reflected layout info.
///
/// Implementations own layout deduplication: requests reflecting to the
/// same descriptor interface must return the same `vk::PipelineLayout`.
pub trait ShaderCompiler: Send + Sync {
    fn compile(
        &self,
        device: &RenderDevice,
        request: &ShaderRequest,
    ) -> Result<CompiledShader, RenderError>;
}

/// A compute pipeline and the layout it binds with.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: Arc<PipelineLayoutInfo>,
    pub workgroup_size: [u32; 3],
}

impl ComputePipeline {
    /// Dispatch dimensions covering `total` invocations.
    pub fn group_count(&self, total: [u32; 3]) -> [u32; 3] {
        let mut counts = [0u32; 3];
        for i in 0..3 {
            counts[i] = total[i].div_ceil(self.workgroup_size[i].max(1));
        }
        counts
    }
}

/// Create a compute pipeline from a compiled shader, consuming its module.
pub fn create_compute_pipeline(
    device: &RenderDevice,
    shader: CompiledShader,
) -> Result<ComputePipeline, RenderError> {
    let entry = c"main";
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader.module)
        .name(entry);
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(shader.layout.layout);

    let result = unsafe {
        device.ash().create_compute_pipelines(
            device.pipeline_cache(),
            &[create_info],
            None,
        )
    };
    unsafe { device.ash().destroy_shader_module(shader.module, None) };
    let pipelines = result.map_err(|(_, err)| RenderError::Vulkan(err))?;

    Ok(ComputePipeline {
        pipeline: pipelines[0],
        layout: shader.layout,
        workgroup_size: shader.workgroup_size,
    })
}

/// Fixed state for a dynamic-rendering graphics pipeline.
///
/// Viewport and scissor are always dynamic; color and depth formats come
/// from the attachments the pipeline will render into.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: vk::Format,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
            depth_write: true,
            color_formats: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
        }
    }
}

/// A graphics pipeline and the layout it binds with.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: Arc<PipelineLayoutInfo>,
}

/// Create a graphics pipeline from compiled vertex and fragment shaders,
/// consuming their modules.
///
/// Both stages must have reflected to the same pipeline layout.
pub fn create_graphics_pipeline(
    device: &RenderDevice,
    vertex: CompiledShader,
    fragment: CompiledShader,
    desc: &GraphicsPipelineDesc,
) -> Result<GraphicsPipeline, RenderError> {
    if vertex.layout.layout != fragment.layout.layout {
        unsafe {
            device.ash().destroy_shader_module(vertex.module, None);
            device.ash().destroy_shader_module(fragment.module, None);
        }
        return Err(RenderError::PipelineCompile(
            "vertex and fragment stages reflect different layouts".into(),
        ));
    }

    let entry = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex.module)
            .name(entry),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment.module)
            .name(entry),
    ];

    // Geometry is pulled from storage buffers, so no vertex input state.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(desc.polygon_mode)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::GREATER_OR_EQUAL);
    let attachments: Vec<_> = desc
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect();
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&desc.color_formats)
        .depth_attachment_format(desc.depth_format);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(vertex.layout.layout)
        .push_next(&mut rendering_info);

    let result = unsafe {
        device.ash().create_graphics_pipelines(
            device.pipeline_cache(),
            &[create_info],
            None,
        )
    };
    unsafe {
        device.ash().destroy_shader_module(vertex.module, None);
        device.ash().destroy_shader_module(fragment.module, None);
    }
    let pipelines = result.map_err(|(_, err)| RenderError::Vulkan(err))?;

    Ok(GraphicsPipeline {
        pipeline: pipelines[0],
        layout: vertex.layout,
    })
}

/// A compilation job running on a background thread.
///
/// The render thread polls [`try_take`](Self::try_take) once per frame and
/// never blocks on the worker. Dropping the task detaches the worker; its
/// result is discarded when the shared slot's last owner goes away.
pub struct AsyncCompileTask<T: Send + 'static> {
    slot: Arc<Mutex<Option<Result<T, RenderError>>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> AsyncCompileTask<T> {
    /// Run `job` on a new thread.
    pub fn spawn<F>(job: F) -> Self
    where
        F: FnOnce() -> Result<T, RenderError> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let worker_slot = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            let result = job();
            *worker_slot.lock() = Some(result);
        });
        Self {
            slot,
            handle: Some(handle),
        }
    }

    /// Whether the worker has not produced a result yet.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_none()
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Take the result if the worker is done; `None` while it runs.
    ///
    /// A worker that panicked without storing a result reports a
    /// compilation error.
    pub fn try_take(&mut self) -> Option<Result<T, RenderError>> {
        if let Some(result) = self.slot.lock().take() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            return Some(result);
        }
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            return Some(Err(RenderError::PipelineCompile(
                "compile worker panicked".into(),
            )));
        }
        None
    }
}
