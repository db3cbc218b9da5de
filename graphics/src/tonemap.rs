//! HDR tonemapping pass.
//!
//! Two compute dispatches: a max-luminance reduction over the lit image into
//! a single-texel buffer, then the tonemap operator itself. The operator is
//! selected per dispatch through constants, so changing the mode never
//! recompiles anything.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use orogen_core::inspect::{Inspect, InspectorField, InspectorValue};

use crate::barrier::BufferState;
use crate::context::CommandContext;
use crate::device::RenderDevice;
use crate::error::RenderError;
use crate::pipeline::{
    create_compute_pipeline, AsyncCompileTask, ComputePipeline, ShaderCompiler, ShaderRequest,
};
use crate::shader::{BufferRange, ImageParameter, ShaderParameter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TonemapMode {
    /// Pass-through, exposure only.
    None,
    Reinhard,
    #[default]
    Aces,
}

impl TonemapMode {
    const OPTIONS: [&'static str; 3] = ["None", "Reinhard", "ACES"];

    fn index(self) -> usize {
        match self {
            TonemapMode::None => 0,
            TonemapMode::Reinhard => 1,
            TonemapMode::Aces => 2,
        }
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => TonemapMode::None,
            1 => TonemapMode::Reinhard,
            _ => TonemapMode::Aces,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TonemapSettings {
    pub mode: TonemapMode,
    pub exposure: f32,
    pub gamma_correct: bool,
}

impl Default for TonemapSettings {
    fn default() -> Self {
        Self {
            mode: TonemapMode::Aces,
            exposure: 1.0,
            gamma_correct: true,
        }
    }
}

impl Inspect for TonemapSettings {
    fn fields(&self) -> Vec<InspectorField> {
        vec![
            InspectorField::dropdown("Mode", self.mode.index(), &TonemapMode::OPTIONS),
            InspectorField::drag_float("Exposure", self.exposure, 0.0, 16.0, 0.05),
            InspectorField::checkbox("Gamma correct", self.gamma_correct),
        ]
    }

    fn apply(&mut self, field: &InspectorField) {
        match (field.label.as_str(), &field.value) {
            ("Mode", InspectorValue::Dropdown { selected, .. }) => {
                self.mode = TonemapMode::from_index(*selected);
            }
            ("Exposure", InspectorValue::DragFloat { value, .. }) => {
                self.exposure = *value;
            }
            ("Gamma correct", InspectorValue::Checkbox { value }) => {
                self.gamma_correct = *value;
            }
            _ => {}
        }
    }
}

#[derive(Clone, Copy, bytemuck::NoUninit)]
#[repr(C)]
struct TonemapConstants {
    exposure: f32,
    mode: u32,
    gamma_correct: u32,
}

/// Records the tonemap passes over a lit HDR image.
pub struct Tonemapper {
    device: Arc<RenderDevice>,
    compiler: Arc<dyn ShaderCompiler>,
    pub settings: TonemapSettings,
    reduce: Option<ComputePipeline>,
    apply: Option<ComputePipeline>,
    compile: Option<AsyncCompileTask<(ComputePipeline, ComputePipeline)>>,
}

impl Tonemapper {
    pub fn new(device: Arc<RenderDevice>, compiler: Arc<dyn ShaderCompiler>) -> Self {
        Self {
            device,
            compiler,
            settings: TonemapSettings::default(),
            reduce: None,
            apply: None,
            compile: None,
        }
    }

    fn request_compile(&mut self) {
        if self.compile.is_some() {
            return;
        }
        let device = Arc::clone(&self.device);
        let compiler = Arc::clone(&self.compiler);
        self.compile = Some(AsyncCompileTask::spawn(move || {
            let reduce = compiler.compile(
                &device,
                &ShaderRequest {
                    source: "shaders/tonemap.hlsl".into(),
                    entry: "reduce_max".into(),
                    profile: "cs_6_6".into(),
                    defines: Default::default(),
                },
            )?;
            let apply = compiler.compile(
                &device,
                &ShaderRequest {
                    source: "shaders/tonemap.hlsl".into(),
                    entry: "tonemap".into(),
                    profile: "cs_6_6".into(),
                    defines: Default::default(),
                },
            )?;
            Ok((
                create_compute_pipeline(&device, reduce)?,
                create_compute_pipeline(&device, apply)?,
            ))
        }));
    }

    fn poll_compile(&mut self) {
        let Some(task) = self.compile.as_mut() else {
            return;
        };
        let Some(result) = task.try_take() else {
            return;
        };
        self.compile = None;
        match result {
            Ok((reduce, apply)) => {
                self.reduce = Some(reduce);
                self.apply = Some(apply);
            }
            Err(err) => log::error!("tonemap: pipeline compile failed: {err}"),
        }
    }

    /// Record the reduction and tonemap dispatches over `image`.
    ///
    /// Skips the frame while pipelines are still compiling.
    pub fn render(
        &mut self,
        context: &mut CommandContext,
        image: &ImageParameter,
        extent: vk::Extent2D,
    ) -> Result<(), RenderError> {
        if self.reduce.is_none() && self.compile.is_none() {
            self.request_compile();
        }
        self.poll_compile();
        let (Some(reduce), Some(apply)) = (self.reduce.as_ref(), self.apply.as_ref()) else {
            return Ok(());
        };

        context.push_debug_label("tonemap");

        let max_luminance = context.transient_buffer(
            4,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "tonemap max luminance",
        )?;
        context.add_buffer_barrier(
            max_luminance.handle(),
            0,
            4,
            BufferState::new(
                vk::PipelineStageFlags2::CLEAR,
                vk::AccessFlags2::TRANSFER_WRITE,
            )
            .with_queue_family(context.queue_family()),
        );
        context.fill_buffer(max_luminance.handle(), 0, 4, 0);

        let luminance_range = BufferRange::new(max_luminance.handle(), 0, 4);
        let reduce_params = ShaderParameter::new()
            .with("source", ShaderParameter::image(*image))
            .with("max_luminance", ShaderParameter::buffer(luminance_range));
        context.bind_pipeline(vk::PipelineBindPoint::COMPUTE, reduce.pipeline);
        context.bind_parameters(&reduce.layout, &reduce_params)?;
        context.dispatch(reduce.group_count([extent.width, extent.height, 1]));

        let apply_params = ShaderParameter::new()
            .with("target", ShaderParameter::image(*image))
            .with("max_luminance", ShaderParameter::buffer(luminance_range))
            .with(
                "constants",
                ShaderParameter::constant(&TonemapConstants {
                    exposure: self.settings.exposure,
                    mode: self.settings.mode.index() as u32,
                    gamma_correct: u32::from(self.settings.gamma_correct),
                }),
            );
        context.bind_pipeline(vk::PipelineBindPoint::COMPUTE, apply.pipeline);
        context.bind_parameters(&apply.layout, &apply_params)?;
        context.dispatch(apply.group_count([extent.width, extent.height, 1]));

        context.pop_debug_label();
        Ok(())
    }
}

impl Drop for Tonemapper {
    fn drop(&mut self) {
        if let Some(mut task) = self.compile.take() {
            loop {
                match task.try_take() {
                    Some(Ok((reduce, apply))) => {
                        unsafe {
                            self.device.ash().destroy_pipeline(reduce.pipeline, None);
                            self.device.ash().destroy_pipeline(apply.pipeline, None);
                        }
                        break;
                    }
                    Some(Err(_)) => break,
                    None => std::thread::yield_now(),
                }
            }
        }
        for pipeline in [self.reduce.take(), self.apply.take()].into_iter().flatten() {
            unsafe { self.device.ash().destroy_pipeline(pipeline.pipeline, None) };
        }
    }
}
