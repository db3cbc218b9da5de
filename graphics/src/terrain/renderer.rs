//! Terrain LoD controller and mesh lifecycle.
//!
//! [`LodController`] owns the octree, the per-leaf meshes and the retire
//! pool; all of its split/join/stitch decisions are plain data driven by
//! camera position and observed timeline values. [`TerrainRenderer`] wraps
//! it with the draw pipeline, async recompilation and command recording.
//!
//! The volume covers world space `[-1, 1]^3`; octree node extents map into
//! it from the normalized `[0, 1]` cell coordinates.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use glam::Vec3;

use orogen_core::inspect::{Inspect, InspectorField, InspectorValue};
use orogen_core::pool::RetirePool;

use crate::barrier::BufferState;
use crate::context::CommandContext;
use crate::device::{RenderDevice, TimelineValue};
use crate::error::RenderError;
use crate::pipeline::{
    create_graphics_pipeline, AsyncCompileTask, GraphicsPipeline, GraphicsPipelineDesc,
    ShaderCompiler, ShaderRequest,
};
use crate::shader::{BufferRange, ShaderParameter};
use crate::terrain::octree::{Octree, OctreeNodeId};
use crate::transient::TransientBuffer;

bitflags! {
    /// Dirty state of one leaf mesh. Bits are cleared only after the
    /// corresponding compute pass has been recorded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MeshFlags: u32 {
        /// Mesh content must be regenerated.
        const MESH_DIRTY = 1 << 0;
        /// A neighbor's resolution changed; seams must be restitched.
        const LOD_DIRTY = 1 << 1;
    }
}

/// GPU mesh of one octree leaf.
///
/// Buffers are `None` only in tests; on a device every field is populated by
/// [`Mesher::create_mesh`]. `index_count` and `avg_error` are read back from
/// `readback` once `cpu_args_ready` is reached.
#[derive(Default)]
pub struct ContourMesh {
    pub vertices: Option<Arc<TransientBuffer>>,
    /// Vertices after seam stitching; drawn instead of `vertices` when
    /// stitching is enabled.
    pub connected_vertices: Option<Arc<TransientBuffer>>,
    pub triangles: Option<Arc<TransientBuffer>>,
    pub draw_args: Option<Arc<TransientBuffer>>,
    pub dispatch_args: Option<Arc<TransientBuffer>>,
    /// Host-visible copy of index count and mean error.
    pub readback: Option<Arc<TransientBuffer>>,
    /// Timeline value after which `readback` holds valid statistics.
    pub cpu_args_ready: TimelineValue,
    pub index_count: u32,
    pub avg_error: f32,
    pub flags: MeshFlags,
}

impl ContourMesh {
    pub fn stats_ready(&self, completed: TimelineValue) -> bool {
        self.cpu_args_ready > TimelineValue::default() && completed >= self.cpu_args_ready
    }
}

impl Default for MeshFlags {
    fn default() -> Self {
        MeshFlags::empty()
    }
}

/// Mesh generation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainSettings {
    /// Voxel grid resolution per node, cells per axis.
    pub grid_size: u32,
    /// Vertex relaxation iterations in the mesher.
    pub mesh_iterations: u32,
    /// Relaxation step size.
    pub step_size: f32,
    pub max_depth: u32,
    /// Split when `avg_error >= error_threshold * distance(camera, node)`.
    pub error_threshold: f32,
    pub lod_stitching: bool,
    pub freeze_lod: bool,
    pub wireframe: bool,
    pub show_backfaces: bool,
    pub show_node_bounds: bool,
}

impl Default for TerrainSettings {
    fn default() -> Self {
        Self {
            grid_size: 32,
            mesh_iterations: 6,
            step_size: 0.22,
            max_depth: 5,
            error_threshold: 0.004,
            lod_stitching: true,
            freeze_lod: false,
            wireframe: false,
            show_backfaces: false,
            show_node_bounds: false,
        }
    }
}

/// Compute collaborator producing and stitching leaf meshes.
pub trait Mesher {
    /// Allocate the buffers of a fresh mesh.
    fn create_mesh(
        &self,
        context: &mut CommandContext,
        settings: &TerrainSettings,
    ) -> Result<ContourMesh, RenderError>;

    /// Record the generation dispatches for `node` into `mesh`.
    fn generate(
        &self,
        context: &mut CommandContext,
        mesh: &mut ContourMesh,
        node: OctreeNodeId,
        settings: &TerrainSettings,
    ) -> Result<(), RenderError>;

    /// Record the seam stitching dispatch for `node` against up to three
    /// coarser neighbor meshes, axis order x, y, z.
    fn stitch(
        &self,
        context: &mut CommandContext,
        mesh: &mut ContourMesh,
        node: OctreeNodeId,
        neighbors: [Option<&ContourMesh>; 3],
        settings: &TerrainSettings,
    ) -> Result<(), RenderError>;
}

/// World-space distance from the camera to a node's box.
fn node_distance(id: OctreeNodeId, camera: Vec3) -> f32 {
    let min = id.min_corner() * 2.0 - 1.0;
    let max = id.max_corner() * 2.0 - 1.0;
    camera.distance(camera.clamp(min, max))
}

/// Octree state and split/join policy, free of device handles.
pub struct LodController {
    pub settings: TerrainSettings,
    octree: Octree,
    meshes: HashMap<OctreeNodeId, ContourMesh>,
    mesh_pool: RetirePool<ContourMesh>,
    triangle_count: u64,
}

impl Default for LodController {
    fn default() -> Self {
        Self::new(TerrainSettings::default())
    }
}

impl LodController {
    pub fn new(settings: TerrainSettings) -> Self {
        Self {
            settings,
            octree: Octree::new(),
            meshes: HashMap::new(),
            mesh_pool: RetirePool::new(),
            triangle_count: 0,
        }
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn mesh(&self, id: OctreeNodeId) -> Option<&ContourMesh> {
        self.meshes.get(&id)
    }

    /// Triangles across all meshes with valid statistics, from the last
    /// [`refresh_stats`](Self::refresh_stats).
    pub fn triangle_count(&self) -> u64 {
        self.triangle_count
    }

    /// Pull index counts and error metrics out of readback buffers whose
    /// timeline value has been reached.
    pub fn refresh_stats(&mut self, completed: TimelineValue) {
        self.triangle_count = 0;
        for mesh in self.meshes.values_mut() {
            if mesh.stats_ready(completed) {
                if let Some(readback) = &mesh.readback {
                    let mut data = [0u8; 8];
                    match readback.read(0, &mut data) {
                        Ok(()) => {
                            mesh.index_count =
                                u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
                            mesh.avg_error =
                                f32::from_ne_bytes([data[4], data[5], data[6], data[7]]);
                        }
                        Err(err) => log::warn!("terrain: stats readback failed: {err}"),
                    }
                }
                self.triangle_count += u64::from(mesh.index_count) / 3;
            }
        }
    }

    fn wants_split(&self, id: OctreeNodeId, camera: Vec3, completed: TimelineValue) -> bool {
        if id.depth >= self.settings.max_depth {
            return false;
        }
        let Some(mesh) = self.meshes.get(&id) else {
            return false;
        };
        if mesh.flags.contains(MeshFlags::MESH_DIRTY) || !mesh.stats_ready(completed) {
            return false;
        }
        // Empty nodes have no surface to refine.
        if mesh.index_count == 0 {
            return false;
        }
        mesh.avg_error >= self.settings.error_threshold * node_distance(id, camera)
    }

    /// An internal node collapses once every child is a settled leaf that no
    /// longer wants to split, or the depth limit dropped below it.
    fn wants_join(
        &self,
        tree: &Octree,
        id: OctreeNodeId,
        camera: Vec3,
        completed: TimelineValue,
    ) -> bool {
        if id.depth >= self.settings.max_depth {
            return true;
        }
        for octant in 0..8 {
            let child = id.child(octant);
            if !tree.is_leaf(child) {
                return false;
            }
            let Some(mesh) = self.meshes.get(&child) else {
                return false;
            };
            if mesh.flags.contains(MeshFlags::MESH_DIRTY) || !mesh.stats_ready(completed) {
                return false;
            }
            if mesh.index_count != 0
                && mesh.avg_error
                    >= self.settings.error_threshold * node_distance(child, camera)
            {
                return false;
            }
        }
        true
    }

    /// Flag the leaf meshes bordering `id` along each axis as LoD-dirty.
    ///
    /// Touches only face-adjacent nodes: same-or-coarser neighbors directly,
    /// finer neighbors through the facing half of their subtree.
    fn mark_neighbors_lod_dirty(&mut self, tree: &Octree, id: OctreeNodeId) {
        if id.depth == 0 {
            return;
        }
        for axis in 0..3 {
            for neighbor in [Some(id.inner_neighbor(axis)), id.outer_neighbor(axis)] {
                let Some(neighbor) = neighbor else {
                    continue;
                };
                let decoded = tree.decode(neighbor);
                if decoded == neighbor && tree.is_internal(decoded) {
                    // Finer neighbor: only the half facing us shares the seam.
                    let facing = u32::from(neighbor.index[axis] < id.index[axis]);
                    tree.enumerate_masked(
                        decoded,
                        |octant| (octant >> axis) & 1 == facing,
                        |leaf| {
                            if let Some(mesh) = self.meshes.get_mut(&leaf) {
                                mesh.flags |= MeshFlags::LOD_DIRTY;
                            }
                        },
                    );
                } else if let Some(mesh) = self.meshes.get_mut(&decoded) {
                    mesh.flags |= MeshFlags::LOD_DIRTY;
                }
            }
        }
    }

    fn retire_mesh(&mut self, id: OctreeNodeId, retire: TimelineValue) {
        if let Some(mesh) = self.meshes.remove(&id) {
            self.mesh_pool.push(mesh, retire.0);
        }
    }

    fn retire_descendant_meshes(&mut self, id: OctreeNodeId, retire: TimelineValue) {
        let descendants: Vec<_> = self
            .meshes
            .keys()
            .copied()
            .filter(|key| key.depth > id.depth && key.at_depth(id.depth) == id)
            .collect();
        for key in descendants {
            self.retire_mesh(key, retire);
        }
    }

    /// Drop the whole refinement, retiring every mesh at `retire`.
    pub fn retire_all_meshes(&mut self, retire: TimelineValue) {
        let ids: Vec<_> = self.meshes.keys().copied().collect();
        for id in ids {
            self.retire_mesh(id, retire);
        }
        self.octree = Octree::new();
    }

    /// Run one round of split/join decisions.
    ///
    /// `completed` is the device's observed timeline value; `next_value` is
    /// the value the next submission will signal, used to tag retired meshes
    /// so in-flight GPU reads are never clobbered.
    pub fn update_lod(&mut self, camera: Vec3, completed: TimelineValue, next_value: TimelineValue) {
        if self.settings.freeze_lod {
            return;
        }
        let mut octree = std::mem::take(&mut self.octree);
        octree.enumerate(|tree, id| {
            if tree.is_leaf(id) {
                if self.wants_split(id, camera, completed) {
                    self.mark_neighbors_lod_dirty(tree, id);
                    self.retire_mesh(id, next_value);
                    tree.split(id);
                }
            } else if self.wants_join(tree, id, camera, completed) {
                self.retire_descendant_meshes(id, next_value);
                tree.join(id);
                self.mark_neighbors_lod_dirty(tree, id);
            }
        });
        self.octree = octree;
    }

    /// Coarser neighbor meshes usable for stitching `id`, axis order x, y, z.
    ///
    /// Each candidate is the decoded ancestor of the outer neighbor's parent;
    /// it is usable only while its mesh exists and is not itself dirty. A
    /// node resolving shallower than requested simply means the tree is
    /// coarser there.
    pub fn stitch_neighbors(&self, id: OctreeNodeId) -> [Option<OctreeNodeId>; 3] {
        let mut out = [None; 3];
        for (axis, slot) in out.iter_mut().enumerate() {
            *slot = id
                .outer_neighbor(axis)
                .and_then(|neighbor| neighbor.parent())
                .map(|parent| self.octree.decode(parent))
                .filter(|decoded| {
                    self.meshes
                        .get(decoded)
                        .is_some_and(|mesh| !mesh.flags.contains(MeshFlags::MESH_DIRTY))
                });
        }
        out
    }

    /// Record generation for mesh-less leaves and stitching for LoD-dirty
    /// ones. `next_value` tags fresh meshes' readback availability.
    pub fn record_meshes(
        &mut self,
        context: &mut CommandContext,
        mesher: &dyn Mesher,
        completed: TimelineValue,
        next_value: TimelineValue,
    ) -> Result<(), RenderError> {
        let leaves = self.octree.leaves();

        for &id in &leaves {
            if self.meshes.contains_key(&id) {
                continue;
            }
            let mut mesh = match self.mesh_pool.pop(completed.0) {
                Some(mesh) => mesh,
                None => mesher.create_mesh(context, &self.settings)?,
            };
            mesh.flags = MeshFlags::MESH_DIRTY | MeshFlags::LOD_DIRTY;
            mesh.index_count = 0;
            mesh.avg_error = 0.0;
            mesher.generate(context, &mut mesh, id, &self.settings)?;
            mesh.cpu_args_ready = next_value;
            mesh.flags.remove(MeshFlags::MESH_DIRTY);
            self.meshes.insert(id, mesh);
        }

        if !self.settings.lod_stitching {
            return Ok(());
        }
        for &id in &leaves {
            if !self
                .meshes
                .get(&id)
                .is_some_and(|mesh| mesh.flags.contains(MeshFlags::LOD_DIRTY))
            {
                continue;
            }
            let neighbor_ids = self.stitch_neighbors(id);
            let Some(mut mesh) = self.meshes.remove(&id) else {
                continue;
            };
            let neighbors = [
                neighbor_ids[0].and_then(|n| self.meshes.get(&n)),
                neighbor_ids[1].and_then(|n| self.meshes.get(&n)),
                neighbor_ids[2].and_then(|n| self.meshes.get(&n)),
            ];
            let result = mesher.stitch(context, &mut mesh, id, neighbors, &self.settings);
            if result.is_ok() {
                mesh.flags.remove(MeshFlags::LOD_DIRTY);
            }
            self.meshes.insert(id, mesh);
            result?;
        }
        Ok(())
    }
}

/// Per-draw node placement, consumed as push constants.
#[derive(Clone, Copy, bytemuck::NoUninit)]
#[repr(C)]
struct NodeConstants {
    origin: [f32; 3],
    scale: f32,
}

/// Full terrain renderer: LoD control plus draw pipeline management.
pub struct TerrainRenderer {
    device: Arc<RenderDevice>,
    compiler: Arc<dyn ShaderCompiler>,
    lod: LodController,
    color_format: vk::Format,
    depth_format: vk::Format,
    draw_pipeline: Option<GraphicsPipeline>,
    recompile: Option<AsyncCompileTask<GraphicsPipeline>>,
    /// Pipeline state (wireframe, culling, grid defines) no longer matches
    /// the current settings.
    pipeline_dirty: bool,
    /// The pending recompile changes mesh layout; all meshes must be rebuilt
    /// when it lands.
    meshes_dirty: bool,
}

impl TerrainRenderer {
    pub fn new(
        device: Arc<RenderDevice>,
        compiler: Arc<dyn ShaderCompiler>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Self {
        Self {
            device,
            compiler,
            lod: LodController::default(),
            color_format,
            depth_format,
            draw_pipeline: None,
            recompile: None,
            pipeline_dirty: true,
            meshes_dirty: false,
        }
    }

    pub fn lod(&self) -> &LodController {
        &self.lod
    }

    pub fn settings(&self) -> &TerrainSettings {
        &self.lod.settings
    }

    pub fn triangle_count(&self) -> u64 {
        self.lod.triangle_count()
    }

    /// Launch a background pipeline compile for the current settings.
    ///
    /// A request arriving while one is already in flight is dropped; the
    /// settings it would have captured are picked up by the next request.
    fn request_recompile(&mut self) {
        if self.recompile.is_some() {
            log::debug!("terrain: pipeline compile already in flight, request ignored");
            return;
        }
        self.pipeline_dirty = false;

        let device = Arc::clone(&self.device);
        let compiler = Arc::clone(&self.compiler);
        let settings = self.lod.settings;
        let desc = GraphicsPipelineDesc {
            polygon_mode: if settings.wireframe {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            },
            cull_mode: if settings.show_backfaces {
                vk::CullModeFlags::NONE
            } else {
                vk::CullModeFlags::BACK
            },
            color_formats: vec![self.color_format],
            depth_format: self.depth_format,
            ..Default::default()
        };

        let mut request = ShaderRequest {
            source: "shaders/terrain_draw.hlsl".into(),
            entry: "vs_main".into(),
            profile: "vs_6_6".into(),
            defines: Default::default(),
        };
        request
            .defines
            .insert("GRID_SIZE".into(), settings.grid_size.to_string());

        self.recompile = Some(AsyncCompileTask::spawn(move || {
            let vertex = compiler.compile(&device, &request)?;
            let fragment_request = ShaderRequest {
                entry: "ps_main".into(),
                profile: "ps_6_6".into(),
                ..request.clone()
            };
            let fragment = compiler.compile(&device, &fragment_request)?;
            create_graphics_pipeline(&device, vertex, fragment, &desc)
        }));
        log::info!("terrain: pipeline compile started");
    }

    /// Non-blocking check on the background compile.
    ///
    /// On success the new pipeline replaces the old one; when the compile
    /// also changed the mesh layout the device is drained and every mesh is
    /// rebuilt. On failure the previous pipeline keeps rendering.
    fn poll_recompile(&mut self) {
        let Some(task) = self.recompile.as_mut() else {
            return;
        };
        let Some(result) = task.try_take() else {
            return;
        };
        self.recompile = None;
        match result {
            Ok(pipeline) => {
                if self.meshes_dirty {
                    if let Err(err) = self.device.wait_idle() {
                        log::error!("terrain: wait before mesh rebuild failed: {err}");
                    }
                    let next = self.device.next_value();
                    self.lod.retire_all_meshes(next);
                    self.meshes_dirty = false;
                }
                if let Some(old) = self.draw_pipeline.take() {
                    unsafe { self.device.ash().destroy_pipeline(old.pipeline, None) };
                }
                self.draw_pipeline = Some(pipeline);
                log::info!("terrain: pipeline swapped in");
            }
            Err(err) => log::error!("terrain: pipeline compile failed: {err}"),
        }
    }

    /// Per-frame update: poll compiles, refresh statistics, run LoD
    /// decisions and record mesh generation/stitching.
    pub fn prepare(
        &mut self,
        context: &mut CommandContext,
        mesher: &dyn Mesher,
        camera: Vec3,
    ) -> Result<(), RenderError> {
        if self.pipeline_dirty {
            self.request_recompile();
        }
        self.poll_recompile();

        let completed = self.device.completed_value()?;
        let next_value = self.device.next_value();
        self.lod.refresh_stats(completed);
        self.lod.update_lod(camera, completed, next_value);

        context.push_debug_label("terrain meshes");
        let result = self.lod.record_meshes(context, mesher, completed, next_value);
        context.pop_debug_label();
        result
    }

    /// Record indirect draws for every settled leaf mesh.
    ///
    /// `globals` carries the scene-wide bindings (camera constants etc.);
    /// node placement and the vertex stream are added per mesh.
    pub fn render(
        &mut self,
        context: &mut CommandContext,
        globals: &ShaderParameter,
    ) -> Result<(), RenderError> {
        let Some(pipeline) = &self.draw_pipeline else {
            return Ok(());
        };
        context.push_debug_label("terrain draw");
        context.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);

        for id in self.lod.octree.leaves() {
            let Some(mesh) = self.lod.meshes.get(&id) else {
                continue;
            };
            if mesh.flags.contains(MeshFlags::MESH_DIRTY) {
                continue;
            }
            let vertices = if self.lod.settings.lod_stitching {
                mesh.connected_vertices.as_ref()
            } else {
                mesh.vertices.as_ref()
            };
            let (Some(vertices), Some(triangles), Some(draw_args)) =
                (vertices, mesh.triangles.as_ref(), mesh.draw_args.as_ref())
            else {
                continue;
            };

            let min = id.min_corner() * 2.0 - 1.0;
            let scale = 2.0 / (1u32 << id.depth) as f32;
            let mut params = globals.clone();
            params.set(
                "node",
                ShaderParameter::constant(&NodeConstants {
                    origin: min.to_array(),
                    scale,
                }),
            );
            params.set(
                "vertices",
                ShaderParameter::buffer(BufferRange::new(vertices.handle(), 0, vertices.size())),
            );
            context.bind_parameters(&pipeline.layout, &params)?;

            context.add_buffer_barrier(
                draw_args.handle(),
                0,
                draw_args.size(),
                BufferState::new(
                    vk::PipelineStageFlags2::DRAW_INDIRECT,
                    vk::AccessFlags2::INDIRECT_COMMAND_READ,
                )
                .with_queue_family(context.queue_family()),
            );
            context.execute_barriers();

            unsafe {
                let ash = context.device().ash();
                ash.cmd_bind_index_buffer(
                    context.command_buffer(),
                    triangles.handle(),
                    0,
                    vk::IndexType::UINT32,
                );
                ash.cmd_draw_indexed_indirect(
                    context.command_buffer(),
                    draw_args.handle(),
                    0,
                    1,
                    std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32,
                );
            }
        }

        context.pop_debug_label();
        Ok(())
    }
}

impl Drop for TerrainRenderer {
    fn drop(&mut self) {
        if let Some(mut task) = self.recompile.take() {
            // Let an in-flight compile finish so its pipeline gets destroyed.
            loop {
                match task.try_take() {
                    Some(Ok(pipeline)) => {
                        unsafe { self.device.ash().destroy_pipeline(pipeline.pipeline, None) };
                        break;
                    }
                    Some(Err(_)) => break,
                    None => std::thread::yield_now(),
                }
            }
        }
        if let Some(pipeline) = self.draw_pipeline.take() {
            unsafe { self.device.ash().destroy_pipeline(pipeline.pipeline, None) };
        }
    }
}

impl Inspect for TerrainRenderer {
    fn fields(&self) -> Vec<InspectorField> {
        let settings = &self.lod.settings;
        vec![
            InspectorField::drag_float("Grid size", settings.grid_size as f32, 8.0, 128.0, 1.0),
            InspectorField::drag_float(
                "Mesh iterations",
                settings.mesh_iterations as f32,
                0.0,
                32.0,
                1.0,
            ),
            InspectorField::drag_float("Step size", settings.step_size, 0.0, 1.0, 0.01),
            InspectorField::drag_float("Max depth", settings.max_depth as f32, 0.0, 10.0, 1.0),
            InspectorField::drag_float(
                "Error threshold",
                settings.error_threshold,
                0.0,
                0.1,
                0.0005,
            ),
            InspectorField::checkbox("LoD stitching", settings.lod_stitching),
            InspectorField::checkbox("Freeze LoD", settings.freeze_lod),
            InspectorField::checkbox("Wireframe", settings.wireframe),
            InspectorField::checkbox("Show backfaces", settings.show_backfaces),
            InspectorField::checkbox("Show node bounds", settings.show_node_bounds),
        ]
    }

    fn apply(&mut self, field: &InspectorField) {
        let settings = &mut self.lod.settings;
        match (field.label.as_str(), &field.value) {
            ("Grid size", InspectorValue::DragFloat { value, .. }) => {
                let grid_size = (*value as u32).max(8);
                if grid_size != settings.grid_size {
                    settings.grid_size = grid_size;
                    self.meshes_dirty = true;
                    self.pipeline_dirty = true;
                }
            }
            ("Mesh iterations", InspectorValue::DragFloat { value, .. }) => {
                let iterations = *value as u32;
                if iterations != settings.mesh_iterations {
                    settings.mesh_iterations = iterations;
                    self.meshes_dirty = true;
                    self.pipeline_dirty = true;
                }
            }
            ("Step size", InspectorValue::DragFloat { value, .. }) => {
                settings.step_size = *value;
            }
            ("Max depth", InspectorValue::DragFloat { value, .. }) => {
                settings.max_depth = *value as u32;
            }
            ("Error threshold", InspectorValue::DragFloat { value, .. }) => {
                settings.error_threshold = *value;
            }
            ("LoD stitching", InspectorValue::Checkbox { value }) => {
                settings.lod_stitching = *value;
            }
            ("Freeze LoD", InspectorValue::Checkbox { value }) => {
                settings.freeze_lod = *value;
            }
            ("Wireframe", InspectorValue::Checkbox { value }) => {
                if *value != settings.wireframe {
                    settings.wireframe = *value;
                    self.pipeline_dirty = true;
                }
            }
            ("Show backfaces", InspectorValue::Checkbox { value }) => {
                if *value != settings.show_backfaces {
                    settings.show_backfaces = *value;
                    self.pipeline_dirty = true;
                }
            }
            ("Show node bounds", InspectorValue::Checkbox { value }) => {
                settings.show_node_bounds = *value;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_mesh(index_count: u32, avg_error: f32, ready_at: u64) -> ContourMesh {
        ContourMesh {
            cpu_args_ready: TimelineValue(ready_at),
            index_count,
            avg_error,
            ..Default::default()
        }
    }

    /// Controller refined uniformly to `depth`, every leaf holding a mesh
    /// whose statistics become valid at `ready_at`.
    fn refined_controller(depth: u32, avg_error: f32, ready_at: u64) -> LodController {
        let mut lod = LodController::default();
        let mut octree = std::mem::take(&mut lod.octree);
        for _ in 0..depth {
            for id in octree.leaves() {
                octree.split(id);
            }
        }
        for id in octree.leaves() {
            lod.meshes.insert(id, ready_mesh(300, avg_error, ready_at));
        }
        lod.octree = octree;
        lod
    }

    #[test]
    fn test_split_at_depth_two() {
        // Background meshes stay unready so only the target transitions.
        let mut lod = refined_controller(2, 0.0, 100);
        lod.settings.max_depth = 5;
        lod.settings.error_threshold = 0.01;

        // One node far from the camera gets a large error.
        let target = OctreeNodeId {
            index: [0, 0, 0],
            depth: 2,
        };
        lod.meshes.insert(target, ready_mesh(300, 100.0, 1));

        let camera = Vec3::new(0.9, 0.9, 0.9);
        lod.update_lod(camera, TimelineValue(10), TimelineValue(11));

        assert!(lod.octree.is_internal(target));
        for octant in 0..8 {
            assert!(lod.octree.is_leaf(target.child(octant)));
        }

        // The split node's mesh was retired and is gated by the tag.
        assert!(lod.mesh(target).is_none());
        assert!(lod.mesh_pool.pop(10).is_none());
        assert!(lod.mesh_pool.pop(11).is_some());

        // Face neighbors along each axis got their seams invalidated.
        for axis in 0..3 {
            let neighbor = target.inner_neighbor(axis);
            let flags = lod.mesh(neighbor).unwrap().flags;
            assert!(flags.contains(MeshFlags::LOD_DIRTY), "axis {axis}");
        }
        // A diagonal neighbor shares no face and stays clean.
        let diagonal = OctreeNodeId {
            index: [1, 1, 0],
            depth: 2,
        };
        assert!(!lod
            .mesh(diagonal)
            .unwrap()
            .flags
            .contains(MeshFlags::LOD_DIRTY));
    }

    #[test]
    fn test_empty_mesh_never_splits() {
        let mut lod = refined_controller(1, 0.0, 1);
        let target = OctreeNodeId {
            index: [0, 0, 0],
            depth: 1,
        };
        lod.meshes.insert(target, ready_mesh(0, 100.0, 1));

        lod.update_lod(Vec3::ZERO, TimelineValue(10), TimelineValue(11));
        assert!(lod.octree.is_leaf(target));
    }

    #[test]
    fn test_unready_stats_block_split() {
        let mut lod = refined_controller(1, 0.0, 1);
        let target = OctreeNodeId {
            index: [0, 0, 0],
            depth: 1,
        };
        // Stats land at value 20, the device has only reached 10.
        lod.meshes.insert(target, ready_mesh(300, 100.0, 20));

        lod.update_lod(Vec3::ZERO, TimelineValue(10), TimelineValue(11));
        assert!(lod.octree.is_leaf(target));
    }

    #[test]
    fn test_max_depth_caps_split() {
        let mut lod = refined_controller(2, 100.0, 1);
        lod.settings.max_depth = 2;
        lod.update_lod(Vec3::ZERO, TimelineValue(10), TimelineValue(11));
        assert!(lod.octree.leaves().iter().all(|id| id.depth == 2));
    }

    #[test]
    fn test_join_retires_descendant_meshes() {
        let mut lod = refined_controller(1, 0.0, 1);
        lod.settings.error_threshold = 1000.0;

        // Camera far away: every child error falls below threshold.
        let camera = Vec3::new(10.0, 10.0, 10.0);
        lod.update_lod(camera, TimelineValue(10), TimelineValue(11));

        assert!(lod.octree.is_leaf(OctreeNodeId::ROOT));
        assert!(lod.meshes.is_empty());
        // Retired meshes stay gated until the tag value is reached.
        assert!(lod.mesh_pool.pop(10).is_none());
        assert!(lod.mesh_pool.pop(11).is_some());
    }

    #[test]
    fn test_freeze_lod_blocks_transitions() {
        let mut lod = refined_controller(1, 100.0, 1);
        lod.settings.freeze_lod = true;
        let before = lod.octree.len();

        lod.update_lod(Vec3::ZERO, TimelineValue(10), TimelineValue(11));
        assert_eq!(lod.octree.len(), before);
    }

    #[test]
    fn test_octree_invariant_after_updates() {
        let mut lod = refined_controller(1, 100.0, 1);
        lod.settings.max_depth = 3;
        for frame in 0..8u64 {
            lod.update_lod(
                Vec3::new(0.1, 0.2, 0.3),
                TimelineValue(10 + frame),
                TimelineValue(11 + frame),
            );
            // Fresh leaves get settled meshes so refinement keeps going.
            for id in lod.octree.leaves() {
                lod.meshes
                    .entry(id)
                    .or_insert_with(|| ready_mesh(300, 100.0, 1));
            }
        }
        let mut ids = Vec::new();
        let mut octree = std::mem::take(&mut lod.octree);
        octree.enumerate(|_, id| ids.push(id));
        for id in &ids {
            if octree.is_internal(*id) {
                for octant in 0..8 {
                    assert!(octree.contains(id.child(octant)));
                }
            }
        }
        lod.octree = octree;
        // At most one mesh per node, and only for nodes that exist.
        for id in lod.meshes.keys() {
            assert!(ids.contains(id));
        }
    }

    #[test]
    fn test_stitch_neighbors_prefer_coarser() {
        let mut lod = LodController::default();
        let mut octree = std::mem::take(&mut lod.octree);
        octree.split(OctreeNodeId::ROOT);
        let fine_parent = OctreeNodeId::ROOT.child(1);
        octree.split(fine_parent);
        lod.octree = octree;

        // A fine leaf against the boundary shared with coarse child 0.
        let fine = fine_parent.child(0);
        lod.meshes
            .insert(OctreeNodeId::ROOT.child(0), ready_mesh(300, 0.0, 1));

        let neighbors = lod.stitch_neighbors(fine);
        assert_eq!(neighbors[0], Some(OctreeNodeId::ROOT.child(0)));
        // No coarser mesh exists along y or z.
        assert_eq!(neighbors[1], None);
        assert_eq!(neighbors[2], None);
    }

    #[test]
    fn test_stitch_neighbor_unusable_while_mesh_dirty() {
        let mut lod = LodController::default();
        let mut octree = std::mem::take(&mut lod.octree);
        octree.split(OctreeNodeId::ROOT);
        let fine_parent = OctreeNodeId::ROOT.child(1);
        octree.split(fine_parent);
        lod.octree = octree;

        let mut dirty = ready_mesh(300, 0.0, 1);
        dirty.flags |= MeshFlags::MESH_DIRTY;
        lod.meshes.insert(OctreeNodeId::ROOT.child(0), dirty);

        let neighbors = lod.stitch_neighbors(fine_parent.child(0));
        assert_eq!(neighbors[0], None);
    }

    #[test]
    fn test_retire_all_meshes_resets_tree() {
        let mut lod = refined_controller(2, 0.0, 1);
        let mesh_count = lod.meshes.len();
        lod.retire_all_meshes(TimelineValue(7));

        assert!(lod.octree.is_leaf(OctreeNodeId::ROOT));
        assert!(lod.meshes.is_empty());
        assert_eq!(lod.mesh_pool.len(), mesh_count);
        assert!(lod.mesh_pool.pop(6).is_none());
        assert!(lod.mesh_pool.pop(7).is_some());
    }

    #[test]
    fn test_refresh_stats_counts_ready_triangles() {
        let mut lod = LodController::default();
        lod.meshes.insert(
            OctreeNodeId::ROOT,
            ready_mesh(300, 0.0, 5),
        );
        lod.meshes.insert(
            OctreeNodeId {
                index: [1, 0, 0],
                depth: 1,
            },
            ready_mesh(600, 0.0, 50),
        );

        lod.refresh_stats(TimelineValue(10));
        // Only the mesh whose readback value was reached is counted.
        assert_eq!(lod.triangle_count(), 100);
    }
}
