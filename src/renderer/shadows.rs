// renderer/shadows.rs
//! Stencil shadow volumes drawn with one indirect multi-draw per pass.
//!
//! Casters are split into internal volumes (the viewer may be inside, so
//! caps are drawn and the depth-fail test is used) and external volumes
//! (depth-pass test, caps mostly skipped).

use log::warn;

use crate::renderer::capabilities::Capabilities;
use crate::renderer::device::{
    CullType, DrawElementsIndirectCommand, DrawState, GeometryBinding, GpuDevice, PolygonOffset,
    Program, Residency, StencilState, VertexLayout,
};
use crate::renderer::error::RenderResult;
use crate::renderer::internal::buffers::{draw_base_instance, issue_multi_draw, MultiDrawBuffers};
use crate::renderer::surface::{
    ShadowCapBits, ShadowSurface, SurfaceGeometry, VertexCache, ViewDef, ViewLight, INDEX_SIZE,
    SCREEN_VIEW_ID, SHADOW_VERT_SIZE,
};
use crate::renderer::uniforms::StencilDrawData;
use crate::settings::{ExternalShadows, RenderSettings};

/// Stencil value of a cleared buffer. Lit pixels stay at or above it.
pub const STENCIL_CLEAR: u32 = 128;

/// Which precomputed index range of a shadow volume is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowIndexVariant {
    /// Sides plus both caps.
    Full,
    NoCaps,
    NoFrontCaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowClass {
    pub variant: ShadowIndexVariant,
    pub external: bool,
}

impl ShadowClass {
    pub fn index_count(&self, geometry: &SurfaceGeometry) -> u32 {
        match self.variant {
            ShadowIndexVariant::Full => geometry.num_indexes,
            ShadowIndexVariant::NoCaps => geometry.num_shadow_indexes_no_caps,
            ShadowIndexVariant::NoFrontCaps => geometry.num_shadow_indexes_no_front_caps,
        }
    }
}

/// Picks the index variant and pass of one caster. Total over every input.
pub fn classify_shadow(
    mode: ExternalShadows,
    surface: &ShadowSurface<'_>,
    light: &ViewLight,
) -> ShadowClass {
    let internal = |variant| ShadowClass {
        variant,
        external: false,
    };
    let external = |variant| ShadowClass {
        variant,
        external: true,
    };
    let cap_bits = surface.geometry.shadow_cap_plane_bits;

    match mode {
        ExternalShadows::Off => internal(ShadowIndexVariant::Full),
        ExternalShadows::ForceNoCaps => internal(ShadowIndexVariant::NoCaps),
        ExternalShadows::Auto if !surface.view_inside_shadow => {
            // Outside the projection no cap can ever be seen.
            external(ShadowIndexVariant::NoCaps)
        }
        ExternalShadows::Auto
            if !light.view_inside_light && !cap_bits.contains(ShadowCapBits::INFINITE) =>
        {
            // A visible rear cap still has to be drawn.
            if light.view_sees_shadow_plane_bits.intersects(cap_bits) {
                external(ShadowIndexVariant::NoFrontCaps)
            } else {
                external(ShadowIndexVariant::NoCaps)
            }
        }
        ExternalShadows::Auto => internal(ShadowIndexVariant::Full),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowPassStats {
    pub internal_draws: usize,
    pub external_draws: usize,
    pub multi_draws: usize,
    /// Casters in static storage, which this path cannot address.
    pub skipped_static: usize,
    pub missing_cache: usize,
    /// Casters dropped because a pass exceeded `max_shadow_batch`.
    pub truncated: usize,
}

impl ShadowPassStats {
    pub fn accumulate(&mut self, other: &ShadowPassStats) {
        self.internal_draws += other.internal_draws;
        self.external_draws += other.external_draws;
        self.multi_draws += other.multi_draws;
        self.skipped_static += other.skipped_static;
        self.missing_cache += other.missing_cache;
        self.truncated += other.truncated;
    }
}

pub struct StencilShadowPass<'f> {
    pub view: &'f ViewDef,
    pub light: &'f ViewLight,
    pub settings: &'f RenderSettings,
    pub caps: &'f Capabilities,
    pub cache: &'f dyn VertexCache,
}

impl<'f> StencilShadowPass<'f> {
    /// Faces whose stencil is decremented on depth fail in the internal
    /// pass, and the opposite face. Mirrors flip the winding.
    fn faces(&self) -> (wgpu::Face, wgpu::Face) {
        if self.view.is_mirror {
            (wgpu::Face::Front, wgpu::Face::Back)
        } else {
            (wgpu::Face::Back, wgpu::Face::Front)
        }
    }

    fn volume_state(&self) -> DrawState {
        let settings = self.settings;
        let polygon_offset = (settings.shadow_polygon_factor != 0.0
            || settings.shadow_polygon_offset != 0.0)
            .then(|| PolygonOffset {
                factor: settings.shadow_polygon_factor,
                units: -settings.shadow_polygon_offset,
            });
        let depth_bounds = (self.caps.depth_bounds && settings.use_depth_bounds_test)
            .then(|| (self.light.scissor.zmin, self.light.scissor.zmax));

        DrawState {
            depth_compare: wgpu::CompareFunction::Less,
            depth_write: false,
            color_write: false,
            cull: CullType::TwoSided,
            polygon_offset,
            stencil: StencilState::test(wgpu::CompareFunction::Always, 1, 255),
            depth_bounds,
            ..DrawState::default()
        }
    }

    /// Stencil operations of the internal (`external == false`) or external
    /// pass.
    pub fn pass_stencil(&self, external: bool) -> StencilState {
        use wgpu::StencilOperation::Keep;

        let (first, second) = self.faces();
        let increment = self.caps.stencil_increment();
        let decrement = self.caps.stencil_decrement();
        let base = StencilState::test(wgpu::CompareFunction::Always, 1, 255);
        if external {
            base.with_face_ops(first, Keep, Keep, increment)
                .with_face_ops(second, Keep, Keep, decrement)
        } else {
            base.with_face_ops(first, Keep, decrement, Keep)
                .with_face_ops(second, Keep, increment, Keep)
        }
    }

    /// Stencil state left behind for the lighting passes.
    fn finished_stencil(&self) -> StencilState {
        if !self.settings.soft_shadows() || self.view.view_id < SCREEN_VIEW_ID {
            StencilState::test(wgpu::CompareFunction::GreaterEqual, STENCIL_CLEAR, 255)
        } else {
            StencilState::test(wgpu::CompareFunction::Always, 1, 255)
        }
    }

    /// Adds the shadow volumes of `surfaces` into the stencil buffer.
    pub fn stencil_shadow_pass<D: GpuDevice>(
        &self,
        device: &mut D,
        buffers: &mut MultiDrawBuffers,
        surfaces: &[ShadowSurface<'_>],
    ) -> RenderResult<ShadowPassStats> {
        let mut stats = ShadowPassStats::default();
        if surfaces.is_empty() {
            return Ok(stats);
        }

        device.push_debug_group("StencilShadowPassMultiDraw");
        device.use_program(Some(Program::StencilShadowMultiDraw));
        device.bind_texture(0, None);
        device.set_view_projection(self.view.view_projection);

        let mut state = self.volume_state();
        let mut result = Ok(());
        for external in [false, true] {
            state.stencil = self.pass_stencil(external);
            device.set_state(&state);
            result = self.multi_draw_stencil(device, buffers, surfaces, external, &mut stats);
            if result.is_err() {
                break;
            }
        }

        for message in device.drain_errors() {
            warn!("Stencil shadow pass: {}", message);
        }

        state.cull = CullType::FrontSided;
        state.polygon_offset = None;
        state.depth_bounds = None;
        state.stencil = self.finished_stencil();
        device.set_state(&state);
        device.use_program(None);
        device.pop_debug_group();

        result.map(|()| stats)
    }

    fn multi_draw_stencil<D: GpuDevice>(
        &self,
        device: &mut D,
        buffers: &mut MultiDrawBuffers,
        surfaces: &[ShadowSurface<'_>],
        external: bool,
        stats: &mut ShadowPassStats,
    ) -> RenderResult<()> {
        let capacity = self.settings.max_shadow_batch.min(buffers.max_commands());
        // Skips are tallied once, during the internal pass.
        let tally = !external;
        let light_origin = self.light.global_origin;

        let mut draw_data = Vec::new();
        let mut commands: Vec<DrawElementsIndirectCommand> = Vec::new();
        let mut truncated = 0;

        for surface in surfaces {
            let geometry = surface.geometry;
            let (Some(shadow_cache), Some(index_cache)) =
                (geometry.shadow_cache, geometry.index_cache)
            else {
                if tally {
                    warn!(
                        "Shadow pass: caster of entity {} has no shadow or index cache",
                        surface.space.entity_index
                    );
                    stats.missing_cache += 1;
                }
                continue;
            };
            if self.cache.is_static(shadow_cache) || self.cache.is_static(index_cache) {
                if tally {
                    stats.skipped_static += 1;
                }
                continue;
            }

            let class = classify_shadow(self.settings.external_shadows, surface, self.light);
            if class.external != external {
                continue;
            }
            if commands.len() == capacity {
                truncated += 1;
                continue;
            }

            draw_data.push(StencilDrawData::new(
                surface.space.model_matrix,
                surface.space.global_point_to_local(light_origin),
            ));
            commands.push(DrawElementsIndirectCommand {
                count: class.index_count(geometry),
                instance_count: 1,
                first_index: (self.cache.offset(index_cache) / INDEX_SIZE) as u32,
                base_vertex: (self.cache.offset(shadow_cache) / SHADOW_VERT_SIZE) as u32,
                base_instance: draw_base_instance(commands.len()),
            });
        }

        if truncated > 0 {
            warn!(
                "Shadow pass: {} {} casters over the batch limit of {} were dropped",
                truncated,
                if external { "external" } else { "internal" },
                capacity
            );
            stats.truncated += truncated;
        }

        let Some(submission) = buffers.upload(device, &draw_data, &commands)? else {
            return Ok(());
        };
        device.bind_geometry(GeometryBinding {
            vertex: Residency::Frame,
            index: Residency::Frame,
            layout: VertexLayout::Shadow,
            draw_id: true,
        });
        device.bind_storage(0, submission.storage);
        device.memory_barrier();
        issue_multi_draw(device, &submission, &commands, self.caps.indirect_first_instance);

        stats.multi_draws += 1;
        if external {
            stats.external_draws += commands.len();
        } else {
            stats.internal_draws += commands.len();
        }
        Ok(())
    }
}
