// renderer/depth.rs
//! Depth pre-pass.
//!
//! Surfaces with nothing special about them are drawn with one indirect
//! multi-draw per vertex/index residency bucket. Subviews, alpha-tested
//! materials and anything needing per-surface state go through the generic
//! path, one draw at a time.

use std::ptr;

use log::warn;

use crate::renderer::batches::{classify_depth_surfaces, DepthBuckets};
use crate::renderer::device::{
    BlendMode, DrawElementsIndirectCommand, DrawState, GeometryBinding, GpuDevice, IndexedDraw,
    PolygonOffset, Program, Residency, StencilState, TextureSource, VertexLayout,
};
use crate::renderer::error::RenderResult;
use crate::renderer::capabilities::Capabilities;
use crate::renderer::internal::buffers::{
    draw_base_instance, issue_multi_draw, MultiDrawBuffers, MAX_DRAW_INSTANCES,
};
use crate::renderer::surface::{
    Coverage, DrawSurface, OcclusionQuery, ScreenRect, SortClass, VertexCache, ViewDef,
    ViewEntity, DRAW_VERT_SIZE, INDEX_SIZE,
};
use crate::renderer::uniforms::{DepthFastDrawData, DepthGenericDrawData};
use crate::settings::RenderSettings;

/// Every depth draw is instanced twice, once per stereo eye.
const DEPTH_INSTANCES: u32 = MAX_DRAW_INSTANCES;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthPassStats {
    pub multi_draws: usize,
    pub multi_draw_commands: usize,
    pub generic_draws: usize,
    pub occlusion_skipped: usize,
    pub dropped: usize,
}

impl DepthPassStats {
    pub fn accumulate(&mut self, other: &DepthPassStats) {
        self.multi_draws += other.multi_draws;
        self.multi_draw_commands += other.multi_draw_commands;
        self.generic_draws += other.generic_draws;
        self.occlusion_skipped += other.occlusion_skipped;
        self.dropped += other.dropped;
    }
}

/// Everything the depth pass reads besides the surfaces themselves.
pub struct DepthPass<'f> {
    pub view: &'f ViewDef,
    pub settings: &'f RenderSettings,
    pub caps: &'f Capabilities,
    pub cache: &'f dyn VertexCache,
    pub occlusion: &'f dyn OcclusionQuery,
}

/// Depth test and stencil reference every depth draw starts from.
fn fill_state() -> DrawState {
    DrawState {
        depth_compare: wgpu::CompareFunction::Less,
        stencil: StencilState::test(wgpu::CompareFunction::Always, 1, 255),
        ..DrawState::default()
    }
}

fn first_index(surface: &DrawSurface<'_>, cache: &dyn VertexCache) -> u32 {
    surface
        .geometry
        .index_cache
        .map_or(0, |handle| (cache.offset(handle) / INDEX_SIZE) as u32)
}

fn base_vertex(surface: &DrawSurface<'_>, cache: &dyn VertexCache) -> u32 {
    surface
        .geometry
        .ambient_cache
        .map_or(0, |handle| (cache.offset(handle) / DRAW_VERT_SIZE) as u32)
}

impl<'f> DepthPass<'f> {
    fn culled(&self, surface: &DrawSurface<'_>) -> bool {
        self.settings.use_occlusion_culling
            && self
                .occlusion
                .was_culled_last_frame(surface.space.entity_index)
    }

    /// Lays down scene depth for `surfaces`. The stencil test always passes
    /// against reference 1 and leaves the stencil untouched.
    /// `current_scissor` is the scissor the device currently holds, relative
    /// to the view's viewport.
    pub fn fill_depth_buffer<D: GpuDevice>(
        &self,
        device: &mut D,
        buffers: &mut MultiDrawBuffers,
        surfaces: &[DrawSurface<'_>],
        current_scissor: &mut ScreenRect,
    ) -> RenderResult<DepthPassStats> {
        let mut stats = DepthPassStats::default();
        // Nothing to draw for views without entities (e.g. 2D menus).
        if !self.view.has_entities {
            return Ok(stats);
        }

        device.push_debug_group("FillDepthBuffer");
        let base = fill_state();
        device.set_state(&base);

        let buckets = classify_depth_surfaces(
            surfaces,
            self.cache,
            self.view.view_origin,
            self.settings.skip_portal_sky,
        );
        stats.dropped = buckets.dropped.len();

        let result = self.draw_buckets(
            device,
            buffers,
            surfaces,
            &buckets,
            &base,
            current_scissor,
            &mut stats,
        );

        for message in device.drain_errors() {
            warn!("Depth pass: {}", message);
        }
        device.use_program(None);
        device.pop_debug_group();

        result.map(|()| stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_buckets<D: GpuDevice>(
        &self,
        device: &mut D,
        buffers: &mut MultiDrawBuffers,
        surfaces: &[DrawSurface<'_>],
        buckets: &DepthBuckets,
        base: &DrawState,
        current_scissor: &mut ScreenRect,
        stats: &mut DepthPassStats,
    ) -> RenderResult<()> {
        // Subviews clip against the mirror plane, so they go first and
        // never through the fast path.
        if !buckets.sub_view.is_empty() {
            self.generic_depth(device, surfaces, &buckets.sub_view, base, current_scissor, stats);
        }

        device.use_program(Some(Program::DepthFastMultiDraw));
        device.set_view_projection(self.view.view_projection);
        device.set_state(base);
        for (vertex, index, bucket) in buckets.multi_draw_buckets() {
            for chunk in bucket.chunks(buffers.max_commands()) {
                self.multi_draw_depth(device, buffers, surfaces, chunk, vertex, index, stats)?;
            }
        }

        if !buckets.remaining.is_empty() {
            self.generic_depth(device, surfaces, &buckets.remaining, base, current_scissor, stats);
        }
        Ok(())
    }

    /// One indirect multi-draw over `indices`, all sharing the given
    /// residency.
    #[allow(clippy::too_many_arguments)]
    pub fn multi_draw_depth<D: GpuDevice>(
        &self,
        device: &mut D,
        buffers: &mut MultiDrawBuffers,
        surfaces: &[DrawSurface<'_>],
        indices: &[usize],
        vertex: Residency,
        index: Residency,
        stats: &mut DepthPassStats,
    ) -> RenderResult<()> {
        if indices.is_empty() {
            return Ok(());
        }
        buffers.reserve_commands(indices.len())?;

        let mut draw_data = Vec::with_capacity(indices.len());
        let mut commands = Vec::with_capacity(indices.len());
        for &i in indices {
            let surface = &surfaces[i];
            if self.culled(surface) {
                stats.occlusion_skipped += 1;
                continue;
            }
            commands.push(DrawElementsIndirectCommand {
                count: surface.geometry.num_indexes,
                instance_count: DEPTH_INSTANCES,
                first_index: first_index(surface, self.cache),
                base_vertex: base_vertex(surface, self.cache),
                base_instance: draw_base_instance(commands.len()),
            });
            draw_data.push(DepthFastDrawData::new(surface.space.model_matrix));
        }

        let Some(submission) = buffers.upload(device, &draw_data, &commands)? else {
            return Ok(());
        };

        device.push_debug_group("MultiDrawDepth");
        device.bind_geometry(GeometryBinding {
            vertex,
            index,
            layout: VertexLayout::Draw,
            draw_id: true,
        });
        device.bind_storage(0, submission.storage);
        device.memory_barrier();
        issue_multi_draw(device, &submission, &commands, self.caps.indirect_first_instance);
        device.pop_debug_group();

        stats.multi_draws += 1;
        stats.multi_draw_commands += submission.draw_count as usize;
        Ok(())
    }

    /// Draws `indices` one by one, handling scissors, clip planes, polygon
    /// offsets and alpha-tested stages.
    pub fn generic_depth<D: GpuDevice>(
        &self,
        device: &mut D,
        surfaces: &[DrawSurface<'_>],
        indices: &[usize],
        base: &DrawState,
        current_scissor: &mut ScreenRect,
        stats: &mut DepthPassStats,
    ) {
        let view = self.view;
        let settings = self.settings;

        device.push_debug_group("GenericDepth");
        device.use_program(Some(Program::DepthGeneric));
        device.set_view_projection(view.view_projection);

        let mut data = DepthGenericDrawData::new();
        let mut current_space: Option<&ViewEntity> = None;

        for &i in indices {
            let surface = &surfaces[i];
            if self.culled(surface) {
                stats.occlusion_skipped += 1;
                continue;
            }
            let material = surface.material;
            data.color = DepthGenericDrawData::BLACK;

            if settings.use_scissor && !current_scissor.same_area(&surface.scissor) {
                *current_scissor = surface.scissor;
                device.set_scissor(surface.scissor.offset_pixels(&view.viewport));
            }

            if current_space.map_or(true, |space| !ptr::eq(space, surface.space)) {
                if let Some(plane) = view.clip_plane {
                    data.set_clip_plane(surface.space.global_plane_to_local(plane));
                }
                data.model_matrix = surface.space.model_matrix.to_cols_array_2d();
                current_space = Some(surface.space);
            }

            let mut state = *base;
            if let Some(offset) = material.polygon_offset {
                state.polygon_offset = Some(PolygonOffset {
                    factor: settings.offset_factor,
                    units: settings.offset_units * offset,
                });
            }
            if material.sort == SortClass::Subview {
                // Subviews are drawn darkened so the mirrored scene shows
                // through at the right brightness.
                state.blend = BlendMode::ModulateDestination;
                let scale = 1.0 / view.overbright;
                data.color[..3].fill(scale);
            }
            device.set_state(&state);

            let geometry = surface.geometry;
            let vertex_static = geometry
                .ambient_cache
                .is_some_and(|handle| self.cache.is_static(handle));
            let index_static = geometry
                .index_cache
                .is_some_and(|handle| self.cache.is_static(handle));
            device.bind_geometry(GeometryBinding {
                vertex: Residency::from_static(vertex_static),
                index: Residency::from_static(index_static),
                layout: VertexLayout::Draw,
                draw_id: false,
            });
            let draw = IndexedDraw {
                index_count: geometry.num_indexes,
                first_index: first_index(surface, self.cache),
                base_vertex: base_vertex(surface, self.cache) as i32,
                instance_count: DEPTH_INSTANCES,
                first_instance: 0,
            };

            let mut draw_solid = material.coverage == Coverage::Opaque;

            if material.coverage == Coverage::Perforated {
                let mut did_draw = false;
                let mut stage_state = state;

                for stage in &material.stages {
                    let Some(threshold_register) = stage.alpha_test_register else {
                        continue;
                    };
                    if surface.register(stage.condition_register) == 0.0 {
                        continue;
                    }
                    // An attempted stage counts even when it ends up invisible.
                    did_draw = true;

                    data.color[3] = surface.register(stage.color_registers[3]);
                    if data.color[3] <= 0.0 {
                        continue;
                    }
                    data.alpha_test[0] = surface.register(threshold_register);
                    device.bind_texture(0, stage.image.map(TextureSource::Image));

                    let private_offset = stage.private_polygon_offset != 0.0;
                    if private_offset {
                        stage_state.polygon_offset = Some(PolygonOffset {
                            factor: settings.offset_factor,
                            units: settings.offset_units * stage.private_polygon_offset,
                        });
                        device.set_state(&stage_state);
                    }
                    if stage.texture_matrix.is_some() {
                        data.set_texture_matrix(stage.texture_matrix(surface.registers));
                    }

                    device.write_uniforms(bytemuck::bytes_of(&data));
                    device.draw_indexed(&draw);
                    stats.generic_draws += 1;

                    if private_offset && material.polygon_offset.is_none() {
                        stage_state.polygon_offset = None;
                        device.set_state(&stage_state);
                    }
                    if stage.texture_matrix.is_some() {
                        data.set_texture_matrix(glam::Mat4::IDENTITY);
                    }
                }

                if !did_draw {
                    draw_solid = true;
                }
            }

            if draw_solid {
                data.alpha_test[0] = -1.0;
                device.write_uniforms(bytemuck::bytes_of(&data));
                device.draw_indexed(&draw);
                stats.generic_draws += 1;
            }
        }

        device.set_state(base);
        device.pop_debug_group();
    }
}
