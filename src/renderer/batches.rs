// renderer/batches.rs
use glam::Vec3;

use crate::renderer::device::Residency;
use crate::renderer::surface::{Coverage, DrawSurface, SortClass, VertexCache};

/// Why a surface contributes nothing to the depth pre-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    NotDrawn,
    Translucent,
    NoIndexes,
    NoVertexCache,
    PortalSky,
    StagesDisabled,
}

/// Depth pre-pass routing of one surface list. Every bucket holds indices
/// into the classified slice, and every input index lands in exactly one
/// bucket or in `dropped`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DepthBuckets {
    /// Drawn first through the generic path (mirror plane clipping).
    pub sub_view: Vec<usize>,
    /// Front-to-back.
    pub static_vertex_static_index: Vec<usize>,
    pub static_vertex_frame_index: Vec<usize>,
    pub frame_vertex_frame_index: Vec<usize>,
    /// Needs per-surface state: alpha test, polygon offset or a depth hack.
    pub remaining: Vec<usize>,
    pub dropped: Vec<(usize, DropReason)>,
}

impl DepthBuckets {
    /// The three residency buckets in submission order with their
    /// (vertex, index) residency.
    pub fn multi_draw_buckets(&self) -> [(Residency, Residency, &[usize]); 3] {
        [
            (
                Residency::Static,
                Residency::Static,
                &self.static_vertex_static_index,
            ),
            (
                Residency::Static,
                Residency::Frame,
                &self.static_vertex_frame_index,
            ),
            (
                Residency::Frame,
                Residency::Frame,
                &self.frame_vertex_frame_index,
            ),
        ]
    }

    pub fn routed(&self) -> usize {
        self.sub_view.len()
            + self.static_vertex_static_index.len()
            + self.static_vertex_frame_index.len()
            + self.frame_vertex_frame_index.len()
            + self.remaining.len()
    }
}

fn drop_reason(surface: &DrawSurface<'_>, skip_portal_sky: bool) -> Option<DropReason> {
    let material = surface.material;
    let geometry = surface.geometry;

    if !material.drawn {
        return Some(DropReason::NotDrawn);
    }
    if material.coverage == Coverage::Translucent {
        return Some(DropReason::Translucent);
    }
    // Some deforms disable themselves by emitting no indices.
    if geometry.num_indexes == 0 {
        return Some(DropReason::NoIndexes);
    }
    if geometry.ambient_cache.is_none() {
        log::warn!("Depth pass: surface of {} has no vertex cache", material.name);
        return Some(DropReason::NoVertexCache);
    }
    if geometry.index_cache.is_none() {
        log::warn!("Depth pass: surface of {} has no index cache", material.name);
    }
    if skip_portal_sky && material.sort == SortClass::PortalSky {
        return Some(DropReason::PortalSky);
    }
    if material.all_stages_disabled(surface.registers) {
        return Some(DropReason::StagesDisabled);
    }
    None
}

fn needs_generic_path(surface: &DrawSurface<'_>) -> bool {
    surface.material.coverage == Coverage::Perforated
        || surface.material.polygon_offset.is_some()
        || surface.space.has_depth_hack()
}

pub fn classify_depth_surfaces(
    surfaces: &[DrawSurface<'_>],
    cache: &dyn VertexCache,
    view_origin: Vec3,
    skip_portal_sky: bool,
) -> DepthBuckets {
    let mut buckets = DepthBuckets::default();

    for (index, surface) in surfaces.iter().enumerate() {
        if let Some(reason) = drop_reason(surface, skip_portal_sky) {
            buckets.dropped.push((index, reason));
            continue;
        }

        if surface.material.sort == SortClass::Subview {
            buckets.sub_view.push(index);
            continue;
        }

        if needs_generic_path(surface) {
            buckets.remaining.push(index);
            continue;
        }

        let geometry = surface.geometry;
        let static_vertex = geometry
            .ambient_cache
            .is_some_and(|handle| cache.is_static(handle));
        let static_index = geometry
            .index_cache
            .is_some_and(|handle| cache.is_static(handle));

        match (static_vertex, static_index) {
            (false, _) => buckets.frame_vertex_frame_index.push(index),
            (true, true) => buckets.static_vertex_static_index.push(index),
            (true, false) => buckets.static_vertex_frame_index.push(index),
        }
    }

    // Front-to-back so later passes profit from early depth rejection.
    let distance = |index: usize| (surfaces[index].space.origin - view_origin).length_squared();
    buckets
        .static_vertex_static_index
        .sort_by(|&a, &b| distance(a).total_cmp(&distance(b)));

    buckets
}
