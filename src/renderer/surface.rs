// renderer/surface.rs
//! Per-frame scene data handed to the backend by the front end.
//!
//! Everything here is read-only to the passes. Surfaces borrow their entity,
//! material and geometry so a frame's surface list is a cheap slice of
//! references into the front end's own storage.

use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4};

use crate::renderer::device::{ImageId, PixelRect};

/// Bytes per index in the index cache.
pub const INDEX_SIZE: u64 = 4;
/// Bytes per full draw vertex in the vertex cache.
pub const DRAW_VERT_SIZE: u64 = 60;
/// Bytes per homogeneous shadow vertex.
pub const SHADOW_VERT_SIZE: u64 = 16;

/// Views with an id below this are subview or offscreen renders.
pub const SCREEN_VIEW_ID: i32 = 0;

bitflags! {
    /// Which shadow-volume cap planes a caster touches, plus whether its
    /// volume extends to infinity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShadowCapBits: u32 {
        const PLANE_0 = 1 << 0;
        const PLANE_1 = 1 << 1;
        const PLANE_2 = 1 << 2;
        const PLANE_3 = 1 << 3;
        const PLANE_4 = 1 << 4;
        const PLANE_5 = 1 << 5;
        const INFINITE = 1 << 6;
    }
}

/// Inclusive screen rectangle with the depth range covered by its contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub zmin: f32,
    pub zmax: f32,
}

impl ScreenRect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            zmin: 0.0,
            zmax: 1.0,
        }
    }

    /// Rectangle covering a `width` × `height` screen.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32 - 1, height as i32 - 1)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1 + 1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1 + 1
    }

    /// Compares the covered area only, ignoring the depth range.
    pub fn same_area(&self, other: &ScreenRect) -> bool {
        self.x1 == other.x1 && self.y1 == other.y1 && self.x2 == other.x2 && self.y2 == other.y2
    }

    pub fn to_pixels(&self) -> PixelRect {
        PixelRect::new(self.x1, self.y1, self.width(), self.height())
    }

    /// `self` interpreted relative to `origin`, as scissor rectangles are
    /// stored relative to the view's viewport.
    pub fn offset_pixels(&self, origin: &ScreenRect) -> PixelRect {
        PixelRect::new(
            origin.x1 + self.x1,
            origin.y1 + self.y1,
            self.width(),
            self.height(),
        )
    }
}

/// Packed vertex-cache handle.
///
/// Bit 0 tags static storage, bits 1..24 hold the size, bits 24..49 the byte
/// offset and bits 49..64 the frame number of per-frame allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle(pub u64);

impl CacheHandle {
    const STATIC: u64 = 1;
    const SIZE_SHIFT: u64 = 1;
    const SIZE_MASK: u64 = 0x7F_FFFF;
    const OFFSET_SHIFT: u64 = 24;
    const OFFSET_MASK: u64 = 0x1FF_FFFF;
    const FRAME_SHIFT: u64 = 49;
    const FRAME_MASK: u64 = 0x7FFF;

    pub fn pack(is_static: bool, size: u64, offset: u64, frame: u64) -> Self {
        let mut bits = ((size & Self::SIZE_MASK) << Self::SIZE_SHIFT)
            | ((offset & Self::OFFSET_MASK) << Self::OFFSET_SHIFT)
            | ((frame & Self::FRAME_MASK) << Self::FRAME_SHIFT);
        if is_static {
            bits |= Self::STATIC;
        }
        Self(bits)
    }

    pub fn is_static(self) -> bool {
        self.0 & Self::STATIC != 0
    }

    pub fn size(self) -> u64 {
        (self.0 >> Self::SIZE_SHIFT) & Self::SIZE_MASK
    }

    pub fn offset(self) -> u64 {
        (self.0 >> Self::OFFSET_SHIFT) & Self::OFFSET_MASK
    }

    pub fn frame(self) -> u64 {
        (self.0 >> Self::FRAME_SHIFT) & Self::FRAME_MASK
    }
}

/// Queries answered by the external vertex cache.
pub trait VertexCache {
    fn is_static(&self, handle: CacheHandle) -> bool;
    /// Byte offset of the allocation inside its static or frame buffer.
    fn offset(&self, handle: CacheHandle) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PackedVertexCache;

impl VertexCache for PackedVertexCache {
    fn is_static(&self, handle: CacheHandle) -> bool {
        handle.is_static()
    }

    fn offset(&self, handle: CacheHandle) -> u64 {
        handle.offset()
    }
}

pub trait OcclusionQuery {
    fn was_culled_last_frame(&self, entity_index: usize) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOcclusion;

impl OcclusionQuery for NoOcclusion {
    fn was_culled_last_frame(&self, _entity_index: usize) -> bool {
        false
    }
}

impl<F> OcclusionQuery for F
where
    F: Fn(usize) -> bool,
{
    fn was_culled_last_frame(&self, entity_index: usize) -> bool {
        self(entity_index)
    }
}

/// Transform context shared by the surfaces of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntity {
    pub entity_index: usize,
    pub model_matrix: Mat4,
    pub origin: Vec3,
    pub weapon_depth_hack: bool,
    pub model_depth_hack: f32,
}

impl ViewEntity {
    pub fn new(entity_index: usize, model_matrix: Mat4) -> Self {
        Self {
            entity_index,
            origin: model_matrix.w_axis.truncate(),
            model_matrix,
            weapon_depth_hack: false,
            model_depth_hack: 0.0,
        }
    }

    pub fn has_depth_hack(&self) -> bool {
        self.weapon_depth_hack || self.model_depth_hack != 0.0
    }

    pub fn global_point_to_local(&self, point: Vec3) -> Vec3 {
        self.model_matrix.inverse().transform_point3(point)
    }

    /// Planes are `(normal, d)` with `normal · p + d = 0`.
    pub fn global_plane_to_local(&self, plane: Vec4) -> Vec4 {
        self.model_matrix.transpose() * plane
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coverage {
    Opaque,
    Perforated,
    Translucent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortClass {
    Subview,
    PortalSky,
    Opaque,
    Other(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderStage {
    pub condition_register: usize,
    /// Register holding the alpha-test threshold. `None` for stages without
    /// alpha testing.
    pub alpha_test_register: Option<usize>,
    pub color_registers: [usize; 4],
    pub image: Option<ImageId>,
    /// Register indices of the 2×3 texture matrix.
    pub texture_matrix: Option<[[usize; 3]; 2]>,
    pub private_polygon_offset: f32,
}

impl ShaderStage {
    pub fn new(condition_register: usize) -> Self {
        Self {
            condition_register,
            alpha_test_register: None,
            color_registers: [0; 4],
            image: None,
            texture_matrix: None,
            private_polygon_offset: 0.0,
        }
    }

    pub fn alpha_tested(mut self, alpha_register: usize, threshold_register: usize) -> Self {
        self.color_registers[3] = alpha_register;
        self.alpha_test_register = Some(threshold_register);
        self
    }

    pub fn with_image(mut self, image: ImageId) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_texture_matrix(mut self, registers: [[usize; 3]; 2]) -> Self {
        self.texture_matrix = Some(registers);
        self
    }

    /// Builds the texture matrix from the evaluated registers. Large
    /// translations are wrapped back towards zero to keep texture
    /// coordinates precise.
    pub fn texture_matrix(&self, registers: &[f32]) -> Mat4 {
        let Some(rows) = self.texture_matrix else {
            return Mat4::IDENTITY;
        };
        let reg = |index: usize| registers.get(index).copied().unwrap_or(0.0);
        let wrap = |value: f32| {
            if !(-40.0..=40.0).contains(&value) {
                value - value.trunc()
            } else {
                value
            }
        };

        Mat4::from_cols(
            Vec4::new(reg(rows[0][0]), reg(rows[1][0]), 0.0, 0.0),
            Vec4::new(reg(rows[0][1]), reg(rows[1][1]), 0.0, 0.0),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            Vec4::new(wrap(reg(rows[0][2])), wrap(reg(rows[1][2])), 0.0, 1.0),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub drawn: bool,
    pub coverage: Coverage,
    pub sort: SortClass,
    /// Material-wide polygon offset, scaled by the configured offset units.
    pub polygon_offset: Option<f32>,
    pub stages: Vec<ShaderStage>,
}

impl Material {
    /// Drawn opaque material with one always-enabled stage reading
    /// register 0.
    pub fn opaque(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            drawn: true,
            coverage: Coverage::Opaque,
            sort: SortClass::Opaque,
            polygon_offset: None,
            stages: vec![ShaderStage::new(0)],
        }
    }

    pub fn with_coverage(mut self, coverage: Coverage) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn with_sort(mut self, sort: SortClass) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_polygon_offset(mut self, offset: f32) -> Self {
        self.polygon_offset = Some(offset);
        self
    }

    pub fn with_stages(mut self, stages: Vec<ShaderStage>) -> Self {
        self.stages = stages;
        self
    }

    /// True when no stage's condition register is non-zero this frame.
    pub fn all_stages_disabled(&self, registers: &[f32]) -> bool {
        self.stages.iter().all(|stage| {
            registers
                .get(stage.condition_register)
                .copied()
                .unwrap_or(0.0)
                == 0.0
        })
    }
}

/// Cache handles and index counts of one surface's triangles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceGeometry {
    pub num_indexes: u32,
    pub ambient_cache: Option<CacheHandle>,
    pub index_cache: Option<CacheHandle>,
    pub shadow_cache: Option<CacheHandle>,
    pub num_shadow_indexes_no_caps: u32,
    pub num_shadow_indexes_no_front_caps: u32,
    pub shadow_cap_plane_bits: ShadowCapBits,
}

#[derive(Debug, Clone, Copy)]
pub struct DrawSurface<'a> {
    pub space: &'a ViewEntity,
    pub material: &'a Material,
    pub geometry: &'a SurfaceGeometry,
    pub registers: &'a [f32],
    pub scissor: ScreenRect,
}

impl<'a> DrawSurface<'a> {
    /// Reads an evaluated register. Out-of-range indices read as zero.
    pub fn register(&self, index: usize) -> f32 {
        self.registers.get(index).copied().unwrap_or(0.0)
    }
}

/// A shadow caster on one light.
#[derive(Debug, Clone, Copy)]
pub struct ShadowSurface<'a> {
    pub space: &'a ViewEntity,
    pub geometry: &'a SurfaceGeometry,
    pub view_inside_shadow: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewDef {
    pub view_origin: Vec3,
    /// World to clip transform, one per stereo eye.
    pub view_projection: [Mat4; 2],
    pub viewport: ScreenRect,
    pub clip_plane: Option<Vec4>,
    pub is_mirror: bool,
    pub overbright: f32,
    pub has_entities: bool,
    pub view_id: i32,
}

impl ViewDef {
    pub fn new(width: u32, height: u32, view_projection: Mat4) -> Self {
        Self {
            view_origin: Vec3::ZERO,
            view_projection: [view_projection; 2],
            viewport: ScreenRect::full(width, height),
            clip_plane: None,
            is_mirror: false,
            overbright: 1.0,
            has_entities: true,
            view_id: SCREEN_VIEW_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewLight {
    pub global_origin: Vec3,
    pub scissor: ScreenRect,
    pub view_inside_light: bool,
    pub view_sees_shadow_plane_bits: ShadowCapBits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_handle_round_trips_fields() {
        let handle = CacheHandle::pack(true, 4096, 0x12_3450, 77);
        assert!(handle.is_static());
        assert_eq!(handle.size(), 4096);
        assert_eq!(handle.offset(), 0x12_3450);
        assert_eq!(handle.frame(), 77);

        let frame = CacheHandle::pack(false, 16, 600, 3);
        assert!(!PackedVertexCache.is_static(frame));
        assert_eq!(PackedVertexCache.offset(frame), 600);
    }

    #[test]
    fn point_and_plane_transform_into_entity_space() {
        let entity = ViewEntity::new(3, Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        let local = entity.global_point_to_local(Vec3::new(12.0, 1.0, 0.0));
        assert!((local - Vec3::new(2.0, 1.0, 0.0)).length() < 1e-5);

        // x = 11 in world space is x = 1 locally.
        let plane = entity.global_plane_to_local(Vec4::new(1.0, 0.0, 0.0, -11.0));
        assert!((plane - Vec4::new(1.0, 0.0, 0.0, -1.0)).length() < 1e-5);
    }

    #[test]
    fn texture_matrix_wraps_large_translations() {
        let stage = ShaderStage::new(0).with_texture_matrix([[1, 2, 3], [4, 5, 6]]);
        let registers = [1.0, 2.0, 0.0, 41.25, 0.0, 0.5, -3.0];
        let matrix = stage.texture_matrix(&registers);

        assert_eq!(matrix.x_axis, Vec4::new(2.0, 0.0, 0.0, 0.0));
        assert_eq!(matrix.y_axis, Vec4::new(0.0, 0.5, 0.0, 0.0));
        assert!((matrix.w_axis.x - 0.25).abs() < 1e-6);
        assert_eq!(matrix.w_axis.y, -3.0);
        assert_eq!(ShaderStage::new(0).texture_matrix(&registers), Mat4::IDENTITY);
    }

    #[test]
    fn stageless_material_counts_as_disabled() {
        let material = Material::opaque("empty").with_stages(Vec::new());
        assert!(material.all_stages_disabled(&[1.0]));
        assert!(!Material::opaque("lit").all_stages_disabled(&[1.0]));
        assert!(Material::opaque("off").all_stages_disabled(&[0.0]));
    }

    #[test]
    fn scissor_offsets_relative_to_viewport() {
        let viewport = ScreenRect::new(100, 50, 1099, 649);
        let scissor = ScreenRect::new(10, 20, 109, 219);
        assert_eq!(
            scissor.offset_pixels(&viewport),
            PixelRect::new(110, 70, 100, 200)
        );
        assert!(scissor.same_area(&ScreenRect {
            zmin: 0.3,
            ..scissor
        }));
    }
}
