// renderer/uniforms.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Per-draw record of the fast depth multi-draw, indexed by draw id.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Debug)]
pub struct DepthFastDrawData {
    pub model_matrix: [[f32; 4]; 4],
}

impl DepthFastDrawData {
    pub fn new(model_matrix: Mat4) -> Self {
        Self {
            model_matrix: model_matrix.to_cols_array_2d(),
        }
    }
}

/// Uniform block of the generic depth program, rewritten before every draw.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Debug)]
pub struct DepthGenericDrawData {
    pub model_matrix: [[f32; 4]; 4],
    pub texture_matrix: [[f32; 4]; 4],
    pub clip_plane: [f32; 4],
    pub color: [f32; 4],
    /// Only `x` is read. Negative disables the alpha test.
    pub alpha_test: [f32; 4],
}

impl DepthGenericDrawData {
    /// Clip plane that keeps everything.
    pub const NO_CLIP: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
    pub const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

    pub fn new() -> Self {
        Self {
            model_matrix: Mat4::IDENTITY.to_cols_array_2d(),
            texture_matrix: Mat4::IDENTITY.to_cols_array_2d(),
            clip_plane: Self::NO_CLIP,
            color: Self::BLACK,
            alpha_test: [0.0; 4],
        }
    }

    pub fn set_texture_matrix(&mut self, matrix: Mat4) {
        self.texture_matrix = matrix.to_cols_array_2d();
    }

    pub fn set_clip_plane(&mut self, plane: Vec4) {
        self.clip_plane = plane.to_array();
    }
}

impl Default for DepthGenericDrawData {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-draw record of the shadow-volume multi-draw.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Debug)]
pub struct StencilDrawData {
    pub model_matrix: [[f32; 4]; 4],
    /// Light origin in object space, `w = 0`.
    pub light_origin: [f32; 4],
}

impl StencilDrawData {
    pub fn new(model_matrix: Mat4, local_light_origin: Vec3) -> Self {
        Self {
            model_matrix: model_matrix.to_cols_array_2d(),
            light_origin: local_light_origin.extend(0.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_fast_draw_data_is_one_matrix() {
        assert_eq!(std::mem::size_of::<DepthFastDrawData>(), 64);
    }

    #[test]
    fn depth_generic_draw_data_is_176_bytes() {
        // 2 * mat4x4<f32> = 128 bytes, 3 * vec4<f32> = 48 bytes
        assert_eq!(std::mem::size_of::<DepthGenericDrawData>(), 176);
    }

    #[test]
    fn stencil_draw_data_is_80_bytes() {
        assert_eq!(std::mem::size_of::<StencilDrawData>(), 80);
        let data = StencilDrawData::new(Mat4::IDENTITY, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(data.light_origin, [1.0, 2.0, 3.0, 0.0]);
    }
}
