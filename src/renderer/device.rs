// renderer/device.rs
//! Immediate-mode device interface used by every pass in this crate.
//!
//! The backend issues GL-style calls (bind a framebuffer, set state, draw) and
//! never holds references to device objects. Render targets are addressed by
//! the fixed [`RenderTarget`] set, framebuffers by [`FramebufferId`] and
//! buffers by their [`BufferKind`].

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderTarget {
    /// Colour image read by post-processing. Also the primary colour
    /// attachment when colour sharing is enabled.
    CurrentRender,
    /// Dedicated colour attachment of the primary framebuffer.
    PrimaryColor,
    CurrentDepth,
    /// Stencil plane of the separate depth/stencil layout.
    CurrentStencil,
    /// Depth-stencil copy used by the shadow framebuffer on combined layouts.
    ShadowDepth,
    ShadowCube,
}

impl RenderTarget {
    pub const ALL: [RenderTarget; 6] = [
        RenderTarget::CurrentRender,
        RenderTarget::PrimaryColor,
        RenderTarget::CurrentDepth,
        RenderTarget::CurrentStencil,
        RenderTarget::ShadowDepth,
        RenderTarget::ShadowCube,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RenderTarget::CurrentRender => "CurrentRender",
            RenderTarget::PrimaryColor => "PrimaryColor",
            RenderTarget::CurrentDepth => "CurrentDepth",
            RenderTarget::CurrentStencil => "CurrentStencil",
            RenderTarget::ShadowDepth => "ShadowDepth",
            RenderTarget::ShadowCube => "ShadowCube",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Rgba8,
    Rgb5A1,
    Depth16,
    Depth24,
    Depth24Stencil8,
    Stencil8,
}

impl TargetFormat {
    pub fn color(bits: u32) -> Self {
        if bits == 15 {
            TargetFormat::Rgb5A1
        } else {
            TargetFormat::Rgba8
        }
    }

    pub fn depth(bits: u32) -> Self {
        if bits == 24 {
            TargetFormat::Depth24
        } else {
            TargetFormat::Depth16
        }
    }

    pub fn is_color(self) -> bool {
        matches!(self, TargetFormat::Rgba8 | TargetFormat::Rgb5A1)
    }

    pub fn has_depth(self) -> bool {
        matches!(
            self,
            TargetFormat::Depth16 | TargetFormat::Depth24 | TargetFormat::Depth24Stencil8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, TargetFormat::Depth24Stencil8 | TargetFormat::Stencil8)
    }

    /// wgpu has no 5:5:5:1 format, so that request maps to the closest
    /// packed renderable format.
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            TargetFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TargetFormat::Rgb5A1 => wgpu::TextureFormat::Rgb10a2Unorm,
            TargetFormat::Depth16 => wgpu::TextureFormat::Depth16Unorm,
            TargetFormat::Depth24 => wgpu::TextureFormat::Depth24Plus,
            TargetFormat::Depth24Stencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TargetFormat::Stencil8 => wgpu::TextureFormat::Stencil8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureShape {
    D2,
    Cube,
}

impl TextureShape {
    pub fn layers(self) -> u32 {
        match self {
            TextureShape::D2 => 1,
            TextureShape::Cube => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TargetFormat,
    pub shape: TextureShape,
    pub mip_levels: u32,
    pub filter: Filter,
}

impl TextureDesc {
    /// Single-level 2D image. Colour images filter linearly, depth and
    /// stencil images are sampled nearest.
    pub fn d2(width: u32, height: u32, format: TargetFormat) -> Self {
        Self {
            width,
            height,
            format,
            shape: TextureShape::D2,
            mip_levels: 1,
            filter: if format.is_color() {
                Filter::Linear
            } else {
                Filter::Nearest
            },
        }
    }

    /// Square cube map with a full mip chain.
    pub fn cube(size: u32, format: TargetFormat) -> Self {
        Self {
            width: size,
            height: size,
            format,
            shape: TextureShape::Cube,
            mip_levels: full_mip_chain(size),
            filter: Filter::Linear,
        }
    }

    pub fn mip_extent(&self, level: u32) -> (u32, u32) {
        (
            (self.width >> level).max(1),
            (self.height >> level).max(1),
        )
    }
}

pub fn full_mip_chain(size: u32) -> u32 {
    32 - size.max(1).leading_zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentPoint {
    Color0,
    Depth,
    Stencil,
    DepthStencil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub target: RenderTarget,
    pub level: u32,
}

impl Attachment {
    pub fn base(target: RenderTarget) -> Self {
        Self { target, level: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramebufferStatus {
    Complete,
    IncompleteAttachment,
    MissingAttachment,
    IncompleteDimensions,
    Unsupported,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramebufferAttachments {
    pub color: Option<Attachment>,
    pub depth: Option<Attachment>,
    pub stencil: Option<Attachment>,
    pub depth_stencil: Option<Attachment>,
}

impl FramebufferAttachments {
    pub fn set(&mut self, point: AttachmentPoint, attachment: Option<Attachment>) {
        match point {
            AttachmentPoint::Color0 => self.color = attachment,
            AttachmentPoint::Depth => self.depth = attachment,
            AttachmentPoint::Stencil => self.stencil = attachment,
            AttachmentPoint::DepthStencil => self.depth_stencil = attachment,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttachmentPoint, Attachment)> + '_ {
        [
            (AttachmentPoint::Color0, self.color),
            (AttachmentPoint::Depth, self.depth),
            (AttachmentPoint::Stencil, self.stencil),
            (AttachmentPoint::DepthStencil, self.depth_stencil),
        ]
        .into_iter()
        .filter_map(|(point, attachment)| attachment.map(|a| (point, a)))
    }

    /// Completeness rules shared by the device implementations: every
    /// attachment must exist, match its attachment point and agree on size.
    pub fn validate<F>(&self, lookup: F) -> FramebufferStatus
    where
        F: Fn(RenderTarget) -> Option<TextureDesc>,
    {
        let mut extent = None;
        let mut attached = false;

        for (point, attachment) in self.iter() {
            attached = true;
            let Some(desc) = lookup(attachment.target) else {
                return FramebufferStatus::IncompleteAttachment;
            };
            if attachment.level >= desc.mip_levels {
                return FramebufferStatus::IncompleteAttachment;
            }

            let format = desc.format;
            let fits = match point {
                AttachmentPoint::Color0 => format.is_color(),
                AttachmentPoint::Depth => format.has_depth(),
                AttachmentPoint::Stencil => format.has_stencil(),
                AttachmentPoint::DepthStencil => format.has_depth() && format.has_stencil(),
            };
            if !fits {
                return FramebufferStatus::IncompleteAttachment;
            }

            let size = desc.mip_extent(attachment.level);
            match extent {
                None => extent = Some(size),
                Some(existing) if existing != size => {
                    return FramebufferStatus::IncompleteDimensions;
                }
                Some(_) => {}
            }
        }

        if attached {
            FramebufferStatus::Complete
        } else {
            FramebufferStatus::MissingAttachment
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClearPlanes: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Window-space rectangle, origin bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn area(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullType {
    FrontSided,
    BackSided,
    TwoSided,
}

impl CullType {
    pub fn cull_face(self) -> Option<wgpu::Face> {
        match self {
            CullType::FrontSided => Some(wgpu::Face::Back),
            CullType::BackSided => Some(wgpu::Face::Front),
            CullType::TwoSided => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    /// `src * dst`, used to darken subview surfaces by the overbright factor.
    ModulateDestination,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonOffset {
    pub factor: f32,
    pub units: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub enabled: bool,
    pub reference: u32,
    pub read_mask: u32,
    pub write_mask: u32,
    pub front: wgpu::StencilFaceState,
    pub back: wgpu::StencilFaceState,
}

impl StencilState {
    pub const DISABLED: Self = Self {
        enabled: false,
        reference: 0,
        read_mask: 0xFF,
        write_mask: 0xFF,
        front: wgpu::StencilFaceState::IGNORE,
        back: wgpu::StencilFaceState::IGNORE,
    };

    /// Enabled test with keep-everything operations on both faces.
    pub fn test(compare: wgpu::CompareFunction, reference: u32, mask: u32) -> Self {
        let face = wgpu::StencilFaceState {
            compare,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Keep,
        };
        Self {
            enabled: true,
            reference,
            read_mask: mask,
            write_mask: 0xFF,
            front: face,
            back: face,
        }
    }

    /// Replaces the operations of one face, keeping its compare function.
    pub fn with_face_ops(
        mut self,
        face: wgpu::Face,
        fail_op: wgpu::StencilOperation,
        depth_fail_op: wgpu::StencilOperation,
        pass_op: wgpu::StencilOperation,
    ) -> Self {
        let target = match face {
            wgpu::Face::Front => &mut self.front,
            wgpu::Face::Back => &mut self.back,
        };
        target.fail_op = fail_op;
        target.depth_fail_op = depth_fail_op;
        target.pass_op = pass_op;
        self
    }

    pub fn to_wgpu(&self) -> wgpu::StencilState {
        if !self.enabled {
            return wgpu::StencilState::default();
        }
        wgpu::StencilState {
            front: self.front,
            back: self.back,
            read_mask: self.read_mask,
            write_mask: self.write_mask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawState {
    pub depth_compare: wgpu::CompareFunction,
    pub depth_write: bool,
    pub color_write: bool,
    pub blend: BlendMode,
    pub cull: CullType,
    pub polygon_offset: Option<PolygonOffset>,
    pub stencil: StencilState,
    pub depth_bounds: Option<(f32, f32)>,
}

impl Default for DrawState {
    fn default() -> Self {
        Self {
            depth_compare: wgpu::CompareFunction::Less,
            depth_write: true,
            color_write: true,
            blend: BlendMode::Opaque,
            cull: CullType::FrontSided,
            polygon_offset: None,
            stencil: StencilState::DISABLED,
            depth_bounds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    DepthFastMultiDraw,
    DepthGeneric,
    StencilShadowMultiDraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Static,
    Frame,
}

impl Residency {
    pub fn from_static(is_static: bool) -> Self {
        if is_static {
            Residency::Static
        } else {
            Residency::Frame
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexLayout {
    /// Full draw vertex (position, texcoord, normal, tangents, colour).
    Draw,
    /// Homogeneous shadow vertex.
    Shadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryBinding {
    pub vertex: Residency,
    pub index: Residency,
    pub layout: VertexLayout,
    /// Feed the per-instance draw id stream alongside the vertices.
    pub draw_id: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferKind {
    Storage,
    Indirect,
    DrawId,
    PixelPack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferRange {
    pub offset: u64,
    pub size: u64,
}

/// Texture owned by the material system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSource {
    Target {
        target: RenderTarget,
        aspect: wgpu::TextureAspect,
    },
    Image(ImageId),
}

impl TextureSource {
    pub fn target(target: RenderTarget) -> Self {
        TextureSource::Target {
            target,
            aspect: wgpu::TextureAspect::All,
        }
    }
}

/// One record of an indirect multi-draw, laid out as the GPU reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct DrawElementsIndirectCommand {
    pub count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: u32,
    pub base_instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedDraw {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub instance_count: u32,
    /// First instance index; selects the draw id on draw-id programs.
    pub first_instance: u32,
}

pub trait GpuDevice {
    /// (Re)allocates storage for `target`. Previous contents are lost.
    fn allocate_texture(&mut self, target: RenderTarget, desc: &TextureDesc);
    fn generate_mipmaps(&mut self, target: RenderTarget);

    fn create_framebuffer(&mut self) -> FramebufferId;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);
    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        attachment: Option<Attachment>,
    );
    fn framebuffer_status(&mut self, framebuffer: FramebufferId) -> FramebufferStatus;
    /// `None` binds the default (presentable) framebuffer.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>);

    fn clear(&mut self, planes: ClearPlanes);
    fn set_viewport(&mut self, rect: PixelRect);
    fn set_scissor(&mut self, rect: PixelRect);

    /// Copies `rect` of the bound framebuffer into `target`. Colour targets
    /// receive colour, depth-stencil targets receive depth and stencil.
    fn copy_to_texture(&mut self, target: RenderTarget, rect: PixelRect);
    fn bind_texture(&mut self, unit: u32, source: Option<TextureSource>);
    /// Draws `source` over the whole bound framebuffer with an orthographic
    /// projection and depth testing disabled, then restores 3D state.
    fn present_fullscreen(&mut self, source: RenderTarget);

    fn use_program(&mut self, program: Option<Program>);
    /// One matrix per stereo eye.
    fn set_view_projection(&mut self, matrices: [Mat4; 2]);
    fn set_state(&mut self, state: &DrawState);
    fn bind_geometry(&mut self, binding: GeometryBinding);

    fn create_buffer(&mut self, kind: BufferKind, size: u64);
    fn destroy_buffer(&mut self, kind: BufferKind);
    fn write_buffer(&mut self, kind: BufferKind, offset: u64, data: &[u8]);
    fn bind_storage(&mut self, slot: u32, range: BufferRange);
    /// Replaces the per-draw uniform block of the generic programs.
    fn write_uniforms(&mut self, data: &[u8]);

    fn draw_indexed(&mut self, draw: &IndexedDraw);
    /// Issues `draw_count` commands read from the indirect buffer at `commands`.
    fn multi_draw_indexed_indirect(&mut self, commands: BufferRange, draw_count: u32);
    fn memory_barrier(&mut self);

    /// Synchronous RGB8 read of the bound framebuffer.
    fn read_pixels(&mut self, rect: PixelRect, dst: &mut [u8]);
    /// Starts an asynchronous RGB8 read into the pixel pack buffer.
    fn read_pixels_to_pack_buffer(&mut self, rect: PixelRect);
    /// Copies the pack buffer into `dst`. Returns `false` when the buffer
    /// could not be mapped; the caller then recreates it.
    fn map_pack_buffer(&mut self, dst: &mut [u8]) -> bool;

    fn push_debug_group(&mut self, label: &str);
    fn pop_debug_group(&mut self);
    /// Hands everything recorded so far to the GPU without waiting.
    fn submit(&mut self);
    /// Blocks until the GPU has consumed every submitted command.
    fn finish(&mut self);
    fn drain_errors(&mut self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(target: RenderTarget) -> Option<TextureDesc> {
        match target {
            RenderTarget::CurrentRender => Some(TextureDesc::d2(64, 32, TargetFormat::Rgba8)),
            RenderTarget::CurrentDepth => {
                Some(TextureDesc::d2(64, 32, TargetFormat::Depth24Stencil8))
            }
            RenderTarget::CurrentStencil => Some(TextureDesc::d2(32, 32, TargetFormat::Stencil8)),
            RenderTarget::ShadowCube => Some(TextureDesc::cube(256, TargetFormat::Depth24)),
            _ => None,
        }
    }

    #[test]
    fn indirect_command_is_twenty_bytes() {
        assert_eq!(std::mem::size_of::<DrawElementsIndirectCommand>(), 20);
    }

    #[test]
    fn empty_framebuffer_is_missing_attachment() {
        let attachments = FramebufferAttachments::default();
        assert_eq!(
            attachments.validate(lookup),
            FramebufferStatus::MissingAttachment
        );
    }

    #[test]
    fn colour_and_combined_depth_is_complete() {
        let mut attachments = FramebufferAttachments::default();
        attachments.set(
            AttachmentPoint::Color0,
            Some(Attachment::base(RenderTarget::CurrentRender)),
        );
        attachments.set(
            AttachmentPoint::DepthStencil,
            Some(Attachment::base(RenderTarget::CurrentDepth)),
        );
        assert_eq!(attachments.validate(lookup), FramebufferStatus::Complete);
    }

    #[test]
    fn mismatched_sizes_are_incomplete() {
        let mut attachments = FramebufferAttachments::default();
        attachments.set(
            AttachmentPoint::Color0,
            Some(Attachment::base(RenderTarget::CurrentRender)),
        );
        attachments.set(
            AttachmentPoint::Stencil,
            Some(Attachment::base(RenderTarget::CurrentStencil)),
        );
        assert_eq!(
            attachments.validate(lookup),
            FramebufferStatus::IncompleteDimensions
        );
    }

    #[test]
    fn wrong_format_or_missing_level_is_incomplete() {
        let mut attachments = FramebufferAttachments::default();
        attachments.set(
            AttachmentPoint::Color0,
            Some(Attachment::base(RenderTarget::CurrentDepth)),
        );
        assert_eq!(
            attachments.validate(lookup),
            FramebufferStatus::IncompleteAttachment
        );

        let mut attachments = FramebufferAttachments::default();
        attachments.set(
            AttachmentPoint::Depth,
            Some(Attachment {
                target: RenderTarget::ShadowCube,
                level: 9,
            }),
        );
        assert_eq!(
            attachments.validate(lookup),
            FramebufferStatus::IncompleteAttachment
        );
    }

    #[test]
    fn cube_mip_chain_covers_every_level() {
        assert_eq!(full_mip_chain(1024), 11);
        assert_eq!(full_mip_chain(1), 1);
        let cube = TextureDesc::cube(1024, TargetFormat::Depth24);
        assert_eq!(cube.mip_extent(5), (32, 32));
        assert_eq!(cube.mip_extent(20), (1, 1));
    }

    #[test]
    fn stencil_face_ops_replace_only_one_face() {
        let state = StencilState::test(wgpu::CompareFunction::Always, 1, 255).with_face_ops(
            wgpu::Face::Back,
            wgpu::StencilOperation::Keep,
            wgpu::StencilOperation::DecrementWrap,
            wgpu::StencilOperation::Keep,
        );
        assert_eq!(
            state.back.depth_fail_op,
            wgpu::StencilOperation::DecrementWrap
        );
        assert_eq!(state.front.depth_fail_op, wgpu::StencilOperation::Keep);
        assert_eq!(state.back.compare, wgpu::CompareFunction::Always);
    }
}
