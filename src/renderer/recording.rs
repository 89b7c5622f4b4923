// renderer/recording.rs
//! Headless [`GpuDevice`] that records every call.
//!
//! Keeps enough state (textures, framebuffer attachments, buffer bytes) to
//! validate completeness and let tests decode what a pass uploaded.

use std::collections::BTreeMap;

use bytemuck::Pod;
use glam::Mat4;

use crate::renderer::device::{
    Attachment, AttachmentPoint, BufferKind, BufferRange, ClearPlanes, DrawElementsIndirectCommand,
    DrawState, FramebufferAttachments, FramebufferId, FramebufferStatus, GeometryBinding,
    GpuDevice, IndexedDraw, PixelRect, Program, RenderTarget, TextureDesc, TextureSource,
};

/// Byte written by the pixel read-back paths.
pub const READBACK_FILL: u8 = 0x7F;

#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    AllocateTexture {
        target: RenderTarget,
        desc: TextureDesc,
    },
    GenerateMipmaps(RenderTarget),
    CreateFramebuffer(FramebufferId),
    DeleteFramebuffer(FramebufferId),
    Attach {
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        attachment: Option<Attachment>,
    },
    CheckFramebuffer {
        framebuffer: FramebufferId,
        status: FramebufferStatus,
    },
    BindFramebuffer(Option<FramebufferId>),
    Clear(ClearPlanes),
    SetViewport(PixelRect),
    SetScissor(PixelRect),
    CopyToTexture {
        target: RenderTarget,
        rect: PixelRect,
    },
    BindTexture {
        unit: u32,
        source: Option<TextureSource>,
    },
    PresentFullscreen(RenderTarget),
    UseProgram(Option<Program>),
    SetViewProjection([Mat4; 2]),
    SetState(DrawState),
    BindGeometry(GeometryBinding),
    CreateBuffer {
        kind: BufferKind,
        size: u64,
    },
    DestroyBuffer(BufferKind),
    WriteBuffer {
        kind: BufferKind,
        offset: u64,
        len: u64,
    },
    BindStorage {
        slot: u32,
        range: BufferRange,
    },
    WriteUniforms(Vec<u8>),
    DrawIndexed(IndexedDraw),
    MultiDrawIndexedIndirect {
        commands: BufferRange,
        draw_count: u32,
    },
    MemoryBarrier,
    ReadPixels(PixelRect),
    ReadPixelsToPackBuffer(PixelRect),
    MapPackBuffer {
        mapped: bool,
    },
    PushDebugGroup(String),
    PopDebugGroup,
    Submit,
    Finish,
}

#[derive(Debug, Default)]
pub struct RecordingDevice {
    commands: Vec<GpuCommand>,
    textures: BTreeMap<RenderTarget, TextureDesc>,
    framebuffers: BTreeMap<FramebufferId, FramebufferAttachments>,
    next_framebuffer: u32,
    bound_framebuffer: Option<FramebufferId>,
    buffers: BTreeMap<BufferKind, Vec<u8>>,
    forced_status: Option<FramebufferStatus>,
    failing_target: Option<RenderTarget>,
    fail_pack_map: bool,
    errors: Vec<String>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every completeness check reports `status` until reset with `None`.
    pub fn force_framebuffer_status(&mut self, status: Option<FramebufferStatus>) {
        self.forced_status = status;
    }

    /// Framebuffers with `target` attached report an unsupported
    /// configuration.
    pub fn fail_framebuffers_using(&mut self, target: Option<RenderTarget>) {
        self.failing_target = target;
    }

    pub fn fail_pack_buffer_map(&mut self, fail: bool) {
        self.fail_pack_map = fail;
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<GpuCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn count(&self, predicate: impl Fn(&GpuCommand) -> bool) -> usize {
        self.commands.iter().filter(|command| predicate(command)).count()
    }

    pub fn allocations(&self, target: RenderTarget) -> Vec<TextureDesc> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                GpuCommand::AllocateTexture { target: t, desc } if *t == target => Some(*desc),
                _ => None,
            })
            .collect()
    }

    pub fn texture(&self, target: RenderTarget) -> Option<TextureDesc> {
        self.textures.get(&target).copied()
    }

    pub fn bound_framebuffer(&self) -> Option<FramebufferId> {
        self.bound_framebuffer
    }

    pub fn attachments(&self, framebuffer: FramebufferId) -> Option<&FramebufferAttachments> {
        self.framebuffers.get(&framebuffer)
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn buffer_size(&self, kind: BufferKind) -> Option<u64> {
        self.buffers.get(&kind).map(|bytes| bytes.len() as u64)
    }

    /// Decodes `range` of a buffer as a sequence of `T`.
    pub fn buffer_records<T: Pod>(&self, kind: BufferKind, range: BufferRange) -> Vec<T> {
        let Some(bytes) = self.buffers.get(&kind) else {
            return Vec::new();
        };
        let start = (range.offset as usize).min(bytes.len());
        let end = (start + range.size as usize).min(bytes.len());
        bytes[start..end]
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    /// Every multi-draw issued so far with its decoded commands.
    pub fn multi_draws(&self) -> Vec<(BufferRange, Vec<DrawElementsIndirectCommand>)> {
        self.commands
            .iter()
            .filter_map(|command| match command {
                GpuCommand::MultiDrawIndexedIndirect {
                    commands,
                    draw_count,
                } => {
                    let mut decoded: Vec<DrawElementsIndirectCommand> =
                        self.buffer_records(BufferKind::Indirect, *commands);
                    decoded.truncate(*draw_count as usize);
                    Some((*commands, decoded))
                }
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, command: GpuCommand) {
        self.commands.push(command);
    }
}

impl GpuDevice for RecordingDevice {
    fn allocate_texture(&mut self, target: RenderTarget, desc: &TextureDesc) {
        self.textures.insert(target, *desc);
        self.record(GpuCommand::AllocateTexture {
            target,
            desc: *desc,
        });
    }

    fn generate_mipmaps(&mut self, target: RenderTarget) {
        if !self.textures.contains_key(&target) {
            self.errors
                .push(format!("generate_mipmaps on unallocated {}", target.label()));
        }
        self.record(GpuCommand::GenerateMipmaps(target));
    }

    fn create_framebuffer(&mut self) -> FramebufferId {
        self.next_framebuffer += 1;
        let id = FramebufferId(self.next_framebuffer);
        self.framebuffers.insert(id, FramebufferAttachments::default());
        self.record(GpuCommand::CreateFramebuffer(id));
        id
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
        self.record(GpuCommand::DeleteFramebuffer(framebuffer));
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        attachment: Option<Attachment>,
    ) {
        match self.framebuffers.get_mut(&framebuffer) {
            Some(attachments) => attachments.set(point, attachment),
            None => self
                .errors
                .push(format!("attach to unknown framebuffer {:?}", framebuffer)),
        }
        self.record(GpuCommand::Attach {
            framebuffer,
            point,
            attachment,
        });
    }

    fn framebuffer_status(&mut self, framebuffer: FramebufferId) -> FramebufferStatus {
        let status = match (self.forced_status, self.framebuffers.get(&framebuffer)) {
            (Some(forced), _) => forced,
            (None, None) => FramebufferStatus::MissingAttachment,
            (None, Some(attachments)) => {
                let uses_failing = self.failing_target.is_some_and(|failing| {
                    attachments
                        .iter()
                        .any(|(_, attachment)| attachment.target == failing)
                });
                if uses_failing {
                    FramebufferStatus::Unsupported
                } else {
                    attachments.validate(|target| self.textures.get(&target).copied())
                }
            }
        };
        self.record(GpuCommand::CheckFramebuffer {
            framebuffer,
            status,
        });
        status
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.bound_framebuffer = framebuffer;
        self.record(GpuCommand::BindFramebuffer(framebuffer));
    }

    fn clear(&mut self, planes: ClearPlanes) {
        self.record(GpuCommand::Clear(planes));
    }

    fn set_viewport(&mut self, rect: PixelRect) {
        self.record(GpuCommand::SetViewport(rect));
    }

    fn set_scissor(&mut self, rect: PixelRect) {
        self.record(GpuCommand::SetScissor(rect));
    }

    fn copy_to_texture(&mut self, target: RenderTarget, rect: PixelRect) {
        if !self.textures.contains_key(&target) {
            self.errors
                .push(format!("copy into unallocated {}", target.label()));
        }
        self.record(GpuCommand::CopyToTexture { target, rect });
    }

    fn bind_texture(&mut self, unit: u32, source: Option<TextureSource>) {
        self.record(GpuCommand::BindTexture { unit, source });
    }

    fn present_fullscreen(&mut self, source: RenderTarget) {
        self.record(GpuCommand::PresentFullscreen(source));
    }

    fn use_program(&mut self, program: Option<Program>) {
        self.record(GpuCommand::UseProgram(program));
    }

    fn set_view_projection(&mut self, matrices: [Mat4; 2]) {
        self.record(GpuCommand::SetViewProjection(matrices));
    }

    fn set_state(&mut self, state: &DrawState) {
        self.record(GpuCommand::SetState(*state));
    }

    fn bind_geometry(&mut self, binding: GeometryBinding) {
        self.record(GpuCommand::BindGeometry(binding));
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) {
        self.buffers.insert(kind, vec![0; size as usize]);
        self.record(GpuCommand::CreateBuffer { kind, size });
    }

    fn destroy_buffer(&mut self, kind: BufferKind) {
        self.buffers.remove(&kind);
        self.record(GpuCommand::DestroyBuffer(kind));
    }

    fn write_buffer(&mut self, kind: BufferKind, offset: u64, data: &[u8]) {
        match self.buffers.get_mut(&kind) {
            Some(bytes) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > bytes.len() {
                    self.errors.push(format!(
                        "write of {} bytes at {} overruns {:?} buffer of {} bytes",
                        data.len(),
                        offset,
                        kind,
                        bytes.len()
                    ));
                } else {
                    bytes[start..end].copy_from_slice(data);
                }
            }
            None => self
                .errors
                .push(format!("write to missing {:?} buffer", kind)),
        }
        self.record(GpuCommand::WriteBuffer {
            kind,
            offset,
            len: data.len() as u64,
        });
    }

    fn bind_storage(&mut self, slot: u32, range: BufferRange) {
        self.record(GpuCommand::BindStorage { slot, range });
    }

    fn write_uniforms(&mut self, data: &[u8]) {
        self.record(GpuCommand::WriteUniforms(data.to_vec()));
    }

    fn draw_indexed(&mut self, draw: &IndexedDraw) {
        self.record(GpuCommand::DrawIndexed(*draw));
    }

    fn multi_draw_indexed_indirect(&mut self, commands: BufferRange, draw_count: u32) {
        self.record(GpuCommand::MultiDrawIndexedIndirect {
            commands,
            draw_count,
        });
    }

    fn memory_barrier(&mut self) {
        self.record(GpuCommand::MemoryBarrier);
    }

    fn read_pixels(&mut self, rect: PixelRect, dst: &mut [u8]) {
        let len = (rect.area() * 3).min(dst.len());
        dst[..len].fill(READBACK_FILL);
        self.record(GpuCommand::ReadPixels(rect));
    }

    fn read_pixels_to_pack_buffer(&mut self, rect: PixelRect) {
        match self.buffers.get_mut(&BufferKind::PixelPack) {
            Some(bytes) => {
                let len = (rect.area() * 3).min(bytes.len());
                bytes[..len].fill(READBACK_FILL);
            }
            None => self.errors.push("read into missing pack buffer".into()),
        }
        self.record(GpuCommand::ReadPixelsToPackBuffer(rect));
    }

    fn map_pack_buffer(&mut self, dst: &mut [u8]) -> bool {
        let mapped = match self.buffers.get(&BufferKind::PixelPack) {
            Some(bytes) if !self.fail_pack_map => {
                let len = bytes.len().min(dst.len());
                dst[..len].copy_from_slice(&bytes[..len]);
                true
            }
            _ => false,
        };
        self.record(GpuCommand::MapPackBuffer { mapped });
        mapped
    }

    fn push_debug_group(&mut self, label: &str) {
        self.record(GpuCommand::PushDebugGroup(label.to_string()));
    }

    fn pop_debug_group(&mut self) {
        self.record(GpuCommand::PopDebugGroup);
    }

    fn submit(&mut self) {
        self.record(GpuCommand::Submit);
    }

    fn finish(&mut self) {
        self.record(GpuCommand::Finish);
    }

    fn drain_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }
}
