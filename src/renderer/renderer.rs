// renderer/renderer.rs
use log::{debug, info, warn};

use crate::renderer::capabilities::Capabilities;
use crate::renderer::depth::{DepthPass, DepthPassStats};
use crate::renderer::device::{GpuDevice, PixelRect};
use crate::renderer::error::RenderResult;
use crate::renderer::framebuffer::{CaptureRequest, FramebufferStateMachine, ShadowViewport};
use crate::renderer::internal::buffers::MultiDrawBuffers;
use crate::renderer::shadows::{ShadowPassStats, StencilShadowPass};
use crate::renderer::surface::{
    DrawSurface, OcclusionQuery, ScreenRect, ShadowSurface, VertexCache, ViewDef, ViewLight,
};
use crate::settings::RenderSettings;

/// Counters of the frame being recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub views: usize,
    pub lights: usize,
    pub depth: DepthPassStats,
    pub shadows: ShadowPassStats,
    pub captures: usize,
    pub device_errors: usize,
    /// Submits forced by full multi-draw regions.
    pub early_submits: u64,
}

/// Owns the device and every piece of multi-pass state, and sequences the
/// passes of a frame: views enter the primary target, fill depth, add
/// shadow volumes per light and finally present.
pub struct Renderer<D: GpuDevice> {
    device: D,
    caps: Capabilities,
    settings: RenderSettings,
    framebuffers: FramebufferStateMachine,
    buffers: MultiDrawBuffers,
    /// Scissor the device holds, relative to the current view's viewport.
    current_scissor: ScreenRect,
    view_viewport: ScreenRect,
    frame: FrameStats,
    frames: u64,
    rollovers_at_frame_start: u64,
}

impl<D: GpuDevice> Renderer<D> {
    pub fn new(
        mut device: D,
        caps: Capabilities,
        settings: RenderSettings,
        display_width: u32,
        display_height: u32,
    ) -> Self {
        let settings = settings.validate();
        info!(
            "Creating renderer for a {}x{} display ({:?} shadows)",
            display_width, display_height, settings.shadows
        );
        let framebuffers = FramebufferStateMachine::new(&caps, display_width, display_height);
        let mut buffers =
            MultiDrawBuffers::new(settings.max_multidraw_commands, caps.storage_offset_alignment);
        buffers.init(&mut device);
        let full = ScreenRect::full(display_width, display_height);

        Self {
            device,
            caps,
            settings,
            framebuffers,
            buffers,
            current_scissor: full,
            view_viewport: full,
            frame: FrameStats::default(),
            frames: 0,
            rollovers_at_frame_start: 0,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut RenderSettings {
        &mut self.settings
    }

    pub fn framebuffers(&self) -> &FramebufferStateMachine {
        &self.framebuffers
    }

    pub fn buffers(&self) -> &MultiDrawBuffers {
        &self.buffers
    }

    pub fn frame_stats(&self) -> &FrameStats {
        &self.frame
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        info!("Display resized to {}x{}", width, height);
        self.framebuffers.set_display_size(width, height);
    }

    pub fn begin_frame(&mut self) {
        self.frame = FrameStats::default();
        self.rollovers_at_frame_start = self.buffers.rollovers();
    }

    pub fn enter_primary(&mut self) {
        self.framebuffers
            .enter_primary(&mut self.device, &mut self.settings);
    }

    pub fn leave_primary(&mut self) {
        self.framebuffers
            .leave_primary(&mut self.device, &self.settings);
    }

    /// Enters the primary target and sets the view's viewport and a full
    /// scissor.
    pub fn begin_view(&mut self, view: &ViewDef) {
        self.enter_primary();
        let viewport = view.viewport.to_pixels();
        self.device.set_viewport(viewport);
        self.device.set_scissor(viewport);
        self.view_viewport = view.viewport;
        self.current_scissor = ScreenRect::full(
            view.viewport.width().max(1) as u32,
            view.viewport.height().max(1) as u32,
        );
        self.frame.views += 1;
    }

    pub fn fill_depth_buffer(
        &mut self,
        view: &ViewDef,
        surfaces: &[DrawSurface<'_>],
        cache: &dyn VertexCache,
        occlusion: &dyn OcclusionQuery,
    ) -> RenderResult<DepthPassStats> {
        let pass = DepthPass {
            view,
            settings: &self.settings,
            caps: &self.caps,
            cache,
            occlusion,
        };
        let stats = pass.fill_depth_buffer(
            &mut self.device,
            &mut self.buffers,
            surfaces,
            &mut self.current_scissor,
        )?;
        debug!("Depth pass: {:?}", stats);
        self.frame.depth.accumulate(&stats);
        Ok(stats)
    }

    /// Switches into or out of the shadow target for a light covering
    /// `light_scissor`.
    pub fn toggle_shadow(&mut self, on: bool, clear: bool, light_scissor: ScreenRect) {
        let viewport = ShadowViewport {
            light_scissor,
            view_viewport: self.view_viewport,
            current_scissor: self.current_scissor,
        };
        self.framebuffers.toggle_shadow(
            &mut self.device,
            &mut self.settings,
            on,
            clear,
            &viewport,
        );
    }

    pub fn stencil_shadow_pass(
        &mut self,
        view: &ViewDef,
        light: &ViewLight,
        surfaces: &[ShadowSurface<'_>],
        cache: &dyn VertexCache,
    ) -> RenderResult<ShadowPassStats> {
        let pass = StencilShadowPass {
            view,
            light,
            settings: &self.settings,
            caps: &self.caps,
            cache,
        };
        let stats = pass.stencil_shadow_pass(&mut self.device, &mut self.buffers, surfaces)?;
        if stats.truncated > 0 {
            warn!(
                "Light at {:?} lost {} shadow casters to the batch limit",
                light.global_origin, stats.truncated
            );
        }
        self.frame.lights += 1;
        self.frame.shadows.accumulate(&stats);
        Ok(stats)
    }

    /// Copies the view's colour into the post-processing image.
    pub fn copy_color_buffer(&mut self, view: &ViewDef) -> bool {
        self.framebuffers
            .copy_color_buffer(&mut self.device, &self.settings, &view.viewport)
    }

    pub fn bind_shadow_textures(&mut self) {
        self.framebuffers
            .bind_shadow_textures(&mut self.device, &self.settings);
    }

    pub fn capture(&mut self, request: &CaptureRequest, out: &mut [u8]) -> RenderResult<()> {
        self.framebuffers
            .capture(&mut self.device, &self.settings, request, out)?;
        self.frame.captures += 1;
        Ok(())
    }

    /// Capture of the whole display through the synchronous path.
    pub fn capture_display(&mut self, out: &mut [u8]) -> RenderResult<()> {
        let (width, height) = self.framebuffers.display_size();
        let request = CaptureRequest {
            rect: PixelRect::sized(width, height),
            use_pack_buffer: false,
        };
        self.capture(&request, out)
    }

    /// Presents, retires this frame's arena regions and submits.
    pub fn end_frame(&mut self) -> FrameStats {
        self.leave_primary();
        self.frame.early_submits = self
            .buffers
            .rollovers()
            .saturating_sub(self.rollovers_at_frame_start);
        if self.frame.early_submits > 0 {
            debug!(
                "Frame {} outgrew its multi-draw regions {} times",
                self.frames + 1,
                self.frame.early_submits
            );
        }
        self.buffers.switch_frame();

        let errors = self.device.drain_errors();
        for message in &errors {
            warn!("GPU: {}", message);
        }
        self.frame.device_errors += errors.len();
        self.device.submit();

        self.frames += 1;
        debug!("Frame {} done: {:?}", self.frames, self.frame);
        self.frame
    }

    /// Forgets every GPU handle after a device loss and recreates the
    /// multi-draw buffers.
    pub fn reset(&mut self) {
        warn!("Resetting renderer state");
        self.framebuffers.reset();
        self.buffers = MultiDrawBuffers::new(
            self.settings.max_multidraw_commands,
            self.caps.storage_offset_alignment,
        );
        self.buffers.init(&mut self.device);
        self.rollovers_at_frame_start = 0;
    }

    /// Releases every GPU object and hands the device back.
    pub fn shutdown(mut self) -> D {
        info!("Shutting down renderer after {} frames", self.frames);
        self.framebuffers.shutdown(&mut self.device);
        self.buffers.shutdown(&mut self.device);
        self.device.finish();
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::{BufferKind, ClearPlanes};
    use crate::renderer::framebuffer::{Binding, TargetState};
    use crate::renderer::recording::{GpuCommand, RecordingDevice};
    use glam::Mat4;

    fn renderer(settings: RenderSettings) -> Renderer<RecordingDevice> {
        Renderer::new(
            RecordingDevice::new(),
            Capabilities::from_pci_id(0x10DE),
            settings,
            640,
            480,
        )
    }

    #[test]
    fn new_renderer_creates_multi_draw_buffers_once() {
        let renderer = renderer(RenderSettings::default());
        let device = renderer.device();
        for kind in [BufferKind::Storage, BufferKind::Indirect, BufferKind::DrawId] {
            assert_eq!(
                device.count(|c| matches!(c, GpuCommand::CreateBuffer { kind: k, .. } if *k == kind)),
                1
            );
        }
    }

    #[test]
    fn construction_replaces_invalid_settings() {
        let renderer = renderer(RenderSettings {
            fbo_resolution: -1.0,
            max_multidraw_commands: 0,
            max_shadow_batch: 0,
            ..RenderSettings::default()
        });
        let defaults = RenderSettings::default();
        assert_eq!(renderer.settings().fbo_resolution, defaults.fbo_resolution);
        assert_eq!(
            renderer.buffers().max_commands(),
            defaults.max_multidraw_commands
        );
        assert_eq!(renderer.settings().max_shadow_batch, defaults.max_shadow_batch);
    }

    #[test]
    fn frame_enters_primary_and_presents() {
        let mut renderer = renderer(RenderSettings::default());
        let view = ViewDef::new(640, 480, Mat4::IDENTITY);

        renderer.begin_frame();
        renderer.begin_view(&view);
        assert_eq!(renderer.framebuffers().state(), TargetState::Primary);
        assert_eq!(renderer.framebuffers().binding(), Binding::Primary);

        let stats = renderer.end_frame();
        assert_eq!(stats.views, 1);
        assert_eq!(renderer.framebuffers().state(), TargetState::Default);
        assert_eq!(renderer.frames(), 1);

        let device = renderer.device();
        assert_eq!(device.count(|c| matches!(c, GpuCommand::PresentFullscreen(_))), 1);
        assert!(matches!(device.commands().last(), Some(GpuCommand::Submit)));
    }

    #[test]
    fn capture_display_counts_and_clears() {
        let mut renderer = renderer(RenderSettings {
            use_fbo: false,
            ..RenderSettings::default()
        });
        let mut out = vec![0u8; 640 * 480 * 3];
        renderer.capture_display(&mut out).expect("capture");
        assert_eq!(renderer.frame_stats().captures, 1);
        assert!(matches!(
            renderer.device().commands().last(),
            Some(GpuCommand::Clear(planes)) if *planes == ClearPlanes::COLOR
        ));
    }

    #[test]
    fn shutdown_destroys_buffers_and_finishes() {
        let renderer = renderer(RenderSettings::default());
        let device = renderer.shutdown();
        assert_eq!(
            device.count(|c| matches!(c, GpuCommand::DestroyBuffer(_))),
            3
        );
        assert!(matches!(device.commands().last(), Some(GpuCommand::Finish)));
    }
}
