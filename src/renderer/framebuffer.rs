// renderer/framebuffer.rs
//! Offscreen primary target, shadow target and the transitions between them
//! and the default framebuffer.
//!
//! Which framebuffer is bound is never stored: it follows from the target
//! state and the shadow flag (see [`FramebufferStateMachine::binding`]).

use log::{debug, error, info, warn};

use crate::renderer::capabilities::Capabilities;
use crate::renderer::device::{
    Attachment, AttachmentPoint, BufferKind, ClearPlanes, CullType, DrawState, FramebufferId,
    FramebufferStatus, GpuDevice, PixelRect, RenderTarget, TextureDesc, TextureShape,
    TextureSource,
};
use crate::renderer::error::{RenderError, RenderResult};
use crate::renderer::surface::ScreenRect;
use crate::renderer::targets::{DepthStencilModel, RenderTargetRegistry};
use crate::settings::{FboDebug, RenderSettings, ShadowTechnique};

/// Upper bound on the number of times a cube shadow map is halved.
pub const MAX_SHADOW_MIP: u32 = 5;

pub const SHADOW_DEPTH_UNIT: u32 = 6;
pub const SHADOW_STENCIL_UNIT: u32 = 7;

/// Mip level of the cube shadow map for a light covering
/// `light_screen_size` pixels on a screen whose shorter side is
/// `screen_size`. Each level doubles the light's apparent size until it
/// reaches the screen, at most [`MAX_SHADOW_MIP`] times.
pub fn shadow_mip_level(light_screen_size: i32, screen_size: i32) -> u32 {
    let mut mip = 0;
    let mut size = light_screen_size.max(0) as i64;
    while size < screen_size as i64 && mip < MAX_SHADOW_MIP {
        mip += 1;
        size <<= 1;
    }
    mip
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Default,
    Primary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Default,
    Primary,
    Shadow,
}

/// What the caller had set up before entering the shadow target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowViewport {
    pub light_scissor: ScreenRect,
    pub view_viewport: ScreenRect,
    /// Relative to `view_viewport`.
    pub current_scissor: ScreenRect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub rect: PixelRect,
    /// Read through the pixel pack buffer, one capture behind.
    pub use_pack_buffer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShadowLayout {
    shape: TextureShape,
    extent: (u32, u32),
}

pub struct FramebufferStateMachine {
    model: DepthStencilModel,
    pixel_buffer: bool,
    registry: RenderTargetRegistry,
    display: (u32, u32),
    state: TargetState,
    shadow_active: bool,
    depth_copied_this_view: bool,
    primary: Option<FramebufferId>,
    primary_shared_color: bool,
    shadow: Option<FramebufferId>,
    shadow_layout: Option<ShadowLayout>,
    shadow_mip: u32,
    pack_buffer_size: Option<usize>,
}

impl FramebufferStateMachine {
    pub fn new(caps: &Capabilities, display_width: u32, display_height: u32) -> Self {
        let model = DepthStencilModel::select(caps);
        info!("Depth/stencil layout: {:?}", model);
        Self {
            model,
            pixel_buffer: caps.pixel_buffer,
            registry: RenderTargetRegistry::new(),
            display: (display_width.max(1), display_height.max(1)),
            state: TargetState::Default,
            shadow_active: false,
            depth_copied_this_view: false,
            primary: None,
            primary_shared_color: false,
            shadow: None,
            shadow_layout: None,
            shadow_mip: 0,
            pack_buffer_size: None,
        }
    }

    pub fn set_display_size(&mut self, width: u32, height: u32) {
        self.display = (width.max(1), height.max(1));
    }

    pub fn display_size(&self) -> (u32, u32) {
        self.display
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn binding(&self) -> Binding {
        if self.shadow_active {
            Binding::Shadow
        } else if self.state == TargetState::Primary {
            Binding::Primary
        } else {
            Binding::Default
        }
    }

    pub fn model(&self) -> &DepthStencilModel {
        &self.model
    }

    pub fn registry(&self) -> &RenderTargetRegistry {
        &self.registry
    }

    pub fn shadow_mip(&self) -> u32 {
        self.shadow_mip
    }

    pub fn depth_copied_this_view(&self) -> bool {
        self.depth_copied_this_view
    }

    fn current_framebuffer(&self) -> Option<FramebufferId> {
        match self.binding() {
            Binding::Shadow => self.shadow,
            Binding::Primary => self.primary,
            Binding::Default => None,
        }
    }

    pub fn enter_primary<D: GpuDevice>(&mut self, device: &mut D, settings: &mut RenderSettings) {
        self.depth_copied_this_view = false;
        if !settings.use_fbo || self.state == TargetState::Primary {
            return;
        }

        self.check_create_primary(device, settings);
        let Some(primary) = self.primary else {
            return;
        };

        device.bind_framebuffer(Some(primary));
        // Transparent sky would otherwise blend with the previous frame.
        device.clear(ClearPlanes::COLOR);
        self.state = TargetState::Primary;
    }

    fn check_create_primary<D: GpuDevice>(&mut self, device: &mut D, settings: &mut RenderSettings) {
        let (width, height) = settings.primary_extent(self.display.0, self.display.1);
        let color = settings.color_format();

        self.registry
            .ensure_size(device, RenderTarget::CurrentRender, width, height, color);
        if !settings.fbo_shared_color {
            self.registry
                .ensure_size(device, RenderTarget::PrimaryColor, width, height, color);
        }
        self.model
            .allocate_primary(&mut self.registry, device, width, height);

        if self.primary.is_some() && self.primary_shared_color == settings.fbo_shared_color {
            return;
        }

        let framebuffer = match self.primary {
            Some(framebuffer) => framebuffer,
            None => device.create_framebuffer(),
        };
        let color_target = if settings.fbo_shared_color {
            RenderTarget::CurrentRender
        } else {
            RenderTarget::PrimaryColor
        };
        device.attach(
            framebuffer,
            AttachmentPoint::Color0,
            Some(Attachment::base(color_target)),
        );
        self.model.attach_primary(device, framebuffer);
        self.primary_shared_color = settings.fbo_shared_color;

        match device.framebuffer_status(framebuffer) {
            FramebufferStatus::Complete => {
                info!(
                    "Primary framebuffer {}x{} ready (shared color: {})",
                    width, height, settings.fbo_shared_color
                );
                self.primary = Some(framebuffer);
            }
            status => {
                error!(
                    "Primary framebuffer incomplete ({:?}). Disabling offscreen rendering.",
                    status
                );
                device.delete_framebuffer(framebuffer);
                self.primary = None;
                settings.use_fbo = false;
                settings.soft_shadows_quality = 0;
            }
        }
    }

    /// Presents the primary target on the default framebuffer.
    pub fn leave_primary<D: GpuDevice>(&mut self, device: &mut D, settings: &RenderSettings) {
        if self.state != TargetState::Primary {
            return;
        }

        device.bind_framebuffer(None);
        let full = PixelRect::sized(self.display.0, self.display.1);
        device.set_viewport(full);
        device.set_scissor(full);

        let source = match settings.fbo_debug {
            FboDebug::Render => RenderTarget::CurrentRender,
            FboDebug::Depth => RenderTarget::CurrentDepth,
            FboDebug::Shadow => RenderTarget::ShadowDepth,
            FboDebug::Off if self.primary_shared_color => RenderTarget::CurrentRender,
            FboDebug::Off => RenderTarget::PrimaryColor,
        };
        device.present_fullscreen(source);

        self.state = TargetState::Default;
        self.shadow_active = false;
        if settings.front_buffer {
            device.finish();
        }
    }

    pub fn toggle_shadow<D: GpuDevice>(
        &mut self,
        device: &mut D,
        settings: &mut RenderSettings,
        on: bool,
        clear: bool,
        view: &ShadowViewport,
    ) {
        self.check_create_shadow(device, settings);

        if on
            && !self.depth_copied_this_view
            && self.model.needs_depth_copy()
            && settings.shadows == ShadowTechnique::Stencil
        {
            if let Some((width, height)) = self.registry.extent(RenderTarget::ShadowDepth) {
                device.copy_to_texture(RenderTarget::ShadowDepth, PixelRect::sized(width, height));
            }
            self.depth_copied_this_view = true;
        }

        self.shadow_active = on && self.shadow.is_some();
        device.bind_framebuffer(self.current_framebuffer());

        if settings.shadows != ShadowTechnique::Maps {
            return;
        }

        device.set_state(&DrawState {
            depth_write: on,
            cull: if on {
                CullType::BackSided
            } else {
                CullType::FrontSided
            },
            ..DrawState::default()
        });

        if on {
            let light_size = view
                .light_scissor
                .width()
                .max(view.light_scissor.height());
            let screen_size = self.display.0.min(self.display.1) as i32;
            self.shadow_mip = shadow_mip_level(light_size, screen_size);
            let map_size = (settings.shadow_map_size >> self.shadow_mip).max(1);
            debug!(
                "Shadow map mip {} ({} px) for a {} px light",
                self.shadow_mip, map_size, light_size
            );

            if let Some(shadow) = self.shadow {
                device.attach(
                    shadow,
                    AttachmentPoint::Depth,
                    Some(Attachment {
                        target: RenderTarget::ShadowCube,
                        level: self.shadow_mip,
                    }),
                );
            }
            let rect = PixelRect::sized(map_size, map_size);
            device.set_viewport(rect);
            if settings.use_scissor {
                device.set_scissor(rect);
            }
            if clear {
                device.clear(ClearPlanes::DEPTH);
            }
        } else {
            device.set_viewport(view.view_viewport.to_pixels());
            if settings.use_scissor {
                device.set_scissor(view.current_scissor.offset_pixels(&view.view_viewport));
            }
        }
    }

    fn check_create_shadow<D: GpuDevice>(&mut self, device: &mut D, settings: &mut RenderSettings) {
        let (width, height) = if self.state == TargetState::Primary {
            settings.primary_extent(self.display.0, self.display.1)
        } else {
            self.display
        };
        let maps = settings.shadows == ShadowTechnique::Maps;

        let layout = if maps {
            let desc = TextureDesc::cube(settings.shadow_map_size, settings.shadow_map_format());
            if self.registry.ensure(device, RenderTarget::ShadowCube, desc) {
                device.generate_mipmaps(RenderTarget::ShadowCube);
            }
            ShadowLayout {
                shape: TextureShape::Cube,
                extent: (desc.width, desc.height),
            }
        } else {
            self.model
                .allocate_shadow(&mut self.registry, device, width, height);
            ShadowLayout {
                shape: TextureShape::D2,
                extent: (width.max(1), height.max(1)),
            }
        };

        if self.shadow.is_some() && self.shadow_layout == Some(layout) {
            return;
        }

        let framebuffer = match self.shadow {
            Some(framebuffer) => framebuffer,
            None => device.create_framebuffer(),
        };
        if maps {
            device.attach(framebuffer, AttachmentPoint::DepthStencil, None);
            device.attach(framebuffer, AttachmentPoint::Stencil, None);
            device.attach(
                framebuffer,
                AttachmentPoint::Depth,
                Some(Attachment::base(RenderTarget::ShadowCube)),
            );
        } else {
            self.model.attach_shadow(device, framebuffer);
        }

        match device.framebuffer_status(framebuffer) {
            FramebufferStatus::Complete => {
                debug!("Shadow framebuffer rebuilt as {:?}", layout);
                self.shadow = Some(framebuffer);
                self.shadow_layout = Some(layout);
            }
            status => {
                error!(
                    "Shadow framebuffer incomplete ({:?}). Disabling soft shadows.",
                    status
                );
                device.delete_framebuffer(framebuffer);
                self.shadow = None;
                self.shadow_layout = None;
                self.shadow_active = false;
                settings.soft_shadows_quality = 0;
                if maps {
                    warn!("Falling back from shadow maps to stencil shadows");
                    settings.shadows = ShadowTechnique::Stencil;
                }
            }
        }
    }

    /// Copies the bound colour into `CurrentRender` for post-processing.
    /// Nothing to do when the primary target already renders into it.
    pub fn copy_color_buffer<D: GpuDevice>(
        &mut self,
        device: &mut D,
        settings: &RenderSettings,
        viewport: &ScreenRect,
    ) -> bool {
        if self.state == TargetState::Primary && settings.fbo_shared_color {
            return false;
        }

        let rect = viewport.to_pixels();
        let (width, height) = (rect.width.max(1) as u32, rect.height.max(1) as u32);
        let too_small = self
            .registry
            .extent(RenderTarget::CurrentRender)
            .map_or(true, |(w, h)| w < width || h < height);
        if too_small {
            self.registry.ensure_size(
                device,
                RenderTarget::CurrentRender,
                width,
                height,
                settings.color_format(),
            );
        }
        device.copy_to_texture(RenderTarget::CurrentRender, rect);
        true
    }

    pub fn bind_shadow_textures<D: GpuDevice>(&self, device: &mut D, settings: &RenderSettings) {
        if settings.shadows == ShadowTechnique::Maps {
            device.bind_texture(
                SHADOW_DEPTH_UNIT,
                Some(TextureSource::target(RenderTarget::ShadowCube)),
            );
        } else {
            device.bind_texture(
                SHADOW_DEPTH_UNIT,
                Some(TextureSource::Target {
                    target: RenderTarget::CurrentDepth,
                    aspect: wgpu::TextureAspect::DepthOnly,
                }),
            );
            device.bind_texture(SHADOW_STENCIL_UNIT, Some(self.model.stencil_texture()));
        }
    }

    /// Reads an RGB8 rectangle of the bound framebuffer into `out`, then
    /// clears the colour plane. Through the pack buffer `out` receives the
    /// previous capture.
    pub fn capture<D: GpuDevice>(
        &mut self,
        device: &mut D,
        settings: &RenderSettings,
        request: &CaptureRequest,
        out: &mut [u8],
    ) -> RenderResult<()> {
        let required = request.rect.area() * 3;
        if out.len() < required {
            return Err(RenderError::CaptureBufferTooSmall {
                required,
                provided: out.len(),
            });
        }
        if settings.front_buffer {
            device.finish();
        }

        if request.use_pack_buffer && self.pixel_buffer {
            let size = match self.pack_buffer_size {
                Some(size) => size,
                None => {
                    device.create_buffer(BufferKind::PixelPack, required as u64);
                    self.pack_buffer_size = Some(required);
                    required
                }
            };
            if size != required {
                return Err(RenderError::CaptureSizeMismatch {
                    expected: size,
                    actual: required,
                });
            }

            if !device.map_pack_buffer(&mut out[..required]) {
                warn!("Pixel pack buffer could not be mapped. Recreating it.");
                device.destroy_buffer(BufferKind::PixelPack);
                device.create_buffer(BufferKind::PixelPack, required as u64);
            }
            device.read_pixels_to_pack_buffer(request.rect);
        } else {
            device.read_pixels(request.rect, &mut out[..required]);
        }

        device.clear(ClearPlanes::COLOR);
        Ok(())
    }

    /// Forgets every GPU handle, as after a device loss.
    pub fn reset(&mut self) {
        self.primary = None;
        self.shadow = None;
        self.shadow_layout = None;
        self.pack_buffer_size = None;
        self.registry.clear();
        self.state = TargetState::Default;
        self.shadow_active = false;
        self.depth_copied_this_view = false;
    }

    pub fn shutdown<D: GpuDevice>(&mut self, device: &mut D) {
        for framebuffer in [self.primary, self.shadow].into_iter().flatten() {
            device.delete_framebuffer(framebuffer);
        }
        if self.pack_buffer_size.is_some() {
            device.destroy_buffer(BufferKind::PixelPack);
        }
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_light_hits_the_mip_cap() {
        // 64 -> 128 -> 256 -> 512 -> 1024 is still under 1080 after four
        // doublings, so the fifth is taken and the cap ends the loop.
        assert_eq!(shadow_mip_level(64, 1080), MAX_SHADOW_MIP);
        assert_eq!(shadow_mip_level(68, 1080), 4);
        assert_eq!(shadow_mip_level(0, 1080), MAX_SHADOW_MIP);
    }

    #[test]
    fn mip_doubles_until_the_light_reaches_the_screen() {
        // 135 -> 270 -> 540 -> 1080
        assert_eq!(shadow_mip_level(135, 1080), 3);
        assert_eq!(shadow_mip_level(540, 1080), 1);
        assert_eq!(shadow_mip_level(1080, 1080), 0);
        assert_eq!(shadow_mip_level(4000, 1080), 0);
    }

    #[test]
    fn binding_follows_state() {
        let machine = FramebufferStateMachine::new(&Capabilities::default(), 640, 480);
        assert_eq!(machine.binding(), Binding::Default);
        assert_eq!(machine.state(), TargetState::Default);
    }
}
