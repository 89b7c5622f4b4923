// renderer/targets.rs
use std::collections::BTreeMap;

use crate::renderer::capabilities::Capabilities;
use crate::renderer::device::{
    Attachment, AttachmentPoint, FramebufferId, GpuDevice, RenderTarget, TargetFormat, TextureDesc,
    TextureSource,
};

/// Current description of every allocated render target.
#[derive(Debug, Default)]
pub struct RenderTargetRegistry {
    current: BTreeMap<RenderTarget, TextureDesc>,
    allocations: usize,
}

impl RenderTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desc(&self, target: RenderTarget) -> Option<TextureDesc> {
        self.current.get(&target).copied()
    }

    pub fn extent(&self, target: RenderTarget) -> Option<(u32, u32)> {
        self.desc(target).map(|desc| (desc.width, desc.height))
    }

    /// Reallocates `target` when `desc` differs from what it holds. Returns
    /// whether an allocation was issued. Contents are undefined afterwards.
    pub fn ensure<D: GpuDevice>(
        &mut self,
        device: &mut D,
        target: RenderTarget,
        desc: TextureDesc,
    ) -> bool {
        if self.current.get(&target) == Some(&desc) {
            return false;
        }

        log::debug!(
            "Allocating {} {}x{} {:?} ({} mips)",
            target.label(),
            desc.width,
            desc.height,
            desc.format,
            desc.mip_levels
        );
        device.allocate_texture(target, &desc);
        self.current.insert(target, desc);
        self.allocations += 1;
        true
    }

    pub fn ensure_size<D: GpuDevice>(
        &mut self,
        device: &mut D,
        target: RenderTarget,
        width: u32,
        height: u32,
        format: TargetFormat,
    ) -> bool {
        self.ensure(
            device,
            target,
            TextureDesc::d2(width.max(1), height.max(1), format),
        )
    }

    /// Total allocations issued since creation or the last `clear`.
    pub fn allocation_count(&self) -> usize {
        self.allocations
    }

    /// Forgets every target, as after a device loss.
    pub fn clear(&mut self) {
        self.current.clear();
        self.allocations = 0;
    }
}

/// Depth and stencil in their own images. The shadow target reuses the
/// scene depth directly, so no copy is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeparateDepthStencil;

impl SeparateDepthStencil {
    fn allocate_primary<D: GpuDevice>(
        &self,
        registry: &mut RenderTargetRegistry,
        device: &mut D,
        width: u32,
        height: u32,
    ) {
        registry.ensure_size(
            device,
            RenderTarget::CurrentDepth,
            width,
            height,
            TargetFormat::Depth16,
        );
        registry.ensure_size(
            device,
            RenderTarget::CurrentStencil,
            width,
            height,
            TargetFormat::Stencil8,
        );
    }

    fn attach_primary<D: GpuDevice>(&self, device: &mut D, framebuffer: FramebufferId) {
        device.attach(
            framebuffer,
            AttachmentPoint::DepthStencil,
            None,
        );
        device.attach(
            framebuffer,
            AttachmentPoint::Depth,
            Some(Attachment::base(RenderTarget::CurrentDepth)),
        );
        device.attach(
            framebuffer,
            AttachmentPoint::Stencil,
            Some(Attachment::base(RenderTarget::CurrentStencil)),
        );
    }

    fn allocate_shadow<D: GpuDevice>(
        &self,
        registry: &mut RenderTargetRegistry,
        device: &mut D,
        width: u32,
        height: u32,
    ) {
        registry.ensure_size(
            device,
            RenderTarget::CurrentStencil,
            width,
            height,
            TargetFormat::Stencil8,
        );
    }
}

/// One Depth24Stencil8 image. Stencil shadows render into a private copy
/// of the scene depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct CombinedDepthStencil;

impl CombinedDepthStencil {
    fn allocate_primary<D: GpuDevice>(
        &self,
        registry: &mut RenderTargetRegistry,
        device: &mut D,
        width: u32,
        height: u32,
    ) {
        registry.ensure_size(
            device,
            RenderTarget::CurrentDepth,
            width,
            height,
            TargetFormat::Depth24Stencil8,
        );
    }

    fn attach_primary<D: GpuDevice>(&self, device: &mut D, framebuffer: FramebufferId) {
        device.attach(framebuffer, AttachmentPoint::Depth, None);
        device.attach(framebuffer, AttachmentPoint::Stencil, None);
        device.attach(
            framebuffer,
            AttachmentPoint::DepthStencil,
            Some(Attachment::base(RenderTarget::CurrentDepth)),
        );
    }

    fn allocate_shadow<D: GpuDevice>(
        &self,
        registry: &mut RenderTargetRegistry,
        device: &mut D,
        width: u32,
        height: u32,
    ) {
        registry.ensure_size(
            device,
            RenderTarget::ShadowDepth,
            width,
            height,
            TargetFormat::Depth24Stencil8,
        );
    }
}

/// Depth/stencil layout chosen once from the device capabilities.
#[derive(Debug, Clone, Copy)]
pub enum DepthStencilModel {
    Separate(SeparateDepthStencil),
    Combined(CombinedDepthStencil),
}

impl DepthStencilModel {
    pub fn select(caps: &Capabilities) -> Self {
        if caps.separate_stencil {
            DepthStencilModel::Separate(SeparateDepthStencil)
        } else {
            DepthStencilModel::Combined(CombinedDepthStencil)
        }
    }

    pub fn allocate_primary<D: GpuDevice>(
        &self,
        registry: &mut RenderTargetRegistry,
        device: &mut D,
        width: u32,
        height: u32,
    ) {
        match self {
            DepthStencilModel::Separate(model) => {
                model.allocate_primary(registry, device, width, height)
            }
            DepthStencilModel::Combined(model) => {
                model.allocate_primary(registry, device, width, height)
            }
        }
    }

    pub fn attach_primary<D: GpuDevice>(&self, device: &mut D, framebuffer: FramebufferId) {
        match self {
            DepthStencilModel::Separate(model) => model.attach_primary(device, framebuffer),
            DepthStencilModel::Combined(model) => model.attach_primary(device, framebuffer),
        }
    }

    pub fn allocate_shadow<D: GpuDevice>(
        &self,
        registry: &mut RenderTargetRegistry,
        device: &mut D,
        width: u32,
        height: u32,
    ) {
        match self {
            DepthStencilModel::Separate(model) => {
                model.allocate_shadow(registry, device, width, height)
            }
            DepthStencilModel::Combined(model) => {
                model.allocate_shadow(registry, device, width, height)
            }
        }
    }

    /// Attaches the 2D stencil-shadow configuration to `framebuffer`.
    pub fn attach_shadow<D: GpuDevice>(&self, device: &mut D, framebuffer: FramebufferId) {
        match self {
            // The scene depth is shared with the primary target.
            DepthStencilModel::Separate(model) => model.attach_primary(device, framebuffer),
            DepthStencilModel::Combined(_) => {
                device.attach(framebuffer, AttachmentPoint::Depth, None);
                device.attach(framebuffer, AttachmentPoint::Stencil, None);
                device.attach(
                    framebuffer,
                    AttachmentPoint::DepthStencil,
                    Some(Attachment::base(RenderTarget::ShadowDepth)),
                );
            }
        }
    }

    /// Target whose size defines the 2D shadow storage.
    pub fn shadow_storage(&self) -> RenderTarget {
        match self {
            DepthStencilModel::Separate(_) => RenderTarget::CurrentStencil,
            DepthStencilModel::Combined(_) => RenderTarget::ShadowDepth,
        }
    }

    /// Stencil shadows need the scene depth copied into their own image.
    pub fn needs_depth_copy(&self) -> bool {
        matches!(self, DepthStencilModel::Combined(_))
    }

    /// Stencil plane sampled by the soft-shadow pass.
    pub fn stencil_texture(&self) -> TextureSource {
        match self {
            DepthStencilModel::Separate(_) => TextureSource::target(RenderTarget::CurrentStencil),
            DepthStencilModel::Combined(_) => TextureSource::Target {
                target: RenderTarget::ShadowDepth,
                aspect: wgpu::TextureAspect::StencilOnly,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::capabilities::GpuVendor;
    use crate::renderer::recording::RecordingDevice;

    #[test]
    fn ensure_size_only_reallocates_on_change() {
        let mut device = RecordingDevice::new();
        let mut registry = RenderTargetRegistry::new();

        assert!(registry.ensure_size(
            &mut device,
            RenderTarget::CurrentRender,
            960,
            540,
            TargetFormat::Rgba8
        ));
        assert!(!registry.ensure_size(
            &mut device,
            RenderTarget::CurrentRender,
            960,
            540,
            TargetFormat::Rgba8
        ));
        assert!(registry.ensure_size(
            &mut device,
            RenderTarget::CurrentRender,
            960,
            540,
            TargetFormat::Rgb5A1
        ));
        assert_eq!(registry.allocation_count(), 2);
        assert_eq!(device.allocations(RenderTarget::CurrentRender).len(), 2);
        assert_eq!(registry.extent(RenderTarget::CurrentRender), Some((960, 540)));
    }

    #[test]
    fn intel_selects_separate_layout() {
        let intel = DepthStencilModel::select(&Capabilities::for_vendor(GpuVendor::Intel));
        assert!(matches!(intel, DepthStencilModel::Separate(_)));
        assert!(!intel.needs_depth_copy());

        let nvidia = DepthStencilModel::select(&Capabilities::for_vendor(GpuVendor::Nvidia));
        assert!(matches!(nvidia, DepthStencilModel::Combined(_)));
        assert!(nvidia.needs_depth_copy());
    }

    #[test]
    fn layouts_allocate_their_depth_formats() {
        let mut device = RecordingDevice::new();
        let mut registry = RenderTargetRegistry::new();
        DepthStencilModel::Separate(SeparateDepthStencil).allocate_primary(
            &mut registry,
            &mut device,
            64,
            64,
        );
        assert_eq!(
            registry.desc(RenderTarget::CurrentDepth).map(|d| d.format),
            Some(TargetFormat::Depth16)
        );
        assert_eq!(
            registry.desc(RenderTarget::CurrentStencil).map(|d| d.format),
            Some(TargetFormat::Stencil8)
        );

        let mut registry = RenderTargetRegistry::new();
        DepthStencilModel::Combined(CombinedDepthStencil).allocate_primary(
            &mut registry,
            &mut device,
            64,
            64,
        );
        assert_eq!(
            registry.desc(RenderTarget::CurrentDepth).map(|d| d.format),
            Some(TargetFormat::Depth24Stencil8)
        );
        assert_eq!(registry.desc(RenderTarget::CurrentStencil), None);
    }
}
