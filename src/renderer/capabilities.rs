// renderer/capabilities.rs
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other(u32),
}

impl GpuVendor {
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10DE => GpuVendor::Nvidia,
            0x1002 | 0x1022 => GpuVendor::Amd,
            0x8086 => GpuVendor::Intel,
            other => GpuVendor::Other(other),
        }
    }
}

/// What the device can do, detected once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub vendor: GpuVendor,
    /// Depth and stencil live in separate images (Depth16 + Stencil8)
    /// instead of a combined Depth24Stencil8 image.
    pub separate_stencil: bool,
    pub depth_bounds: bool,
    pub pixel_buffer: bool,
    pub stencil_wrap: bool,
    pub indirect_first_instance: bool,
    pub storage_offset_alignment: u32,
}

impl Capabilities {
    pub fn for_vendor(vendor: GpuVendor) -> Self {
        Self {
            vendor,
            separate_stencil: vendor == GpuVendor::Intel,
            depth_bounds: matches!(vendor, GpuVendor::Nvidia | GpuVendor::Amd),
            pixel_buffer: true,
            stencil_wrap: true,
            indirect_first_instance: true,
            storage_offset_alignment: 256,
        }
    }

    pub fn from_pci_id(id: u32) -> Self {
        Self::for_vendor(GpuVendor::from_pci_id(id))
    }

    /// wgpu only exposes combined depth-stencil attachments and has no depth
    /// bounds test, whatever the vendor.
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        let limits = adapter.limits();
        let features = adapter.features();

        let caps = Self {
            vendor: GpuVendor::from_pci_id(info.vendor),
            separate_stencil: false,
            depth_bounds: false,
            pixel_buffer: true,
            stencil_wrap: true,
            indirect_first_instance: features.contains(wgpu::Features::INDIRECT_FIRST_INSTANCE),
            storage_offset_alignment: limits.min_storage_buffer_offset_alignment,
        };
        info!(
            "Adapter {} ({:?}): {:?}",
            info.name, info.backend, caps
        );
        caps
    }

    pub fn stencil_increment(&self) -> wgpu::StencilOperation {
        if self.stencil_wrap {
            wgpu::StencilOperation::IncrementWrap
        } else {
            wgpu::StencilOperation::IncrementClamp
        }
    }

    pub fn stencil_decrement(&self) -> wgpu::StencilOperation {
        if self.stencil_wrap {
            wgpu::StencilOperation::DecrementWrap
        } else {
            wgpu::StencilOperation::DecrementClamp
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::for_vendor(GpuVendor::Nvidia)
    }
}
