pub mod batches;
pub mod capabilities;
pub mod depth;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod internal;
pub mod recording;
pub mod renderer;
pub mod shadows;
pub mod surface;
pub mod targets;
pub mod uniforms;
pub mod wgpu_device;

pub use capabilities::{Capabilities, GpuVendor};
pub use depth::{DepthPass, DepthPassStats};
pub use device::GpuDevice;
pub use error::{ArenaError, DeviceError, RenderError, RenderResult};
pub use framebuffer::{Binding, CaptureRequest, FramebufferStateMachine, TargetState};
pub use recording::{GpuCommand, RecordingDevice};
pub use renderer::{FrameStats, Renderer};
pub use shadows::{classify_shadow, ShadowPassStats, StencilShadowPass};
pub use wgpu_device::WgpuDevice;
