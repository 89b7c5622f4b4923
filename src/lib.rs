pub mod renderer;
pub mod settings;

pub use renderer::{Capabilities, GpuDevice, RenderError, Renderer};
pub use settings::RenderSettings;

/// Installs the `env_logger` backend at `info` level. Safe to call more
/// than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
