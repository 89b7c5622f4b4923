use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::renderer::device::TargetFormat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "RenderSettings::default_true")]
    pub use_fbo: bool,
    #[serde(default = "RenderSettings::default_fbo_resolution")]
    pub fbo_resolution: f32,
    #[serde(default = "RenderSettings::default_fbo_color_bits")]
    pub fbo_color_bits: u32,
    #[serde(default = "RenderSettings::default_fbo_depth_bits")]
    pub fbo_depth_bits: u32,
    #[serde(default)]
    pub fbo_shared_color: bool,
    #[serde(default)]
    pub fbo_debug: FboDebug,
    #[serde(default)]
    pub shadows: ShadowTechnique,
    #[serde(default = "RenderSettings::default_shadow_map_size")]
    pub shadow_map_size: u32,
    #[serde(default)]
    pub soft_shadows_quality: u32,
    #[serde(default)]
    pub use_occlusion_culling: bool,
    #[serde(default = "RenderSettings::default_true")]
    pub use_scissor: bool,
    #[serde(default)]
    pub offset_factor: f32,
    #[serde(default = "RenderSettings::default_offset_units")]
    pub offset_units: f32,
    #[serde(default)]
    pub shadow_polygon_factor: f32,
    #[serde(default = "RenderSettings::default_shadow_polygon_offset")]
    pub shadow_polygon_offset: f32,
    #[serde(default = "RenderSettings::default_true")]
    pub use_depth_bounds_test: bool,
    #[serde(default)]
    pub external_shadows: ExternalShadows,
    #[serde(default)]
    pub front_buffer: bool,
    #[serde(default)]
    pub skip_portal_sky: bool,
    #[serde(default = "RenderSettings::default_max_multidraw_commands")]
    pub max_multidraw_commands: usize,
    #[serde(default = "RenderSettings::default_max_shadow_batch")]
    pub max_shadow_batch: usize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            use_fbo: true,
            fbo_resolution: Self::default_fbo_resolution(),
            fbo_color_bits: Self::default_fbo_color_bits(),
            fbo_depth_bits: Self::default_fbo_depth_bits(),
            fbo_shared_color: false,
            fbo_debug: FboDebug::default(),
            shadows: ShadowTechnique::default(),
            shadow_map_size: Self::default_shadow_map_size(),
            soft_shadows_quality: 0,
            use_occlusion_culling: false,
            use_scissor: true,
            offset_factor: 0.0,
            offset_units: Self::default_offset_units(),
            shadow_polygon_factor: 0.0,
            shadow_polygon_offset: Self::default_shadow_polygon_offset(),
            use_depth_bounds_test: true,
            external_shadows: ExternalShadows::default(),
            front_buffer: false,
            skip_portal_sky: false,
            max_multidraw_commands: Self::default_max_multidraw_commands(),
            max_shadow_batch: Self::default_max_shadow_batch(),
        }
    }
}

impl RenderSettings {
    pub fn load() -> Self {
        Self::load_from_path("render_settings.json")
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<RenderSettings>(contents).map(Self::validate)
    }

    /// Replaces out-of-range values with their defaults.
    pub fn validate(mut self) -> Self {
        if !self.fbo_resolution.is_finite() || self.fbo_resolution <= 0.0 || self.fbo_resolution > 4.0
        {
            warn!(
                "FBO resolution {} is outside (0, 4]. Using default value.",
                self.fbo_resolution
            );
            self.fbo_resolution = Self::default_fbo_resolution();
        }

        if !matches!(self.fbo_color_bits, 15 | 32) {
            warn!(
                "FBO color bits must be 15 or 32, got {}. Using default value.",
                self.fbo_color_bits
            );
            self.fbo_color_bits = Self::default_fbo_color_bits();
        }

        if !matches!(self.fbo_depth_bits, 16 | 24) {
            warn!(
                "FBO depth bits must be 16 or 24, got {}. Using default value.",
                self.fbo_depth_bits
            );
            self.fbo_depth_bits = Self::default_fbo_depth_bits();
        }

        if self.shadow_map_size < 16 || !self.shadow_map_size.is_power_of_two() {
            warn!(
                "Shadow map size must be a power of two of at least 16, got {}. Using default value.",
                self.shadow_map_size
            );
            self.shadow_map_size = Self::default_shadow_map_size();
        }

        if self.max_multidraw_commands == 0 {
            warn!("Multi-draw command capacity must be greater than zero. Using default value.");
            self.max_multidraw_commands = Self::default_max_multidraw_commands();
        }

        if self.max_shadow_batch == 0 {
            warn!("Shadow batch capacity must be greater than zero. Using default value.");
            self.max_shadow_batch = Self::default_max_shadow_batch();
        }

        if self.max_shadow_batch > self.max_multidraw_commands {
            warn!(
                "Shadow batch capacity {} exceeds the multi-draw capacity {}. Clamping.",
                self.max_shadow_batch, self.max_multidraw_commands
            );
            self.max_shadow_batch = self.max_multidraw_commands;
        }

        self
    }

    /// Size of the offscreen primary target for a `width` × `height` display,
    /// never smaller than one pixel per side.
    pub fn primary_extent(&self, width: u32, height: u32) -> (u32, u32) {
        (
            ((self.fbo_resolution * width as f32) as u32).max(1),
            ((self.fbo_resolution * height as f32) as u32).max(1),
        )
    }

    pub fn color_format(&self) -> TargetFormat {
        TargetFormat::color(self.fbo_color_bits)
    }

    pub fn shadow_map_format(&self) -> TargetFormat {
        TargetFormat::depth(self.fbo_depth_bits)
    }

    pub fn soft_shadows(&self) -> bool {
        self.soft_shadows_quality > 0
    }

    const fn default_true() -> bool {
        true
    }

    const fn default_fbo_resolution() -> f32 {
        1.0
    }

    const fn default_fbo_color_bits() -> u32 {
        32
    }

    const fn default_fbo_depth_bits() -> u32 {
        24
    }

    const fn default_shadow_map_size() -> u32 {
        1024
    }

    const fn default_offset_units() -> f32 {
        -600.0
    }

    const fn default_shadow_polygon_offset() -> f32 {
        -1.0
    }

    const fn default_max_multidraw_commands() -> usize {
        8192
    }

    const fn default_max_shadow_batch() -> usize {
        1024
    }
}

/// Target drawn instead of the scene colour when leaving the primary target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FboDebug {
    #[default]
    Off,
    Render,
    Depth,
    Shadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowTechnique {
    None,
    #[default]
    Stencil,
    Maps,
}

/// How shadow volumes pick their cap variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalShadows {
    /// Always draw the full capped volume.
    Off,
    #[default]
    Auto,
    /// Drop every cap. Only useful for debugging.
    ForceNoCaps,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_settings() -> RenderSettings {
        RenderSettings {
            fbo_resolution: 0.0,
            fbo_color_bits: 24,
            fbo_depth_bits: 8,
            shadow_map_size: 1000,
            max_multidraw_commands: 0,
            max_shadow_batch: 0,
            ..RenderSettings::default()
        }
    }

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let validated = invalid_settings().validate();
        let defaults = RenderSettings::default();

        assert_eq!(validated.fbo_resolution, defaults.fbo_resolution);
        assert_eq!(validated.fbo_color_bits, defaults.fbo_color_bits);
        assert_eq!(validated.fbo_depth_bits, defaults.fbo_depth_bits);
        assert_eq!(validated.shadow_map_size, defaults.shadow_map_size);
        assert_eq!(
            validated.max_multidraw_commands,
            defaults.max_multidraw_commands
        );
        assert_eq!(validated.max_shadow_batch, defaults.max_shadow_batch);
    }

    #[test]
    fn validate_preserves_valid_values() {
        let valid = RenderSettings {
            fbo_resolution: 0.5,
            fbo_color_bits: 15,
            fbo_depth_bits: 16,
            shadow_map_size: 2048,
            shadows: ShadowTechnique::Maps,
            ..RenderSettings::default()
        };

        let validated = valid.clone().validate();
        assert_eq!(validated, valid);
    }

    #[test]
    fn shadow_batch_is_clamped_to_command_capacity() {
        let settings = RenderSettings {
            max_multidraw_commands: 512,
            max_shadow_batch: 1024,
            ..RenderSettings::default()
        }
        .validate();
        assert_eq!(settings.max_shadow_batch, 512);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings = RenderSettings::from_json(
            r#"{ "fbo_resolution": 0.5, "shadows": "maps", "external_shadows": "force_no_caps" }"#,
        )
        .expect("parse");

        assert_eq!(settings.fbo_resolution, 0.5);
        assert_eq!(settings.shadows, ShadowTechnique::Maps);
        assert_eq!(settings.external_shadows, ExternalShadows::ForceNoCaps);
        assert!(settings.use_fbo);
        assert_eq!(settings.max_multidraw_commands, 8192);
        assert_eq!(settings.fbo_debug, FboDebug::Off);
    }

    #[test]
    fn primary_extent_truncates_scaled_display() {
        let settings = RenderSettings {
            fbo_resolution: 0.5,
            ..RenderSettings::default()
        };
        assert_eq!(settings.primary_extent(1920, 1080), (960, 540));
        assert_eq!(settings.primary_extent(1366, 767), (683, 383));
    }

    #[test]
    fn tiny_resolution_scale_keeps_a_one_pixel_target() {
        let settings = RenderSettings {
            fbo_resolution: 0.0001,
            ..RenderSettings::default()
        }
        .validate();
        assert_eq!(settings.fbo_resolution, 0.0001);
        assert_eq!(settings.primary_extent(640, 480), (1, 1));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = RenderSettings::load_from_path("does/not/exist/render_settings.json");
        assert_eq!(settings, RenderSettings::default());
    }
}
