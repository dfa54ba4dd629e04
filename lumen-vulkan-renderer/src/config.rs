//! Renderer configuration.
//!
//! A [`RendererConfig`] is normally deserialized from the compositor's TOML
//! config file; every field has a default so a missing `[renderer]` table
//! yields a working setup. Values that would violate hard limits (blur pass
//! counts, staging sizes) are clamped on load rather than rejected.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VulkanError};

/// Hard upper bound on blur passes; the blur chain is sized from this.
pub const MAX_BLUR_PASSES: u32 = 8;

/// Number of RGBA entries in one color scheme palette.
pub const COLOR_SCHEME_SIZE: usize = 8;

/// Postprocess display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Composite output as-is.
    Normal,
    /// Visualize the depth buffer.
    Depth,
    /// Visualize the per-pixel surface identity buffer.
    Identity,
}

impl DisplayMode {
    /// Value pushed to the postprocess shader.
    pub fn shader_value(self) -> f32 {
        match self {
            DisplayMode::Normal => 0.0,
            DisplayMode::Depth => 1.0,
            DisplayMode::Identity => 2.0,
        }
    }
}

impl Default for DisplayMode {
    fn default() -> Self {
        DisplayMode::Normal
    }
}

/// A named palette blended into the output by the postprocess pass.
#[derive(Debug, Clone, Deserialize)]
pub struct ColorScheme {
    pub name: String,
    /// RGBA entries; short palettes are padded by repeating the last entry.
    pub colors: Vec<[f32; 4]>,
}

impl ColorScheme {
    /// Palette padded/truncated to exactly [`COLOR_SCHEME_SIZE`] entries.
    pub fn padded(&self) -> [[f32; 4]; COLOR_SCHEME_SIZE] {
        let mut out = [[0.0, 0.0, 0.0, 1.0]; COLOR_SCHEME_SIZE];
        let last = self.colors.last().copied().unwrap_or([0.0, 0.0, 0.0, 1.0]);
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.colors.get(i).copied().unwrap_or(last);
        }
        out
    }
}

fn default_blur_passes() -> u32 {
    4
}

fn default_final_blur_passes() -> u32 {
    3
}

fn default_staging_min() -> u64 {
    1 << 20 // 1 MiB
}

fn default_staging_max() -> u64 {
    64 << 20 // 64 MiB
}

fn default_descriptor_pool_size() -> u32 {
    64
}

fn default_shader_dir() -> PathBuf {
    PathBuf::from("shaders")
}

fn default_summary_interval() -> u64 {
    600
}

fn default_schemes() -> Vec<ColorScheme> {
    vec![ColorScheme {
        name: "default".to_string(),
        colors: vec![[0.1, 0.1, 0.12, 1.0], [0.9, 0.9, 0.92, 1.0]],
    }]
}

/// Tunables for the rendering backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Backdrop blur passes per surface, clamped to [`MAX_BLUR_PASSES`].
    pub blur_passes: u32,
    /// Full-target blur passes run once per frame before postprocessing.
    pub final_blur_passes: u32,
    /// Brightness threshold applied on the first full-target downsample.
    pub blur_brightness_threshold: f32,
    /// Allocate two intermediate composite images instead of one.
    pub double_intermediate: bool,
    /// Smallest staging buffer the arena will create.
    pub staging_min_size: u64,
    /// Largest staging buffer the arena may create; requests above this fail.
    pub staging_max_size: u64,
    /// Set count of the first descriptor pool; later pools grow geometrically.
    pub descriptor_pool_size: u32,
    /// Directory holding compiled SPIR-V shaders.
    pub shader_dir: PathBuf,
    /// Enable the Khronos validation layer when available.
    pub validation: bool,
    /// Postprocess display mode.
    pub display_mode: DisplayMode,
    /// Emit the average-FPS summary every this many frames (0 disables it).
    pub timing_summary_interval: u64,
    /// Color schemes available for postprocess blending.
    pub color_schemes: Vec<ColorScheme>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            blur_passes: default_blur_passes(),
            final_blur_passes: default_final_blur_passes(),
            blur_brightness_threshold: 0.8,
            double_intermediate: false,
            staging_min_size: default_staging_min(),
            staging_max_size: default_staging_max(),
            descriptor_pool_size: default_descriptor_pool_size(),
            shader_dir: default_shader_dir(),
            validation: cfg!(debug_assertions),
            display_mode: DisplayMode::default(),
            timing_summary_interval: default_summary_interval(),
            color_schemes: default_schemes(),
        }
    }
}

impl RendererConfig {
    /// Loads a config from a TOML file and sanitizes it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config: RendererConfig =
            toml::from_str(&text).map_err(|e| VulkanError::Config(e.to_string()))?;
        config.sanitize();
        Ok(config)
    }

    /// Clamps values that have hard limits.
    pub fn sanitize(&mut self) {
        if self.blur_passes > MAX_BLUR_PASSES {
            log::warn!(
                "blur_passes {} exceeds maximum {}, clamping",
                self.blur_passes,
                MAX_BLUR_PASSES
            );
            self.blur_passes = MAX_BLUR_PASSES;
        }
        if self.final_blur_passes > MAX_BLUR_PASSES {
            log::warn!(
                "final_blur_passes {} exceeds maximum {}, clamping",
                self.final_blur_passes,
                MAX_BLUR_PASSES
            );
            self.final_blur_passes = MAX_BLUR_PASSES;
        }
        self.blur_passes = self.blur_passes.max(1);
        self.final_blur_passes = self.final_blur_passes.max(1);
        // the blur chain holds 2×blur_passes images; the full-target blur
        // must fit in it
        if self.final_blur_passes > self.blur_passes * 2 {
            log::warn!(
                "final_blur_passes {} exceeds blur chain capacity {}, clamping",
                self.final_blur_passes,
                self.blur_passes * 2
            );
            self.final_blur_passes = self.blur_passes * 2;
        }
        if self.staging_min_size > self.staging_max_size {
            self.staging_min_size = self.staging_max_size;
        }
        if self.descriptor_pool_size == 0 {
            self.descriptor_pool_size = default_descriptor_pool_size();
        }
        if self.color_schemes.is_empty() {
            self.color_schemes = default_schemes();
        }
    }

    /// Number of images in each render target's blur chain.
    pub fn blur_chain_len(&self) -> usize {
        (self.blur_passes * 2) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = RendererConfig::default();
        assert!(config.blur_passes >= 1 && config.blur_passes <= MAX_BLUR_PASSES);
        assert_eq!(config.final_blur_passes, 3);
        assert!(config.staging_min_size <= config.staging_max_size);
        assert!(!config.color_schemes.is_empty());
    }

    #[test]
    fn sanitize_clamps_blur_passes() {
        let mut config = RendererConfig::default();
        config.blur_passes = 99;
        config.final_blur_passes = 0;
        config.sanitize();
        assert_eq!(config.blur_passes, MAX_BLUR_PASSES);
        assert_eq!(config.final_blur_passes, 1);
    }

    #[test]
    fn final_blur_is_clamped_to_chain_capacity() {
        let mut config = RendererConfig::default();
        config.blur_passes = 1;
        config.final_blur_passes = 5;
        config.sanitize();
        assert_eq!(config.final_blur_passes, 2);
    }

    #[test]
    fn parses_partial_toml() {
        let text = r#"
            blur_passes = 2
            display_mode = "identity"

            [[color_schemes]]
            name = "dusk"
            colors = [[0.2, 0.1, 0.3, 1.0]]
        "#;
        let mut config: RendererConfig = toml::from_str(text).unwrap();
        config.sanitize();
        assert_eq!(config.blur_passes, 2);
        assert_eq!(config.display_mode, DisplayMode::Identity);
        assert_eq!(config.color_schemes[0].name, "dusk");
        // defaults fill the rest
        assert_eq!(config.final_blur_passes, 3);
    }

    #[test]
    fn scheme_padding_repeats_last_entry() {
        let scheme = ColorScheme {
            name: "mono".into(),
            colors: vec![[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0]],
        };
        let padded = scheme.padded();
        assert_eq!(padded[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(padded[1], [0.0, 1.0, 0.0, 1.0]);
        for entry in &padded[2..] {
            assert_eq!(*entry, [0.0, 1.0, 0.0, 1.0]);
        }
    }

    #[test]
    fn blur_chain_is_twice_the_pass_count() {
        let mut config = RendererConfig::default();
        config.blur_passes = 3;
        assert_eq!(config.blur_chain_len(), 6);
    }
}
