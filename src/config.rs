use anyhow::{bail, Context, Result};
use glam::{Vec2, Vec3};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SkinError;
use crate::trails::{NoiseAdvance, TrailParams};
use crate::variant::ChainVariantKind;

#[derive(Debug, Clone, Deserialize)]
pub struct TrailConfig {
    #[serde(default = "TrailConfig::default_speed")]
    pub speed: f32,
    #[serde(default = "TrailConfig::default_speed_scale_min")]
    pub speed_scale_min: f32,
    #[serde(default = "TrailConfig::default_speed_scale_max")]
    pub speed_scale_max: f32,
    #[serde(default = "TrailConfig::default_speed_limit")]
    pub speed_limit: f32,
    #[serde(default = "TrailConfig::default_drag")]
    pub drag: f32,
    #[serde(default)]
    pub gravity: [f32; 3],
    #[serde(default = "TrailConfig::default_noise_amplitude")]
    pub noise_amplitude: f32,
    #[serde(default = "TrailConfig::default_noise_frequency")]
    pub noise_frequency: f32,
    #[serde(default = "TrailConfig::default_noise_motion")]
    pub noise_motion: f32,
    #[serde(default)]
    pub noise_advance: NoiseAdvance,
    #[serde(default = "TrailConfig::default_follow_intensity")]
    pub follow_intensity: f32,
    #[serde(default)]
    pub follow_delay_min: f32,
    #[serde(default = "TrailConfig::default_follow_delay_max")]
    pub follow_delay_max: f32,
    #[serde(default)]
    pub attractor: Option<[f32; 3]>,
    #[serde(default = "TrailConfig::default_attractor_spread")]
    pub attractor_spread: f32,
}

impl TrailConfig {
    pub const MAX_DRAG: f32 = 15.0;

    const fn default_speed() -> f32 {
        1.0
    }

    const fn default_speed_scale_min() -> f32 {
        2.0
    }

    const fn default_speed_scale_max() -> f32 {
        5.0
    }

    const fn default_speed_limit() -> f32 {
        1.0
    }

    const fn default_drag() -> f32 {
        0.1
    }

    const fn default_noise_amplitude() -> f32 {
        1.0
    }

    const fn default_noise_frequency() -> f32 {
        0.01
    }

    const fn default_noise_motion() -> f32 {
        1.0
    }

    const fn default_follow_intensity() -> f32 {
        1.0
    }

    const fn default_follow_delay_max() -> f32 {
        1.0
    }

    const fn default_attractor_spread() -> f32 {
        1.0
    }

    /// Runtime parameters, with drag and follow delays clamped to their editable ranges.
    pub fn to_params(&self) -> TrailParams {
        TrailParams {
            speed: self.speed,
            speed_scale_min: self.speed_scale_min,
            speed_scale_max: self.speed_scale_max,
            speed_limit: self.speed_limit,
            drag: self.drag.clamp(0.0, Self::MAX_DRAG),
            gravity: Vec3::from_array(self.gravity),
            noise_amplitude: self.noise_amplitude,
            noise_frequency: self.noise_frequency,
            noise_motion: self.noise_motion,
            noise_advance: self.noise_advance,
            follow_intensity: self.follow_intensity,
            follow_delay: Vec2::new(self.follow_delay_min.clamp(0.0, 1.0), self.follow_delay_max.clamp(0.0, 1.0)),
            attractor: self.attractor.map(Vec3::from_array),
            attractor_spread: self.attractor_spread,
        }
    }
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            speed: Self::default_speed(),
            speed_scale_min: Self::default_speed_scale_min(),
            speed_scale_max: Self::default_speed_scale_max(),
            speed_limit: Self::default_speed_limit(),
            drag: Self::default_drag(),
            gravity: [0.0; 3],
            noise_amplitude: Self::default_noise_amplitude(),
            noise_frequency: Self::default_noise_frequency(),
            noise_motion: Self::default_noise_motion(),
            noise_advance: NoiseAdvance::default(),
            follow_intensity: Self::default_follow_intensity(),
            follow_delay_min: 0.0,
            follow_delay_max: Self::default_follow_delay_max(),
            attractor: None,
            attractor_spread: Self::default_attractor_spread(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiagnosticsConfig {
    /// Allows blocking read-back of bone and trail buffers.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "RenderConfig::default_width")]
    pub width: u32,
    #[serde(default = "RenderConfig::default_height")]
    pub height: u32,
    #[serde(default = "RenderConfig::default_frames")]
    pub frames: u32,
    #[serde(default = "RenderConfig::default_time_step")]
    pub time_step: f32,
}

impl RenderConfig {
    /// Longest fixed step in seconds.
    pub const MAX_TIME_STEP: f32 = 1.0;

    const fn default_width() -> u32 {
        640
    }

    const fn default_height() -> u32 {
        360
    }

    const fn default_frames() -> u32 {
        240
    }

    fn default_time_step() -> f32 {
        1.0 / 60.0
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: Self::default_width(),
            height: Self::default_height(),
            frames: Self::default_frames(),
            time_step: Self::default_time_step(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkinConfig {
    #[serde(default = "SkinConfig::default_instances_count")]
    pub instances_count: u32,
    #[serde(default = "SkinConfig::default_bone_count")]
    pub bone_count: u32,
    #[serde(default)]
    pub variant: ChainVariantKind,
    /// glTF mesh to skin. The procedural blade is used when absent.
    #[serde(default)]
    pub mesh: Option<PathBuf>,
    #[serde(default)]
    pub trail: TrailConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

impl Default for SkinConfig {
    fn default() -> Self {
        Self {
            instances_count: Self::default_instances_count(),
            bone_count: Self::default_bone_count(),
            variant: ChainVariantKind::default(),
            mesh: None,
            trail: TrailConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkinConfigOverrides {
    pub instances_count: Option<u32>,
    pub bone_count: Option<u32>,
    pub variant: Option<ChainVariantKind>,
    pub frames: Option<u32>,
    pub diagnostics: Option<bool>,
    pub mesh: Option<PathBuf>,
}

impl SkinConfig {
    const fn default_instances_count() -> u32 {
        128
    }

    const fn default_bone_count() -> u32 {
        8
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("[config] {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &SkinConfigOverrides) {
        if let Some(instances) = overrides.instances_count {
            self.instances_count = instances;
        }
        if let Some(bones) = overrides.bone_count {
            self.bone_count = bones;
        }
        if let Some(variant) = overrides.variant {
            self.variant = variant;
        }
        if let Some(frames) = overrides.frames {
            self.render.frames = frames;
        }
        if let Some(enabled) = overrides.diagnostics {
            self.diagnostics.enabled = enabled;
        }
        if let Some(mesh) = &overrides.mesh {
            self.mesh = Some(mesh.clone());
        }
    }

    /// Checks what can be checked before a mesh is known. Mesh-dependent checks happen
    /// when the chain layout is derived.
    pub fn validate(&self) -> Result<()> {
        if self.instances_count == 0 {
            return Err(SkinError::InvalidChain("instances_count must be at least 1".into()).into());
        }
        let min_bones = self.variant.build().policy().min_bone_count();
        if self.bone_count < min_bones {
            return Err(SkinError::InvalidChain(format!(
                "{} chains need at least {min_bones} bones, got {}",
                self.variant, self.bone_count
            ))
            .into());
        }
        let trail = &self.trail;
        if trail.speed_scale_min > trail.speed_scale_max {
            bail!(
                "trail.speed_scale_min ({}) must not exceed trail.speed_scale_max ({})",
                trail.speed_scale_min,
                trail.speed_scale_max
            );
        }
        if trail.follow_delay_min > trail.follow_delay_max {
            bail!("trail.follow_delay_min must not exceed trail.follow_delay_max");
        }
        if self.render.width == 0 || self.render.height == 0 {
            bail!("render target must be non-empty, got {}x{}", self.render.width, self.render.height);
        }
        let step = self.render.time_step;
        if !(step.is_finite() && (0.0..=RenderConfig::MAX_TIME_STEP).contains(&step)) {
            bail!("render.time_step must lie in [0, {}] seconds, got {step}", RenderConfig::MAX_TIME_STEP);
        }
        Ok(())
    }
}

impl SkinConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.instances_count.is_some() {
            fields.push("instances");
        }
        if self.bone_count.is_some() {
            fields.push("bones");
        }
        if self.variant.is_some() {
            fields.push("variant");
        }
        if self.frames.is_some() {
            fields.push("frames");
        }
        if self.diagnostics.is_some() {
            fields.push("diagnostics");
        }
        if self.mesh.is_some() {
            fields.push("mesh");
        }
        fields
    }
}
