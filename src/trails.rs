use anyhow::{Context, Result};
use glam::{Vec2, Vec3};
use serde::Deserialize;
use std::fmt;

use crate::animator::{AcquiredBuffers, SkinAnimator, SkinPipeline};
use crate::chain::{ChainLayout, ChainTransform};
use crate::config::SkinConfig;
use crate::device::{BufferId, BufferUsage, Dispatch, ProgramId, SkinDevice};
use crate::diagnostics::{self, DiagnosticReport};
use crate::error::SkinError;
use crate::kernel::{ComputeProgram, KernelPhase, KernelSet};
use crate::params::{clamp_trail_dt, damping_factor, noise_direction, SkinGlobals, TrailGlobals, TRAIL_FLAG_ATTRACTOR};
use crate::skin_data::{decode_records, GpuTrail};
use crate::time::FrameTime;
use crate::variant::TrailFeatures;

/// When the noise field drifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoiseAdvance {
    /// Every trail dispatch advances the offset, so a frame's Update and Apply each move
    /// it once.
    #[default]
    PerDispatch,
    /// Only Update advances the offset.
    PerFrame,
}

/// Tunable trail dynamics. Mutable between frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailParams {
    /// Multiplier on the frame delta before clamping.
    pub speed: f32,
    pub speed_scale_min: f32,
    pub speed_scale_max: f32,
    pub speed_limit: f32,
    pub drag: f32,
    pub gravity: Vec3,
    pub noise_amplitude: f32,
    pub noise_frequency: f32,
    pub noise_motion: f32,
    pub noise_advance: NoiseAdvance,
    pub follow_intensity: f32,
    /// Follow delay at the first and last following bone.
    pub follow_delay: Vec2,
    /// World-space attraction target.
    pub attractor: Option<Vec3>,
    pub attractor_spread: f32,
}

impl Default for TrailParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            speed_scale_min: 2.0,
            speed_scale_max: 5.0,
            speed_limit: 1.0,
            drag: 0.1,
            gravity: Vec3::ZERO,
            noise_amplitude: 1.0,
            noise_frequency: 0.01,
            noise_motion: 1.0,
            noise_advance: NoiseAdvance::PerDispatch,
            follow_intensity: 1.0,
            follow_delay: Vec2::new(0.0, 1.0),
            attractor: None,
            attractor_spread: 1.0,
        }
    }
}

/// Host state of the trail kernels: chain constants, parameters and the noise
/// accumulator. Produces one [`TrailGlobals`] block per dispatch.
#[derive(Debug, Clone)]
pub struct TrailExtension {
    features: TrailFeatures,
    params: TrailParams,
    layout: Option<ChainLayout>,
    noise_offset: Vec3,
}

impl TrailExtension {
    pub fn new(features: TrailFeatures, params: TrailParams) -> Self {
        Self { features, params, layout: None, noise_offset: Vec3::ZERO }
    }

    /// Captures the chain constants. Must run exactly once before the first dispatch.
    pub fn configure(&mut self, layout: &ChainLayout) -> Result<()> {
        if self.layout.is_some() {
            return Err(SkinError::AlreadyInitialized.into());
        }
        self.layout = Some(*layout);
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.layout = None;
        self.noise_offset = Vec3::ZERO;
    }

    pub fn is_configured(&self) -> bool {
        self.layout.is_some()
    }

    pub fn features(&self) -> TrailFeatures {
        self.features
    }

    pub fn params(&self) -> &TrailParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut TrailParams {
        &mut self.params
    }

    pub fn noise_offset(&self) -> Vec3 {
        self.noise_offset
    }

    /// Clamps `dt`, advances the noise offset when `phase` calls for it and packs the
    /// trail block. Returns the clamped step alongside the block.
    pub fn prepare(&mut self, phase: KernelPhase, dt: f32, transform: &ChainTransform) -> Result<(f32, TrailGlobals)> {
        let layout = self.layout.ok_or(SkinError::NotInitialized)?;
        let dt = clamp_trail_dt(dt);
        let params = &self.params;
        let advances = match params.noise_advance {
            NoiseAdvance::PerDispatch => true,
            NoiseAdvance::PerFrame => phase != KernelPhase::Apply,
        };
        if advances {
            self.noise_offset += noise_direction(params.gravity) * params.noise_motion * dt;
        }

        let mut flags = self.features.flags();
        let attractor = match params.attractor {
            Some(world) if self.features.attractor => transform.inverse_transform_point(world),
            _ => {
                flags &= !TRAIL_FLAG_ATTRACTOR;
                Vec3::ZERO
            }
        };
        let globals = TrailGlobals {
            damper: [damping_factor(params.drag, dt), params.speed_limit],
            speed_range: [params.speed_scale_min, params.speed_scale_max],
            gravity: (params.gravity * dt).to_array(),
            follow_intensity: params.follow_intensity,
            noise_params: [params.noise_frequency, params.noise_amplitude * dt],
            follow_delay: params.follow_delay.to_array(),
            noise_offset: self.noise_offset.to_array(),
            attractor_spread: params.attractor_spread,
            attractor: attractor.to_array(),
            unit_length: layout.unit_length,
            bounds_min: layout.min.to_array(),
            following_bone_count: layout.following_bone_count,
            bounds_max: layout.max.to_array(),
            flags,
            center: layout.center.to_array(),
            _pad: 0.0,
        };
        Ok((dt, globals))
    }
}

struct TrailResources {
    program: ProgramId,
    kernels: KernelSet,
    trails: BufferId,
}

enum TrailState {
    Uninitialized,
    Ready(TrailResources),
    Released,
}

/// Layers the trail extension over a [`SkinAnimator`]. Trail kernels run right before
/// the base frame and drive every bone below the chain's anchors.
pub struct TrailAnimator {
    base: SkinAnimator,
    extension: TrailExtension,
    program: ComputeProgram,
    state: TrailState,
}

impl fmt::Debug for TrailAnimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrailAnimator")
            .field("base", &self.base)
            .field("extension", &self.extension)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl TrailAnimator {
    pub fn new(mut base: SkinAnimator, params: TrailParams, program: ComputeProgram) -> Result<Self> {
        let Some(features) = base.variant().trail_features() else {
            return Err(SkinError::InvalidChain(format!(
                "{} chains run without trails",
                base.variant().kind()
            ))
            .into());
        };
        base.set_external_pose(true);
        Ok(Self { base, extension: TrailExtension::new(features, params), program, state: TrailState::Uninitialized })
    }

    pub fn from_config(config: &SkinConfig, base: SkinAnimator) -> Result<Self> {
        Self::new(base, config.trail.to_params(), ComputeProgram::trails()?)
    }

    pub fn base(&self) -> &SkinAnimator {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut SkinAnimator {
        &mut self.base
    }

    pub fn extension(&self) -> &TrailExtension {
        &self.extension
    }

    pub fn params_mut(&mut self) -> &mut TrailParams {
        self.extension.params_mut()
    }

    pub fn set_attractor(&mut self, attractor: Option<Vec3>) {
        self.extension.params_mut().attractor = attractor;
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, TrailState::Ready(_))
    }

    fn resources(&self) -> Result<&TrailResources> {
        match &self.state {
            TrailState::Ready(resources) => Ok(resources),
            TrailState::Uninitialized => Err(SkinError::NotInitialized.into()),
            TrailState::Released => Err(SkinError::Released.into()),
        }
    }

    /// Initializes the base animator, then the trail buffer and Setup. A trail failure
    /// releases the base again.
    pub fn initialize(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        match self.state {
            TrailState::Ready(_) => return Err(SkinError::AlreadyInitialized.into()),
            TrailState::Released => return Err(SkinError::Released.into()),
            TrailState::Uninitialized => {}
        }
        self.base.initialize(device, transform, time)?;

        let mut acquired = AcquiredBuffers::new();
        match self.acquire(device, &mut acquired, transform, time) {
            Ok(resources) => {
                self.state = TrailState::Ready(resources);
                log::info!(
                    "[trails] {} trails ready (follow {}, attractor {})",
                    self.base.variant().kind(),
                    self.extension.features().follow,
                    self.extension.features().attractor
                );
                Ok(())
            }
            Err(err) => {
                acquired.release(device);
                self.extension.reset();
                if let Err(release_err) = self.base.teardown(device) {
                    log::warn!("[trails] Rollback of base animator failed: {release_err:?}");
                }
                Err(err)
            }
        }
    }

    fn acquire(
        &mut self,
        device: &mut dyn SkinDevice,
        acquired: &mut AcquiredBuffers,
        transform: &ChainTransform,
        time: FrameTime,
    ) -> Result<TrailResources> {
        let kernels = KernelSet::resolve(&self.program)?;
        let program = device.register_program(&self.program)?;
        let layout = *self.base.layout().ok_or(SkinError::NotInitialized)?;
        let settings = *self.base.settings();
        let slots = settings.instances_count as usize * settings.bone_count as usize;
        let trail_data = vec![GpuTrail::default(); slots];
        let trails = acquired.create(device, "trails.trails", BufferUsage::Storage, bytemuck::cast_slice(&trail_data))?;
        self.extension.configure(&layout)?;

        let resources = TrailResources { program, kernels, trails };
        dispatch_trails(
            &mut self.extension,
            &self.base,
            device,
            &resources,
            KernelPhase::Setup,
            transform,
            FrameTime::new(time.elapsed, 0.0),
        )?;
        Ok(resources)
    }

    /// Trail Update and Apply, then the base frame.
    pub fn frame(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        let resources = match &self.state {
            TrailState::Ready(resources) => resources,
            TrailState::Uninitialized => return Err(SkinError::NotInitialized.into()),
            TrailState::Released => return Err(SkinError::Released.into()),
        };
        let scaled = FrameTime::new(time.elapsed, time.delta * self.extension.params().speed);
        for phase in [KernelPhase::Update, KernelPhase::Apply] {
            dispatch_trails(&mut self.extension, &self.base, device, resources, phase, transform, scaled)?;
        }
        self.base.frame(device, transform, time)
    }

    /// Releases the trail buffer, then the base animator. Idempotent.
    pub fn release(&mut self, device: &mut dyn SkinDevice) -> Result<()> {
        let trail_result = match std::mem::replace(&mut self.state, TrailState::Released) {
            TrailState::Ready(resources) => {
                device.release_buffer(resources.trails).context("Failed to release trail buffer")
            }
            TrailState::Uninitialized => {
                self.state = TrailState::Uninitialized;
                return Ok(());
            }
            TrailState::Released => return Ok(()),
        };
        let base_result = self.base.release(device);
        log::info!("[trails] Released trail buffer");
        trail_result.and(base_result)
    }

    /// Blocking read-back of the trail buffer.
    pub fn read_trails(&self, device: &mut dyn SkinDevice) -> Result<Vec<GpuTrail>> {
        if !self.base.settings().diagnostics {
            return Err(SkinError::DiagnosticsDisabled.into());
        }
        let resources = self.resources()?;
        let bytes = device.read_buffer(resources.trails).context("Failed to read back trails")?;
        Ok(decode_records(&bytes))
    }

    pub fn inspect_trails(&self, device: &mut dyn SkinDevice) -> Result<DiagnosticReport> {
        let trails = self.read_trails(device)?;
        let report = diagnostics::scan_trails(&trails, self.base.settings().bone_count);
        report.log("trails");
        Ok(report)
    }
}

fn dispatch_trails(
    extension: &mut TrailExtension,
    base: &SkinAnimator,
    device: &mut dyn SkinDevice,
    resources: &TrailResources,
    phase: KernelPhase,
    transform: &ChainTransform,
    time: FrameTime,
) -> Result<()> {
    let (dt, trail_globals) = extension.prepare(phase, time.delta, transform)?;
    let globals = SkinGlobals::new(&base.dispatch_inputs(transform, time.elapsed, dt));
    let bones = base.bones_buffer()?;
    let kernel = resources.kernels.get(phase);
    let groups = kernel.groups_for(globals.instances_count);
    log::debug!("[trails] {} groups {:?} dt {:.4}", kernel.name(), groups, dt);
    device
        .dispatch(&Dispatch {
            program: resources.program,
            kernel,
            uniforms: &[bytemuck::bytes_of(&globals), bytemuck::bytes_of(&trail_globals)],
            buffers: &[resources.trails, bones],
            groups,
        })
        .with_context(|| format!("Failed to dispatch trails {}", kernel.name()))
}

impl Drop for TrailAnimator {
    fn drop(&mut self) {
        if let TrailState::Ready(resources) = &self.state {
            log::warn!("[trails] Animator dropped without release; trail buffer {} left to the device", resources.trails.raw());
        }
    }
}

impl SkinPipeline for TrailAnimator {
    fn initialize(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        TrailAnimator::initialize(self, device, transform, time)
    }

    fn frame(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        TrailAnimator::frame(self, device, transform, time)
    }

    fn release(&mut self, device: &mut dyn SkinDevice) -> Result<()> {
        TrailAnimator::release(self, device)
    }

    fn inspect(&self, device: &mut dyn SkinDevice) -> Result<Vec<(&'static str, DiagnosticReport)>> {
        Ok(vec![("bones", self.base.inspect_bones(device)?), ("trails", self.inspect_trails(device)?)])
    }

    fn trails_mut(&mut self) -> Option<&mut TrailAnimator> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingPolicy;
    use crate::mesh::MeshBounds;
    use crate::params::TRAIL_FLAG_FOLLOW;
    use glam::Quat;

    fn configured(features: TrailFeatures, params: TrailParams) -> TrailExtension {
        let bounds = MeshBounds::new(Vec3::new(-0.5, 0.0, -0.5), Vec3::new(0.5, 3.0, 0.5));
        let layout = ChainLayout::derive(&bounds, 5, BindingPolicy::FollowDelay).expect("layout");
        let mut extension = TrailExtension::new(features, params);
        extension.configure(&layout).expect("configure");
        extension
    }

    #[test]
    fn prepare_requires_configuration() {
        let mut extension = TrailExtension::new(TrailFeatures::default(), TrailParams::default());
        let err = extension.prepare(KernelPhase::Update, 0.016, &ChainTransform::IDENTITY).unwrap_err();
        assert_eq!(err.downcast_ref::<SkinError>(), Some(&SkinError::NotInitialized));
    }

    #[test]
    fn configure_runs_once() {
        let mut extension = configured(TrailFeatures::default(), TrailParams::default());
        let layout = extension.layout.expect("layout");
        assert!(extension.configure(&layout).is_err());
    }

    #[test]
    fn per_dispatch_parameters() {
        let params = TrailParams { drag: 0.1, gravity: Vec3::new(0.0, -2.0, 0.0), ..TrailParams::default() };
        let mut extension = configured(TrailFeatures::default(), params);
        let (dt, globals) = extension.prepare(KernelPhase::Update, 0.5, &ChainTransform::IDENTITY).expect("prepare");
        assert_eq!(dt, 0.1);
        assert!((globals.damper[0] - (-0.01f32).exp()).abs() < 1e-6);
        assert_eq!(globals.damper[1], 1.0);
        assert!((globals.gravity[1] + 0.2).abs() < 1e-6);
        assert!((globals.noise_params[1] - 0.1).abs() < 1e-6);
        assert_eq!(globals.speed_range, [2.0, 5.0]);
        assert_eq!(globals.following_bone_count, 3);
        assert!((globals.noise_offset[1] + 0.1).abs() < 1e-6, "noise drifts along gravity");
    }

    #[test]
    fn noise_advance_policies() {
        let mut doubled = configured(TrailFeatures::default(), TrailParams::default());
        let mut single =
            configured(TrailFeatures::default(), TrailParams { noise_advance: NoiseAdvance::PerFrame, ..Default::default() });
        for extension in [&mut doubled, &mut single] {
            extension.prepare(KernelPhase::Setup, 0.0, &ChainTransform::IDENTITY).expect("setup");
            extension.prepare(KernelPhase::Update, 0.05, &ChainTransform::IDENTITY).expect("update");
            extension.prepare(KernelPhase::Apply, 0.05, &ChainTransform::IDENTITY).expect("apply");
        }
        assert!(doubled.noise_offset().abs_diff_eq(Vec3::new(0.0, 0.1, 0.0), 1e-6));
        assert!(single.noise_offset().abs_diff_eq(Vec3::new(0.0, 0.05, 0.0), 1e-6));
    }

    #[test]
    fn attractor_is_sent_in_local_space() {
        let features = TrailFeatures { follow: true, attractor: true };
        let params = TrailParams { attractor: Some(Vec3::new(5.0, 1.0, 0.0)), ..TrailParams::default() };
        let mut extension = configured(features, params);
        let owner = ChainTransform::from_translation(Vec3::new(2.0, 0.0, 0.0)).with_rotation(Quat::from_rotation_y(0.3));
        let (_, globals) = extension.prepare(KernelPhase::Update, 0.016, &owner).expect("prepare");
        let expected = owner.inverse_transform_point(Vec3::new(5.0, 1.0, 0.0));
        assert!(Vec3::from_array(globals.attractor).abs_diff_eq(expected, 1e-5));
        assert_eq!(globals.flags, TRAIL_FLAG_FOLLOW | TRAIL_FLAG_ATTRACTOR);

        extension.params_mut().attractor = None;
        let (_, globals) = extension.prepare(KernelPhase::Update, 0.016, &owner).expect("prepare");
        assert_eq!(globals.flags, TRAIL_FLAG_FOLLOW);
    }
}
