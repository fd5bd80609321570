use anyhow::{Context, Result};
use glam::Mat4;
use std::fmt;

use crate::chain::{ChainLayout, ChainTransform};
use crate::config::SkinConfig;
use crate::device::{BufferId, BufferUsage, Dispatch, DrawBounds, IndirectDraw, MeshId, ProgramId, SkinDevice};
use crate::diagnostics::{self, DiagnosticReport};
use crate::error::SkinError;
use crate::kernel::{ComputeProgram, KernelPhase, KernelSet};
use crate::mesh::Mesh;
use crate::params::{BindMatrices, DispatchInputs, MaterialUniforms, SkinGlobals, SKIN_FLAG_EXTERNAL_POSE};
use crate::skin_data::{decode_records, DrawIndexedIndirectArgs, GpuBone};
use crate::time::FrameTime;
use crate::trails::TrailAnimator;
use crate::variant::ChainVariant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnimatorSettings {
    pub instances_count: u32,
    pub bone_count: u32,
    /// Allows blocking read-back through `inspect_*`.
    pub diagnostics: bool,
}

impl AnimatorSettings {
    pub fn from_config(config: &SkinConfig) -> Self {
        Self {
            instances_count: config.instances_count,
            bone_count: config.bone_count,
            diagnostics: config.diagnostics.enabled,
        }
    }
}

/// Buffers acquired during a multi-step initialization. Released newest first when a
/// later step fails.
pub(crate) struct AcquiredBuffers {
    buffers: Vec<BufferId>,
}

impl AcquiredBuffers {
    pub(crate) fn new() -> Self {
        Self { buffers: Vec::new() }
    }

    pub(crate) fn create(
        &mut self,
        device: &mut dyn SkinDevice,
        label: &str,
        usage: BufferUsage,
        contents: &[u8],
    ) -> Result<BufferId> {
        let buffer =
            device.create_buffer(label, usage, contents).with_context(|| format!("Failed to create buffer '{label}'"))?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    pub(crate) fn release(self, device: &mut dyn SkinDevice) {
        for buffer in self.buffers.into_iter().rev() {
            if let Err(err) = device.release_buffer(buffer) {
                log::warn!("[procskin] Failed to release buffer {} during rollback: {err:?}", buffer.raw());
            }
        }
    }
}

struct SkinResources {
    program: ProgramId,
    kernels: KernelSet,
    mesh: MeshId,
    args: BufferId,
    weights: BufferId,
    bones: BufferId,
    layout: ChainLayout,
}

enum AnimatorState {
    Uninitialized,
    Ready(Box<SkinResources>),
    Released,
}

/// Drives one group of procedural bone chains: owns the args, weight and bone buffers,
/// runs the Setup/Update/Apply kernels and submits the indirect draw.
pub struct SkinAnimator {
    variant: Box<dyn ChainVariant>,
    program: ComputeProgram,
    mesh: Mesh,
    settings: AnimatorSettings,
    bind: BindMatrices,
    flags: u32,
    state: AnimatorState,
}

impl SkinAnimator {
    pub fn new(variant: Box<dyn ChainVariant>, mesh: Mesh, settings: AnimatorSettings, program: ComputeProgram) -> Self {
        Self {
            variant,
            program,
            mesh,
            settings,
            bind: BindMatrices::from_matrix(Mat4::IDENTITY),
            flags: 0,
            state: AnimatorState::Uninitialized,
        }
    }

    pub fn from_config(config: &SkinConfig, mesh: Mesh) -> Result<Self> {
        config.validate()?;
        let program = ComputeProgram::skin()?;
        Ok(Self::new(config.variant.build(), mesh, AnimatorSettings::from_config(config), program))
    }

    pub fn variant(&self) -> &dyn ChainVariant {
        self.variant.as_ref()
    }

    pub fn settings(&self) -> &AnimatorSettings {
        &self.settings
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, AnimatorState::Ready(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, AnimatorState::Released)
    }

    pub fn layout(&self) -> Option<&ChainLayout> {
        match &self.state {
            AnimatorState::Ready(resources) => Some(&resources.layout),
            _ => None,
        }
    }

    pub fn bind_matrices(&self) -> BindMatrices {
        self.bind
    }

    /// Overrides the bind pose. Takes effect from the next dispatch.
    pub fn set_bind_matrix(&mut self, matrix: Mat4) {
        self.bind = BindMatrices::from_matrix(matrix);
    }

    /// Chains below the root are posed by an extension program.
    pub(crate) fn set_external_pose(&mut self, external: bool) {
        if external {
            self.flags |= SKIN_FLAG_EXTERNAL_POSE;
        } else {
            self.flags &= !SKIN_FLAG_EXTERNAL_POSE;
        }
    }

    pub(crate) fn bones_buffer(&self) -> Result<BufferId> {
        Ok(self.resources()?.bones)
    }

    pub(crate) fn dispatch_inputs(&self, transform: &ChainTransform, elapsed: f32, dt: f32) -> DispatchInputs {
        DispatchInputs {
            instances_count: self.settings.instances_count,
            bones_count: self.settings.bone_count,
            elapsed,
            dt,
            world_to_local: transform.world_to_local(),
            local_to_world: transform.local_to_world(),
            bind: self.bind,
            flags: self.flags,
        }
    }

    fn resources(&self) -> Result<&SkinResources> {
        match &self.state {
            AnimatorState::Ready(resources) => Ok(resources.as_ref()),
            AnimatorState::Uninitialized => Err(SkinError::NotInitialized.into()),
            AnimatorState::Released => Err(SkinError::Released.into()),
        }
    }

    /// Builds and uploads the chain data, then primes the pipeline with Setup (dt 0)
    /// and one Update. On failure everything acquired so far is released again and the
    /// animator stays uninitialized.
    pub fn initialize(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        match self.state {
            AnimatorState::Ready(_) => return Err(SkinError::AlreadyInitialized.into()),
            AnimatorState::Released => return Err(SkinError::Released.into()),
            AnimatorState::Uninitialized => {}
        }
        if self.settings.instances_count == 0 {
            return Err(SkinError::InvalidChain("instances_count must be at least 1".into()).into());
        }
        let layout = self.variant.layout(&self.mesh.bounds, self.settings.bone_count)?;
        let kernels = KernelSet::resolve(&self.program)?;
        let program = device.register_program(&self.program)?;

        let mut acquired = AcquiredBuffers::new();
        let resources = match self.acquire(device, &mut acquired, program, kernels, layout, transform) {
            Ok(resources) => resources,
            Err(err) => {
                acquired.release(device);
                return Err(err);
            }
        };
        self.bind = BindMatrices::from_matrix(transform.local_to_world());
        self.state = AnimatorState::Ready(Box::new(resources));

        let setup = self.dispatch_inputs(transform, time.elapsed, 0.0);
        let update = self.dispatch_inputs(transform, time.elapsed, time.delta);
        let primed = self
            .dispatch(device, KernelPhase::Setup, &setup)
            .and_then(|_| self.dispatch(device, KernelPhase::Update, &update));
        if let Err(err) = primed {
            if let Err(release_err) = self.teardown(device) {
                log::warn!("[procskin] Rollback after failed priming: {release_err:?}");
            }
            return Err(err);
        }

        log::info!(
            "[procskin] {} chains ready: {} instances x {} bones, {} vertices",
            self.variant.kind(),
            self.settings.instances_count,
            self.settings.bone_count,
            self.mesh.vertex_count()
        );
        Ok(())
    }

    fn acquire(
        &self,
        device: &mut dyn SkinDevice,
        acquired: &mut AcquiredBuffers,
        program: ProgramId,
        kernels: KernelSet,
        layout: ChainLayout,
        transform: &ChainTransform,
    ) -> Result<SkinResources> {
        let instances = self.settings.instances_count;
        let args_data = DrawIndexedIndirectArgs::new(self.mesh.index_count(), instances);
        let args = acquired.create(device, "procskin.args", BufferUsage::Indirect, bytemuck::bytes_of(&args_data))?;

        let weight_data = self.variant.build_weights(&self.mesh, &layout)?;
        let weights = acquired.create(device, "procskin.weights", BufferUsage::Storage, bytemuck::cast_slice(&weight_data))?;

        let bone_data = self.variant.build_bones(&layout, instances, transform);
        let bones = acquired.create(device, "procskin.bones", BufferUsage::Storage, bytemuck::cast_slice(&bone_data))?;

        let mesh = device.upload_mesh(&self.mesh).context("Failed to upload skin mesh")?;
        Ok(SkinResources { program, kernels, mesh, args, weights, bones, layout })
    }

    fn dispatch(&self, device: &mut dyn SkinDevice, phase: KernelPhase, inputs: &DispatchInputs) -> Result<()> {
        let resources = self.resources()?;
        let kernel = resources.kernels.get(phase);
        let globals = SkinGlobals::new(inputs);
        let groups = kernel.groups_for(inputs.instances_count);
        log::debug!("[procskin] {} groups {:?} dt {:.4}", kernel.name(), groups, inputs.dt);
        device
            .dispatch(&Dispatch {
                program: resources.program,
                kernel,
                uniforms: &[bytemuck::bytes_of(&globals)],
                buffers: &[resources.bones],
                groups,
            })
            .with_context(|| format!("Failed to dispatch procskin {}", kernel.name()))
    }

    /// Update, Apply, then one indirect draw covering every instance.
    pub fn frame(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        self.resources()?;
        let inputs = self.dispatch_inputs(transform, time.elapsed, time.delta);
        self.dispatch(device, KernelPhase::Update, &inputs)?;
        self.dispatch(device, KernelPhase::Apply, &inputs)?;

        // next frame's kernels measure owner motion from here
        self.bind.inverse = transform.world_to_local();

        let resources = self.resources()?;
        let material = MaterialUniforms::new(
            &self.bind,
            transform.world_to_local(),
            transform.local_to_world(),
            self.settings.bone_count,
        );
        device
            .draw_indexed_indirect(&IndirectDraw {
                mesh: resources.mesh,
                args: resources.args,
                weights: resources.weights,
                bones: resources.bones,
                material: &material,
                bounds: DrawBounds::unbounded(),
            })
            .context("Failed to submit procskin draw")
    }

    /// Releases the mesh and buffers, newest first, and returns to `Uninitialized`. Keeps
    /// going after a failed release and reports the first error.
    pub(crate) fn teardown(&mut self, device: &mut dyn SkinDevice) -> Result<()> {
        let state = std::mem::replace(&mut self.state, AnimatorState::Uninitialized);
        let resources = match state {
            AnimatorState::Ready(resources) => resources,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let mut first_error = None;
        if let Err(err) = device.release_mesh(resources.mesh) {
            log::warn!("[procskin] Failed to release mesh {}: {err:?}", resources.mesh.raw());
            first_error.get_or_insert(err);
        }
        for buffer in [resources.bones, resources.weights, resources.args] {
            if let Err(err) = device.release_buffer(buffer) {
                log::warn!("[procskin] Failed to release buffer {}: {err:?}", buffer.raw());
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Idempotent. Releasing an animator that was never initialized is a no-op.
    pub fn release(&mut self, device: &mut dyn SkinDevice) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }
        let result = self.teardown(device);
        self.state = AnimatorState::Released;
        log::info!("[procskin] Released {} chains", self.variant.kind());
        result
    }

    /// Blocking read-back of the bone buffer.
    pub fn read_bones(&self, device: &mut dyn SkinDevice) -> Result<Vec<GpuBone>> {
        if !self.settings.diagnostics {
            return Err(SkinError::DiagnosticsDisabled.into());
        }
        let resources = self.resources()?;
        let bytes = device.read_buffer(resources.bones).context("Failed to read back bones")?;
        Ok(decode_records(&bytes))
    }

    pub fn inspect_bones(&self, device: &mut dyn SkinDevice) -> Result<DiagnosticReport> {
        let bones = self.read_bones(device)?;
        let report = diagnostics::scan_bones(&bones, self.settings.bone_count);
        report.log("bones");
        Ok(report)
    }
}

impl fmt::Debug for SkinAnimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkinAnimator")
            .field("variant", &self.variant)
            .field("program", &self.program.label())
            .field("settings", &self.settings)
            .field("ready", &self.is_ready())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl Drop for SkinAnimator {
    fn drop(&mut self) {
        if let AnimatorState::Ready(resources) = &self.state {
            log::warn!(
                "[procskin] Animator dropped without release; mesh {} and buffers {:?} left to the device",
                resources.mesh.raw(),
                [resources.args.raw(), resources.weights.raw(), resources.bones.raw()]
            );
        }
    }
}

/// Lifecycle shared by the plain and trail-driven animators.
pub trait SkinPipeline {
    fn initialize(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()>;
    fn frame(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()>;
    fn release(&mut self, device: &mut dyn SkinDevice) -> Result<()>;
    /// Blocking read-back of every buffer the pipeline checks.
    fn inspect(&self, device: &mut dyn SkinDevice) -> Result<Vec<(&'static str, DiagnosticReport)>>;

    fn trails_mut(&mut self) -> Option<&mut TrailAnimator> {
        None
    }
}

impl SkinPipeline for SkinAnimator {
    fn initialize(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        SkinAnimator::initialize(self, device, transform, time)
    }

    fn frame(&mut self, device: &mut dyn SkinDevice, transform: &ChainTransform, time: FrameTime) -> Result<()> {
        SkinAnimator::frame(self, device, transform, time)
    }

    fn release(&mut self, device: &mut dyn SkinDevice) -> Result<()> {
        SkinAnimator::release(self, device)
    }

    fn inspect(&self, device: &mut dyn SkinDevice) -> Result<Vec<(&'static str, DiagnosticReport)>> {
        Ok(vec![("bones", self.inspect_bones(device)?)])
    }
}

/// Picks the animator the configured variant needs.
pub fn build_pipeline(config: &SkinConfig, mesh: Mesh) -> Result<Box<dyn SkinPipeline>> {
    let base = SkinAnimator::from_config(config, mesh)?;
    if base.variant().trail_features().is_some() {
        Ok(Box::new(TrailAnimator::from_config(config, base)?))
    } else {
        Ok(Box::new(base))
    }
}
