use anyhow::Result;
use glam::Vec3;

use crate::kernel::{ComputeProgram, KernelHandle};
use crate::mesh::Mesh;
use crate::params::MaterialUniforms;

mod recording;

pub use recording::{DeviceCommand, RecordingDevice};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub(crate) u32);

impl BufferId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl MeshId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Structured data read/written by kernels and read by the skin material.
    Storage,
    /// Indexed indirect draw arguments.
    Indirect,
}

/// One compute dispatch. Uniform blocks bind first, then storage buffers, following the
/// program's declared layout.
pub struct Dispatch<'a> {
    pub program: ProgramId,
    pub kernel: &'a KernelHandle,
    pub uniforms: &'a [&'a [u8]],
    pub buffers: &'a [BufferId],
    pub groups: [u32; 3],
}

/// Culling volume submitted with a draw. Instance positions only exist on the device,
/// so callers pass a volume large enough to never cull.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawBounds {
    pub center: Vec3,
    pub size: Vec3,
}

impl DrawBounds {
    pub const UNBOUNDED_EXTENT: f32 = 1000.0;

    pub fn unbounded() -> Self {
        Self { center: Vec3::ZERO, size: Vec3::splat(Self::UNBOUNDED_EXTENT) }
    }
}

/// One indexed indirect instanced draw of the skin material.
pub struct IndirectDraw<'a> {
    pub mesh: MeshId,
    pub args: BufferId,
    pub weights: BufferId,
    pub bones: BufferId,
    pub material: &'a MaterialUniforms,
    pub bounds: DrawBounds,
}

/// Everything the animators need from the GPU. Dispatches are issued in call order and
/// the effects of one are visible to the next; only `read_buffer` blocks on the device.
pub trait SkinDevice {
    fn create_buffer(&mut self, label: &str, usage: BufferUsage, contents: &[u8]) -> Result<BufferId>;
    fn release_buffer(&mut self, buffer: BufferId) -> Result<()>;
    fn read_buffer(&mut self, buffer: BufferId) -> Result<Vec<u8>>;
    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<MeshId>;
    fn release_mesh(&mut self, mesh: MeshId) -> Result<()>;
    /// Registering the same program label twice returns the existing id.
    fn register_program(&mut self, program: &ComputeProgram) -> Result<ProgramId>;
    fn dispatch(&mut self, dispatch: &Dispatch<'_>) -> Result<()>;
    fn draw_indexed_indirect(&mut self, draw: &IndirectDraw<'_>) -> Result<()>;
}
