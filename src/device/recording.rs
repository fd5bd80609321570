use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet};

use super::{BufferId, BufferUsage, Dispatch, DrawBounds, IndirectDraw, MeshId, ProgramId, SkinDevice};
use crate::error::SkinError;
use crate::kernel::{BindingSlot, ComputeProgram};
use crate::mesh::Mesh;
use crate::params::{MaterialUniforms, SkinGlobals, TrailGlobals};

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    CreateBuffer { buffer: BufferId, label: String, usage: BufferUsage, size: usize },
    ReleaseBuffer { buffer: BufferId },
    ReadBuffer { buffer: BufferId },
    UploadMesh { mesh: MeshId, index_count: u32 },
    ReleaseMesh { mesh: MeshId },
    RegisterProgram { program: ProgramId, label: String },
    Dispatch { program: String, kernel: String, groups: [u32; 3], uniforms: Vec<Vec<u8>>, buffers: Vec<BufferId> },
    Draw { mesh: MeshId, args: BufferId, weights: BufferId, bones: BufferId, material: MaterialUniforms, bounds: DrawBounds },
}

impl DeviceCommand {
    pub fn kernel(&self) -> Option<(&str, &str)> {
        match self {
            DeviceCommand::Dispatch { program, kernel, .. } => Some((program.as_str(), kernel.as_str())),
            _ => None,
        }
    }

    pub fn skin_globals(&self) -> Option<SkinGlobals> {
        self.uniform_block(0)
    }

    /// Trail programs bind their own block right after the shared globals.
    pub fn trail_globals(&self) -> Option<TrailGlobals> {
        self.uniform_block(1)
    }

    fn uniform_block<T: bytemuck::Pod>(&self, slot: usize) -> Option<T> {
        let DeviceCommand::Dispatch { uniforms, .. } = self else {
            return None;
        };
        let bytes = uniforms.get(slot)?;
        (bytes.len() == std::mem::size_of::<T>()).then(|| bytemuck::pod_read_unaligned(bytes))
    }
}

struct RecordedBuffer {
    label: String,
    usage: BufferUsage,
    data: Vec<u8>,
}

struct RecordedProgram {
    label: String,
    layout: Vec<BindingSlot>,
}

/// In-memory device that validates handles and bindings and logs every command. Kernels
/// never run, so buffer contents only change through [`RecordingDevice::write_buffer`].
#[derive(Default)]
pub struct RecordingDevice {
    commands: Vec<DeviceCommand>,
    buffers: BTreeMap<BufferId, RecordedBuffer>,
    programs: Vec<RecordedProgram>,
    meshes: BTreeSet<MeshId>,
    next_mesh: u32,
    next_buffer: u32,
    fail_label: Option<String>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DeviceCommand> {
        std::mem::take(&mut self.commands)
    }

    /// `(program, kernel)` pairs of every dispatch so far.
    pub fn dispatch_sequence(&self) -> Vec<(String, String)> {
        self.commands
            .iter()
            .filter_map(DeviceCommand::kernel)
            .map(|(program, kernel)| (program.to_string(), kernel.to_string()))
            .collect()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_meshes(&self) -> usize {
        self.meshes.len()
    }

    pub fn buffer_label(&self, buffer: BufferId) -> Option<&str> {
        self.buffers.get(&buffer).map(|recorded| recorded.label.as_str())
    }

    pub fn buffer_usage(&self, buffer: BufferId) -> Option<BufferUsage> {
        self.buffers.get(&buffer).map(|recorded| recorded.usage)
    }

    pub fn buffer_data(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|recorded| recorded.data.as_slice())
    }

    /// Stands in for kernel writes.
    pub fn write_buffer(&mut self, buffer: BufferId, offset: usize, bytes: &[u8]) -> Result<()> {
        let recorded = self.buffers.get_mut(&buffer).ok_or(SkinError::UnknownHandle { kind: "buffer", id: buffer.0 })?;
        let end = offset + bytes.len();
        if end > recorded.data.len() {
            bail!("write of {} bytes at {offset} overflows buffer '{}'", bytes.len(), recorded.label);
        }
        recorded.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Makes the next `create_buffer` with this label fail.
    pub fn fail_buffer_creation(&mut self, label: impl Into<String>) {
        self.fail_label = Some(label.into());
    }

    fn program(&self, program: ProgramId) -> Result<&RecordedProgram> {
        self.programs
            .get(program.0 as usize)
            .ok_or_else(|| SkinError::UnknownHandle { kind: "program", id: program.0 }.into())
    }

    fn ensure_buffer(&self, buffer: BufferId) -> Result<()> {
        if self.buffers.contains_key(&buffer) {
            Ok(())
        } else {
            Err(SkinError::UnknownHandle { kind: "buffer", id: buffer.0 }.into())
        }
    }
}

impl SkinDevice for RecordingDevice {
    fn create_buffer(&mut self, label: &str, usage: BufferUsage, contents: &[u8]) -> Result<BufferId> {
        if self.fail_label.as_deref() == Some(label) {
            self.fail_label = None;
            bail!("injected allocation failure for '{label}'");
        }
        let buffer = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(buffer, RecordedBuffer { label: label.to_string(), usage, data: contents.to_vec() });
        self.commands.push(DeviceCommand::CreateBuffer { buffer, label: label.to_string(), usage, size: contents.len() });
        Ok(buffer)
    }

    fn release_buffer(&mut self, buffer: BufferId) -> Result<()> {
        if self.buffers.remove(&buffer).is_none() {
            return Err(SkinError::UnknownHandle { kind: "buffer", id: buffer.0 }.into());
        }
        self.commands.push(DeviceCommand::ReleaseBuffer { buffer });
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId) -> Result<Vec<u8>> {
        let data = self
            .buffers
            .get(&buffer)
            .map(|recorded| recorded.data.clone())
            .ok_or(SkinError::UnknownHandle { kind: "buffer", id: buffer.0 })?;
        self.commands.push(DeviceCommand::ReadBuffer { buffer });
        Ok(data)
    }

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<MeshId> {
        let id = MeshId(self.next_mesh);
        self.next_mesh += 1;
        self.meshes.insert(id);
        self.commands.push(DeviceCommand::UploadMesh { mesh: id, index_count: mesh.index_count() });
        Ok(id)
    }

    fn release_mesh(&mut self, mesh: MeshId) -> Result<()> {
        if !self.meshes.remove(&mesh) {
            return Err(SkinError::UnknownHandle { kind: "mesh", id: mesh.0 }.into());
        }
        self.commands.push(DeviceCommand::ReleaseMesh { mesh });
        Ok(())
    }

    fn register_program(&mut self, program: &ComputeProgram) -> Result<ProgramId> {
        if let Some(index) = self.programs.iter().position(|known| known.label == program.label()) {
            return Ok(ProgramId(index as u32));
        }
        let id = ProgramId(self.programs.len() as u32);
        self.programs.push(RecordedProgram { label: program.label().to_string(), layout: program.layout().to_vec() });
        self.commands.push(DeviceCommand::RegisterProgram { program: id, label: program.label().to_string() });
        Ok(id)
    }

    fn dispatch(&mut self, dispatch: &Dispatch<'_>) -> Result<()> {
        let program = self.program(dispatch.program)?;
        let supplied = dispatch.uniforms.len() + dispatch.buffers.len();
        if supplied != program.layout.len() {
            return Err(SkinError::BindingMismatch {
                program: program.label.clone(),
                expected: program.layout.len(),
                actual: supplied,
            }
            .into());
        }
        for (slot, bytes) in program.layout.iter().zip(dispatch.uniforms.iter()) {
            match slot {
                BindingSlot::Uniform { size } if *size == bytes.len() as u64 => {}
                other => bail!("uniform of {} bytes does not fit slot {other:?} of '{}'", bytes.len(), program.label),
            }
        }
        let label = program.label.clone();
        for buffer in dispatch.buffers {
            self.ensure_buffer(*buffer)?;
        }
        self.commands.push(DeviceCommand::Dispatch {
            program: label,
            kernel: dispatch.kernel.name().to_string(),
            groups: dispatch.groups,
            uniforms: dispatch.uniforms.iter().map(|bytes| bytes.to_vec()).collect(),
            buffers: dispatch.buffers.to_vec(),
        });
        Ok(())
    }

    fn draw_indexed_indirect(&mut self, draw: &IndirectDraw<'_>) -> Result<()> {
        if !self.meshes.contains(&draw.mesh) {
            return Err(SkinError::UnknownHandle { kind: "mesh", id: draw.mesh.0 }.into());
        }
        for buffer in [draw.args, draw.weights, draw.bones] {
            self.ensure_buffer(buffer)?;
        }
        self.commands.push(DeviceCommand::Draw {
            mesh: draw.mesh,
            args: draw.args,
            weights: draw.weights,
            bones: draw.bones,
            material: *draw.material,
            bounds: draw.bounds,
        });
        Ok(())
    }
}
