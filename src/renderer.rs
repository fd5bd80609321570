use anyhow::{anyhow, bail, Context, Result};
use glam::Mat4;
use std::collections::HashMap;
use std::sync::mpsc;
use wgpu::util::DeviceExt;

use crate::device::{BufferId, BufferUsage, Dispatch, IndirectDraw, MeshId, ProgramId, SkinDevice};
use crate::error::SkinError;
use crate::kernel::ComputeProgram;
use crate::mesh::Mesh;

mod compute_pass;
mod skin_pass;

use compute_pass::ProgramPipelines;
use skin_pass::{SkinDrawTargets, SkinPass};

pub(crate) struct GpuBuffer {
    label: String,
    buffer: wgpu::Buffer,
    size: u64,
}

pub(crate) struct MeshBuffers {
    vertex: wgpu::Buffer,
    index: wgpu::Buffer,
    index_count: u32,
}

/// Headless wgpu backend. Compute dispatches and skin draws are submitted immediately and
/// land in an offscreen color target.
pub struct WgpuSkinDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    buffers: HashMap<BufferId, GpuBuffer>,
    next_buffer: u32,
    programs: Vec<ProgramPipelines>,
    meshes: HashMap<MeshId, MeshBuffers>,
    next_mesh: u32,
    skin_pass: SkinPass,
    draws: u64,
}

impl WgpuSkinDevice {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        pollster::block_on(Self::init(width, height))
    }

    async fn init(width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to find a GPU adapter")?;
        let downlevel = adapter.get_downlevel_capabilities();
        let required = wgpu::DownlevelFlags::COMPUTE_SHADERS
            | wgpu::DownlevelFlags::VERTEX_STORAGE
            | wgpu::DownlevelFlags::INDIRECT_EXECUTION;
        if !downlevel.flags.contains(required) {
            bail!(
                "Adapter '{}' lacks compute, vertex storage or indirect draw support ({:?})",
                adapter.get_info().name,
                downlevel.flags
            );
        }
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Procskin Device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) = adapter.request_device(&device_desc).await.context("Failed to create GPU device")?;
        let adapter_info = adapter.get_info();
        log::info!("[renderer] using {} ({:?})", adapter_info.name, adapter_info.backend);
        let skin_pass = SkinPass::new(&device, width, height);
        Ok(Self {
            device,
            queue,
            adapter_info,
            buffers: HashMap::new(),
            next_buffer: 0,
            programs: Vec::new(),
            meshes: HashMap::new(),
            next_mesh: 0,
            skin_pass,
            draws: 0,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn target_size(&self) -> (u32, u32) {
        self.skin_pass.size()
    }

    pub fn set_view_projection(&mut self, view_proj: Mat4) {
        self.skin_pass.set_view_projection(view_proj);
    }

    /// Marks a frame boundary; the first draw after this clears the target.
    pub fn begin_frame(&mut self) {
        self.skin_pass.begin_frame();
    }

    pub fn draws_submitted(&self) -> u64 {
        self.draws
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_meshes(&self) -> usize {
        self.meshes.len()
    }
}

fn lookup(buffers: &HashMap<BufferId, GpuBuffer>, id: BufferId) -> Result<&GpuBuffer> {
    buffers.get(&id).ok_or_else(|| SkinError::UnknownHandle { kind: "buffer", id: id.raw() }.into())
}

impl SkinDevice for WgpuSkinDevice {
    fn create_buffer(&mut self, label: &str, usage: BufferUsage, contents: &[u8]) -> Result<BufferId> {
        if contents.is_empty() {
            bail!("Failed to create buffer '{label}': no contents");
        }
        let usage = match usage {
            BufferUsage::Storage => wgpu::BufferUsages::STORAGE,
            BufferUsage::Indirect => wgpu::BufferUsages::INDIRECT,
        } | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage,
        });
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        log::debug!("[renderer] buffer {} '{label}' ({} bytes)", id.raw(), contents.len());
        self.buffers.insert(id, GpuBuffer { label: label.to_string(), buffer, size: contents.len() as u64 });
        Ok(id)
    }

    fn release_buffer(&mut self, buffer: BufferId) -> Result<()> {
        let released =
            self.buffers.remove(&buffer).ok_or(SkinError::UnknownHandle { kind: "buffer", id: buffer.raw() })?;
        log::debug!("[renderer] released '{}'", released.label);
        released.buffer.destroy();
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId) -> Result<Vec<u8>> {
        let source = lookup(&self.buffers, buffer)?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Procskin Read-back"),
            size: source.size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder =
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Read-back Encoder") });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, source.size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .context("Failed to wait for read-back")?;
        rx.recv()
            .map_err(|_| anyhow!("Read-back of '{}' was dropped", source.label))?
            .with_context(|| format!("Failed to map '{}'", source.label))?;
        let view = slice.get_mapped_range();
        let bytes = view.to_vec();
        drop(view);
        staging.unmap();
        Ok(bytes)
    }

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<MeshId> {
        if mesh.vertices.is_empty() || mesh.indices.is_empty() {
            bail!("Failed to upload mesh: it has no triangles");
        }
        let vertex = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Skin Mesh Vertices"),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Skin Mesh Indices"),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        let id = MeshId(self.next_mesh);
        self.next_mesh += 1;
        self.meshes.insert(id, MeshBuffers { vertex, index, index_count: mesh.index_count() });
        Ok(id)
    }

    fn release_mesh(&mut self, mesh: MeshId) -> Result<()> {
        let released = self.meshes.remove(&mesh).ok_or(SkinError::UnknownHandle { kind: "mesh", id: mesh.raw() })?;
        log::debug!("[renderer] released mesh {}", mesh.raw());
        released.vertex.destroy();
        released.index.destroy();
        Ok(())
    }

    fn register_program(&mut self, program: &ComputeProgram) -> Result<ProgramId> {
        if let Some(index) = self.programs.iter().position(|known| known.label() == program.label()) {
            return Ok(ProgramId(index as u32));
        }
        let pipelines = ProgramPipelines::new(&self.device, program)?;
        self.programs.push(pipelines);
        Ok(ProgramId(self.programs.len() as u32 - 1))
    }

    fn dispatch(&mut self, dispatch: &Dispatch<'_>) -> Result<()> {
        let program = self
            .programs
            .get(dispatch.program.0 as usize)
            .ok_or(SkinError::UnknownHandle { kind: "program", id: dispatch.program.0 })?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Procskin Compute Encoder") });
        program.encode(&self.device, &self.queue, &mut encoder, dispatch, &self.buffers)?;
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn draw_indexed_indirect(&mut self, draw: &IndirectDraw<'_>) -> Result<()> {
        let mesh =
            self.meshes.get(&draw.mesh).ok_or(SkinError::UnknownHandle { kind: "mesh", id: draw.mesh.0 })?;
        let targets = SkinDrawTargets {
            mesh,
            args: &lookup(&self.buffers, draw.args)?.buffer,
            weights: &lookup(&self.buffers, draw.weights)?.buffer,
            bones: &lookup(&self.buffers, draw.bones)?.buffer,
        };
        log::trace!(
            "[renderer] indirect draw of {} indices, bounds {:?} +/- {:?}",
            mesh.index_count,
            draw.bounds.center,
            draw.bounds.size
        );
        let mut encoder =
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Skin Encoder") });
        self.skin_pass.encode(&self.device, &self.queue, &mut encoder, draw, targets);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.draws += 1;
        Ok(())
    }
}
