use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;

use crate::device::{BufferId, Dispatch};
use crate::error::SkinError;
use crate::kernel::{BindingSlot, ComputeProgram};

use super::GpuBuffer;

/// Device-side state of one registered compute program: its group-0 layout, one
/// pipeline per entry point and a uniform buffer for every uniform slot.
pub(super) struct ProgramPipelines {
    label: String,
    layout: Vec<BindingSlot>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: Vec<wgpu::ComputePipeline>,
    uniforms: Vec<Option<wgpu::Buffer>>,
}

impl ProgramPipelines {
    pub(super) fn new(device: &wgpu::Device, program: &ComputeProgram) -> Result<Self> {
        let label = program.label().to_string();
        let entries: Vec<_> = program
            .layout()
            .iter()
            .enumerate()
            .map(|(binding, slot)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: match *slot {
                    BindingSlot::Uniform { size } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(size),
                    },
                    BindingSlot::Storage { read_only } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                },
                count: None,
            })
            .collect();
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label} Bind Group Layout")),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label} Pipeline Layout")),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Wgsl(program.source().into()),
        });
        let pipelines = program
            .entry_points()
            .iter()
            .map(|entry| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&format!("{label}::{}", entry.name)),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(&entry.name),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .collect();
        let uniforms = program
            .layout()
            .iter()
            .enumerate()
            .map(|(binding, slot)| match *slot {
                BindingSlot::Uniform { size } => Some(device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("{label} Uniform {binding}")),
                    size,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })),
                BindingSlot::Storage { .. } => None,
            })
            .collect();
        log::debug!("[kernel] built '{label}' with {} entry points", program.entry_points().len());
        Ok(Self { label, layout: program.layout().to_vec(), bind_group_layout, pipelines, uniforms })
    }

    pub(super) fn label(&self) -> &str {
        &self.label
    }

    /// Uploads the uniform blocks and records the dispatch into `encoder`. Uniform writes
    /// land at the next submit, so callers submit once per dispatch.
    pub(super) fn encode(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        dispatch: &Dispatch<'_>,
        buffers: &HashMap<BufferId, GpuBuffer>,
    ) -> Result<()> {
        let supplied = dispatch.uniforms.len() + dispatch.buffers.len();
        if supplied != self.layout.len() {
            return Err(SkinError::BindingMismatch {
                program: self.label.clone(),
                expected: self.layout.len(),
                actual: supplied,
            }
            .into());
        }
        let pipeline = self
            .pipelines
            .get(dispatch.kernel.index())
            .ok_or_else(|| anyhow!("Kernel '{}' is not part of '{}'", dispatch.kernel.name(), self.label))?;

        let mut uniforms = dispatch.uniforms.iter();
        let mut storage = dispatch.buffers.iter();
        let mut entries = Vec::with_capacity(self.layout.len());
        for (binding, slot) in self.layout.iter().enumerate() {
            let resource = match *slot {
                BindingSlot::Uniform { size } => {
                    let bytes = uniforms.next().ok_or_else(|| anyhow!("Missing uniform block for binding {binding}"))?;
                    if bytes.len() as u64 != size {
                        bail!(
                            "Uniform binding {binding} of '{}' expects {size} bytes, got {}",
                            self.label,
                            bytes.len()
                        );
                    }
                    let buffer = self.uniforms[binding]
                        .as_ref()
                        .ok_or_else(|| anyhow!("Binding {binding} of '{}' has no uniform buffer", self.label))?;
                    queue.write_buffer(buffer, 0, bytes);
                    buffer.as_entire_binding()
                }
                BindingSlot::Storage { .. } => {
                    let id = storage.next().ok_or_else(|| anyhow!("Missing storage buffer for binding {binding}"))?;
                    let buffer =
                        buffers.get(id).ok_or(SkinError::UnknownHandle { kind: "buffer", id: id.raw() })?;
                    buffer.buffer.as_entire_binding()
                }
            };
            entries.push(wgpu::BindGroupEntry { binding: binding as u32, resource });
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{} Bind Group", self.label)),
            layout: &self.bind_group_layout,
            entries: &entries,
        });

        let [x, y, z] = dispatch.groups;
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(dispatch.kernel.name()),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }
}
