use glam::{Mat4, Vec3, Vec4};

use crate::device::IndirectDraw;
use crate::mesh::MeshVertex;

use super::MeshBuffers;

pub(super) const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
pub(super) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const SKIN_MATERIAL_WGSL: &str = include_str!("../../assets/shaders/skin_material.wgsl");

/// `struct Camera` in `skin_material.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct CameraUniforms {
    view_proj: [[f32; 4]; 4],
    light_dir: [f32; 4],
    base_color: [f32; 4],
}

/// Buffers a single indirect draw binds, already resolved from their ids.
pub(super) struct SkinDrawTargets<'a> {
    pub mesh: &'a MeshBuffers,
    pub args: &'a wgpu::Buffer,
    pub weights: &'a wgpu::Buffer,
    pub bones: &'a wgpu::Buffer,
}

/// Offscreen pass drawing skinned instances with the skin material.
pub(super) struct SkinPass {
    pipeline: wgpu::RenderPipeline,
    material_layout: wgpu::BindGroupLayout,
    material_buffer: wgpu::Buffer,
    camera_buffer: wgpu::Buffer,
    camera_bind_group: wgpu::BindGroup,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    camera: CameraUniforms,
    size: (u32, u32),
    cleared: bool,
}

impl SkinPass {
    pub(super) fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Skin Material Shader"),
            source: wgpu::ShaderSource::Wgsl(SKIN_MATERIAL_WGSL.into()),
        });

        let storage_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let material_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Skin Material BGL"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1),
                storage_entry(2),
            ],
        });
        let camera_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Skin Camera BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let material_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Skin Material Uniforms"),
            size: std::mem::size_of::<crate::params::MaterialUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let camera_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Skin Camera Uniforms"),
            size: std::mem::size_of::<CameraUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Skin Camera BG"),
            layout: &camera_layout,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: camera_buffer.as_entire_binding() }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Skin Pipeline Layout"),
            bind_group_layouts: &[&material_layout, &camera_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Skin Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[MeshVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: COLOR_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            // blades are seen from both sides
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let (color_view, depth_view) = create_targets(device, width, height);
        let camera = CameraUniforms {
            view_proj: default_view_projection(width, height).to_cols_array_2d(),
            light_dir: Vec4::new(-0.4, -1.0, -0.3, 0.0).to_array(),
            base_color: [0.32, 0.62, 0.24, 1.0],
        };
        Self {
            pipeline,
            material_layout,
            material_buffer,
            camera_buffer,
            camera_bind_group,
            color_view,
            depth_view,
            camera,
            size: (width, height),
            cleared: false,
        }
    }

    pub(super) fn size(&self) -> (u32, u32) {
        self.size
    }

    pub(super) fn set_view_projection(&mut self, view_proj: Mat4) {
        self.camera.view_proj = view_proj.to_cols_array_2d();
    }

    /// The next draw clears the targets again.
    pub(super) fn begin_frame(&mut self) {
        self.cleared = false;
    }

    pub(super) fn encode(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        draw: &IndirectDraw<'_>,
        targets: SkinDrawTargets<'_>,
    ) {
        queue.write_buffer(&self.material_buffer, 0, bytemuck::bytes_of(draw.material));
        queue.write_buffer(&self.camera_buffer, 0, bytemuck::bytes_of(&self.camera));
        let material_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Skin Material BG"),
            layout: &self.material_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.material_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: targets.weights.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: targets.bones.as_entire_binding() },
            ],
        });

        let (color_load, depth_load) = if self.cleared {
            (wgpu::LoadOp::Load, wgpu::LoadOp::Load)
        } else {
            (wgpu::LoadOp::Clear(wgpu::Color { r: 0.05, g: 0.06, b: 0.1, a: 1.0 }), wgpu::LoadOp::Clear(1.0))
        };
        self.cleared = true;

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Skin Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.color_view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations { load: color_load, store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth_view,
                depth_ops: Some(wgpu::Operations { load: depth_load, store: wgpu::StoreOp::Store }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &material_bind_group, &[]);
        pass.set_bind_group(1, &self.camera_bind_group, &[]);
        pass.set_vertex_buffer(0, targets.mesh.vertex.slice(..));
        pass.set_index_buffer(targets.mesh.index.slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed_indirect(targets.args, 0);
    }
}

fn create_targets(device: &wgpu::Device, width: u32, height: u32) -> (wgpu::TextureView, wgpu::TextureView) {
    let extent = wgpu::Extent3d { width, height, depth_or_array_layers: 1 };
    let target = |label: &str, format: wgpu::TextureFormat, usage: wgpu::TextureUsages| {
        device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default())
    };
    let color = target(
        "Skin Color Target",
        COLOR_FORMAT,
        wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
    );
    let depth = target("Skin Depth Target", DEPTH_FORMAT, wgpu::TextureUsages::RENDER_ATTACHMENT);
    (color, depth)
}

/// Looks down at the origin from the front, framing a patch a few units wide.
pub(super) fn default_view_projection(width: u32, height: u32) -> Mat4 {
    let aspect = width as f32 / height.max(1) as f32;
    let view = Mat4::look_at_rh(Vec3::new(0.0, 6.0, 18.0), Vec3::new(0.0, 1.5, 0.0), Vec3::Y);
    let proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 200.0);
    proj * view
}
