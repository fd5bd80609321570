use anyhow::{anyhow, Context, Result};
use glam::{Vec2, Vec3};
use gltf::mesh::Mode;
use std::path::Path;

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self { position: position.to_array(), normal: normal.to_array(), uv: uv.to_array() }
    }

    pub fn at(position: Vec3) -> Self {
        Self::new(position, Vec3::Z, Vec2::ZERO)
    }

    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        use std::mem;
        wgpu::VertexBufferLayout {
            array_stride: mem::size_of::<MeshVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 },
                wgpu::VertexAttribute { offset: 12, shader_location: 1, format: wgpu::VertexFormat::Float32x3 },
                wgpu::VertexAttribute { offset: 24, shader_location: 2, format: wgpu::VertexFormat::Float32x2 },
            ],
        }
    }
}

/// Static mesh shared by every instance of a skinned chain.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub bounds: MeshBounds,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshBounds {
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
    pub radius: f32,
}

impl Mesh {
    pub fn new(vertices: Vec<MeshVertex>, indices: Vec<u32>) -> Self {
        let bounds = MeshBounds::from_vertices(&vertices);
        Self { vertices, indices, bounds }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.vertices.iter().map(|vertex| Vec3::from_array(vertex.position))
    }

    /// Tapered double-sided strip standing on the origin, `segments` rows tall.
    pub fn blade(height: f32, width: f32, segments: u32) -> Self {
        let segments = segments.max(1);
        let mut vertices = Vec::with_capacity(((segments + 1) * 2) as usize);
        for row in 0..=segments {
            let v = row as f32 / segments as f32;
            let half = width * 0.5 * (1.0 - v * 0.85);
            let y = height * v;
            vertices.push(MeshVertex::new(Vec3::new(-half, y, 0.0), Vec3::Z, Vec2::new(0.0, v)));
            vertices.push(MeshVertex::new(Vec3::new(half, y, 0.0), Vec3::Z, Vec2::new(1.0, v)));
        }

        let mut indices = Vec::with_capacity((segments * 12) as usize);
        for row in 0..segments {
            let base = row * 2;
            // front and back faces
            indices.extend_from_slice(&[base, base + 1, base + 3, base, base + 3, base + 2]);
            indices.extend_from_slice(&[base, base + 3, base + 1, base, base + 2, base + 3]);
        }
        Self::new(vertices, indices)
    }

    /// Imports the triangle primitives of the first mesh in a glTF file. Only positions,
    /// normals, first UV set and indices are read; skins are ignored since weights are
    /// generated procedurally.
    pub fn load_gltf(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let (document, buffers, _) = gltf::import(path_ref)
            .with_context(|| format!("Failed to import glTF from {}", path_ref.display()))?;
        let mesh =
            document.meshes().next().ok_or_else(|| anyhow!("No meshes found in {}", path_ref.display()))?;

        let mut vertices: Vec<MeshVertex> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();
        for primitive in mesh.primitives() {
            if primitive.mode() != Mode::Triangles {
                continue;
            }
            let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
            let positions: Vec<Vec3> = reader
                .read_positions()
                .ok_or_else(|| anyhow!("POSITION attribute missing in {}", path_ref.display()))?
                .map(Vec3::from_array)
                .collect();
            if positions.is_empty() {
                continue;
            }
            let local_indices: Vec<u32> = reader
                .read_indices()
                .map(|read| read.into_u32().collect())
                .unwrap_or_else(|| (0..positions.len() as u32).collect());
            let mut normals: Vec<Vec3> = reader
                .read_normals()
                .map(|it| it.map(Vec3::from_array).collect())
                .unwrap_or_default();
            if normals.len() != positions.len() || normals.iter().all(|n| n.length_squared() == 0.0) {
                normals = compute_normals(&positions, &local_indices);
            }
            let tex_coords: Vec<Vec2> = reader
                .read_tex_coords(0)
                .map(|coords| coords.into_f32().map(Vec2::from_array).collect())
                .unwrap_or_default();

            let base_vertex = vertices.len() as u32;
            vertices.extend(positions.iter().enumerate().map(|(i, pos)| {
                let normal = normals.get(i).copied().unwrap_or(Vec3::Y).normalize_or_zero();
                let uv = tex_coords.get(i).copied().unwrap_or(Vec2::ZERO);
                MeshVertex::new(*pos, normal, uv)
            }));
            indices.extend(local_indices.iter().map(|idx| idx + base_vertex));
        }

        if vertices.is_empty() {
            return Err(anyhow!("Mesh in {} contains no triangle primitives", path_ref.display()));
        }
        Ok(Self::new(vertices, indices))
    }
}

impl MeshBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        let center = (min + max) * 0.5;
        Self { min, max, center, radius: (max - center).length() }
    }

    pub fn from_vertices(vertices: &[MeshVertex]) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for vertex in vertices {
            let pos = Vec3::from_array(vertex.position);
            min = min.min(pos);
            max = max.max(pos);
        }
        if vertices.is_empty() {
            return MeshBounds { min: Vec3::ZERO, max: Vec3::ZERO, center: Vec3::ZERO, radius: 0.0 };
        }
        let center = (min + max) * 0.5;
        let mut radius: f32 = 0.0;
        for vertex in vertices {
            let pos = Vec3::from_array(vertex.position);
            radius = radius.max((pos - center).length());
        }
        MeshBounds { min, max, center, radius }
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }
}

fn compute_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if i0 >= positions.len() || i1 >= positions.len() || i2 >= positions.len() {
            continue;
        }
        let normal = (positions[i1] - positions[i0]).cross(positions[i2] - positions[i0]);
        if normal.length_squared() > 0.0 {
            normals[i0] += normal;
            normals[i1] += normal;
            normals[i2] += normal;
        }
    }
    for normal in &mut normals {
        *normal = if normal.length_squared() > 0.0 { normal.normalize() } else { Vec3::Y };
    }
    normals
}
