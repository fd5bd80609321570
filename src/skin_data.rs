use glam::{Mat4, Quat, Vec3};

/// Per-bone record shared with the compute kernels and the skin material.
///
/// Field order and padding follow WGSL storage layout rules (vec3 aligned to 16 bytes),
/// see `struct Bone` in `assets/shaders/procskin.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuBone {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub rotation: [[f32; 4]; 4],
    pub scale: [f32; 3],
    pub _pad1: f32,
    /// World-space skin matrix. Written by the device from Setup onwards.
    pub combined: [[f32; 4]; 4],
    /// Rest pose TRS matrix.
    pub local: [[f32; 4]; 4],
    /// Inverse of `local`.
    pub offset: [[f32; 4]; 4],
}

const _: () = assert!(std::mem::size_of::<GpuBone>() == 288);

impl GpuBone {
    /// Builds the rest pose record. The live `position`/`rotation`/`scale` start at the
    /// identity pose; the Setup kernel derives them from `local`.
    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        let local = Mat4::from_scale_rotation_translation(scale, rotation, translation);
        let offset = local.inverse();
        Self {
            position: [0.0; 3],
            _pad0: 0.0,
            rotation: Mat4::IDENTITY.to_cols_array_2d(),
            scale: [1.0; 3],
            _pad1: 0.0,
            combined: Mat4::IDENTITY.to_cols_array_2d(),
            local: local.to_cols_array_2d(),
            offset: offset.to_cols_array_2d(),
        }
    }

    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.local)
    }

    pub fn offset_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.offset)
    }

    pub fn rotation_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.rotation)
    }

    pub fn rest_translation(&self) -> Vec3 {
        self.local_matrix().w_axis.truncate()
    }
}

/// Two-bone linear blend entry for one mesh vertex. Slots 2 and 3 are reserved and
/// always zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuBoneWeight {
    pub weight0: f32,
    pub weight1: f32,
    pub weight2: f32,
    pub weight3: f32,
    pub bone_index0: u32,
    pub bone_index1: u32,
    pub bone_index2: u32,
    pub bone_index3: u32,
}

const _: () = assert!(std::mem::size_of::<GpuBoneWeight>() == 32);

impl GpuBoneWeight {
    pub fn blend(lower: u32, upper: u32, t: f32) -> Self {
        Self { weight0: 1.0 - t, weight1: t, bone_index0: lower, bone_index1: upper, ..Self::default() }
    }

    pub fn pinned(index0: u32, index1: u32) -> Self {
        Self { weight0: 1.0, weight1: 0.0, bone_index0: index0, bone_index1: index1, ..Self::default() }
    }
}

/// Secondary dynamics state for one bone slot. `speed` lives in the binormal's padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuTrail {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub velocity: [f32; 3],
    pub _pad1: f32,
    pub normal: [f32; 3],
    pub _pad2: f32,
    pub tangent: [f32; 3],
    pub _pad3: f32,
    pub binormal: [f32; 3],
    pub speed: f32,
}

const _: () = assert!(std::mem::size_of::<GpuTrail>() == 80);

impl GpuTrail {
    pub fn frame(&self) -> [Vec3; 3] {
        [Vec3::from_array(self.normal), Vec3::from_array(self.tangent), Vec3::from_array(self.binormal)]
    }
}

/// Matches `wgpu::util::DrawIndexedIndirectArgs`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawIndexedIndirectArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

impl DrawIndexedIndirectArgs {
    pub fn new(index_count: u32, instance_count: u32) -> Self {
        Self { index_count, instance_count, ..Self::default() }
    }
}

/// Flat index of `bone` inside `instance`'s chain.
#[inline]
pub fn slot_index(instance: u32, bone: u32, bone_count: u32) -> usize {
    instance as usize * bone_count as usize + bone as usize
}

/// Decodes a read-back buffer. Trailing bytes that do not fill a record are ignored.
pub fn decode_records<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(std::mem::size_of::<T>()).map(bytemuck::pod_read_unaligned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_pose_offset_inverts_local() {
        let bone = GpuBone::new(
            Vec3::new(1.0, 2.5, -3.0),
            Quat::from_rotation_y(0.7) * Quat::from_rotation_x(-0.2),
            Vec3::new(1.5, 0.5, 2.0),
        );
        let product = bone.local_matrix() * bone.offset_matrix();
        assert!(product.abs_diff_eq(Mat4::IDENTITY, 1e-5), "local * offset should be identity: {product:?}");
        assert_eq!(bone.combined, Mat4::IDENTITY.to_cols_array_2d());
        assert_eq!(bone.position, [0.0; 3]);
        assert_eq!(bone.scale, [1.0; 3]);
    }

    #[test]
    fn indirect_args_only_populate_counts() {
        let args = DrawIndexedIndirectArgs::new(36, 128);
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&args));
        assert_eq!(words, &[36, 128, 0, 0, 0]);
    }

    #[test]
    fn decodes_unaligned_read_back() {
        let trail = GpuTrail { speed: 3.0, ..GpuTrail::default() };
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(bytemuck::bytes_of(&trail));
        bytes.extend_from_slice(bytemuck::bytes_of(&trail));
        let decoded: Vec<GpuTrail> = decode_records(&bytes[1..]);
        assert_eq!(decoded, vec![trail, trail]);
    }

    #[test]
    fn slot_index_is_instance_major() {
        assert_eq!(slot_index(0, 3, 8), 3);
        assert_eq!(slot_index(2, 1, 8), 17);
    }
}
