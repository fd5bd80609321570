use anyhow::Result;
use glam::{Mat4, Quat, Vec3};

use crate::binding::BindingPolicy;
use crate::error::SkinError;
use crate::mesh::MeshBounds;
use crate::skin_data::{slot_index, GpuBone};

/// Rigid base transform owning a group of chains.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChainTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for ChainTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ChainTransform {
    pub const IDENTITY: Self = Self { translation: Vec3::ZERO, rotation: Quat::IDENTITY, scale: Vec3::ONE };

    pub fn from_translation(translation: Vec3) -> Self {
        Self { translation, ..Self::IDENTITY }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn local_to_world(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    pub fn world_to_local(&self) -> Mat4 {
        self.local_to_world().inverse()
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.local_to_world().transform_point3(point)
    }

    pub fn inverse_transform_point(&self, point: Vec3) -> Vec3 {
        self.world_to_local().transform_point3(point)
    }

    /// Single-level transforms have no parent skew, so the lossy scale is the scale itself.
    pub fn lossy_scale(&self) -> Vec3 {
        self.scale
    }
}

/// Bounds-derived constants shared by weight binding, bone placement and the trail
/// kernels. Derived once per mesh/bone count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChainLayout {
    pub policy: BindingPolicy,
    pub bone_count: u32,
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
    pub unit_length: f32,
    pub following_bone_count: u32,
}

impl ChainLayout {
    pub fn derive(bounds: &MeshBounds, bone_count: u32, policy: BindingPolicy) -> Result<Self> {
        let min_bones = policy.min_bone_count();
        if bone_count < min_bones {
            return Err(SkinError::InvalidChain(format!(
                "{policy:?} chains need at least {min_bones} bones, got {bone_count}"
            ))
            .into());
        }
        let height = bounds.height();
        if !height.is_finite() || height <= 0.0 {
            return Err(SkinError::InvalidChain(format!("mesh Y extent must be positive, got {height}")).into());
        }
        let unit_length = height / policy.spacing_divisor(bone_count) as f32;
        Ok(Self {
            policy,
            bone_count,
            min: bounds.min,
            max: bounds.max,
            center: bounds.center,
            unit_length,
            following_bone_count: policy.following_bone_count(bone_count),
        })
    }

    /// Rest height of `bone` in mesh space. Bone 0 sits at the top of the mesh.
    pub fn rest_height(&self, bone: u32) -> f32 {
        self.max.y - self.unit_length * self.policy.spacing_steps(bone) as f32
    }

    pub fn rest_position(&self, bone: u32) -> Vec3 {
        Vec3::new(self.center.x, self.rest_height(bone), self.center.z)
    }
}

/// Generates the rest pose for every instance. All instances share the owning
/// transform; the kernels tell them apart by instance id.
pub fn build_bones(layout: &ChainLayout, instances_count: u32, transform: &ChainTransform) -> Vec<GpuBone> {
    let bone_count = layout.bone_count;
    let rotation = transform.rotation;
    let scale = transform.lossy_scale();
    let chain: Vec<GpuBone> = (0..bone_count)
        .map(|bone| GpuBone::new(transform.transform_point(layout.rest_position(bone)), rotation, scale))
        .collect();

    let mut bones = Vec::with_capacity(slot_index(instances_count, 0, bone_count));
    for _ in 0..instances_count {
        bones.extend_from_slice(&chain);
    }
    bones
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_bounds() -> MeshBounds {
        MeshBounds::new(Vec3::new(-0.5, 0.0, -0.5), Vec3::new(0.5, 3.0, 0.5))
    }

    #[test]
    fn plain_layout_spaces_bones_evenly() {
        let layout = ChainLayout::derive(&column_bounds(), 4, BindingPolicy::Plain).expect("layout");
        assert!((layout.unit_length - 1.0).abs() < 1e-6);
        assert_eq!(layout.following_bone_count, 3);
        let heights: Vec<f32> = (0..4).map(|bone| layout.rest_height(bone)).collect();
        assert_eq!(heights, vec![3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn follow_layout_reserves_root() {
        let layout = ChainLayout::derive(&column_bounds(), 5, BindingPolicy::FollowDelay).expect("layout");
        assert!((layout.unit_length - 1.0).abs() < 1e-6);
        assert_eq!(layout.following_bone_count, 3);
        assert_eq!(layout.rest_height(0), 3.0);
        assert_eq!(layout.rest_height(1), 3.0);
        assert_eq!(layout.rest_height(4), 0.0);
    }

    #[test]
    fn derive_rejects_short_chains_and_flat_meshes() {
        let err = ChainLayout::derive(&column_bounds(), 0, BindingPolicy::Plain).unwrap_err();
        assert!(matches!(err.downcast_ref::<SkinError>(), Some(SkinError::InvalidChain(_))));
        assert!(ChainLayout::derive(&column_bounds(), 2, BindingPolicy::FollowDelay).is_err());
        let flat = MeshBounds::new(Vec3::ZERO, Vec3::new(1.0, 0.0, 1.0));
        assert!(ChainLayout::derive(&flat, 4, BindingPolicy::Plain).is_err());
    }

    #[test]
    fn bones_follow_owner_transform() {
        let layout = ChainLayout::derive(&column_bounds(), 3, BindingPolicy::Plain).expect("layout");
        let transform = ChainTransform::from_translation(Vec3::new(10.0, 0.0, 0.0)).with_scale(Vec3::splat(2.0));
        let bones = build_bones(&layout, 2, &transform);
        assert_eq!(bones.len(), 6);
        let top = bones[0].rest_translation();
        assert!(top.abs_diff_eq(Vec3::new(10.0, 6.0, 0.0), 1e-5), "unexpected root {top:?}");
        assert_eq!(bones[1], bones[4], "instances share the rest pose");
        let local = bones[2].local_matrix();
        let (scale, _, _) = local.to_scale_rotation_translation();
        assert!(scale.abs_diff_eq(Vec3::splat(2.0), 1e-5));
    }
}
