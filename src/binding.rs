use anyhow::Result;
use glam::Vec3;

use crate::chain::ChainLayout;
use crate::error::SkinError;
use crate::skin_data::GpuBoneWeight;

/// How mesh height maps onto the bone chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingPolicy {
    /// Bones evenly spaced from the top of the mesh (bone 0) to the bottom.
    Plain,
    /// Bone 0 is a rigid anchor; the remaining bones span the mesh, so spacing uses
    /// `B - 2` intervals and coordinates are shifted by one.
    FollowDelay,
}

impl BindingPolicy {
    pub fn min_bone_count(self) -> u32 {
        match self {
            BindingPolicy::Plain => 2,
            BindingPolicy::FollowDelay => 3,
        }
    }

    pub(crate) fn spacing_divisor(self, bone_count: u32) -> u32 {
        match self {
            BindingPolicy::Plain => bone_count - 1,
            BindingPolicy::FollowDelay => bone_count - 2,
        }
    }

    pub(crate) fn spacing_steps(self, bone: u32) -> u32 {
        match self {
            BindingPolicy::Plain => bone,
            BindingPolicy::FollowDelay => bone.saturating_sub(1),
        }
    }

    pub(crate) fn following_bone_count(self, bone_count: u32) -> u32 {
        match self {
            BindingPolicy::Plain => bone_count - 1,
            BindingPolicy::FollowDelay => bone_count - 2,
        }
    }

    /// Continuous bone coordinate for a vertex at height `y`. Decreases as `y` grows.
    pub fn bone_coordinate(self, y: f32, layout: &ChainLayout) -> f32 {
        let steps = (y - layout.min.y) / layout.unit_length;
        match self {
            BindingPolicy::Plain => (layout.bone_count - 1) as f32 - steps,
            BindingPolicy::FollowDelay => (layout.bone_count - 2) as f32 - steps + 1.0,
        }
    }
}

/// Weight binding of one chain variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightBinding {
    pub policy: BindingPolicy,
    /// `bone_index1` written for tip vertices (`u <= 0`). Always carries zero weight.
    pub tip_index1: u32,
}

impl WeightBinding {
    pub const fn new(policy: BindingPolicy, tip_index1: u32) -> Self {
        Self { policy, tip_index1 }
    }

    pub fn bind_vertex(&self, position: Vec3, layout: &ChainLayout) -> GpuBoneWeight {
        let u = self.policy.bone_coordinate(position.y, layout);
        if u > 0.0 {
            let last = layout.bone_count - 1;
            let lower = u.floor();
            let mut t = u - lower;
            if self.policy == BindingPolicy::FollowDelay {
                t = t.clamp(0.0, 1.0);
            }
            let lower_index = (lower as u32).min(last);
            let upper_index = (u.ceil() as u32).min(last);
            GpuBoneWeight::blend(lower_index, upper_index, t)
        } else {
            // tip: vertex at or past bone 0, pinned to the root
            GpuBoneWeight::pinned(0, self.tip_index1)
        }
    }

    /// Binds every vertex. Depends only on geometry and bone count, so it runs once per
    /// mesh.
    pub fn build_weights(
        &self,
        positions: impl Iterator<Item = Vec3>,
        layout: &ChainLayout,
    ) -> Result<Vec<GpuBoneWeight>> {
        if layout.policy != self.policy {
            return Err(SkinError::InvalidChain(format!(
                "layout derived for {:?} used with {:?} binding",
                layout.policy, self.policy
            ))
            .into());
        }
        Ok(positions.map(|position| self.bind_vertex(position, layout)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshBounds;

    fn layout(bones: u32, policy: BindingPolicy) -> ChainLayout {
        let bounds = MeshBounds::new(Vec3::new(-1.0, 0.0, -1.0), Vec3::new(1.0, 3.0, 1.0));
        ChainLayout::derive(&bounds, bones, policy).expect("layout")
    }

    #[test]
    fn mid_vertex_blends_neighbouring_bones() {
        let layout = layout(4, BindingPolicy::Plain);
        let binding = WeightBinding::new(BindingPolicy::Plain, 0);
        let weight = binding.bind_vertex(Vec3::new(0.0, 1.5, 0.0), &layout);
        assert_eq!((weight.bone_index0, weight.bone_index1), (1, 2));
        assert!((weight.weight0 - 0.5).abs() < 1e-6);
        assert!((weight.weight1 - 0.5).abs() < 1e-6);
        assert_eq!((weight.weight2, weight.weight3, weight.bone_index2, weight.bone_index3), (0.0, 0.0, 0, 0));
    }

    #[test]
    fn bottom_vertex_binds_last_bone() {
        let layout = layout(4, BindingPolicy::Plain);
        let weight = WeightBinding::new(BindingPolicy::Plain, 0).bind_vertex(Vec3::ZERO, &layout);
        assert_eq!(weight.bone_index0, 3);
        assert_eq!(weight.bone_index1, 3);
        assert!((weight.weight0 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tip_vertex_uses_variant_index() {
        let layout = layout(4, BindingPolicy::Plain);
        let top = Vec3::new(0.0, 3.0, 0.0);
        let plain = WeightBinding::new(BindingPolicy::Plain, 0).bind_vertex(top, &layout);
        let trail = WeightBinding::new(BindingPolicy::Plain, 1).bind_vertex(top, &layout);
        assert_eq!((plain.bone_index0, plain.bone_index1, plain.weight0, plain.weight1), (0, 0, 1.0, 0.0));
        assert_eq!((trail.bone_index0, trail.bone_index1, trail.weight0, trail.weight1), (0, 1, 1.0, 0.0));
    }

    #[test]
    fn follow_policy_skips_root_bone() {
        let layout = layout(5, BindingPolicy::FollowDelay);
        let binding = WeightBinding::new(BindingPolicy::FollowDelay, 1);
        let top = binding.bind_vertex(Vec3::new(0.0, 3.0, 0.0), &layout);
        assert_eq!(top.bone_index0, 1);
        assert!((top.weight0 - 1.0).abs() < 1e-6);
        let bottom = binding.bind_vertex(Vec3::ZERO, &layout);
        assert_eq!(bottom.bone_index0, 4);
        let mid = binding.bind_vertex(Vec3::new(0.0, 2.25, 0.0), &layout);
        assert_eq!((mid.bone_index0, mid.bone_index1), (1, 2));
        assert!((mid.weight1 - 0.75).abs() < 1e-5);
    }

    #[test]
    fn height_sweep_keeps_weights_normalized_and_monotonic() {
        for (policy, bones, tip_index1) in [(BindingPolicy::Plain, 4, 0), (BindingPolicy::FollowDelay, 5, 1)] {
            let layout = layout(bones, policy);
            let binding = WeightBinding::new(policy, tip_index1);
            let mut previous = f32::INFINITY;
            // slightly past both ends of the 0..3 bounds
            for step in 0..=1000 {
                let y = -0.3 + 3.6 * step as f32 / 1000.0;
                let u = policy.bone_coordinate(y, &layout);
                assert!(u <= previous, "{policy:?}: coordinate rose from {previous} to {u} at y={y}");
                previous = u;

                let weight = binding.bind_vertex(Vec3::new(0.0, y, 0.0), &layout);
                assert!((weight.weight0 + weight.weight1 - 1.0).abs() < 1e-5, "{policy:?} at y={y}: {weight:?}");
                assert!((0.0..=1.0).contains(&weight.weight0) && (0.0..=1.0).contains(&weight.weight1));
                assert!(weight.bone_index0 < bones && weight.bone_index1 < bones, "{policy:?} at y={y}: {weight:?}");
            }
        }
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let layout = layout(4, BindingPolicy::Plain);
        let binding = WeightBinding::new(BindingPolicy::FollowDelay, 1);
        assert!(binding.build_weights(std::iter::once(Vec3::ZERO), &layout).is_err());
    }
}
