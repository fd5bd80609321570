use anyhow::{bail, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::binding::{BindingPolicy, WeightBinding};
use crate::chain::{self, ChainLayout, ChainTransform};
use crate::mesh::{Mesh, MeshBounds};
use crate::params::{TRAIL_FLAG_ATTRACTOR, TRAIL_FLAG_FOLLOW};
use crate::skin_data::{GpuBone, GpuBoneWeight};

/// Secondary dynamics a variant layers over drag, gravity and noise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrailFeatures {
    pub follow: bool,
    pub attractor: bool,
}

impl TrailFeatures {
    pub fn flags(self) -> u32 {
        let mut flags = 0;
        if self.follow {
            flags |= TRAIL_FLAG_FOLLOW;
        }
        if self.attractor {
            flags |= TRAIL_FLAG_ATTRACTOR;
        }
        flags
    }
}

/// Capabilities of one chain-dynamics variant. The animator core only ever talks to
/// this trait.
pub trait ChainVariant: fmt::Debug {
    fn kind(&self) -> ChainVariantKind;

    fn weight_binding(&self) -> WeightBinding;

    /// `None` when the variant runs without the trail extension.
    fn trail_features(&self) -> Option<TrailFeatures>;

    fn policy(&self) -> BindingPolicy {
        self.weight_binding().policy
    }

    fn layout(&self, bounds: &MeshBounds, bone_count: u32) -> Result<ChainLayout> {
        ChainLayout::derive(bounds, bone_count, self.policy())
    }

    fn build_weights(&self, mesh: &Mesh, layout: &ChainLayout) -> Result<Vec<GpuBoneWeight>> {
        self.weight_binding().build_weights(mesh.positions(), layout)
    }

    fn build_bones(&self, layout: &ChainLayout, instances_count: u32, transform: &ChainTransform) -> Vec<GpuBone> {
        chain::build_bones(layout, instances_count, transform)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PlainChain;

#[derive(Clone, Copy, Debug, Default)]
pub struct TrailChain;

#[derive(Clone, Copy, Debug, Default)]
pub struct FollowChain;

#[derive(Clone, Copy, Debug, Default)]
pub struct AttractorChain;

impl ChainVariant for PlainChain {
    fn kind(&self) -> ChainVariantKind {
        ChainVariantKind::Plain
    }

    fn weight_binding(&self) -> WeightBinding {
        WeightBinding::new(BindingPolicy::Plain, 0)
    }

    fn trail_features(&self) -> Option<TrailFeatures> {
        None
    }
}

impl ChainVariant for TrailChain {
    fn kind(&self) -> ChainVariantKind {
        ChainVariantKind::Trail
    }

    fn weight_binding(&self) -> WeightBinding {
        WeightBinding::new(BindingPolicy::Plain, 1)
    }

    fn trail_features(&self) -> Option<TrailFeatures> {
        Some(TrailFeatures::default())
    }
}

impl ChainVariant for FollowChain {
    fn kind(&self) -> ChainVariantKind {
        ChainVariantKind::Follow
    }

    fn weight_binding(&self) -> WeightBinding {
        WeightBinding::new(BindingPolicy::FollowDelay, 1)
    }

    fn trail_features(&self) -> Option<TrailFeatures> {
        Some(TrailFeatures { follow: true, attractor: false })
    }
}

impl ChainVariant for AttractorChain {
    fn kind(&self) -> ChainVariantKind {
        ChainVariantKind::Attractor
    }

    fn weight_binding(&self) -> WeightBinding {
        WeightBinding::new(BindingPolicy::FollowDelay, 1)
    }

    fn trail_features(&self) -> Option<TrailFeatures> {
        Some(TrailFeatures { follow: true, attractor: true })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChainVariantKind {
    Plain,
    #[default]
    Trail,
    Follow,
    Attractor,
}

impl ChainVariantKind {
    pub const ALL: [ChainVariantKind; 4] =
        [ChainVariantKind::Plain, ChainVariantKind::Trail, ChainVariantKind::Follow, ChainVariantKind::Attractor];

    pub fn build(self) -> Box<dyn ChainVariant> {
        match self {
            ChainVariantKind::Plain => Box::new(PlainChain),
            ChainVariantKind::Trail => Box::new(TrailChain),
            ChainVariantKind::Follow => Box::new(FollowChain),
            ChainVariantKind::Attractor => Box::new(AttractorChain),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainVariantKind::Plain => "plain",
            ChainVariantKind::Trail => "trail",
            ChainVariantKind::Follow => "follow",
            ChainVariantKind::Attractor => "attractor",
        }
    }
}

impl fmt::Display for ChainVariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainVariantKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let lowered = value.to_ascii_lowercase();
        match ChainVariantKind::ALL.into_iter().find(|kind| kind.as_str() == lowered) {
            Some(kind) => Ok(kind),
            None => bail!("Unknown chain variant '{value}'. Use plain, trail, follow or attractor."),
        }
    }
}
