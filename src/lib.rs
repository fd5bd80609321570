pub mod animator;
pub mod binding;
pub mod chain;
pub mod cli;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod kernel;
pub mod mesh;
pub mod params;
pub mod renderer;
pub mod skin_data;
pub mod time;
pub mod trails;
pub mod variant;

pub use animator::{build_pipeline, AnimatorSettings, SkinAnimator, SkinPipeline};
pub use chain::{ChainLayout, ChainTransform};
pub use config::{SkinConfig, SkinConfigOverrides};
pub use device::{RecordingDevice, SkinDevice};
pub use error::SkinError;
pub use renderer::WgpuSkinDevice;
pub use trails::{TrailAnimator, TrailParams};
pub use variant::ChainVariantKind;
