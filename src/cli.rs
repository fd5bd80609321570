use crate::config::SkinConfigOverrides;
use crate::variant::ChainVariantKind;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

const SUPPORTED_FLAGS: &str = "--config, --instances, --bones, --variant, --frames, --diagnostics, --mesh";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    instances: Option<u32>,
    bones: Option<u32>,
    variant: Option<ChainVariantKind>,
    frames: Option<u32>,
    diagnostics: Option<bool>,
    mesh: Option<PathBuf>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "instances" => {
                    overrides.instances =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid instance count '{value}'"))?);
                }
                "bones" => {
                    overrides.bones =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid bone count '{value}'"))?);
                }
                "variant" => {
                    overrides.variant = Some(value.parse::<ChainVariantKind>()?);
                }
                "frames" => {
                    overrides.frames =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid frame count '{value}'"))?);
                }
                "diagnostics" => {
                    overrides.diagnostics = Some(parse_bool_flag("diagnostics", &value)?);
                }
                "mesh" => overrides.mesh = Some(PathBuf::from(value)),
                _ => bail!("Unknown flag '{flag}'. Supported flags: {SUPPORTED_FLAGS}."),
            }
        }
        Ok(overrides)
    }

    /// Config file named with `--config`, if any.
    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn into_config_overrides(self) -> SkinConfigOverrides {
        SkinConfigOverrides {
            instances_count: self.instances,
            bone_count: self.bones,
            variant: self.variant,
            frames: self.frames,
            diagnostics: self.diagnostics,
            mesh: self.mesh,
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
