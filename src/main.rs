use anyhow::{Context, Result};
use glam::{Quat, Vec3};
use kestrel_procskin::chain::ChainTransform;
use kestrel_procskin::cli::CliOverrides;
use kestrel_procskin::mesh::Mesh;
use kestrel_procskin::time::Time;
use kestrel_procskin::{build_pipeline, SkinConfig, SkinPipeline, WgpuSkinDevice};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "config/procskin.json";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(cli) {
        eprintln!("Application error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: CliOverrides) -> Result<()> {
    let path = cli.config_path().cloned().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = SkinConfig::load_or_default(&path);
    let overrides = cli.into_config_overrides();
    if !overrides.is_empty() {
        log::info!("[config] CLI overrides: {}", overrides.applied_fields().join(", "));
    }
    config.apply_overrides(&overrides);
    config.validate()?;

    let mesh = match &config.mesh {
        Some(path) => Mesh::load_gltf(path)?,
        None => Mesh::blade(3.0, 0.4, 8),
    };
    let mut device = WgpuSkinDevice::new(config.render.width, config.render.height)?;
    let mut pipeline = build_pipeline(&config, mesh)?;
    log::info!(
        "[procskin] {} x {} bones, {} chains on {}",
        config.instances_count,
        config.bone_count,
        config.variant,
        device.adapter_info().name
    );

    let mut time = Time::new();
    pipeline.initialize(&mut device, &owner_at(0.0), time.frame())?;
    let result = drive(pipeline.as_mut(), &mut device, &mut time, &config);
    let released = pipeline.release(&mut device);
    result.and(released)?;
    log::info!("[procskin] {} draws submitted", device.draws_submitted());
    Ok(())
}

fn drive(pipeline: &mut dyn SkinPipeline, device: &mut WgpuSkinDevice, time: &mut Time, config: &SkinConfig) -> Result<()> {
    let step = Duration::try_from_secs_f32(config.render.time_step)
        .with_context(|| format!("Invalid render.time_step {}", config.render.time_step))?;
    for _ in 0..config.render.frames {
        time.advance(step);
        let t = time.elapsed_seconds();
        if let Some(trails) = pipeline.trails_mut() {
            if trails.extension().features().attractor {
                trails.set_attractor(Some(orbit(t)));
            }
        }
        device.begin_frame();
        pipeline.frame(device, &owner_at(t), time.frame())?;
    }
    if config.diagnostics.enabled {
        for (what, report) in pipeline.inspect(device)? {
            report.log(what);
        }
    }
    Ok(())
}

/// The patch turns slowly so trails have owner motion to lag behind.
fn owner_at(t: f32) -> ChainTransform {
    ChainTransform::IDENTITY.with_rotation(Quat::from_rotation_y(t * 0.25))
}

fn orbit(t: f32) -> Vec3 {
    Vec3::new(t.cos() * 4.0, 3.0, t.sin() * 4.0)
}
