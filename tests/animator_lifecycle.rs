use kestrel_procskin::animator::{AnimatorSettings, SkinAnimator};
use kestrel_procskin::chain::ChainTransform;
use kestrel_procskin::device::{DeviceCommand, RecordingDevice};
use kestrel_procskin::error::SkinError;
use kestrel_procskin::kernel::{skin_layout, ComputeProgram};
use kestrel_procskin::mesh::Mesh;
use kestrel_procskin::time::FrameTime;
use kestrel_procskin::trails::{TrailAnimator, TrailParams};
use kestrel_procskin::variant::ChainVariantKind;

const NO_APPLY_WGSL: &str = r#"
struct Globals {
    instances_count: u32,
};

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var<storage, read_write> bones: array<vec4<f32>>;

@compute @workgroup_size(64)
fn Setup(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= globals.instances_count) { return; }
    bones[id.x] = vec4<f32>(0.0);
}

@compute @workgroup_size(64)
fn Update(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= globals.instances_count) { return; }
}
"#;

fn settings() -> AnimatorSettings {
    AnimatorSettings { instances_count: 8, bone_count: 5, diagnostics: true }
}

fn base(kind: ChainVariantKind) -> SkinAnimator {
    let program = ComputeProgram::skin().expect("skin program");
    SkinAnimator::new(kind.build(), Mesh::blade(3.0, 0.4, 6), settings(), program)
}

fn trail_animator(kind: ChainVariantKind) -> TrailAnimator {
    let program = ComputeProgram::trails().expect("trail program");
    TrailAnimator::new(base(kind), TrailParams::default(), program).expect("trail animator")
}

fn skin_error(err: &anyhow::Error) -> Option<&SkinError> {
    err.downcast_ref::<SkinError>()
}

#[test]
fn release_is_idempotent_and_frees_everything() {
    let mut device = RecordingDevice::new();
    let mut animator = base(ChainVariantKind::Plain);
    animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).expect("init");
    assert_eq!(device.live_buffers(), 3);
    assert_eq!(device.live_meshes(), 1);
    animator.release(&mut device).expect("first release");
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_meshes(), 0);
    assert!(animator.is_released());
    animator.release(&mut device).expect("second release");

    let err = animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).unwrap_err();
    assert_eq!(skin_error(&err), Some(&SkinError::Released));
}

#[test]
fn frame_requires_initialization() {
    let mut device = RecordingDevice::new();
    let mut animator = base(ChainVariantKind::Plain);
    let err = animator.frame(&mut device, &ChainTransform::IDENTITY, FrameTime::new(0.1, 0.1)).unwrap_err();
    assert_eq!(skin_error(&err), Some(&SkinError::NotInitialized));
    animator.release(&mut device).expect("release of an idle animator");
    assert!(!animator.is_released());
    assert!(device.commands().is_empty());
}

#[test]
fn double_initialize_is_rejected() {
    let mut device = RecordingDevice::new();
    let mut animator = base(ChainVariantKind::Plain);
    animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).expect("init");
    let err = animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).unwrap_err();
    assert_eq!(skin_error(&err), Some(&SkinError::AlreadyInitialized));
    assert_eq!(device.live_buffers(), 3);
    animator.release(&mut device).expect("release");
}

#[test]
fn missing_kernel_allocates_nothing() {
    let mut device = RecordingDevice::new();
    let program = ComputeProgram::from_wgsl("partial", NO_APPLY_WGSL, skin_layout()).expect("parse");
    let mut animator =
        SkinAnimator::new(ChainVariantKind::Plain.build(), Mesh::blade(3.0, 0.4, 6), settings(), program);
    let err = animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).unwrap_err();
    assert_eq!(
        skin_error(&err),
        Some(&SkinError::MissingKernel { program: "partial".into(), kernel: "Apply".into() })
    );
    assert_eq!(device.live_buffers(), 0);
    assert!(device.commands().is_empty());
    assert!(!animator.is_ready());
}

#[test]
fn too_few_bones_for_follow_policy() {
    let mut device = RecordingDevice::new();
    let program = ComputeProgram::skin().expect("skin program");
    let settings = AnimatorSettings { bone_count: 2, ..settings() };
    let mut animator =
        SkinAnimator::new(ChainVariantKind::Follow.build(), Mesh::blade(3.0, 0.4, 6), settings, program);
    let err = animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).unwrap_err();
    assert!(matches!(skin_error(&err), Some(SkinError::InvalidChain(_))));
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn plain_chains_cannot_carry_trails() {
    let program = ComputeProgram::trails().expect("trail program");
    let err = TrailAnimator::new(base(ChainVariantKind::Plain), TrailParams::default(), program).unwrap_err();
    assert!(matches!(skin_error(&err), Some(SkinError::InvalidChain(_))));

    let animator = trail_animator(ChainVariantKind::Trail);
    let described = format!("{animator:?}");
    assert!(described.starts_with("TrailAnimator"), "unexpected debug output {described}");
    assert!(described.contains("ready: false"));
}

#[test]
fn failed_trail_allocation_rolls_back_base() {
    let mut device = RecordingDevice::new();
    let mut animator = trail_animator(ChainVariantKind::Follow);
    device.fail_buffer_creation("trails.trails");
    let err = animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default());
    assert!(err.is_err());
    assert_eq!(device.live_buffers(), 0);
    assert!(!animator.is_ready());
    assert!(!animator.base().is_ready());
    assert!(!animator.extension().is_configured());
    assert_eq!(device.live_meshes(), 0);

    animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).expect("retry");
    assert_eq!(device.live_buffers(), 4);
    assert_eq!(device.live_meshes(), 1);
    animator.release(&mut device).expect("release");
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_meshes(), 0);
    animator.release(&mut device).expect("second release");
}

#[test]
fn every_mesh_upload_is_released_once() {
    let mut device = RecordingDevice::new();
    let mut animator = trail_animator(ChainVariantKind::Follow);
    device.fail_buffer_creation("trails.trails");
    assert!(animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).is_err());
    animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).expect("retry");
    animator.release(&mut device).expect("release");

    let uploaded: Vec<_> = device
        .commands()
        .iter()
        .filter_map(|cmd| match cmd {
            DeviceCommand::UploadMesh { mesh, .. } => Some(*mesh),
            _ => None,
        })
        .collect();
    let released: Vec<_> = device
        .commands()
        .iter()
        .filter_map(|cmd| match cmd {
            DeviceCommand::ReleaseMesh { mesh } => Some(*mesh),
            _ => None,
        })
        .collect();
    assert_eq!(uploaded.len(), 2, "the retry uploads the mesh again");
    assert_eq!(released, uploaded);
    assert_eq!(device.live_meshes(), 0);
}

#[test]
fn trail_release_frees_trails_before_base() {
    let mut device = RecordingDevice::new();
    let mut animator = trail_animator(ChainVariantKind::Trail);
    animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).expect("init");
    device.take_commands();
    animator.release(&mut device).expect("release");
    let released: Vec<_> = device
        .commands()
        .iter()
        .filter_map(|cmd| match cmd {
            DeviceCommand::ReleaseBuffer { buffer } => Some(*buffer),
            _ => None,
        })
        .collect();
    assert_eq!(released.len(), 4);
    // creation order: args, weights, bones, trails
    let raw: Vec<u32> = released.iter().map(|id| id.raw()).collect();
    assert_eq!(raw, vec![3, 2, 1, 0]);
    assert!(!animator.is_ready());
    assert!(animator.base().is_released());
}
