use glam::Vec3;
use kestrel_procskin::animator::{AnimatorSettings, SkinAnimator};
use kestrel_procskin::chain::ChainTransform;
use kestrel_procskin::device::{DeviceCommand, RecordingDevice};
use kestrel_procskin::kernel::ComputeProgram;
use kestrel_procskin::mesh::{Mesh, MeshVertex};
use kestrel_procskin::skin_data::{decode_records, GpuBone, GpuBoneWeight};
use kestrel_procskin::time::FrameTime;
use kestrel_procskin::variant::{ChainVariantKind, PlainChain};
use kestrel_procskin::SkinDevice;

fn buffer_named(device: &RecordingDevice, name: &str) -> Vec<u8> {
    let id = device
        .commands()
        .iter()
        .find_map(|cmd| match cmd {
            DeviceCommand::CreateBuffer { buffer, label, .. } if label == name => Some(*buffer),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no buffer labelled {name}"));
    device.buffer_data(id).expect("buffer still live").to_vec()
}

fn single_chain(mesh: Mesh) -> (RecordingDevice, SkinAnimator) {
    let settings = AnimatorSettings { instances_count: 1, bone_count: 4, diagnostics: true };
    let program = ComputeProgram::skin().expect("skin program");
    let mut animator = SkinAnimator::new(Box::new(PlainChain), mesh, settings, program);
    let mut device = RecordingDevice::new();
    animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::new(0.0, 1.0 / 60.0)).expect("init");
    (device, animator)
}

#[test]
fn column_mesh_binds_along_four_bones() {
    let heights = [0.0, 1.5, 3.0];
    let vertices = heights.iter().map(|&y| MeshVertex::at(Vec3::new(0.0, y, 0.0))).collect();
    let (mut device, mut animator) = single_chain(Mesh::new(vertices, vec![0, 1, 2]));

    let weights: Vec<GpuBoneWeight> = decode_records(&buffer_named(&device, "procskin.weights"));
    assert_eq!(weights.len(), 3);
    assert_eq!((weights[0].bone_index0, weights[0].weight0), (3, 1.0));
    assert_eq!((weights[1].bone_index0, weights[1].bone_index1), (1, 2));
    assert!((weights[1].weight0 - 0.5).abs() < 1e-6 && (weights[1].weight1 - 0.5).abs() < 1e-6);
    assert_eq!((weights[2].bone_index0, weights[2].bone_index1, weights[2].weight0), (0, 0, 1.0));
    for weight in &weights {
        assert!((weight.weight0 + weight.weight1 - 1.0).abs() < 1e-6);
        assert_eq!([weight.weight2, weight.weight3], [0.0, 0.0]);
    }

    let bones: Vec<GpuBone> = decode_records(&buffer_named(&device, "procskin.bones"));
    let rest: Vec<f32> = bones.iter().map(|bone| bone.rest_translation().y).collect();
    assert_eq!(rest.len(), 4);
    for (height, expected) in rest.iter().zip([3.0, 2.0, 1.0, 0.0]) {
        assert!((height - expected).abs() < 1e-6, "rest heights {rest:?}");
    }
    for bone in &bones {
        assert!(bone.local_matrix().mul_mat4(&bone.offset_matrix()).abs_diff_eq(glam::Mat4::IDENTITY, 1e-5));
    }
    animator.release(&mut device).expect("release");
}

#[test]
fn draw_arguments_cover_every_instance() {
    let settings = AnimatorSettings { instances_count: 130, bone_count: 6, diagnostics: false };
    let mesh = Mesh::blade(3.0, 0.4, 6);
    let index_count = mesh.index_count();
    let program = ComputeProgram::skin().expect("skin program");
    let mut animator = SkinAnimator::new(ChainVariantKind::Plain.build(), mesh, settings, program);
    let mut device = RecordingDevice::new();
    animator.initialize(&mut device, &ChainTransform::IDENTITY, FrameTime::default()).expect("init");

    let args: Vec<[u32; 5]> = decode_records(&buffer_named(&device, "procskin.args"));
    assert_eq!(args, vec![[index_count, 130, 0, 0, 0]]);
    let bones = buffer_named(&device, "procskin.bones");
    assert_eq!(bones.len(), 130 * 6 * std::mem::size_of::<GpuBone>());
    let groups: Vec<[u32; 3]> = device
        .commands()
        .iter()
        .filter_map(|cmd| match cmd {
            DeviceCommand::Dispatch { groups, .. } => Some(*groups),
            _ => None,
        })
        .collect();
    assert_eq!(groups, vec![[3, 1, 1]; 2]);
    animator.release(&mut device).expect("release");
}

#[test]
fn owner_transform_places_rest_pose() {
    let settings = AnimatorSettings { instances_count: 2, bone_count: 3, diagnostics: false };
    let program = ComputeProgram::skin().expect("skin program");
    let mut animator = SkinAnimator::new(Box::new(PlainChain), Mesh::blade(2.0, 0.2, 4), settings, program);
    let mut device = RecordingDevice::new();
    let owner = ChainTransform::from_translation(Vec3::new(5.0, 1.0, 0.0));
    animator.initialize(&mut device, &owner, FrameTime::default()).expect("init");

    let bones: Vec<GpuBone> = decode_records(&buffer_named(&device, "procskin.bones"));
    assert_eq!(bones.len(), 6);
    assert!(bones[0].rest_translation().abs_diff_eq(Vec3::new(5.0, 3.0, 0.0), 1e-5));
    assert!(bones[5].rest_translation().abs_diff_eq(Vec3::new(5.0, 1.0, 0.0), 1e-5));
    assert_eq!(bones[0], bones[3]);
    assert!(animator.bind_matrices().matrix.abs_diff_eq(owner.local_to_world(), 1e-6));

    let id = device.commands().iter().find_map(|cmd| match cmd {
        DeviceCommand::CreateBuffer { buffer, label, .. } if label == "procskin.bones" => Some(*buffer),
        _ => None,
    });
    let id = id.expect("bones buffer");
    assert_eq!(device.read_buffer(id).expect("read").len(), 6 * std::mem::size_of::<GpuBone>());
    animator.release(&mut device).expect("release");
}
