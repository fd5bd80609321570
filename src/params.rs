use glam::{Mat4, Vec2, Vec3, Vec4};

/// Largest simulation step fed to the trail kernels.
pub const MAX_TRAIL_DT: f32 = 0.1;

/// Uniform block shared by every skinning and trail dispatch (`struct Globals` in WGSL).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SkinGlobals {
    pub world_to_local: [[f32; 4]; 4],
    pub local_to_world: [[f32; 4]; 4],
    pub bind_matrix: [[f32; 4]; 4],
    pub bind_matrix_inv: [[f32; 4]; 4],
    pub time: [f32; 4],
    pub dt: [f32; 2],
    pub bones_count_inv: f32,
    pub flags: u32,
    pub instances_count: u32,
    pub bones_count: u32,
    pub _pad1: [u32; 2],
}

const _: () = assert!(std::mem::size_of::<SkinGlobals>() == 304);

/// Chain poses below the root are written by an extension program; Update only moves
/// the roots.
pub const SKIN_FLAG_EXTERNAL_POSE: u32 = 1 << 0;

/// Inputs of one base dispatch.
#[derive(Clone, Copy, Debug)]
pub struct DispatchInputs {
    pub instances_count: u32,
    pub bones_count: u32,
    pub elapsed: f32,
    pub dt: f32,
    pub world_to_local: Mat4,
    pub local_to_world: Mat4,
    pub bind: BindMatrices,
    pub flags: u32,
}

impl SkinGlobals {
    pub fn new(inputs: &DispatchInputs) -> Self {
        Self {
            world_to_local: inputs.world_to_local.to_cols_array_2d(),
            local_to_world: inputs.local_to_world.to_cols_array_2d(),
            bind_matrix: inputs.bind.matrix.to_cols_array_2d(),
            bind_matrix_inv: inputs.bind.inverse.to_cols_array_2d(),
            time: time_vector(inputs.elapsed).to_array(),
            dt: dt_pair(inputs.dt).to_array(),
            bones_count_inv: 1.0 / inputs.bones_count as f32,
            flags: inputs.flags,
            instances_count: inputs.instances_count,
            bones_count: inputs.bones_count,
            _pad1: [0; 2],
        }
    }
}

/// Rest-pose world transform the kernels measure deltas against, with its inverse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BindMatrices {
    pub matrix: Mat4,
    pub inverse: Mat4,
}

impl BindMatrices {
    pub fn from_matrix(matrix: Mat4) -> Self {
        Self { matrix, inverse: matrix.inverse() }
    }
}

/// Trail uniform block (`struct TrailGlobals` in WGSL).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TrailGlobals {
    pub damper: [f32; 2],
    pub speed_range: [f32; 2],
    pub gravity: [f32; 3],
    pub follow_intensity: f32,
    pub noise_params: [f32; 2],
    pub follow_delay: [f32; 2],
    pub noise_offset: [f32; 3],
    pub attractor_spread: f32,
    pub attractor: [f32; 3],
    pub unit_length: f32,
    pub bounds_min: [f32; 3],
    pub following_bone_count: u32,
    pub bounds_max: [f32; 3],
    pub flags: u32,
    pub center: [f32; 3],
    pub _pad: f32,
}

const _: () = assert!(std::mem::size_of::<TrailGlobals>() == 128);

pub const TRAIL_FLAG_FOLLOW: u32 = 1 << 0;
pub const TRAIL_FLAG_ATTRACTOR: u32 = 1 << 1;

/// Skin material uniform block (`struct Material` in `skin_material.wgsl`).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialUniforms {
    pub bind_matrix: [[f32; 4]; 4],
    pub bind_matrix_inv: [[f32; 4]; 4],
    pub world_to_local: [[f32; 4]; 4],
    pub local_to_world: [[f32; 4]; 4],
    pub bones_count: u32,
    pub bones_count_inv: f32,
    pub _pad: [u32; 2],
}

const _: () = assert!(std::mem::size_of::<MaterialUniforms>() == 272);

impl MaterialUniforms {
    pub fn new(bind: &BindMatrices, world_to_local: Mat4, local_to_world: Mat4, bones_count: u32) -> Self {
        Self {
            bind_matrix: bind.matrix.to_cols_array_2d(),
            bind_matrix_inv: bind.inverse.to_cols_array_2d(),
            world_to_local: world_to_local.to_cols_array_2d(),
            local_to_world: local_to_world.to_cols_array_2d(),
            bones_count,
            bones_count_inv: 1.0 / bones_count as f32,
            _pad: [0; 2],
        }
    }
}

/// `(t / 20, t, 2t, 3t)`: raw time plus the harmonics the kernels use for oscillation.
pub fn time_vector(t: f32) -> Vec4 {
    Vec4::new(t / 20.0, t, t * 2.0, t * 3.0)
}

/// `(dt, 1 / dt)`, with the reciprocal zeroed below machine epsilon.
pub fn dt_pair(dt: f32) -> Vec2 {
    let inv = if dt < f32::EPSILON { 0.0 } else { 1.0 / dt };
    Vec2::new(dt, inv)
}

pub fn clamp_trail_dt(dt: f32) -> f32 {
    dt.clamp(0.0, MAX_TRAIL_DT)
}

/// Frame-rate independent velocity decay for one step.
pub fn damping_factor(drag: f32, dt: f32) -> f32 {
    (-drag * dt).exp()
}

/// Direction the noise field drifts along: gravity when present, world up otherwise.
pub fn noise_direction(gravity: Vec3) -> Vec3 {
    if gravity == Vec3::ZERO {
        Vec3::Y
    } else {
        gravity.normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dt_reciprocal_guard() {
        assert_eq!(dt_pair(0.0), Vec2::ZERO);
        assert_eq!(dt_pair(f32::EPSILON * 0.5).y, 0.0);
        assert!((dt_pair(0.05).y - 20.0).abs() < 1e-4);
    }

    #[test]
    fn trail_dt_is_clamped() {
        assert_eq!(clamp_trail_dt(0.5), MAX_TRAIL_DT);
        assert_eq!(clamp_trail_dt(0.1), 0.1);
        assert_eq!(clamp_trail_dt(0.016), 0.016);
        assert_eq!(clamp_trail_dt(-1.0), 0.0);
    }

    #[test]
    fn damping_matches_exponential_decay() {
        assert!((damping_factor(0.1, 0.1) - (-0.01f32).exp()).abs() < 1e-7);
        assert!((damping_factor(0.1, 0.1) - 0.99005).abs() < 1e-5);
        for drag in [0.0, 0.1, 2.0, 15.0] {
            for dt in [0.0, 0.016, 0.1] {
                let factor = damping_factor(drag, dt);
                assert!(factor > 0.0 && factor <= 1.0, "drag {drag} dt {dt} gave {factor}");
            }
        }
    }

    #[test]
    fn globals_pack_counts_and_time() {
        let inputs = DispatchInputs {
            instances_count: 128,
            bones_count: 8,
            elapsed: 2.0,
            dt: 0.05,
            world_to_local: Mat4::IDENTITY,
            local_to_world: Mat4::IDENTITY,
            bind: BindMatrices::from_matrix(Mat4::from_translation(Vec3::X)),
            flags: SKIN_FLAG_EXTERNAL_POSE,
        };
        let globals = SkinGlobals::new(&inputs);
        assert_eq!(globals.time, [0.1, 2.0, 4.0, 6.0]);
        assert_eq!(globals.bones_count_inv, 0.125);
        assert_eq!((globals.instances_count, globals.bones_count), (128, 8));
        assert_eq!(globals.flags, SKIN_FLAG_EXTERNAL_POSE);
        let bind_inv = Mat4::from_cols_array_2d(&globals.bind_matrix_inv);
        assert!(bind_inv.abs_diff_eq(Mat4::from_translation(-Vec3::X), 1e-6));
    }

    #[test]
    fn noise_direction_defaults_to_up() {
        assert_eq!(noise_direction(Vec3::ZERO), Vec3::Y);
        assert_eq!(noise_direction(Vec3::new(0.0, -9.8, 0.0)), -Vec3::Y);
    }
}
