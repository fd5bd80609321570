//! Host-side checks over read-back bone and trail buffers. Reading back blocks on the
//! device, so these only run on explicit request.

use crate::skin_data::{GpuBone, GpuTrail};

/// Rotation contains a NaN or infinity.
pub fn bone_is_degenerate(bone: &GpuBone) -> bool {
    bone.rotation.iter().flatten().any(|value| !value.is_finite())
}

/// Frame vector with a NaN component or zero length.
pub fn trail_is_degenerate(trail: &GpuTrail) -> bool {
    trail.frame().iter().any(|axis| axis.is_nan() || axis.length_squared() <= 0.0 || axis.length() <= 0.0)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub checked: usize,
    /// `(instance, bone)` of every degenerate slot.
    pub degenerate: Vec<(u32, u32)>,
}

impl DiagnosticReport {
    pub fn is_healthy(&self) -> bool {
        self.degenerate.is_empty()
    }

    pub fn log(&self, what: &str) {
        if self.is_healthy() {
            log::info!("[diagnostics] {what}: {} slots ok", self.checked);
        } else {
            let preview: Vec<_> = self.degenerate.iter().take(8).collect();
            log::warn!(
                "[diagnostics] {what}: {} of {} slots degenerate, first {:?}",
                self.degenerate.len(),
                self.checked,
                preview
            );
        }
    }
}

fn scan<T>(records: &[T], bone_count: u32, degenerate: impl Fn(&T) -> bool) -> DiagnosticReport {
    let bone_count = bone_count.max(1) as usize;
    let degenerate = records
        .iter()
        .enumerate()
        .filter(|(_, record)| degenerate(*record))
        .map(|(index, _)| ((index / bone_count) as u32, (index % bone_count) as u32))
        .collect();
    DiagnosticReport { checked: records.len(), degenerate }
}

pub fn scan_bones(bones: &[GpuBone], bone_count: u32) -> DiagnosticReport {
    scan(bones, bone_count, bone_is_degenerate)
}

pub fn scan_trails(trails: &[GpuTrail], bone_count: u32) -> DiagnosticReport {
    scan(trails, bone_count, trail_is_degenerate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn upright_trail(position: Vec3) -> GpuTrail {
        GpuTrail {
            position: position.to_array(),
            normal: Vec3::X.to_array(),
            tangent: Vec3::NEG_Y.to_array(),
            binormal: Vec3::Z.to_array(),
            ..GpuTrail::default()
        }
    }

    #[test]
    fn nan_rotation_is_degenerate() {
        let mut bone = GpuBone::new(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);
        assert!(!bone_is_degenerate(&bone));
        bone.rotation[2][1] = f32::NAN;
        assert!(bone_is_degenerate(&bone));
        bone.rotation[2][1] = f32::INFINITY;
        assert!(bone_is_degenerate(&bone));
    }

    #[test]
    fn zero_or_nan_frames_are_degenerate() {
        let healthy = upright_trail(Vec3::ONE);
        assert!(!trail_is_degenerate(&healthy));
        assert!(trail_is_degenerate(&GpuTrail::default()));
        let mut nan = healthy;
        nan.binormal[0] = f32::NAN;
        assert!(trail_is_degenerate(&nan));
    }

    #[test]
    fn report_locates_instance_and_bone() {
        let mut trails = vec![upright_trail(Vec3::ZERO); 8];
        trails[5].tangent = [0.0; 3];
        let report = scan_trails(&trails, 4);
        assert_eq!(report.checked, 8);
        assert_eq!(report.degenerate, vec![(1, 1)]);
        assert!(!report.is_healthy());
    }
}
