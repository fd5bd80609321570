use anyhow::{anyhow, bail, Result};

use crate::error::SkinError;
use crate::params::{SkinGlobals, TrailGlobals};

pub const SETUP_KERNEL: &str = "Setup";
pub const UPDATE_KERNEL: &str = "Update";
pub const APPLY_KERNEL: &str = "Apply";

pub const SKIN_PROGRAM_WGSL: &str = include_str!("../assets/shaders/procskin.wgsl");
pub const TRAIL_PROGRAM_WGSL: &str = include_str!("../assets/shaders/trails.wgsl");

/// One group-0 binding of a compute program, in binding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingSlot {
    Uniform { size: u64 },
    Storage { read_only: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub workgroup_size: [u32; 3],
}

/// WGSL compute program plus its reflected `@compute` entry points.
#[derive(Clone, Debug)]
pub struct ComputeProgram {
    label: String,
    source: String,
    entry_points: Vec<EntryPoint>,
    layout: Vec<BindingSlot>,
}

impl ComputeProgram {
    pub fn from_wgsl(label: impl Into<String>, source: impl Into<String>, layout: Vec<BindingSlot>) -> Result<Self> {
        let label = label.into();
        let source = source.into();
        let module = naga::front::wgsl::parse_str(&source)
            .map_err(|err| anyhow!("Failed to parse compute program '{label}':\n{}", err.emit_to_string(&source)))?;
        let mut entry_points = Vec::new();
        for entry in module.entry_points.iter().filter(|entry| entry.stage == naga::ShaderStage::Compute) {
            if entry.workgroup_size.contains(&0) {
                bail!("Kernel '{}' in '{label}' must declare a constant workgroup size", entry.name);
            }
            entry_points.push(EntryPoint { name: entry.name.clone(), workgroup_size: entry.workgroup_size });
        }
        Ok(Self { label, source, entry_points, layout })
    }

    /// Bone kernels: globals, bones.
    pub fn skin() -> Result<Self> {
        Self::from_wgsl("procskin", SKIN_PROGRAM_WGSL, skin_layout())
    }

    /// Trail kernels: globals, trail globals, trails, bones.
    pub fn trails() -> Result<Self> {
        Self::from_wgsl("trails", TRAIL_PROGRAM_WGSL, trail_layout())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn layout(&self) -> &[BindingSlot] {
        &self.layout
    }

    fn find(&self, name: &str) -> Option<(usize, &EntryPoint)> {
        self.entry_points.iter().enumerate().find(|(_, entry)| entry.name == name)
    }
}

pub fn skin_layout() -> Vec<BindingSlot> {
    vec![
        BindingSlot::Uniform { size: std::mem::size_of::<SkinGlobals>() as u64 },
        BindingSlot::Storage { read_only: false },
    ]
}

pub fn trail_layout() -> Vec<BindingSlot> {
    vec![
        BindingSlot::Uniform { size: std::mem::size_of::<SkinGlobals>() as u64 },
        BindingSlot::Uniform { size: std::mem::size_of::<TrailGlobals>() as u64 },
        BindingSlot::Storage { read_only: false },
        // trail Apply writes the live pose back into the bones
        BindingSlot::Storage { read_only: false },
    ]
}

/// Resolved compute entry point. Only constructible through [`KernelHandle::find`], so a
/// handle always refers to an existing kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelHandle {
    program: String,
    name: String,
    index: usize,
    threads: [u32; 3],
}

impl KernelHandle {
    pub fn find(program: &ComputeProgram, name: &str) -> Result<Self> {
        let Some((index, entry)) = program.find(name) else {
            log::warn!("[kernel] Can't find kernel '{name}' in '{}'", program.label());
            return Err(SkinError::MissingKernel { program: program.label().to_string(), kernel: name.to_string() }
                .into());
        };
        Ok(Self { program: program.label().to_string(), name: entry.name.clone(), index, threads: entry.workgroup_size })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn thread_x(&self) -> u32 {
        self.threads[0]
    }

    pub fn thread_y(&self) -> u32 {
        self.threads[1]
    }

    pub fn thread_z(&self) -> u32 {
        self.threads[2]
    }

    /// One thread per instance along X. Kernels range-check their thread id against the
    /// instance count, so the last group may be partially idle.
    pub fn groups_for(&self, instances: u32) -> [u32; 3] {
        [instances.div_ceil(self.thread_x()), 1, 1]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelPhase {
    Setup,
    Update,
    Apply,
}

impl KernelPhase {
    pub fn name(self) -> &'static str {
        match self {
            KernelPhase::Setup => SETUP_KERNEL,
            KernelPhase::Update => UPDATE_KERNEL,
            KernelPhase::Apply => APPLY_KERNEL,
        }
    }
}

/// The Setup/Update/Apply trio every program exposes.
#[derive(Clone, Debug)]
pub struct KernelSet {
    pub setup: KernelHandle,
    pub update: KernelHandle,
    pub apply: KernelHandle,
}

impl KernelSet {
    pub fn resolve(program: &ComputeProgram) -> Result<Self> {
        Ok(Self {
            setup: KernelHandle::find(program, KernelPhase::Setup.name())?,
            update: KernelHandle::find(program, KernelPhase::Update.name())?,
            apply: KernelHandle::find(program, KernelPhase::Apply.name())?,
        })
    }

    pub fn get(&self, phase: KernelPhase) -> &KernelHandle {
        match phase {
            KernelPhase::Setup => &self.setup,
            KernelPhase::Update => &self.update,
            KernelPhase::Apply => &self.apply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_KERNELS: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<f32>;

@compute @workgroup_size(64)
fn Setup(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= arrayLength(&data)) { return; }
    data[id.x] = 0.0;
}

@compute @workgroup_size(8, 2, 1)
fn Update(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= arrayLength(&data)) { return; }
    data[id.x] = data[id.x] + 1.0;
}
"#;

    fn program() -> ComputeProgram {
        ComputeProgram::from_wgsl("test", TWO_KERNELS, vec![BindingSlot::Storage { read_only: false }])
            .expect("program parses")
    }

    #[test]
    fn reflects_workgroup_sizes() {
        let program = program();
        let update = KernelHandle::find(&program, "Update").expect("update kernel");
        assert_eq!(update.index(), 1);
        assert_eq!((update.thread_x(), update.thread_y(), update.thread_z()), (8, 2, 1));
    }

    #[test]
    fn missing_kernel_is_configuration_error() {
        let err = KernelHandle::find(&program(), "Apply").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SkinError>(),
            Some(&SkinError::MissingKernel { program: "test".into(), kernel: "Apply".into() })
        );
        assert!(KernelSet::resolve(&program()).is_err());
    }

    #[test]
    fn groups_use_exact_ceiling() {
        let setup = KernelHandle::find(&program(), "Setup").expect("setup kernel");
        assert_eq!(setup.groups_for(128), [2, 1, 1]);
        assert_eq!(setup.groups_for(129), [3, 1, 1]);
        assert_eq!(setup.groups_for(1), [1, 1, 1]);
    }

    #[test]
    fn bundled_programs_expose_three_phases() {
        for program in [ComputeProgram::skin().expect("skin program"), ComputeProgram::trails().expect("trail program")] {
            let kernels = KernelSet::resolve(&program).expect("kernels");
            assert!(kernels.setup.thread_x() > 0);
            for phase in [KernelPhase::Setup, KernelPhase::Update, KernelPhase::Apply] {
                assert_eq!(kernels.get(phase).name(), phase.name());
            }
        }
    }

    #[test]
    fn malformed_source_reports_parse_error() {
        let err = ComputeProgram::from_wgsl("broken", "fn Setup( {", Vec::new()).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
