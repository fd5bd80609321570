use thiserror::Error;

/// Root causes surfaced by the skinning pipeline. Operations return `anyhow::Result`
/// and carry one of these when the failure belongs to the pipeline's own taxonomy,
/// so callers can `downcast_ref::<SkinError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkinError {
    #[error("compute program '{program}' has no kernel named '{kernel}'")]
    MissingKernel { program: String, kernel: String },
    #[error("invalid chain configuration: {0}")]
    InvalidChain(String),
    #[error("animator has not been initialized")]
    NotInitialized,
    #[error("animator is already initialized")]
    AlreadyInitialized,
    #[error("animator resources were already released")]
    Released,
    #[error("diagnostic read-back is disabled (set diagnostics.enabled)")]
    DiagnosticsDisabled,
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },
    #[error("program '{program}' expects {expected} bindings, dispatch supplied {actual}")]
    BindingMismatch { program: String, expected: usize, actual: usize },
}
