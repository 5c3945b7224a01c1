/// Errors that can occur while minimizing.
///
/// Organized by how they arise:
/// - **Configuration**: problems detected before the engine starts
/// - **Verification**: the predicate rejected the original input
/// - **Runtime**: failures while the engine is running (spawn, IO)
/// - **Invariant**: impossible states; these indicate bugs, not user error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    // -- Configuration --
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The predicate script is missing or not executable.
    #[error("predicate {path} is not an executable file")]
    PredicateNotExecutable { path: String },

    /// The input file could not be read.
    #[error("cannot read input {path}: {message}")]
    InputUnreadable { path: String, message: String },

    // -- Verification --
    /// The predicate rejected the original, unmodified input.
    #[error(
        "the predicate reported the original input as uninteresting ({disposition}); \
         minimizing it would be meaningless. Check that the script reads stdin, has a \
         correct interpreter line, and exits 0 for interesting inputs, or pass \
         --noverify to skip this check"
    )]
    VerificationFailed { disposition: String },

    // -- Runtime --
    /// The predicate could not be spawned.
    #[error("failed to spawn predicate: {message}")]
    Spawn { message: String },

    /// An I/O error occurred. Candidate materialization depends on reliable
    /// storage, so these are fatal to the run.
    #[error("i/o error: {message}")]
    Io { message: String },

    // -- Invariant --
    /// The engine reached a state its invariants rule out.
    #[error("internal invariant violated: {reason}")]
    Invariant { reason: String },
}

impl EngineError {
    /// Whether the error was detectable before the engine started.
    ///
    /// All arms are listed explicitly so that adding a new variant forces a
    /// compile-time decision.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::InvalidConfig { .. }
            | Self::PredicateNotExecutable { .. }
            | Self::InputUnreadable { .. } => true,

            Self::VerificationFailed { .. }
            | Self::Spawn { .. }
            | Self::Io { .. }
            | Self::Invariant { .. } => false,
        }
    }

    /// Whether the error indicates an engine bug rather than an environment
    /// or usage problem.
    #[must_use]
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant { .. })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// A `Result` type alias using [`EngineError`].
pub type EngineResult<T> = Result<T, EngineError>;
