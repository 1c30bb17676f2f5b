use thiserror::Error;

/// Structurally invalid circuit, detected while deriving equations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("Circuit has no ground node (named '0', 'gnd' or 'ground')")]
    MissingGround,

    #[error("Floating node '{node}' has no path to ground")]
    FloatingNode { node: String },

    #[error("Component {component} expects {expected} terminals, but has {found}")]
    TerminalMismatch {
        component: String,
        expected: usize,
        found: usize,
    },

    #[error("Component {component} has an invalid value: {message}")]
    InvalidValue { component: String, message: String },

    #[error("Duplicate component name '{name}'")]
    DuplicateComponent { name: String },

    #[error("Input source '{name}' not found in circuit")]
    UnknownInput { name: String },

    #[error("Input '{name}' is not an independent source")]
    InvalidInput { name: String },

    #[error("Output signal {signal} does not resolve to a circuit quantity")]
    UnknownOutput { signal: String },

    #[error("Unknown {unknown} does not appear in any equation (under-determined circuit)")]
    Underdetermined { unknown: String },
}

/// Linear elimination found no unique solution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SingularSystemError {
    #[error("Singular system: no pivot for unknown {unknown}")]
    NoPivot { unknown: String },

    #[error("Singular system: {equations} residual equations for {unknowns} iterated unknowns")]
    ResidualMismatch { equations: usize, unknowns: usize },
}

/// Run-time fault raised by the compiled executor.
///
/// Faults carry plain data so they can be constructed on the audio thread
/// without allocating.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SimulationFault {
    #[error("Numeric divergence: unknown #{index} reached {value:e}")]
    NumericDivergence { index: usize, value: f64 },

    #[error("Newton iteration did not converge within {iterations} iterations (step {residual:.2e})")]
    IterationLimitReached { iterations: usize, residual: f64 },

    #[error("Target #{target} holds {found} samples for an input of {expected}")]
    BufferMismatch { target: usize, expected: usize, found: usize },
}

/// Anything that stops a solution from being built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Singular(#[from] SingularSystemError),

    #[error("Invalid simulation parameter: {0}")]
    InvalidParameters(String),

    #[error("Build worker failed: {0}")]
    Worker(String),
}

impl BuildError {
    pub fn invalid(message: impl Into<String>) -> Self {
        BuildError::InvalidParameters(message.into())
    }
}
