pub mod circuit;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod equations;
pub mod error;
pub mod executor;
pub mod expr;
pub mod output;
pub mod parser;
pub mod probes;
pub mod program;
pub mod simulator;
pub mod solver;
pub mod transient;

// Re-export commonly used types
pub use circuit::{Circuit, Component, ComponentType, Node, Polarity, Signal, Topology};
pub use config::{ExecutorLimits, Integration, SimulationParams};
pub use diagnostics::{Diagnostics, LogDiagnostics, MemoryDiagnostics, Severity};
pub use error::{BuildError, SimulationFault, SingularSystemError, TopologyError};
pub use executor::{Executor, OutputTarget, RunReport, Targets};
pub use parser::SpiceParser;
pub use simulator::{BuildHandle, BuildOutcome, NullSink, Processor, SignalSink, Simulation};
pub use transient::{compile, Discretization, TransientSolution};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
