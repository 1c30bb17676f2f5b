use serde::{Deserialize, Serialize};

use crate::error::BuildError;

/// Numerical integration rule used to discretize time derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Integration {
    /// `dx/dt ≈ (2/h)(x_n − x_{n-1}) − dx/dt|_{n-1}`. Second order, A-stable.
    #[default]
    Trapezoidal,
    /// `dx/dt ≈ (x_n − x_{n-1}) / h`. First order, L-stable, damps ringing.
    BackwardEuler,
}

/// Run-time numeric limits for a compiled executor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutorLimits {
    /// Newton stops once the largest update falls below this (volts/amps).
    pub tolerance: f64,
    /// Newton stops once the largest residual falls below this.
    pub residual_tolerance: f64,
    /// Any committed unknown beyond this magnitude is a divergence fault.
    pub max_magnitude: f64,
    /// Treat non-convergence within the iteration cap as fatal.
    pub strict: bool,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        ExecutorLimits {
            tolerance: 1e-9,
            residual_tolerance: 1e-15,
            max_magnitude: 1e6,
            strict: false,
        }
    }
}

/// Parameters consumed by the solution compiler and the real-time processor.
///
/// Sample rate, oversample factor and integration rule are baked into a
/// compiled solution; changing them requires a rebuild. Iterations and gains
/// are read on every buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    pub sample_rate: f64,
    pub oversample: usize,
    pub iterations: usize,
    pub integration: Integration,
    pub input_gain: f64,
    pub output_gain: f64,
    /// Largest block the processor handles in one executor call.
    pub max_block_size: usize,
    /// Maximum number of probes tapped at once.
    pub max_probes: usize,
    pub limits: ExecutorLimits,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            sample_rate: 48_000.0,
            oversample: 4,
            iterations: 8,
            integration: Integration::Trapezoidal,
            input_gain: 1.0,
            output_gain: 1.0,
            max_block_size: 4096,
            max_probes: 32,
            limits: ExecutorLimits::default(),
        }
    }
}

impl SimulationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_oversample(mut self, oversample: usize) -> Self {
        self.oversample = oversample;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_integration(mut self, integration: Integration) -> Self {
        self.integration = integration;
        self
    }

    pub fn with_gains(mut self, input_gain: f64, output_gain: f64) -> Self {
        self.input_gain = input_gain;
        self.output_gain = output_gain;
        self
    }

    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    pub fn with_limits(mut self, limits: ExecutorLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Internal time step `h = 1 / (sample_rate · oversample)`.
    pub fn time_step(&self) -> f64 {
        1.0 / (self.sample_rate * self.oversample as f64)
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(BuildError::invalid(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.oversample < 1 {
            return Err(BuildError::invalid("oversample factor must be at least 1"));
        }
        if self.iterations < 1 {
            return Err(BuildError::invalid("iteration cap must be at least 1"));
        }
        if self.max_block_size < 1 {
            return Err(BuildError::invalid("max block size must be at least 1"));
        }
        if !self.input_gain.is_finite() || !self.output_gain.is_finite() {
            return Err(BuildError::invalid("gains must be finite"));
        }
        if !(self.limits.max_magnitude > 0.0) || !(self.limits.tolerance >= 0.0) {
            return Err(BuildError::invalid("executor limits must be positive"));
        }
        Ok(())
    }
}
