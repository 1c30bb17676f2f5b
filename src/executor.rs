use std::sync::Arc;

use nalgebra::DVector;

use crate::circuit::Signal;
use crate::config::ExecutorLimits;
use crate::equations::Tap;
use crate::error::SimulationFault;
use crate::expr::Expr;
use crate::program::{Layout, Lowering, Program};
use crate::solver::LuSolver;
use crate::transient::TransientSolution;

/// Targets beyond this count are resolved on every sample.
pub const MAX_CACHED_TAPS: usize = 32;

/// Relative diagonal shift applied when the Newton Jacobian fails to factor.
const JACOBIAN_SHIFT: f64 = 1e-9;

/// Caller-owned output buffers keyed by the signal they receive.
pub trait Targets {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn signal(&self, index: usize) -> &Signal;

    fn buffer(&mut self, index: usize) -> &mut [f64];
}

/// A signal paired with the buffer it is written into.
#[derive(Debug)]
pub struct OutputTarget<'a> {
    pub signal: &'a Signal,
    pub samples: &'a mut [f64],
}

impl<'a> OutputTarget<'a> {
    pub fn new(signal: &'a Signal, samples: &'a mut [f64]) -> Self {
        OutputTarget { signal, samples }
    }
}

impl Targets for [OutputTarget<'_>] {
    fn len(&self) -> usize {
        <[OutputTarget<'_>]>::len(self)
    }

    fn signal(&self, index: usize) -> &Signal {
        self[index].signal
    }

    fn buffer(&mut self, index: usize) -> &mut [f64] {
        &mut *self[index].samples
    }
}

/// Summary of one `run` call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunReport {
    pub samples: usize,
    pub ticks: usize,
    /// Ticks whose Newton iteration hit the cap without converging.
    pub unconverged: usize,
    /// Most Newton iterations spent on a single tick.
    pub max_iterations: usize,
}

/// Outcome of a single Newton solve.
#[derive(Debug, Clone, Copy)]
struct NewtonOutcome {
    iterations: usize,
    converged: bool,
    step: f64,
}

pub struct Executor {
    solution: Arc<TransientSolution>,
    oversample: usize,
    limits: ExecutorLimits,
    layout: Layout,
    frame: Vec<f64>,
    initial_frame: Vec<f64>,
    residual: Program,
    jacobian: Program,
    updates: Program,
    update_targets: Vec<usize>,
    newton: LuSolver,
    step: DVector<f64>,
    fault: Option<SimulationFault>,
}

impl Executor {
    pub fn new(solution: Arc<TransientSolution>, oversample: usize, limits: ExecutorLimits) -> Self {
        let layout = Layout::new(solution.unknown_count());
        let mut lowering = Lowering::new(layout);
        let residual = lowering.lower(&solution.residuals);
        let jacobian = lowering.lower(&solution.jacobian);
        let update_exprs: Vec<Expr> = solution.updates.iter().map(|(_, e)| e.clone()).collect();
        let updates = lowering.lower(&update_exprs);
        let update_targets = solution.updates.iter().map(|(k, _)| *k).collect();

        let frame = lowering.frame();
        let iterated = solution.iterated.len();
        Executor {
            oversample: oversample.max(1),
            limits,
            layout,
            initial_frame: frame.clone(),
            frame,
            residual,
            jacobian,
            updates,
            update_targets,
            newton: LuSolver::new(iterated),
            step: DVector::zeros(iterated),
            fault: None,
            solution,
        }
    }

    pub fn solution(&self) -> &Arc<TransientSolution> {
        &self.solution
    }

    pub fn oversample(&self) -> usize {
        self.oversample
    }

    pub fn limits(&self) -> ExecutorLimits {
        self.limits
    }

    /// Fault that stopped this executor, if any.
    pub fn fault(&self) -> Option<SimulationFault> {
        self.fault
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// Current value of every unknown.
    pub fn state(&self) -> &[f64] {
        &self.frame[..self.solution.unknown_count()]
    }

    /// Evaluate a tap against the current state.
    pub fn value(&self, tap: &Tap) -> f64 {
        tap.eval(self.state())
    }

    /// Discard all history and return to the zero initial state.
    ///
    /// A faulted executor stays faulted; it has to be rebuilt.
    pub fn reset(&mut self) {
        self.frame.copy_from_slice(&self.initial_frame);
    }

    /// Simulate one buffer of input samples, writing every resolvable target.
    ///
    /// `iterations` caps the Newton iterations per internal tick. On a fault
    /// every target buffer is zeroed and the executor refuses further work.
    /// Every target buffer must be as long as `input`; otherwise nothing is
    /// simulated, the targets are zeroed and the state is left untouched.
    pub fn run<T: Targets + ?Sized>(
        &mut self,
        input: &[f64],
        targets: &mut T,
        iterations: usize,
    ) -> Result<RunReport, SimulationFault> {
        if let Some(fault) = self.fault {
            silence(targets);
            return Err(fault);
        }

        let count = targets.len();
        for i in 0..count {
            let found = targets.buffer(i).len();
            if found != input.len() {
                silence(targets);
                return Err(SimulationFault::BufferMismatch {
                    target: i,
                    expected: input.len(),
                    found,
                });
            }
        }

        let mut taps = [None; MAX_CACHED_TAPS];
        for (i, tap) in taps.iter_mut().enumerate().take(count) {
            *tap = self.solution.resolve(targets.signal(i));
        }
        for i in 0..count {
            let resolved = if i < MAX_CACHED_TAPS {
                taps[i].is_some()
            } else {
                self.solution.resolve(targets.signal(i)).is_some()
            };
            if !resolved {
                targets.buffer(i).fill(0.0);
            }
        }

        let cap = iterations.max(1);
        let unknowns = self.solution.unknown_count();
        let mut report = RunReport::default();

        for (n, &sample) in input.iter().enumerate() {
            for _ in 0..self.oversample {
                match self.tick(sample, cap) {
                    Ok(outcome) => {
                        report.ticks += 1;
                        report.max_iterations = report.max_iterations.max(outcome.iterations);
                        if !outcome.converged {
                            report.unconverged += 1;
                        }
                    }
                    Err(fault) => {
                        self.fault = Some(fault);
                        silence(targets);
                        return Err(fault);
                    }
                }
            }

            for i in 0..count {
                let tap = if i < MAX_CACHED_TAPS {
                    taps[i]
                } else {
                    self.solution.resolve(targets.signal(i))
                };
                if let Some(tap) = tap {
                    let value = tap.eval(&self.frame[..unknowns]);
                    targets.buffer(i)[n] = value;
                }
            }
            report.samples += 1;
        }

        Ok(report)
    }

    /// Advance the state by one internal time step.
    fn tick(&mut self, input: f64, cap: usize) -> Result<NewtonOutcome, SimulationFault> {
        self.frame[self.layout.input()] = input;

        let outcome = self.newton(cap);
        if !outcome.converged && self.limits.strict {
            return Err(SimulationFault::IterationLimitReached {
                iterations: outcome.iterations,
                residual: outcome.step,
            });
        }

        self.updates.execute(&mut self.frame);
        for (i, &k) in self.update_targets.iter().enumerate() {
            self.frame[k] = self.frame[self.updates.output(i)];
        }

        let unknowns = self.solution.unknown_count();
        for (index, &value) in self.frame[..unknowns].iter().enumerate() {
            if !value.is_finite() || value.abs() > self.limits.max_magnitude {
                return Err(SimulationFault::NumericDivergence { index, value });
            }
        }

        let discretization = self.solution.discretization;
        for &k in &self.solution.differentiated {
            let derivative = discretization.derivative_value(
                self.frame[self.layout.unknown(k)],
                self.frame[self.layout.previous(k)],
                self.frame[self.layout.previous_derivative(k)],
            );
            self.frame[self.layout.previous_derivative(k)] = derivative;
        }
        for k in 0..unknowns {
            self.frame[self.layout.previous(k)] = self.frame[self.layout.unknown(k)];
        }

        Ok(outcome)
    }

    /// Newton-Raphson on the iterated unknowns, warm-started from the last commit.
    fn newton(&mut self, cap: usize) -> NewtonOutcome {
        let size = self.solution.iterated.len();
        let mut outcome = NewtonOutcome {
            iterations: 0,
            converged: size == 0,
            step: 0.0,
        };
        if size == 0 {
            return outcome;
        }

        for _ in 0..cap {
            self.residual.execute(&mut self.frame);
            let mut residual_norm = 0.0f64;
            for r in 0..size {
                let value = self.frame[self.residual.output(r)];
                self.step[r] = value;
                residual_norm = residual_norm.max(value.abs());
            }
            if residual_norm < self.limits.residual_tolerance {
                outcome.converged = true;
                break;
            }

            self.jacobian.execute(&mut self.frame);
            self.load_jacobian(0.0);
            if self.newton.factor().is_err() {
                // Retry as a damped step on a diagonally shifted Jacobian.
                let scale = (0..size)
                    .map(|r| self.frame[self.jacobian.output(r * size + r)].abs())
                    .filter(|v| v.is_finite())
                    .fold(0.0f64, f64::max);
                self.load_jacobian(JACOBIAN_SHIFT * scale + f64::EPSILON);
                if self.newton.factor().is_err() {
                    self.restore_iterated();
                    break;
                }
            }
            self.newton.solve_in_place(&mut self.step);

            let mut step_norm = 0.0f64;
            for c in 0..size {
                step_norm = step_norm.max(self.step[c].abs());
            }
            if !step_norm.is_finite() {
                self.restore_iterated();
                break;
            }
            for (c, &k) in self.solution.iterated.iter().enumerate() {
                self.frame[k] -= self.step[c];
            }
            outcome.iterations += 1;
            outcome.step = step_norm;
            if step_norm < self.limits.tolerance {
                outcome.converged = true;
                break;
            }
        }
        outcome
    }

    /// Copy the evaluated Jacobian into the Newton solver, adding `shift` to the diagonal.
    fn load_jacobian(&mut self, shift: f64) {
        let size = self.solution.iterated.len();
        let matrix = self.newton.matrix_mut();
        for r in 0..size {
            for c in 0..size {
                matrix[(r, c)] = self.frame[self.jacobian.output(r * size + c)];
            }
            matrix[(r, r)] += shift;
        }
    }

    /// Put the iterated unknowns back on the last committed state.
    fn restore_iterated(&mut self) {
        for &k in &self.solution.iterated {
            self.frame[k] = self.frame[self.layout.previous(k)];
        }
    }
}

fn silence<T: Targets + ?Sized>(targets: &mut T) {
    for i in 0..targets.len() {
        targets.buffer(i).fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::circuit::{Circuit, Component, Polarity, Topology};
    use crate::config::SimulationParams;
    use crate::transient::compile;

    fn executor(topology: &Topology, params: &SimulationParams) -> Executor {
        let solution = compile(topology, params).unwrap();
        Executor::new(Arc::new(solution), params.oversample, params.limits)
    }

    fn render(executor: &mut Executor, signal: &Signal, input: &[f64], iterations: usize) -> Vec<f64> {
        let mut output = vec![0.0; input.len()];
        let mut targets = [OutputTarget::new(signal, &mut output)];
        executor.run(input, &mut targets[..], iterations).unwrap();
        output
    }

    fn divider() -> Topology {
        let circuit = Circuit::new("divider")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "mid", 1e3)))
            .and_then(|c| c.with(Component::resistor("R2", "mid", "0", 1e3)))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("mid"))
    }

    fn rc() -> Topology {
        let circuit = Circuit::new("rc")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "out", 1e3)))
            .and_then(|c| c.with(Component::capacitor("C1", "out", "0", 1e-6)))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("out"))
    }

    fn clipper() -> Topology {
        let circuit = Circuit::new("clipper")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "out", 1e3)))
            .and_then(|c| c.with(Component::capacitor("C1", "out", "0", 10e-9)))
            .and_then(|c| c.with(Component::diode("D1", "out", "0")))
            .and_then(|c| c.with(Component::diode("D2", "0", "out")))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("out"))
    }

    fn unstable() -> Topology {
        // The VCVS feeds twice the node voltage back through R2, a negative
        // resistance stronger than R1.
        let circuit = Circuit::new("unstable")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "n1", 10e3)))
            .and_then(|c| c.with(Component::capacitor("C1", "n1", "0", 1e-6)))
            .and_then(|c| c.with(Component::vcvs("E1", "n2", "0", "n1", "0", 2.0)))
            .and_then(|c| c.with(Component::resistor("R2", "n2", "n1", 1e3)))
            .and_then(|c| c.with(Component::diode("D1", "0", "n1")))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("n1"))
    }

    fn rl() -> Topology {
        let circuit = Circuit::new("rl")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "out", 1e3)))
            .and_then(|c| c.with(Component::inductor("L1", "out", "0", 1.0)))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("out"))
    }

    fn common_emitter() -> Topology {
        let circuit = Circuit::new("common emitter")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::voltage_source("VCC", "vcc", "0", 9.0)))
            .and_then(|c| c.with(Component::resistor("RB", "in", "b", 10e3)))
            .and_then(|c| c.with(Component::resistor("RC", "vcc", "c", 4.7e3)))
            .and_then(|c| c.with(Component::resistor("RE", "e", "0", 1e3)))
            .and_then(|c| c.with(Component::bjt("Q1", Polarity::Npn, "c", "b", "e")))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("c"))
    }

    fn sine(samples: usize, amplitude: f64, frequency: f64, rate: f64) -> Vec<f64> {
        (0..samples)
            .map(|n| amplitude * (2.0 * std::f64::consts::PI * frequency * n as f64 / rate).sin())
            .collect()
    }

    #[test]
    fn test_divider_independent_of_oversample() {
        for oversample in [1, 4] {
            let params = SimulationParams::default().with_oversample(oversample);
            let topology = divider();
            let mut executor = executor(&topology, &params);
            let output = render(&mut executor, &topology.output, &[1.0; 16], 8);
            for value in output {
                assert!((value - 0.5).abs() < 1e-12, "oversample {}: {}", oversample, value);
            }
        }
    }

    fn rc_step_error(oversample: usize) -> f64 {
        let params = SimulationParams::default().with_oversample(oversample);
        let topology = rc();
        let mut executor = executor(&topology, &params);
        let output = render(&mut executor, &topology.output, &[1.0; 96], 8);

        let period = 1.0 / params.sample_rate;
        let h = params.time_step();
        let tau = 1e-3;
        output
            .iter()
            .enumerate()
            .map(|(k, v)| {
                // The step enters through the first tick, centred half a step late.
                let t = (k + 1) as f64 * period - h / 2.0;
                (v - (1.0 - (-t / tau).exp())).abs()
            })
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_rc_step_response_converges_with_oversampling() {
        let coarse = rc_step_error(1);
        let fine = rc_step_error(2);
        assert!(coarse < 1e-3, "error at oversample 1: {}", coarse);
        assert!(fine < 0.4 * coarse, "error {} did not shrink from {}", fine, coarse);
    }

    #[test]
    fn test_zero_input_stays_quiescent() {
        for topology in [rc(), clipper()] {
            let params = SimulationParams::default();
            let mut executor = executor(&topology, &params);
            for _ in 0..8 {
                let output = render(&mut executor, &topology.output, &[0.0; 256], 8);
                assert!(output.iter().all(|&v| v == 0.0));
            }
        }
    }

    #[test]
    fn test_divergence_is_contained() {
        let params = SimulationParams::default().with_oversample(1);
        let topology = unstable();
        let mut executor = executor(&topology, &params);

        let input = [0.1; 480];
        let mut output = vec![0.0; input.len()];
        let mut fault = None;
        for _ in 0..20 {
            let mut targets = [OutputTarget::new(&topology.output, &mut output)];
            if let Err(f) = executor.run(&input, &mut targets[..], 8) {
                fault = Some(f);
                break;
            }
        }

        assert!(matches!(fault, Some(SimulationFault::NumericDivergence { .. })));
        assert!(output.iter().all(|v| *v == 0.0));

        // A faulted executor keeps emitting silence, even after reset.
        executor.reset();
        output.fill(1.0);
        let mut targets = [OutputTarget::new(&topology.output, &mut output)];
        assert!(executor.run(&input, &mut targets[..], 8).is_err());
        assert!(output.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_iteration_cap_degrades_gracefully() {
        let params = SimulationParams::default();
        let topology = clipper();
        let input = sine(960, 1.0, 1000.0, params.sample_rate);

        let mut converged = executor(&topology, &params);
        let reference = render(&mut converged, &topology.output, &input, 10);

        let mut capped = executor(&topology, &params);
        let mut output = vec![0.0; input.len()];
        let mut targets = [OutputTarget::new(&topology.output, &mut output)];
        let report = capped.run(&input, &mut targets[..], 1).unwrap();
        assert_eq!(report.max_iterations, 1);

        let worst = reference
            .iter()
            .zip(&output)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(worst < 0.05, "capped error {}", worst);
        assert!(reference.iter().any(|v| *v > 0.3));
    }

    #[test]
    fn test_strict_mode_faults_on_unconverged_tick() {
        let mut params = SimulationParams::default();
        params.limits.strict = true;
        let topology = clipper();
        let mut executor = executor(&topology, &params);

        let mut output = vec![0.0; 4];
        let mut targets = [OutputTarget::new(&topology.output, &mut output)];
        let result = executor.run(&[1.0; 4], &mut targets[..], 1);
        assert!(matches!(result, Err(SimulationFault::IterationLimitReached { .. })));
    }

    #[test]
    fn test_unresolved_targets_are_zeroed() {
        let params = SimulationParams::default();
        let topology = divider();
        let mut executor = executor(&topology, &params);

        let missing = Signal::voltage("nowhere");
        let current = Signal::current("R1");
        let mut a = vec![0.0; 4];
        let mut b = vec![7.0; 4];
        let mut c = vec![0.0; 4];
        let mut targets = [
            OutputTarget::new(&topology.output, &mut a),
            OutputTarget::new(&missing, &mut b),
            OutputTarget::new(&current, &mut c),
        ];
        executor.run(&[2.0; 4], &mut targets[..], 8).unwrap();
        assert!(a.iter().all(|v| (v - 1.0).abs() < 1e-12));
        assert!(b.iter().all(|v| *v == 0.0));
        assert!(c.iter().all(|v| (v - 1e-3).abs() < 1e-15));
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let params = SimulationParams::default();
        let topology = rc();
        let mut executor = executor(&topology, &params);

        let first = render(&mut executor, &topology.output, &[1.0; 32], 8);
        executor.reset();
        assert!(executor.state().iter().all(|v| *v == 0.0));
        let second = render(&mut executor, &topology.output, &[1.0; 32], 8);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rl_step_response() {
        let params = SimulationParams::default().with_oversample(1);
        let topology = rl();
        let mut executor = executor(&topology, &params);
        let output = render(&mut executor, &topology.output, &[1.0; 96], 8);

        let period = 1.0 / params.sample_rate;
        let h = params.time_step();
        let tau = 1e-3;
        for (k, v) in output.iter().enumerate() {
            let t = (k + 1) as f64 * period - h / 2.0;
            let expected = (-t / tau).exp();
            assert!((v - expected).abs() < 1e-3, "sample {}: {} vs {}", k, v, expected);
        }

        let current = Signal::current("L1");
        let mut i = vec![0.0; 1];
        let mut targets = [OutputTarget::new(&current, &mut i)];
        executor.run(&[1.0], &mut targets[..], 8).unwrap();
        assert!(i[0] > 0.85e-3 && i[0] < 1e-3, "inductor current {}", i[0]);
    }

    #[test]
    fn test_bjt_operating_point_from_driven_base() {
        let params = SimulationParams::default();
        let topology = common_emitter();
        let mut executor = executor(&topology, &params);

        let settle = render(&mut executor, &topology.output, &[2.0; 480], 50);
        assert!(settle.iter().all(|v| v.is_finite()));

        let mut output = vec![0.0; 480];
        let mut targets = [OutputTarget::new(&topology.output, &mut output)];
        let report = executor.run(&[2.0; 480], &mut targets[..], 50).unwrap();
        assert_eq!(report.unconverged, 0);

        // Vbe near 0.66 V gives Ic = beta * 1.34 V / (RB + (beta + 1) RE).
        for v in output {
            assert!((v - 3.32).abs() < 0.05, "collector at {}", v);
        }
    }

    #[test]
    fn test_bjt_cutoff_keeps_collector_at_supply() {
        let params = SimulationParams::default();
        let topology = common_emitter();
        let mut executor = executor(&topology, &params);
        let output = render(&mut executor, &topology.output, &[0.0; 64], 8);
        for v in output {
            assert!((v - 9.0).abs() < 1e-6, "collector at {}", v);
        }
    }

    #[test]
    fn test_current_source_pushes_from_first_to_second_terminal() {
        let circuit = Circuit::new("current source")
            .with(Component::current_source("I1", "a", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "a", "0", 2e3)))
            .unwrap();
        let topology = Topology::new(circuit, "I1", Signal::voltage("a"));
        let params = SimulationParams::default();
        let mut executor = executor(&topology, &params);

        let output = render(&mut executor, &topology.output, &[1e-3; 8], 8);
        for v in output {
            assert_relative_eq!(v, -2.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_vcvs_scales_control_voltage() {
        let circuit = Circuit::new("buffer")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "0", 10e3)))
            .and_then(|c| c.with(Component::vcvs("E1", "out", "0", "in", "0", 3.0)))
            .and_then(|c| c.with(Component::resistor("RL", "out", "0", 1e3)))
            .unwrap();
        let topology = Topology::new(circuit, "V1", Signal::voltage("out"));
        let params = SimulationParams::default();
        let mut executor = executor(&topology, &params);

        let input = sine(48, 0.5, 1000.0, params.sample_rate);
        let output = render(&mut executor, &topology.output, &input, 8);
        for (x, y) in input.iter().zip(&output) {
            assert!((y - 3.0 * x).abs() < 1e-12);
        }
    }

    #[test]
    fn test_short_target_buffer_is_rejected() {
        let params = SimulationParams::default();
        let topology = rc();
        let mut executor = executor(&topology, &params);

        let mut output = vec![5.0; 3];
        let mut targets = [OutputTarget::new(&topology.output, &mut output)];
        let result = executor.run(&[1.0; 4], &mut targets[..], 8);
        assert_eq!(
            result,
            Err(SimulationFault::BufferMismatch {
                target: 0,
                expected: 4,
                found: 3
            })
        );
        assert_eq!(output, vec![0.0; 3]);

        // Nothing was simulated and the executor stays usable.
        assert!(!executor.is_faulted());
        assert!(executor.state().iter().all(|v| *v == 0.0));
        let first = render(&mut executor, &topology.output, &[1.0; 4], 8);
        assert!(first[0] > 0.0);
    }
}
