use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwapOption;
use log::debug;

use crate::circuit::{Signal, Topology};
use crate::config::SimulationParams;
use crate::diagnostics::Diagnostics;
use crate::error::BuildError;
use crate::executor::{Executor, Targets};
use crate::probes::{ProbeChannel, ProbeRegistry};
use crate::transient::{self, TransientSolution};

/// Executors waiting to be freed off the audio thread.
const RETIRED_CAPACITY: usize = 4;

/// Consumer of computed sample streams, typically a scope display.
pub trait SignalSink {
    fn signal(&mut self, signal: &Signal, samples: &[f64], sample_rate: f64);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SignalSink for NullSink {
    fn signal(&mut self, _signal: &Signal, _samples: &[f64], _sample_rate: f64) {}
}

/// Result of one background build.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// The build became the live solution.
    Published { version: u64 },
    /// A newer request arrived first; the result was discarded.
    Superseded { version: u64 },
    /// The build failed; the previous solution stays live.
    Failed(BuildError),
}

/// Handle to a background build.
#[derive(Debug)]
pub struct BuildHandle {
    version: u64,
    worker: Option<JoinHandle<BuildOutcome>>,
    outcome: Option<BuildOutcome>,
}

impl BuildHandle {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Block until the build completes.
    pub fn wait(mut self) -> BuildOutcome {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => BuildOutcome::Failed(BuildError::Worker("build worker panicked".to_string())),
            None => BuildOutcome::Failed(BuildError::Worker("build already joined".to_string())),
        }
    }
}

struct Shared {
    params: Mutex<SimulationParams>,
    topology: Mutex<Option<Topology>>,
    requested: AtomicU64,
    published: AtomicU64,
    /// Makes "check version, then publish" atomic among build workers.
    publish_lock: Mutex<()>,
    pending: ArcSwapOption<Executor>,
    retired: Mutex<Vec<Arc<Executor>>>,
    latest: ArcSwapOption<TransientSolution>,
    iterations: AtomicUsize,
    input_gain: AtomicU64,
    output_gain: AtomicU64,
    probes: ProbeRegistry,
    diagnostics: Arc<dyn Diagnostics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn build(&self, version: u64, topology: Topology, params: SimulationParams) -> BuildOutcome {
        let result = transient::compile(&topology, &params).map(|solution| {
            let solution = Arc::new(solution);
            let executor = Executor::new(Arc::clone(&solution), params.oversample, params.limits);
            (solution, executor)
        });

        let _guard = lock(&self.publish_lock);
        if self.requested.load(Ordering::SeqCst) != version {
            debug!("Discarding stale build {}", version);
            return BuildOutcome::Superseded { version };
        }

        match result {
            Ok((solution, executor)) => {
                {
                    let mut retired = lock(&self.retired);
                    retired.clear();
                    retired.reserve(RETIRED_CAPACITY);
                }
                self.diagnostics.info(&format!(
                    "Built '{}': {} unknowns, {} iterated, oversample {}",
                    topology.circuit.title,
                    solution.unknown_count(),
                    solution.iterated.len(),
                    params.oversample
                ));
                self.pending.store(Some(Arc::new(executor)));
                self.latest.store(Some(solution));
                self.published.store(version, Ordering::SeqCst);
                BuildOutcome::Published { version }
            }
            Err(error) => {
                self.diagnostics
                    .error(&format!("Build of '{}' failed: {}", topology.circuit.title, error));
                BuildOutcome::Failed(error)
            }
        }
    }
}

/// Editor-side handle of a live simulation.
pub struct Simulation {
    shared: Arc<Shared>,
}

impl Simulation {
    /// Create a simulation and its real-time processor. Nothing is built yet.
    pub fn new(params: SimulationParams, diagnostics: Arc<dyn Diagnostics>) -> (Simulation, Processor) {
        let shared = Arc::new(Shared {
            iterations: AtomicUsize::new(params.iterations.max(1)),
            input_gain: AtomicU64::new(params.input_gain.to_bits()),
            output_gain: AtomicU64::new(params.output_gain.to_bits()),
            probes: ProbeRegistry::new(params.max_probes, params.max_block_size.max(1)),
            requested: AtomicU64::new(0),
            published: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
            pending: ArcSwapOption::empty(),
            retired: Mutex::new(Vec::with_capacity(RETIRED_CAPACITY)),
            latest: ArcSwapOption::empty(),
            topology: Mutex::new(None),
            diagnostics,
            params: Mutex::new(params.clone()),
        });

        let processor = Processor {
            shared: Arc::clone(&shared),
            executor: None,
            scratch: vec![0.0; params.max_block_size.max(1)],
            channels: Vec::with_capacity(params.max_probes),
            probe_generation: 0,
            block_size: params.max_block_size.max(1),
        };
        (Simulation { shared }, processor)
    }

    /// Start building `topology` in the background. The current solution
    /// stays live until the build publishes.
    pub fn rebuild(&self, topology: Topology) -> BuildHandle {
        *lock(&self.shared.topology) = Some(topology.clone());
        self.spawn(topology)
    }

    fn spawn(&self, topology: Topology) -> BuildHandle {
        let version = self.shared.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let params = lock(&self.shared.params).clone();
        let shared = Arc::clone(&self.shared);

        let worker = thread::Builder::new()
            .name(format!("livesim-build-{}", version))
            .spawn(move || shared.build(version, topology, params));

        match worker {
            Ok(worker) => BuildHandle {
                version,
                worker: Some(worker),
                outcome: None,
            },
            Err(e) => {
                let error = BuildError::Worker(e.to_string());
                self.shared.diagnostics.error(&error.to_string());
                BuildHandle {
                    version,
                    worker: None,
                    outcome: Some(BuildOutcome::Failed(error)),
                }
            }
        }
    }

    /// Rebuild the last topology with the current parameters, if there is one.
    fn respawn(&self) -> Option<BuildHandle> {
        let topology = lock(&self.shared.topology).clone()?;
        Some(self.spawn(topology))
    }

    /// Change the oversample factor. Requires a rebuild, which is started here.
    pub fn set_oversample(&self, oversample: usize) -> Option<BuildHandle> {
        lock(&self.shared.params).oversample = oversample;
        self.respawn()
    }

    /// Change the sample rate. Requires a rebuild, which is started here.
    pub fn set_sample_rate(&self, sample_rate: f64) -> Option<BuildHandle> {
        lock(&self.shared.params).sample_rate = sample_rate;
        self.respawn()
    }

    /// Newton iteration cap, applied from the next buffer on.
    pub fn set_iterations(&self, iterations: usize) {
        let iterations = iterations.max(1);
        lock(&self.shared.params).iterations = iterations;
        self.shared.iterations.store(iterations, Ordering::Relaxed);
    }

    pub fn set_input_gain(&self, gain: f64) {
        lock(&self.shared.params).input_gain = gain;
        self.shared.input_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn set_output_gain(&self, gain: f64) {
        lock(&self.shared.params).output_gain = gain;
        self.shared.output_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn add_probe(&self, signal: Signal) -> bool {
        self.shared.probes.add(signal)
    }

    pub fn remove_probe(&self, signal: &Signal) -> bool {
        self.shared.probes.remove(signal)
    }

    pub fn probes(&self) -> Vec<Signal> {
        self.shared.probes.signals()
    }

    /// Register the signals of every probe component in `topology`.
    pub fn register_topology_probes(&self, topology: &Topology) -> usize {
        topology
            .circuit
            .probe_signals()
            .into_iter()
            .filter(|signal| self.add_probe(signal.clone()))
            .count()
    }

    /// Most recently published solution.
    pub fn solution(&self) -> Option<Arc<TransientSolution>> {
        self.shared.latest.load_full()
    }

    /// Version of the most recently published build, 0 if none.
    pub fn published_version(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn params(&self) -> SimulationParams {
        lock(&self.shared.params).clone()
    }
}

/// Real-time handle driven by the audio callback.
pub struct Processor {
    shared: Arc<Shared>,
    executor: Option<Arc<Executor>>,
    scratch: Vec<f64>,
    channels: Vec<ProbeChannel>,
    probe_generation: u64,
    block_size: usize,
}

/// Output channel plus probe channels of one block.
struct BlockTargets<'a> {
    output_signal: &'a Signal,
    output: &'a mut [f64],
    probes: &'a mut [ProbeChannel],
    len: usize,
}

impl Targets for BlockTargets<'_> {
    fn len(&self) -> usize {
        1 + self.probes.len()
    }

    fn signal(&self, index: usize) -> &Signal {
        match index {
            0 => self.output_signal,
            i => &*self.probes[i - 1].signal,
        }
    }

    fn buffer(&mut self, index: usize) -> &mut [f64] {
        match index {
            0 => &mut *self.output,
            i => &mut self.probes[i - 1].samples[..self.len],
        }
    }
}

impl Processor {
    /// True if a healthy executor is producing output.
    pub fn is_running(&self) -> bool {
        self.executor.as_ref().map_or(false, |e| !e.is_faulted())
    }

    /// Pick up a freshly published executor, parking the old one for the
    /// build side to free.
    fn adopt(&mut self) {
        if self.shared.pending.load().is_none() {
            return;
        }
        let mut retired = match self.shared.retired.try_lock() {
            Ok(retired) => retired,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if self.executor.is_some() && retired.len() >= retired.capacity() {
            return;
        }
        if let Some(next) = self.shared.pending.swap(None) {
            if let Some(old) = self.executor.replace(next) {
                retired.push(old);
            }
        }
    }

    /// Stop the current executor after a fault.
    fn kill(&mut self) {
        if let Ok(mut retired) = self.shared.retired.try_lock() {
            if retired.len() < retired.capacity() {
                if let Some(old) = self.executor.take() {
                    retired.push(old);
                }
            }
        }
        // If the executor could not be parked it stays faulted and silent.
    }

    /// Run the simulation over `samples` in place: input in, output out.
    ///
    /// Probe channels and the output are handed to `sink` after each block.
    /// Without a live executor the buffer is silenced.
    pub fn process(&mut self, samples: &mut [f64], sink: &mut dyn SignalSink) {
        self.adopt();
        self.shared
            .probes
            .sync(&mut self.channels, &mut self.probe_generation);

        let iterations = self.shared.iterations.load(Ordering::Relaxed);
        let input_gain = f64::from_bits(self.shared.input_gain.load(Ordering::Relaxed));
        let output_gain = f64::from_bits(self.shared.output_gain.load(Ordering::Relaxed));

        let Some(executor) = self.executor.as_mut().and_then(Arc::get_mut) else {
            samples.fill(0.0);
            return;
        };
        if executor.is_faulted() {
            samples.fill(0.0);
            return;
        }
        let solution = Arc::clone(executor.solution());
        let sample_rate =
            1.0 / (solution.discretization.time_step * executor.oversample() as f64);

        let mut fault = None;
        let mut offset = 0;
        for chunk in samples.chunks_mut(self.block_size) {
            let len = chunk.len();
            let input = &mut self.scratch[..len];
            input.copy_from_slice(chunk);
            if input_gain != 1.0 {
                input.iter_mut().for_each(|x| *x *= input_gain);
            }

            let mut targets = BlockTargets {
                output_signal: &solution.output,
                output: &mut *chunk,
                probes: &mut self.channels,
                len,
            };
            if let Err(f) = executor.run(input, &mut targets, iterations) {
                fault = Some(f);
                break;
            }

            if output_gain != 1.0 {
                chunk.iter_mut().for_each(|x| *x *= output_gain);
            }
            for channel in &self.channels {
                if *channel.signal != solution.output && solution.resolve(&channel.signal).is_some() {
                    sink.signal(&channel.signal, &channel.samples[..len], sample_rate);
                }
            }
            sink.signal(&solution.output, chunk, sample_rate);
            offset += len;
        }

        if let Some(fault) = fault {
            samples[offset..].fill(0.0);
            self.shared
                .diagnostics
                .error(&format!("Simulation stopped: {}", fault));
            self.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Circuit, Component};
    use crate::diagnostics::{MemoryDiagnostics, Severity};
    use crate::output::Recording;

    fn divider(r2: f64) -> Topology {
        let circuit = Circuit::new("divider")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "mid", 1e3)))
            .and_then(|c| c.with(Component::resistor("R2", "mid", "0", r2)))
            .and_then(|c| c.with(Component::probe("P1", "in")))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("mid"))
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

    fn setup(params: SimulationParams) -> (Simulation, Processor, Arc<MemoryDiagnostics>) {
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let (simulation, processor) = Simulation::new(params, diagnostics.clone());
        (simulation, processor, diagnostics)
    }

    fn sine(samples: usize) -> Vec<f64> {
        (0..samples)
            .map(|n| (2.0 * std::f64::consts::PI * 1000.0 * n as f64 / 48_000.0).sin())
            .collect()
    }

    #[test]
    fn test_silence_before_first_build() {
        let (_simulation, mut processor, _) = setup(SimulationParams::default());
        let mut samples = vec![1.0; 64];
        processor.process(&mut samples, &mut NullSink);
        assert!(samples.iter().all(|v| *v == 0.0));
        assert!(!processor.is_running());
    }

    #[test]
    fn test_build_publishes_and_processes() {
        let (simulation, mut processor, diagnostics) = setup(SimulationParams::default());
        let outcome = simulation.rebuild(divider(1e3)).wait();
        assert_eq!(outcome, BuildOutcome::Published { version: 1 });
        assert!(simulation.solution().is_some());
        assert_eq!(diagnostics.count(Severity::Info), 1);

        let mut samples = vec![1.0; 100];
        processor.process(&mut samples, &mut NullSink);
        assert!(processor.is_running());
        assert!(samples.iter().all(|v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_failed_build_keeps_previous_solution() {
        let (simulation, mut processor, diagnostics) = setup(SimulationParams::default());
        simulation.rebuild(divider(1e3)).wait();
        let before = simulation.solution();

        let mut broken = divider(1e3);
        broken.input = "missing".to_string();
        let outcome = simulation.rebuild(broken).wait();
        assert!(matches!(outcome, BuildOutcome::Failed(BuildError::Topology(_))));
        assert_eq!(diagnostics.count(Severity::Error), 1);
        assert_eq!(simulation.solution(), before);
        assert_eq!(simulation.published_version(), 1);

        let mut samples = vec![1.0; 16];
        processor.process(&mut samples, &mut NullSink);
        assert!(samples.iter().all(|v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_latest_request_wins() {
        let (simulation, mut processor, _) = setup(SimulationParams::default());
        let first = simulation.rebuild(divider(1e3));
        let second = simulation.rebuild(divider(3e3));
        let first = first.wait();
        assert!(matches!(
            first,
            BuildOutcome::Published { version: 1 } | BuildOutcome::Superseded { version: 1 }
        ));
        assert_eq!(second.wait(), BuildOutcome::Published { version: 2 });
        assert_eq!(simulation.published_version(), 2);

        let mut samples = vec![1.0; 8];
        processor.process(&mut samples, &mut NullSink);
        assert!(samples.iter().all(|v| (v - 0.75).abs() < 1e-12));
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let (simulation, _processor, _) = setup(SimulationParams::default());
        simulation.rebuild(clipper()).wait();
        let first = simulation.solution().unwrap();
        simulation.rebuild(clipper()).wait();
        let second = simulation.solution().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_probes_do_not_change_output() {
        let input = sine(2048);

        let (plain, mut plain_processor, _) = setup(SimulationParams::default());
        plain.rebuild(clipper()).wait();
        let mut reference = input.clone();
        plain_processor.process(&mut reference, &mut NullSink);

        let (probed, mut probed_processor, _) = setup(SimulationParams::default());
        probed.rebuild(clipper()).wait();
        probed.add_probe(Signal::voltage("in"));
        probed.add_probe(Signal::current("R1"));
        probed.add_probe(Signal::voltage("unconnected"));
        let mut recording = Recording::new();
        let mut output = input.clone();
        for block in output.chunks_mut(256) {
            probed_processor.process(block, &mut recording);
        }
        probed.remove_probe(&Signal::current("R1"));
        assert_eq!(output, reference);

        assert_eq!(recording.channel(&Signal::voltage("in")).map(<[f64]>::len), Some(2048));
        assert!(recording.channel(&Signal::voltage("unconnected")).is_none());
        let probed_input = recording.channel(&Signal::voltage("in")).unwrap();
        for (a, b) in probed_input.iter().zip(&input) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_gains_apply_without_rebuild() {
        let (simulation, mut processor, _) = setup(SimulationParams::default());
        simulation.rebuild(divider(1e3)).wait();
        simulation.set_input_gain(2.0);
        simulation.set_output_gain(0.5);

        let mut samples = vec![1.0; 32];
        processor.process(&mut samples, &mut NullSink);
        assert!(samples.iter().all(|v| (v - 0.5).abs() < 1e-12));
        assert_eq!(simulation.published_version(), 1);
    }

    #[test]
    fn test_fault_silences_until_rebuild() {
        let params = SimulationParams::default().with_oversample(1);
        let (simulation, mut processor, diagnostics) = setup(params);
        simulation.rebuild(unstable()).wait();

        let mut faulted = false;
        for _ in 0..40 {
            let mut samples = vec![0.1; 480];
            processor.process(&mut samples, &mut NullSink);
            assert!(samples.iter().all(|v| v.is_finite()));
            if !processor.is_running() {
                faulted = true;
                assert_eq!(*samples.last().unwrap(), 0.0);
                break;
            }
        }
        assert!(faulted);
        assert_eq!(diagnostics.count(Severity::Error), 1);

        let mut samples = vec![0.1; 64];
        processor.process(&mut samples, &mut NullSink);
        assert!(samples.iter().all(|v| *v == 0.0));
        assert_eq!(diagnostics.count(Severity::Error), 1);

        simulation.rebuild(divider(1e3)).wait();
        let mut samples = vec![1.0; 64];
        processor.process(&mut samples, &mut NullSink);
        assert!(samples.iter().all(|v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_oversample_change_rebuilds() {
        let (simulation, _processor, _) = setup(SimulationParams::default());
        assert!(simulation.set_oversample(2).is_none());

        simulation.rebuild(divider(1e3)).wait();
        let step = simulation.solution().unwrap().discretization.time_step;
        let handle = simulation.set_oversample(8).unwrap();
        assert_eq!(handle.wait(), BuildOutcome::Published { version: 2 });
        let rebuilt = simulation.solution().unwrap().discretization.time_step;
        assert!((step / rebuilt - 4.0).abs() < 1e-12);

        simulation.set_iterations(3);
        assert_eq!(simulation.params().iterations, 3);
        assert_eq!(simulation.published_version(), 2);
    }

    #[test]
    fn test_register_topology_probes() {
        let (simulation, _processor, _) = setup(SimulationParams::default());
        let topology = divider(1e3);
        assert_eq!(simulation.register_topology_probes(&topology), 1);
        assert_eq!(simulation.register_topology_probes(&topology), 0);
        assert_eq!(simulation.probes(), vec![Signal::voltage("in")]);
    }
}
