use std::collections::{BTreeSet, HashMap};
use std::fmt;

use log::debug;

use crate::circuit::{Component, ComponentType, Signal, Topology};
use crate::error::TopologyError;
use crate::expr::{Expr, Function, Symbol};

/// Thermal voltage at room temperature (V)
pub const THERMAL_VOLTAGE: f64 = 0.025_85;

/// Minimum conductance placed across every junction (S)
pub const GMIN: f64 = 1e-12;

/// A solution variable of the equation system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Unknown {
    NodeVoltage(String),
    BranchCurrent(String),
}

impl fmt::Display for Unknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unknown::NodeVoltage(node) => write!(f, "V({})", node),
            Unknown::BranchCurrent(name) => write!(f, "I({})", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationKind {
    Linear,
    Nonlinear,
}

/// One residual equation, `residual = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    /// Human readable source of the equation, for diagnostics.
    pub origin: String,
    pub residual: Expr,
    pub kind: EquationKind,
}

/// Linear combination of at most two unknowns, read out of the state vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tap {
    terms: [(usize, f64); 2],
    len: usize,
}

impl Tap {
    /// Constant zero, used for the ground node.
    pub const ZERO: Tap = Tap {
        terms: [(0, 0.0); 2],
        len: 0,
    };

    pub fn single(index: usize, scale: f64) -> Self {
        Tap {
            terms: [(index, scale), (0, 0.0)],
            len: 1,
        }
    }

    /// Sum of two taps. Returns `None` if the result needs more than two terms.
    pub fn combine(self, other: Tap, other_scale: f64) -> Option<Tap> {
        let mut tap = self;
        for &(index, scale) in other.terms() {
            let scale = scale * other_scale;
            match tap.terms[..tap.len].iter_mut().find(|(i, _)| *i == index) {
                Some((_, existing)) => *existing += scale,
                None if tap.len < 2 => {
                    tap.terms[tap.len] = (index, scale);
                    tap.len += 1;
                }
                None => return None,
            }
        }
        Some(tap)
    }

    pub fn terms(&self) -> &[(usize, f64)] {
        &self.terms[..self.len]
    }

    pub fn eval(&self, state: &[f64]) -> f64 {
        self.terms()
            .iter()
            .map(|&(index, scale)| state[index] * scale)
            .sum()
    }
}

/// How a node name maps onto the unknown vector.
#[derive(Debug, Clone, Copy, PartialEq)]
enum NodeRef {
    Ground,
    Unknown(usize),
}

/// Name lookup used to resolve output and probe signals against unknowns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignalMap {
    nodes: HashMap<String, NodeRef>,
    branches: HashMap<String, usize>,
    /// Resistor name -> (first node, second node, conductance)
    conductances: HashMap<String, (String, String, f64)>,
}

impl SignalMap {
    fn node(&self, name: &str) -> Option<Tap> {
        match self.nodes.get(name)? {
            NodeRef::Ground => Some(Tap::ZERO),
            NodeRef::Unknown(k) => Some(Tap::single(*k, 1.0)),
        }
    }

    fn difference(&self, pos: &str, neg: &str) -> Option<Tap> {
        self.node(pos)?.combine(self.node(neg)?, -1.0)
    }

    /// Resolve a signal to a tap, or `None` if it references nothing solved.
    pub fn resolve(&self, signal: &Signal) -> Option<Tap> {
        match signal {
            Signal::Voltage(node) => self.node(node),
            Signal::VoltageBetween(pos, neg) => self.difference(pos, neg),
            Signal::Current(name) => {
                if let Some(&k) = self.branches.get(name) {
                    return Some(Tap::single(k, 1.0));
                }
                let (a, b, g) = self.conductances.get(name)?;
                let v = self.difference(a, b)?;
                Tap::ZERO.combine(v, *g)
            }
        }
    }
}

/// Symbolic differential-algebraic system derived from a topology.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationSystem {
    pub unknowns: Vec<Unknown>,
    pub equations: Vec<Equation>,
    pub signals: SignalMap,
    pub output: Signal,
}

impl EquationSystem {
    /// Derive the equation system for a topology with its designated input and output.
    pub fn build(topology: &Topology) -> Result<Self, TopologyError> {
        let circuit = &topology.circuit;
        circuit.validate()?;

        let input = circuit
            .find_component(&topology.input)
            .ok_or_else(|| TopologyError::UnknownInput {
                name: topology.input.clone(),
            })?;
        if !input.component_type.is_source() {
            return Err(TopologyError::InvalidInput {
                name: topology.input.clone(),
            });
        }

        let mut builder = Builder::new(topology);
        for component in &circuit.components {
            builder.stamp(component);
        }
        let system = builder.finish();

        system.check_determined()?;
        if system.signals.resolve(&topology.output).is_none() {
            return Err(TopologyError::UnknownOutput {
                signal: topology.output.to_string(),
            });
        }

        debug!(
            "Built {} equations ({} nonlinear) for '{}'",
            system.equations.len(),
            system.nonlinear_count(),
            circuit.title
        );
        Ok(system)
    }

    fn check_determined(&self) -> Result<(), TopologyError> {
        let mut symbols = BTreeSet::new();
        for equation in &self.equations {
            equation.residual.symbols(&mut symbols);
        }
        for (k, unknown) in self.unknowns.iter().enumerate() {
            if !symbols.contains(&Symbol::Unknown(k)) && !symbols.contains(&Symbol::Derivative(k)) {
                return Err(TopologyError::Underdetermined {
                    unknown: unknown.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn unknown_count(&self) -> usize {
        self.unknowns.len()
    }

    pub fn nonlinear_count(&self) -> usize {
        self.equations
            .iter()
            .filter(|e| e.kind == EquationKind::Nonlinear)
            .count()
    }

    pub fn is_linear(&self) -> bool {
        self.nonlinear_count() == 0
    }
}

/// Node current accumulator for one KCL equation.
#[derive(Default)]
struct NodeSum {
    currents: Vec<Expr>,
    nonlinear: bool,
}

struct Builder<'a> {
    topology: &'a Topology,
    unknowns: Vec<Unknown>,
    signals: SignalMap,
    kcl: Vec<NodeSum>,
    constitutive: Vec<Equation>,
}

impl<'a> Builder<'a> {
    fn new(topology: &'a Topology) -> Self {
        let circuit = &topology.circuit;
        let mut unknowns = Vec::new();
        let mut signals = SignalMap::default();

        let ground = circuit.ground_node;
        for (name, &id) in &circuit.node_map {
            if Some(id) == ground {
                signals.nodes.insert(name.clone(), NodeRef::Ground);
            }
        }
        let solvable = circuit.solvable_nodes();
        for node in &solvable {
            signals
                .nodes
                .insert(node.name.clone(), NodeRef::Unknown(unknowns.len()));
            unknowns.push(Unknown::NodeVoltage(node.name.clone()));
        }
        let kcl = solvable.iter().map(|_| NodeSum::default()).collect();

        for component in &circuit.components {
            match component.component_type {
                ComponentType::Resistor => {
                    signals.conductances.insert(
                        component.name.clone(),
                        (
                            component.nodes[0].clone(),
                            component.nodes[1].clone(),
                            1.0 / component.value,
                        ),
                    );
                }
                ref t if t.tracks_current() => {
                    signals
                        .branches
                        .insert(component.name.clone(), unknowns.len());
                    unknowns.push(Unknown::BranchCurrent(component.name.clone()));
                }
                _ => {}
            }
        }

        Builder {
            topology,
            unknowns,
            signals,
            kcl,
            constitutive: Vec::new(),
        }
    }

    fn node_ref(&self, name: &str) -> NodeRef {
        self.signals.nodes.get(name).copied().unwrap_or(NodeRef::Ground)
    }

    fn voltage(&self, name: &str) -> Expr {
        match self.node_ref(name) {
            NodeRef::Ground => Expr::zero(),
            NodeRef::Unknown(k) => Expr::unknown(k),
        }
    }

    fn voltage_derivative(&self, name: &str) -> Expr {
        match self.node_ref(name) {
            NodeRef::Ground => Expr::zero(),
            NodeRef::Unknown(k) => Expr::var(Symbol::Derivative(k)),
        }
    }

    fn across(&self, pos: &str, neg: &str) -> Expr {
        self.voltage(pos) - self.voltage(neg)
    }

    /// Record `current` leaving `node` into the component.
    fn leave(&mut self, node: &str, current: Expr, nonlinear: bool) {
        if let NodeRef::Unknown(k) = self.node_ref(node) {
            let sum = &mut self.kcl[k];
            sum.currents.push(current);
            sum.nonlinear |= nonlinear;
        }
    }

    /// Current flowing from `pos` through the component to `neg`.
    fn branch(&mut self, pos: &str, neg: &str, current: Expr, nonlinear: bool) {
        self.leave(pos, current.clone(), nonlinear);
        self.leave(neg, -current, nonlinear);
    }

    fn branch_unknown(&self, component: &Component) -> Expr {
        match self.signals.branches.get(&component.name) {
            Some(&k) => Expr::unknown(k),
            None => Expr::zero(),
        }
    }

    fn source_value(&self, component: &Component) -> Expr {
        if component.name == self.topology.input {
            Expr::var(Symbol::Input)
        } else {
            Expr::constant(component.value)
        }
    }

    fn constitutive(&mut self, component: &Component, residual: Expr) {
        self.constitutive.push(Equation {
            origin: format!("{} constitutive relation", component.name),
            residual,
            kind: EquationKind::Linear,
        });
    }

    fn stamp(&mut self, component: &Component) {
        let n = &component.nodes;
        match &component.component_type {
            ComponentType::Resistor => {
                let current = self.across(&n[0], &n[1]).scaled(1.0 / component.value);
                self.branch(&n[0], &n[1], current, false);
            }
            ComponentType::Capacitor => {
                let current = (self.voltage_derivative(&n[0]) - self.voltage_derivative(&n[1]))
                    .scaled(component.value);
                self.branch(&n[0], &n[1], current, false);
            }
            ComponentType::Inductor => {
                let i = self.branch_unknown(component);
                self.branch(&n[0], &n[1], i, false);
                let di = match self.signals.branches.get(&component.name) {
                    Some(&k) => Expr::var(Symbol::Derivative(k)),
                    None => Expr::zero(),
                };
                let residual = self.across(&n[0], &n[1]) - di.scaled(component.value);
                self.constitutive(component, residual);
            }
            ComponentType::VoltageSource => {
                let i = self.branch_unknown(component);
                self.branch(&n[0], &n[1], i, false);
                let residual = self.across(&n[0], &n[1]) - self.source_value(component);
                self.constitutive(component, residual);
            }
            ComponentType::CurrentSource => {
                let current = self.source_value(component);
                self.branch(&n[0], &n[1], current, false);
            }
            ComponentType::Vcvs => {
                let i = self.branch_unknown(component);
                self.branch(&n[0], &n[1], i, false);
                let residual = self.across(&n[0], &n[1])
                    - self.across(&n[2], &n[3]).scaled(component.value);
                self.constitutive(component, residual);
            }
            ComponentType::Diode {
                saturation_current,
                emission,
            } => {
                let v = self.across(&n[0], &n[1]);
                let current = junction(v, *saturation_current, *emission);
                self.branch(&n[0], &n[1], current, true);
            }
            ComponentType::Bjt {
                polarity,
                saturation_current,
                beta_f,
                beta_r,
            } => {
                let (c, b, e) = (&n[0], &n[1], &n[2]);
                let s = polarity.sign();
                let vbe = self.across(b, e).scaled(s);
                let vbc = self.across(b, c).scaled(s);
                let forward = junction(vbe, *saturation_current, 1.0);
                let reverse = junction(vbc, *saturation_current, 1.0);

                // Ebers-Moll transport model, currents entering each terminal.
                let ic = (forward.clone() - reverse.clone().scaled(1.0 + 1.0 / beta_r)).scaled(s);
                let ib = (forward.scaled(1.0 / beta_f) + reverse.scaled(1.0 / beta_r)).scaled(s);
                let ie = -(ic.clone() + ib.clone());
                self.leave(c, ic, true);
                self.leave(b, ib, true);
                self.leave(e, ie, true);
            }
            ComponentType::Probe => {}
        }
    }

    fn finish(self) -> EquationSystem {
        let mut equations: Vec<Equation> = self
            .kcl
            .into_iter()
            .zip(&self.unknowns)
            .map(|(sum, unknown)| Equation {
                origin: format!("KCL at {}", unknown),
                residual: Expr::sum(sum.currents),
                kind: if sum.nonlinear {
                    EquationKind::Nonlinear
                } else {
                    EquationKind::Linear
                },
            })
            .collect();
        equations.extend(self.constitutive);

        EquationSystem {
            unknowns: self.unknowns,
            equations,
            signals: self.signals,
            output: self.topology.output.clone(),
        }
    }
}

/// Shockley junction current with a parallel GMIN conductance.
fn junction(v: Expr, saturation_current: f64, emission: f64) -> Expr {
    let exponent = v.clone().scaled(1.0 / (emission * THERMAL_VOLTAGE));
    let diode = (Expr::call(Function::Exp, exponent) - Expr::constant(1.0)).scaled(saturation_current);
    diode + v.scaled(GMIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Circuit, Polarity};

    fn divider() -> Topology {
        let circuit = Circuit::new("divider")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "mid", 1e3)))
            .and_then(|c| c.with(Component::resistor("R2", "mid", "0", 1e3)))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("mid"))
    }

    fn clipper() -> Topology {
        let circuit = Circuit::new("clipper")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "out", 1e3)))
            .and_then(|c| c.with(Component::diode("D1", "out", "0")))
            .and_then(|c| c.with(Component::diode("D2", "0", "out")))
            .unwrap();
        Topology::new(circuit, "V1", Signal::voltage("out"))
    }

    #[test]
    fn test_divider_unknowns_and_equations() {
        let system = EquationSystem::build(&divider()).unwrap();
        assert_eq!(
            system.unknowns,
            vec![
                Unknown::NodeVoltage("in".to_string()),
                Unknown::NodeVoltage("mid".to_string()),
                Unknown::BranchCurrent("V1".to_string()),
            ]
        );
        assert_eq!(system.equations.len(), 3);
        assert!(system.is_linear());
        assert!(system.equations[2].residual.contains(Symbol::Input));
    }

    #[test]
    fn test_divider_equations_hold_at_solution() {
        let system = EquationSystem::build(&divider()).unwrap();
        // u = 1V: V(in) = 1, V(mid) = 0.5, source current = -0.5 mA
        let values = [1.0, 0.5, -0.5e-3];
        let lookup = |s: Symbol| match s {
            Symbol::Unknown(k) => values[k],
            Symbol::Input => 1.0,
            _ => 0.0,
        };
        for equation in &system.equations {
            assert!(equation.residual.eval(&lookup).abs() < 1e-12, "{}", equation.origin);
        }
    }

    #[test]
    fn test_diode_equations_are_nonlinear() {
        let system = EquationSystem::build(&clipper()).unwrap();
        assert_eq!(system.nonlinear_count(), 1);
        assert_eq!(system.equations[1].kind, EquationKind::Nonlinear);
    }

    #[test]
    fn test_bjt_currents_sum_to_zero() {
        let circuit = Circuit::new("bjt")
            .with(Component::voltage_source("V1", "b", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("RC", "c", "0", 1e3)))
            .and_then(|c| c.with(Component::resistor("RE", "e", "0", 1e2)))
            .and_then(|c| c.with(Component::bjt("Q1", Polarity::Pnp, "c", "b", "e")))
            .unwrap();
        let system = EquationSystem::build(&Topology::new(circuit, "V1", Signal::voltage("c"))).unwrap();
        assert_eq!(system.nonlinear_count(), 3);

        let values = [0.3, -0.2, 0.1, 0.0];
        let lookup = |s: Symbol| match s {
            Symbol::Unknown(k) => values[k],
            _ => 0.0,
        };
        // Device currents entering c, b and e cancel; only resistor currents remain.
        let total: f64 = system.equations[..3]
            .iter()
            .map(|e| e.residual.eval(&lookup))
            .sum();
        let resistive = values[1] / 1e3 + values[2] / 1e2;
        assert!((total - resistive).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_and_invalid_input() {
        let mut topology = divider();
        topology.input = "V9".to_string();
        assert!(matches!(
            EquationSystem::build(&topology),
            Err(TopologyError::UnknownInput { .. })
        ));
        topology.input = "R1".to_string();
        assert!(matches!(
            EquationSystem::build(&topology),
            Err(TopologyError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_unresolved_output_rejected() {
        let mut topology = divider();
        topology.output = Signal::voltage("nowhere");
        assert!(matches!(
            EquationSystem::build(&topology),
            Err(TopologyError::UnknownOutput { .. })
        ));
    }

    #[test]
    fn test_current_driven_node_is_underdetermined() {
        let circuit = Circuit::new("open current source")
            .with(Component::voltage_source("V1", "in", "0", 0.0))
            .and_then(|c| c.with(Component::resistor("R1", "in", "0", 1e3)))
            .and_then(|c| c.with(Component::current_source("I1", "a", "0", 1e-3)))
            .unwrap();
        let result = EquationSystem::build(&Topology::new(circuit, "V1", Signal::voltage("in")));
        assert_eq!(
            result,
            Err(TopologyError::Underdetermined {
                unknown: "V(a)".to_string()
            })
        );
    }

    #[test]
    fn test_signal_resolution() {
        let system = EquationSystem::build(&divider()).unwrap();
        let signals = &system.signals;

        assert_eq!(signals.resolve(&Signal::voltage("mid")), Some(Tap::single(1, 1.0)));
        assert_eq!(signals.resolve(&Signal::voltage("0")), Some(Tap::ZERO));
        assert_eq!(signals.resolve(&Signal::current("V1")), Some(Tap::single(2, 1.0)));
        assert_eq!(signals.resolve(&Signal::current("C7")), None);

        let state = [1.0, 0.5, -0.5e-3];
        let between = signals.resolve(&Signal::between("in", "mid")).unwrap();
        assert!((between.eval(&state) - 0.5).abs() < 1e-15);
        let current = signals.resolve(&Signal::current("R2")).unwrap();
        assert!((current.eval(&state) - 0.5e-3).abs() < 1e-15);
    }

    #[test]
    fn test_tap_combine_limits_terms() {
        let tap = Tap::single(0, 1.0).combine(Tap::single(1, 1.0), -1.0).unwrap();
        assert_eq!(tap.terms().len(), 2);
        assert!(tap.combine(Tap::single(2, 1.0), 1.0).is_none());
        let cancelled = tap.combine(Tap::single(1, 1.0), 1.0).unwrap();
        assert_eq!(cancelled.eval(&[2.0, 5.0]), 2.0);
    }
}
