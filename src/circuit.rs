use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Represents a node in the circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub id: usize,
}

impl Node {
    pub fn new(name: String) -> Self {
        Node {
            name,
            id: 0, // Will be assigned when added to circuit
        }
    }

    pub fn with_id(name: String, id: usize) -> Self {
        Node { name, id }
    }

    pub fn is_ground(&self) -> bool {
        is_ground_name(&self.name)
    }
}

pub fn is_ground_name(name: &str) -> bool {
    name == "0" || name.eq_ignore_ascii_case("gnd") || name.eq_ignore_ascii_case("ground")
}

/// Bipolar transistor polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    Npn,
    Pnp,
}

impl Polarity {
    /// +1 for NPN, -1 for PNP.
    pub fn sign(self) -> f64 {
        match self {
            Polarity::Npn => 1.0,
            Polarity::Pnp => -1.0,
        }
    }
}

/// Types of circuit components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComponentType {
    Resistor,
    Capacitor,
    Inductor,
    VoltageSource,
    CurrentSource,
    /// Shockley diode, anode then cathode.
    Diode {
        saturation_current: f64,
        emission: f64,
    },
    /// Ebers-Moll transistor, collector/base/emitter.
    Bjt {
        polarity: Polarity,
        saturation_current: f64,
        beta_f: f64,
        beta_r: f64,
    },
    /// Voltage-controlled voltage source: out+, out-, ctrl+, ctrl-. Value is the gain.
    Vcvs,
    /// Read-only tap on a node. Contributes no equations.
    Probe,
}

impl ComponentType {
    /// Default 1N4148-like diode
    pub fn diode() -> Self {
        ComponentType::Diode {
            saturation_current: 2.52e-9,
            emission: 1.752,
        }
    }

    /// Default small-signal transistor
    pub fn bjt(polarity: Polarity) -> Self {
        ComponentType::Bjt {
            polarity,
            saturation_current: 1e-14,
            beta_f: 100.0,
            beta_r: 1.0,
        }
    }

    /// Returns true if this component is linear
    pub fn is_linear(&self) -> bool {
        !matches!(self, ComponentType::Diode { .. } | ComponentType::Bjt { .. })
    }

    /// Returns true if this component is an independent source
    pub fn is_source(&self) -> bool {
        matches!(self, ComponentType::VoltageSource | ComponentType::CurrentSource)
    }

    /// Components whose current is an unknown of the system
    pub fn tracks_current(&self) -> bool {
        matches!(
            self,
            ComponentType::VoltageSource | ComponentType::Inductor | ComponentType::Vcvs
        )
    }

    pub fn terminal_count(&self) -> usize {
        match self {
            ComponentType::Resistor
            | ComponentType::Capacitor
            | ComponentType::Inductor
            | ComponentType::VoltageSource
            | ComponentType::CurrentSource
            | ComponentType::Diode { .. } => 2,
            ComponentType::Bjt { .. } => 3, // Collector, Base, Emitter
            ComponentType::Vcvs => 4,
            ComponentType::Probe => 1,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ComponentType::Resistor => "Resistors",
            ComponentType::Capacitor => "Capacitors",
            ComponentType::Inductor => "Inductors",
            ComponentType::VoltageSource => "Voltage Sources",
            ComponentType::CurrentSource => "Current Sources",
            ComponentType::Diode { .. } => "Diodes",
            ComponentType::Bjt { .. } => "BJTs",
            ComponentType::Vcvs => "Controlled Sources",
            ComponentType::Probe => "Probes",
        }
    }
}

/// Circuit component/element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub component_type: ComponentType,
    pub nodes: Vec<String>,
    pub value: f64,
}

impl Component {
    pub fn new(name: &str, component_type: ComponentType, nodes: &[&str], value: f64) -> Self {
        Component {
            name: name.to_string(),
            component_type,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            value,
        }
    }

    pub fn resistor(name: &str, node1: &str, node2: &str, resistance: f64) -> Self {
        Self::new(name, ComponentType::Resistor, &[node1, node2], resistance)
    }

    pub fn capacitor(name: &str, node1: &str, node2: &str, capacitance: f64) -> Self {
        Self::new(name, ComponentType::Capacitor, &[node1, node2], capacitance)
    }

    pub fn inductor(name: &str, node1: &str, node2: &str, inductance: f64) -> Self {
        Self::new(name, ComponentType::Inductor, &[node1, node2], inductance)
    }

    pub fn voltage_source(name: &str, node_pos: &str, node_neg: &str, voltage: f64) -> Self {
        Self::new(name, ComponentType::VoltageSource, &[node_pos, node_neg], voltage)
    }

    pub fn current_source(name: &str, node_pos: &str, node_neg: &str, current: f64) -> Self {
        Self::new(name, ComponentType::CurrentSource, &[node_pos, node_neg], current)
    }

    pub fn diode(name: &str, anode: &str, cathode: &str) -> Self {
        Self::new(name, ComponentType::diode(), &[anode, cathode], 0.0)
    }

    pub fn bjt(name: &str, polarity: Polarity, collector: &str, base: &str, emitter: &str) -> Self {
        Self::new(name, ComponentType::bjt(polarity), &[collector, base, emitter], 0.0)
    }

    pub fn vcvs(name: &str, out_pos: &str, out_neg: &str, ctrl_pos: &str, ctrl_neg: &str, gain: f64) -> Self {
        Self::new(name, ComponentType::Vcvs, &[out_pos, out_neg, ctrl_pos, ctrl_neg], gain)
    }

    pub fn probe(name: &str, node: &str) -> Self {
        Self::new(name, ComponentType::Probe, &[node], 0.0)
    }

    pub fn terminal_count(&self) -> usize {
        self.component_type.terminal_count()
    }

    /// Validate that the component has the correct number of nodes and a usable value
    pub fn validate(&self) -> Result<(), TopologyError> {
        let expected = self.terminal_count();
        if self.nodes.len() != expected {
            return Err(TopologyError::TerminalMismatch {
                component: self.name.clone(),
                expected,
                found: self.nodes.len(),
            });
        }

        let invalid = |message: &str| TopologyError::InvalidValue {
            component: self.name.clone(),
            message: message.to_string(),
        };

        match &self.component_type {
            ComponentType::Resistor if !(self.value > 0.0 && self.value.is_finite()) => {
                Err(invalid("resistance must be positive"))
            }
            ComponentType::Capacitor if !(self.value > 0.0 && self.value.is_finite()) => {
                Err(invalid("capacitance must be positive"))
            }
            ComponentType::Inductor if !(self.value > 0.0 && self.value.is_finite()) => {
                Err(invalid("inductance must be positive"))
            }
            ComponentType::VoltageSource | ComponentType::CurrentSource | ComponentType::Vcvs
                if !self.value.is_finite() =>
            {
                Err(invalid("value must be finite"))
            }
            ComponentType::Diode {
                saturation_current,
                emission,
            } if !(*saturation_current > 0.0 && *emission > 0.0) => {
                Err(invalid("diode parameters must be positive"))
            }
            ComponentType::Bjt {
                saturation_current,
                beta_f,
                beta_r,
                ..
            } if !(*saturation_current > 0.0 && *beta_f > 0.0 && *beta_r > 0.0) => {
                Err(invalid("transistor parameters must be positive"))
            }
            _ => Ok(()),
        }
    }
}

/// A quantity that can be tapped from a running simulation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Voltage of a node relative to ground.
    Voltage(String),
    /// Voltage difference between two nodes.
    VoltageBetween(String, String),
    /// Current through a component, entering its first terminal.
    Current(String),
}

impl Signal {
    pub fn voltage(node: &str) -> Self {
        Signal::Voltage(node.to_string())
    }

    pub fn between(pos: &str, neg: &str) -> Self {
        Signal::VoltageBetween(pos.to_string(), neg.to_string())
    }

    pub fn current(component: &str) -> Self {
        Signal::Current(component.to_string())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Voltage(node) => write!(f, "V({})", node),
            Signal::VoltageBetween(pos, neg) => write!(f, "V({},{})", pos, neg),
            Signal::Current(name) => write!(f, "I({})", name),
        }
    }
}

/// Complete circuit representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    pub title: String,
    pub nodes: Vec<Node>,
    pub components: Vec<Component>,
    pub node_map: HashMap<String, usize>,
    pub ground_node: Option<usize>,
}

impl Circuit {
    pub fn new(title: &str) -> Self {
        Circuit {
            title: title.to_string(),
            nodes: Vec::new(),
            components: Vec::new(),
            node_map: HashMap::new(),
            ground_node: None,
        }
    }

    /// Add a node to the circuit and return its ID
    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&existing_id) = self.node_map.get(name) {
            return existing_id;
        }

        let node_id = self.nodes.len();
        let node = Node::with_id(name.to_string(), node_id);

        // All ground aliases share the first ground node
        if node.is_ground() {
            match self.ground_node {
                Some(ground) => {
                    self.node_map.insert(name.to_string(), ground);
                    return ground;
                }
                None => self.ground_node = Some(node_id),
            }
        }

        self.nodes.push(node);
        self.node_map.insert(name.to_string(), node_id);
        node_id
    }

    /// Add a component to the circuit
    pub fn add_component(&mut self, component: Component) -> Result<(), TopologyError> {
        component.validate()?;

        if self.find_component(&component.name).is_some() {
            return Err(TopologyError::DuplicateComponent {
                name: component.name,
            });
        }

        for node_name in &component.nodes {
            self.add_node(node_name);
        }

        self.components.push(component);
        Ok(())
    }

    /// Builder-style variant of [`Circuit::add_component`]
    pub fn with(mut self, component: Component) -> Result<Self, TopologyError> {
        self.add_component(component)?;
        Ok(self)
    }

    pub fn find_component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Get node ID by name
    pub fn get_node_id(&self, name: &str) -> Option<usize> {
        self.node_map.get(name).copied()
    }

    pub fn get_node_by_id(&self, id: usize) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes touched by at least one component that carries current.
    fn electrical_nodes(&self) -> HashSet<usize> {
        self.components
            .iter()
            .filter(|c| c.component_type != ComponentType::Probe)
            .flat_map(|c| c.nodes.iter())
            .filter_map(|name| self.get_node_id(name))
            .collect()
    }

    /// Non-ground nodes that get a voltage unknown, in insertion order.
    ///
    /// Nodes reached only by probes are left out; probes observe and never
    /// load the circuit.
    pub fn solvable_nodes(&self) -> Vec<&Node> {
        let electrical = self.electrical_nodes();
        self.nodes
            .iter()
            .filter(|node| Some(node.id) != self.ground_node && electrical.contains(&node.id))
            .collect()
    }

    /// Signals declared by probe components
    pub fn probe_signals(&self) -> Vec<Signal> {
        self.components
            .iter()
            .filter(|c| c.component_type == ComponentType::Probe)
            .map(|c| Signal::Voltage(c.nodes[0].clone()))
            .collect()
    }

    /// Validate the entire circuit
    pub fn validate(&self) -> Result<(), TopologyError> {
        let ground = self.ground_node.ok_or(TopologyError::MissingGround)?;

        let mut names = HashSet::new();
        for component in &self.components {
            component.validate()?;
            if !names.insert(component.name.as_str()) {
                return Err(TopologyError::DuplicateComponent {
                    name: component.name.clone(),
                });
            }
        }

        // Breadth-first walk from ground over current-carrying components
        let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
        for component in &self.components {
            if component.component_type == ComponentType::Probe {
                continue;
            }
            let ids: Vec<usize> = component
                .nodes
                .iter()
                .filter_map(|name| self.get_node_id(name))
                .collect();
            for &a in &ids {
                for &b in &ids {
                    if a != b {
                        adjacency.entry(a).or_default().push(b);
                    }
                }
            }
        }

        let mut reached = HashSet::from([ground]);
        let mut queue = VecDeque::from([ground]);
        while let Some(id) = queue.pop_front() {
            for &next in adjacency.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                if reached.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        for node in self.solvable_nodes() {
            if !reached.contains(&node.id) {
                return Err(TopologyError::FloatingNode {
                    node: node.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Print circuit summary
    pub fn print_summary(&self) {
        println!("Circuit: {}", self.title);
        println!("Nodes: {}", self.nodes.len());
        println!("Components: {}", self.components.len());

        if let Some(ground_node) = self.ground_node.and_then(|id| self.get_node_by_id(id)) {
            println!("Ground node: {}", ground_node.name);
        }

        let mut type_counts: Vec<(&str, usize)> = Vec::new();
        for component in &self.components {
            let label = component.component_type.label();
            match type_counts.iter_mut().find(|(name, _)| *name == label) {
                Some((_, count)) => *count += 1,
                None => type_counts.push((label, 1)),
            }
        }

        for (type_name, count) in type_counts {
            println!("  {}: {}", type_name, count);
        }
    }
}

/// A circuit snapshot together with its designated input source and output signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub circuit: Circuit,
    /// Name of the independent source driven by the input samples.
    pub input: String,
    pub output: Signal,
}

impl Topology {
    pub fn new(circuit: Circuit, input: &str, output: Signal) -> Self {
        Topology {
            circuit,
            input: input.to_string(),
            output,
        }
    }
}
