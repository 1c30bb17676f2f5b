use std::fs;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{alpha0, char, space0, space1},
    combinator::{all_consuming, map},
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult,
};
use log::warn;
use regex::Regex;

use crate::circuit::{Circuit, Component, ComponentType, Polarity, Signal, Topology};

lazy_static! {
    static ref PARAMETER_PATTERN: Regex =
        Regex::new(r"^([A-Za-z]+)\s*=\s*(\S+)$").unwrap();
    static ref DIRECTIVE_PATTERN: Regex = Regex::new(r"^\.([A-Za-z]+)\s*(.*)$").unwrap();
}

/// A parsed netlist: the circuit plus the directives that choose its
/// input, output and probes.
#[derive(Debug, Clone, PartialEq)]
pub struct Netlist {
    pub circuit: Circuit,
    pub input: Option<String>,
    pub output: Option<Signal>,
    pub probes: Vec<Signal>,
}

impl Netlist {
    /// Combine the circuit with an input source and output signal, falling
    /// back to the `.input`/`.output` directives.
    pub fn topology(&self, input: Option<&str>, output: Option<Signal>) -> Result<Topology> {
        let input = input
            .or(self.input.as_deref())
            .ok_or_else(|| anyhow!("No input source: add a .input directive or pass --input"))?;
        let output = output
            .or_else(|| self.output.clone())
            .ok_or_else(|| anyhow!("No output signal: add a .output directive or pass --output"))?;
        Ok(Topology::new(self.circuit.clone(), input, output))
    }
}

#[derive(Debug, Default)]
pub struct SpiceParser;

impl SpiceParser {
    pub fn new() -> Self {
        SpiceParser
    }

    pub fn parse_file(&self, filename: &str) -> Result<Netlist> {
        let content = fs::read_to_string(filename)
            .map_err(|e| anyhow!("Failed to read file '{}': {}", filename, e))?;

        self.parse_netlist(&content)
    }

    pub fn parse_netlist(&self, content: &str) -> Result<Netlist> {
        let mut lines = self.preprocess_lines(content).into_iter();
        let title = lines
            .next()
            .map(|(_, line)| line)
            .ok_or_else(|| anyhow!("Empty netlist"))?;

        let mut netlist = Netlist {
            circuit: Circuit::new(&title),
            input: None,
            output: None,
            probes: Vec::new(),
        };

        for (number, line) in lines {
            if line.starts_with('.') {
                if !self
                    .parse_directive(&line, &mut netlist)
                    .with_context(|| format!("line {}: {}", number, line))?
                {
                    break;
                }
                continue;
            }

            let component = self
                .parse_component_line(&line)
                .with_context(|| format!("line {}: {}", number, line))?;
            netlist
                .circuit
                .add_component(component)
                .with_context(|| format!("line {}: {}", number, line))?;
        }

        Ok(netlist)
    }

    /// Returns false on `.end`.
    fn parse_directive(&self, line: &str, netlist: &mut Netlist) -> Result<bool> {
        let captures = DIRECTIVE_PATTERN
            .captures(line)
            .ok_or_else(|| anyhow!("Malformed directive"))?;
        let name = captures.get(1).map_or("", |m| m.as_str()).to_lowercase();
        let args = captures.get(2).map_or("", |m| m.as_str()).trim();

        match name.as_str() {
            "end" => return Ok(false),
            "input" => {
                if args.is_empty() || args.contains(char::is_whitespace) {
                    return Err(anyhow!(".input takes exactly one source name"));
                }
                netlist.input = Some(args.to_string());
            }
            "output" => netlist.output = Some(args.parse()?),
            "probe" => netlist.probes.extend(parse_signal_list(args)?),
            other => warn!("Ignoring unsupported directive .{}", other),
        }
        Ok(true)
    }

    fn parse_component_line(&self, line: &str) -> Result<Component> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let name = tokens[0];
        let kind = name
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .ok_or_else(|| anyhow!("Empty element name"))?;

        let component = match kind {
            'R' => Component::new(name, ComponentType::Resistor, nodes(&tokens, 2)?, value(&tokens, 3)?),
            'C' => Component::new(name, ComponentType::Capacitor, nodes(&tokens, 2)?, value(&tokens, 3)?),
            'L' => Component::new(name, ComponentType::Inductor, nodes(&tokens, 2)?, value(&tokens, 3)?),
            'V' | 'I' => {
                let component_type = if kind == 'V' {
                    ComponentType::VoltageSource
                } else {
                    ComponentType::CurrentSource
                };
                // Optional DC keyword; a missing value means 0.
                let index = match tokens.get(3) {
                    Some(t) if t.eq_ignore_ascii_case("dc") => 4,
                    _ => 3,
                };
                let value = if tokens.len() > index { value(&tokens, index)? } else { 0.0 };
                Component::new(name, component_type, nodes(&tokens, 2)?, value)
            }
            'D' => {
                let mut component_type = ComponentType::diode();
                let parameters = self.parse_parameters(tokens.get(3..).unwrap_or_default())?;
                if let ComponentType::Diode { saturation_current, emission } = &mut component_type {
                    for (key, value) in parameters {
                        match key.as_str() {
                            "is" => *saturation_current = value,
                            "n" => *emission = value,
                            _ => return Err(anyhow!("Unknown diode parameter: {}", key)),
                        }
                    }
                }
                Component::new(name, component_type, nodes(&tokens, 2)?, 0.0)
            }
            'Q' => {
                let polarity = match tokens.get(4).map(|t| t.to_ascii_uppercase()).as_deref() {
                    Some("NPN") => Polarity::Npn,
                    Some("PNP") => Polarity::Pnp,
                    _ => return Err(anyhow!("{} needs a NPN or PNP model", name)),
                };
                let mut component_type = ComponentType::bjt(polarity);
                let parameters = self.parse_parameters(tokens.get(5..).unwrap_or_default())?;
                if let ComponentType::Bjt { saturation_current, beta_f, beta_r, .. } = &mut component_type {
                    for (key, value) in parameters {
                        match key.as_str() {
                            "is" => *saturation_current = value,
                            "bf" => *beta_f = value,
                            "br" => *beta_r = value,
                            _ => return Err(anyhow!("Unknown transistor parameter: {}", key)),
                        }
                    }
                }
                Component::new(name, component_type, nodes(&tokens, 3)?, 0.0)
            }
            'E' => Component::new(name, ComponentType::Vcvs, nodes(&tokens, 4)?, value(&tokens, 5)?),
            'P' => Component::new(name, ComponentType::Probe, nodes(&tokens, 1)?, 0.0),
            _ => return Err(anyhow!("Unknown component type: {}", kind)),
        };

        Ok(component)
    }

    fn parse_parameters(&self, tokens: &[&str]) -> Result<Vec<(String, f64)>> {
        tokens
            .iter()
            .map(|token| {
                let captures = PARAMETER_PATTERN
                    .captures(token)
                    .ok_or_else(|| anyhow!("Expected NAME=VALUE, found '{}'", token))?;
                let key = captures.get(1).map_or("", |m| m.as_str()).to_lowercase();
                let value = parse_value_with_unit(captures.get(2).map_or("", |m| m.as_str()))?;
                Ok((key, value))
            })
            .collect()
    }

    /// Join continuations and drop comments and blank lines. Keeps the
    /// 1-based line number where each logical line starts.
    fn preprocess_lines(&self, content: &str) -> Vec<(usize, String)> {
        let mut processed_lines: Vec<(usize, String)> = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('*') || line.starts_with(';') {
                continue;
            }

            match (line.strip_prefix('+'), processed_lines.last_mut()) {
                (Some(rest), Some((_, current))) => {
                    current.push(' ');
                    current.push_str(rest.trim());
                }
                _ => processed_lines.push((index + 1, line.to_string())),
            }
        }

        processed_lines
    }
}

/// The `count` node names following the element name.
fn nodes<'a>(tokens: &'a [&'a str], count: usize) -> Result<&'a [&'a str]> {
    tokens
        .get(1..=count)
        .ok_or_else(|| anyhow!("{} needs {} nodes", tokens[0], count))
}

fn value(tokens: &[&str], index: usize) -> Result<f64> {
    let token = tokens
        .get(index)
        .ok_or_else(|| anyhow!("{} is missing its value", tokens[0]))?;
    parse_value_with_unit(token)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn padded_identifier(input: &str) -> IResult<&str, &str> {
    delimited(space0, identifier, space0)(input)
}

/// `V(node)`, `V(pos,neg)` or `I(component)`.
fn signal(input: &str) -> IResult<&str, Signal> {
    let voltage = preceded(pair(tag_no_case("v"), char('(')), |input| {
        terminated(
            alt((
                map(
                    separated_pair(padded_identifier, char(','), padded_identifier),
                    |(pos, neg)| Signal::between(pos, neg),
                ),
                map(padded_identifier, Signal::voltage),
            )),
            char(')'),
        )(input)
    });
    let current = map(
        delimited(pair(tag_no_case("i"), char('(')), padded_identifier, char(')')),
        Signal::current,
    );
    alt((voltage, current))(input)
}

/// Parse one signal expression such as `V(out)`.
pub fn parse_signal(text: &str) -> Result<Signal> {
    all_consuming(delimited(space0, signal, space0))(text)
        .map(|(_, signal)| signal)
        .map_err(|_| anyhow!("Invalid signal '{}': expected V(node), V(pos,neg) or I(name)", text))
}

fn parse_signal_list(text: &str) -> Result<Vec<Signal>> {
    all_consuming(delimited(space0, separated_list1(space1, signal), space0))(text)
        .map(|(_, signals)| signals)
        .map_err(|_| anyhow!("Invalid signal list '{}'", text))
}

impl FromStr for Signal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_signal(s)
    }
}

/// Parse a value with an engineering suffix (e.g. 1k, 1meg, 10n, 4.7uF).
pub fn parse_value_with_unit(value_str: &str) -> Result<f64> {
    let parsed: IResult<&str, (f64, &str)> = all_consuming(pair(double, alpha0))(value_str.trim());
    let (_, (value, unit)) = parsed.map_err(|_| anyhow!("Invalid value: {}", value_str))?;

    let unit = unit.to_lowercase();
    let multiplier = if unit.starts_with("meg") {
        1e6
    } else {
        match unit.chars().next() {
            Some('f') => 1e-15,
            Some('p') => 1e-12,
            Some('n') => 1e-9,
            Some('u') => 1e-6,
            Some('m') => 1e-3,
            Some('k') => 1e3,
            Some('g') => 1e9,
            Some('t') => 1e12,
            // Bare units such as V, A, H or ohm
            _ => 1.0,
        }
    };

    Ok(value * multiplier)
}
