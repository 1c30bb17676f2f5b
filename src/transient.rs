use std::collections::BTreeSet;
use std::time::Instant;

use log::{debug, info};
use nalgebra::DMatrix;
use sprs::TriMat;

use crate::circuit::{Signal, Topology};
use crate::config::{Integration, SimulationParams};
use crate::equations::{EquationSystem, SignalMap, Tap, Unknown};
use crate::error::{BuildError, SingularSystemError};
use crate::expr::{Expr, Symbol};
use crate::solver::sparse_to_dense;

/// Pivots smaller than this fraction of their column's largest coefficient count as zero.
const PIVOT_EPSILON: f64 = 1e-12;

/// Fixed step and integration rule for one compiled solution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Discretization {
    pub time_step: f64,
    pub integration: Integration,
}

impl Discretization {
    pub fn new(time_step: f64, integration: Integration) -> Self {
        Discretization {
            time_step,
            integration,
        }
    }

    pub fn from_params(params: &SimulationParams) -> Self {
        Discretization::new(params.time_step(), params.integration)
    }

    /// Expression replacing the derivative of unknown `k`.
    pub fn derivative(&self, k: usize) -> Expr {
        let x = Expr::unknown(k);
        let previous = Expr::var(Symbol::Previous(k));
        match self.integration {
            Integration::Trapezoidal => Expr::sum(vec![
                x.scaled(2.0 / self.time_step),
                previous.scaled(-2.0 / self.time_step),
                Expr::var(Symbol::PreviousDerivative(k)).scaled(-1.0),
            ]),
            Integration::BackwardEuler => (x - previous).scaled(1.0 / self.time_step),
        }
    }

    /// Numeric derivative estimate after committing `current`.
    pub fn derivative_value(&self, current: f64, previous: f64, previous_derivative: f64) -> f64 {
        match self.integration {
            Integration::Trapezoidal => {
                2.0 / self.time_step * (current - previous) - previous_derivative
            }
            Integration::BackwardEuler => (current - previous) / self.time_step,
        }
    }
}

/// Discretized and solved update relation for one topology and step size.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientSolution {
    pub unknowns: Vec<Unknown>,
    pub discretization: Discretization,
    /// Unknowns solved by Newton iteration, in column order.
    pub iterated: Vec<usize>,
    /// Residual expressions `F(x_I)`, one per iterated unknown.
    pub residuals: Vec<Expr>,
    /// Row-major Jacobian `dF_r / dx_I[c]`.
    pub jacobian: Vec<Expr>,
    /// Closed-form updates for eliminated unknowns. They depend only on
    /// iterated unknowns, history and the input.
    pub updates: Vec<(usize, Expr)>,
    /// Unknowns whose derivative history must be tracked.
    pub differentiated: Vec<usize>,
    pub signals: SignalMap,
    /// Designated output signal of the topology.
    pub output: Signal,
}

impl TransientSolution {
    pub fn solve(
        system: &EquationSystem,
        discretization: &Discretization,
    ) -> Result<Self, SingularSystemError> {
        let n = system.unknown_count();
        if system.equations.len() != n {
            return Err(SingularSystemError::ResidualMismatch {
                equations: system.equations.len(),
                unknowns: n,
            });
        }

        let mut differentiated = BTreeSet::new();
        let mut rows = Vec::with_capacity(n);
        for equation in &system.equations {
            let mut symbols = BTreeSet::new();
            equation.residual.symbols(&mut symbols);
            for symbol in symbols {
                if let Symbol::Derivative(k) = symbol {
                    differentiated.insert(k);
                }
            }
            let discrete = equation.residual.substitute(&|s| match s {
                Symbol::Derivative(k) => Some(discretization.derivative(k)),
                _ => None,
            });
            rows.push(discrete.linear_split(&Symbol::is_unknown));
        }

        let mut triplets = TriMat::new((n, n));
        let mut remainders = Vec::with_capacity(n);
        for (i, (coefficients, remainder)) in rows.into_iter().enumerate() {
            for (symbol, value) in coefficients {
                if let Symbol::Unknown(k) = symbol {
                    triplets.add_triplet(i, k, value);
                }
            }
            remainders.push(remainder);
        }
        let matrix = sparse_to_dense(&triplets.to_csr());

        let mut elimination = Elimination::new(matrix, remainders);
        elimination.run(&system.unknowns)?;
        let solution = elimination.finish(system, *discretization, differentiated.into_iter().collect())?;

        debug!(
            "Eliminated {} of {} unknowns, {} iterated",
            solution.updates.len(),
            n,
            solution.iterated.len()
        );
        Ok(solution)
    }

    pub fn unknown_count(&self) -> usize {
        self.unknowns.len()
    }

    pub fn is_linear(&self) -> bool {
        self.iterated.is_empty()
    }

    /// Resolve an output or probe signal against the solved unknowns.
    pub fn resolve(&self, signal: &Signal) -> Option<Tap> {
        self.signals.resolve(signal)
    }

    pub fn output_tap(&self) -> Tap {
        self.resolve(&self.output).unwrap_or(Tap::ZERO)
    }
}

/// Build equations and compile them for the given parameters.
pub fn compile(topology: &Topology, params: &SimulationParams) -> Result<TransientSolution, BuildError> {
    params.validate()?;
    let start_time = Instant::now();

    let system = EquationSystem::build(topology)?;
    let solution = TransientSolution::solve(&system, &Discretization::from_params(params))?;

    info!(
        "Compiled '{}' ({} unknowns, {} iterated) in {:.3}ms",
        topology.circuit.title,
        solution.unknown_count(),
        solution.iterated.len(),
        start_time.elapsed().as_secs_f64() * 1000.0
    );
    Ok(solution)
}

/// Gauss-Jordan elimination over numeric coefficients with symbolic remainders.
///
/// Row `i` reads `sum_k a[i,k] x_k + b[i] = 0`.
struct Elimination {
    a: DMatrix<f64>,
    b: Vec<Expr>,
    /// Largest original magnitude per column; pivots are judged against
    /// their own column so siemens and inductor rows do not mix scales.
    column_scale: Vec<f64>,
    /// pivot row per column
    pivots: Vec<Option<usize>>,
    used: Vec<bool>,
}

impl Elimination {
    fn new(a: DMatrix<f64>, b: Vec<Expr>) -> Self {
        let (rows, cols) = a.shape();
        let column_scale = (0..cols)
            .map(|c| a.column(c).iter().fold(0.0f64, |m, v| m.max(v.abs())))
            .collect();
        Elimination {
            a,
            b,
            column_scale,
            pivots: vec![None; cols],
            used: vec![false; rows],
        }
    }

    fn is_pure(&self, row: usize) -> bool {
        !self.b[row].depends_on(&Symbol::is_unknown)
    }

    fn run(&mut self, unknowns: &[Unknown]) -> Result<(), SingularSystemError> {
        let cols = self.a.ncols();
        let mut nonlinear = vec![false; cols];
        for remainder in &self.b {
            let mut symbols = BTreeSet::new();
            remainder.symbols(&mut symbols);
            for symbol in symbols {
                if let Symbol::Unknown(k) = symbol {
                    nonlinear[k] = true;
                }
            }
        }

        // Linear unknowns must all be eliminated. Prefer rows without
        // nonlinear terms so the residual system keeps its equations.
        for col in (0..cols).filter(|&c| !nonlinear[c]) {
            let pivot = self
                .best_pivot(col, false)
                .ok_or_else(|| SingularSystemError::NoPivot {
                    unknown: unknowns[col].to_string(),
                })?;
            self.eliminate(pivot, col);
        }

        // Nonlinear unknowns are eliminated only through purely linear rows.
        for col in (0..cols).filter(|&c| nonlinear[c]) {
            if let Some(pivot) = self.best_pivot(col, true) {
                self.eliminate(pivot, col);
            }
        }
        Ok(())
    }

    fn best_pivot(&self, col: usize, pure_only: bool) -> Option<usize> {
        let mut best: Option<(bool, f64, usize)> = None;
        for row in (0..self.a.nrows()).filter(|&r| !self.used[r]) {
            let magnitude = self.a[(row, col)].abs();
            if magnitude == 0.0 || magnitude <= PIVOT_EPSILON * self.column_scale[col] {
                continue;
            }
            let pure = self.is_pure(row);
            if pure_only && !pure {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_pure, best_magnitude, _)) => {
                    (pure && !best_pure) || (pure == best_pure && magnitude > best_magnitude)
                }
            };
            if better {
                best = Some((pure, magnitude, row));
            }
        }
        best.map(|(_, _, row)| row)
    }

    fn eliminate(&mut self, pivot: usize, col: usize) {
        let cols = self.a.ncols();
        let scale = 1.0 / self.a[(pivot, col)];
        for c in 0..cols {
            self.a[(pivot, c)] *= scale;
        }
        self.a[(pivot, col)] = 1.0;
        self.b[pivot] = self.b[pivot].clone().scaled(scale);

        for row in 0..self.a.nrows() {
            if row == pivot {
                continue;
            }
            let factor = self.a[(row, col)];
            if factor == 0.0 {
                continue;
            }
            for c in 0..cols {
                let current = self.a[(row, c)];
                let delta = factor * self.a[(pivot, c)];
                let value = current - delta;
                // Only cancellation residue is flushed, relative to the operands.
                let cancelled = value.abs() <= PIVOT_EPSILON * current.abs().max(delta.abs());
                self.a[(row, c)] = if cancelled { 0.0 } else { value };
            }
            self.a[(row, col)] = 0.0;
            self.b[row] = self.b[row].clone() - self.b[pivot].clone().scaled(factor);
        }

        self.pivots[col] = Some(pivot);
        self.used[pivot] = true;
    }

    /// Linear part of row `row` restricted to the iterated columns.
    fn iterated_terms(&self, row: usize, iterated: &[usize]) -> Vec<Expr> {
        iterated
            .iter()
            .filter(|&&k| self.a[(row, k)] != 0.0)
            .map(|&k| Expr::unknown(k).scaled(self.a[(row, k)]))
            .collect()
    }

    fn finish(
        self,
        system: &EquationSystem,
        discretization: Discretization,
        differentiated: Vec<usize>,
    ) -> Result<TransientSolution, SingularSystemError> {
        let iterated: Vec<usize> = (0..self.a.ncols())
            .filter(|&c| self.pivots[c].is_none())
            .collect();

        // x_j = -(b_p + sum_{k in I} a[p,k] x_k) for every pivot column j.
        let mut solved: Vec<Option<Expr>> = vec![None; self.a.ncols()];
        for (col, pivot) in self.pivots.iter().enumerate() {
            if let Some(p) = *pivot {
                let mut terms = self.iterated_terms(p, &iterated);
                terms.push(self.b[p].clone());
                solved[col] = Some(-Expr::sum(terms));
            }
        }

        // Columns solved through linear rows depend on iterated unknowns
        // only; substitute them wherever they still appear nonlinearly.
        let linear_solutions: Vec<Option<Expr>> = solved
            .iter()
            .map(|e| e.as_ref().filter(|e| !e.depends_on(&|s| {
                matches!(s, Symbol::Unknown(k) if !iterated.contains(&k))
            })).cloned())
            .collect();
        let replace = |s: Symbol| match s {
            Symbol::Unknown(k) => linear_solutions[k].clone(),
            _ => None,
        };

        let updates: Vec<(usize, Expr)> = solved
            .into_iter()
            .enumerate()
            .filter_map(|(k, e)| e.map(|e| (k, e.substitute(&replace))))
            .collect();

        let residual_rows: Vec<usize> = (0..self.a.nrows()).filter(|&r| !self.used[r]).collect();
        if residual_rows.len() != iterated.len() {
            return Err(SingularSystemError::ResidualMismatch {
                equations: residual_rows.len(),
                unknowns: iterated.len(),
            });
        }

        let mut residuals = Vec::with_capacity(residual_rows.len());
        for &row in &residual_rows {
            let mut terms = self.iterated_terms(row, &iterated);
            terms.push(self.b[row].substitute(&replace));
            let residual = Expr::sum(terms);
            if !residual.depends_on(&Symbol::is_unknown) {
                return Err(SingularSystemError::ResidualMismatch {
                    equations: residual_rows.len() - 1,
                    unknowns: iterated.len(),
                });
            }
            residuals.push(residual);
        }

        let mut jacobian = Vec::with_capacity(iterated.len() * iterated.len());
        for residual in &residuals {
            for &k in &iterated {
                jacobian.push(residual.derivative(Symbol::Unknown(k)));
            }
        }

        Ok(TransientSolution {
            unknowns: system.unknowns.clone(),
            discretization,
            iterated,
            residuals,
            jacobian,
            updates,
            differentiated,
            signals: system.signals.clone(),
            output: system.output.clone(),
        })
    }
}
