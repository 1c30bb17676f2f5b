use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Arguments above this are continued linearly by [`Function::Exp`].
pub const EXP_LIMIT: f64 = 40.0;

/// A variable appearing in circuit equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    /// Value of unknown `k` at the current time step.
    Unknown(usize),
    /// Time derivative of unknown `k` at the current time step.
    Derivative(usize),
    /// Value of unknown `k` at the previous time step.
    Previous(usize),
    /// Time derivative of unknown `k` at the previous time step.
    PreviousDerivative(usize),
    /// Current input sample.
    Input,
}

impl Symbol {
    pub fn is_unknown(self) -> bool {
        matches!(self, Symbol::Unknown(_))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Unknown(k) => write!(f, "x{}", k),
            Symbol::Derivative(k) => write!(f, "x{}'", k),
            Symbol::Previous(k) => write!(f, "x{}[-1]", k),
            Symbol::PreviousDerivative(k) => write!(f, "x{}'[-1]", k),
            Symbol::Input => write!(f, "u"),
        }
    }
}

/// Transcendental functions available to device equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    /// Exponential, continued linearly above [`EXP_LIMIT`].
    Exp,
    /// Slope of [`Function::Exp`]: `exp(min(x, EXP_LIMIT))`.
    ExpSlope,
    Ln,
    Sqrt,
    Tanh,
    Sin,
    Cos,
    Abs,
    Sign,
}

impl Function {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Function::Exp => {
                if x <= EXP_LIMIT {
                    x.exp()
                } else {
                    EXP_LIMIT.exp() * (1.0 + x - EXP_LIMIT)
                }
            }
            Function::ExpSlope => x.min(EXP_LIMIT).exp(),
            Function::Ln => x.ln(),
            Function::Sqrt => x.sqrt(),
            Function::Tanh => x.tanh(),
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Abs => x.abs(),
            Function::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// d f(a) / d a, as an expression of `a`.
    fn derivative_at(self, arg: &Expr) -> Expr {
        match self {
            Function::Exp | Function::ExpSlope => Expr::call(Function::ExpSlope, arg.clone()),
            Function::Ln => Expr::pow(arg.clone(), Expr::constant(-1.0)),
            Function::Sqrt => {
                Expr::constant(0.5) * Expr::pow(arg.clone(), Expr::constant(-0.5))
            }
            Function::Tanh => {
                let t = Expr::call(Function::Tanh, arg.clone());
                Expr::constant(1.0) - Expr::pow(t, Expr::constant(2.0))
            }
            Function::Sin => Expr::call(Function::Cos, arg.clone()),
            Function::Cos => -Expr::call(Function::Sin, arg.clone()),
            Function::Abs => Expr::call(Function::Sign, arg.clone()),
            Function::Sign => Expr::zero(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Exp => "exp",
            Function::ExpSlope => "dexp",
            Function::Ln => "ln",
            Function::Sqrt => "sqrt",
            Function::Tanh => "tanh",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Abs => "abs",
            Function::Sign => "sign",
        }
    }
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(f64),
    Variable(Symbol),
    Sum(Vec<Expr>),
    Product(Vec<Expr>),
    Power(Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    pub fn constant(value: f64) -> Expr {
        Expr::Constant(value)
    }

    pub fn zero() -> Expr {
        Expr::Constant(0.0)
    }

    pub fn var(symbol: Symbol) -> Expr {
        Expr::Variable(symbol)
    }

    pub fn unknown(index: usize) -> Expr {
        Expr::Variable(Symbol::Unknown(index))
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Expr::Constant(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_constant() == Some(0.0)
    }

    /// Split a term into its numeric coefficient and the remaining base.
    fn coefficient_and_base(&self) -> (f64, Expr) {
        match self {
            Expr::Constant(c) => (*c, Expr::Constant(1.0)),
            Expr::Product(factors) => match factors.split_first() {
                Some((Expr::Constant(c), rest)) => {
                    let base = if rest.len() == 1 {
                        rest[0].clone()
                    } else {
                        Expr::Product(rest.to_vec())
                    };
                    (*c, base)
                }
                _ => (1.0, self.clone()),
            },
            _ => (1.0, self.clone()),
        }
    }

    /// `coefficient * base` without further simplification.
    fn scaled_term(coefficient: f64, base: Expr) -> Expr {
        if coefficient == 1.0 {
            return base;
        }
        match base {
            Expr::Product(mut factors) => {
                factors.insert(0, Expr::Constant(coefficient));
                Expr::Product(factors)
            }
            base => Expr::Product(vec![Expr::Constant(coefficient), base]),
        }
    }

    /// Simplifying sum: flattens, folds constants and collects like terms.
    pub fn sum(terms: Vec<Expr>) -> Expr {
        let mut constant = 0.0;
        let mut collected: Vec<(f64, Expr)> = Vec::new();
        let mut pending = terms;
        pending.reverse();

        while let Some(term) = pending.pop() {
            match term {
                Expr::Constant(c) => constant += c,
                Expr::Sum(inner) => pending.extend(inner.into_iter().rev()),
                term => {
                    let (coefficient, base) = term.coefficient_and_base();
                    match collected.iter_mut().find(|(_, b)| *b == base) {
                        Some((c, _)) => *c += coefficient,
                        None => collected.push((coefficient, base)),
                    }
                }
            }
        }

        let mut result: Vec<Expr> = collected
            .into_iter()
            .filter(|(c, _)| *c != 0.0)
            .map(|(c, base)| Expr::scaled_term(c, base))
            .collect();
        if constant != 0.0 {
            result.push(Expr::Constant(constant));
        }

        match result.len() {
            0 => Expr::zero(),
            1 => result.pop().unwrap_or_else(Expr::zero),
            _ => Expr::Sum(result),
        }
    }

    /// Simplifying product: flattens, folds constants, merges powers of the
    /// same base and distributes a constant over a single sum.
    pub fn product(factors: Vec<Expr>) -> Expr {
        let mut coefficient = 1.0;
        let mut bases: Vec<(Expr, Expr)> = Vec::new();
        let mut pending = factors;
        pending.reverse();

        while let Some(factor) = pending.pop() {
            match factor {
                Expr::Constant(c) => coefficient *= c,
                Expr::Product(inner) => pending.extend(inner.into_iter().rev()),
                factor => {
                    let (base, exponent) = match factor {
                        Expr::Power(base, exponent) => (*base, *exponent),
                        other => (other, Expr::Constant(1.0)),
                    };
                    match bases.iter_mut().find(|(b, _)| *b == base) {
                        Some((_, e)) => *e = Expr::sum(vec![e.clone(), exponent]),
                        None => bases.push((base, exponent)),
                    }
                }
            }
        }

        if coefficient == 0.0 {
            return Expr::zero();
        }

        let mut rest = Vec::with_capacity(bases.len());
        for (base, exponent) in bases {
            match Expr::pow(base, exponent) {
                Expr::Constant(c) => coefficient *= c,
                Expr::Product(inner) => rest.extend(inner),
                other => rest.push(other),
            }
        }

        match rest.len() {
            0 => Expr::Constant(coefficient),
            1 => {
                let factor = rest.remove(0);
                if coefficient == 1.0 {
                    factor
                } else if let Expr::Sum(terms) = factor {
                    Expr::sum(terms.into_iter().map(|t| t.scaled(coefficient)).collect())
                } else {
                    Expr::Product(vec![Expr::Constant(coefficient), factor])
                }
            }
            _ => {
                if coefficient != 1.0 {
                    rest.insert(0, Expr::Constant(coefficient));
                }
                Expr::Product(rest)
            }
        }
    }

    pub fn pow(base: Expr, exponent: Expr) -> Expr {
        match (&base, &exponent) {
            (Expr::Constant(b), Expr::Constant(e)) => Expr::Constant(b.powf(*e)),
            (_, Expr::Constant(e)) if *e == 0.0 => Expr::Constant(1.0),
            (_, Expr::Constant(e)) if *e == 1.0 => base,
            (Expr::Constant(b), _) if *b == 1.0 => Expr::Constant(1.0),
            (Expr::Power(inner, e1), Expr::Constant(e2)) if e2.fract() == 0.0 => {
                Expr::pow((**inner).clone(), Expr::product(vec![(**e1).clone(), exponent]))
            }
            (Expr::Product(factors), Expr::Constant(e)) if e.fract() == 0.0 => Expr::product(
                factors
                    .iter()
                    .map(|f| Expr::pow(f.clone(), Expr::Constant(*e)))
                    .collect(),
            ),
            _ => Expr::Power(Box::new(base), Box::new(exponent)),
        }
    }

    pub fn call(function: Function, arg: Expr) -> Expr {
        match arg {
            Expr::Constant(c) => Expr::Constant(function.apply(c)),
            arg => Expr::Call(function, Box::new(arg)),
        }
    }

    pub fn scaled(self, factor: f64) -> Expr {
        Expr::product(vec![Expr::Constant(factor), self])
    }

    pub fn recip(self) -> Expr {
        Expr::pow(self, Expr::Constant(-1.0))
    }

    /// True if any symbol in the expression satisfies `pred`.
    pub fn depends_on(&self, pred: &impl Fn(Symbol) -> bool) -> bool {
        match self {
            Expr::Constant(_) => false,
            Expr::Variable(s) => pred(*s),
            Expr::Sum(items) | Expr::Product(items) => items.iter().any(|e| e.depends_on(pred)),
            Expr::Power(base, exponent) => base.depends_on(pred) || exponent.depends_on(pred),
            Expr::Call(_, arg) => arg.depends_on(pred),
        }
    }

    pub fn contains(&self, symbol: Symbol) -> bool {
        self.depends_on(&|s| s == symbol)
    }

    /// Collect every symbol into `out`.
    pub fn symbols(&self, out: &mut BTreeSet<Symbol>) {
        match self {
            Expr::Constant(_) => {}
            Expr::Variable(s) => {
                out.insert(*s);
            }
            Expr::Sum(items) | Expr::Product(items) => {
                for item in items {
                    item.symbols(out);
                }
            }
            Expr::Power(base, exponent) => {
                base.symbols(out);
                exponent.symbols(out);
            }
            Expr::Call(_, arg) => arg.symbols(out),
        }
    }

    /// Symbolic partial derivative with respect to `symbol`.
    pub fn derivative(&self, symbol: Symbol) -> Expr {
        if !self.contains(symbol) {
            return Expr::zero();
        }
        match self {
            Expr::Constant(_) => Expr::zero(),
            Expr::Variable(s) => Expr::Constant(if *s == symbol { 1.0 } else { 0.0 }),
            Expr::Sum(terms) => Expr::sum(terms.iter().map(|t| t.derivative(symbol)).collect()),
            Expr::Product(factors) => {
                let mut terms = Vec::new();
                for (i, factor) in factors.iter().enumerate() {
                    let d = factor.derivative(symbol);
                    if d.is_zero() {
                        continue;
                    }
                    let mut parts: Vec<Expr> = factors
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, f)| f.clone())
                        .collect();
                    parts.push(d);
                    terms.push(Expr::product(parts));
                }
                Expr::sum(terms)
            }
            Expr::Power(base, exponent) => {
                let db = base.derivative(symbol);
                if !exponent.contains(symbol) {
                    // d(b^e) = e * b^(e-1) * b'
                    let lowered = Expr::sum(vec![(**exponent).clone(), Expr::Constant(-1.0)]);
                    Expr::product(vec![
                        (**exponent).clone(),
                        Expr::pow((**base).clone(), lowered),
                        db,
                    ])
                } else {
                    // d(b^e) = b^e * (e' ln b + e b' / b)
                    let de = exponent.derivative(symbol);
                    let ln_b = Expr::call(Function::Ln, (**base).clone());
                    Expr::product(vec![
                        self.clone(),
                        Expr::sum(vec![
                            Expr::product(vec![de, ln_b]),
                            Expr::product(vec![
                                (**exponent).clone(),
                                db,
                                (**base).clone().recip(),
                            ]),
                        ]),
                    ])
                }
            }
            Expr::Call(function, arg) => {
                Expr::product(vec![function.derivative_at(arg), arg.derivative(symbol)])
            }
        }
    }

    /// Replace symbols for which `f` returns an expression, re-simplifying on the way up.
    pub fn substitute(&self, f: &impl Fn(Symbol) -> Option<Expr>) -> Expr {
        match self {
            Expr::Constant(c) => Expr::Constant(*c),
            Expr::Variable(s) => f(*s).unwrap_or(Expr::Variable(*s)),
            Expr::Sum(terms) => Expr::sum(terms.iter().map(|t| t.substitute(f)).collect()),
            Expr::Product(factors) => {
                Expr::product(factors.iter().map(|t| t.substitute(f)).collect())
            }
            Expr::Power(base, exponent) => Expr::pow(base.substitute(f), exponent.substitute(f)),
            Expr::Call(function, arg) => Expr::call(*function, arg.substitute(f)),
        }
    }

    /// Split into linear coefficients on symbols selected by `is_var` plus a remainder.
    ///
    /// Coefficients are returned in first-appearance order. Any selected
    /// symbol left in the remainder appears nonlinearly.
    pub fn linear_split(&self, is_var: &impl Fn(Symbol) -> bool) -> (Vec<(Symbol, f64)>, Expr) {
        let terms: &[Expr] = match self {
            Expr::Sum(terms) => terms,
            other => std::slice::from_ref(other),
        };

        let mut coefficients: Vec<(Symbol, f64)> = Vec::new();
        let mut rest = Vec::new();
        for term in terms {
            let (c, base) = term.coefficient_and_base();
            match base {
                Expr::Variable(s) if is_var(s) => match coefficients.iter_mut().find(|(v, _)| *v == s) {
                    Some((_, existing)) => *existing += c,
                    None => coefficients.push((s, c)),
                },
                _ => rest.push(term.clone()),
            }
        }
        (coefficients, Expr::sum(rest))
    }

    /// Numeric evaluation with symbol values supplied by `lookup`.
    pub fn eval(&self, lookup: &impl Fn(Symbol) -> f64) -> f64 {
        match self {
            Expr::Constant(c) => *c,
            Expr::Variable(s) => lookup(*s),
            Expr::Sum(terms) => terms.iter().map(|t| t.eval(lookup)).sum(),
            Expr::Product(factors) => factors.iter().map(|t| t.eval(lookup)).product(),
            Expr::Power(base, exponent) => base.eval(lookup).powf(exponent.eval(lookup)),
            Expr::Call(function, arg) => function.apply(arg.eval(lookup)),
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Constant(value)
    }
}

impl From<Symbol> for Expr {
    fn from(symbol: Symbol) -> Self {
        Expr::Variable(symbol)
    }
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::sum(vec![self, rhs])
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::sum(vec![self, rhs.scaled(-1.0)])
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::product(vec![self, rhs])
    }
}

impl Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::product(vec![self, rhs.recip()])
    }
}

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self.scaled(-1.0)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(c) => write!(f, "{}", c),
            Expr::Variable(s) => write!(f, "{}", s),
            Expr::Sum(terms) => {
                write!(f, "(")?;
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{}", term)?;
                }
                write!(f, ")")
            }
            Expr::Product(factors) => {
                for (i, factor) in factors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "*")?;
                    }
                    write!(f, "{}", factor)?;
                }
                Ok(())
            }
            Expr::Power(base, exponent) => write!(f, "{}^({})", base, exponent),
            Expr::Call(function, arg) => write!(f, "{}({})", function.name(), arg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn x(k: usize) -> Expr {
        Expr::unknown(k)
    }

    #[test]
    fn test_sum_collects_like_terms() {
        let e = x(0) + x(1) + x(0).scaled(2.0) + Expr::constant(1.5) - Expr::constant(0.5);
        let (coefficients, rest) = e.linear_split(&Symbol::is_unknown);
        assert_eq!(coefficients, vec![(Symbol::Unknown(0), 3.0), (Symbol::Unknown(1), 1.0)]);
        assert_eq!(rest, Expr::constant(1.0));
    }

    #[test]
    fn test_cancellation_yields_zero() {
        let e = x(3) - x(3);
        assert!(e.is_zero());
        let p = x(2) * x(2).recip();
        assert_eq!(p, Expr::constant(1.0));
    }

    #[test]
    fn test_constant_distributes_over_sum() {
        let e = Expr::constant(2.0) * (x(0) - Expr::var(Symbol::Previous(0)));
        let (coefficients, rest) = e.linear_split(&Symbol::is_unknown);
        assert_eq!(coefficients, vec![(Symbol::Unknown(0), 2.0)]);
        assert_eq!(rest, Expr::var(Symbol::Previous(0)).scaled(-2.0));
    }

    #[test]
    fn test_nonlinear_terms_stay_in_remainder() {
        let diode = Expr::constant(1e-9) * (Expr::call(Function::Exp, x(1).scaled(40.0)) - Expr::constant(1.0));
        let e = x(1).scaled(1e-3) + diode;
        let (coefficients, rest) = e.linear_split(&Symbol::is_unknown);
        assert_eq!(coefficients, vec![(Symbol::Unknown(1), 1e-3)]);
        assert!(rest.contains(Symbol::Unknown(1)));
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let e = Expr::call(Function::Tanh, x(0) * x(1)) + Expr::pow(x(0), Expr::constant(3.0))
            - Expr::call(Function::Exp, x(1).scaled(0.5)) / x(0);
        let at = |a: f64, b: f64| {
            move |s: Symbol| match s {
                Symbol::Unknown(0) => a,
                Symbol::Unknown(1) => b,
                _ => 0.0,
            }
        };
        let (a, b, eps) = (0.7, -0.3, 1e-6);
        let numeric = (e.eval(&at(a + eps, b)) - e.eval(&at(a - eps, b))) / (2.0 * eps);
        let symbolic = e.derivative(Symbol::Unknown(0)).eval(&at(a, b));
        assert_relative_eq!(numeric, symbolic, epsilon = 1e-6);

        let numeric = (e.eval(&at(a, b + eps)) - e.eval(&at(a, b - eps))) / (2.0 * eps);
        let symbolic = e.derivative(Symbol::Unknown(1)).eval(&at(a, b));
        assert_relative_eq!(numeric, symbolic, epsilon = 1e-6);
    }

    #[test]
    fn test_derivative_of_independent_expression_is_zero() {
        let e = Expr::call(Function::Sin, Expr::var(Symbol::Previous(0)));
        assert!(e.derivative(Symbol::Unknown(0)).is_zero());
    }

    #[test]
    fn test_substitute_resimplifies() {
        let e = x(0) + x(1);
        let replaced = e.substitute(&|s| match s {
            Symbol::Unknown(1) => Some(-x(0)),
            _ => None,
        });
        assert!(replaced.is_zero());
    }

    #[test]
    fn test_clamped_exponential_stays_finite() {
        let big = Function::Exp.apply(1e4);
        assert!(big.is_finite());
        assert_relative_eq!(Function::Exp.apply(1.0), 1.0f64.exp());
        assert_relative_eq!(Function::ExpSlope.apply(200.0), EXP_LIMIT.exp());
    }

    #[test]
    fn test_constant_calls_fold() {
        assert_eq!(Expr::call(Function::Exp, Expr::constant(0.0)), Expr::constant(1.0));
        assert_eq!(Expr::pow(Expr::constant(2.0), Expr::constant(3.0)), Expr::constant(8.0));
    }

    #[test]
    fn test_display() {
        let e = x(0).scaled(2.0) + Expr::var(Symbol::Input);
        assert_eq!(e.to_string(), "(2*x0 + u)");
    }
}
