use crate::expr::{Expr, Function, Symbol};

/// Integer exponents up to this magnitude are lowered to `powi`.
const MAX_INTEGER_EXPONENT: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Add { dst: usize, a: usize, b: usize },
    Mul { dst: usize, a: usize, b: usize },
    Pow { dst: usize, base: usize, exponent: usize },
    PowI { dst: usize, base: usize, exponent: i32 },
    Call { dst: usize, function: Function, arg: usize },
}

/// Register layout for a system with `n` unknowns: current values in `[0, n)`,
/// previous values in `[n, 2n)`, previous derivatives in `[2n, 3n)`, the input
/// at `3n`, then the constant pool and temporaries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    unknowns: usize,
}

impl Layout {
    pub fn new(unknowns: usize) -> Self {
        Layout { unknowns }
    }

    pub fn unknown(&self, k: usize) -> usize {
        k
    }

    pub fn previous(&self, k: usize) -> usize {
        self.unknowns + k
    }

    pub fn previous_derivative(&self, k: usize) -> usize {
        2 * self.unknowns + k
    }

    pub fn input(&self) -> usize {
        3 * self.unknowns
    }

    /// Registers reserved before the constant pool.
    pub fn reserved(&self) -> usize {
        3 * self.unknowns + 1
    }

    fn symbol(&self, symbol: Symbol) -> usize {
        match symbol {
            Symbol::Unknown(k) => self.unknown(k),
            Symbol::Previous(k) => self.previous(k),
            Symbol::PreviousDerivative(k) => self.previous_derivative(k),
            Symbol::Input => self.input(),
            // Derivatives are discretized away before lowering; reading the
            // derivative history keeps stray symbols well defined.
            Symbol::Derivative(k) => self.previous_derivative(k),
        }
    }
}

/// Straight-line program computing one register per lowered expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    ops: Vec<Op>,
    outputs: Vec<usize>,
}

impl Program {
    pub fn execute(&self, frame: &mut [f64]) {
        for op in &self.ops {
            match *op {
                Op::Add { dst, a, b } => frame[dst] = frame[a] + frame[b],
                Op::Mul { dst, a, b } => frame[dst] = frame[a] * frame[b],
                Op::Pow { dst, base, exponent } => frame[dst] = frame[base].powf(frame[exponent]),
                Op::PowI { dst, base, exponent } => frame[dst] = frame[base].powi(exponent),
                Op::Call { dst, function, arg } => frame[dst] = function.apply(frame[arg]),
            }
        }
    }

    /// Register holding the value of output `i` after [`Program::execute`].
    pub fn output(&self, i: usize) -> usize {
        self.outputs[i]
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Lowers expression sets into programs sharing one frame.
#[derive(Debug, Clone)]
pub struct Lowering {
    layout: Layout,
    constants: Vec<(f64, usize)>,
    next: usize,
}

impl Lowering {
    pub fn new(layout: Layout) -> Self {
        Lowering {
            layout,
            constants: Vec::new(),
            next: layout.reserved(),
        }
    }

    /// Lower `exprs` into a program. Common subexpressions are computed once.
    pub fn lower(&mut self, exprs: &[Expr]) -> Program {
        let mut context = ProgramBuilder {
            lowering: self,
            ops: Vec::new(),
            cache: Vec::new(),
        };
        let outputs = exprs.iter().map(|e| context.lower(e)).collect();
        Program {
            ops: context.ops,
            outputs,
        }
    }

    /// Allocate a frame with the constant pool filled in.
    pub fn frame(&self) -> Vec<f64> {
        let mut frame = vec![0.0; self.next];
        for &(value, register) in &self.constants {
            frame[register] = value;
        }
        frame
    }

    pub fn frame_size(&self) -> usize {
        self.next
    }

    fn constant(&mut self, value: f64) -> usize {
        if let Some(&(_, register)) = self
            .constants
            .iter()
            .find(|(c, _)| c.to_bits() == value.to_bits())
        {
            return register;
        }
        let register = self.allocate();
        self.constants.push((value, register));
        register
    }

    fn allocate(&mut self) -> usize {
        let register = self.next;
        self.next += 1;
        register
    }
}

struct ProgramBuilder<'a> {
    lowering: &'a mut Lowering,
    ops: Vec<Op>,
    cache: Vec<(Expr, usize)>,
}

impl ProgramBuilder<'_> {
    fn temporary(&mut self) -> usize {
        self.lowering.allocate()
    }

    fn binary(&mut self, make: fn(usize, usize, usize) -> Op, items: &[Expr]) -> usize {
        let mut registers = items.iter().map(|item| self.lower(item)).collect::<Vec<_>>().into_iter();
        let Some(mut acc) = registers.next() else {
            return self.lowering.constant(0.0);
        };
        for register in registers {
            let dst = self.temporary();
            self.ops.push(make(dst, acc, register));
            acc = dst;
        }
        acc
    }

    fn lower(&mut self, expr: &Expr) -> usize {
        if let Some((_, register)) = self.cache.iter().find(|(e, _)| e == expr) {
            return *register;
        }

        let register = match expr {
            Expr::Constant(c) => return self.lowering.constant(*c),
            Expr::Variable(s) => return self.lowering.layout.symbol(*s),
            Expr::Sum(terms) => self.binary(|dst, a, b| Op::Add { dst, a, b }, terms),
            Expr::Product(factors) => self.binary(|dst, a, b| Op::Mul { dst, a, b }, factors),
            Expr::Power(base, exponent) => {
                let base = self.lower(base);
                let dst = self.temporary();
                match exponent.as_constant() {
                    Some(e) if e.fract() == 0.0 && e.abs() <= MAX_INTEGER_EXPONENT => {
                        self.ops.push(Op::PowI {
                            dst,
                            base,
                            exponent: e as i32,
                        });
                    }
                    _ => {
                        let exponent = self.lower(exponent);
                        self.ops.push(Op::Pow { dst, base, exponent });
                    }
                }
                dst
            }
            Expr::Call(function, arg) => {
                let arg = self.lower(arg);
                let dst = self.temporary();
                self.ops.push(Op::Call {
                    dst,
                    function: *function,
                    arg,
                });
                dst
            }
        };
        self.cache.push((expr.clone(), register));
        register
    }
}
