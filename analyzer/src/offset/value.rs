//! Offset values: the nodes of the arithmetic context function
//!
//! An [`OffsetVal`] is an immutable expression tree over bounded-width
//! integer constants, opaque IR leaves, and binary operators. Nodes are
//! shared through [`OffsetPtr`] handles and never mutated after
//! construction, so subtrees can be reused freely across rewrites.

use crate::ir::{ArgRef, InstRef, Module, Value};
use crate::offset::OffsetError;
use std::fmt;
use std::rc::Rc;

/// A bounded-width two's-complement integer with explicit bit width.
///
/// Stores the raw bit pattern masked to the width; signed interpretation
/// is applied per operation, mirroring the arbitrary-precision integers
/// of compiler IRs. Widths run from 1 (conditions) to 64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntVal {
    width: u32,
    bits: u128,
}

impl IntVal {
    pub fn new(width: u32, value: i128) -> Self {
        debug_assert!(width >= 1 && width <= 64);
        Self { width, bits: (value as u128) & Self::mask(width) }
    }

    /// The default constant width used by synthesized offsets
    pub fn of_i32(value: i64) -> Self {
        Self::new(32, value as i128)
    }

    fn mask(width: u32) -> u128 {
        if width >= 128 { u128::MAX } else { (1u128 << width) - 1 }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Signed interpretation of the bit pattern
    pub fn as_signed(&self) -> i128 {
        let sign_bit = 1u128 << (self.width - 1);
        if self.bits & sign_bit != 0 {
            (self.bits | !Self::mask(self.width)) as i128
        } else {
            self.bits as i128
        }
    }

    pub fn as_unsigned(&self) -> u128 {
        self.bits
    }

    pub fn is_zero(&self) -> bool {
        self.bits == 0
    }

    pub fn is_one(&self) -> bool {
        self.bits == 1
    }

    pub fn is_non_negative(&self) -> bool {
        self.as_signed() >= 0
    }

    pub fn min_signed(width: u32) -> Self {
        Self::new(width, -(1i128 << (width - 1)))
    }

    pub fn max_signed(width: u32) -> Self {
        Self::new(width, (1i128 << (width - 1)) - 1)
    }

    pub fn is_min_signed(&self) -> bool {
        *self == Self::min_signed(self.width)
    }

    pub fn is_max_signed(&self) -> bool {
        *self == Self::max_signed(self.width)
    }

    /// Sign-extend to `width` if wider than the current width
    pub fn sext_or_self(&self, width: u32) -> Self {
        if width <= self.width {
            *self
        } else {
            Self::new(width, self.as_signed())
        }
    }

    /// Zero-extend to `width` if wider than the current width
    pub fn zext_or_self(&self, width: u32) -> Self {
        if width <= self.width {
            *self
        } else {
            Self { width, bits: self.bits }
        }
    }

    // Arithmetic wraps within the width, like any machine integer.

    pub fn add(&self, rhs: &Self) -> Self {
        Self::new(self.width, self.as_signed().wrapping_add(rhs.as_signed()))
    }

    pub fn sub(&self, rhs: &Self) -> Self {
        Self::new(self.width, self.as_signed().wrapping_sub(rhs.as_signed()))
    }

    pub fn mul(&self, rhs: &Self) -> Self {
        Self::new(self.width, self.as_signed().wrapping_mul(rhs.as_signed()))
    }

    /// Signed division; a zero divisor yields zero rather than a fault
    pub fn sdiv(&self, rhs: &Self) -> Self {
        if rhs.is_zero() {
            return Self::new(self.width, 0);
        }
        Self::new(self.width, self.as_signed().wrapping_div(rhs.as_signed()))
    }

    pub fn udiv(&self, rhs: &Self) -> Self {
        if rhs.is_zero() {
            return Self::new(self.width, 0);
        }
        Self { width: self.width, bits: (self.bits / rhs.bits) & Self::mask(self.width) }
    }

    pub fn srem(&self, rhs: &Self) -> Self {
        if rhs.is_zero() {
            return Self::new(self.width, 0);
        }
        Self::new(self.width, self.as_signed().wrapping_rem(rhs.as_signed()))
    }

    pub fn urem(&self, rhs: &Self) -> Self {
        if rhs.is_zero() {
            return Self::new(self.width, 0);
        }
        Self { width: self.width, bits: (self.bits % rhs.bits) & Self::mask(self.width) }
    }

    pub fn slt(&self, rhs: &Self) -> bool {
        self.as_signed() < rhs.as_signed()
    }

    pub fn sgt(&self, rhs: &Self) -> bool {
        self.as_signed() > rhs.as_signed()
    }

    pub fn ult(&self, rhs: &Self) -> bool {
        self.bits < rhs.bits
    }

    pub fn ugt(&self, rhs: &Self) -> bool {
        self.bits > rhs.bits
    }

    /// Equality after sign-extension to the common width
    pub fn eq_widened(&self, rhs: &Self) -> bool {
        let width = self.width.max(rhs.width);
        self.sext_or_self(width).bits == rhs.sext_or_self(width).bits
    }

    pub fn signed_min(a: Self, b: Self) -> Self {
        if a.as_signed() <= b.as_signed() { a } else { b }
    }

    pub fn signed_max(a: Self, b: Self) -> Self {
        if a.as_signed() >= b.as_signed() { a } else { b }
    }
}

impl fmt::Display for IntVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_signed())
    }
}

/// Binary operators of the offset algebra. Comparison operators yield
/// one-bit results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetOperator {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Eq,
    Neq,
    SLT,
    SLE,
    SGT,
    SGE,
    ULT,
    ULE,
    UGT,
    UGE,
}

impl OffsetOperator {
    pub fn is_compare(&self) -> bool {
        use OffsetOperator::*;
        matches!(self, Eq | Neq | SLT | SLE | SGT | SGE | ULT | ULE | UGT | UGE)
    }

    /// Infix spelling; signed and unsigned variants print alike
    pub fn print_op(&self) -> &'static str {
        use OffsetOperator::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            SDiv | UDiv => "/",
            SRem | URem => "%",
            And => "&&",
            Or => "||",
            Xor => "^",
            Eq => "==",
            Neq => "!=",
            SLT | ULT => "<",
            SLE | ULE => "<=",
            SGT | UGT => ">",
            SGE | UGE => ">=",
        }
    }
}

impl fmt::Display for OffsetOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.print_op())
    }
}

/// Shared handle to an immutable offset node
pub type OffsetPtr = Rc<OffsetVal>;

/// A node of the arithmetic context function
#[derive(Debug, Clone)]
pub enum OffsetVal {
    /// A known bounded-width integer
    Const(IntVal),
    /// Opaque reference to an instruction whose value is unknown here
    Inst(InstRef),
    /// Opaque reference to a function formal parameter
    Arg(ArgRef),
    /// A value the analysis explicitly gave up on, with its cause
    Unknown(Value),
    /// Internal operator node; children are never null by construction
    BinOp { lhs: OffsetPtr, op: OffsetOperator, rhs: OffsetPtr },
}

impl OffsetVal {
    pub fn constant(v: IntVal) -> OffsetPtr {
        Rc::new(OffsetVal::Const(v))
    }

    /// 32-bit signed constant, the default width for synthesized offsets
    pub fn cint(v: i64) -> OffsetPtr {
        Self::constant(IntVal::of_i32(v))
    }

    pub fn inst(r: InstRef) -> OffsetPtr {
        Rc::new(OffsetVal::Inst(r))
    }

    pub fn arg(r: ArgRef) -> OffsetPtr {
        Rc::new(OffsetVal::Arg(r))
    }

    pub fn unknown(cause: Value) -> OffsetPtr {
        Rc::new(OffsetVal::Unknown(cause))
    }

    pub fn binop(lhs: OffsetPtr, op: OffsetOperator, rhs: OffsetPtr) -> OffsetPtr {
        Rc::new(OffsetVal::BinOp { lhs, op, rhs })
    }

    /// True iff this node is a constant leaf
    pub fn is_const(&self) -> bool {
        matches!(self, OffsetVal::Const(_))
    }

    /// True iff this node is a comparison operator
    pub fn is_compare(&self) -> bool {
        matches!(self, OffsetVal::BinOp { op, .. } if op.is_compare())
    }

    /// The constant value of a `Const` node
    pub fn const_val(&self) -> Result<IntVal, OffsetError> {
        match self {
            OffsetVal::Const(v) => Ok(*v),
            _ => Err(OffsetError::NotConstant),
        }
    }

    /// Conservative signed interval `[lo, hi]`, both bounds at a common
    /// bit width. Non-constant leaves report the full signed range of
    /// their declared width (64 bits when the type is not an integer).
    pub fn const_range(&self, module: &Module) -> (IntVal, IntVal) {
        match self {
            OffsetVal::Const(v) => (*v, *v),
            OffsetVal::Inst(r) => {
                let width = module.inst(*r).ty.int_width().unwrap_or(64);
                (IntVal::min_signed(width), IntVal::max_signed(width))
            }
            OffsetVal::Arg(r) => {
                let ty = &module.func(r.func).params[r.index as usize].ty;
                let width = ty.int_width().unwrap_or(64);
                (IntVal::min_signed(width), IntVal::max_signed(width))
            }
            OffsetVal::Unknown(_) => (IntVal::min_signed(64), IntVal::max_signed(64)),
            OffsetVal::BinOp { lhs, op, rhs } => {
                Self::combine_ranges(lhs.const_range(module), *op, rhs.const_range(module))
            }
        }
    }

    fn combine_ranges(
        lhs: (IntVal, IntVal),
        op: OffsetOperator,
        rhs: (IntVal, IntVal),
    ) -> (IntVal, IntVal) {
        use OffsetOperator::*;

        // Work at the widest bit width observed in either interval.
        let width = lhs
            .0
            .width()
            .max(lhs.1.width())
            .max(rhs.0.width())
            .max(rhs.1.width());
        let (l_lo, l_hi) = (lhs.0.sext_or_self(width), lhs.1.sext_or_self(width));
        let (r_lo, r_hi) = (rhs.0.sext_or_self(width), rhs.1.sext_or_self(width));

        match op {
            Add => (l_lo.add(&r_lo), l_hi.add(&r_hi)),
            Sub => {
                // Subtracting a full range from a full range would widen to
                // nothing useful; keep the left-hand interval instead.
                if l_lo.is_min_signed()
                    && l_hi.is_max_signed()
                    && r_lo.is_min_signed()
                    && r_hi.is_max_signed()
                {
                    (l_lo, l_hi)
                } else {
                    (l_lo.sub(&r_hi), l_hi.sub(&r_lo))
                }
            }
            Mul => {
                let corners = [
                    l_lo.mul(&r_lo),
                    l_lo.mul(&r_hi),
                    l_hi.mul(&r_lo),
                    l_hi.mul(&r_hi),
                ];
                let mut lo = corners[0];
                let mut hi = corners[0];
                for c in &corners[1..] {
                    lo = IntVal::signed_min(lo, *c);
                    hi = IntVal::signed_max(hi, *c);
                }
                (lo, hi)
            }
            SDiv | UDiv => {
                if r_lo.is_non_negative() && l_lo.is_non_negative() {
                    (l_lo.sdiv(&r_hi), l_hi.sdiv(&r_lo))
                } else {
                    (IntVal::min_signed(width), IntVal::max_signed(width))
                }
            }
            SRem | URem => {
                if r_lo.is_non_negative() && l_lo.is_non_negative() {
                    (IntVal::new(width, 0), r_hi)
                } else {
                    (IntVal::min_signed(width), IntVal::max_signed(width))
                }
            }
            And => (
                IntVal::signed_min(IntVal::new(width, 0), l_lo),
                IntVal::signed_min(l_hi, r_hi),
            ),
            Or | Xor => (
                IntVal::signed_min(IntVal::new(width, 0), l_lo),
                IntVal::signed_max(l_hi, r_hi),
            ),
            // Comparisons produce a one-bit value: -1 (true) or 0 (false).
            Eq | Neq | SLT | SLE | SGT | SGE | ULT | ULE | UGT | UGE => {
                (IntVal::new(1, -1), IntVal::new(1, 0))
            }
        }
    }
}

impl fmt::Display for OffsetVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetVal::Const(v) => write!(f, "{}", v),
            OffsetVal::Inst(r) => write!(f, "%f{}:{}", r.func.0, r.inst.0),
            OffsetVal::Arg(r) => write!(f, "%f{}:arg{}", r.func.0, r.index),
            OffsetVal::Unknown(cause) => write!(f, "(unknown on {})", cause),
            OffsetVal::BinOp { lhs, op, rhs } => write!(f, "({} {} {})", lhs, op, rhs),
        }
    }
}
