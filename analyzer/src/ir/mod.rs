//! GPU Intermediate Representation
//!
//! A typed SSA IR for compiled GPU modules, covering the surface the
//! analyses consume:
//! - Functions, basic blocks, instructions, typed operands
//! - Memory spaces (global, shared, local, constant)
//! - GPU special-register intrinsics (thread/block ids and dimensions)
//! - Kernel annotations and calling conventions
//! - Per-instruction source locations and debug value names
//!
//! The model is deliberately framework-free; modules arrive through the
//! serde surface (or a [`builder`](crate::ir::builder)) and are treated as
//! read-only for the lifetime of an analysis run.

pub mod builder;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Function identifier within a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

/// Basic block identifier within a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Instruction identifier within a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BB{}", self.0)
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Module-wide reference to an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstRef {
    pub func: FuncId,
    pub inst: InstId,
}

/// Module-wide reference to a function formal parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArgRef {
    pub func: FuncId,
    pub index: u32,
}

/// An SSA operand
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Result of an instruction
    Inst(InstRef),
    /// Formal parameter
    Arg(ArgRef),
    /// Integer constant carrying its type (and thus bit width)
    ConstInt { value: i64, ty: Type },
    /// Null pointer constant
    ConstNull(Type),
}

impl Value {
    /// The static type of this operand, resolved against the module
    pub fn ty<'m>(&'m self, module: &'m Module) -> &'m Type {
        match self {
            Value::Inst(r) => &module.inst(*r).ty,
            Value::Arg(r) => &module.func(r.func).params[r.index as usize].ty,
            Value::ConstInt { ty, .. } => ty,
            Value::ConstNull(ty) => ty,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Value::ConstInt { .. } | Value::ConstNull(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Inst(r) => write!(f, "%{}", r.inst.0),
            Value::Arg(r) => write!(f, "%arg{}", r.index),
            Value::ConstInt { value, .. } => write!(f, "{}", value),
            Value::ConstNull(_) => write!(f, "null"),
        }
    }
}

/// Memory space of a pointer, following the NVPTX numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    /// Generic (resolved at runtime)
    Generic,
    /// Global device memory (DRAM)
    Global,
    /// Shared memory (on-chip, per block)
    Shared,
    /// Constant memory (cached, read-only)
    Constant,
    /// Local memory (per thread)
    Local,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Generic => write!(f, "generic"),
            MemorySpace::Global => write!(f, "global"),
            MemorySpace::Shared => write!(f, "shared"),
            MemorySpace::Constant => write!(f, "constant"),
            MemorySpace::Local => write!(f, "local"),
        }
    }
}

/// IR type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    F32,
    F64,
    Ptr(Box<Type>, MemorySpace),
    Array(Box<Type>, u64),
    Struct { name: String, fields: Vec<Type> },
}

impl Type {
    /// Allocation size in bytes, the `allocSize` query of the data layout
    pub fn alloc_size(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::Bool | Type::I8 | Type::U8 => 1,
            Type::I16 | Type::U16 | Type::F16 => 2,
            Type::I32 | Type::U32 | Type::F32 => 4,
            Type::I64 | Type::U64 | Type::F64 => 8,
            Type::Ptr(_, _) => 8,
            Type::Array(elem, n) => elem.alloc_size() * n,
            Type::Struct { fields, .. } => fields.iter().map(|t| t.alloc_size()).sum(),
        }
    }

    /// Bit width for integer types (bool counts as one bit)
    pub fn int_width(&self) -> Option<u32> {
        match self {
            Type::Bool => Some(1),
            Type::I8 | Type::U8 => Some(8),
            Type::I16 | Type::U16 => Some(16),
            Type::I32 | Type::U32 => Some(32),
            Type::I64 | Type::U64 => Some(64),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.int_width().is_some()
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_, _))
    }

    /// Element type behind a pointer
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(elem, _) => Some(elem),
            _ => None,
        }
    }

    /// Address space encoded on a pointer type
    pub fn address_space(&self) -> Option<MemorySpace> {
        match self {
            Type::Ptr(_, space) => Some(*space),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::U8 => write!(f, "u8"),
            Type::U16 => write!(f, "u16"),
            Type::U32 => write!(f, "u32"),
            Type::U64 => write!(f, "u64"),
            Type::F16 => write!(f, "f16"),
            Type::F32 => write!(f, "f32"),
            Type::F64 => write!(f, "f64"),
            Type::Ptr(elem, space) => write!(f, "{} addrspace({})*", elem, space),
            Type::Array(elem, n) => write!(f, "[{} x {}]", n, elem),
            Type::Struct { name, .. } => write!(f, "%{}", name),
        }
    }
}

/// Integer binary opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
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
    Shl,
    AShr,
    LShr,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::SDiv => "sdiv",
            BinaryOp::UDiv => "udiv",
            BinaryOp::SRem => "srem",
            BinaryOp::URem => "urem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::AShr => "ashr",
            BinaryOp::LShr => "lshr",
        };
        write!(f, "{}", s)
    }
}

/// Integer comparison predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Predicate::Eq => "eq",
            Predicate::Ne => "ne",
            Predicate::Slt => "slt",
            Predicate::Sle => "sle",
            Predicate::Sgt => "sgt",
            Predicate::Sge => "sge",
            Predicate::Ult => "ult",
            Predicate::Ule => "ule",
            Predicate::Ugt => "ugt",
            Predicate::Uge => "uge",
        };
        write!(f, "{}", s)
    }
}

/// Cast opcodes; the offset algebra treats all of these as transparent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastKind {
    Trunc,
    ZExt,
    SExt,
    Bitcast,
    PtrToInt,
    IntToPtr,
    AddrSpaceCast,
}

/// GPU special registers and memory intrinsics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intrinsic {
    TidX,
    TidY,
    TidZ,
    LaneId,
    CtaidX,
    CtaidY,
    CtaidZ,
    NtidX,
    NtidY,
    NtidZ,
    NctaidX,
    NctaidY,
    NctaidZ,
    MemCpy,
    MemMove,
    Barrier,
}

impl Intrinsic {
    /// True for the intrinsics whose value varies between threads of a warp
    pub fn reads_thread_id(&self) -> bool {
        matches!(
            self,
            Intrinsic::TidX | Intrinsic::TidY | Intrinsic::TidZ | Intrinsic::LaneId
        )
    }

    /// Source-level spelling, used in human-readable warnings
    pub fn pretty_name(&self) -> &'static str {
        match self {
            Intrinsic::TidX => "threadIdx.x",
            Intrinsic::TidY => "threadIdx.y",
            Intrinsic::TidZ => "threadIdx.z",
            Intrinsic::LaneId => "laneID",
            Intrinsic::CtaidX => "blockIdx.x",
            Intrinsic::CtaidY => "blockIdx.y",
            Intrinsic::CtaidZ => "blockIdx.z",
            Intrinsic::NtidX => "threadDim.x",
            Intrinsic::NtidY => "threadDim.y",
            Intrinsic::NtidZ => "threadDim.z",
            Intrinsic::NctaidX => "blockDim.x",
            Intrinsic::NctaidY => "blockDim.y",
            Intrinsic::NctaidZ => "blockDim.z",
            Intrinsic::MemCpy => "memcpy",
            Intrinsic::MemMove => "memmove",
            Intrinsic::Barrier => "__syncthreads",
        }
    }
}

/// Call target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Callee {
    /// Direct call to a function in this module
    Function(FuncId),
    /// GPU intrinsic
    Intrinsic(Intrinsic),
    /// Indirect call through a value
    Indirect(Value),
}

/// Instruction operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Binary { op: BinaryOp, lhs: Value, rhs: Value },
    Icmp { pred: Predicate, lhs: Value, rhs: Value },
    Cast { kind: CastKind, value: Value },
    Load { ptr: Value },
    Store { value: Value, ptr: Value },
    Gep { ptr: Value, indices: Vec<Value> },
    Phi { incoming: Vec<(Value, BlockId)> },
    Call { callee: Callee, args: Vec<Value> },
    Alloca { elem: Type },
    Br { target: BlockId },
    CondBr { cond: Value, then_dest: BlockId, else_dest: BlockId },
    Ret { value: Option<Value> },
    Unreachable,
}

impl Op {
    /// All value operands, in operand order
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Op::Binary { lhs, rhs, .. } | Op::Icmp { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Cast { value, .. } => vec![value],
            Op::Load { ptr } => vec![ptr],
            Op::Store { value, ptr } => vec![value, ptr],
            Op::Gep { ptr, indices } => {
                let mut ops = vec![ptr];
                ops.extend(indices.iter());
                ops
            }
            Op::Phi { incoming } => incoming.iter().map(|(v, _)| v).collect(),
            Op::Call { callee, args } => {
                let mut ops: Vec<&Value> = args.iter().collect();
                if let Callee::Indirect(v) = callee {
                    ops.push(v);
                }
                ops
            }
            Op::CondBr { cond, .. } => vec![cond],
            Op::Ret { value } => value.iter().collect(),
            Op::Alloca { .. } | Op::Br { .. } | Op::Unreachable => vec![],
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Br { .. } | Op::CondBr { .. } | Op::Ret { .. } | Op::Unreachable
        )
    }

    /// Successor blocks for terminators
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Op::Br { target } => vec![*target],
            Op::CondBr { then_dest, else_dest, .. } => vec![*then_dest, *else_dest],
            _ => vec![],
        }
    }

    /// Whether executing this operation may write memory
    pub fn may_write(&self) -> bool {
        match self {
            Op::Store { .. } => true,
            Op::Call { callee, .. } => match callee {
                Callee::Intrinsic(Intrinsic::MemCpy | Intrinsic::MemMove) => true,
                Callee::Intrinsic(_) => false,
                Callee::Function(_) | Callee::Indirect(_) => true,
            },
            _ => false,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Binary { op, lhs, rhs } => write!(f, "{} {}, {}", op, lhs, rhs),
            Op::Icmp { pred, lhs, rhs } => write!(f, "icmp {} {}, {}", pred, lhs, rhs),
            Op::Cast { kind, value } => write!(f, "{:?} {}", kind, value),
            Op::Load { ptr } => write!(f, "load {}", ptr),
            Op::Store { value, ptr } => write!(f, "store {}, {}", value, ptr),
            Op::Gep { ptr, indices } => {
                write!(f, "getelementptr {}", ptr)?;
                for idx in indices {
                    write!(f, ", {}", idx)?;
                }
                Ok(())
            }
            Op::Phi { incoming } => {
                write!(f, "phi")?;
                for (i, (v, b)) in incoming.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}[{}, {}]", sep, v, b)?;
                }
                Ok(())
            }
            Op::Call { callee, args } => {
                match callee {
                    Callee::Function(id) => write!(f, "call @f{}", id.0)?,
                    Callee::Intrinsic(i) => write!(f, "call {}", i.pretty_name())?,
                    Callee::Indirect(v) => write!(f, "call {}", v)?,
                }
                write!(f, "(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Op::Alloca { elem } => write!(f, "alloca {}", elem),
            Op::Br { target } => write!(f, "br {}", target),
            Op::CondBr { cond, then_dest, else_dest } => {
                write!(f, "br {}, {}, {}", cond, then_dest, else_dest)
            }
            Op::Ret { value: Some(v) } => write!(f, "ret {}", v),
            Op::Ret { value: None } => write!(f, "ret void"),
            Op::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Source location attached by debug info
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

/// An instruction: operation, result type, optional debug info
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    pub op: Op,
    /// Result type; `Void` for stores and terminators
    pub ty: Type,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<SourceLoc>,
    /// Debug variable name, when the front end recorded one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Basic block: ordered instruction ids, terminator last
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub label: String,
    pub insts: Vec<InstId>,
}

/// Formal parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// Function calling convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CallingConv {
    #[default]
    Device,
    PtxKernel,
}

/// A function definition (or declaration, when `blocks` is empty)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    /// All instructions, indexed by [`InstId`]
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    #[serde(default)]
    pub calling_conv: CallingConv,
}

impl Function {
    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Terminator instruction of a block, if the block is non-empty
    pub fn terminator_of(&self, id: BlockId) -> Option<InstId> {
        self.block(id).insts.last().copied()
    }

    /// The block containing an instruction
    pub fn block_of(&self, inst: InstId) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.insts.contains(&inst))
            .map(|i| BlockId(i as u32))
    }

    /// All instruction ids in block order
    pub fn inst_ids(&self) -> impl Iterator<Item = InstId> + '_ {
        self.blocks.iter().flat_map(|b| b.insts.iter().copied())
    }
}

/// Module-level kernel annotation, mirroring `nvvm.annotations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub func: FuncId,
    pub kind: String,
}

/// A compiled GPU module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Module {
    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn inst(&self, r: InstRef) -> &Inst {
        self.func(r.func).inst(r.inst)
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    /// A function is a kernel iff an annotation tags it `"kernel"` or its
    /// calling convention is the PTX kernel convention.
    pub fn is_kernel(&self, id: FuncId) -> bool {
        if self
            .annotations
            .iter()
            .any(|a| a.func == id && a.kind == "kernel")
        {
            return true;
        }
        self.func(id).calling_conv == CallingConv::PtxKernel
    }

    /// Resolve the intrinsic read by a value, if it is a special-register call
    pub fn as_intrinsic_read(&self, v: &Value) -> Option<Intrinsic> {
        if let Value::Inst(r) = v
            && let Op::Call { callee: Callee::Intrinsic(i), .. } = &self.inst(*r).op
        {
            return Some(*i);
        }
        None
    }
}
