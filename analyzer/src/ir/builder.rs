//! IR builder - convenient API for constructing modules
//!
//! Manages instruction and block numbering so tests and front ends can
//! assemble functions without tracking ids by hand. The first block
//! created becomes the function entry.

use super::*;

/// Builder for constructing modules
pub struct ModuleBuilder {
    module: Module,
    next_func_id: u32,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module {
                name: name.into(),
                functions: Vec::new(),
                annotations: Vec::new(),
            },
            next_func_id: 0,
        }
    }

    /// Reserve the id the next added function will receive
    pub fn fresh_func_id(&mut self) -> FuncId {
        let id = FuncId(self.next_func_id);
        self.next_func_id += 1;
        id
    }

    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = FuncId(self.module.functions.len() as u32);
        assert!(id.0 < self.next_func_id, "reserve ids with fresh_func_id first");
        self.module.functions.push(func);
        id
    }

    /// Tag a function with an `nvvm.annotations`-style entry
    pub fn annotate(&mut self, func: FuncId, kind: impl Into<String>) {
        self.module.annotations.push(Annotation { func, kind: kind.into() });
    }

    pub fn build(self) -> Module {
        self.module
    }
}

/// Builder for constructing one function
pub struct FunctionBuilder {
    func_id: FuncId,
    func: Function,
    current_block: Option<BlockId>,
    current_loc: Option<SourceLoc>,
}

impl FunctionBuilder {
    pub fn new(id: FuncId, name: impl Into<String>) -> Self {
        Self {
            func_id: id,
            func: Function {
                name: name.into(),
                params: Vec::new(),
                insts: Vec::new(),
                blocks: Vec::new(),
                entry: BlockId(0),
                calling_conv: CallingConv::Device,
            },
            current_block: None,
            current_loc: None,
        }
    }

    pub fn kernel(mut self) -> Self {
        self.func.calling_conv = CallingConv::PtxKernel;
        self
    }

    pub fn func_id(&self) -> FuncId {
        self.func_id
    }

    /// Add a formal parameter and return its SSA value
    pub fn param(&mut self, name: impl Into<String>, ty: Type) -> Value {
        let index = self.func.params.len() as u32;
        self.func.params.push(Param { name: name.into(), ty });
        Value::Arg(ArgRef { func: self.func_id, index })
    }

    /// Create a new block; the first becomes the entry and current block
    pub fn block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block { label: label.into(), insts: Vec::new() });
        if self.current_block.is_none() {
            self.func.entry = id;
            self.current_block = Some(id);
        }
        id
    }

    /// Point subsequent pushes at `block`
    pub fn set_block(&mut self, block: BlockId) {
        self.current_block = Some(block);
    }

    /// Attach a source location to subsequently pushed instructions
    pub fn set_loc(&mut self, file: impl Into<String>, line: u32) {
        self.current_loc = Some(SourceLoc { file: file.into(), line });
    }

    pub fn clear_loc(&mut self) {
        self.current_loc = None;
    }

    /// Append an instruction to the current block
    pub fn push(&mut self, op: Op, ty: Type) -> Value {
        self.push_named_opt(op, ty, None)
    }

    /// Append an instruction carrying a debug variable name
    pub fn push_named(&mut self, op: Op, ty: Type, name: impl Into<String>) -> Value {
        self.push_named_opt(op, ty, Some(name.into()))
    }

    fn push_named_opt(&mut self, op: Op, ty: Type, name: Option<String>) -> Value {
        let block = self.current_block.expect("no current block");
        let id = InstId(self.func.insts.len() as u32);
        self.func.insts.push(Inst { op, ty, loc: self.current_loc.clone(), name });
        self.func.blocks[block.0 as usize].insts.push(id);
        Value::Inst(InstRef { func: self.func_id, inst: id })
    }

    // Convenience wrappers for the common operations

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value, ty: Type) -> Value {
        self.push(Op::Binary { op, lhs, rhs }, ty)
    }

    pub fn icmp(&mut self, pred: Predicate, lhs: Value, rhs: Value) -> Value {
        self.push(Op::Icmp { pred, lhs, rhs }, Type::Bool)
    }

    pub fn load(&mut self, ptr: Value, ty: Type) -> Value {
        self.push(Op::Load { ptr }, ty)
    }

    pub fn store(&mut self, value: Value, ptr: Value) -> Value {
        self.push(Op::Store { value, ptr }, Type::Void)
    }

    pub fn gep(&mut self, ptr: Value, indices: Vec<Value>, ty: Type) -> Value {
        self.push(Op::Gep { ptr, indices }, ty)
    }

    pub fn phi(&mut self, incoming: Vec<(Value, BlockId)>, ty: Type) -> Value {
        self.push(Op::Phi { incoming }, ty)
    }

    /// Read a GPU special register
    pub fn sreg(&mut self, intrinsic: Intrinsic) -> Value {
        self.push(Op::Call { callee: Callee::Intrinsic(intrinsic), args: vec![] }, Type::I32)
    }

    pub fn call(&mut self, func: FuncId, args: Vec<Value>, ty: Type) -> Value {
        self.push(Op::Call { callee: Callee::Function(func), args }, ty)
    }

    pub fn alloca(&mut self, elem: Type) -> Value {
        let ptr_ty = Type::Ptr(Box::new(elem.clone()), MemorySpace::Local);
        self.push(Op::Alloca { elem }, ptr_ty)
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Op::Br { target }, Type::Void);
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: BlockId, else_dest: BlockId) {
        self.push(Op::CondBr { cond, then_dest, else_dest }, Type::Void);
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.push(Op::Ret { value }, Type::Void);
    }

    pub fn finish(self) -> Function {
        self.func
    }
}

/// Shorthand for a typed integer constant operand
pub fn const_int(value: i64, ty: Type) -> Value {
    Value::ConstInt { value, ty }
}

/// Shorthand for an `i32` constant operand
pub fn const_i32(value: i64) -> Value {
    const_int(value, Type::I32)
}
