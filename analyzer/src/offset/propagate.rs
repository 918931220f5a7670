//! Offset propagation: building the arithmetic context function
//!
//! Constructs an ACF for any IR value on demand and memoizes it per
//! module. Unhandled constructs degrade to opaque `Inst`/`Unknown`
//! leaves, the dominant, deliberate recovery mode of the engine.
//!
//! Also home to context substitution: specializing an ACF at a call
//! site (formals to actuals), under a synthetic thread assignment, or
//! under a synthetic grid shape, and the interprocedural context
//! expansion feeding the divergence and coalescing analyzers.

use crate::analysis::ModuleInfo;
use crate::ir::{
    ArgRef, BinaryOp, Callee, FuncId, InstRef, Intrinsic, Module, Op, Predicate, Type, Value,
};
use crate::offset::simplify::{negate_condition, replace_components};
use crate::offset::value::{IntVal, OffsetOperator, OffsetPtr, OffsetVal};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Counters over the translations performed, logged at the end of a run
/// under the `acf` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcfStats {
    pub translations: u64,
    pub binop: u64,
    pub call: u64,
    pub cast: u64,
    pub cmp: u64,
    pub load: u64,
    pub phi: u64,
    pub gep: u64,
    pub arg: u64,
    pub unknown_inst: u64,
    /// Load-store pairings made structurally, without the oracle
    pub structural_pairings: u64,
    /// Largest interprocedural context set generated
    pub max_contexts: usize,
}

/// Lazy, memoized ACF construction over one module
pub struct OffsetPropagation<'m> {
    module: &'m Module,
    info: &'m ModuleInfo,
    offsets: FxHashMap<Value, OffsetPtr>,
    update_probe_depth: u32,
    stats: AcfStats,
}

impl<'m> OffsetPropagation<'m> {
    pub fn new(module: &'m Module, info: &'m ModuleInfo, update_probe_depth: u32) -> Self {
        Self {
            module,
            info,
            offsets: FxHashMap::default(),
            update_probe_depth,
            stats: AcfStats::default(),
        }
    }

    pub fn stats(&self) -> &AcfStats {
        &self.stats
    }

    /// Get or build the ACF of any IR value
    pub fn get_or_create(&mut self, v: &Value) -> OffsetPtr {
        if let Some(cached) = self.offsets.get(v) {
            return cached.clone();
        }
        self.stats.translations += 1;

        let result = match v {
            Value::ConstInt { value, ty } => {
                if ty.is_integer() {
                    OffsetVal::constant(IntVal::new(ty.int_width().unwrap_or(64), *value as i128))
                } else if ty.is_pointer() {
                    OffsetVal::constant(IntVal::new(64, *value as i128))
                } else {
                    OffsetVal::unknown(v.clone())
                }
            }
            Value::ConstNull(_) => OffsetVal::constant(IntVal::new(64, 0)),
            Value::Arg(a) => {
                self.stats.arg += 1;
                OffsetVal::arg(*a)
            }
            Value::Inst(r) => self.create_inst_val(*r),
        };

        self.offsets.insert(v.clone(), result.clone());
        result
    }

    fn create_inst_val(&mut self, r: InstRef) -> OffsetPtr {
        let inst = self.module.inst(r);
        match &inst.op {
            Op::Binary { op, lhs, rhs } => {
                self.stats.binop += 1;
                match from_binary_opcode(*op) {
                    Some(offset_op) => {
                        let (lhs, rhs) = (lhs.clone(), rhs.clone());
                        let lhs = self.get_or_create(&lhs);
                        let rhs = self.get_or_create(&rhs);
                        OffsetVal::binop(lhs, offset_op, rhs)
                    }
                    // Opcode the algebra does not model
                    None => OffsetVal::inst(r),
                }
            }
            Op::Icmp { pred, lhs, rhs } => {
                self.stats.cmp += 1;
                let op = from_predicate(*pred);
                let (lhs, rhs) = (lhs.clone(), rhs.clone());
                let lhs = self.get_or_create(&lhs);
                let rhs = self.get_or_create(&rhs);
                OffsetVal::binop(lhs, op, rhs)
            }
            // Casts are transparent; extension behavior is unmodeled.
            Op::Cast { value, .. } => {
                self.stats.cast += 1;
                let value = value.clone();
                self.get_or_create(&value)
            }
            Op::Gep { ptr, indices } => {
                self.stats.gep += 1;
                let (ptr, indices) = (ptr.clone(), indices.clone());
                self.gep_expr(&ptr, &indices)
            }
            Op::Load { ptr } => {
                self.stats.load += 1;
                let ptr = ptr.clone();
                self.load_val(r, &ptr)
            }
            Op::Phi { incoming } => {
                self.stats.phi += 1;
                let incoming = incoming.clone();
                self.phi_val(r, &incoming)
            }
            Op::Call { .. } => {
                self.stats.call += 1;
                OffsetVal::inst(r)
            }
            _ => {
                self.stats.unknown_inst += 1;
                OffsetVal::inst(r)
            }
        }
    }

    /// Lower a GEP to base-plus-scaled-index arithmetic, one type layer
    /// per index. Struct layers demand constant field indices; a dynamic
    /// one abandons the whole address.
    fn gep_expr(&mut self, ptr: &Value, indices: &[Value]) -> OffsetPtr {
        let mut offset = self.get_or_create(ptr);
        let mut layer = ptr.ty(self.module).clone();

        for idx in indices {
            let (idx_off, next_layer) = match layer {
                Type::Struct { fields, .. } => {
                    let idx_acf = self.get_or_create(idx);
                    let Ok(field) = idx_acf.const_val() else {
                        // DynamicStructIndex: give up on the address
                        return OffsetVal::unknown(ptr.clone());
                    };
                    let field = field.as_unsigned() as usize;
                    if field >= fields.len() {
                        return OffsetVal::unknown(ptr.clone());
                    }
                    // The field starts where the preceding ones end
                    let elem_off: u64 = fields[..field].iter().map(|t| t.alloc_size()).sum();
                    (OffsetVal::cint(elem_off as i64), fields[field].clone())
                }
                Type::Ptr(elem, _) | Type::Array(elem, _) => {
                    let stride = elem.alloc_size();
                    let idx_acf = self.get_or_create(idx);
                    let scaled = OffsetVal::binop(
                        idx_acf,
                        OffsetOperator::Mul,
                        OffsetVal::cint(stride as i64),
                    );
                    (scaled, *elem)
                }
                // GEP through a non-aggregate: nothing sensible to add
                _ => return OffsetVal::unknown(ptr.clone()),
            };
            layer = next_layer;
            offset = OffsetVal::binop(offset, OffsetOperator::Add, idx_off);
        }
        offset
    }

    /// A load takes the ACF of its defining store's value when one can be
    /// found: first through the memory-dependence oracle, then through a
    /// structural scan of the pointer's users (a store not post-dominated
    /// by the load may still be the value the load observes). Update
    /// stores are skipped; a read-modify-write's store is not a source.
    fn load_val(&mut self, load: InstRef, ptr: &Value) -> OffsetPtr {
        if let Some(store_id) = self.info.definite_def(self.module, load) {
            let Op::Store { value, .. } = &self.module.func(load.func).inst(store_id).op else {
                unreachable!("definite_def returns stores");
            };
            let value = value.clone();
            return self.get_or_create(&value);
        }

        let cfg = self.info.cfg(load.func);
        let Some(load_block) = cfg.block_of(load.inst) else {
            return OffsetVal::inst(load);
        };
        for user in self.info.users(ptr) {
            if user.func != load.func {
                continue;
            }
            let Op::Store { value, ptr: store_ptr } = &self.module.inst(*user).op else {
                continue;
            };
            if store_ptr != ptr {
                continue;
            }
            let Some(store_block) = cfg.block_of(user.inst) else {
                continue;
            };
            if !cfg.post_dominates(store_block, load_block) && !self.is_update_store(*user) {
                tracing::debug!(target: "acf", load = ?load, store = ?user, "structural load-store pair");
                self.stats.structural_pairings += 1;
                let value = value.clone();
                return self.get_or_create(&value);
            }
        }

        OffsetVal::inst(load)
    }

    /// Bounded walk of a store's value DAG looking for a load from the
    /// same pointer: the signature of a read-modify-write.
    fn is_update_store(&self, store: InstRef) -> bool {
        let Op::Store { ptr: store_ptr, .. } = &self.module.inst(store).op else {
            return false;
        };
        let mut stack: Vec<(u32, Value)> = vec![(0, Value::Inst(store))];
        while let Some((depth, v)) = stack.pop() {
            let depth = depth + 1;
            let Value::Inst(r) = &v else { continue };
            let op = &self.module.inst(*r).op;
            if let Op::Load { ptr } = op
                && ptr == store_ptr
            {
                return true;
            }
            if depth < self.update_probe_depth {
                for operand in op.operands() {
                    stack.push((depth, operand.clone()));
                }
            }
        }
        false
    }

    /// Merge a phi's forward-edge inputs under the conditions that select
    /// them. Back edges (inputs reachable from the phi's own block) are
    /// conservatively dropped; a phi with only back edges stays opaque.
    fn phi_val(&mut self, phi: InstRef, incoming: &[(Value, crate::ir::BlockId)]) -> OffsetPtr {
        let cfg = self.info.cfg(phi.func);
        let Some(phi_block) = cfg.block_of(phi.inst) else {
            return OffsetVal::inst(phi);
        };

        let mut fwd_values = Vec::new();
        let mut fwd_blocks = Vec::new();
        for (value, pred) in incoming {
            if cfg.potentially_reachable(phi_block, *pred) {
                tracing::trace!(target: "acf", phi = ?phi, pred = %pred, "dropping loop edge");
            } else {
                fwd_values.push(value.clone());
                fwd_blocks.push(*pred);
            }
        }

        if fwd_values.is_empty() {
            return OffsetVal::inst(phi);
        }

        self.apply_dominating_condition(&fwd_values, &fwd_blocks, phi.func)
            .unwrap_or_else(|| OffsetVal::inst(phi))
    }

    /// Combine block-tagged values into `c * taken + !c * untaken`, where
    /// `c` is the condition of the branch leaving the nearest common
    /// dominator of all defining blocks. Returns `None` when the join
    /// point does not end in a usable conditional branch.
    fn apply_dominating_condition(
        &mut self,
        values: &[Value],
        blocks: &[crate::ir::BlockId],
        func: FuncId,
    ) -> Option<OffsetPtr> {
        debug_assert_eq!(values.len(), blocks.len());
        if values.len() == 1 {
            return Some(self.get_or_create(&values[0]));
        }

        let cfg = self.info.cfg(func);
        let dom = blocks[1..]
            .iter()
            .fold(blocks[0], |acc, b| cfg.nearest_common_dominator(acc, *b));

        let term = self.module.func(func).terminator_of(dom)?;
        let Op::CondBr { cond, then_dest, else_dest } = &self.module.func(func).inst(term).op
        else {
            return None;
        };
        let (cond, taken, untaken) = (cond.clone(), *then_dest, *else_dest);

        let cond_acf = self.get_or_create(&cond);
        let ncond_acf = negate_condition(&cond_acf).ok()?;

        let mut v_taken = Vec::new();
        let mut b_taken = Vec::new();
        let mut v_untaken = Vec::new();
        let mut b_untaken = Vec::new();

        let cfg = self.info.cfg(func);
        for (value, block) in values.iter().zip(blocks) {
            if *block == dom {
                continue;
            }
            if cfg.potentially_reachable(taken, *block) {
                v_taken.push(value.clone());
                b_taken.push(*block);
            } else {
                v_untaken.push(value.clone());
                b_untaken.push(*block);
            }
        }

        // Inputs defined in the join block itself go to whichever side is
        // still empty, taken first.
        for (value, block) in values.iter().zip(blocks) {
            if *block == dom {
                if v_taken.is_empty() {
                    v_taken.push(value.clone());
                    b_taken.push(*block);
                } else {
                    v_untaken.push(value.clone());
                    b_untaken.push(*block);
                }
            }
        }

        // Both sides must be populated to attribute the condition; move
        // one entry across when the partition came out one-sided. This is
        // an approximation: several inputs from one block lose precision.
        if v_untaken.is_empty() && v_taken.len() > 1 {
            v_untaken.push(v_taken.pop().expect("nonempty"));
            b_untaken.push(b_taken.pop().expect("nonempty"));
        }
        if v_taken.is_empty() || v_untaken.is_empty() {
            return None;
        }

        let off_taken = self.apply_dominating_condition(&v_taken, &b_taken, func)?;
        let off_untaken = self.apply_dominating_condition(&v_untaken, &b_untaken, func)?;

        let mult_taken = OffsetVal::binop(cond_acf, OffsetOperator::Mul, off_taken);
        let mult_untaken = OffsetVal::binop(ncond_acf, OffsetOperator::Mul, off_untaken);
        Some(OffsetVal::binop(mult_taken, OffsetOperator::Add, mult_untaken))
    }

    /// Specialize an ACF at a call site: every formal of the callee is
    /// replaced by the ACF of the matching actual. Indirect calls cannot
    /// be specialized and return the input unchanged.
    pub fn in_call_context(&mut self, orig: &OffsetPtr, callsite: InstRef) -> OffsetPtr {
        let Op::Call { callee: Callee::Function(callee_id), args } =
            &self.module.inst(callsite).op
        else {
            return orig.clone();
        };
        let (callee_id, args) = (*callee_id, args.clone());

        let mut rep: Vec<(OffsetPtr, OffsetPtr)> = Vec::new();
        for (index, actual) in args.iter().enumerate() {
            let formal = OffsetVal::arg(ArgRef { func: callee_id, index: index as u32 });
            let actual_acf = self.get_or_create(actual);
            rep.push((formal, actual_acf));
        }
        replace_components(orig, &rep)
    }

    /// Substitute concrete thread and block ids for the corresponding
    /// special-register reads. The lane id is `tidx % 32`.
    pub fn in_thread_context(
        &self,
        orig: &OffsetPtr,
        tidx: i64,
        tidy: i64,
        tidz: i64,
        bidx: i64,
        bidy: i64,
        bidz: i64,
    ) -> OffsetPtr {
        self.substitute_sregs(orig, &|intrinsic| match intrinsic {
            Intrinsic::TidX => Some(tidx),
            Intrinsic::TidY => Some(tidy),
            Intrinsic::TidZ => Some(tidz),
            Intrinsic::LaneId => Some(tidx % 32),
            Intrinsic::CtaidX => Some(bidx),
            Intrinsic::CtaidY => Some(bidy),
            Intrinsic::CtaidZ => Some(bidz),
            _ => None,
        })
    }

    /// Substitute concrete block and grid dimensions for the
    /// corresponding special-register reads.
    pub fn in_grid_context(
        &self,
        orig: &OffsetPtr,
        ntidx: i64,
        ntidy: i64,
        ntidz: i64,
        nctax: i64,
        nctay: i64,
        nctaz: i64,
    ) -> OffsetPtr {
        self.substitute_sregs(orig, &|intrinsic| match intrinsic {
            Intrinsic::NtidX => Some(ntidx),
            Intrinsic::NtidY => Some(ntidy),
            Intrinsic::NtidZ => Some(ntidz),
            Intrinsic::NctaidX => Some(nctax),
            Intrinsic::NctaidY => Some(nctay),
            Intrinsic::NctaidZ => Some(nctaz),
            _ => None,
        })
    }

    fn substitute_sregs(
        &self,
        orig: &OffsetPtr,
        lookup: &dyn Fn(Intrinsic) -> Option<i64>,
    ) -> OffsetPtr {
        if let OffsetVal::Inst(r) = &**orig
            && let Some(intrinsic) = self.module.as_intrinsic_read(&Value::Inst(*r))
            && let Some(value) = lookup(intrinsic)
        {
            return OffsetVal::cint(value);
        }

        let OffsetVal::BinOp { lhs, op, rhs } = &**orig else {
            return orig.clone();
        };
        let new_lhs = self.substitute_sregs(lhs, lookup);
        let new_rhs = self.substitute_sregs(rhs, lookup);
        if Rc::ptr_eq(&new_lhs, lhs) && Rc::ptr_eq(&new_rhs, rhs) {
            orig.clone()
        } else {
            OffsetVal::binop(new_lhs, *op, new_rhs)
        }
    }

    /// Functions whose formals appear as `Arg` leaves in the expression,
    /// in first-appearance order.
    fn find_required_contexts(&self, ov: &OffsetPtr, found: &mut Vec<FuncId>) {
        match &**ov {
            OffsetVal::BinOp { lhs, rhs, .. } => {
                self.find_required_contexts(lhs, found);
                self.find_required_contexts(rhs, found);
            }
            OffsetVal::Arg(a) => {
                if !found.contains(&a.func) {
                    found.push(a.func);
                }
            }
            _ => {}
        }
    }

    /// Direct call sites of `callee` anywhere in the module
    fn same_module_callers(&self, callee: FuncId) -> Vec<InstRef> {
        let mut callers = Vec::new();
        for fid in self.module.func_ids() {
            let func = self.module.func(fid);
            for inst_id in func.inst_ids() {
                if let Op::Call { callee: Callee::Function(target), .. } = &func.inst(inst_id).op
                    && *target == callee
                {
                    callers.push(InstRef { func: fid, inst: inst_id });
                }
            }
        }
        callers
    }

    /// Expand an ACF into its interprocedurally specialized variants: for
    /// the first referenced function with same-module callers, substitute
    /// the expression at every call site and recurse, with that function
    /// excluded from further descent. The leaves of this recursion tree
    /// are the context set handed to the analyzers.
    pub fn in_contexts(&mut self, orig: &OffsetPtr) -> Vec<OffsetPtr> {
        let mut ignore = Vec::new();
        let contexts = self.in_contexts_ignoring(orig, &mut ignore);
        if contexts.len() > self.stats.max_contexts {
            self.stats.max_contexts = contexts.len();
        }
        tracing::debug!(target: "acf", contexts = contexts.len(), "context-sensitive expansion");
        contexts
    }

    fn in_contexts_ignoring(
        &mut self,
        orig: &OffsetPtr,
        ignore: &mut Vec<FuncId>,
    ) -> Vec<OffsetPtr> {
        let mut required = Vec::new();
        self.find_required_contexts(orig, &mut required);

        for func in required {
            if ignore.contains(&func) {
                continue;
            }
            let callers = self.same_module_callers(func);
            if callers.is_empty() {
                continue;
            }

            let mut specialized = Vec::new();
            for callsite in callers {
                let in_context = self.in_call_context(orig, callsite);
                ignore.push(func);
                specialized.extend(self.in_contexts_ignoring(&in_context, ignore));
                ignore.pop();
            }
            return specialized;
        }

        // No further specialization applies
        vec![orig.clone()]
    }
}

fn from_binary_opcode(op: BinaryOp) -> Option<OffsetOperator> {
    match op {
        BinaryOp::Add => Some(OffsetOperator::Add),
        BinaryOp::Sub => Some(OffsetOperator::Sub),
        BinaryOp::Mul => Some(OffsetOperator::Mul),
        BinaryOp::SDiv => Some(OffsetOperator::SDiv),
        BinaryOp::UDiv => Some(OffsetOperator::UDiv),
        BinaryOp::SRem => Some(OffsetOperator::SRem),
        BinaryOp::URem => Some(OffsetOperator::URem),
        BinaryOp::And => Some(OffsetOperator::And),
        BinaryOp::Or => Some(OffsetOperator::Or),
        BinaryOp::Xor => Some(OffsetOperator::Xor),
        BinaryOp::Shl | BinaryOp::AShr | BinaryOp::LShr => None,
    }
}

fn from_predicate(pred: Predicate) -> OffsetOperator {
    match pred {
        Predicate::Eq => OffsetOperator::Eq,
        Predicate::Ne => OffsetOperator::Neq,
        Predicate::Slt => OffsetOperator::SLT,
        Predicate::Sle => OffsetOperator::SLE,
        Predicate::Sgt => OffsetOperator::SGT,
        Predicate::Sge => OffsetOperator::SGE,
        Predicate::Ult => OffsetOperator::ULT,
        Predicate::Ule => OffsetOperator::ULE,
        Predicate::Ugt => OffsetOperator::UGT,
        Predicate::Uge => OffsetOperator::UGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{BlockId, MemorySpace};
    use crate::offset::simplify::matching_offsets;

    const PROBE_DEPTH: u32 = 4;

    fn i32_ptr() -> Type {
        Type::Ptr(Box::new(Type::I32), MemorySpace::Global)
    }

    #[test]
    fn test_gep_lowers_to_scaled_index() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let a = fb.param("a", i32_ptr());
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        let gep = fb.gep(a.clone(), vec![tid.clone()], i32_ptr());
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let acf = op.get_or_create(&gep);
        // a + tid * 4
        let Value::Arg(a_ref) = a else { unreachable!() };
        let Value::Inst(tid_ref) = tid else { unreachable!() };
        let expect = OffsetVal::binop(
            OffsetVal::arg(a_ref),
            OffsetOperator::Add,
            OffsetVal::binop(OffsetVal::inst(tid_ref), OffsetOperator::Mul, OffsetVal::cint(4)),
        );
        assert!(matching_offsets(&acf, &expect), "got {}", acf);
    }

    #[test]
    fn test_struct_gep_constant_field_offset() {
        let pair = Type::Struct { name: "pair".to_string(), fields: vec![Type::I32, Type::I64] };
        let pair_ptr = Type::Ptr(Box::new(pair), MemorySpace::Global);
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let p = fb.param("p", pair_ptr);
        fb.block("entry");
        // &p[2].1
        let gep = fb.gep(
            p.clone(),
            vec![const_i32(2), const_i32(1)],
            Type::Ptr(Box::new(Type::I64), MemorySpace::Global),
        );
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        // (p + 2*12) + 4
        let acf = op.get_or_create(&gep);
        let Value::Arg(p_ref) = p else { unreachable!() };
        let expect = OffsetVal::binop(
            OffsetVal::binop(
                OffsetVal::arg(p_ref),
                OffsetOperator::Add,
                OffsetVal::binop(OffsetVal::cint(2), OffsetOperator::Mul, OffsetVal::cint(12)),
            ),
            OffsetOperator::Add,
            OffsetVal::cint(4),
        );
        assert!(matching_offsets(&acf, &expect), "got {}", acf);
    }

    #[test]
    fn test_dynamic_struct_index_is_unknown() {
        let pair = Type::Struct { name: "pair".to_string(), fields: vec![Type::I32, Type::I64] };
        let pair_ptr = Type::Ptr(Box::new(pair), MemorySpace::Global);
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let p = fb.param("p", pair_ptr);
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        let gep = fb.gep(p, vec![const_i32(0), tid], i32_ptr());
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        assert!(matches!(&*op.get_or_create(&gep), OffsetVal::Unknown(_)));
    }

    #[test]
    fn test_cast_is_transparent() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        let wide = fb.push(
            Op::Cast { kind: crate::ir::CastKind::SExt, value: tid.clone() },
            Type::I64,
        );
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let tid_acf = op.get_or_create(&tid);
        let wide_acf = op.get_or_create(&wide);
        assert!(matching_offsets(&tid_acf, &wide_acf));
    }

    #[test]
    fn test_load_pairs_with_oracle_store() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        fb.block("entry");
        let slot = fb.alloca(Type::I32);
        fb.store(const_i32(7), slot.clone());
        let loaded = fb.load(slot, Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let acf = op.get_or_create(&loaded);
        assert_eq!(acf.const_val().unwrap().as_signed(), 7);
    }

    #[test]
    fn test_update_store_is_not_a_source() {
        // x = load p; store (x + 1), p ; the store must not feed the load
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let p = fb.param("p", i32_ptr());
        fb.block("entry");
        let x = fb.load(p.clone(), Type::I32);
        let bumped = fb.binary(BinaryOp::Add, x.clone(), const_i32(1), Type::I32);
        fb.store(bumped, p);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let Value::Inst(load_ref) = x.clone() else { unreachable!() };
        let acf = op.get_or_create(&x);
        assert!(matching_offsets(&acf, &OffsetVal::inst(load_ref)));
    }

    #[test]
    fn test_structural_pairing_across_blocks() {
        // store tid, p in the entry; load p in the next block. The oracle
        // sees nothing local, but the structural scan pairs them.
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let p = fb.param("p", i32_ptr());
        let entry = fb.block("entry");
        let next = fb.block("next");
        fb.set_block(entry);
        let tid = fb.sreg(Intrinsic::TidX);
        fb.store(tid.clone(), p.clone());
        fb.br(next);
        fb.set_block(next);
        let z = fb.load(p, Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let acf = op.get_or_create(&z);
        let Value::Inst(tid_ref) = tid else { unreachable!() };
        assert!(matching_offsets(&acf, &OffsetVal::inst(tid_ref)));
        assert_eq!(op.stats().structural_pairings, 1);
    }

    #[test]
    fn test_update_store_probe_skips_rmw() {
        // entry: x = load p; store x+1, p; br next; a read-modify-write.
        // next: z = load p must not take the updated value as its source.
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let p = fb.param("p", i32_ptr());
        let entry = fb.block("entry");
        let next = fb.block("next");
        fb.set_block(entry);
        let x = fb.load(p.clone(), Type::I32);
        let bumped = fb.binary(BinaryOp::Add, x, const_i32(1), Type::I32);
        fb.store(bumped, p.clone());
        fb.br(next);
        fb.set_block(next);
        let z = fb.load(p, Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let Value::Inst(z_ref) = z.clone() else { unreachable!() };
        assert!(matching_offsets(&op.get_or_create(&z), &OffsetVal::inst(z_ref)));
    }

    #[test]
    fn test_phi_merges_under_condition() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let entry = fb.block("entry");
        let then_bb = fb.block("then");
        let else_bb = fb.block("else");
        let merge = fb.block("merge");
        fb.set_block(entry);
        let tid = fb.sreg(Intrinsic::TidX);
        let cond = fb.icmp(Predicate::Slt, tid.clone(), const_i32(16));
        fb.cond_br(cond.clone(), then_bb, else_bb);
        fb.set_block(then_bb);
        fb.br(merge);
        fb.set_block(else_bb);
        fb.br(merge);
        fb.set_block(merge);
        let phi = fb.phi(vec![(const_i32(10), then_bb), (const_i32(20), else_bb)], Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let acf = op.get_or_create(&phi);
        let Value::Inst(tid_ref) = tid else { unreachable!() };
        let c = OffsetVal::binop(OffsetVal::inst(tid_ref), OffsetOperator::SLT, OffsetVal::cint(16));
        let nc = OffsetVal::binop(
            OffsetVal::inst(tid_ref),
            OffsetOperator::SGE,
            OffsetVal::cint(16),
        );
        // cond * 10 + !cond * 20
        let expect = OffsetVal::binop(
            OffsetVal::binop(c, OffsetOperator::Mul, OffsetVal::cint(10)),
            OffsetOperator::Add,
            OffsetVal::binop(nc, OffsetOperator::Mul, OffsetVal::cint(20)),
        );
        assert!(matching_offsets(&acf, &expect), "got {}", acf);
    }

    #[test]
    fn test_loop_phi_stays_opaque() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let entry = fb.block("entry");
        let header = fb.block("header");
        let body = fb.block("body");
        let exit = fb.block("exit");
        fb.set_block(entry);
        fb.br(header);
        fb.set_block(header);
        // i = phi [0, entry], [i+1, body]
        let phi = fb.phi(vec![(const_i32(0), entry)], Type::I32);
        let cond = fb.icmp(Predicate::Slt, phi.clone(), const_i32(10));
        fb.cond_br(cond, body, exit);
        fb.set_block(body);
        let next = fb.binary(BinaryOp::Add, phi.clone(), const_i32(1), Type::I32);
        fb.br(header);
        fb.set_block(exit);
        fb.ret(None);
        mb.add_function(fb.finish());
        let mut module = mb.build();
        // Patch the back edge in after building, as a front end would.
        let Value::Inst(phi_ref) = phi.clone() else { unreachable!() };
        if let Op::Phi { incoming } =
            &mut module.functions[fid.0 as usize].insts[phi_ref.inst.0 as usize].op
        {
            incoming.push((next, BlockId(2)));
        }

        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);
        // The forward edge carries 0; the loop edge is dropped.
        let acf = op.get_or_create(&phi);
        assert!(acf.const_val().unwrap().is_zero());
    }

    #[test]
    fn test_thread_and_grid_context_substitution() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        let ntid = fb.sreg(Intrinsic::NtidX);
        let bid = fb.sreg(Intrinsic::CtaidX);
        let scaled = fb.binary(BinaryOp::Mul, bid, ntid, Type::I32);
        let global = fb.binary(BinaryOp::Add, scaled, tid, Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let acf = op.get_or_create(&global);
        let grid = op.in_grid_context(&acf, 256, 32, 32, 1, 1, 1);
        let thread = op.in_thread_context(&grid, 5, 0, 0, 3, 0, 0);
        // (3 * 256) + 5
        let expect = OffsetVal::binop(
            OffsetVal::binop(OffsetVal::cint(3), OffsetOperator::Mul, OffsetVal::cint(256)),
            OffsetOperator::Add,
            OffsetVal::cint(5),
        );
        assert!(matching_offsets(&thread, &expect), "got {}", thread);
    }

    #[test]
    fn test_in_contexts_substitutes_caller_actuals() {
        let mut mb = ModuleBuilder::new("m");
        let helper_id = mb.fresh_func_id();
        let kernel_id = mb.fresh_func_id();

        // helper(x): uses x as an index
        let mut fb = FunctionBuilder::new(helper_id, "helper");
        let x = fb.param("x", Type::I32);
        fb.block("entry");
        let scaled = fb.binary(BinaryOp::Mul, x, const_i32(4), Type::I32);
        fb.ret(Some(scaled.clone()));
        mb.add_function(fb.finish());

        // kernel: helper(tid)
        let mut fb = FunctionBuilder::new(kernel_id, "k").kernel();
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        fb.call(helper_id, vec![tid.clone()], Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());

        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let acf = op.get_or_create(&scaled);
        let contexts = op.in_contexts(&acf);
        assert_eq!(contexts.len(), 1);
        let Value::Inst(tid_ref) = tid else { unreachable!() };
        let expect = OffsetVal::binop(
            OffsetVal::inst(tid_ref),
            OffsetOperator::Mul,
            OffsetVal::cint(4),
        );
        assert!(matching_offsets(&contexts[0], &expect), "got {}", contexts[0]);
    }

    #[test]
    fn test_in_contexts_without_callers_returns_input() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let n = fb.param("n", Type::I32);
        fb.block("entry");
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let acf = op.get_or_create(&n);
        let contexts = op.in_contexts(&acf);
        assert_eq!(contexts.len(), 1);
        assert!(matching_offsets(&contexts[0], &acf));
    }

    #[test]
    fn test_unmapped_opcode_stays_opaque() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        let shifted = fb.binary(BinaryOp::Shl, tid, const_i32(2), Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let mut op = OffsetPropagation::new(&module, &info, PROBE_DEPTH);

        let Value::Inst(r) = shifted.clone() else { unreachable!() };
        assert!(matching_offsets(&op.get_or_create(&shifted), &OffsetVal::inst(r)));
    }
}
