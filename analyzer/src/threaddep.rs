//! Thread-dependence analysis
//!
//! A taint-style fixed point over a two-level boolean lattice: a value is
//! *thread-dependent* when its runtime integer can differ between threads
//! of a warp. Thread-id and lane-id reads seed the taint; it propagates
//! through operands, through stored-to addresses, through phi nodes whose
//! incoming paths were chosen by a tainted branch, and interprocedurally
//! through calls via per-call-site taint overlays.
//!
//! Taint is only ever set, never cleared, so every value flips at most
//! once and the worklist terminates.

use crate::analysis::ModuleInfo;
use crate::ir::{Callee, FuncId, InstRef, Module, Op, Value};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Query interface for thread dependence, the shape the offset algebra's
/// semantic-equality checks consume.
pub trait TaintQuery {
    fn is_dependent(&self, v: &Value) -> bool;
}

/// Module-wide thread-dependence facts
pub struct ThreadDependence {
    taint: FxHashMap<Value, bool>,
}

impl ThreadDependence {
    /// Solve taint for every kernel in the module, then merge the
    /// per-call-site overlays into the module-wide map.
    pub fn run(module: &Module, info: &ModuleInfo) -> Self {
        let mut taint: FxHashMap<Value, bool> = FxHashMap::default();
        let mut solver = Solver {
            module,
            info,
            call_taint: FxHashMap::default(),
            active: FxHashSet::default(),
        };

        for fid in module.func_ids() {
            if !module.is_kernel(fid) || module.func(fid).is_declaration() {
                continue;
            }
            // Kernel parameters are warp-uniform at launch.
            for index in 0..module.func(fid).params.len() as u32 {
                taint.insert(Value::Arg(crate::ir::ArgRef { func: fid, index }), false);
            }
            solver.function_tainted(fid, &mut taint);
        }

        // Union the call-site overlays: a value is dependent if any
        // calling context made it so.
        for overlay in solver.call_taint.values() {
            for (value, dependent) in overlay {
                *taint.entry(value.clone()).or_insert(false) |= dependent;
            }
        }

        Self { taint }
    }
}

impl TaintQuery for ThreadDependence {
    fn is_dependent(&self, v: &Value) -> bool {
        self.taint.get(v).copied().unwrap_or(false)
    }
}

struct Solver<'m> {
    module: &'m Module,
    info: &'m ModuleInfo,
    /// Per-call-site taint overlays for interprocedural propagation
    call_taint: FxHashMap<InstRef, FxHashMap<Value, bool>>,
    /// Functions currently being solved, guarding recursion
    active: FxHashSet<FuncId>,
}

impl<'m> Solver<'m> {
    /// Fixed point over one function under the given taint map. Returns
    /// whether the function's return path is tainted: either a tainted
    /// return value, or two return sites joined at a tainted condition.
    fn function_tainted(&mut self, fid: FuncId, taint: &mut FxHashMap<Value, bool>) -> bool {
        if !self.active.insert(fid) {
            // Already on the solving stack; resolve optimistically, the
            // outer fixpoint will revisit if anything flips.
            return false;
        }

        let func = self.module.func(fid);
        let mut worklist: VecDeque<Value> = func
            .inst_ids()
            .map(|inst| Value::Inst(InstRef { func: fid, inst }))
            .collect();

        while let Some(v) = worklist.pop_front() {
            let new_taint = self.value_dependent(&v, taint);
            self.update(&v, new_taint, taint, &mut worklist);
        }

        self.active.remove(&fid);

        // Collect the return sites
        let rets: Vec<InstRef> = func
            .inst_ids()
            .filter(|i| matches!(func.inst(*i).op, Op::Ret { .. }))
            .map(|inst| InstRef { func: fid, inst })
            .collect();

        if rets
            .iter()
            .any(|r| taint.get(&Value::Inst(*r)).copied().unwrap_or(false))
        {
            return true;
        }

        let cfg = self.info.cfg(fid);
        for l in &rets {
            for r in &rets {
                let (Some(lb), Some(rb)) = (cfg.block_of(l.inst), cfg.block_of(r.inst)) else {
                    continue;
                };
                if let Some(cond) = self.info.dominating_condition(self.module, fid, lb, rb)
                    && taint.get(&cond).copied().unwrap_or(false)
                {
                    return true;
                }
            }
        }
        false
    }

    fn update(
        &mut self,
        v: &Value,
        new_taint: bool,
        taint: &mut FxHashMap<Value, bool>,
        worklist: &mut VecDeque<Value>,
    ) {
        let old_taint = taint.get(v).copied().unwrap_or(false);
        taint.insert(v.clone(), new_taint);

        if new_taint != old_taint {
            tracing::trace!(target: "threaddep", value = %v, "taint {} => {}", old_taint, new_taint);
            for user in self.info.users(v) {
                worklist.push_back(Value::Inst(*user));
            }
            // The address of a tainted store becomes tainted in turn: a
            // cheap, alias-free store-to-load handshake.
            if let Value::Inst(r) = v
                && let Op::Store { ptr, .. } = &self.module.inst(*r).op
                && !ptr.is_const()
            {
                worklist.push_back(ptr.clone());
            }
        }
    }

    fn value_dependent(&mut self, v: &Value, taint: &mut FxHashMap<Value, bool>) -> bool {
        let tainted = |taint: &FxHashMap<Value, bool>, v: &Value| {
            taint.get(v).copied().unwrap_or(false)
        };

        // Using any tainted operand taints the value
        if let Value::Inst(r) = v {
            let inst = self.module.inst(*r);
            if inst.op.operands().into_iter().any(|op| tainted(taint, op)) {
                return true;
            }
        }

        // Being the destination of a tainted store taints the address
        for user in self.info.users(v) {
            if let Op::Store { ptr, .. } = &self.module.inst(*user).op
                && ptr == v
                && tainted(taint, &Value::Inst(*user))
            {
                return true;
            }
        }

        let Value::Inst(r) = v else {
            return false;
        };
        let inst = self.module.inst(*r);

        // A phi is tainted when some pair of its incoming paths was
        // selected by a tainted condition (control-flow taint).
        if let Op::Phi { incoming } = &inst.op {
            for (_, l) in incoming {
                for (_, rblk) in incoming {
                    if let Some(cond) =
                        self.info.dominating_condition(self.module, r.func, *l, *rblk)
                        && tainted(taint, &cond)
                    {
                        return true;
                    }
                }
            }
        }

        // Calls: thread-id reads are the taint sources; defined callees
        // are solved under a call-specific overlay of their formals.
        if let Op::Call { callee, args } = &inst.op {
            match callee {
                Callee::Intrinsic(i) if i.reads_thread_id() => return true,
                Callee::Intrinsic(_) => {}
                Callee::Function(callee_id) => {
                    let callee_func = self.module.func(*callee_id);
                    if !callee_func.is_declaration() {
                        let mut overlay = self.call_taint.get(r).cloned().unwrap_or_default();
                        for (index, actual) in args.iter().enumerate() {
                            overlay.insert(
                                Value::Arg(crate::ir::ArgRef {
                                    func: *callee_id,
                                    index: index as u32,
                                }),
                                tainted(taint, actual),
                            );
                        }
                        let ret_tainted = self.function_tainted(*callee_id, &mut overlay);
                        self.call_taint.insert(*r, overlay);
                        return ret_tainted;
                    }
                }
                // Indirect call: nothing to follow.
                Callee::Indirect(_) => {}
            }
        }

        false
    }
}
