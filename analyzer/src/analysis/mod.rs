//! Control-flow and use-def infrastructure
//!
//! Per-function CFG, dominator and post-dominator sets, loop back edges,
//! reachability, a module-wide user index, and the local memory-dependence
//! oracle used for load/store pairing. All of it is computed once per
//! module and treated as read-only by the analyses.
//!
//! Dominators are solved with the classic iterative set-intersection
//! fixpoint; the lattice is finite and the solution is reached in a few
//! passes for the shallow CFGs of GPU kernels.

use crate::ir::{BlockId, FuncId, Function, InstId, InstRef, Module, Op, Value};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Control-flow facts for one function
pub struct ControlFlow {
    pub succs: Vec<Vec<BlockId>>,
    pub preds: Vec<Vec<BlockId>>,
    /// dominators[b] = set of blocks dominating b (including b)
    dominators: Vec<FxHashSet<BlockId>>,
    /// post_dominators[b] = set of blocks post-dominating b (including b)
    post_dominators: Vec<FxHashSet<BlockId>>,
    /// Edges (tail, header) where the header dominates the tail
    back_edges: Vec<(BlockId, BlockId)>,
    loop_headers: FxHashSet<BlockId>,
    inst_block: FxHashMap<InstId, BlockId>,
}

impl ControlFlow {
    pub fn new(func: &Function) -> Self {
        let n = func.blocks.len();
        let mut succs = vec![Vec::new(); n];
        let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); n];
        let mut inst_block = FxHashMap::default();

        for (i, block) in func.blocks.iter().enumerate() {
            let id = BlockId(i as u32);
            for inst in &block.insts {
                inst_block.insert(*inst, id);
            }
            if let Some(term) = block.insts.last() {
                succs[i] = func.inst(*term).op.successors();
            }
            for succ in &succs[i] {
                preds[succ.0 as usize].push(id);
            }
        }

        let dominators = Self::solve_dominators(func.entry, n, &preds);

        // Post-dominance is dominance on the reversed CFG, rooted at the
        // exit blocks (terminators without successors).
        let exits: Vec<BlockId> = (0..n)
            .map(|i| BlockId(i as u32))
            .filter(|b| succs[b.0 as usize].is_empty())
            .collect();
        let post_dominators = Self::solve_post_dominators(&exits, n, &succs);

        let mut back_edges = Vec::new();
        let mut loop_headers = FxHashSet::default();
        for (i, ss) in succs.iter().enumerate() {
            let tail = BlockId(i as u32);
            for &head in ss {
                if dominators[i].contains(&head) {
                    back_edges.push((tail, head));
                    loop_headers.insert(head);
                }
            }
        }

        Self {
            succs,
            preds,
            dominators,
            post_dominators,
            back_edges,
            loop_headers,
            inst_block,
        }
    }

    fn solve_dominators(
        entry: BlockId,
        n: usize,
        preds: &[Vec<BlockId>],
    ) -> Vec<FxHashSet<BlockId>> {
        let all: FxHashSet<BlockId> = (0..n).map(|i| BlockId(i as u32)).collect();
        let mut dom: Vec<FxHashSet<BlockId>> = (0..n)
            .map(|i| {
                if BlockId(i as u32) == entry {
                    std::iter::once(entry).collect()
                } else {
                    all.clone()
                }
            })
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..n {
                let block = BlockId(i as u32);
                if block == entry {
                    continue;
                }
                let ps = &preds[i];
                if ps.is_empty() {
                    continue;
                }
                let mut new_dom = dom[ps[0].0 as usize].clone();
                for p in &ps[1..] {
                    new_dom = new_dom
                        .intersection(&dom[p.0 as usize])
                        .copied()
                        .collect();
                }
                new_dom.insert(block);
                if new_dom != dom[i] {
                    dom[i] = new_dom;
                    changed = true;
                }
            }
        }
        dom
    }

    fn solve_post_dominators(
        exits: &[BlockId],
        n: usize,
        succs: &[Vec<BlockId>],
    ) -> Vec<FxHashSet<BlockId>> {
        let all: FxHashSet<BlockId> = (0..n).map(|i| BlockId(i as u32)).collect();
        let mut pdom: Vec<FxHashSet<BlockId>> = (0..n)
            .map(|i| {
                let block = BlockId(i as u32);
                if exits.contains(&block) {
                    std::iter::once(block).collect()
                } else {
                    all.clone()
                }
            })
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..n {
                let block = BlockId(i as u32);
                let ss = &succs[i];
                if ss.is_empty() {
                    continue;
                }
                let mut new_pdom = pdom[ss[0].0 as usize].clone();
                for s in &ss[1..] {
                    new_pdom = new_pdom
                        .intersection(&pdom[s.0 as usize])
                        .copied()
                        .collect();
                }
                new_pdom.insert(block);
                if new_pdom != pdom[i] {
                    pdom[i] = new_pdom;
                    changed = true;
                }
            }
        }
        pdom
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.dominators[b.0 as usize].contains(&a)
    }

    pub fn post_dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.post_dominators[b.0 as usize].contains(&a)
    }

    /// Nearest common dominator: the deepest block dominating both inputs
    pub fn nearest_common_dominator(&self, a: BlockId, b: BlockId) -> BlockId {
        let common: Vec<BlockId> = self.dominators[a.0 as usize]
            .intersection(&self.dominators[b.0 as usize])
            .copied()
            .collect();
        // The deepest common dominator is the one dominated by every other
        // common dominator, i.e. the one with the largest dominator set.
        common
            .iter()
            .copied()
            .max_by_key(|c| self.dominators[c.0 as usize].len())
            .expect("entry dominates every reachable block")
    }

    /// Whether execution starting at `from` may reach `to`
    pub fn potentially_reachable(&self, from: BlockId, to: BlockId) -> bool {
        if from == to {
            return true;
        }
        // Fast path: inside a loop body, the header's back edges make any
        // dominated block reachable again.
        if self.loop_headers.contains(&to) && self.dominates(to, from) {
            return true;
        }
        let mut seen = FxHashSet::default();
        let mut queue = VecDeque::new();
        queue.push_back(from);
        seen.insert(from);
        while let Some(b) = queue.pop_front() {
            for &s in &self.succs[b.0 as usize] {
                if s == to {
                    return true;
                }
                if seen.insert(s) {
                    queue.push_back(s);
                }
            }
        }
        false
    }

    pub fn back_edges(&self) -> &[(BlockId, BlockId)] {
        &self.back_edges
    }

    pub fn is_loop_header(&self, b: BlockId) -> bool {
        self.loop_headers.contains(&b)
    }

    pub fn block_of(&self, inst: InstId) -> Option<BlockId> {
        self.inst_block.get(&inst).copied()
    }
}

/// Module-wide analysis index: per-function control flow plus use lists
pub struct ModuleInfo {
    cfg: FxHashMap<FuncId, ControlFlow>,
    users: FxHashMap<Value, Vec<InstRef>>,
}

impl ModuleInfo {
    pub fn new(module: &Module) -> Self {
        let mut cfg = FxHashMap::default();
        let mut users: FxHashMap<Value, Vec<InstRef>> = FxHashMap::default();

        for fid in module.func_ids() {
            let func = module.func(fid);
            if func.is_declaration() {
                continue;
            }
            cfg.insert(fid, ControlFlow::new(func));
            for inst_id in func.inst_ids() {
                let user = InstRef { func: fid, inst: inst_id };
                for operand in func.inst(inst_id).op.operands() {
                    if !operand.is_const() {
                        users.entry(operand.clone()).or_default().push(user);
                    }
                }
            }
        }

        Self { cfg, users }
    }

    pub fn cfg(&self, func: FuncId) -> &ControlFlow {
        &self.cfg[&func]
    }

    /// Instructions using `value` as an operand, module-wide
    pub fn users(&self, value: &Value) -> &[InstRef] {
        self.users.get(value).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The condition of the conditional branch terminating the nearest
    /// common dominator of two blocks, if there is one.
    pub fn dominating_condition(
        &self,
        module: &Module,
        func: FuncId,
        left: BlockId,
        right: BlockId,
    ) -> Option<Value> {
        let cfg = self.cfg(func);
        let dom = cfg.nearest_common_dominator(left, right);
        let term = module.func(func).terminator_of(dom)?;
        match &module.func(func).inst(term).op {
            Op::CondBr { cond, .. } => Some(cond.clone()),
            _ => None,
        }
    }

    /// Definite defining store for a load: a store to the identical pointer
    /// earlier in the same block with no intervening may-write. Purely
    /// local; anything interprocedural or cross-block is left to the
    /// structural fallback in the offset engine.
    pub fn definite_def(&self, module: &Module, load: InstRef) -> Option<InstId> {
        let func = module.func(load.func);
        let Op::Load { ptr } = &func.inst(load.inst).op else {
            return None;
        };
        let cfg = self.cfg(load.func);
        let block = cfg.block_of(load.inst)?;
        let insts = &func.block(block).insts;
        let pos = insts.iter().position(|i| *i == load.inst)?;
        for &prev in insts[..pos].iter().rev() {
            match &func.inst(prev).op {
                Op::Store { ptr: store_ptr, .. } if store_ptr == ptr => return Some(prev),
                op if op.may_write() => return None,
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::*;

    /// Diamond: entry -> (then | else) -> merge
    fn diamond() -> (Module, FuncId, [BlockId; 4]) {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "f").kernel();
        let entry = fb.block("entry");
        let then_bb = fb.block("then");
        let else_bb = fb.block("else");
        let merge = fb.block("merge");
        fb.set_block(entry);
        let tid = fb.sreg(Intrinsic::TidX);
        let cond = fb.icmp(Predicate::Slt, tid, const_i32(16));
        fb.cond_br(cond, then_bb, else_bb);
        fb.set_block(then_bb);
        fb.br(merge);
        fb.set_block(else_bb);
        fb.br(merge);
        fb.set_block(merge);
        fb.ret(None);
        mb.add_function(fb.finish());
        (mb.build(), fid, [entry, then_bb, else_bb, merge])
    }

    #[test]
    fn test_diamond_dominators() {
        let (module, fid, [entry, then_bb, else_bb, merge]) = diamond();
        let info = ModuleInfo::new(&module);
        let cfg = info.cfg(fid);

        assert!(cfg.dominates(entry, merge));
        assert!(!cfg.dominates(then_bb, merge));
        assert_eq!(cfg.nearest_common_dominator(then_bb, else_bb), entry);
        assert_eq!(cfg.nearest_common_dominator(merge, merge), merge);
    }

    #[test]
    fn test_diamond_post_dominators() {
        let (module, fid, [entry, then_bb, _, merge]) = diamond();
        let info = ModuleInfo::new(&module);
        let cfg = info.cfg(fid);

        assert!(cfg.post_dominates(merge, entry));
        assert!(cfg.post_dominates(merge, then_bb));
        assert!(!cfg.post_dominates(then_bb, entry));
    }

    #[test]
    fn test_diamond_reachability_and_condition() {
        let (module, fid, [entry, then_bb, else_bb, merge]) = diamond();
        let info = ModuleInfo::new(&module);
        let cfg = info.cfg(fid);

        assert!(cfg.potentially_reachable(entry, merge));
        assert!(!cfg.potentially_reachable(then_bb, else_bb));
        assert!(!cfg.potentially_reachable(merge, entry));

        let cond = info.dominating_condition(&module, fid, then_bb, else_bb);
        assert!(matches!(cond, Some(Value::Inst(_))));
        assert!(info.dominating_condition(&module, fid, merge, merge).is_none());
    }

    #[test]
    fn test_loop_back_edge() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "f");
        let entry = fb.block("entry");
        let header = fb.block("header");
        let body = fb.block("body");
        let exit = fb.block("exit");
        fb.set_block(entry);
        fb.br(header);
        fb.set_block(header);
        let tid = fb.sreg(Intrinsic::TidX);
        let cond = fb.icmp(Predicate::Slt, tid, const_i32(10));
        fb.cond_br(cond, body, exit);
        fb.set_block(body);
        fb.br(header);
        fb.set_block(exit);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();

        let info = ModuleInfo::new(&module);
        let cfg = info.cfg(fid);
        assert_eq!(cfg.back_edges(), &[(body, header)]);
        assert!(cfg.is_loop_header(header));
        // The loop body can get back to the header, but not to the entry.
        assert!(cfg.potentially_reachable(header, body));
        assert!(cfg.potentially_reachable(body, header));
        assert!(!cfg.potentially_reachable(header, entry));
    }

    #[test]
    fn test_users_index() {
        let (module, fid, _) = diamond();
        let info = ModuleInfo::new(&module);
        // The tid read (%0) is used only by the compare (%1).
        let tid = Value::Inst(InstRef { func: fid, inst: InstId(0) });
        let users = info.users(&tid);
        assert_eq!(users, &[InstRef { func: fid, inst: InstId(1) }]);
    }

    #[test]
    fn test_definite_def_same_block() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "f");
        let ptr_ty = Type::Ptr(Box::new(Type::I32), MemorySpace::Global);
        let p = fb.param("p", ptr_ty);
        fb.block("entry");
        fb.store(const_i32(7), p.clone());
        let loaded = fb.load(p.clone(), Type::I32);
        fb.ret(Some(loaded.clone()));
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);

        let Value::Inst(load_ref) = loaded else { unreachable!() };
        assert_eq!(info.definite_def(&module, load_ref), Some(InstId(0)));

        // An intervening store to another pointer kills the pairing.
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "f");
        let ptr_ty = Type::Ptr(Box::new(Type::I32), MemorySpace::Global);
        let p = fb.param("p", ptr_ty.clone());
        let r = fb.param("r", ptr_ty);
        fb.block("entry");
        fb.store(const_i32(7), p.clone());
        fb.store(const_i32(8), r);
        let loaded = fb.load(p, Type::I32);
        fb.ret(Some(loaded.clone()));
        mb.add_function(fb.finish());
        let module = mb.build();
        let info = ModuleInfo::new(&module);
        let Value::Inst(load_ref) = loaded else { unreachable!() };
        assert_eq!(info.definite_def(&module, load_ref), None);
    }
}
