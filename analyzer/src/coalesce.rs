//! Memory coalescing analysis
//!
//! For every thread-dependent access to global or constant memory,
//! counts the distinct memory transactions the 32 lanes of a warp would
//! issue under a synthetic grid. Per-lane offsets relative to lane 0 are
//! merged into `[lo, hi)` transaction intervals bounded by the access
//! size; lanes whose offset stays symbolic are assumed to miss.
//!
//! Scores are *transactions per warp* on both return paths.

use crate::analysis::ModuleInfo;
use crate::config::{AnalyzerConfig, WARP_SIZE};
use crate::ir::{Callee, InstRef, Intrinsic, Module, Op, Value};
use crate::offset::simplify::{cancel_diffs, simplify_offset_val, sum_of_products};
use crate::offset::value::{OffsetOperator, OffsetPtr, OffsetVal};
use crate::offset::OffsetPropagation;
use crate::report::{value_name, Finding, FindingKind, Severity};
use crate::threaddep::{TaintQuery, ThreadDependence};

/// How the inspected pointer is used within its block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    Read,
    Write,
    Update,
    Copy,
    Unknown,
}

impl MemAccess {
    fn finding_kind(self) -> FindingKind {
        match self {
            MemAccess::Read => FindingKind::UncoalescedRead,
            MemAccess::Write => FindingKind::UncoalescedWrite,
            MemAccess::Update => FindingKind::UncoalescedUpdate,
            MemAccess::Copy => FindingKind::UncoalescedCopy,
            MemAccess::Unknown => FindingKind::Uncoalesced,
        }
    }

    fn prefix(self, name: &str) -> String {
        match self {
            MemAccess::Write => format!("In write to {}, ", name),
            MemAccess::Read => format!("In read from {}, ", name),
            MemAccess::Update => format!("In update to {}, ", name),
            MemAccess::Copy => format!("In copy to {}, ", name),
            MemAccess::Unknown => String::new(),
        }
    }
}

/// Locates uncoalesced memory accesses in GPU code
pub struct MemCoalesceAnalysis<'a, 'm> {
    module: &'m Module,
    info: &'a ModuleInfo,
    td: &'a ThreadDependence,
    op: &'a mut OffsetPropagation<'m>,
    config: &'a AnalyzerConfig,
}

impl<'a, 'm> MemCoalesceAnalysis<'a, 'm> {
    pub fn new(
        module: &'m Module,
        info: &'a ModuleInfo,
        td: &'a ThreadDependence,
        op: &'a mut OffsetPropagation<'m>,
        config: &'a AnalyzerConfig,
    ) -> Self {
        Self { module, info, td, op, config }
    }

    /// Inspect every load, store, and memory intrinsic in the module
    pub fn run(&mut self) -> Vec<Finding> {
        let mut findings = Vec::new();
        for fid in self.module.func_ids() {
            let func = self.module.func(fid);
            if func.is_declaration() {
                continue;
            }
            for inst_id in func.inst_ids() {
                let iref = InstRef { func: fid, inst: inst_id };
                match &func.inst(inst_id).op {
                    Op::Load { ptr } => {
                        let ptr = ptr.clone();
                        self.test_access(iref, &ptr, &mut findings);
                    }
                    Op::Store { ptr, .. } => {
                        let ptr = ptr.clone();
                        self.test_access(iref, &ptr, &mut findings);
                    }
                    Op::Call {
                        callee: Callee::Intrinsic(Intrinsic::MemCpy | Intrinsic::MemMove),
                        args,
                    } => {
                        // Destination first; the source only when the
                        // destination produced nothing.
                        let args = args.clone();
                        if let Some(dest) = args.first()
                            && !self.test_access(iref, dest, &mut findings)
                            && let Some(src) = args.get(1)
                        {
                            self.test_access(iref, src, &mut findings);
                        }
                    }
                    _ => {}
                }
            }
        }
        findings
    }

    /// Score one access; push and report true when it crosses the
    /// threshold.
    fn test_access(&mut self, inst: InstRef, ptr: &Value, findings: &mut Vec<Finding>) -> bool {
        if !self.td.is_dependent(ptr) {
            return false;
        }
        // Ignore stack allocations
        if let Value::Inst(r) = ptr
            && matches!(self.module.inst(*r).op, Op::Alloca { .. })
        {
            return false;
        }
        // Ignore shared and constant-local accesses
        if !crate::addrspace::may_be_global(self.module, &Value::Inst(inst)) {
            return false;
        }

        let access = self.access_type(inst, ptr);
        if access == MemAccess::Update
            && matches!(self.module.inst(inst).op, Op::Store { .. })
        {
            // The load half already reports read-modify-writes
            return false;
        }

        let (requests, stride) = self.requests_per_warp(ptr);
        tracing::debug!(target: "coalesce", requests, inst = ?inst, "memory requests required per warp");
        if requests > self.config.coalesce_threshold {
            let name = value_name(self.module, ptr);
            let (message, severity) = self.classify(access, &name, requests, stride);
            findings.push(Finding {
                kind: access.finding_kind(),
                severity,
                inst,
                value_name: name,
                measure: requests,
                message,
            });
            return true;
        }
        false
    }

    /// Classify by scanning the pointer's users in the same block: any
    /// call makes it a copy; both a load and a store make it an update.
    fn access_type(&self, inst: InstRef, ptr: &Value) -> MemAccess {
        let cfg = self.info.cfg(inst.func);
        let home = cfg.block_of(inst.inst);

        let mut read = false;
        let mut written = false;
        let mut copied = false;
        for user in self.info.users(ptr) {
            if user.func != inst.func || cfg.block_of(user.inst) != home {
                continue;
            }
            match &self.module.inst(*user).op {
                Op::Load { .. } => read = true,
                Op::Store { .. } => written = true,
                Op::Call { .. } => copied = true,
                _ => {}
            }
        }
        if copied {
            MemAccess::Copy
        } else if read && written {
            MemAccess::Update
        } else if read {
            MemAccess::Read
        } else if written {
            MemAccess::Write
        } else {
            MemAccess::Unknown
        }
    }

    /// Transactions per warp, maximized over calling contexts, plus the
    /// lane-1 stride of the scoring context when it was predictable.
    /// Short-circuits as soon as a context crosses the threshold; an
    /// unpredictable context is worth a full 32 transactions outright.
    fn requests_per_warp(&mut self, ptr: &Value) -> (f64, Option<i64>) {
        let ptr_acf = self.op.get_or_create(ptr);
        let contexts = self.op.in_contexts(&ptr_acf);

        let mut max_requests: f64 = 0.0;
        let mut best_stride = None;
        for path in &contexts {
            let grid = &self.config.grid;
            let in_grid = self.op.in_grid_context(
                path,
                grid.ntid.0,
                grid.ntid.1,
                grid.ntid.2,
                grid.nctaid.0,
                grid.nctaid.1,
                grid.nctaid.2,
            );
            let simp = simplify_offset_val(&sum_of_products(&in_grid));

            let probe = self.lane_diff(&simp, 1, 0);
            let Ok(stride) = probe.const_val() else {
                tracing::debug!(target: "coalesce", "context is unpredictable, scoring 32");
                return (32.0, None);
            };
            let stride = stride.as_signed() as i64;

            let mut request_count = 0i64;
            for warp in 0..self.config.warps_sampled {
                let base = warp * WARP_SIZE;
                let mut transactions: Vec<(i64, i64)> = Vec::new();
                for lane in 0..WARP_SIZE {
                    let diff = self.lane_diff(&simp, base, base + lane);
                    let Ok(offset) = diff.const_val() else {
                        // Symbolic lane: assume its own transaction
                        request_count += 1;
                        continue;
                    };
                    let offset = offset.as_signed() as i64;

                    let mut fits = false;
                    for t in transactions.iter_mut() {
                        if offset >= t.0 && offset <= t.1 {
                            fits = true;
                            break;
                        } else if offset < t.0 && offset >= t.1 - self.config.access_size {
                            t.0 = offset;
                            fits = true;
                            break;
                        } else if offset + 4 > t.1 && offset + 4 <= t.0 + self.config.access_size
                        {
                            t.1 = offset + 4;
                            fits = true;
                            break;
                        }
                    }
                    if !fits {
                        transactions.push((offset, offset + 4));
                    }
                }
                request_count += transactions.len() as i64;
            }

            let score = request_count as f64 / self.config.warps_sampled as f64;
            if score > max_requests {
                max_requests = score;
                best_stride = Some(stride);
                if max_requests > self.config.coalesce_threshold {
                    return (max_requests, best_stride);
                }
            }
        }
        (max_requests, best_stride)
    }

    /// `value(thread a) - value(thread b)` in block 0, fully cancelled
    fn lane_diff(&mut self, simp: &OffsetPtr, a: i64, b: i64) -> OffsetPtr {
        let at_a = self.op.in_thread_context(simp, a, 0, 0, 0, 0, 0);
        let at_b = self.op.in_thread_context(simp, b, 0, 0, 0, 0, 0);
        cancel_diffs(&OffsetVal::binop(at_a, OffsetOperator::Sub, at_b), self.td)
    }

    fn classify(
        &self,
        access: MemAccess,
        name: &str,
        requests: f64,
        stride: Option<i64>,
    ) -> (String, Severity) {
        let prefix = access.prefix(name);
        let reqs = requests as i64;

        if !self.config.classify_stride {
            return (
                format!("{}Possible Uncoalesced Access Detected, requires {} requests/warp", prefix, reqs),
                Severity::Unknown,
            );
        }

        // Stride classifier: a uniform stride beyond four words can never
        // coalesce, no matter the pattern.
        if let Some(s) = stride
            && s.abs() > 16
        {
            return (
                format!(
                    "{}Memory access stride {} exceeds max stride 4, requires {} requests/warp",
                    prefix, s.abs(), reqs
                ),
                Severity::Max,
            );
        }
        let severity = if reqs > 16 {
            Severity::Max
        } else if reqs > 8 {
            Severity::Med
        } else {
            Severity::Min
        };
        (
            format!("{}Uncoalesced Memory Access requires {} requests/warp", prefix, reqs),
            severity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{BinaryOp, MemorySpace, Type};

    fn i32_ptr() -> Type {
        Type::Ptr(Box::new(Type::I32), MemorySpace::Global)
    }

    /// Kernel loading a[tid * scale]
    fn strided_load_kernel(scale: i64) -> crate::ir::Module {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let a = fb.param("a", i32_ptr());
        fb.block("entry");
        fb.set_loc("kernel.cu", 7);
        let tid = fb.sreg(Intrinsic::TidX);
        let idx = if scale == 1 {
            tid
        } else {
            fb.binary(BinaryOp::Mul, tid, const_i32(scale), Type::I32)
        };
        let gep = fb.gep(a, vec![idx], i32_ptr());
        fb.load(gep, Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        mb.build()
    }

    fn run_coalesce(module: &crate::ir::Module, config: &AnalyzerConfig) -> Vec<Finding> {
        let info = ModuleInfo::new(module);
        let td = ThreadDependence::run(module, &info);
        let mut op = OffsetPropagation::new(module, &info, config.update_probe_depth);
        MemCoalesceAnalysis::new(module, &info, &td, &mut op, config).run()
    }

    #[test]
    fn test_unit_stride_is_coalesced() {
        let module = strided_load_kernel(1);
        let findings = run_coalesce(&module, &AnalyzerConfig::default());
        assert!(findings.is_empty());
    }

    #[test]
    fn test_large_stride_is_reported() {
        let module = strided_load_kernel(128);
        let findings = run_coalesce(&module, &AnalyzerConfig::default());
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.kind, FindingKind::UncoalescedRead);
        assert_eq!(f.severity, Severity::Unknown);
        // Every lane opens its own transaction: the short-circuit scale.
        assert!(f.measure >= 16.0, "measure = {}", f.measure);
        assert!(f.message.contains("In read from a["));
        assert!(f.message.contains("requests/warp"));
    }

    #[test]
    fn test_stride_classifier_when_enabled() {
        let module = strided_load_kernel(128);
        let config = AnalyzerConfig { classify_stride: true, ..AnalyzerConfig::default() };
        let findings = run_coalesce(&module, &config);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Max);
        assert!(findings[0].message.contains("stride"));
    }

    #[test]
    fn test_update_reported_once() {
        // a[tid * 64] += 1: load-add-store on the same pointer. Only the
        // load half reports, tagged as an update.
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let a = fb.param("a", i32_ptr());
        fb.block("entry");
        fb.set_loc("kernel.cu", 3);
        let tid = fb.sreg(Intrinsic::TidX);
        let idx = fb.binary(BinaryOp::Mul, tid, const_i32(64), Type::I32);
        let gep = fb.gep(a, vec![idx], i32_ptr());
        let old = fb.load(gep.clone(), Type::I32);
        let new = fb.binary(BinaryOp::Add, old, const_i32(1), Type::I32);
        fb.store(new, gep);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();

        let findings = run_coalesce(&module, &AnalyzerConfig::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::UncoalescedUpdate);
    }

    #[test]
    fn test_shared_memory_access_skipped() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let s = fb.param("s", Type::Ptr(Box::new(Type::I32), MemorySpace::Shared));
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        let idx = fb.binary(BinaryOp::Mul, tid, const_i32(128), Type::I32);
        let gep = fb.gep(s, vec![idx], Type::Ptr(Box::new(Type::I32), MemorySpace::Shared));
        fb.load(gep, Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        assert!(run_coalesce(&module, &AnalyzerConfig::default()).is_empty());
    }

    #[test]
    fn test_memcpy_destination_checked() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let a = fb.param("a", i32_ptr());
        fb.block("entry");
        fb.set_loc("kernel.cu", 9);
        let tid = fb.sreg(Intrinsic::TidX);
        let idx = fb.binary(BinaryOp::Mul, tid, const_i32(128), Type::I32);
        let dest = fb.gep(a, vec![idx], i32_ptr());
        fb.push(
            Op::Call {
                callee: Callee::Intrinsic(Intrinsic::MemCpy),
                args: vec![dest, const_i32(0), const_i32(16)],
            },
            Type::Void,
        );
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();

        let findings = run_coalesce(&module, &AnalyzerConfig::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::UncoalescedCopy);
    }
}
