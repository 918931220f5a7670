//! Branch divergence analysis
//!
//! For every conditional branch whose condition is thread-dependent,
//! quantifies the fraction of sampled warps whose lanes would disagree
//! about the branch decision under a synthetic grid. A context whose
//! lane-to-lane difference refuses to cancel to a constant is scored at
//! the pessimistic maximum.

use crate::config::{AnalyzerConfig, WARP_SIZE};
use crate::ir::{InstRef, Module, Op, Value};
use crate::offset::simplify::{cancel_diffs, simplify_offset_val, sum_of_products};
use crate::offset::value::{OffsetOperator, OffsetPtr, OffsetVal};
use crate::offset::OffsetPropagation;
use crate::report::{value_name, Finding, FindingKind, Severity};
use crate::threaddep::{TaintQuery, ThreadDependence};

/// Locates divergent branches in GPU code
pub struct BranchDivergeAnalysis<'a, 'm> {
    module: &'m Module,
    td: &'a ThreadDependence,
    op: &'a mut OffsetPropagation<'m>,
    config: &'a AnalyzerConfig,
}

impl<'a, 'm> BranchDivergeAnalysis<'a, 'm> {
    pub fn new(
        module: &'m Module,
        td: &'a ThreadDependence,
        op: &'a mut OffsetPropagation<'m>,
        config: &'a AnalyzerConfig,
    ) -> Self {
        Self { module, td, op, config }
    }

    /// Scan every defined function for thread-dependent conditional
    /// branches and score them.
    pub fn run(&mut self) -> Vec<Finding> {
        let mut findings = Vec::new();
        for fid in self.module.func_ids() {
            let func = self.module.func(fid);
            if func.is_declaration() {
                continue;
            }
            for inst_id in func.inst_ids() {
                let branch = InstRef { func: fid, inst: inst_id };
                let Op::CondBr { cond, .. } = &func.inst(inst_id).op else {
                    continue;
                };
                if !self.td.is_dependent(&Value::Inst(branch)) {
                    continue;
                }
                let cond = cond.clone();
                let divergence = self.divergence(&cond);
                if divergence > self.config.diverge_threshold {
                    tracing::debug!(target: "bdiverge", score = divergence, branch = ?branch, "divergent branch");
                    findings.push(Finding {
                        kind: FindingKind::DivergentBranch,
                        severity: Severity::Med,
                        inst: branch,
                        value_name: value_name(self.module, &cond),
                        measure: divergence,
                        message: "Divergent Branch Detected".to_string(),
                    });
                } else {
                    tracing::debug!(target: "bdiverge", score = divergence, branch = ?branch, "nondivergent branch");
                }
            }
        }
        findings
    }

    /// Divergence score in `[0, 1]`: the worst fraction of sampled warps
    /// with internal disagreement, over all calling contexts.
    pub fn divergence(&mut self, cond: &Value) -> f64 {
        let cond_acf = self.op.get_or_create(cond);
        let contexts = self.op.in_contexts(&cond_acf);

        let mut max_divergence: f64 = 0.0;
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

            // Difference between threads 1 and 0 of block 0 decides
            // whether this context is predictable at all.
            if !self.lane_diff(&simp, 1, 0).is_const() {
                tracing::debug!(target: "bdiverge", "context is unpredictable, scoring 1.0");
                return 1.0;
            }

            let mut divergent = 0i64;
            for warp in 0..self.config.warps_sampled {
                let base = warp * WARP_SIZE;
                for lane in 1..WARP_SIZE {
                    let diff = self.lane_diff(&simp, base, base + lane);
                    let uniform = match diff.const_val() {
                        Ok(v) => v.is_zero(),
                        Err(_) => false,
                    };
                    if !uniform {
                        divergent += 1;
                        break; // one disagreeing lane settles the warp
                    }
                }
            }
            let score = divergent as f64 / self.config.warps_sampled as f64;
            if score > max_divergence {
                max_divergence = score;
            }
        }
        max_divergence
    }

    /// `value(thread a) - value(thread b)` in block 0, fully cancelled
    fn lane_diff(&mut self, simp: &OffsetPtr, a: i64, b: i64) -> OffsetPtr {
        let at_a = self.op.in_thread_context(simp, a, 0, 0, 0, 0, 0);
        let at_b = self.op.in_thread_context(simp, b, 0, 0, 0, 0, 0);
        cancel_diffs(&OffsetVal::binop(at_a, OffsetOperator::Sub, at_b), self.td)
    }
}
