//! warpcheck: static performance linter for GPU compute kernels
//!
//! Flags two classes of performance bugs in compiled GPU modules:
//! **divergent branches** (conditions that differ between threads of a
//! warp) and **uncoalesced memory accesses** (warp-level access patterns
//! that split into too many memory transactions).
//!
//! # Architecture
//!
//! ```text
//! Module (typed SSA IR)
//!    │
//!    ├──────────────────────┐
//!    ▼                      ▼
//! ┌──────────────────┐  ┌──────────────────┐
//! │ ThreadDependence │  │ OffsetPropagation│ ← symbolic ACF per value
//! │ (taint fixpoint) │  │ (lazy, memoized) │
//! └──────────────────┘  └──────────────────┘
//!    │                      │
//!    ▼                      ▼
//! ┌─────────────────────────────────────────┐
//! │ BranchDivergeAnalysis  MemCoalesceAnalysis │
//! └─────────────────────────────────────────┘
//!    │
//!    ▼
//! Findings → Reporter (human / machine-readable)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use warpcheck::{Analyzer, AnalyzerConfig};
//!
//! let module: warpcheck::ir::Module = serde_json::from_str(&text)?;
//! let findings = Analyzer::new(&module, AnalyzerConfig::default()).run();
//! ```

pub mod addrspace;
pub mod analysis;
pub mod coalesce;
pub mod config;
pub mod diverge;
pub mod ir;
pub mod offset;
pub mod report;
pub mod threaddep;

pub use coalesce::{MemAccess, MemCoalesceAnalysis};
pub use config::{AnalyzerConfig, GridConfig};
pub use diverge::BranchDivergeAnalysis;
pub use offset::{AcfStats, IntVal, OffsetError, OffsetOperator, OffsetPropagation, OffsetVal};
pub use report::{Finding, FindingKind, OutputFormat, Reporter, Severity};
pub use threaddep::{TaintQuery, ThreadDependence};

use analysis::ModuleInfo;
use ir::Module;

/// Owns the per-module analysis state and orchestrates a run: solve
/// thread dependence, then sweep both analyzers over the module.
pub struct Analyzer<'m> {
    module: &'m Module,
    config: AnalyzerConfig,
}

impl<'m> Analyzer<'m> {
    pub fn new(module: &'m Module, config: AnalyzerConfig) -> Self {
        Self { module, config }
    }

    /// Run both analyses and return their findings, divergence first.
    pub fn run(&self) -> Vec<Finding> {
        let info = ModuleInfo::new(self.module);
        let td = ThreadDependence::run(self.module, &info);
        let mut op =
            OffsetPropagation::new(self.module, &info, self.config.update_probe_depth);

        let mut findings =
            BranchDivergeAnalysis::new(self.module, &td, &mut op, &self.config).run();
        findings.extend(
            MemCoalesceAnalysis::new(self.module, &info, &td, &mut op, &self.config).run(),
        );

        let stats = op.stats();
        tracing::debug!(
            target: "acf",
            translations = stats.translations,
            max_contexts = stats.max_contexts,
            structural_pairings = stats.structural_pairings,
            "offset propagation statistics"
        );
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{BinaryOp, Intrinsic, MemorySpace, Predicate, Type};

    #[test]
    fn test_facade_runs_both_analyses() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let a = fb.param("a", Type::Ptr(Box::new(Type::I32), MemorySpace::Global));
        let entry = fb.block("entry");
        let then_bb = fb.block("then");
        let exit = fb.block("exit");
        fb.set_block(entry);
        fb.set_loc("kernel.cu", 1);
        let tid = fb.sreg(Intrinsic::TidX);
        // A divergent branch on tid parity...
        let parity = fb.binary(BinaryOp::And, tid.clone(), const_i32(1), Type::I32);
        let cond = fb.icmp(Predicate::Eq, parity, const_i32(0));
        fb.cond_br(cond, then_bb, exit);
        fb.set_block(then_bb);
        // ...and a badly strided store inside it.
        let idx = fb.binary(BinaryOp::Mul, tid, const_i32(100), Type::I32);
        let gep = fb.gep(a, vec![idx], Type::Ptr(Box::new(Type::I32), MemorySpace::Global));
        fb.store(const_i32(0), gep);
        fb.br(exit);
        fb.set_block(exit);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();

        let findings = Analyzer::new(&module, AnalyzerConfig::default()).run();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].kind, FindingKind::DivergentBranch);
        assert_eq!(findings[1].kind, FindingKind::UncoalescedWrite);
    }
}
