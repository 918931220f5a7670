//! Findings and warning emission
//!
//! The analyzers produce structured [`Finding`]s; the [`Reporter`] is a
//! thin sink that resolves source locations and formats them either for
//! humans or as machine-readable JSON lines. Findings on instructions
//! without debug locations are suppressed by default and printed as raw
//! instruction text in verbose mode.

use crate::ir::{Callee, InstRef, Module, Op, Value};
use serde::Serialize;
use std::fmt;
use std::io::Write;

/// Warning severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Unknown,
    Min,
    Med,
    Max,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Unknown => write!(f, "(Unk)"),
            Severity::Min => write!(f, "(min)"),
            Severity::Med => write!(f, "(Med)"),
            Severity::Max => write!(f, "(MAX)"),
        }
    }
}

/// What a finding is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FindingKind {
    DivergentBranch,
    UncoalescedRead,
    UncoalescedWrite,
    UncoalescedUpdate,
    UncoalescedCopy,
    Uncoalesced,
}

/// One analyzer result, tied to the offending instruction
#[derive(Debug, Clone)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub inst: InstRef,
    /// Human-readable name of the accessed value
    pub value_name: String,
    /// Divergence score or requests per warp, depending on `kind`
    pub measure: f64,
    pub message: String,
}

/// Output formats for emitted warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    MachineReadable,
}

#[derive(Serialize)]
struct MachineRecord<'a> {
    filename: &'a str,
    line: u32,
    severity: Severity,
    kind: FindingKind,
    message: &'a str,
    function: &'a str,
}

/// Formats findings to a writer
pub struct Reporter<W: Write> {
    format: OutputFormat,
    verbose: bool,
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(format: OutputFormat, verbose: bool, out: W) -> Self {
        Self { format, verbose, out }
    }

    /// Emit a batch of findings against their module
    pub fn emit_all(&mut self, module: &Module, findings: &[Finding]) -> std::io::Result<()> {
        for finding in findings {
            self.emit(module, finding)?;
        }
        Ok(())
    }

    pub fn emit(&mut self, module: &Module, finding: &Finding) -> std::io::Result<()> {
        let func = module.func(finding.inst.func);
        let inst = module.inst(finding.inst);

        match (&inst.loc, self.format) {
            (Some(loc), OutputFormat::MachineReadable) => {
                let record = MachineRecord {
                    filename: &loc.file,
                    line: loc.line,
                    severity: finding.severity,
                    kind: finding.kind,
                    message: &finding.message,
                    function: &func.name,
                };
                writeln!(self.out, "{}", serde_json::to_string(&record).expect("serializable"))
            }
            (None, OutputFormat::MachineReadable) => Ok(()),
            (Some(loc), OutputFormat::Human) => {
                writeln!(self.out, "{} Warning: {}", finding.severity, finding.message)?;
                writeln!(self.out, "{}:{} in {}:", loc.file, loc.line, func.name)?;
                writeln!(self.out)
            }
            (None, OutputFormat::Human) => {
                // No debug info: suppressed unless verbose, where the raw
                // instruction stands in for the source line.
                if !self.verbose {
                    return Ok(());
                }
                writeln!(self.out, "{} Warning: {}", finding.severity, finding.message)?;
                writeln!(self.out, "in {}:", func.name)?;
                writeln!(self.out, "    {} = {}", finding.inst.inst, inst.op)?;
                writeln!(self.out)
            }
        }
    }
}

/// Best-effort source-level name for a value: debug names when the front
/// end recorded them, otherwise reconstructed from the expression shape.
pub fn value_name(module: &Module, v: &Value) -> String {
    match v {
        Value::ConstInt { value, .. } => return value.to_string(),
        Value::ConstNull(_) => return "null".to_string(),
        Value::Arg(a) => {
            return module.func(a.func).params[a.index as usize].name.clone();
        }
        Value::Inst(_) => {}
    }

    let Value::Inst(r) = v else { unreachable!() };
    let inst = module.inst(*r);
    if let Some(name) = &inst.name {
        return name.clone();
    }

    match &inst.op {
        Op::Gep { ptr, indices } => {
            let base = value_name(module, ptr);
            match indices.first() {
                Some(idx) => format!("{}[{}]", base, value_name(module, idx)),
                None => format!("*{}", base),
            }
        }
        Op::Load { ptr } => value_name(module, ptr),
        Op::Binary { op, lhs, rhs } => {
            use crate::ir::BinaryOp::*;
            let spelled = match op {
                Add => "+",
                Sub => "-",
                Mul => "*",
                SDiv | UDiv => "/",
                SRem | URem => "%",
                AShr | LShr => ">>",
                Shl => "<<",
                And => "&&",
                Or => "||",
                Xor => "^",
            };
            format!("{}{}{}", value_name(module, lhs), spelled, value_name(module, rhs))
        }
        Op::Cast { value, .. } => value_name(module, value),
        Op::Call { callee: Callee::Intrinsic(i), .. } => i.pretty_name().to_string(),
        _ => "tmp".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{BinaryOp, Intrinsic, MemorySpace, Type};

    fn sample() -> (Module, Value, Value, Value) {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let a = fb.param("a", Type::Ptr(Box::new(Type::I32), MemorySpace::Global));
        fb.block("entry");
        fb.set_loc("kernel.cu", 42);
        let tid = fb.sreg(Intrinsic::TidX);
        let idx = fb.binary(BinaryOp::Mul, tid, const_i32(2), Type::I32);
        let gep = fb.gep(a.clone(), vec![idx.clone()], Type::Ptr(Box::new(Type::I32), MemorySpace::Global));
        fb.ret(None);
        mb.add_function(fb.finish());
        (mb.build(), a, idx, gep)
    }

    #[test]
    fn test_value_name_reconstruction() {
        let (module, a, idx, gep) = sample();
        assert_eq!(value_name(&module, &a), "a");
        assert_eq!(value_name(&module, &idx), "threadIdx.x*2");
        assert_eq!(value_name(&module, &gep), "a[threadIdx.x*2]");
    }

    fn sample_finding(inst: InstRef) -> Finding {
        Finding {
            kind: FindingKind::UncoalescedRead,
            severity: Severity::Unknown,
            inst,
            value_name: "a".to_string(),
            measure: 32.0,
            message: "In read from a, Possible Uncoalesced Access Detected".to_string(),
        }
    }

    #[test]
    fn test_human_output_carries_location() {
        let (module, _, _, gep) = sample();
        let Value::Inst(r) = gep else { unreachable!() };
        let mut buf = Vec::new();
        let mut reporter = Reporter::new(OutputFormat::Human, false, &mut buf);
        reporter.emit(&module, &sample_finding(r)).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("(Unk) Warning:"));
        assert!(text.contains("kernel.cu:42 in k:"));
    }

    #[test]
    fn test_machine_output_is_json() {
        let (module, _, _, gep) = sample();
        let Value::Inst(r) = gep else { unreachable!() };
        let mut buf = Vec::new();
        let mut reporter = Reporter::new(OutputFormat::MachineReadable, false, &mut buf);
        reporter.emit(&module, &sample_finding(r)).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["filename"], "kernel.cu");
        assert_eq!(parsed["line"], 42);
        assert_eq!(parsed["function"], "k");
    }

    #[test]
    fn test_missing_debug_info_suppressed_unless_verbose() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();
        let Value::Inst(r) = tid else { unreachable!() };

        let mut buf = Vec::new();
        Reporter::new(OutputFormat::Human, false, &mut buf)
            .emit(&module, &sample_finding(r))
            .unwrap();
        assert!(buf.is_empty());

        let mut buf = Vec::new();
        Reporter::new(OutputFormat::Human, true, &mut buf)
            .emit(&module, &sample_finding(r))
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("in k:"));
        assert!(text.contains("call threadIdx.x"));
    }
}
