//! Address-space classification
//!
//! Decides whether a memory operation may touch global or constant
//! memory. Walks through loads, stores, GEPs, and address-space casts to
//! the underlying pointer; pure stack allocations and shared-memory
//! pointers are excluded, everything uncertain is assumed global.

use crate::ir::{CastKind, MemorySpace, Module, Op, Value};

/// May this value (or the pointer it ultimately names) refer to global
/// or constant memory?
pub fn may_be_global(module: &Module, v: &Value) -> bool {
    if let Value::Inst(r) = v {
        match &module.inst(*r).op {
            Op::Load { ptr } => return may_be_global(module, ptr),
            Op::Store { ptr, .. } => return may_be_global(module, ptr),
            Op::Gep { ptr, .. } => return may_be_global(module, ptr),
            Op::Cast { kind: CastKind::AddrSpaceCast, value } => {
                return may_be_global(module, value);
            }
            // A stack slot of non-pointer element type never escapes to
            // global memory.
            Op::Alloca { elem } => {
                if !elem.is_pointer() {
                    return false;
                }
            }
            _ => {}
        }
    }

    if let Some(space) = v.ty(module).address_space() {
        match space {
            MemorySpace::Global | MemorySpace::Constant => return true,
            MemorySpace::Shared => return false,
            MemorySpace::Generic | MemorySpace::Local => {}
        }
    }

    // If we can't tell, assume it may
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::*;
    use crate::ir::{Intrinsic, Type};

    #[test]
    fn test_global_pointer_and_shared_pointer() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        let g = fb.param("g", Type::Ptr(Box::new(Type::I32), MemorySpace::Global));
        let s = fb.param("s", Type::Ptr(Box::new(Type::I32), MemorySpace::Shared));
        fb.block("entry");
        let tid = fb.sreg(Intrinsic::TidX);
        let g_gep = fb.gep(g.clone(), vec![tid.clone()], Type::Ptr(Box::new(Type::I32), MemorySpace::Global));
        let g_load = fb.load(g_gep, Type::I32);
        let s_gep = fb.gep(s.clone(), vec![tid], Type::Ptr(Box::new(Type::I32), MemorySpace::Shared));
        let s_load = fb.load(s_gep, Type::I32);
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();

        assert!(may_be_global(&module, &g));
        assert!(may_be_global(&module, &g_load));
        assert!(!may_be_global(&module, &s));
        assert!(!may_be_global(&module, &s_load));
    }

    #[test]
    fn test_stack_allocation_is_not_global() {
        let mut mb = ModuleBuilder::new("m");
        let fid = mb.fresh_func_id();
        let mut fb = FunctionBuilder::new(fid, "k").kernel();
        fb.block("entry");
        let slot = fb.alloca(Type::I32);
        let loaded = fb.load(slot.clone(), Type::I32);
        // A slot holding a pointer could still name global memory.
        let ptr_slot = fb.alloca(Type::Ptr(Box::new(Type::I32), MemorySpace::Global));
        fb.ret(None);
        mb.add_function(fb.finish());
        let module = mb.build();

        assert!(!may_be_global(&module, &slot));
        assert!(!may_be_global(&module, &loaded));
        assert!(may_be_global(&module, &ptr_slot));
    }
}
