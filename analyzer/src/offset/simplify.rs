//! Canonicalization and cancellation rewrites over offset values
//!
//! All entry points take immutable handles and return new handles; the
//! rewrite loops are guarded by structural "strictly reduced"
//! post-conditions so every fixed point terminates.

use crate::offset::value::{IntVal, OffsetOperator, OffsetPtr, OffsetVal};
use crate::offset::OffsetError;
use crate::threaddep::TaintQuery;
use std::rc::Rc;

/// Negate a condition. Logical `&&`/`||` get De Morgan's laws applied
/// recursively; comparisons flip their operator. Anything else is not a
/// condition and cannot be negated.
pub fn negate_condition(cond: &OffsetPtr) -> Result<OffsetPtr, OffsetError> {
    use OffsetOperator::*;
    let OffsetVal::BinOp { lhs, op, rhs } = &**cond else {
        return Err(OffsetError::NotNegatable);
    };
    if *op == And {
        return Ok(OffsetVal::binop(negate_condition(lhs)?, Or, negate_condition(rhs)?));
    }
    if *op == Or {
        return Ok(OffsetVal::binop(negate_condition(lhs)?, And, negate_condition(rhs)?));
    }
    let flipped = match op {
        Eq => Neq,
        Neq => Eq,
        SLT => SGE,
        SGE => SLT,
        SLE => SGT,
        SGT => SLE,
        ULT => UGE,
        UGE => ULT,
        ULE => UGT,
        UGT => ULE,
        _ => return Err(OffsetError::NotNegatable),
    };
    Ok(OffsetVal::binop(lhs.clone(), flipped, rhs.clone()))
}

/// Normalize to sum-of-products form: the fixed point of
/// [`sum_of_products_pass`] under structural equality.
pub fn sum_of_products(ov: &OffsetPtr) -> OffsetPtr {
    let mut prev = ov.clone();
    let mut next = sum_of_products_pass(&prev);
    while !matching_offsets(&prev, &next) {
        prev = next;
        next = sum_of_products_pass(&prev);
    }
    next
}

/// One distribution pass, post-order. Multiplication distributes over
/// addition and subtraction on either side; division distributes only on
/// the left, since `(a±b)/c` is still linear but `c/(a±b)` is not.
fn sum_of_products_pass(ov: &OffsetPtr) -> OffsetPtr {
    use OffsetOperator::*;
    let OffsetVal::BinOp { lhs, op, rhs } = &**ov else {
        return ov.clone();
    };

    let lhs = sum_of_products_pass(lhs);
    let rhs = sum_of_products_pass(rhs);

    if *op == Mul {
        if let OffsetVal::BinOp { lhs: ll, op: lop, rhs: lr } = &*lhs
            && matches!(lop, Add | Sub)
        {
            let new_lhs = OffsetVal::binop(ll.clone(), *op, rhs.clone());
            let new_rhs = OffsetVal::binop(lr.clone(), *op, rhs.clone());
            return OffsetVal::binop(new_lhs, *lop, new_rhs);
        }
        if let OffsetVal::BinOp { lhs: rl, op: rop, rhs: rr } = &*rhs
            && matches!(rop, Add | Sub)
        {
            let new_lhs = OffsetVal::binop(lhs.clone(), *op, rl.clone());
            let new_rhs = OffsetVal::binop(lhs.clone(), *op, rr.clone());
            return OffsetVal::binop(new_lhs, *rop, new_rhs);
        }
    } else if matches!(op, SDiv | UDiv) {
        if let OffsetVal::BinOp { lhs: ll, op: lop, rhs: lr } = &*lhs
            && matches!(lop, Add | Sub)
        {
            let new_lhs = OffsetVal::binop(ll.clone(), *op, rhs.clone());
            let new_rhs = OffsetVal::binop(lr.clone(), *op, rhs.clone());
            return OffsetVal::binop(new_lhs, *lop, new_rhs);
        }
    }

    OffsetVal::binop(lhs, *op, rhs)
}

/// Rewrite `cond1 - cond2` into `cond1 * !cond2`
fn simplify_conditions(
    lhs: &OffsetPtr,
    op: OffsetOperator,
    rhs: &OffsetPtr,
) -> Option<OffsetPtr> {
    if op == OffsetOperator::Sub && lhs.is_compare() && rhs.is_compare() {
        let negated = negate_condition(rhs).ok()?;
        return Some(OffsetVal::binop(lhs.clone(), OffsetOperator::Mul, negated));
    }
    None
}

/// Zero-extend a pair of constants to their common width
fn widen_pair(lhs: IntVal, rhs: IntVal) -> (IntVal, IntVal) {
    let width = lhs.width().max(rhs.width());
    (lhs.zext_or_self(width), rhs.zext_or_self(width))
}

/// Fold an operator over two constants. Logical `&&`/`||`/`^` are left
/// symbolic: conditions keep their shape for the cancellation rewrites.
fn fold_constants(lhs: &OffsetPtr, op: OffsetOperator, rhs: &OffsetPtr) -> Option<OffsetPtr> {
    use OffsetOperator::*;
    let (l, r) = widen_pair(lhs.const_val().ok()?, rhs.const_val().ok()?);

    let out = match op {
        Add => l.add(&r),
        Sub => l.sub(&r),
        Mul => l.mul(&r),
        SDiv => l.sdiv(&r),
        UDiv => l.udiv(&r),
        SRem => l.srem(&r),
        URem => l.urem(&r),
        And | Or | Xor => return None,
        Eq => IntVal::new(1, (l.eq_widened(&r)) as i128),
        Neq => IntVal::new(1, (!l.eq_widened(&r)) as i128),
        SLT => IntVal::new(1, l.slt(&r) as i128),
        SLE => IntVal::new(1, !l.sgt(&r) as i128),
        SGT => IntVal::new(1, l.sgt(&r) as i128),
        SGE => IntVal::new(1, !l.slt(&r) as i128),
        ULT => IntVal::new(1, l.ult(&r) as i128),
        ULE => IntVal::new(1, !l.ugt(&r) as i128),
        UGT => IntVal::new(1, l.ugt(&r) as i128),
        UGE => IntVal::new(1, !l.ult(&r) as i128),
    };
    Some(OffsetVal::constant(out))
}

fn is_const_eq(ov: &OffsetPtr, v: i64) -> bool {
    match ov.const_val() {
        Ok(c) => c.eq_widened(&IntVal::of_i32(v)),
        Err(_) => false,
    }
}

/// Bottom-up simplification: constant folding, identity rules,
/// constant-subexpression pulling, and condition fusion.
pub fn simplify_offset_val(ov: &OffsetPtr) -> OffsetPtr {
    use OffsetOperator::*;
    let OffsetVal::BinOp { lhs, op, rhs } = &**ov else {
        return ov.clone();
    };
    let op = *op;

    let lhs = simplify_offset_val(lhs);
    let rhs = simplify_offset_val(rhs);

    if lhs.is_const()
        && rhs.is_const()
        && let Some(folded) = fold_constants(&lhs, op, &rhs)
    {
        return folded;
    }

    match op {
        Add => {
            // Adding zero does nothing
            if is_const_eq(&rhs, 0) {
                return lhs;
            }
            if is_const_eq(&lhs, 0) {
                return rhs;
            }
        }
        Sub => {
            if is_const_eq(&rhs, 0) {
                return lhs;
            }
            if let Some(fused) = simplify_conditions(&lhs, op, &rhs) {
                return simplify_offset_val(&fused);
            }
        }
        Mul => {
            // Zeroes destroy the entire tree
            if is_const_eq(&rhs, 0) {
                return rhs;
            }
            if is_const_eq(&lhs, 0) {
                return lhs;
            }
            // Ones have no effect
            if is_const_eq(&rhs, 1) {
                return lhs;
            }
            if is_const_eq(&lhs, 1) {
                return rhs;
            }
        }
        SDiv | UDiv => {
            // Dividing by one does nothing
            if is_const_eq(&rhs, 1) {
                return lhs;
            }
            // 0/anything is zero
            if is_const_eq(&lhs, 0) {
                return lhs;
            }
        }
        SRem | URem => {
            // 0%anything is 0, 1%anything is 1, anything%1 is 0
            if is_const_eq(&lhs, 0) || is_const_eq(&lhs, 1) {
                return lhs;
            }
            if is_const_eq(&rhs, 1) {
                return OffsetVal::cint(0);
            }
        }
        _ => {}
    }

    if let Some(simp) = simplify_constant_sub_expressions(&lhs, op, &rhs) {
        return simp;
    }

    OffsetVal::binop(lhs, op, rhs)
}

/// Pull adjacent constants in additive chains toward a common position:
/// given `(α ± c1) ± c2`, combine `c1` and `c2`, keeping the non-constant
/// operand in place. Operator-sign tables keep subtraction honest.
fn simplify_constant_sub_expressions(
    lhs: &OffsetPtr,
    op: OffsetOperator,
    rhs: &OffsetPtr,
) -> Option<OffsetPtr> {
    use OffsetOperator::*;
    let adding = op == Add;
    if !adding && op != Sub {
        return None;
    }

    // ((x op' c1) op c2) and ((c1 op' x) op c2)
    if let OffsetVal::BinOp { lhs: ll, op: lop, rhs: lr } = &**lhs
        && rhs.is_const()
    {
        let c2 = rhs.const_val().ok()?;
        if let Ok(c1) = lr.const_val() {
            let (c1, c2) = widen_pair(c1, c2);
            let combined = match lop {
                Add => {
                    if adding {
                        c1.add(&c2)
                    } else {
                        c1.sub(&c2)
                    }
                }
                Sub => {
                    if adding {
                        c1.sub(&c2)
                    } else {
                        c1.add(&c2)
                    }
                }
                _ => return None,
            };
            let rebuilt = OffsetVal::binop(ll.clone(), *lop, OffsetVal::constant(combined));
            return Some(simplify_offset_val(&rebuilt));
        }
        if let Ok(c1) = ll.const_val()
            && matches!(lop, Add | Sub)
        {
            let (c1, c2) = widen_pair(c1, c2);
            let combined = if adding { c1.add(&c2) } else { c1.sub(&c2) };
            let rebuilt = OffsetVal::binop(OffsetVal::constant(combined), *lop, lr.clone());
            return Some(simplify_offset_val(&rebuilt));
        }
    }

    // (c1 op (c2 op' x)) and (c1 op (x op' c2))
    if let OffsetVal::BinOp { lhs: rl, op: rop, rhs: rr } = &**rhs
        && lhs.is_const()
    {
        let c1 = lhs.const_val().ok()?;
        if let Ok(c2) = rl.const_val()
            && matches!(rop, Add | Sub)
        {
            let (c1, c2) = widen_pair(c1, c2);
            let combined = if adding { c1.add(&c2) } else { c1.sub(&c2) };
            // c1 + (c2 + x) = (c1+c2) + x     c1 - (c2 + x) = (c1-c2) - x
            // c1 + (c2 - x) = (c1+c2) - x     c1 - (c2 - x) = (c1-c2) + x
            let new_op = match (adding, rop) {
                (true, _) => *rop,
                (false, Add) => Sub,
                (false, Sub) => Add,
                _ => unreachable!(),
            };
            let rebuilt = OffsetVal::binop(OffsetVal::constant(combined), new_op, rr.clone());
            return Some(simplify_offset_val(&rebuilt));
        }
        if let Ok(c2) = rr.const_val()
            && matches!(rop, Add | Sub)
        {
            // c1 + (x + c2) = (c1+c2) + x     c1 - (x + c2) = (c1-c2) - x
            // c1 + (x - c2) = (c1-c2) + x     c1 - (x - c2) = (c1+c2) - x
            let (c1, c2) = widen_pair(c1, c2);
            let (combined, new_op) = match (adding, rop) {
                (true, Add) => (c1.add(&c2), Add),
                (false, Add) => (c1.sub(&c2), Sub),
                (true, Sub) => (c1.sub(&c2), Add),
                (false, Sub) => (c1.add(&c2), Sub),
                _ => unreachable!(),
            };
            let rebuilt = OffsetVal::binop(OffsetVal::constant(combined), new_op, rl.clone());
            return Some(simplify_offset_val(&rebuilt));
        }
    }

    None
}

/// Structural tree equality, up to sign-extension for constants
pub fn matching_offsets(lhs: &OffsetPtr, rhs: &OffsetPtr) -> bool {
    if lhs.is_const() && rhs.is_const() {
        let l = lhs.const_val().expect("const");
        let r = rhs.const_val().expect("const");
        return l.eq_widened(&r);
    }
    match (&**lhs, &**rhs) {
        (OffsetVal::Inst(l), OffsetVal::Inst(r)) => l == r,
        (OffsetVal::Arg(l), OffsetVal::Arg(r)) => l == r,
        (OffsetVal::Unknown(l), OffsetVal::Unknown(r)) => l == r,
        (
            OffsetVal::BinOp { lhs: ll, op: lop, rhs: lr },
            OffsetVal::BinOp { lhs: rl, op: rop, rhs: rr },
        ) => lop == rop && matching_offsets(ll, rl) && matching_offsets(lr, rr),
        _ => false,
    }
}

/// Semantic equality: as [`matching_offsets`], but opaque leaves only
/// compare equal when the referenced value does not vary across threads;
/// otherwise two threads would disagree even about the "same" leaf.
pub fn equal_offsets(lhs: &OffsetPtr, rhs: &OffsetPtr, td: &dyn TaintQuery) -> bool {
    if lhs.is_const() && rhs.is_const() {
        let l = lhs.const_val().expect("const");
        let r = rhs.const_val().expect("const");
        return l.eq_widened(&r);
    }
    match (&**lhs, &**rhs) {
        (OffsetVal::Inst(l), OffsetVal::Inst(r)) => {
            l == r && !td.is_dependent(&crate::ir::Value::Inst(*l))
        }
        (OffsetVal::Arg(l), OffsetVal::Arg(r)) => {
            l == r && !td.is_dependent(&crate::ir::Value::Arg(*l))
        }
        (OffsetVal::Unknown(l), OffsetVal::Unknown(r)) => l == r && !td.is_dependent(l),
        (
            OffsetVal::BinOp { lhs: ll, op: lop, rhs: lr },
            OffsetVal::BinOp { lhs: rl, op: rop, rhs: rr },
        ) => lop == rop && equal_offsets(ll, rl, td) && equal_offsets(lr, rr, td),
        _ => false,
    }
}

/// Flatten nested additions and subtractions into added/subtracted
/// multisets; `negated` tracks the sign context of the walk.
fn flatten_sums(
    ov: &OffsetPtr,
    added: &mut Vec<OffsetPtr>,
    subtracted: &mut Vec<OffsetPtr>,
    negated: bool,
) {
    if let OffsetVal::BinOp { lhs, op, rhs } = &**ov {
        if *op == OffsetOperator::Add {
            flatten_sums(lhs, added, subtracted, negated);
            flatten_sums(rhs, added, subtracted, negated);
            return;
        }
        if *op == OffsetOperator::Sub {
            flatten_sums(lhs, added, subtracted, negated);
            flatten_sums(rhs, added, subtracted, !negated);
            return;
        }
    }
    if negated {
        subtracted.push(ov.clone());
    } else {
        added.push(ov.clone());
    }
}

/// Cancel matching terms across an n-ary difference. Pairs cancel when
/// they are semantically equal, or merge through
/// [`simplify_difference_of_products`]; the loop stops when no pair
/// reduces any further. The result is a rebuilt, simplified tree.
pub fn cancel_diffs(ov: &OffsetPtr, td: &dyn TaintQuery) -> OffsetPtr {
    let mut added = Vec::new();
    let mut subtracted = Vec::new();
    flatten_sums(ov, &mut added, &mut subtracted, false);

    loop {
        let mut change = None;
        'search: for (i, a) in added.iter().enumerate() {
            for (j, s) in subtracted.iter().enumerate() {
                if equal_offsets(a, s, td) {
                    change = Some((i, j, None));
                    break 'search;
                }
                if let Some(merged) = simplify_difference_of_products(a, s, td) {
                    change = Some((i, j, Some(merged)));
                    break 'search;
                }
            }
        }
        match change {
            None => break,
            Some((i, j, merged)) => {
                added.remove(i);
                subtracted.remove(j);
                if let Some(m) = merged {
                    flatten_sums(&m, &mut added, &mut subtracted, false);
                }
            }
        }
    }

    // Rebuild a left-associated binary tree
    let mut ret = added.pop().unwrap_or_else(|| OffsetVal::cint(0));
    while let Some(a) = added.pop() {
        ret = OffsetVal::binop(ret, OffsetOperator::Add, a);
    }
    while let Some(s) = subtracted.pop() {
        ret = OffsetVal::binop(ret, OffsetOperator::Sub, s);
    }
    simplify_offset_val(&ret)
}

/// Try to fuse `a*x - b*x` into `(a-b)*x` (and the left-factor mirror).
/// Returns `None` unless the rewrite strictly reduces the normalized
/// form, the guard that keeps [`cancel_diffs`] terminating.
fn simplify_difference_of_products(
    addt: &OffsetPtr,
    subt: &OffsetPtr,
    td: &dyn TaintQuery,
) -> Option<OffsetPtr> {
    use OffsetOperator::*;
    let (OffsetVal::BinOp { lhs: a_lhs, op: Mul, rhs: a_rhs },
         OffsetVal::BinOp { lhs: s_lhs, op: Mul, rhs: s_rhs }) = (&**addt, &**subt)
    else {
        return None;
    };

    let new_product = if equal_offsets(a_rhs, s_rhs, td) {
        // ax - bx => (a-b)x
        let factor_diff = OffsetVal::binop(a_lhs.clone(), Sub, s_lhs.clone());
        let cancelled = cancel_diffs(&factor_diff, td);
        OffsetVal::binop(cancelled, Mul, s_rhs.clone())
    } else if equal_offsets(a_lhs, s_lhs, td) {
        // xa - xb => x(a-b)
        let factor_diff = OffsetVal::binop(a_rhs.clone(), Sub, s_rhs.clone());
        let cancelled = cancel_diffs(&factor_diff, td);
        OffsetVal::binop(s_lhs.clone(), Mul, cancelled)
    } else {
        return None;
    };

    let original_diff = OffsetVal::binop(addt.clone(), Sub, subt.clone());
    let new_sop = sum_of_products(&new_product);
    let old_sop = sum_of_products(&original_diff);
    // Reject rewrites that achieved nothing, important for termination.
    if matching_offsets(&simplify_offset_val(&new_sop), &simplify_offset_val(&old_sop)) {
        None
    } else {
        Some(new_sop)
    }
}

/// Structural substitution: any subtree matching a pattern is replaced.
/// Handles are reused when nothing below changed.
pub fn replace_components(orig: &OffsetPtr, rep: &[(OffsetPtr, OffsetPtr)]) -> OffsetPtr {
    for (pattern, replacement) in rep {
        if matching_offsets(orig, pattern) {
            return replacement.clone();
        }
    }

    let OffsetVal::BinOp { lhs, op, rhs } = &**orig else {
        return orig.clone();
    };
    let new_lhs = replace_components(lhs, rep);
    let new_rhs = replace_components(rhs, rep);
    if Rc::ptr_eq(&new_lhs, lhs) && Rc::ptr_eq(&new_rhs, rhs) {
        orig.clone()
    } else {
        OffsetVal::binop(new_lhs, *op, new_rhs)
    }
}
