//! The symbolic offset engine
//!
//! Builds, simplifies, and evaluates a closed algebra of arithmetic
//! expressions over IR values, the *arithmetic context function* (ACF)
//! of a value. Three layers:
//!
//! ```text
//! value    - immutable expression nodes, constant folding, ranges
//! simplify - canonicalization and cancellation rewrites
//! propagate - lazy ACF construction per IR value + context substitution
//! ```

pub mod propagate;
pub mod simplify;
pub mod value;

pub use propagate::{AcfStats, OffsetPropagation};
pub use value::{IntVal, OffsetOperator, OffsetPtr, OffsetVal};

use thiserror::Error;

/// Failures of the offset algebra's narrow contracts. Everything else in
/// the engine degrades to an opaque leaf instead of erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OffsetError {
    /// `const_val` was asked of a non-constant node
    #[error("offset value is not a constant")]
    NotConstant,
    /// `negate_condition` was asked to negate a non-condition operator
    #[error("offset operator cannot be negated")]
    NotNegatable,
    /// A struct GEP carried a runtime-variable field index
    #[error("struct field index is not a compile-time constant")]
    DynamicStructIndex,
}
