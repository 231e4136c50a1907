//! Operational transformation over JSON documents.
//!
//! The document model is [`serde_json::Value`]. An [`Operation`] describes an
//! edit; operations form a closed algebra under three laws:
//!
//! - **apply** — [`Operation::apply_to`] computes the document an operation
//!   produces,
//! - **compose** — [`Operation::compose`] / [`compose_list`] merge two edits
//!   that ran in sequence into one,
//! - **rebase** — [`Operation::rebase`] / [`rebase_array`] transform an edit
//!   made against a base document so that it applies after a concurrent edit
//!   made against the same base.
//!
//! Rebase returns `Ok(None)` when the two edits cannot be reconciled; that is
//! the distinguished *conflict* value, not an error. Passing a
//! [`Conflictless`] context opts into deterministic tie-breaking via the
//! total value order [`cmp_values`], and supplying the prior document through
//! [`Conflictless::with_document`] makes rebase total: every pair of valid
//! operations reconciles.
//!
//! ```rust
//! use serde_json::json;
//! use otj::Operation;
//!
//! let doc = json!({"title": "Hello"});
//! let a = Operation::new_apply("title", Operation::new_set(json!("Hello"), json!("Hi")));
//! let b = Operation::new_rename("title", "headline");
//!
//! // b moved the key, so a's edit follows it there.
//! let a2 = a.rebase(&b, None).unwrap().expect("no conflict");
//! let merged = a2.apply_to(&b.apply_to(&doc).unwrap()).unwrap();
//! assert_eq!(merged, json!({"headline": "Hi"}));
//! ```
//!
//! Operations are immutable; every law returns fresh values and the types can
//! be shared freely across threads.

use std::error::Error;
use std::fmt;

mod apply;
mod compose;
mod operation;
pub mod random;
mod rebase;
mod value;
mod wire;

pub use crate::compose::compose_list;
pub use crate::operation::{BitOperand, Hunk, MathOp, Operation};
pub use crate::rebase::{Conflictless, rebase_array};
pub use crate::value::cmp_values;
pub use crate::wire::{PROTOCOL_VERSION, from_json, to_json};

/// Failures of the *invalid use* kind: an operation was applied to, or built
/// from, data outside its domain. Algebraic conflicts are not errors — rebase
/// reports those as `Ok(None)`.
#[derive(Debug, Clone, PartialEq)]
pub enum OtError {
    /// The document (or an operand) has the wrong type for the operation.
    Type(String),
    /// A sequence index or range falls outside the document.
    Index(String),
    /// An object key was required but absent.
    Key(String),
    /// An arithmetic domain violation (rot out of range, non-finite result).
    Domain(String),
    /// A `Set` whose recorded old side does not match the live document.
    OldMismatch(String),
    /// Malformed or unsupported wire data.
    Wire(String),
}

impl fmt::Display for OtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(e) => write!(f, "type error: {e}"),
            Self::Index(e) => write!(f, "index error: {e}"),
            Self::Key(e) => write!(f, "key error: {e}"),
            Self::Domain(e) => write!(f, "domain error: {e}"),
            Self::OldMismatch(e) => write!(f, "old value mismatch: {e}"),
            Self::Wire(e) => write!(f, "wire error: {e}"),
        }
    }
}

impl Error for OtError {}
