//! The operation universe: one tagged sum covering scalar, sequence and
//! object edits plus the `List` composition container.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::OtError;
use crate::compose::compose_list;
use crate::value::{concat_seq, empty_like, kind_name, seq_len, split_seq};

/// A single edit of a JSON document.
///
/// Operations are immutable. `Set` carries both sides so that inverses and
/// several rebases are pure; a `None` side is the Missing sentinel (absent
/// property), which never occurs in a live document.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Leaves the document unchanged.
    NoOp,
    /// Replaces the whole document (or property) with `new`.
    Set {
        old: Option<Value>,
        new: Option<Value>,
    },
    /// Arithmetic or bitwise update of a number or boolean.
    Math { op: MathOp },
    /// A non-overlapping ordered set of hunks over a string or array.
    Patch { hunks: Vec<Hunk> },
    /// Applies the same inner operation to every element of a sequence.
    Map { op: Box<Operation> },
    /// Relocates `count` elements from `pos`; `new_pos` indexes the document
    /// *after* the range has been removed.
    Move {
        pos: usize,
        count: usize,
        new_pos: usize,
    },
    /// Applies an inner operation to each named object property.
    Apply { ops: BTreeMap<String, Operation> },
    /// Atomic multi-way rename/duplicate/delete; `new_key → old_key`.
    Ren { map: BTreeMap<String, String> },
    /// A sequence of operations applied left to right.
    List { ops: Vec<Operation> },
}

/// Skip `offset` elements, then apply `op` to the next `length` elements.
#[derive(Clone, Debug, PartialEq)]
pub struct Hunk {
    pub offset: usize,
    pub length: usize,
    pub op: Operation,
}

/// The operator of a [`Operation::Math`].
///
/// `Add` and `Mult` are number-only. `Rot` rotates an integer within
/// `[0, modulus)`. The bitwise forms work on integers with an integer
/// operand or on booleans with a boolean operand.
#[derive(Clone, Debug, PartialEq)]
pub enum MathOp {
    Add(f64),
    Mult(f64),
    Rot { inc: i64, modulus: i64 },
    And(BitOperand),
    Or(BitOperand),
    Xor(BitOperand),
    Not,
}

/// Operand of a bitwise [`MathOp`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BitOperand {
    Int(i64),
    Bool(bool),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::NoOp => write!(f, "no-op"),
            Operation::Set { old, new } => write!(
                f,
                "set {} -> {}",
                slot_repr(old.as_ref()),
                slot_repr(new.as_ref())
            ),
            Operation::Math { op } => write!(f, "math {op}"),
            Operation::Patch { hunks } => {
                write!(f, "patch [")?;
                for (i, h) in hunks.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "+{}x{} {}", h.offset, h.length, h.op)?;
                }
                write!(f, "]")
            }
            Operation::Map { op } => write!(f, "map ({op})"),
            Operation::Move {
                pos,
                count,
                new_pos,
            } => write!(f, "move {count} @ {pos} -> {new_pos}"),
            Operation::Apply { ops } => {
                write!(f, "apply {{")?;
                for (i, (k, op)) in ops.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {op}")?;
                }
                write!(f, "}}")
            }
            Operation::Ren { map } => {
                write!(f, "ren {{")?;
                for (i, (new_key, old_key)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{new_key} <- {old_key}")?;
                }
                write!(f, "}}")
            }
            Operation::List { ops } => {
                write!(f, "[")?;
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{op}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl fmt::Display for MathOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MathOp::Add(n) => write!(f, "add {n}"),
            MathOp::Mult(n) => write!(f, "mult {n}"),
            MathOp::Rot { inc, modulus } => write!(f, "rot {inc} mod {modulus}"),
            MathOp::And(o) => write!(f, "and {o}"),
            MathOp::Or(o) => write!(f, "or {o}"),
            MathOp::Xor(o) => write!(f, "xor {o}"),
            MathOp::Not => write!(f, "not"),
        }
    }
}

impl fmt::Display for BitOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitOperand::Int(i) => write!(f, "{i}"),
            BitOperand::Bool(b) => write!(f, "{b}"),
        }
    }
}

fn slot_repr(slot: Option<&Value>) -> String {
    match slot {
        Some(v) => v.to_string(),
        None => String::from("(missing)"),
    }
}

impl Operation {
    /// Replace `old` with `new`; either side may be `None` (Missing) when the
    /// operation creates or deletes a property.
    pub fn new_set(old: impl Into<Value>, new: impl Into<Value>) -> Operation {
        Operation::Set {
            old: Some(old.into()),
            new: Some(new.into()),
        }
    }

    pub fn try_new_math(op: MathOp) -> Result<Operation, OtError> {
        if let MathOp::Rot { inc: _, modulus } = op {
            if modulus <= 0 {
                return Err(OtError::Domain(format!(
                    "rot modulus must be positive, got {modulus}"
                )));
            }
        }
        let op = match op {
            MathOp::Rot { inc, modulus } => MathOp::Rot {
                inc: inc.rem_euclid(modulus),
                modulus,
            },
            other => other,
        };
        Ok(Operation::Math { op })
    }

    /// Build a patch, rejecting `List` hunk operations.
    pub fn try_new_patch(hunks: Vec<Hunk>) -> Result<Operation, OtError> {
        for h in &hunks {
            if matches!(h.op, Operation::List { .. }) {
                return Err(OtError::Type(String::from(
                    "a patch hunk cannot contain a list operation",
                )));
            }
        }
        Ok(Operation::Patch { hunks })
    }

    /// Single-hunk patch replacing `old` with `new` at `offset`, mimicking a
    /// splice. Both sides must be sequences of the same kind.
    pub fn try_new_splice(offset: usize, old: Value, new: Value) -> Result<Operation, OtError> {
        let length = seq_len(&old)?;
        seq_len(&new)?;
        if kind_name(&old) != kind_name(&new) {
            return Err(OtError::Type(format!(
                "splice sides must agree: {} vs {}",
                kind_name(&old),
                kind_name(&new)
            )));
        }
        Ok(Operation::Patch {
            hunks: vec![Hunk {
                offset,
                length,
                op: Operation::Set {
                    old: Some(old),
                    new: Some(new),
                },
            }],
        })
    }

    pub fn new_map(op: Operation) -> Operation {
        Operation::Map { op: Box::new(op) }
    }

    pub fn new_move(pos: usize, count: usize, new_pos: usize) -> Operation {
        Operation::Move {
            pos,
            count,
            new_pos,
        }
    }

    /// Apply `op` to the property `key`.
    pub fn new_apply(key: impl Into<String>, op: Operation) -> Operation {
        let mut ops = BTreeMap::new();
        ops.insert(key.into(), op);
        Operation::Apply { ops }
    }

    /// Create the property `key` (it must be absent).
    pub fn new_put(key: impl Into<String>, value: Value) -> Operation {
        Operation::new_apply(
            key,
            Operation::Set {
                old: None,
                new: Some(value),
            },
        )
    }

    /// Delete the property `key`, whose current value is `old`.
    pub fn new_remove(key: impl Into<String>, old: Value) -> Operation {
        Operation::new_apply(
            key,
            Operation::Set {
                old: Some(old),
                new: None,
            },
        )
    }

    /// Rename the property `from` to `to`.
    pub fn new_rename(from: impl Into<String>, to: impl Into<String>) -> Operation {
        let mut map = BTreeMap::new();
        map.insert(to.into(), from.into());
        Operation::Ren { map }
    }

    pub fn new_ren(map: BTreeMap<String, String>) -> Operation {
        Operation::Ren { map }
    }

    /// Normal form: drops identity edits, flattens lists, coalesces adjacent
    /// hunks. Apply-preserving and idempotent.
    pub fn simplify(&self) -> Operation {
        match self {
            Operation::NoOp => Operation::NoOp,
            Operation::Set { old, new } => {
                if old == new {
                    Operation::NoOp
                } else {
                    self.clone()
                }
            }
            Operation::Math { op } => {
                if math_identity(op) {
                    Operation::NoOp
                } else {
                    self.clone()
                }
            }
            Operation::Patch { hunks } => simplify_patch(hunks),
            Operation::Map { op } => match op.simplify() {
                Operation::NoOp => Operation::NoOp,
                inner => Operation::Map { op: Box::new(inner) },
            },
            Operation::Move {
                pos,
                count,
                new_pos,
            } => {
                if *count == 0 || pos == new_pos {
                    Operation::NoOp
                } else {
                    self.clone()
                }
            }
            Operation::Apply { ops } => {
                let mut out = BTreeMap::new();
                for (k, op) in ops {
                    match op.simplify() {
                        Operation::NoOp => {}
                        inner => {
                            out.insert(k.clone(), inner);
                        }
                    }
                }
                if out.is_empty() {
                    Operation::NoOp
                } else {
                    Operation::Apply { ops: out }
                }
            }
            Operation::Ren { map } => {
                let out: BTreeMap<String, String> = map
                    .iter()
                    .filter(|(new_key, old_key)| new_key != old_key)
                    .map(|(n, o)| (n.clone(), o.clone()))
                    .collect();
                if out.is_empty() {
                    Operation::NoOp
                } else {
                    Operation::Ren { map: out }
                }
            }
            Operation::List { ops } => compose_list(ops.clone()),
        }
    }

    /// What this operation does to the named property; `NoOp` when it has no
    /// well-defined per-property effect.
    pub fn drilldown_key(&self, key: &str) -> Operation {
        match self {
            Operation::Apply { ops } => ops.get(key).cloned().unwrap_or(Operation::NoOp),
            Operation::Set { old, new } => {
                let o = old.as_ref().and_then(|v| v.get(key)).cloned();
                let n = new.as_ref().and_then(|v| v.get(key)).cloned();
                Operation::Set { old: o, new: n }.simplify()
            }
            Operation::List { ops } => {
                compose_list(ops.iter().map(|op| op.drilldown_key(key)).collect::<Vec<_>>())
            }
            _ => Operation::NoOp,
        }
    }

    /// What this operation does to the element at `index`; `NoOp` when it has
    /// no well-defined per-element effect.
    pub fn drilldown_index(&self, index: usize) -> Operation {
        match self {
            Operation::Map { op } => (**op).clone(),
            Operation::Set { old, new } => {
                let o = old.as_ref().and_then(|v| v.get(index)).cloned();
                let n = new.as_ref().and_then(|v| v.get(index)).cloned();
                Operation::Set { old: o, new: n }.simplify()
            }
            Operation::List { ops } => compose_list(
                ops.iter()
                    .map(|op| op.drilldown_index(index))
                    .collect::<Vec<_>>(),
            ),
            _ => Operation::NoOp,
        }
    }

    /// Net element-count change this operation induces on a sub-sequence of
    /// `old_len` elements. Part of the contract hunk operations provide so a
    /// patch knows how indices shift.
    pub(crate) fn length_change(&self, old_len: usize) -> Result<i64, OtError> {
        match self {
            Operation::Set { new, .. } => match new {
                Some(v) => Ok(seq_len(v)? as i64 - old_len as i64),
                None => Err(OtError::Type(String::from(
                    "a hunk set cannot produce a missing value",
                ))),
            },
            Operation::Patch { hunks } => {
                let mut total = 0i64;
                for h in hunks {
                    total += h.op.length_change(h.length)?;
                }
                Ok(total)
            }
            Operation::List { ops } => {
                let mut len = old_len as i64;
                let mut total = 0i64;
                for op in ops {
                    let d = op.length_change(len.max(0) as usize)?;
                    total += d;
                    len += d;
                }
                Ok(total)
            }
            _ => Ok(0),
        }
    }

    /// Split this operation at element `at` of its input range. Required on
    /// `NoOp` and `Set` (which splits its old side; the left part carries the
    /// whole new value, the right part becomes a deletion), supported on
    /// `Map`; everything else refuses.
    pub(crate) fn decompose(&self, at: usize) -> Option<(Operation, Operation)> {
        match self {
            Operation::NoOp => Some((Operation::NoOp, Operation::NoOp)),
            Operation::Map { .. } => Some((self.clone(), self.clone())),
            Operation::Set {
                old: Some(o),
                new: Some(n),
            } => {
                let (left_old, right_old) = split_seq(o, at)?;
                let empty = empty_like(n)?;
                Some((
                    Operation::Set {
                        old: Some(left_old),
                        new: Some(n.clone()),
                    },
                    Operation::Set {
                        old: Some(right_old),
                        new: Some(empty),
                    },
                ))
            }
            _ => None,
        }
    }
}

fn math_identity(op: &MathOp) -> bool {
    match op {
        MathOp::Add(n) => *n == 0.0,
        MathOp::Mult(n) => *n == 1.0,
        MathOp::Rot { inc, .. } => *inc == 0,
        MathOp::Xor(BitOperand::Int(0)) => true,
        MathOp::Xor(BitOperand::Bool(false)) => true,
        MathOp::And(BitOperand::Int(-1)) => true,
        MathOp::And(BitOperand::Bool(true)) => true,
        MathOp::Or(BitOperand::Int(0)) => true,
        MathOp::Or(BitOperand::Bool(false)) => true,
        _ => false,
    }
}

fn simplify_patch(hunks: &[Hunk]) -> Operation {
    let mut out: Vec<Hunk> = Vec::new();
    // offset carried over from dropped identity hunks
    let mut carry = 0usize;
    for h in hunks {
        let op = h.op.simplify();
        let identity = matches!(op, Operation::NoOp) || (h.length == 0 && op_inserts_nothing(&op));
        if identity {
            carry += h.offset + h.length;
            continue;
        }
        let offset = h.offset + carry;
        carry = 0;
        if offset == 0 {
            if let Some(prev) = out.last_mut() {
                if let Some(merged) = coalesce_sets(prev, h.length, &op) {
                    *prev = merged;
                    continue;
                }
            }
        }
        out.push(Hunk {
            offset,
            length: h.length,
            op,
        });
    }
    if out.is_empty() {
        Operation::NoOp
    } else {
        Operation::Patch { hunks: out }
    }
}

fn op_inserts_nothing(op: &Operation) -> bool {
    op.length_change(0).map(|d| d == 0).unwrap_or(false)
}

fn coalesce_sets(prev: &Hunk, length: usize, op: &Operation) -> Option<Hunk> {
    let (po, pn) = match &prev.op {
        Operation::Set {
            old: Some(po),
            new: Some(pn),
        } => (po, pn),
        _ => return None,
    };
    let (o, n) = match op {
        Operation::Set {
            old: Some(o),
            new: Some(n),
        } => (o, n),
        _ => return None,
    };
    Some(Hunk {
        offset: prev.offset,
        length: prev.length + length,
        op: Operation::Set {
            old: Some(concat_seq(po, o)?),
            new: Some(concat_seq(pn, n)?),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_of_identical_sides_simplifies_away() {
        let op = Operation::new_set(json!(5), json!(5));
        assert_eq!(op.simplify(), Operation::NoOp);
        assert_ne!(
            Operation::new_set(json!(5), json!(6)).simplify(),
            Operation::NoOp
        );
    }

    #[test]
    fn math_identities_simplify_away() {
        for op in [
            MathOp::Add(0.0),
            MathOp::Mult(1.0),
            MathOp::Rot { inc: 0, modulus: 4 },
            MathOp::Xor(BitOperand::Int(0)),
            MathOp::Or(BitOperand::Bool(false)),
        ] {
            assert_eq!(Operation::Math { op }.simplify(), Operation::NoOp);
        }
        assert_ne!(
            Operation::Math { op: MathOp::Add(1.0) }.simplify(),
            Operation::NoOp
        );
    }

    #[test]
    fn rot_modulus_is_validated_and_increment_normalised() {
        assert!(Operation::try_new_math(MathOp::Rot { inc: 1, modulus: 0 }).is_err());
        let op = Operation::try_new_math(MathOp::Rot {
            inc: -1,
            modulus: 4,
        })
        .unwrap();
        assert_eq!(
            op,
            Operation::Math {
                op: MathOp::Rot { inc: 3, modulus: 4 }
            }
        );
    }

    #[test]
    fn patch_rejects_list_hunks() {
        let hunk = Hunk {
            offset: 0,
            length: 1,
            op: Operation::List {
                ops: vec![Operation::NoOp],
            },
        };
        assert!(Operation::try_new_patch(vec![hunk]).is_err());
    }

    #[test]
    fn splice_sides_must_be_sequences_of_one_kind() {
        assert!(Operation::try_new_splice(0, json!("ab"), json!([1])).is_err());
        assert!(Operation::try_new_splice(0, json!(3), json!(4)).is_err());
        assert!(Operation::try_new_splice(1, json!("ab"), json!("xyz")).is_ok());
    }

    #[test]
    fn identity_hunks_are_dropped_with_their_offsets() {
        let patch = Operation::Patch {
            hunks: vec![
                Hunk {
                    offset: 0,
                    length: 2,
                    op: Operation::NoOp,
                },
                Hunk {
                    offset: 1,
                    length: 1,
                    op: Operation::new_set(json!("c"), json!("X")),
                },
            ],
        };
        assert_eq!(
            patch.simplify(),
            Operation::Patch {
                hunks: vec![Hunk {
                    offset: 3,
                    length: 1,
                    op: Operation::new_set(json!("c"), json!("X")),
                }]
            }
        );
    }

    #[test]
    fn adjacent_set_hunks_coalesce() {
        let patch = Operation::Patch {
            hunks: vec![
                Hunk {
                    offset: 0,
                    length: 1,
                    op: Operation::new_set(json!("a"), json!("x")),
                },
                Hunk {
                    offset: 0,
                    length: 1,
                    op: Operation::new_set(json!("b"), json!("yz")),
                },
            ],
        };
        assert_eq!(
            patch.simplify(),
            Operation::Patch {
                hunks: vec![Hunk {
                    offset: 0,
                    length: 2,
                    op: Operation::new_set(json!("ab"), json!("xyz")),
                }]
            }
        );
    }

    #[test]
    fn ren_drops_identity_entries() {
        let mut map = BTreeMap::new();
        map.insert(String::from("a"), String::from("a"));
        map.insert(String::from("b"), String::from("c"));
        let out = Operation::new_ren(map).simplify();
        let mut expected = BTreeMap::new();
        expected.insert(String::from("b"), String::from("c"));
        assert_eq!(out, Operation::Ren { map: expected });

        let mut identity = BTreeMap::new();
        identity.insert(String::from("a"), String::from("a"));
        assert_eq!(Operation::new_ren(identity).simplify(), Operation::NoOp);
    }

    #[test]
    fn degenerate_moves_simplify_away() {
        assert_eq!(Operation::new_move(2, 0, 5).simplify(), Operation::NoOp);
        assert_eq!(Operation::new_move(3, 2, 3).simplify(), Operation::NoOp);
        assert_ne!(Operation::new_move(3, 2, 1).simplify(), Operation::NoOp);
    }

    #[test]
    fn list_simplification_flattens_and_unwraps() {
        let inner = Operation::List {
            ops: vec![Operation::NoOp, Operation::new_set(json!(1), json!(2))],
        };
        let outer = Operation::List {
            ops: vec![Operation::NoOp, inner],
        };
        assert_eq!(outer.simplify(), Operation::new_set(json!(1), json!(2)));
        assert_eq!(
            Operation::List { ops: vec![] }.simplify(),
            Operation::NoOp
        );
    }

    #[test]
    fn drilldown_narrows_sets_and_applies() {
        let apply = Operation::new_apply("k", Operation::new_set(json!(1), json!(2)));
        assert_eq!(
            apply.drilldown_key("k"),
            Operation::new_set(json!(1), json!(2))
        );
        assert_eq!(apply.drilldown_key("other"), Operation::NoOp);

        let set = Operation::new_set(json!({"a": 1, "b": 9}), json!({"a": 2, "b": 9}));
        assert_eq!(
            set.drilldown_key("a"),
            Operation::new_set(json!(1), json!(2))
        );
        assert_eq!(set.drilldown_key("b"), Operation::NoOp);

        let set = Operation::new_set(json!([1, 2]), json!([1, 5]));
        assert_eq!(
            set.drilldown_index(1),
            Operation::new_set(json!(2), json!(5))
        );
    }

    #[test]
    fn decompose_splits_sets_at_the_old_index() {
        let set = Operation::new_set(json!("abc"), json!("Z"));
        let (l, r) = set.decompose(1).unwrap();
        assert_eq!(l, Operation::new_set(json!("a"), json!("Z")));
        assert_eq!(r, Operation::new_set(json!("bc"), json!("")));
        assert!(
            Operation::Math { op: MathOp::Add(1.0) }
                .decompose(1)
                .is_none()
        );
    }

    #[test]
    fn display_is_compact() {
        let op = Operation::new_apply("count", Operation::Math { op: MathOp::Add(2.0) });
        assert_eq!(op.to_string(), "apply {count: math add 2}");
    }
}
