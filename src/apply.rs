//! Application semantics: computing the document an operation produces, and
//! inverses.
//!
//! The crate-internal entry point works on slots (`Option<&Value>`, `None` =
//! Missing) so that operations nested under an object `Apply` can see and
//! produce absent properties. The public [`Operation::apply_to`] wraps it for
//! live documents.

use serde_json::{Number, Value};

use crate::OtError;
use crate::compose::compose_list;
use crate::operation::{BitOperand, Hunk, MathOp, Operation};
use crate::value::{Elems, kind_name};

impl Operation {
    /// Apply this operation to a document.
    ///
    /// Fails with an [`OtError`] when the operation is outside its domain:
    /// the document has the wrong type, an index or key is out of range, or a
    /// `Set`'s recorded old side disagrees with the live value.
    pub fn apply_to(&self, doc: &Value) -> Result<Value, OtError> {
        match self.apply_slot(Some(doc))? {
            Some(v) => Ok(v),
            None => Err(OtError::Type(String::from(
                "operation removed the whole document",
            ))),
        }
    }

    pub(crate) fn apply_slot(&self, slot: Option<&Value>) -> Result<Option<Value>, OtError> {
        match self {
            Operation::NoOp => Ok(slot.cloned()),
            Operation::Set { old, new } => {
                if old.as_ref() != slot {
                    return Err(OtError::OldMismatch(format!(
                        "set expected {}, found {}",
                        display_slot(old.as_ref()),
                        display_slot(slot)
                    )));
                }
                Ok(new.clone())
            }
            Operation::Math { op } => {
                let doc = slot.ok_or_else(|| {
                    OtError::Type(String::from("math cannot apply to a missing value"))
                })?;
                math_apply(op, doc).map(Some)
            }
            Operation::Patch { hunks } => {
                let doc = slot.ok_or_else(|| {
                    OtError::Type(String::from("patch cannot apply to a missing value"))
                })?;
                apply_patch(hunks, doc).map(Some)
            }
            Operation::Map { op } => {
                let doc = slot.ok_or_else(|| {
                    OtError::Type(String::from("map cannot apply to a missing value"))
                })?;
                apply_map(op, doc).map(Some)
            }
            Operation::Move {
                pos,
                count,
                new_pos,
            } => {
                let doc = slot.ok_or_else(|| {
                    OtError::Type(String::from("move cannot apply to a missing value"))
                })?;
                apply_move(*pos, *count, *new_pos, doc).map(Some)
            }
            Operation::Apply { ops } => {
                let obj = match slot {
                    Some(Value::Object(o)) => o,
                    Some(other) => {
                        return Err(OtError::Type(format!(
                            "apply expects an object, got {}",
                            kind_name(other)
                        )));
                    }
                    None => {
                        return Err(OtError::Type(String::from(
                            "apply cannot work on a missing value",
                        )));
                    }
                };
                let mut out = obj.clone();
                for (key, op) in ops {
                    let current = obj.get(key).cloned();
                    match op.apply_slot(current.as_ref())? {
                        Some(v) => {
                            out.insert(key.clone(), v);
                        }
                        None => {
                            out.remove(key);
                        }
                    }
                }
                Ok(Some(Value::Object(out)))
            }
            Operation::Ren { map } => {
                let obj = match slot {
                    Some(Value::Object(o)) => o,
                    Some(other) => {
                        return Err(OtError::Type(format!(
                            "ren expects an object, got {}",
                            kind_name(other)
                        )));
                    }
                    None => {
                        return Err(OtError::Type(String::from(
                            "ren cannot work on a missing value",
                        )));
                    }
                };
                let mut out = obj.clone();
                // first pass: every target takes the value at its source,
                // read from the original snapshot so duplication is safe
                for (new_key, old_key) in map {
                    if let Some(v) = obj.get(old_key) {
                        out.insert(new_key.clone(), v.clone());
                    }
                }
                // second pass: drop sources that are not themselves targets
                for old_key in map.values() {
                    if !map.contains_key(old_key) {
                        out.remove(old_key);
                    }
                }
                Ok(Some(Value::Object(out)))
            }
            Operation::List { ops } => {
                let mut state = slot.cloned();
                for op in ops {
                    state = op.apply_slot(state.as_ref())?;
                }
                Ok(state)
            }
        }
    }

    /// The operation that undoes this one; `prior` is the document this
    /// operation applies to. Lossy forms fall back to a `Set` that restores
    /// `prior` wholesale.
    pub fn inverse(&self, prior: &Value) -> Result<Operation, OtError> {
        self.inverse_slot(Some(prior))
    }

    pub(crate) fn inverse_slot(&self, prior: Option<&Value>) -> Result<Operation, OtError> {
        if let Some(pure) = self.inverse_pure() {
            return Ok(pure);
        }
        match self {
            Operation::Patch { hunks } => {
                let doc = prior.ok_or_else(|| {
                    OtError::Type(String::from("patch inverse needs the prior document"))
                })?;
                let src = Elems::from_value(doc)?;
                let mut out = Vec::with_capacity(hunks.len());
                let mut idx = 0usize;
                for h in hunks {
                    let start = idx + h.offset;
                    let end = start + h.length;
                    if end > src.len() {
                        return Err(OtError::Index(format!(
                            "hunk {start}..{end} outside document of length {}",
                            src.len()
                        )));
                    }
                    let sub = src.sub_value(start, end);
                    let delta = h.op.length_change(h.length)?;
                    out.push(Hunk {
                        offset: h.offset,
                        length: (h.length as i64 + delta).max(0) as usize,
                        op: h.op.inverse_slot(Some(&sub))?,
                    });
                    idx = end;
                }
                Ok(Operation::Patch { hunks: out })
            }
            Operation::Apply { ops } => {
                let obj = match prior {
                    Some(Value::Object(o)) => o,
                    _ => {
                        return Err(OtError::Type(String::from(
                            "apply inverse needs the prior object",
                        )));
                    }
                };
                let mut out = std::collections::BTreeMap::new();
                for (key, op) in ops {
                    out.insert(key.clone(), op.inverse_slot(obj.get(key))?);
                }
                Ok(Operation::Apply { ops: out })
            }
            Operation::Ren { map } => {
                let obj = match prior {
                    Some(Value::Object(o)) => o,
                    _ => {
                        return Err(OtError::Type(String::from(
                            "ren inverse needs the prior object",
                        )));
                    }
                };
                // a rename inverts as a rename only when it neither
                // overwrites an existing target nor duplicates a source
                let clobbers = map
                    .iter()
                    .any(|(new_key, old_key)| new_key != old_key && obj.contains_key(new_key));
                let mut inverted = std::collections::BTreeMap::new();
                let mut duplicates = false;
                for (new_key, old_key) in map {
                    if inverted.insert(old_key.clone(), new_key.clone()).is_some() {
                        duplicates = true;
                    }
                }
                if clobbers || duplicates {
                    return self.inverse_by_restore(prior);
                }
                Ok(Operation::Ren { map: inverted })
            }
            Operation::List { ops } => {
                let mut state = prior.cloned();
                let mut inverses = Vec::with_capacity(ops.len());
                for op in ops {
                    inverses.push(op.inverse_slot(state.as_ref())?);
                    state = op.apply_slot(state.as_ref())?;
                }
                inverses.reverse();
                Ok(compose_list(inverses))
            }
            _ => self.inverse_by_restore(prior),
        }
    }

    /// Restore `prior` wholesale; valid as an inverse for any operation.
    fn inverse_by_restore(&self, prior: Option<&Value>) -> Result<Operation, OtError> {
        let after = self.apply_slot(prior)?;
        Ok(Operation::Set {
            old: after,
            new: prior.cloned(),
        }
        .simplify())
    }

    /// The inverse when it can be written down without the prior document.
    pub(crate) fn inverse_pure(&self) -> Option<Operation> {
        match self {
            Operation::NoOp => Some(Operation::NoOp),
            Operation::Set { old, new } => Some(Operation::Set {
                old: new.clone(),
                new: old.clone(),
            }),
            Operation::Math { op } => {
                let inv = match op {
                    MathOp::Add(n) => MathOp::Add(-n),
                    MathOp::Mult(n) if *n != 0.0 => MathOp::Mult(1.0 / n),
                    MathOp::Rot { inc, modulus } => MathOp::Rot {
                        inc: (-inc).rem_euclid(*modulus),
                        modulus: *modulus,
                    },
                    MathOp::Xor(o) => MathOp::Xor(*o),
                    MathOp::Not => MathOp::Not,
                    _ => return None,
                };
                Some(Operation::Math { op: inv })
            }
            Operation::Move {
                pos,
                count,
                new_pos,
            } => Some(Operation::Move {
                pos: *new_pos,
                count: *count,
                new_pos: *pos,
            }),
            Operation::Patch { hunks } => {
                let mut out = Vec::with_capacity(hunks.len());
                for h in hunks {
                    let delta = h.op.length_change(h.length).ok()?;
                    out.push(Hunk {
                        offset: h.offset,
                        length: (h.length as i64 + delta).max(0) as usize,
                        op: h.op.inverse_pure()?,
                    });
                }
                Some(Operation::Patch { hunks: out })
            }
            Operation::Map { op } => op
                .inverse_pure()
                .map(|inv| Operation::Map { op: Box::new(inv) }),
            Operation::Apply { ops } => {
                let mut out = std::collections::BTreeMap::new();
                for (key, op) in ops {
                    out.insert(key.clone(), op.inverse_pure()?);
                }
                Some(Operation::Apply { ops: out })
            }
            // whether a rename is invertible depends on the prior document
            // (an existing target key would be silently overwritten)
            Operation::Ren { .. } => None,
            Operation::List { ops } => {
                let mut inverses = Vec::with_capacity(ops.len());
                for op in ops.iter().rev() {
                    inverses.push(op.inverse_pure()?);
                }
                Some(compose_list(inverses))
            }
        }
    }
}

fn display_slot(slot: Option<&Value>) -> String {
    match slot {
        Some(v) => v.to_string(),
        None => String::from("(missing)"),
    }
}

fn apply_patch(hunks: &[Hunk], doc: &Value) -> Result<Value, OtError> {
    let src = Elems::from_value(doc)?;
    let mut out = src.empty_like();
    let mut idx = 0usize;
    for h in hunks {
        let start = idx + h.offset;
        let end = start + h.length;
        if end > src.len() {
            return Err(OtError::Index(format!(
                "hunk {start}..{end} outside document of length {}",
                src.len()
            )));
        }
        out.extend_from(&src, idx, start);
        let sub = src.sub_value(start, end);
        let replaced = h.op.apply_to(&sub)?;
        out.append_value(&replaced)?;
        idx = end;
    }
    out.extend_from(&src, idx, src.len());
    Ok(out.into_value())
}

fn apply_map(op: &Operation, doc: &Value) -> Result<Value, OtError> {
    match doc {
        Value::String(s) => {
            let mut out = String::with_capacity(s.len());
            for ch in s.chars() {
                let elem = Value::String(ch.to_string());
                match op.apply_to(&elem)? {
                    Value::String(r) if r.chars().count() == 1 => out.push_str(&r),
                    other => {
                        return Err(OtError::Type(format!(
                            "map over a string must keep single characters, got {other}"
                        )));
                    }
                }
            }
            Ok(Value::String(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(op.apply_to(item)?);
            }
            Ok(Value::Array(out))
        }
        other => Err(OtError::Type(format!(
            "map expects a sequence, got {}",
            kind_name(other)
        ))),
    }
}

fn apply_move(pos: usize, count: usize, new_pos: usize, doc: &Value) -> Result<Value, OtError> {
    let mut elems = Elems::from_value(doc)?;
    if pos + count > elems.len() {
        return Err(OtError::Index(format!(
            "move range {pos}+{count} outside document of length {}",
            elems.len()
        )));
    }
    let cut = elems.drain(pos, pos + count);
    if new_pos > elems.len() {
        return Err(OtError::Index(format!(
            "move target {new_pos} outside remainder of length {}",
            elems.len()
        )));
    }
    elems.insert_at(new_pos, cut);
    Ok(elems.into_value())
}

pub(crate) fn math_apply(op: &MathOp, doc: &Value) -> Result<Value, OtError> {
    match (op, doc) {
        (MathOp::Add(n), Value::Number(d)) => number_arith(d, *n, |a, b| a + b, i64::checked_add),
        (MathOp::Mult(n), Value::Number(d)) => number_arith(d, *n, |a, b| a * b, i64::checked_mul),
        (MathOp::Rot { inc, modulus }, Value::Number(d)) => {
            let i = d
                .as_i64()
                .ok_or_else(|| OtError::Domain(format!("rot needs an integer, got {d}")))?;
            if i < 0 || i >= *modulus {
                return Err(OtError::Domain(format!(
                    "rot input {i} outside [0, {modulus})"
                )));
            }
            Ok(Value::from((i + inc).rem_euclid(*modulus)))
        }
        (MathOp::And(o), d) => bitwise(d, o, |a, b| a & b, |a, b| a && b),
        (MathOp::Or(o), d) => bitwise(d, o, |a, b| a | b, |a, b| a || b),
        (MathOp::Xor(o), d) => bitwise(d, o, |a, b| a ^ b, |a, b| a ^ b),
        (MathOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (MathOp::Not, Value::Number(d)) => {
            let i = d
                .as_i64()
                .ok_or_else(|| OtError::Domain(format!("not needs an integer, got {d}")))?;
            Ok(Value::from(!i))
        }
        (op, other) => Err(OtError::Type(format!(
            "math {op} cannot apply to {}",
            kind_name(other)
        ))),
    }
}

fn number_arith(
    d: &Number,
    n: f64,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, OtError> {
    // stay integral when both sides are
    if let (Some(i), Some(ni)) = (d.as_i64(), exact_i64(n)) {
        if let Some(r) = int_op(i, ni) {
            return Ok(Value::from(r));
        }
    }
    let f = float_op(d.as_f64().unwrap_or(f64::NAN), n);
    // keep integral results integral so repeated edits stay exact
    if let Some(i) = exact_i64(f) {
        return Ok(Value::from(i));
    }
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| OtError::Domain(format!("math produced a non-finite number from {d}")))
}

fn exact_i64(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

fn bitwise(
    doc: &Value,
    operand: &BitOperand,
    int_op: fn(i64, i64) -> i64,
    bool_op: fn(bool, bool) -> bool,
) -> Result<Value, OtError> {
    match (doc, operand) {
        (Value::Number(d), BitOperand::Int(x)) => {
            let i = d
                .as_i64()
                .ok_or_else(|| OtError::Domain(format!("bitwise needs an integer, got {d}")))?;
            Ok(Value::from(int_op(i, *x)))
        }
        (Value::Bool(b), BitOperand::Bool(x)) => Ok(Value::Bool(bool_op(*b, *x))),
        (other, _) => Err(OtError::Type(format!(
            "bitwise operand does not match a {} document",
            kind_name(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{RandomDoc, random_op};
    use quickcheck::Gen;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    #[test]
    fn noop_leaves_the_document_alone() {
        let doc = json!({"a": [1, 2]});
        assert_eq!(Operation::NoOp.apply_to(&doc).unwrap(), doc);
    }

    #[test]
    fn set_checks_its_old_side() {
        let op = Operation::new_set(json!(1), json!(2));
        assert_eq!(op.apply_to(&json!(1)).unwrap(), json!(2));
        match op.apply_to(&json!(7)) {
            Err(OtError::OldMismatch(_)) => {}
            other => panic!("expected an old-mismatch error, got {other:?}"),
        }
    }

    #[test]
    fn math_add_and_mult_are_number_only() {
        let add = Operation::Math { op: MathOp::Add(5.0) };
        assert_eq!(add.apply_to(&json!(10)).unwrap(), json!(15));
        assert_eq!(add.apply_to(&json!(1.5)).unwrap(), json!(6.5));
        assert!(matches!(add.apply_to(&json!(true)), Err(OtError::Type(_))));
        assert!(matches!(add.apply_to(&json!("x")), Err(OtError::Type(_))));

        let mult = Operation::Math { op: MathOp::Mult(3.0) };
        assert_eq!(mult.apply_to(&json!(4)).unwrap(), json!(12));
    }

    #[test]
    fn rot_stays_within_its_modulus() {
        let rot = Operation::try_new_math(MathOp::Rot { inc: 2, modulus: 5 }).unwrap();
        assert_eq!(rot.apply_to(&json!(4)).unwrap(), json!(1));
        assert!(matches!(
            rot.apply_to(&json!(5)),
            Err(OtError::Domain(_))
        ));
        assert!(matches!(
            rot.apply_to(&json!(-1)),
            Err(OtError::Domain(_))
        ));
    }

    #[test]
    fn bitwise_works_on_matching_types_only() {
        let xor = Operation::Math {
            op: MathOp::Xor(BitOperand::Bool(true)),
        };
        assert_eq!(xor.apply_to(&json!(true)).unwrap(), json!(false));
        assert!(matches!(xor.apply_to(&json!(3)), Err(OtError::Type(_))));

        let and = Operation::Math {
            op: MathOp::And(BitOperand::Int(0b1100)),
        };
        assert_eq!(and.apply_to(&json!(0b1010)).unwrap(), json!(0b1000));

        let not = Operation::Math { op: MathOp::Not };
        assert_eq!(not.apply_to(&json!(0)).unwrap(), json!(-1));
        assert_eq!(not.apply_to(&json!(false)).unwrap(), json!(true));
    }

    #[test]
    fn patch_walks_hunks_left_to_right() {
        let doc = json!([1, 2, 3, 4, 5]);
        let patch = Operation::Patch {
            hunks: vec![
                Hunk {
                    offset: 1,
                    length: 2,
                    op: Operation::new_set(json!([2, 3]), json!([9])),
                },
                Hunk {
                    offset: 1,
                    length: 1,
                    op: Operation::new_set(json!([5]), json!([5, 6])),
                },
            ],
        };
        assert_eq!(patch.apply_to(&doc).unwrap(), json!([1, 9, 4, 5, 6]));
    }

    #[test]
    fn patch_over_strings_counts_scalar_values() {
        let doc = json!("Hello World!");
        let patch = Operation::try_new_splice(0, json!("Hello"), json!("Goodbye")).unwrap();
        assert_eq!(patch.apply_to(&doc).unwrap(), json!("Goodbye World!"));
    }

    #[test]
    fn patch_bounds_are_checked() {
        let patch = Operation::try_new_splice(2, json!("abc"), json!("x")).unwrap();
        assert!(matches!(
            patch.apply_to(&json!("abcd")),
            Err(OtError::Index(_))
        ));
    }

    #[test]
    fn map_keeps_strings_single_character() {
        let doc = json!("aaa");
        let map = Operation::new_map(Operation::new_set(json!("a"), json!("b")));
        assert_eq!(map.apply_to(&doc).unwrap(), json!("bbb"));

        let widening = Operation::new_map(Operation::new_set(json!("a"), json!("xy")));
        assert!(matches!(widening.apply_to(&doc), Err(OtError::Type(_))));
    }

    #[test]
    fn map_over_arrays_applies_element_wise() {
        let doc = json!([1, 2, 3]);
        let map = Operation::new_map(Operation::Math { op: MathOp::Add(1.0) });
        assert_eq!(map.apply_to(&doc).unwrap(), json!([2, 3, 4]));
    }

    #[test]
    fn move_relocates_against_the_remainder() {
        let doc = json!([1, 2, 3, 4]);
        let mv = Operation::new_move(0, 2, 1);
        let moved = mv.apply_to(&doc).unwrap();
        assert_eq!(moved, json!([3, 1, 2, 4]));

        let back = mv.inverse(&doc).unwrap();
        assert_eq!(back, Operation::new_move(1, 2, 0));
        assert_eq!(back.apply_to(&moved).unwrap(), doc);
    }

    #[test]
    fn apply_threads_missing_through_its_keys() {
        let doc = json!({"a": 1});
        let put = Operation::new_put("b", json!(2));
        assert_eq!(put.apply_to(&doc).unwrap(), json!({"a": 1, "b": 2}));

        let remove = Operation::new_remove("a", json!(1));
        assert_eq!(remove.apply_to(&doc).unwrap(), json!({}));

        // creating a key that exists trips the old-side check
        let clash = Operation::new_put("a", json!(9));
        assert!(matches!(
            clash.apply_to(&doc),
            Err(OtError::OldMismatch(_))
        ));
    }

    #[test]
    fn ren_is_two_pass_and_snapshot_based() {
        let doc = json!({"a": 1, "b": 2});
        // swap via simultaneous assignment
        let mut map = std::collections::BTreeMap::new();
        map.insert(String::from("a"), String::from("b"));
        map.insert(String::from("b"), String::from("a"));
        let swap = Operation::new_ren(map);
        assert_eq!(swap.apply_to(&doc).unwrap(), json!({"a": 2, "b": 1}));

        // self-map preserves while duplicating
        let mut map = std::collections::BTreeMap::new();
        map.insert(String::from("a"), String::from("a"));
        map.insert(String::from("c"), String::from("a"));
        let dup = Operation::new_ren(map);
        assert_eq!(dup.apply_to(&doc).unwrap(), json!({"a": 1, "b": 2, "c": 1}));

        // plain rename drops the source
        let ren = Operation::new_rename("a", "z");
        assert_eq!(ren.apply_to(&doc).unwrap(), json!({"b": 2, "z": 1}));
    }

    #[test]
    fn list_applies_left_to_right() {
        let doc = json!(1);
        let list = Operation::List {
            ops: vec![
                Operation::new_set(json!(1), json!(10)),
                Operation::Math { op: MathOp::Add(5.0) },
            ],
        };
        assert_eq!(list.apply_to(&doc).unwrap(), json!(15));
    }

    #[test]
    fn inverse_of_a_patch_restores_the_document() {
        let doc = json!("abcd");
        let patch = Operation::try_new_splice(1, json!("bc"), json!("XYZ")).unwrap();
        let applied = patch.apply_to(&doc).unwrap();
        assert_eq!(applied, json!("aXYZd"));
        let inv = patch.inverse(&doc).unwrap();
        assert_eq!(inv.apply_to(&applied).unwrap(), doc);
    }

    #[test]
    fn lossy_math_inverts_by_restoring_the_prior() {
        let doc = json!(0b1010);
        let and = Operation::Math {
            op: MathOp::And(BitOperand::Int(0b0110)),
        };
        let applied = and.apply_to(&doc).unwrap();
        let inv = and.inverse(&doc).unwrap();
        assert_eq!(inv.apply_to(&applied).unwrap(), doc);
    }

    #[test]
    fn non_bijective_ren_inverts_by_restoring_the_prior() {
        let doc = json!({"a": 1});
        let mut map = std::collections::BTreeMap::new();
        map.insert(String::from("x"), String::from("a"));
        map.insert(String::from("y"), String::from("a"));
        let dup = Operation::new_ren(map);
        let applied = dup.apply_to(&doc).unwrap();
        assert_eq!(applied, json!({"x": 1, "y": 1}));
        let inv = dup.inverse(&doc).unwrap();
        assert_eq!(inv.apply_to(&applied).unwrap(), doc);
    }

    #[quickcheck]
    fn inverse_round_trips(doc: RandomDoc) -> bool {
        let mut g = Gen::new(8);
        let d = doc.0;
        let op = random_op(&d, &mut g);
        let applied = match op.apply_to(&d) {
            Ok(v) => v,
            Err(_) => return true,
        };
        let inv = match op.inverse(&d) {
            Ok(i) => i,
            Err(_) => return false,
        };
        inv.apply_to(&applied).ok() == Some(d)
    }

    #[quickcheck]
    fn simplify_preserves_application(doc: RandomDoc) -> bool {
        let mut g = Gen::new(8);
        let d = doc.0;
        let op = random_op(&d, &mut g);
        let simplified = op.simplify();
        op.apply_to(&d).ok() == simplified.apply_to(&d).ok()
            && simplified == simplified.simplify()
    }
}
