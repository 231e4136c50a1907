//! Random documents and document-valid random operations for the
//! property-based harness.
//!
//! [`random_op`] inspects the document and only produces operations that
//! apply cleanly to it: patch hunks carry real slices as their old sides,
//! rotations get a modulus above the current value, object edits target real
//! (or verifiably fresh) keys. Generated numbers are kept integral so the
//! algebraic properties can be checked with exact equality.

use std::collections::BTreeMap;

use quickcheck::{Arbitrary, Gen};
use serde_json::{Map, Value, json};

use crate::operation::{BitOperand, Hunk, MathOp, Operation};

/// A small random JSON document, for use as a quickcheck argument.
#[derive(Clone, Debug)]
pub struct RandomDoc(pub Value);

impl Arbitrary for RandomDoc {
    fn arbitrary(g: &mut Gen) -> RandomDoc {
        RandomDoc(random_value(g))
    }
}

/// A small random JSON value (numbers are always integers).
pub fn random_value(g: &mut Gen) -> Value {
    random_value_depth(g, 2)
}

fn random_value_depth(g: &mut Gen, depth: usize) -> Value {
    let variants = if depth == 0 { 4 } else { 6 };
    match u8::arbitrary(g) % variants {
        0 => Value::Null,
        1 => json!(bool::arbitrary(g)),
        2 => json!(small_int(g)),
        3 => Value::String(random_text(g)),
        4 => {
            let len = usize::arbitrary(g) % 4;
            Value::Array((0..len).map(|_| random_value_depth(g, depth - 1)).collect())
        }
        _ => {
            let len = usize::arbitrary(g) % 4;
            let mut map = Map::new();
            for _ in 0..len {
                map.insert(random_key(g), random_value_depth(g, depth - 1));
            }
            Value::Object(map)
        }
    }
}

fn small_int(g: &mut Gen) -> i64 {
    i64::arbitrary(g).rem_euclid(50)
}

fn random_text(g: &mut Gen) -> String {
    let letters = ['a', 'b', 'c', 'd', 'e', 'x', 'y', 'z'];
    let len = usize::arbitrary(g) % 6;
    (0..len)
        .map(|_| *g.choose(&letters).unwrap_or(&'a'))
        .collect()
}

fn random_key(g: &mut Gen) -> String {
    let keys = ["alpha", "beta", "gamma", "delta"];
    (*g.choose(&keys).unwrap_or(&"alpha")).to_string()
}

/// A random operation valid on `doc`, drawn from the full operation universe.
pub fn random_op(doc: &Value, g: &mut Gen) -> Operation {
    if u8::arbitrary(g) % 8 == 0 {
        // a short sequence, the second step valid on the intermediate state
        let first = random_single_op(doc, g);
        if let Ok(half) = first.apply_to(doc) {
            let second = random_single_op(&half, g);
            return Operation::List {
                ops: vec![first, second],
            };
        }
        return first;
    }
    random_single_op(doc, g)
}

fn random_single_op(doc: &Value, g: &mut Gen) -> Operation {
    let mut choices: Vec<fn(&Value, &mut Gen) -> Option<Operation>> =
        vec![|_, _| Some(Operation::NoOp), |d, g| {
            Some(Operation::Set {
                old: Some(d.clone()),
                new: Some(random_value(g)),
            })
        }];
    match doc {
        Value::Number(_) | Value::Bool(_) => choices.push(|d, g| random_math(d, g)),
        Value::String(_) | Value::Array(_) => {
            choices.push(|d, g| random_patch(d, g));
            choices.push(|d, g| random_move(d, g));
            choices.push(|d, g| random_element_map(d, g));
        }
        Value::Object(_) => {
            choices.push(|d, g| random_object_apply(d, g));
            choices.push(|d, g| random_object_ren(d, g));
        }
        Value::Null => {}
    }
    for _ in 0..4 {
        if let Some(pick) = g.choose(&choices) {
            if let Some(op) = pick(doc, g) {
                return op;
            }
        }
    }
    Operation::NoOp
}

/// The deterministic-rebase subset used by the rebase law properties:
/// everything whose pairwise rebases either succeed deterministically or
/// conflict cleanly (no `Move`, `Map` or `List`).
pub(crate) fn random_rebase_op(doc: &Value, g: &mut Gen) -> Operation {
    let mut choices: Vec<fn(&Value, &mut Gen) -> Option<Operation>> =
        vec![|_, _| Some(Operation::NoOp), |d, g| {
            Some(Operation::Set {
                old: Some(d.clone()),
                new: Some(random_value(g)),
            })
        }];
    match doc {
        Value::Number(_) | Value::Bool(_) => choices.push(|d, g| random_math(d, g)),
        Value::String(_) | Value::Array(_) => choices.push(|d, g| random_patch(d, g)),
        Value::Object(_) => {
            choices.push(|d, g| random_rebase_object_apply(d, g));
            choices.push(|d, g| random_object_ren(d, g));
        }
        Value::Null => {}
    }
    for _ in 0..4 {
        if let Some(pick) = g.choose(&choices) {
            if let Some(op) = pick(doc, g) {
                return op;
            }
        }
    }
    Operation::NoOp
}

fn random_math(doc: &Value, g: &mut Gen) -> Option<Operation> {
    match doc {
        Value::Bool(_) => {
            let op = match u8::arbitrary(g) % 4 {
                0 => MathOp::And(BitOperand::Bool(bool::arbitrary(g))),
                1 => MathOp::Or(BitOperand::Bool(bool::arbitrary(g))),
                2 => MathOp::Xor(BitOperand::Bool(bool::arbitrary(g))),
                _ => MathOp::Not,
            };
            Some(Operation::Math { op })
        }
        Value::Number(n) => {
            let i = n.as_i64()?;
            let op = match u8::arbitrary(g) % 6 {
                0 => MathOp::Add(small_int(g) as f64 - 10.0),
                // reciprocals of powers of two stay exact
                1 => MathOp::Mult(*g.choose(&[2.0, 4.0, -2.0]).unwrap_or(&2.0)),
                2 if i >= 0 => MathOp::Rot {
                    inc: small_int(g).rem_euclid(i + 1 + small_int(g) % 5 + 1),
                    modulus: i + 1 + small_int(g) % 5,
                },
                3 => MathOp::And(BitOperand::Int(small_int(g))),
                4 => MathOp::Or(BitOperand::Int(small_int(g))),
                _ => MathOp::Xor(BitOperand::Int(small_int(g))),
            };
            // normalise the rot increment into its modulus
            if let MathOp::Rot { inc, modulus } = op {
                if modulus <= i {
                    return None;
                }
                return Some(Operation::Math {
                    op: MathOp::Rot {
                        inc: inc.rem_euclid(modulus),
                        modulus,
                    },
                });
            }
            Some(Operation::Math { op })
        }
        _ => None,
    }
}

fn seq_parts(doc: &Value) -> Option<(usize, bool)> {
    match doc {
        Value::String(s) => Some((s.chars().count(), true)),
        Value::Array(a) => Some((a.len(), false)),
        _ => None,
    }
}

fn slice_of(doc: &Value, start: usize, end: usize) -> Value {
    match doc {
        Value::String(s) => Value::String(s.chars().skip(start).take(end - start).collect()),
        Value::Array(a) => Value::Array(a[start..end].to_vec()),
        _ => Value::Null,
    }
}

fn random_replacement(is_string: bool, g: &mut Gen) -> Value {
    if is_string {
        Value::String(random_text(g))
    } else {
        let len = usize::arbitrary(g) % 3;
        Value::Array((0..len).map(|_| json!(small_int(g))).collect())
    }
}

fn random_patch(doc: &Value, g: &mut Gen) -> Option<Operation> {
    let (len, is_string) = seq_parts(doc)?;
    let hunk_count = 1 + usize::arbitrary(g) % 2;
    let mut hunks = Vec::new();
    let mut cursor = 0usize;
    for _ in 0..hunk_count {
        if cursor > len {
            break;
        }
        let start = cursor + usize::arbitrary(g) % (len - cursor + 1);
        let length = usize::arbitrary(g) % (len - start + 1).min(3);
        hunks.push(Hunk {
            offset: start - cursor,
            length,
            op: Operation::Set {
                old: Some(slice_of(doc, start, start + length)),
                new: Some(random_replacement(is_string, g)),
            },
        });
        cursor = start + length;
    }
    if hunks.is_empty() {
        return None;
    }
    Some(Operation::Patch { hunks })
}

fn random_move(doc: &Value, g: &mut Gen) -> Option<Operation> {
    let (len, _) = seq_parts(doc)?;
    if len < 2 {
        return None;
    }
    let count = 1 + usize::arbitrary(g) % 2.min(len - 1);
    let pos = usize::arbitrary(g) % (len - count + 1);
    let new_pos = usize::arbitrary(g) % (len - count + 1);
    Some(Operation::Move {
        pos,
        count,
        new_pos,
    })
}

fn random_element_map(doc: &Value, g: &mut Gen) -> Option<Operation> {
    // only arrays of integers support a uniformly valid inner operation
    let items = doc.as_array()?;
    if items.is_empty() || !items.iter().all(|v| v.as_i64().is_some()) {
        return None;
    }
    Some(Operation::new_map(Operation::Math {
        op: MathOp::Add(small_int(g) as f64),
    }))
}

fn fresh_key(obj: &Map<String, Value>, g: &mut Gen) -> String {
    let mut key = format!("{}_new", random_key(g));
    while obj.contains_key(&key) {
        key.push('x');
    }
    key
}

fn random_object_apply(doc: &Value, g: &mut Gen) -> Option<Operation> {
    random_object_apply_with(doc, g, random_single_op)
}

fn random_rebase_object_apply(doc: &Value, g: &mut Gen) -> Option<Operation> {
    random_object_apply_with(doc, g, random_rebase_op)
}

fn random_object_apply_with(
    doc: &Value,
    g: &mut Gen,
    inner: fn(&Value, &mut Gen) -> Operation,
) -> Option<Operation> {
    let obj = doc.as_object()?;
    match u8::arbitrary(g) % 3 {
        0 => Some(Operation::new_put(fresh_key(obj, g), random_value(g))),
        1 => {
            let keys: Vec<&String> = obj.keys().collect();
            let key = (*g.choose(&keys)?).clone();
            let value = obj.get(&key)?.clone();
            Some(Operation::new_remove(key, value))
        }
        _ => {
            let keys: Vec<&String> = obj.keys().collect();
            let key = (*g.choose(&keys)?).clone();
            let value = obj.get(&key)?.clone();
            Some(Operation::new_apply(key, inner(&value, g)))
        }
    }
}

fn random_object_ren(doc: &Value, g: &mut Gen) -> Option<Operation> {
    let obj = doc.as_object()?;
    let keys: Vec<&String> = obj.keys().collect();
    let from = (*g.choose(&keys)?).clone();
    let to = fresh_key(obj, g);
    let mut map = BTreeMap::new();
    map.insert(to, from);
    Some(Operation::Ren { map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn generated_operations_apply_cleanly(doc: RandomDoc) -> bool {
        let mut g = Gen::new(8);
        let op = random_op(&doc.0, &mut g);
        op.apply_to(&doc.0).is_ok()
    }

    #[quickcheck]
    fn generated_rebase_operations_apply_cleanly(doc: RandomDoc) -> bool {
        let mut g = Gen::new(8);
        let op = random_rebase_op(&doc.0, &mut g);
        op.apply_to(&doc.0).is_ok()
    }

    #[quickcheck]
    fn generated_documents_stay_small(doc: RandomDoc) -> bool {
        fn depth(v: &Value) -> usize {
            match v {
                Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
                Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
                _ => 0,
            }
        }
        depth(&doc.0) <= 3
    }
}
