//! Composition: merging two operations that ran in sequence into one.
//!
//! `atomic_compose` is the partial, single-operation merge; [`compose_list`]
//! is total and falls back to a flattened `List` when a pair refuses to merge.

use std::collections::BTreeMap;

use tracing::trace;

use crate::operation::{Hunk, MathOp, Operation};
use crate::rebase::rebase_pair;

impl Operation {
    /// Merge `self` followed by `other` into a single operation, or `None`
    /// when the pair is not atomically composable (wrap them in a list via
    /// [`compose_list`] instead).
    pub fn compose(&self, other: &Operation) -> Option<Operation> {
        atomic_compose(self, other)
    }
}

/// Compose a sequence of operations into one simplified operation.
///
/// Nested lists are flattened, identity operations dropped, adjacent
/// operations merged where [`Operation::compose`] allows, and a new operation
/// may swap backwards past a fully independent neighbour to reach a merge
/// partner. The result is never a nested or singleton list.
pub fn compose_list(ops: impl IntoIterator<Item = Operation>) -> Operation {
    let mut flat: Vec<Operation> = Vec::new();
    for op in ops {
        push_flat(&mut flat, op);
    }
    let mut stack: Vec<Operation> = Vec::new();
    'outer: for mut op in flat {
        loop {
            let Some(last) = stack.last() else { break };
            if let Some(merged) = atomic_compose(last, &op) {
                trace!(merged = %merged, "coalesced adjacent operations");
                stack.pop();
                let merged = merged.simplify();
                if matches!(merged, Operation::NoOp) {
                    continue 'outer;
                }
                op = merged;
                continue;
            }
            if stack.len() >= 2 && independent(last, &op) {
                let prev = stack[stack.len() - 2].clone();
                if let Some(merged) = atomic_compose(&prev, &op) {
                    let merged = merged.simplify();
                    let kept = stack.pop().unwrap_or(Operation::NoOp);
                    stack.pop();
                    if !matches!(merged, Operation::NoOp) {
                        stack.push(merged);
                    }
                    stack.push(kept);
                    continue 'outer;
                }
            }
            break;
        }
        stack.push(op);
    }
    match stack.len() {
        0 => Operation::NoOp,
        1 => stack.remove(0),
        _ => Operation::List { ops: stack },
    }
}

fn push_flat(out: &mut Vec<Operation>, op: Operation) {
    match op.simplify() {
        Operation::NoOp => {}
        Operation::List { ops } => {
            for child in ops {
                push_flat(out, child);
            }
        }
        other => out.push(other),
    }
}

/// Two operations are independent when rebasing either over the other leaves
/// both untouched.
fn independent(a: &Operation, b: &Operation) -> bool {
    matches!(rebase_pair(a, b, None), Ok(Some((ra, rb))) if ra == *a && rb == *b)
}

pub(crate) fn atomic_compose(a: &Operation, b: &Operation) -> Option<Operation> {
    match (a, b) {
        (Operation::NoOp, _) => Some(b.simplify()),
        (_, Operation::NoOp) => Some(a.simplify()),
        (Operation::Set { old, new }, _) => {
            let applied = b.apply_slot(new.as_ref()).ok()?;
            Some(
                Operation::Set {
                    old: old.clone(),
                    new: applied,
                }
                .simplify(),
            )
        }
        (_, Operation::Set { old, new }) => {
            // fold backwards through a pure inverse to recover the base state
            let inverse = a.inverse_pure()?;
            let before = inverse.apply_slot(old.as_ref()).ok()?;
            Some(
                Operation::Set {
                    old: before,
                    new: new.clone(),
                }
                .simplify(),
            )
        }
        (Operation::Math { op: x }, Operation::Math { op: y }) => match (x, y) {
            (MathOp::Not, MathOp::Not) => Some(Operation::NoOp),
            _ => math_compose(x, y).map(|m| Operation::Math { op: m }.simplify()),
        },
        (Operation::Patch { hunks: ha }, Operation::Patch { hunks: hb }) => patch_compose(ha, hb),
        (Operation::Map { op: x }, Operation::Map { op: y }) => {
            atomic_compose(x, y).map(|m| Operation::Map { op: Box::new(m) }.simplify())
        }
        (Operation::Apply { ops: x }, Operation::Apply { ops: y }) => Some(apply_compose(x, y)),
        (Operation::Ren { map: x }, Operation::Ren { map: y }) => ren_compose(x, y),
        (Operation::Move { .. }, Operation::Move { .. }) => {
            if a.inverse_pure().as_ref() == Some(b) {
                Some(Operation::NoOp)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn math_compose(a: &MathOp, b: &MathOp) -> Option<MathOp> {
    use crate::operation::BitOperand::{Bool, Int};
    match (a, b) {
        (MathOp::Add(x), MathOp::Add(y)) => Some(MathOp::Add(x + y)),
        (MathOp::Mult(x), MathOp::Mult(y)) => Some(MathOp::Mult(x * y)),
        (
            MathOp::Rot { inc: i1, modulus: m1 },
            MathOp::Rot { inc: i2, modulus: m2 },
        ) if m1 == m2 => Some(MathOp::Rot {
            inc: (i1 + i2).rem_euclid(*m1),
            modulus: *m1,
        }),
        (MathOp::Xor(Int(x)), MathOp::Xor(Int(y))) => Some(MathOp::Xor(Int(x ^ y))),
        (MathOp::Xor(Bool(x)), MathOp::Xor(Bool(y))) => Some(MathOp::Xor(Bool(x ^ y))),
        (MathOp::And(Int(x)), MathOp::And(Int(y))) => Some(MathOp::And(Int(x & y))),
        (MathOp::And(Bool(x)), MathOp::And(Bool(y))) => Some(MathOp::And(Bool(*x && *y))),
        (MathOp::Or(Int(x)), MathOp::Or(Int(y))) => Some(MathOp::Or(Int(x | y))),
        (MathOp::Or(Bool(x)), MathOp::Or(Bool(y))) => Some(MathOp::Or(Bool(*x || *y))),
        _ => None,
    }
}

fn apply_compose(
    x: &BTreeMap<String, Operation>,
    y: &BTreeMap<String, Operation>,
) -> Operation {
    let mut out = x.clone();
    for (k, opb) in y {
        let merged = match out.get(k) {
            Some(opa) => match atomic_compose(opa, opb) {
                Some(m) => m,
                None => compose_list(vec![opa.clone(), opb.clone()]),
            },
            None => opb.clone(),
        }
        .simplify();
        if matches!(merged, Operation::NoOp) {
            out.remove(k);
        } else {
            out.insert(k.clone(), merged);
        }
    }
    Operation::Apply { ops: out }.simplify()
}

fn ren_compose(
    a: &BTreeMap<String, String>,
    b: &BTreeMap<String, String>,
) -> Option<Operation> {
    let a_removes = |k: &str| a.values().any(|o| o == k) && !a.contains_key(k);
    let b_removes = |k: &str| b.values().any(|o| o == k) && !b.contains_key(k);
    let mut out = BTreeMap::new();
    for (nb, ob) in b {
        // trace the source of b's assignment back through a
        let src = if let Some(oa) = a.get(ob) {
            oa.clone()
        } else if a_removes(ob) {
            return None;
        } else {
            ob.clone()
        };
        out.insert(nb.clone(), src);
    }
    for (na, oa) in a {
        if b.contains_key(na) || b_removes(na) {
            continue;
        }
        out.insert(na.clone(), oa.clone());
    }
    Some(Operation::Ren { map: out }.simplify())
}

/// Compose two patches, aligned on the document between them: `a`'s output
/// indices are `b`'s input indices.
fn patch_compose(ha: &[Hunk], hb: &[Hunk]) -> Option<Operation> {
    let a_abs = to_abs(ha);
    let b_abs = to_abs(hb);
    let mut a_out_lens = Vec::with_capacity(a_abs.len());
    for (_, la, op) in &a_abs {
        a_out_lens.push(*la as i64 + op.length_change(*la).ok()?);
    }
    let mut out: Vec<(usize, usize, Operation)> = Vec::new();
    let mut ia = 0;
    let mut ib = 0;
    let mut delta = 0i64; // a-output position minus a-input position
    while ia < a_abs.len() && ib < b_abs.len() {
        let (sa, la, _) = a_abs[ia];
        let out_sa = sa as i64 + delta;
        let out_ea = out_sa + a_out_lens[ia];
        let (sb_u, lb, ref opb) = b_abs[ib];
        let sb = sb_u as i64;
        let eb = sb + lb as i64;
        if out_ea <= sb {
            out.push(a_abs[ia].clone());
            delta += a_out_lens[ia] - la as i64;
            ia += 1;
        } else if eb <= out_sa {
            let start = sb - delta;
            if start < 0 {
                return None;
            }
            out.push((start as usize, lb, opb.clone()));
            ib += 1;
        } else if out_sa == sb && out_ea == eb {
            let (s, l, ref opa) = a_abs[ia];
            let combined = atomic_compose(opa, opb)?;
            out.push((s, l, combined));
            delta += a_out_lens[ia] - l as i64;
            ia += 1;
            ib += 1;
        } else if out_sa <= sb && eb <= out_ea {
            // every b hunk inside a's output range folds into a's new value
            let (s, l, ref opa) = a_abs[ia];
            let (old, new) = match opa {
                Operation::Set {
                    old,
                    new: Some(n),
                } => (old.clone(), n.clone()),
                _ => return None,
            };
            let mut sub: Vec<(usize, usize, Operation)> = Vec::new();
            while ib < b_abs.len() {
                let (sb2, lb2, ref opb2) = b_abs[ib];
                let (sb2, eb2) = (sb2 as i64, (sb2 + lb2) as i64);
                if sb2 >= out_sa && eb2 <= out_ea {
                    sub.push(((sb2 - out_sa) as usize, lb2, opb2.clone()));
                    ib += 1;
                } else {
                    break;
                }
            }
            let sub_patch = Operation::Patch {
                hunks: rel_hunks(sub)?,
            };
            let folded = sub_patch.apply_to(&new).ok()?;
            out.push((
                s,
                l,
                Operation::Set {
                    old,
                    new: Some(folded),
                },
            ));
            delta += a_out_lens[ia] - l as i64;
            ia += 1;
        } else {
            return None;
        }
    }
    while ia < a_abs.len() {
        out.push(a_abs[ia].clone());
        ia += 1;
    }
    while ib < b_abs.len() {
        let (sb, lb, ref opb) = b_abs[ib];
        let start = sb as i64 - delta;
        if start < 0 {
            return None;
        }
        out.push((start as usize, lb, opb.clone()));
        ib += 1;
    }
    Some(Operation::Patch {
        hunks: rel_hunks(out)?,
    }
    .simplify())
}

/// Hunks with absolute start positions.
pub(crate) fn to_abs(hunks: &[Hunk]) -> Vec<(usize, usize, Operation)> {
    let mut idx = 0usize;
    let mut out = Vec::with_capacity(hunks.len());
    for h in hunks {
        let start = idx + h.offset;
        out.push((start, h.length, h.op.clone()));
        idx = start + h.length;
    }
    out
}

/// Back to relative offsets; `None` when the ranges are unordered.
pub(crate) fn rel_hunks(abs: Vec<(usize, usize, Operation)>) -> Option<Vec<Hunk>> {
    let mut prev_end = 0usize;
    let mut out = Vec::with_capacity(abs.len());
    for (s, l, op) in abs {
        let offset = s.checked_sub(prev_end)?;
        prev_end = s + l;
        out.push(Hunk {
            offset,
            length: l,
            op,
        });
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{RandomDoc, random_op};
    use quickcheck::Gen;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    #[test]
    fn noop_is_neutral() {
        let op = Operation::new_set(json!(1), json!(2));
        assert_eq!(Operation::NoOp.compose(&op), Some(op.clone()));
        assert_eq!(op.compose(&Operation::NoOp), Some(op));
    }

    #[test]
    fn set_absorbs_whatever_follows() {
        let set = Operation::new_set(json!(1), json!(2));
        let add = Operation::Math { op: MathOp::Add(3.0) };
        assert_eq!(
            set.compose(&add),
            Some(Operation::new_set(json!(1), json!(5)))
        );
    }

    #[test]
    fn pure_ops_fold_into_a_following_set() {
        let add = Operation::Math { op: MathOp::Add(1.0) };
        let set = Operation::new_set(json!(5), json!(9));
        assert_eq!(
            add.compose(&set),
            Some(Operation::new_set(json!(4), json!(9)))
        );
    }

    #[test]
    fn adds_merge() {
        let a = Operation::Math { op: MathOp::Add(2.0) };
        let b = Operation::Math { op: MathOp::Add(1.0) };
        assert_eq!(a.compose(&b), Some(Operation::Math { op: MathOp::Add(3.0) }));
    }

    #[test]
    fn rots_merge_only_with_matching_modulus() {
        let a = Operation::Math {
            op: MathOp::Rot { inc: 3, modulus: 4 },
        };
        let b = Operation::Math {
            op: MathOp::Rot { inc: 2, modulus: 4 },
        };
        assert_eq!(
            a.compose(&b),
            Some(Operation::Math {
                op: MathOp::Rot { inc: 1, modulus: 4 }
            })
        );
        let c = Operation::Math {
            op: MathOp::Rot { inc: 2, modulus: 5 },
        };
        assert_eq!(a.compose(&c), None);
    }

    #[test]
    fn disjoint_patches_zip_together() {
        let a = Operation::try_new_splice(0, json!("a"), json!("X")).unwrap();
        let b = Operation::try_new_splice(2, json!("c"), json!("Z")).unwrap();
        let composed = a.compose(&b).unwrap();
        assert_eq!(
            composed,
            Operation::Patch {
                hunks: vec![
                    Hunk {
                        offset: 0,
                        length: 1,
                        op: Operation::new_set(json!("a"), json!("X")),
                    },
                    Hunk {
                        offset: 1,
                        length: 1,
                        op: Operation::new_set(json!("c"), json!("Z")),
                    },
                ]
            }
        );
        let doc = json!("abc");
        let sequential = b.apply_to(&a.apply_to(&doc).unwrap()).unwrap();
        assert_eq!(composed.apply_to(&doc).unwrap(), sequential);
        assert_eq!(sequential, json!("XbZ"));
    }

    #[test]
    fn exactly_overlapping_patch_hunks_compose_inner_ops() {
        let a = Operation::try_new_splice(1, json!("b"), json!("Y")).unwrap();
        let b = Operation::try_new_splice(1, json!("Y"), json!("Q")).unwrap();
        assert_eq!(
            a.compose(&b),
            Some(Operation::try_new_splice(1, json!("b"), json!("Q")).unwrap())
        );
    }

    #[test]
    fn contained_patch_hunks_fold_into_the_set() {
        let a = Operation::try_new_splice(0, json!("abc"), json!("wxyz")).unwrap();
        let b = Operation::try_new_splice(1, json!("xy"), json!("!")).unwrap();
        assert_eq!(
            a.compose(&b),
            Some(Operation::try_new_splice(0, json!("abc"), json!("w!z")).unwrap())
        );
    }

    #[test]
    fn apply_composes_key_wise() {
        let a = Operation::new_apply("n", Operation::Math { op: MathOp::Add(1.0) });
        let b = Operation::new_apply("n", Operation::Math { op: MathOp::Add(2.0) });
        assert_eq!(
            a.compose(&b),
            Some(Operation::new_apply(
                "n",
                Operation::Math { op: MathOp::Add(3.0) }
            ))
        );

        let c = Operation::new_apply("m", Operation::new_set(json!(1), json!(2)));
        let merged = a.compose(&c).unwrap();
        match merged {
            Operation::Apply { ops } => assert_eq!(ops.len(), 2),
            other => panic!("expected an apply, got {other}"),
        }
    }

    #[test]
    fn ren_maps_chain() {
        let a = Operation::new_rename("a", "b");
        let b = Operation::new_rename("b", "c");
        assert_eq!(a.compose(&b), Some(Operation::new_rename("a", "c")));

        // renaming there and back is a no-op
        let back = Operation::new_rename("b", "a");
        assert_eq!(a.compose(&back), Some(Operation::NoOp));
    }

    #[test]
    fn incompatible_pairs_fall_back_to_a_list() {
        let mv = Operation::new_move(0, 1, 2);
        let patch = Operation::try_new_splice(0, json!([1]), json!([9])).unwrap();
        assert_eq!(mv.compose(&patch), None);
        let listed = compose_list(vec![mv.clone(), patch.clone()]);
        assert_eq!(
            listed,
            Operation::List {
                ops: vec![mv, patch]
            }
        );
    }

    #[test]
    fn compose_list_flattens_and_drops_identities() {
        let inner = Operation::List {
            ops: vec![
                Operation::Math { op: MathOp::Add(1.0) },
                Operation::Math { op: MathOp::Add(-1.0) },
            ],
        };
        assert_eq!(compose_list(vec![inner, Operation::NoOp]), Operation::NoOp);
    }

    #[quickcheck]
    fn composing_equals_sequential_application(doc: RandomDoc) -> bool {
        let mut g = Gen::new(8);
        let d = doc.0;
        let a = random_op(&d, &mut g);
        let d1 = match a.apply_to(&d) {
            Ok(v) => v,
            Err(_) => return true,
        };
        let b = random_op(&d1, &mut g);
        let d2 = match b.apply_to(&d1) {
            Ok(v) => v,
            Err(_) => return true,
        };
        let composed = compose_list(vec![a, b]);
        composed.apply_to(&d).ok() == Some(d2)
    }
}
