//! Rebase: transforming an operation made against a base document so that it
//! applies after a concurrent operation made against the same base.
//!
//! Pairwise rebase computes both directions at once and promises the
//! commutation law: for a non-conflicting pair, `apply(b/a)` after `a` and
//! `apply(a/b)` after `b` reach the same document. `Ok(None)` is the
//! distinguished conflict value; errors are reserved for invalid use.
//!
//! With a [`Conflictless`] context the ambiguous cases tie-break over the
//! total value order, and with a prior document supplied rebase becomes
//! total: a pair no specific rule can reconcile is resolved by applying both
//! sides to the prior state and keeping the higher result as a `Set`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, trace};

use crate::OtError;
use crate::apply::math_apply;
use crate::compose::{compose_list, rel_hunks, to_abs};
use crate::operation::{Hunk, MathOp, Operation};
use crate::value::{Elems, cmp_slots, cmp_values};
use crate::wire::to_json;

/// Tie-breaking context for rebase. Constructing one enables deterministic
/// conflict resolution via [`cmp_values`](crate::cmp_values); adding the
/// prior document with [`Conflictless::with_document`] additionally lets
/// rebase materialise combined results, which makes it total for operations
/// valid on that document.
#[derive(Clone, Debug, Default)]
pub struct Conflictless {
    // outer None: no document supplied; inner None: the Missing slot
    pub(crate) document: Option<Option<Value>>,
}

impl Conflictless {
    pub fn new() -> Conflictless {
        Conflictless { document: None }
    }

    pub fn with_document(document: Value) -> Conflictless {
        Conflictless {
            document: Some(Some(document)),
        }
    }

    pub(crate) fn with_slot(slot: Option<Value>) -> Conflictless {
        Conflictless {
            document: Some(slot),
        }
    }

    /// The context after `op` has been applied to the threaded document.
    fn advanced(&self, op: &Operation) -> Result<Conflictless, OtError> {
        match &self.document {
            None => Ok(Conflictless::new()),
            Some(slot) => Ok(Conflictless {
                document: Some(op.apply_slot(slot.as_ref())?),
            }),
        }
    }
}

impl Operation {
    /// Rebase `self` over the concurrent `other` (both made against the same
    /// base document). `Ok(None)` is a conflict.
    pub fn rebase(
        &self,
        other: &Operation,
        conflictless: Option<&Conflictless>,
    ) -> Result<Option<Operation>, OtError> {
        Ok(rebase_pair(self, other, conflictless)?.map(|(rebased, _)| rebased))
    }
}

/// Rebase the operation sequence `ops` over the concurrent sequence `base`.
///
/// Implements the list laws: `ops / [] = ops`, the single-pair base case,
/// `[o1, o2…] / base = (o1 / base) ++ (o2… / (base / o1))` with the threaded
/// document advanced by `o1`, and right distributivity over a longer base.
pub fn rebase_array(
    base: &[Operation],
    ops: &[Operation],
    conflictless: Option<&Conflictless>,
) -> Result<Option<Vec<Operation>>, OtError> {
    trace!(
        base_len = base.len(),
        ops_len = ops.len(),
        "rebasing operation sequences"
    );
    if base.is_empty() || ops.is_empty() {
        return Ok(Some(ops.to_vec()));
    }
    if base.len() == 1 && ops.len() == 1 {
        return Ok(rebase_pair(&ops[0], &base[0], conflictless)?.map(|(rebased, _)| vec![rebased]));
    }
    if base.len() == 1 {
        let Some((first_rebased, base_rebased)) = rebase_pair(&ops[0], &base[0], conflictless)?
        else {
            return Ok(None);
        };
        let advanced = match conflictless {
            None => None,
            Some(c) => Some(c.advanced(&ops[0])?),
        };
        let Some(tail) = rebase_array(&[base_rebased], &ops[1..], advanced.as_ref())? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(ops.len());
        out.push(first_rebased);
        out.extend(tail);
        return Ok(Some(out));
    }
    let mut current = ops.to_vec();
    let mut ctx = conflictless.cloned();
    for b in base {
        let Some(next) = rebase_array(std::slice::from_ref(b), &current, ctx.as_ref())? else {
            return Ok(None);
        };
        current = next;
        ctx = match ctx {
            None => None,
            Some(c) => Some(c.advanced(b)?),
        };
    }
    Ok(Some(current))
}

enum Outcome {
    Pair(Operation, Operation),
    Conflict,
    Unhandled,
}

/// Rebase both directions at once: returns `(a/b, b/a)`.
pub(crate) fn rebase_pair(
    a: &Operation,
    b: &Operation,
    ctx: Option<&Conflictless>,
) -> Result<Option<(Operation, Operation)>, OtError> {
    let outcome = match handlers(a, b, ctx)? {
        Outcome::Unhandled => match handlers(b, a, ctx)? {
            Outcome::Pair(x, y) => Outcome::Pair(y, x),
            other => other,
        },
        other => other,
    };
    match outcome {
        Outcome::Pair(x, y) => Ok(Some((x.simplify(), y.simplify()))),
        Outcome::Conflict | Outcome::Unhandled => {
            if let Some(c) = ctx {
                if let Some(slot) = &c.document {
                    debug!("resolving a rebase conflict by materialisation");
                    return materialize(a, b, slot.as_ref());
                }
            }
            Ok(None)
        }
    }
}

/// Resolve an otherwise-conflicting pair against the prior document: apply
/// both sides, keep the higher result, turn the loser into `NoOp`.
fn materialize(
    a: &Operation,
    b: &Operation,
    slot: Option<&Value>,
) -> Result<Option<(Operation, Operation)>, OtError> {
    let Ok(result_a) = a.apply_slot(slot) else {
        return Ok(None);
    };
    let Ok(result_b) = b.apply_slot(slot) else {
        return Ok(None);
    };
    if result_a == result_b {
        return Ok(Some((Operation::NoOp, Operation::NoOp)));
    }
    if cmp_slots(result_a.as_ref(), result_b.as_ref()) == Ordering::Greater {
        Ok(Some((
            Operation::Set {
                old: result_b,
                new: result_a,
            }
            .simplify(),
            Operation::NoOp,
        )))
    } else {
        Ok(Some((
            Operation::NoOp,
            Operation::Set {
                old: result_a,
                new: result_b,
            }
            .simplify(),
        )))
    }
}

fn handlers(a: &Operation, b: &Operation, ctx: Option<&Conflictless>) -> Result<Outcome, OtError> {
    match (a, b) {
        (Operation::NoOp, _) => Ok(Outcome::Pair(Operation::NoOp, b.clone())),
        (_, Operation::NoOp) => Ok(Outcome::Pair(a.clone(), Operation::NoOp)),
        (Operation::List { .. }, _) | (_, Operation::List { .. }) => list_rebase(a, b, ctx),
        (Operation::Set { new, .. }, Operation::Set { new: other_new, .. }) => {
            Ok(set_set(new, other_new, ctx))
        }
        (Operation::Set { old, new }, Operation::Math { op }) => {
            Ok(set_math(old, new, op, b, ctx))
        }
        (Operation::Set { old, new }, _) => Ok(set_other(old, new, b, ctx)),
        (Operation::Math { op: x }, Operation::Math { op: y }) => math_math(x, y, a, b, ctx),
        (Operation::Patch { hunks: ha }, Operation::Patch { hunks: hb }) => {
            patch_patch(ha, hb, ctx)
        }
        (
            Operation::Patch { hunks },
            Operation::Move {
                pos,
                count,
                new_pos,
            },
        ) => patch_move(hunks, *pos, *count, *new_pos),
        (Operation::Map { op: x }, Operation::Map { op: y }) => map_map(x, y, ctx),
        (Operation::Map { .. }, Operation::Move { .. }) => {
            // a map touches every element wherever it sits
            Ok(Outcome::Pair(a.clone(), b.clone()))
        }
        (Operation::Move { .. }, Operation::Move { .. }) => Ok(move_move(a, b)),
        (Operation::Apply { ops: x }, Operation::Apply { ops: y }) => apply_apply(x, y, ctx),
        (Operation::Apply { ops }, Operation::Ren { map }) => Ok(apply_ren(ops, map, b)),
        (Operation::Ren { map: x }, Operation::Ren { map: y }) => ren_ren(x, y, ctx),
        _ => Ok(Outcome::Unhandled),
    }
}

fn set_set(
    new: &Option<Value>,
    other_new: &Option<Value>,
    ctx: Option<&Conflictless>,
) -> Outcome {
    if new == other_new {
        // both writes agree, each makes the other redundant
        return Outcome::Pair(Operation::NoOp, Operation::NoOp);
    }
    if ctx.is_none() {
        return Outcome::Conflict;
    }
    match cmp_slots(new.as_ref(), other_new.as_ref()) {
        Ordering::Less => Outcome::Pair(
            Operation::NoOp,
            Operation::Set {
                old: new.clone(),
                new: other_new.clone(),
            },
        ),
        _ => Outcome::Pair(
            Operation::Set {
                old: other_new.clone(),
                new: new.clone(),
            },
            Operation::NoOp,
        ),
    }
}

fn set_math(
    old: &Option<Value>,
    new: &Option<Value>,
    math: &MathOp,
    math_op: &Operation,
    ctx: Option<&Conflictless>,
) -> Outcome {
    let Some(old_value) = old else {
        return Outcome::Conflict;
    };
    let Ok(old_after) = math_apply(math, old_value) else {
        return Outcome::Conflict;
    };
    if let Some(new_value) = new {
        if let Ok(new_after) = math_apply(math, new_value) {
            // the math survives on top of the replacement
            return Outcome::Pair(
                Operation::Set {
                    old: Some(old_after),
                    new: Some(new_after),
                },
                math_op.clone(),
            );
        }
    }
    if ctx.is_none() {
        return Outcome::Conflict;
    }
    // the replacement changed the type out from under the math: prefer the set
    Outcome::Pair(
        Operation::Set {
            old: Some(old_after),
            new: new.clone(),
        },
        Operation::NoOp,
    )
}

/// `Set` against any other concurrent edit of the same subtree: conflict by
/// default; conflictless prefers the replacement. No document is needed —
/// the set's old side *is* the prior state of this subtree.
fn set_other(
    old: &Option<Value>,
    new: &Option<Value>,
    other: &Operation,
    ctx: Option<&Conflictless>,
) -> Outcome {
    if ctx.is_none() {
        return Outcome::Conflict;
    }
    match other.apply_slot(old.as_ref()) {
        Ok(advanced) => Outcome::Pair(
            Operation::Set {
                old: advanced,
                new: new.clone(),
            },
            Operation::NoOp,
        ),
        Err(_) => Outcome::Conflict,
    }
}

fn maths_commute(x: &MathOp, y: &MathOp) -> bool {
    match (x, y) {
        (MathOp::Add(_), MathOp::Add(_))
        | (MathOp::Mult(_), MathOp::Mult(_))
        | (MathOp::And(_), MathOp::And(_))
        | (MathOp::Or(_), MathOp::Or(_))
        | (MathOp::Xor(_), MathOp::Xor(_))
        | (MathOp::Not, MathOp::Not)
        | (MathOp::Xor(_), MathOp::Not)
        | (MathOp::Not, MathOp::Xor(_)) => true,
        (MathOp::Rot { modulus: m1, .. }, MathOp::Rot { modulus: m2, .. }) => m1 == m2,
        _ => false,
    }
}

fn math_math(
    x: &MathOp,
    y: &MathOp,
    a: &Operation,
    b: &Operation,
    ctx: Option<&Conflictless>,
) -> Result<Outcome, OtError> {
    if maths_commute(x, y) {
        return Ok(Outcome::Pair(a.clone(), b.clone()));
    }
    let Some(c) = ctx else {
        return Ok(Outcome::Conflict);
    };
    // deterministic order over the wire forms
    let a_first = cmp_values(&to_json(a), &to_json(b)) == Ordering::Less;
    if let Some(slot) = &c.document {
        let Some(doc) = slot else {
            return Ok(Outcome::Conflict);
        };
        let (first, second) = if a_first { (a, b) } else { (b, a) };
        let Ok(half) = first.apply_to(doc) else {
            return Ok(Outcome::Conflict);
        };
        let Ok(combined) = second.apply_to(&half) else {
            return Ok(Outcome::Conflict);
        };
        let after_a = a.apply_to(doc)?;
        let after_b = b.apply_to(doc)?;
        return Ok(Outcome::Pair(
            Operation::Set {
                old: Some(after_b),
                new: Some(combined.clone()),
            },
            Operation::Set {
                old: Some(after_a),
                new: Some(combined),
            },
        ));
    }
    // without the document: undo the other, apply, redo the other
    if a_first {
        let Some(b_inverse) = b.inverse_pure() else {
            return Ok(Outcome::Conflict);
        };
        Ok(Outcome::Pair(
            compose_list(vec![b_inverse, a.clone(), b.clone()]),
            b.clone(),
        ))
    } else {
        let Some(a_inverse) = a.inverse_pure() else {
            return Ok(Outcome::Conflict);
        };
        Ok(Outcome::Pair(
            a.clone(),
            compose_list(vec![a_inverse, b.clone(), a.clone()]),
        ))
    }
}

fn map_map(x: &Operation, y: &Operation, ctx: Option<&Conflictless>) -> Result<Outcome, OtError> {
    // element state differs per position, so the inner rebase runs without a
    // threaded document
    let stripped = ctx.map(|_| Conflictless::new());
    match rebase_pair(x, y, stripped.as_ref())? {
        None => Ok(Outcome::Conflict),
        Some((rx, ry)) => {
            let wrap = |inner: Operation| match inner {
                Operation::NoOp => Operation::NoOp,
                other => Operation::Map { op: Box::new(other) },
            };
            Ok(Outcome::Pair(wrap(rx), wrap(ry)))
        }
    }
}

fn list_rebase(a: &Operation, b: &Operation, ctx: Option<&Conflictless>) -> Result<Outcome, OtError> {
    let a_ops = list_children(a);
    let b_ops = list_children(b);
    let Some(a_rebased) = rebase_array(&b_ops, &a_ops, ctx)? else {
        return Ok(Outcome::Conflict);
    };
    let Some(b_rebased) = rebase_array(&a_ops, &b_ops, ctx)? else {
        return Ok(Outcome::Conflict);
    };
    Ok(Outcome::Pair(
        compose_list(a_rebased),
        compose_list(b_rebased),
    ))
}

fn list_children(op: &Operation) -> Vec<Operation> {
    match op {
        Operation::List { ops } => ops.clone(),
        other => vec![other.clone()],
    }
}

fn apply_apply(
    x: &BTreeMap<String, Operation>,
    y: &BTreeMap<String, Operation>,
    ctx: Option<&Conflictless>,
) -> Result<Outcome, OtError> {
    let mut out_a = x.clone();
    let mut out_b = y.clone();
    for (key, op_a) in x {
        let Some(op_b) = y.get(key) else { continue };
        let narrowed = narrow_key(ctx, key);
        match rebase_pair(op_a, op_b, narrowed.as_ref())? {
            None => return Ok(Outcome::Conflict),
            Some((ra, rb)) => {
                if matches!(ra, Operation::NoOp) {
                    out_a.remove(key);
                } else {
                    out_a.insert(key.clone(), ra);
                }
                if matches!(rb, Operation::NoOp) {
                    out_b.remove(key);
                } else {
                    out_b.insert(key.clone(), rb);
                }
            }
        }
    }
    Ok(Outcome::Pair(
        Operation::Apply { ops: out_a },
        Operation::Apply { ops: out_b },
    ))
}

/// Translate an object `Apply` through a concurrent `Ren`, mirroring the
/// ren's two-pass application: a key that is some entry's source follows the
/// value to every target; a key overwritten as a target loses its edit; the
/// rest stay put. The ren itself is unaffected by the apply.
fn apply_ren(
    ops: &BTreeMap<String, Operation>,
    map: &BTreeMap<String, String>,
    ren: &Operation,
) -> Outcome {
    let mut translated = BTreeMap::new();
    for (key, op) in ops {
        let targets: Vec<&String> = map
            .iter()
            .filter(|(_, old_key)| old_key.as_str() == key)
            .map(|(new_key, _)| new_key)
            .collect();
        if !targets.is_empty() {
            for target in targets {
                translated.insert(target.clone(), op.clone());
            }
        } else if map.contains_key(key) {
            // overwritten by the rename; the edit has nowhere to land
        } else {
            translated.insert(key.clone(), op.clone());
        }
    }
    Outcome::Pair(Operation::Apply { ops: translated }, ren.clone())
}

fn ren_ren(
    x: &BTreeMap<String, String>,
    y: &BTreeMap<String, String>,
    ctx: Option<&Conflictless>,
) -> Result<Outcome, OtError> {
    match (ren_one_way(x, y, ctx)?, ren_one_way(y, x, ctx)?) {
        (Some(a), Some(b)) => Ok(Outcome::Pair(a, b)),
        _ => Ok(Outcome::Conflict),
    }
}

/// One direction of Ren-vs-Ren: `x` rebased over `y`.
fn ren_one_way(
    x: &BTreeMap<String, String>,
    y: &BTreeMap<String, String>,
    ctx: Option<&Conflictless>,
) -> Result<Option<Operation>, OtError> {
    if x == y {
        return Ok(Some(Operation::NoOp));
    }
    let mut out = BTreeMap::new();
    let mut compensations: Vec<Operation> = Vec::new();
    for (new_x, old_x) in x {
        if y.get(new_x) == Some(old_x) {
            // identical entry, already applied by y
            continue;
        }
        let target_clash = y.get(new_x).filter(|old_y| *old_y != old_x);
        let source_moves: Vec<&String> = y
            .iter()
            .filter(|(_, old_y)| *old_y == old_x)
            .map(|(new_y, _)| new_y)
            .collect();
        if target_clash.is_some() && !source_moves.is_empty() {
            // entangled both ways; leave it to materialisation
            return Ok(None);
        }
        if let Some(old_y) = target_clash {
            if ctx.is_none() {
                return Ok(None);
            }
            if old_x > old_y {
                // x keeps the target (y never moved x's source here)
                out.insert(new_x.clone(), old_x.clone());
            } else {
                // x loses the target, but its source must still be consumed
                let Some(slot) = ctx.and_then(|c| c.document.as_ref()) else {
                    return Ok(None);
                };
                match slot {
                    Some(Value::Object(doc)) => {
                        if let Some(v) = doc.get(old_x) {
                            compensations.push(Operation::new_remove(old_x.clone(), v.clone()));
                        }
                    }
                    _ => return Ok(None),
                }
            }
            continue;
        }
        if !source_moves.is_empty() {
            if source_moves.len() > 1 {
                return Ok(None);
            }
            let new_y = source_moves[0];
            if ctx.is_none() {
                return Ok(None);
            }
            if new_x > new_y {
                // x wins the value; it now lives at y's target
                out.insert(new_x.clone(), new_y.clone());
            }
            continue;
        }
        if y.contains_key(old_x) {
            // x's source was overwritten as a target of y
            return Ok(None);
        }
        out.insert(new_x.clone(), old_x.clone());
    }
    let ren = Operation::Ren { map: out }.simplify();
    if compensations.is_empty() {
        Ok(Some(ren))
    } else {
        let mut ops = vec![ren];
        ops.extend(compensations);
        Ok(Some(compose_list(ops)))
    }
}

// sequence index mapping through a move

fn map_index(mp: usize, mc: usize, mn: usize, i: usize) -> usize {
    if i >= mp && i < mp + mc {
        mn + (i - mp)
    } else {
        let r = if i >= mp + mc { i - mc } else { i };
        if r >= mn { r + mc } else { r }
    }
}

/// Map an insertion gap through a move; `None` when the gap falls strictly
/// inside the moved block.
fn map_gap(mp: usize, mc: usize, mn: usize, g: usize) -> Option<usize> {
    let r = if g >= mp + mc {
        g - mc
    } else if g <= mp {
        g
    } else {
        return None;
    };
    Some(if r >= mn { r + mc } else { r })
}

fn move_move(a: &Operation, b: &Operation) -> Outcome {
    if a == b {
        return Outcome::Pair(Operation::NoOp, Operation::NoOp);
    }
    let (Operation::Move {
        pos: ap,
        count: ac,
        new_pos: an,
    }, Operation::Move {
        pos: bp,
        count: bc,
        new_pos: bn,
    }) = (a, b)
    else {
        return Outcome::Unhandled;
    };
    if *ap < *bp + *bc && *bp < *ap + *ac {
        // overlapping ranges
        return Outcome::Conflict;
    }
    match (
        move_through(*ap, *ac, *an, *bp, *bc, *bn),
        move_through(*bp, *bc, *bn, *ap, *ac, *an),
    ) {
        (Some(ra), Some(rb)) => Outcome::Pair(ra, rb),
        _ => Outcome::Conflict,
    }
}

/// Map one move through another; `None` when the mapping would tear the
/// moved range apart.
fn move_through(
    p: usize,
    c: usize,
    n: usize,
    other_p: usize,
    other_c: usize,
    other_n: usize,
) -> Option<Operation> {
    if c == 0 {
        return Some(Operation::NoOp);
    }
    let first = map_index(other_p, other_c, other_n, p);
    let last = map_index(other_p, other_c, other_n, p + c - 1);
    if last < first || last - first + 1 != c {
        return None;
    }
    // the landing gap, in whole-document coordinates
    let gap = if n >= p { n + c } else { n };
    let mapped_gap = map_gap(other_p, other_c, other_n, gap)?;
    let new_pos = if mapped_gap >= first + c {
        mapped_gap - c
    } else if mapped_gap <= first {
        mapped_gap
    } else {
        return None;
    };
    Some(
        Operation::Move {
            pos: first,
            count: c,
            new_pos,
        }
        .simplify(),
    )
}

fn patch_move(hunks: &[Hunk], mp: usize, mc: usize, mn: usize) -> Result<Outcome, OtError> {
    let abs = to_abs(hunks);
    let gap = if mn >= mp { mn + mc } else { mn };
    let mut mapped: Vec<(usize, usize, Operation)> = Vec::with_capacity(abs.len());
    let mut delta_before_block = 0i64;
    let mut delta_before_gap = 0i64;
    for (s, l, op) in &abs {
        let e = s + l;
        if *s < mp + mc && e > mp {
            // the hunk touches the moved range
            return Ok(Outcome::Conflict);
        }
        if *s < gap && e > gap {
            // the landing point falls inside the hunk
            return Ok(Outcome::Conflict);
        }
        if *l == 0 && *s == gap {
            // an insertion exactly at the landing point is ambiguous
            return Ok(Outcome::Conflict);
        }
        let delta = op.length_change(*l)?;
        if e <= mp {
            delta_before_block += delta;
        }
        if e <= gap {
            delta_before_gap += delta;
        }
        if *l == 0 {
            let Some(g2) = map_gap(mp, mc, mn, *s) else {
                return Ok(Outcome::Conflict);
            };
            mapped.push((g2, 0, op.clone()));
        } else {
            let first = map_index(mp, mc, mn, *s);
            let last = map_index(mp, mc, mn, e - 1);
            if last < first || last - first + 1 != *l {
                return Ok(Outcome::Conflict);
            }
            mapped.push((first, *l, op.clone()));
        }
    }
    mapped.sort_by_key(|(s, _, _)| *s);
    let moved_pos = (mp as i64 + delta_before_block).max(0) as usize;
    let moved_gap = (gap as i64 + delta_before_gap).max(0) as usize;
    let moved_new_pos = if moved_gap >= moved_pos + mc {
        moved_gap - mc
    } else if moved_gap <= moved_pos {
        moved_gap
    } else {
        return Ok(Outcome::Conflict);
    };
    let Some(hunks) = rel_hunks(mapped) else {
        return Ok(Outcome::Conflict);
    };
    Ok(Outcome::Pair(
        Operation::Patch { hunks }.simplify(),
        Operation::Move {
            pos: moved_pos,
            count: mc,
            new_pos: moved_new_pos,
        }
        .simplify(),
    ))
}

fn patch_patch(
    ha: &[Hunk],
    hb: &[Hunk],
    ctx: Option<&Conflictless>,
) -> Result<Outcome, OtError> {
    let mut av: Vec<(i64, i64, Operation)> = to_abs(ha)
        .into_iter()
        .map(|(s, l, op)| (s as i64, l as i64, op))
        .collect();
    let mut bv: Vec<(i64, i64, Operation)> = to_abs(hb)
        .into_iter()
        .map(|(s, l, op)| (s as i64, l as i64, op))
        .collect();
    let mut out_a: Vec<(i64, i64, Operation)> = Vec::new();
    let mut out_b: Vec<(i64, i64, Operation)> = Vec::new();
    let (mut ia, mut ib) = (0usize, 0usize);
    let (mut shift_a, mut shift_b) = (0i64, 0i64);
    while ia < av.len() && ib < bv.len() {
        let (sa, la, opa) = av[ia].clone();
        let (sb, lb, opb) = bv[ib].clone();
        let (ea, eb) = (sa + la, sb + lb);
        let da = opa.length_change(la as usize)?;
        let db = opb.length_change(lb as usize)?;
        if sa == sb && la == 0 && lb == 0 {
            // co-incident insertions
            if opa == opb {
                // the same text was inserted on both sides; each absorbs the
                // other's copy
                shift_a += db;
                shift_b += da;
                ia += 1;
                ib += 1;
                continue;
            }
            if ctx.is_none() {
                return Ok(Outcome::Conflict);
            }
            let a_first = cmp_values(&to_json(&opa), &to_json(&opb)) == Ordering::Less;
            out_a.push((sa + shift_a + if a_first { 0 } else { db }, 0, opa));
            out_b.push((sb + shift_b + if a_first { da } else { 0 }, 0, opb));
            shift_a += db;
            shift_b += da;
            ia += 1;
            ib += 1;
        } else if ea <= sb {
            out_a.push((sa + shift_a, la, opa));
            shift_b += da;
            ia += 1;
        } else if eb <= sa {
            out_b.push((sb + shift_b, lb, opb));
            shift_a += db;
            ib += 1;
        } else if sa == sb && ea == eb {
            // identical range: rebase the inner operations on it
            let narrowed = narrow_range(ctx, sa as usize, ea as usize)?;
            match rebase_pair(&opa, &opb, narrowed.as_ref())? {
                None => return Ok(Outcome::Conflict),
                Some((ra, rb)) => {
                    if !matches!(ra, Operation::NoOp) {
                        out_a.push((sa + shift_a, la + db, ra));
                    }
                    if !matches!(rb, Operation::NoOp) {
                        out_b.push((sb + shift_b, lb + da, rb));
                    }
                    shift_a += db;
                    shift_b += da;
                    ia += 1;
                    ib += 1;
                }
            }
        } else if sa <= sb && eb <= ea {
            // a's hunk contains b's: split it at b's boundaries
            match split_hunk(&av[ia], sb, eb) {
                Some(pieces) => {
                    av.splice(ia..ia + 1, pieces);
                    continue;
                }
                None => return Ok(Outcome::Conflict),
            }
        } else if sb <= sa && ea <= eb {
            match split_hunk(&bv[ib], sa, ea) {
                Some(pieces) => {
                    bv.splice(ib..ib + 1, pieces);
                    continue;
                }
                None => return Ok(Outcome::Conflict),
            }
        } else {
            // crossing overlap
            return Ok(Outcome::Conflict);
        }
    }
    while ia < av.len() {
        let (s, l, op) = av[ia].clone();
        out_a.push((s + shift_a, l, op));
        ia += 1;
    }
    while ib < bv.len() {
        let (s, l, op) = bv[ib].clone();
        out_b.push((s + shift_b, l, op));
        ib += 1;
    }
    Ok(Outcome::Pair(
        rebuild_patch(out_a)?,
        rebuild_patch(out_b)?,
    ))
}

fn split_hunk(
    hunk: &(i64, i64, Operation),
    cut1: i64,
    cut2: i64,
) -> Option<Vec<(i64, i64, Operation)>> {
    let (s, l, op) = hunk.clone();
    let e = s + l;
    let mut pieces = Vec::new();
    let mut cur_start = s;
    let mut cur_op = op;
    for cut in [cut1, cut2] {
        if cut > cur_start && cut < e {
            let (left, right) = cur_op.decompose((cut - cur_start) as usize)?;
            pieces.push((cur_start, cut - cur_start, left));
            cur_start = cut;
            cur_op = right;
        }
    }
    if pieces.is_empty() {
        return None;
    }
    pieces.push((cur_start, e - cur_start, cur_op));
    Some(pieces)
}

fn rebuild_patch(abs: Vec<(i64, i64, Operation)>) -> Result<Operation, OtError> {
    let mut converted = Vec::with_capacity(abs.len());
    for (s, l, op) in abs {
        if s < 0 || l < 0 {
            return Err(OtError::Index(String::from(
                "rebased hunk fell outside the document",
            )));
        }
        converted.push((s as usize, l as usize, op));
    }
    let hunks = rel_hunks(converted).ok_or_else(|| {
        OtError::Index(String::from("rebased hunks out of order"))
    })?;
    Ok(Operation::Patch { hunks }.simplify())
}

fn narrow_key(ctx: Option<&Conflictless>, key: &str) -> Option<Conflictless> {
    let c = ctx?;
    match &c.document {
        None => Some(Conflictless::new()),
        Some(slot) => Some(Conflictless::with_slot(
            slot.as_ref().and_then(|d| d.get(key)).cloned(),
        )),
    }
}

fn narrow_range(
    ctx: Option<&Conflictless>,
    start: usize,
    end: usize,
) -> Result<Option<Conflictless>, OtError> {
    let Some(c) = ctx else { return Ok(None) };
    let Some(slot) = &c.document else {
        return Ok(Some(Conflictless::new()));
    };
    let sub = match slot {
        Some(doc) => {
            let elems = Elems::from_value(doc)?;
            if end > elems.len() {
                return Err(OtError::Index(format!(
                    "hunk range {start}..{end} outside document of length {}",
                    elems.len()
                )));
            }
            Some(elems.sub_value(start, end))
        }
        None => None,
    };
    Ok(Some(Conflictless::with_slot(sub)))
}
