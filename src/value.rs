//! The value side of the algebra: a total, content-only order over
//! [`serde_json::Value`] used for conflictless tie-breaking, plus the
//! crate-internal sequence view shared by the string and array operations.
//!
//! "Missing" — an absent object property — is never a live value. Inside the
//! crate it is rendered as an `Option<Value>` *slot* (`None` = missing), the
//! same encoding the delete side of a `Set` uses on the wire.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::OtError;

/// Total order over JSON values.
///
/// Cross-type rank is Null < Bool < Number < String < Array < Object; within
/// a type the natural order applies (numbers numerically, strings by scalar
/// value, arrays and objects lexicographically element/pair-wise). The order
/// depends only on content, so every peer computes the same result.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let ranks = type_rank(a).cmp(&type_rank(b));
    if ranks != Ordering::Equal {
        return ranks;
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let o = cmp_values(ex, ey);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // serde_json's map is a BTreeMap, so iteration is key-sorted.
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let o = kx.cmp(ky);
                if o != Ordering::Equal {
                    return o;
                }
                let o = cmp_values(vx, vy);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// [`cmp_values`] extended to slots: Missing sorts below every value.
pub(crate) fn cmp_slots(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => cmp_values(x, y),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.total_cmp(&y)
}

pub(crate) fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Length of a sequence value, counting scalar values for strings.
pub(crate) fn seq_len(v: &Value) -> Result<usize, OtError> {
    match v {
        Value::String(s) => Ok(s.chars().count()),
        Value::Array(a) => Ok(a.len()),
        other => Err(OtError::Type(format!(
            "expected a sequence, got {}",
            kind_name(other)
        ))),
    }
}

/// An empty sequence of the same kind as `v`.
pub(crate) fn empty_like(v: &Value) -> Option<Value> {
    match v {
        Value::String(_) => Some(Value::String(String::new())),
        Value::Array(_) => Some(Value::Array(Vec::new())),
        _ => None,
    }
}

/// Concatenate two sequences of the same kind.
pub(crate) fn concat_seq(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Some(Value::String(s))
        }
        (Value::Array(x), Value::Array(y)) => {
            let mut v = Vec::with_capacity(x.len() + y.len());
            v.extend(x.iter().cloned());
            v.extend(y.iter().cloned());
            Some(Value::Array(v))
        }
        _ => None,
    }
}

/// Split a sequence at `at` (element index).
pub(crate) fn split_seq(v: &Value, at: usize) -> Option<(Value, Value)> {
    match v {
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            if at > chars.len() {
                return None;
            }
            let left: String = chars[..at].iter().collect();
            let right: String = chars[at..].iter().collect();
            Some((Value::String(left), Value::String(right)))
        }
        Value::Array(a) => {
            if at > a.len() {
                return None;
            }
            Some((
                Value::Array(a[..at].to_vec()),
                Value::Array(a[at..].to_vec()),
            ))
        }
        _ => None,
    }
}

/// Element view of a sequence value. Strings are handled as scalar-value
/// sequences so that Patch/Move indices mean the same thing for both kinds;
/// string output is rebuilt through one builder, never by repeated
/// concatenation.
pub(crate) enum Elems {
    Chars(Vec<char>),
    Items(Vec<Value>),
}

impl Elems {
    pub fn from_value(v: &Value) -> Result<Self, OtError> {
        match v {
            Value::String(s) => Ok(Elems::Chars(s.chars().collect())),
            Value::Array(a) => Ok(Elems::Items(a.clone())),
            other => Err(OtError::Type(format!(
                "expected a sequence, got {}",
                kind_name(other)
            ))),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Elems::Chars(c) => c.len(),
            Elems::Items(i) => i.len(),
        }
    }

    pub fn empty_like(&self) -> Elems {
        match self {
            Elems::Chars(_) => Elems::Chars(Vec::new()),
            Elems::Items(_) => Elems::Items(Vec::new()),
        }
    }

    /// A sub-range as a value of the same kind.
    pub fn sub_value(&self, start: usize, end: usize) -> Value {
        match self {
            Elems::Chars(c) => Value::String(c[start..end].iter().collect()),
            Elems::Items(i) => Value::Array(i[start..end].to_vec()),
        }
    }

    pub fn extend_from(&mut self, other: &Elems, start: usize, end: usize) {
        match (self, other) {
            (Elems::Chars(out), Elems::Chars(src)) => out.extend_from_slice(&src[start..end]),
            (Elems::Items(out), Elems::Items(src)) => out.extend_from_slice(&src[start..end]),
            _ => {}
        }
    }

    /// Append a whole sequence value of the same kind.
    pub fn append_value(&mut self, v: &Value) -> Result<(), OtError> {
        match (self, v) {
            (Elems::Chars(out), Value::String(s)) => {
                out.extend(s.chars());
                Ok(())
            }
            (Elems::Items(out), Value::Array(a)) => {
                out.extend(a.iter().cloned());
                Ok(())
            }
            (_, other) => Err(OtError::Type(format!(
                "replacement changes the sequence kind (got {})",
                kind_name(other)
            ))),
        }
    }

    /// Remove and return `[start, end)`.
    pub fn drain(&mut self, start: usize, end: usize) -> Elems {
        match self {
            Elems::Chars(c) => Elems::Chars(c.drain(start..end).collect()),
            Elems::Items(i) => Elems::Items(i.drain(start..end).collect()),
        }
    }

    /// Insert another element run at `at`.
    pub fn insert_at(&mut self, at: usize, other: Elems) {
        match (self, other) {
            (Elems::Chars(c), Elems::Chars(ins)) => {
                c.splice(at..at, ins);
            }
            (Elems::Items(i), Elems::Items(ins)) => {
                i.splice(at..at, ins);
            }
            _ => {}
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Elems::Chars(c) => Value::String(c.into_iter().collect()),
            Elems::Items(i) => Value::Array(i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    #[test]
    fn cross_type_rank() {
        let order = [
            json!(null),
            json!(false),
            json!(2),
            json!("a"),
            json!([1]),
            json!({"a": 1}),
        ];
        for w in order.windows(2) {
            assert_eq!(cmp_values(&w[0], &w[1]), Ordering::Less);
            assert_eq!(cmp_values(&w[1], &w[0]), Ordering::Greater);
        }
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(cmp_values(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(cmp_values(&json!(2), &json!(2)), Ordering::Equal);
        assert_eq!(cmp_values(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(cmp_values(&json!(-3), &json!(0.25)), Ordering::Less);
    }

    #[test]
    fn arrays_and_objects_compare_lexicographically() {
        assert_eq!(cmp_values(&json!([1, 2]), &json!([1, 3])), Ordering::Less);
        assert_eq!(cmp_values(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
        assert_eq!(
            cmp_values(&json!({"a": 1}), &json!({"a": 1, "b": 2})),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&json!({"a": 2}), &json!({"b": 1})),
            Ordering::Less
        );
    }

    #[test]
    fn missing_sorts_first() {
        assert_eq!(cmp_slots(None, Some(&json!(null))), Ordering::Less);
        assert_eq!(cmp_slots(None, None), Ordering::Equal);
    }

    #[quickcheck]
    fn order_is_total_and_antisymmetric(a: crate::random::RandomDoc, b: crate::random::RandomDoc) -> bool {
        let (a, b) = (a.0, b.0);
        let ab = cmp_values(&a, &b);
        let ba = cmp_values(&b, &a);
        ab == ba.reverse() && (ab != Ordering::Equal || a == b)
    }

    #[test]
    fn elems_counts_scalar_values() {
        let e = Elems::from_value(&json!("héllo")).unwrap();
        assert_eq!(e.len(), 5);
        assert_eq!(e.sub_value(1, 3), json!("él"));
    }

    #[test]
    fn split_and_concat_round_trip() {
        let v = json!([1, 2, 3]);
        let (l, r) = split_seq(&v, 1).unwrap();
        assert_eq!(concat_seq(&l, &r).unwrap(), v);

        let s = json!("abc");
        let (l, r) = split_seq(&s, 2).unwrap();
        assert_eq!(l, json!("ab"));
        assert_eq!(concat_seq(&l, &r).unwrap(), s);
    }
}
