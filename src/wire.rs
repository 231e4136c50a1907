//! The JSON wire schema for operations.
//!
//! Every operation serialises as an object with a `_type` discriminator of
//! the form `module.VARIANT`; the top-level object additionally carries the
//! protocol version as `_ver`. Decoding is strict: unknown tags, malformed
//! payloads and unsupported versions reject with [`OtError::Wire`], and
//! everything the constructors validate is re-validated here.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::OtError;
use crate::operation::{BitOperand, Hunk, MathOp, Operation};

/// Version of the wire schema; carried alongside every top-level operation.
pub const PROTOCOL_VERSION: u64 = 1;

/// Serialise an operation for the wire.
pub fn to_json(op: &Operation) -> Value {
    let mut v = encode(op);
    if let Value::Object(map) = &mut v {
        map.insert(String::from("_ver"), json!(PROTOCOL_VERSION));
    }
    v
}

/// Parse an operation off the wire.
pub fn from_json(v: &Value) -> Result<Operation, OtError> {
    let obj = expect_object(v)?;
    if let Some(ver) = obj.get("_ver") {
        if ver.as_u64() != Some(PROTOCOL_VERSION) {
            debug!(version = %ver, "rejecting unsupported protocol version");
            return Err(OtError::Wire(format!(
                "unsupported protocol version {ver}"
            )));
        }
    }
    decode(v)
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_json(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Operation, D::Error> {
        let v = Value::deserialize(deserializer)?;
        from_json(&v).map_err(D::Error::custom)
    }
}

fn encode(op: &Operation) -> Value {
    match op {
        Operation::NoOp => json!({"_type": "values.NO_OP"}),
        Operation::Set { old, new } => {
            let mut map = Map::new();
            map.insert(String::from("_type"), json!("values.SET"));
            encode_side(&mut map, "old", old);
            encode_side(&mut map, "new", new);
            Value::Object(map)
        }
        Operation::Math { op } => {
            let (operator, operand) = match op {
                MathOp::Add(n) => ("add", json!(n)),
                MathOp::Mult(n) => ("mult", json!(n)),
                MathOp::Rot { inc, modulus } => ("rot", json!([inc, modulus])),
                MathOp::And(o) => ("and", encode_bit(o)),
                MathOp::Or(o) => ("or", encode_bit(o)),
                MathOp::Xor(o) => ("xor", encode_bit(o)),
                MathOp::Not => ("not", Value::Null),
            };
            json!({"_type": "values.MATH", "operator": operator, "operand": operand})
        }
        Operation::Patch { hunks } => {
            let encoded: Vec<Value> = hunks
                .iter()
                .map(|h| {
                    json!({
                        "offset": h.offset,
                        "length": h.length,
                        "op": encode(&h.op),
                    })
                })
                .collect();
            json!({"_type": "sequences.PATCH", "hunks": encoded})
        }
        Operation::Map { op } => json!({"_type": "sequences.MAP", "op": encode(op)}),
        Operation::Move {
            pos,
            count,
            new_pos,
        } => json!({
            "_type": "sequences.MOVE",
            "pos": pos,
            "count": count,
            "new_pos": new_pos,
        }),
        Operation::Apply { ops } => {
            let encoded: Map<String, Value> = ops
                .iter()
                .map(|(k, op)| (k.clone(), encode(op)))
                .collect();
            json!({"_type": "objects.APPLY", "ops": encoded})
        }
        Operation::Ren { map } => json!({"_type": "objects.REN", "map": map}),
        Operation::List { ops } => {
            let encoded: Vec<Value> = ops.iter().map(encode).collect();
            json!({"_type": "lists.LIST", "ops": encoded})
        }
    }
}

fn encode_side(map: &mut Map<String, Value>, side: &str, slot: &Option<Value>) {
    match slot {
        Some(v) => {
            map.insert(format!("{side}_value"), v.clone());
        }
        None => {
            map.insert(format!("{side}_missing"), Value::Bool(true));
        }
    }
}

fn encode_bit(o: &BitOperand) -> Value {
    match o {
        BitOperand::Int(i) => json!(i),
        BitOperand::Bool(b) => json!(b),
    }
}

fn decode(v: &Value) -> Result<Operation, OtError> {
    let obj = expect_object(v)?;
    let tag = obj
        .get("_type")
        .and_then(Value::as_str)
        .ok_or_else(|| OtError::Wire(String::from("operation is missing its _type tag")))?;
    match tag {
        "values.NO_OP" => Ok(Operation::NoOp),
        "values.SET" => Ok(Operation::Set {
            old: decode_side(obj, "old")?,
            new: decode_side(obj, "new")?,
        }),
        "values.MATH" => decode_math(obj),
        "sequences.PATCH" => {
            let hunks = obj
                .get("hunks")
                .and_then(Value::as_array)
                .ok_or_else(|| OtError::Wire(String::from("patch payload needs a hunks array")))?;
            let mut decoded = Vec::with_capacity(hunks.len());
            for hunk in hunks {
                let hunk_obj = expect_object(hunk)?;
                decoded.push(Hunk {
                    offset: decode_index(hunk_obj, "offset")?,
                    length: decode_index(hunk_obj, "length")?,
                    op: decode(hunk_obj.get("op").ok_or_else(|| {
                        OtError::Wire(String::from("patch hunk is missing its op"))
                    })?)?,
                });
            }
            Operation::try_new_patch(decoded)
                .map_err(|e| OtError::Wire(format!("invalid patch payload: {e}")))
        }
        "sequences.MAP" => {
            let inner = obj
                .get("op")
                .ok_or_else(|| OtError::Wire(String::from("map payload needs an op")))?;
            Ok(Operation::Map {
                op: Box::new(decode(inner)?),
            })
        }
        "sequences.MOVE" => Ok(Operation::Move {
            pos: decode_index(obj, "pos")?,
            count: decode_index(obj, "count")?,
            new_pos: decode_index(obj, "new_pos")?,
        }),
        "objects.APPLY" => {
            let ops = obj
                .get("ops")
                .and_then(Value::as_object)
                .ok_or_else(|| OtError::Wire(String::from("apply payload needs an ops object")))?;
            let mut decoded = BTreeMap::new();
            for (key, op) in ops {
                decoded.insert(key.clone(), decode(op)?);
            }
            Ok(Operation::Apply { ops: decoded })
        }
        "objects.REN" => {
            let map = obj
                .get("map")
                .and_then(Value::as_object)
                .ok_or_else(|| OtError::Wire(String::from("ren payload needs a map object")))?;
            let mut decoded = BTreeMap::new();
            for (new_key, old_key) in map {
                let old_key = old_key.as_str().ok_or_else(|| {
                    OtError::Wire(String::from("ren entries map key names to key names"))
                })?;
                decoded.insert(new_key.clone(), old_key.to_string());
            }
            Ok(Operation::Ren { map: decoded })
        }
        "lists.LIST" => {
            let ops = obj
                .get("ops")
                .and_then(Value::as_array)
                .ok_or_else(|| OtError::Wire(String::from("list payload needs an ops array")))?;
            let mut decoded = Vec::with_capacity(ops.len());
            for op in ops {
                let child = decode(op)?;
                if matches!(child, Operation::List { .. }) {
                    return Err(OtError::Wire(String::from(
                        "list operations must not nest",
                    )));
                }
                decoded.push(child);
            }
            Ok(Operation::List { ops: decoded })
        }
        other => {
            debug!(tag = other, "rejecting unknown operation tag");
            Err(OtError::Wire(format!("unknown operation tag `{other}`")))
        }
    }
}

fn decode_math(obj: &Map<String, Value>) -> Result<Operation, OtError> {
    let operator = obj
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| OtError::Wire(String::from("math payload needs an operator")))?;
    let operand = obj.get("operand").unwrap_or(&Value::Null);
    let op = match operator {
        "add" => MathOp::Add(decode_number(operand, "add")?),
        "mult" => MathOp::Mult(decode_number(operand, "mult")?),
        "rot" => {
            let pair = operand.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                OtError::Wire(String::from("rot operand is an [increment, modulus] pair"))
            })?;
            let inc = pair[0]
                .as_i64()
                .ok_or_else(|| OtError::Wire(String::from("rot increment must be an integer")))?;
            let modulus = pair[1]
                .as_i64()
                .ok_or_else(|| OtError::Wire(String::from("rot modulus must be an integer")))?;
            MathOp::Rot { inc, modulus }
        }
        "and" => MathOp::And(decode_bit(operand, "and")?),
        "or" => MathOp::Or(decode_bit(operand, "or")?),
        "xor" => MathOp::Xor(decode_bit(operand, "xor")?),
        "not" => {
            if !operand.is_null() {
                return Err(OtError::Wire(String::from("not takes no operand")));
            }
            MathOp::Not
        }
        other => {
            return Err(OtError::Wire(format!("unknown math operator `{other}`")));
        }
    };
    Operation::try_new_math(op).map_err(|e| OtError::Wire(format!("invalid math payload: {e}")))
}

fn decode_number(operand: &Value, operator: &str) -> Result<f64, OtError> {
    operand
        .as_f64()
        .ok_or_else(|| OtError::Wire(format!("{operator} operand must be a number")))
}

fn decode_bit(operand: &Value, operator: &str) -> Result<BitOperand, OtError> {
    match operand {
        Value::Bool(b) => Ok(BitOperand::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(BitOperand::Int)
            .ok_or_else(|| OtError::Wire(format!("{operator} operand must be an integer"))),
        _ => Err(OtError::Wire(format!(
            "{operator} operand must be an integer or a boolean"
        ))),
    }
}

fn decode_index(obj: &Map<String, Value>, field: &str) -> Result<usize, OtError> {
    obj.get(field)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| OtError::Wire(format!("`{field}` must be a non-negative integer")))
}

fn decode_side(obj: &Map<String, Value>, side: &str) -> Result<Option<Value>, OtError> {
    if obj
        .get(format!("{side}_missing").as_str())
        .and_then(Value::as_bool)
        == Some(true)
    {
        return Ok(None);
    }
    obj.get(format!("{side}_value").as_str())
        .cloned()
        .map(Some)
        .ok_or_else(|| {
            OtError::Wire(format!(
                "set needs either {side}_value or {side}_missing"
            ))
        })
}

fn expect_object(v: &Value) -> Result<&Map<String, Value>, OtError> {
    v.as_object()
        .ok_or_else(|| OtError::Wire(String::from("an operation must be a JSON object")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{RandomDoc, random_op};
    use quickcheck::Gen;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    #[test]
    fn the_top_level_operation_carries_the_version() {
        let v = to_json(&Operation::NoOp);
        assert_eq!(v, json!({"_type": "values.NO_OP", "_ver": 1}));
        assert_eq!(from_json(&v).unwrap(), Operation::NoOp);
    }

    #[test]
    fn set_encodes_missing_sides_explicitly() {
        let put = Operation::Set {
            old: None,
            new: Some(json!(5)),
        };
        let v = to_json(&put);
        assert_eq!(
            v,
            json!({"_type": "values.SET", "_ver": 1, "old_missing": true, "new_value": 5})
        );
        assert_eq!(from_json(&v).unwrap(), put);

        let delete = Operation::Set {
            old: Some(json!("x")),
            new: None,
        };
        assert_eq!(from_json(&to_json(&delete)).unwrap(), delete);
    }

    #[test]
    fn math_operands_round_trip() {
        for op in [
            MathOp::Add(2.5),
            MathOp::Mult(-3.0),
            MathOp::Rot { inc: 2, modulus: 7 },
            MathOp::And(BitOperand::Int(6)),
            MathOp::Xor(BitOperand::Bool(true)),
            MathOp::Not,
        ] {
            let math = Operation::Math { op };
            assert_eq!(from_json(&to_json(&math)).unwrap(), math);
        }
    }

    #[test]
    fn nested_operations_round_trip() {
        let op = Operation::List {
            ops: vec![
                Operation::new_apply(
                    "title",
                    Operation::try_new_splice(0, json!("ab"), json!("xyz")).unwrap(),
                ),
                Operation::new_rename("a", "b"),
                Operation::new_move(1, 2, 0),
                Operation::new_map(Operation::Math { op: MathOp::Add(1.0) }),
            ],
        };
        assert_eq!(from_json(&to_json(&op)).unwrap(), op);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let v = json!({"_type": "values.FROB", "_ver": 1});
        assert!(matches!(from_json(&v), Err(OtError::Wire(_))));
        assert!(matches!(from_json(&json!(42)), Err(OtError::Wire(_))));
        assert!(matches!(
            from_json(&json!({"_ver": 1})),
            Err(OtError::Wire(_))
        ));
    }

    #[test]
    fn future_versions_are_rejected() {
        let v = json!({"_type": "values.NO_OP", "_ver": 2});
        assert!(matches!(from_json(&v), Err(OtError::Wire(_))));
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        // rot with a zero modulus
        let v = json!({"_type": "values.MATH", "_ver": 1, "operator": "rot", "operand": [1, 0]});
        assert!(matches!(from_json(&v), Err(OtError::Wire(_))));
        // a hunk carrying a list operation
        let v = json!({
            "_type": "sequences.PATCH",
            "_ver": 1,
            "hunks": [{"offset": 0, "length": 1, "op": {"_type": "lists.LIST", "ops": []}}],
        });
        assert!(matches!(from_json(&v), Err(OtError::Wire(_))));
        // nested lists
        let v = json!({
            "_type": "lists.LIST",
            "_ver": 1,
            "ops": [{"_type": "lists.LIST", "ops": []}],
        });
        assert!(matches!(from_json(&v), Err(OtError::Wire(_))));
        // negative offsets
        let v = json!({"_type": "sequences.MOVE", "_ver": 1, "pos": -1, "count": 1, "new_pos": 0});
        assert!(matches!(from_json(&v), Err(OtError::Wire(_))));
    }

    #[test]
    fn serde_delegates_to_the_wire_schema() {
        let op = Operation::new_put("k", json!([1, 2]));
        let text = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&text).unwrap();
        assert_eq!(back, op);
    }

    #[quickcheck]
    fn operations_round_trip_through_the_wire(doc: RandomDoc) -> bool {
        let mut g = Gen::new(8);
        let op = random_op(&doc.0, &mut g);
        from_json(&to_json(&op)).ok() == Some(op)
    }
}
