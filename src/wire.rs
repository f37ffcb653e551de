//! Serialization (component K, elaborating spec.md §6.2): a `serde`-backed
//! wire format for logging/storing compiled instructions and parameter
//! maps. Purely an export format — the algebra never deserializes back
//! into an [`Instruction`], and nothing in this module is used internally
//! by the evaluator or shot compiler.

use std::collections::HashMap;

use serde::Serialize;

use crate::instruction::{Buffer, Dtype, Instruction};

#[derive(Debug, Serialize)]
#[serde(tag = "kind")]
pub enum WireInstruction {
    #[serde(rename = "pat")]
    Pattern { dtype: WireDtype, data: WireBuffer },
    #[serde(rename = "cat")]
    Concatenated { children: Vec<WireInstruction> },
    #[serde(rename = "rep")]
    Repeated { n: u64, child: Box<WireInstruction> },
    #[serde(rename = "ramp")]
    Ramp { dtype: WireDtype, start: WireBuffer, stop: WireBuffer, len: u64 },
}

#[derive(Debug, Serialize)]
#[serde(tag = "dtype")]
pub enum WireDtype {
    Bool,
    F64,
    Struct { fields: Vec<(String, WireDtype)> },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WireBuffer {
    Bool(Vec<bool>),
    F64(Vec<f64>),
    Struct(Vec<(String, WireBuffer)>),
}

impl From<&Dtype> for WireDtype {
    fn from(dtype: &Dtype) -> WireDtype {
        match dtype {
            Dtype::Bool => WireDtype::Bool,
            Dtype::F64 => WireDtype::F64,
            Dtype::Struct(fields) => {
                WireDtype::Struct { fields: fields.iter().map(|(n, d)| (n.clone(), d.into())).collect() }
            }
        }
    }
}

impl From<&Buffer> for WireBuffer {
    fn from(buffer: &Buffer) -> WireBuffer {
        match buffer {
            Buffer::Bool(v) => WireBuffer::Bool((**v).clone()),
            Buffer::F64(v) => WireBuffer::F64((**v).clone()),
            Buffer::Struct(fields) => {
                WireBuffer::Struct(fields.iter().map(|(n, b)| (n.clone(), b.into())).collect())
            }
        }
    }
}

impl From<&Instruction> for WireInstruction {
    fn from(instr: &Instruction) -> WireInstruction {
        match instr {
            Instruction::Pattern(_) => {
                let buffer = instr.to_pattern();
                WireInstruction::Pattern { dtype: (&instr.dtype()).into(), data: (&buffer).into() }
            }
            Instruction::Concatenated(c) => WireInstruction::Concatenated {
                children: c.children().iter().map(|ch| (&**ch).into()).collect(),
            },
            Instruction::Repeated(r) => {
                WireInstruction::Repeated { n: r.n(), child: Box::new(r.child().into()) }
            }
            Instruction::Ramp(_) => {
                let (start, stop, len) =
                    instr.as_ramp_endpoints().expect("Instruction::Ramp always has endpoints");
                WireInstruction::Ramp {
                    dtype: (&instr.dtype()).into(),
                    start: start.into(),
                    stop: stop.into(),
                    len,
                }
            }
        }
    }
}

/// Serializes a whole device parameter map (`map<string, Instruction>`)
/// into the wire representation used for logging/storage (spec.md §6.2).
pub fn parameter_map_to_wire(params: &HashMap<String, Instruction>) -> HashMap<String, WireInstruction> {
    params.iter().map(|(name, instr)| (name.clone(), instr.into())).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn pattern_round_trips_through_json() {
        let instr = crate::instruction::pattern(Buffer::Bool(Rc::new(vec![true, false, true])));
        let wire: WireInstruction = (&instr).into();
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"kind\":\"pat\""));
    }

    #[test]
    fn concatenated_nests_children() {
        let a = crate::instruction::pattern(Buffer::F64(Rc::new(vec![1.0])));
        let b = crate::instruction::pattern(Buffer::F64(Rc::new(vec![2.0])));
        let cat = crate::instruction::concat(vec![a, b]).unwrap();
        let wire: WireInstruction = (&cat).into();
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"kind\":\"cat\""));
    }
}
