//! Input output module.
//!
//! Contains the run configuration, checkpoint naming and the gameplay data exchange format.
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};

use crate::{types::Observation, DqnError, Result};

mod checkpoint;
pub use checkpoint::*;
mod dqn;
pub use self::dqn::*;
pub mod fs;
mod gameplay;
pub use gameplay::*;

/// Serializes an n-dimensional array as nested lists, e.g. `[[0.0, 1.0], [0.5, 0.0]]`.
pub struct NestedListSerializer<'a>(pub ArrayViewD<'a, f32>);

impl<'a> Serialize for NestedListSerializer<'a> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.0.ndim() == 0 {
            return match self.0.iter().next() {
                Some(value) => serializer.serialize_f32(*value),
                None => serializer.serialize_none(),
            };
        }
        let mut seq = serializer.serialize_seq(Some(self.0.shape()[0]))?;
        for row in self.0.outer_iter() {
            seq.serialize_element(&NestedListSerializer(row))?;
        }
        seq.end()
    }
}

/// Convert an observation to nested JSON lists.
pub fn observation_to_json(observation: &Observation) -> serde_json::Value {
    // Serializing f32 numbers into a Value can't fail.
    serde_json::to_value(NestedListSerializer(observation.view())).unwrap_or_default()
}

fn collect_nested(
    value: &serde_json::Value,
    depth: usize,
    shape: &mut Vec<usize>,
    data: &mut Vec<f32>,
) -> std::result::Result<(), String> {
    match value {
        serde_json::Value::Number(number) => {
            if depth != shape.len() {
                return Err("arrays are not rectangular".to_string());
            }
            let number = number.as_f64().ok_or("invalid number")? as f32;
            if !number.is_finite() {
                return Err(format!("{} is out of range", value));
            }
            data.push(number);
            Ok(())
        }
        serde_json::Value::Array(items) => {
            if depth == shape.len() {
                // First list at this depth determines the dimension.
                if !data.is_empty() {
                    return Err("arrays are not rectangular".to_string());
                }
                shape.push(items.len());
            } else if shape[depth] != items.len() {
                return Err("arrays are not rectangular".to_string());
            }
            for item in items {
                collect_nested(item, depth + 1, shape, data)?;
            }
            Ok(())
        }
        _ => Err(format!("expected a number or a list, got {}", value)),
    }
}

/// Parse nested JSON lists of numbers into an observation.
/// Non-rectangular lists and scalars are rejected.
pub fn observation_from_json(value: &serde_json::Value) -> Result<Observation> {
    if !value.is_array() {
        return Err(DqnError::InvalidRecord(
            "observation must be a list".to_string(),
        ));
    }
    let mut shape = Vec::new();
    let mut data = Vec::new();
    collect_nested(value, 0, &mut shape, &mut data).map_err(DqnError::InvalidRecord)?;
    if data.len() != shape.iter().product::<usize>() {
        return Err(DqnError::InvalidRecord(
            "arrays are not rectangular".to_string(),
        ));
    }
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_lists() {
        let value = json!([[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]]);
        let observation = observation_from_json(&value).unwrap();
        assert_eq!(observation.shape(), &[2, 3]);
        assert_eq!(observation.iter().copied().collect::<Vec<f32>>(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(observation_to_json(&observation), value);

        let observation = observation_from_json(&json!([0.5, 1])).unwrap();
        assert_eq!(observation.shape(), &[2]);
    }

    #[test]
    fn rejects_malformed_lists() {
        for value in [
            json!([[1.0, 2.0], [3.0]]),
            json!([[1.0, 2.0], 3.0]),
            json!([1.0, [2.0, 3.0]]),
            json!([[1.0], ["a"]]),
            json!([[1.0], [-1e39]]),
            json!(1.5),
            json!({"state": [1.0]}),
        ] {
            assert!(
                matches!(observation_from_json(&value), Err(DqnError::InvalidRecord(_))),
                "{value} should be rejected"
            );
        }
    }
}
