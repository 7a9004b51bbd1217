use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::common::TensorDesc;
use crate::error::TilingError;

/// A typed operator attribute value.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    BoolList(Vec<bool>),
}

/// The aggregated input to tiling: tensors in IR-signature order plus attributes.
///
/// Optional inputs which were not supplied are `None`. The platform descriptor is passed
/// alongside rather than stored, since one descriptor is shared by many workloads.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OperatorWorkload {
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<Option<TensorDesc>>,
    #[serde(default)]
    pub outputs: Vec<Option<TensorDesc>>,
    #[serde(default)]
    pub attrs: IndexMap<String, AttrValue>,
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Str(_) => "string",
            AttrValue::IntList(_) => "int list",
            AttrValue::BoolList(_) => "bool list",
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Str(v) => write!(f, "{v:?}"),
            AttrValue::IntList(v) => write!(f, "{v:?}"),
            AttrValue::BoolList(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::IntList(v)
    }
}

impl From<Vec<bool>> for AttrValue {
    fn from(v: Vec<bool>) -> Self {
        AttrValue::BoolList(v)
    }
}

impl OperatorWorkload {
    pub fn new(op_type: &str) -> Self {
        OperatorWorkload {
            op_type: op_type.to_string(),
            inputs: vec![],
            outputs: vec![],
            attrs: IndexMap::new(),
        }
    }

    pub fn with_input(mut self, desc: TensorDesc) -> Self {
        self.inputs.push(Some(desc));
        self
    }

    /// Appends an unsupplied optional input, keeping later inputs at their signature index.
    pub fn with_absent_input(mut self) -> Self {
        self.inputs.push(None);
        self
    }

    pub fn with_output(mut self, desc: TensorDesc) -> Self {
        self.outputs.push(Some(desc));
        self
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    /// Returns the required input at `idx`, failing with [TilingError::MissingTensor].
    pub fn input(&self, idx: usize, name: &str) -> Result<&TensorDesc, TilingError> {
        self.optional_input(idx)
            .ok_or_else(|| self.missing(format!("input {idx} ({name})")))
    }

    pub fn optional_input(&self, idx: usize) -> Option<&TensorDesc> {
        self.inputs.get(idx).and_then(Option::as_ref)
    }

    pub fn output(&self, idx: usize, name: &str) -> Result<&TensorDesc, TilingError> {
        self.outputs
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| self.missing(format!("output {idx} ({name})")))
    }

    /// Fails unless the number of declared tensors is within the operator's signature.
    pub fn check_arity(
        &self,
        min_inputs: usize,
        max_inputs: usize,
        outputs: usize,
    ) -> Result<(), TilingError> {
        if self.inputs.len() < min_inputs || self.inputs.len() > max_inputs {
            return Err(self.missing(format!(
                "expected {min_inputs}..={max_inputs} inputs, got {}",
                self.inputs.len()
            )));
        }
        if self.outputs.len() != outputs {
            return Err(self.missing(format!(
                "expected {outputs} outputs, got {}",
                self.outputs.len()
            )));
        }
        Ok(())
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn attr_bool(&self, name: &str, default: bool) -> Result<bool, TilingError> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttrValue::Bool(v)) => Ok(*v),
            Some(other) => Err(self.kind_mismatch(name, "bool", other)),
        }
    }

    pub fn attr_int(&self, name: &str, default: i64) -> Result<i64, TilingError> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.kind_mismatch(name, "int", other)),
        }
    }

    /// Reads a float attribute. Integer values are widened.
    pub fn attr_float(&self, name: &str, default: f64) -> Result<f64, TilingError> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v as f64),
            Some(other) => Err(self.kind_mismatch(name, "float", other)),
        }
    }

    pub fn attr_str<'a>(&'a self, name: &str, default: &'a str) -> Result<&'a str, TilingError> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttrValue::Str(v)) => Ok(v.as_str()),
            Some(other) => Err(self.kind_mismatch(name, "string", other)),
        }
    }

    /// Reads an int-list attribute. A scalar int is accepted as a one-element list.
    pub fn attr_int_list(&self, name: &str) -> Result<Option<Vec<i64>>, TilingError> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::IntList(v)) => Ok(Some(v.clone())),
            Some(AttrValue::Int(v)) => Ok(Some(vec![*v])),
            Some(other) => Err(self.kind_mismatch(name, "int list", other)),
        }
    }

    pub fn invalid_attr(&self, msg: impl Into<String>) -> TilingError {
        TilingError::InvalidAttribute(self.op_type.clone(), msg.into())
    }

    fn missing(&self, msg: String) -> TilingError {
        TilingError::MissingTensor(self.op_type.clone(), msg)
    }

    fn kind_mismatch(&self, name: &str, expected: &str, got: &AttrValue) -> TilingError {
        self.invalid_attr(format!(
            "{name} must be a {expected}, got {} {got}",
            got.kind()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;

    fn sample() -> OperatorWorkload {
        OperatorWorkload::new("AddLayerNorm")
            .with_input(TensorDesc::nd(&[4, 8], Dtype::Float16))
            .with_absent_input()
            .with_attr("epsilon", 0.01)
            .with_attr("additional_output", true)
            .with_attr("ksize", 3)
    }

    #[test]
    fn test_required_input_missing() {
        let w = sample();
        assert!(w.input(0, "x1").is_ok());
        assert!(matches!(
            w.input(1, "x2"),
            Err(TilingError::MissingTensor(..))
        ));
        assert!(matches!(
            w.input(7, "beta"),
            Err(TilingError::MissingTensor(..))
        ));
    }

    #[test]
    fn test_typed_accessors() {
        let w = sample();
        assert_eq!(w.attr_float("epsilon", 1e-5).unwrap(), 0.01);
        assert!(w.attr_bool("additional_output", false).unwrap());
        assert!(!w.attr_bool("absent", false).unwrap());
        assert_eq!(w.attr_int_list("ksize").unwrap(), Some(vec![3]));
        assert_eq!(w.attr_float("ksize", 0.0).unwrap(), 3.0);
    }

    #[test]
    fn test_kind_mismatch_is_invalid_attribute() {
        let w = sample();
        assert!(matches!(
            w.attr_bool("epsilon", false),
            Err(TilingError::InvalidAttribute(..))
        ));
        assert!(matches!(
            w.attr_str("ksize", "NCDHW"),
            Err(TilingError::InvalidAttribute(..))
        ));
    }

    #[test]
    fn test_workload_deserializes_from_json() {
        let w: OperatorWorkload = serde_json::from_str(
            r#"{
                "op_type": "MatMulV3",
                "inputs": [{"shape": [32, 64], "dtype": "fp16"},
                           {"shape": [64, 128], "dtype": "fp16"}, null],
                "outputs": [{"shape": [32, 128], "dtype": "fp16"}],
                "attrs": {"transpose_x1": false, "pads": [0, 0, 1, 1, 0, 0], "eps": 1e-5}
            }"#,
        )
        .unwrap();
        assert_eq!(w.inputs.len(), 3);
        assert!(w.optional_input(2).is_none());
        assert_eq!(
            w.attr_int_list("pads").unwrap(),
            Some(vec![0, 0, 1, 1, 0, 0])
        );
        assert_eq!(w.attr("eps"), Some(&AttrValue::Float(1e-5)));
        assert!(w.check_arity(2, 3, 1).is_ok());
        assert!(w.check_arity(2, 3, 2).is_err());
    }
}
