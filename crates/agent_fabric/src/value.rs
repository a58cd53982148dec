//! Typed payload values carried inside envelopes.
//!
//! A [`Payload`] maps field names to [`Value`]s. Bulk data travels either as
//! [`Value::Bytes`] (opaque blobs, e.g. already-encoded camera frames) or as
//! [`Value::Array`] (raw little-endian numeric elements with a shape). Those
//! two are the only variants the codec compresses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Element type of an [`ArrayValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    U8,
    I16,
    U16,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

/// A dense n-dimensional array stored as raw little-endian bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    pub dtype: DType,
    pub shape: Vec<usize>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ArrayValue {
    /// Build an array from raw bytes, checking the byte count against the shape.
    pub fn from_raw(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, String> {
        let array = Self { dtype, shape, data };
        array.check_len()?;
        Ok(array)
    }

    /// Bytes the shape and dtype call for, or `None` on overflow.
    pub fn expected_bytes(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.size(), |acc, &dim| acc.checked_mul(dim))
    }

    /// Check the byte count against the shape.
    pub fn check_len(&self) -> Result<(), String> {
        match self.expected_bytes() {
            Some(expected) if expected == self.data.len() => Ok(()),
            Some(expected) => Err(format!(
                "array of shape {:?} and dtype {:?} needs {expected} bytes, got {}",
                self.shape,
                self.dtype,
                self.data.len()
            )),
            None => Err(format!("array shape {:?} overflows", self.shape)),
        }
    }

    /// A one-dimensional `f64` array.
    pub fn from_f64(values: &[f64]) -> Self {
        Self {
            dtype: DType::F64,
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// A one-dimensional `f32` array.
    pub fn from_f32(values: &[f32]) -> Self {
        Self {
            dtype: DType::F32,
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// An 8-bit image frame of `height x width x channels`.
    pub fn frame(height: usize, width: usize, channels: usize, pixels: Vec<u8>) -> Result<Self, String> {
        Self::from_raw(DType::U8, vec![height, width, channels], pixels)
    }

    /// Decode the elements as `f64`. Returns `None` for other dtypes.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        if self.dtype != DType::F64 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(c);
                    f64::from_le_bytes(buf)
                })
                .collect(),
        )
    }

    /// Decode the elements as `f32`. Returns `None` for other dtypes.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(c);
                    f32::from_le_bytes(buf)
                })
                .collect(),
        )
    }

    /// Number of elements actually stored.
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "v", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Must be finite; the codec rejects NaN and infinities.
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Array(ArrayValue),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Total size of the blob data (`Bytes` and `Array`) held by this value,
    /// including nested lists and maps.
    pub fn blob_size(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Array(a) => a.data.len(),
            Self::List(items) => items.iter().map(Value::blob_size).sum(),
            Self::Map(map) => map.values().map(Value::blob_size).sum(),
            _ => 0,
        }
    }

    /// First non-finite float found in this value, if any.
    pub(crate) fn find_non_finite(&self) -> Option<f64> {
        match self {
            Self::Float(f) if !f.is_finite() => Some(*f),
            Self::List(items) => items.iter().find_map(Value::find_non_finite),
            Self::Map(map) => map.values().find_map(Value::find_non_finite),
            _ => None,
        }
    }

    /// First array whose data does not fit its shape, if any.
    pub(crate) fn find_bad_array(&self) -> Option<String> {
        match self {
            Self::Array(a) => a.check_len().err(),
            Self::List(items) => items.iter().find_map(Value::find_bad_array),
            Self::Map(map) => map.values().find_map(Value::find_bad_array),
            _ => None,
        }
    }

    /// Apply `f` to every blob (`Bytes` data and `Array` data) in place.
    pub(crate) fn try_for_each_blob<E>(
        &mut self,
        f: &mut impl FnMut(&mut Vec<u8>) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Self::Bytes(b) => f(b),
            Self::Array(a) => f(&mut a.data),
            Self::List(items) => items.iter_mut().try_for_each(|v| v.try_for_each_blob(f)),
            Self::Map(map) => map.values_mut().try_for_each(|v| v.try_for_each_blob(f)),
            _ => Ok(()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<ArrayValue> for Value {
    fn from(v: ArrayValue) -> Self {
        Self::Array(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

/// An envelope's payload: an ordered mapping from field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub BTreeMap<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    /// A list of text values; `None` if the field is missing or holds
    /// anything other than text.
    pub fn get_str_list(&self, field: &str) -> Option<Vec<String>> {
        self.get(field)?
            .as_list()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total blob bytes across all fields.
    pub fn blob_size(&self) -> usize {
        self.0.values().map(Value::blob_size).sum()
    }

    pub(crate) fn find_non_finite(&self) -> Option<f64> {
        self.0.values().find_map(Value::find_non_finite)
    }

    pub(crate) fn find_bad_array(&self) -> Option<String> {
        self.0.values().find_map(Value::find_bad_array)
    }

    pub(crate) fn try_for_each_blob<E>(
        &mut self,
        mut f: impl FnMut(&mut Vec<u8>) -> Result<(), E>,
    ) -> Result<(), E> {
        self.0
            .values_mut()
            .try_for_each(|v| v.try_for_each_blob(&mut f))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
