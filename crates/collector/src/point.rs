//! Measurement points and InfluxDB v2 Line Protocol encoding.
//!
//! Line Protocol format:
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2
//! ```
//!
//! Points deliberately carry no timestamp: the store assigns the write time,
//! which the latency queries compare against the `publish_timestamp` field.

use std::fmt;

/// A value stored in a point field.
///
/// Every field name in the pipeline has exactly one of these types for its
/// whole lifetime; emitting the same name with two numeric types produces
/// store-side type conflicts.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer, serialized with the `i` suffix.
    Integer(i64),
}

impl FieldValue {
    /// Format this value for Line Protocol.
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{v}"),
            FieldValue::Integer(v) => format!("{v}i"),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// One shaped measurement point, ready for the batching writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: &'static str,
    /// Tag key-value pairs (indexed, for filtering).
    pub tags: Vec<(&'static str, String)>,
    /// Field key-value pairs (the actual data).
    pub fields: Vec<(&'static str, FieldValue)>,
}

impl Point {
    pub fn new(measurement: &'static str) -> Self {
        Self {
            measurement,
            tags: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn tag(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        self.tags.push((key, value.into()));
        self
    }

    pub fn field(&mut self, key: &'static str, value: FieldValue) -> &mut Self {
        self.fields.push((key, value));
        self
    }

    /// Looks up a field by name.
    pub fn get_field(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Looks up a tag by name.
    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Encode this point as one Line Protocol line (no trailing newline).
    ///
    /// Tags are sorted by key for canonical form. The point must carry at
    /// least one field; the shaper guarantees this by always attaching
    /// `collector_receive_time`.
    pub fn to_line_protocol(&self) -> String {
        debug_assert!(!self.fields.is_empty(), "a point requires at least one field");

        let mut line = escape_name(self.measurement);

        let mut sorted_tags: Vec<_> = self.tags.iter().collect();
        sorted_tags.sort_by_key(|(k, _)| *k);
        for (key, value) in sorted_tags {
            line.push(',');
            line.push_str(&escape_name(key));
            line.push('=');
            line.push_str(&escape_name(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_name(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line
    }
}

/// Escape measurement names, tag keys/values and field keys per the Line
/// Protocol rules: commas, equals signs and spaces are backslash-escaped.
fn escape_name(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
