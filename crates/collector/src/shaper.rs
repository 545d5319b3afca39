//! Payload decoding and point shaping.
//!
//! Workers hand raw payload bytes here; the shaper parses JSON, validates
//! the device identity and maps recognized scalars to store fields with a
//! fixed numeric type per field name. Two payload shapes are accepted
//! through one normalizer: the flat shape (fields at the root) and the
//! nested legacy shape (`telemetry.*` / `detection.*`).

use crate::point::{FieldValue, Point};
use serde_json::Value;
use thiserror::Error;

/// The measurement every shaped point is written under.
pub const MEASUREMENT: &str = "device_data";

/// Tag value identifying this collector implementation in stored points.
pub const COLLECTOR_LABEL: &str = "fleet-collector";

/// Fields stored as 64-bit floats. A field name never changes type.
const FLOAT_FIELDS: &[&str] = &[
    "speed",
    "cpu_usage",
    "ram_usage",
    "memory_percent",
    "disk_percent",
    "detection_confidence",
];

/// Fields stored as 64-bit integers.
const INT_FIELDS: &[&str] = &[
    "memory_total",
    "memory_used",
    "memory_available",
    "disk_total",
    "disk_used",
    "disk_free",
    "network_bytes_sent",
    "network_bytes_recv",
];

/// Errors from shaping a payload. Both variants are counted and the message
/// discarded; neither is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    /// Payload was not valid UTF-8 JSON or not an object.
    #[error("malformed payload: {0}")]
    Decode(String),
    /// Payload carried no `device_id`.
    #[error("payload has no device_id")]
    MissingIdentity,
}

/// Read-only view over one payload that resolves both accepted shapes.
struct PayloadView<'a> {
    root: &'a serde_json::Map<String, Value>,
}

impl<'a> PayloadView<'a> {
    fn nested(&self, path: &[&str]) -> Option<&'a Value> {
        let mut current = self.root.get(path[0])?;
        for key in &path[1..] {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    /// Resolves a recognized field name: flat key at the root wins, then
    /// the legacy nested location if there is one.
    fn lookup(&self, name: &str) -> Option<&'a Value> {
        if let Some(v) = self.root.get(name) {
            return Some(v);
        }
        match name {
            "cpu_usage" => self.nested(&["telemetry", "cpu_usage"]),
            "ram_usage" => self.nested(&["telemetry", "ram_usage"]),
            "memory_total" => self.nested(&["telemetry", "memory", "total"]),
            "memory_used" => self.nested(&["telemetry", "memory", "used"]),
            "memory_available" => self.nested(&["telemetry", "memory", "available"]),
            "memory_percent" => self.nested(&["telemetry", "memory", "percent"]),
            "disk_total" => self.nested(&["telemetry", "disk", "total"]),
            "disk_used" => self.nested(&["telemetry", "disk", "used"]),
            "disk_free" => self.nested(&["telemetry", "disk", "free"]),
            "disk_percent" => self.nested(&["telemetry", "disk", "percent"]),
            "network_bytes_sent" => self.nested(&["telemetry", "network", "bytes_sent"]),
            "network_bytes_recv" => self.nested(&["telemetry", "network", "bytes_recv"]),
            "detection_label" => self.nested(&["detection", "label"]),
            "detection_confidence" => self.nested(&["detection", "confidence"]),
            _ => None,
        }
    }
}

fn as_int(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// Decodes one payload into a point.
///
/// Unknown keys are ignored. The point's storage timestamp is left for the
/// store to assign; `collector_receive_time` and (when present in the
/// payload) `publish_timestamp` travel as plain fields instead.
pub fn shape_point(payload: &[u8], collector_receive_time: f64) -> Result<Point, ShapeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| ShapeError::Decode(e.to_string()))?;
    let root = value
        .as_object()
        .ok_or_else(|| ShapeError::Decode("payload is not a JSON object".into()))?;
    let view = PayloadView { root };

    let device_id = root
        .get("device_id")
        .and_then(Value::as_str)
        .ok_or(ShapeError::MissingIdentity)?;

    let mut point = Point::new(MEASUREMENT);
    point.tag("device_id", device_id);
    point.tag("collector", COLLECTOR_LABEL);
    if let Some(label) = view.lookup("detection_label").and_then(Value::as_str) {
        point.tag("detection_label", label);
    }

    for name in FLOAT_FIELDS {
        if let Some(v) = view.lookup(name).and_then(Value::as_f64) {
            point.field(name, FieldValue::Float(v));
        }
    }
    for name in INT_FIELDS {
        if let Some(v) = view.lookup(name).and_then(as_int) {
            point.field(name, FieldValue::Integer(v));
        }
    }

    point.field(
        "collector_receive_time",
        FieldValue::Float(collector_receive_time),
    );
    if let Some(ts) = root.get("timestamp").and_then(Value::as_f64) {
        point.field("publish_timestamp", FieldValue::Float(ts));
    }

    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_flat_payload() {
        let payload = br#"{
            "device_id": "e2e_test_001",
            "timestamp": 1700000000.5,
            "speed": 88.5,
            "cpu_usage": 55.0,
            "ram_usage": 65.0,
            "memory_total": 8589934592,
            "detection_label": "normal",
            "detection_confidence": 1.0
        }"#;

        let point = shape_point(payload, 1700000001.0).unwrap();
        assert_eq!(point.measurement, "device_data");
        assert_eq!(point.get_tag("device_id"), Some("e2e_test_001"));
        assert_eq!(point.get_tag("collector"), Some(COLLECTOR_LABEL));
        assert_eq!(point.get_tag("detection_label"), Some("normal"));
        assert_eq!(point.get_field("speed"), Some(&FieldValue::Float(88.5)));
        assert_eq!(
            point.get_field("memory_total"),
            Some(&FieldValue::Integer(8589934592))
        );
        assert_eq!(
            point.get_field("publish_timestamp"),
            Some(&FieldValue::Float(1700000000.5))
        );
        assert_eq!(
            point.get_field("collector_receive_time"),
            Some(&FieldValue::Float(1700000001.0))
        );
    }

    #[test]
    fn shapes_nested_legacy_payload() {
        let payload = br#"{
            "device_id": "veh_007",
            "timestamp": 1700000000.0,
            "speed": 42.0,
            "telemetry": {
                "cpu_usage": 12.5,
                "ram_usage": 48.0,
                "memory": {"total": 1024, "used": 512, "available": 512, "percent": 50.0},
                "disk": {"total": 2048, "used": 1024, "free": 1024, "percent": 50.0},
                "network": {"bytes_sent": 111, "bytes_recv": 222}
            },
            "detection": {"label": "yawning", "confidence": 0.88}
        }"#;

        let point = shape_point(payload, 1700000001.0).unwrap();
        assert_eq!(point.get_tag("detection_label"), Some("yawning"));
        assert_eq!(point.get_field("cpu_usage"), Some(&FieldValue::Float(12.5)));
        assert_eq!(
            point.get_field("memory_used"),
            Some(&FieldValue::Integer(512))
        );
        assert_eq!(
            point.get_field("network_bytes_recv"),
            Some(&FieldValue::Integer(222))
        );
        assert_eq!(
            point.get_field("detection_confidence"),
            Some(&FieldValue::Float(0.88))
        );
    }

    #[test]
    fn flat_keys_win_over_nested() {
        let payload = br#"{
            "device_id": "veh_008",
            "cpu_usage": 99.0,
            "telemetry": {"cpu_usage": 1.0}
        }"#;

        let point = shape_point(payload, 0.0).unwrap();
        assert_eq!(point.get_field("cpu_usage"), Some(&FieldValue::Float(99.0)));
    }

    #[test]
    fn rejects_missing_device_id() {
        let payload = br#"{"speed": 50.0}"#;
        assert_eq!(
            shape_point(payload, 0.0),
            Err(ShapeError::MissingIdentity)
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            shape_point(b"not json", 0.0),
            Err(ShapeError::Decode(_))
        ));
        assert!(matches!(
            shape_point(b"[1, 2, 3]", 0.0),
            Err(ShapeError::Decode(_))
        ));
        assert!(matches!(
            shape_point(&[0xff, 0xfe], 0.0),
            Err(ShapeError::Decode(_))
        ));
    }

    #[test]
    fn field_types_are_stable_across_json_representations() {
        // speed arrives as a JSON integer; the field is still a float
        let a = shape_point(br#"{"device_id": "d", "speed": 88}"#, 0.0).unwrap();
        let b = shape_point(br#"{"device_id": "d", "speed": 88.0}"#, 0.0).unwrap();
        assert_eq!(a.get_field("speed"), Some(&FieldValue::Float(88.0)));
        assert_eq!(a.get_field("speed"), b.get_field("speed"));

        // memory_total arrives as a JSON float; the field is still an integer
        let c = shape_point(br#"{"device_id": "d", "memory_total": 1024.0}"#, 0.0).unwrap();
        assert_eq!(
            c.get_field("memory_total"),
            Some(&FieldValue::Integer(1024))
        );
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let payload = br#"{"device_id": "d", "speed": 10.0, "firmware": "v2", "flags": [1]}"#;
        let point = shape_point(payload, 0.0).unwrap();
        assert!(point.get_field("firmware").is_none());
        assert_eq!(point.get_field("speed"), Some(&FieldValue::Float(10.0)));
    }

    #[test]
    fn redelivery_differs_only_in_receive_time() {
        let payload = br#"{"device_id": "d", "timestamp": 100.0, "speed": 10.0}"#;
        let first = shape_point(payload, 101.0).unwrap();
        let second = shape_point(payload, 102.0).unwrap();

        assert_eq!(first.get_field("speed"), second.get_field("speed"));
        assert_eq!(
            first.get_field("publish_timestamp"),
            second.get_field("publish_timestamp")
        );
        assert_ne!(
            first.get_field("collector_receive_time"),
            second.get_field("collector_receive_time")
        );
    }
}
