//! InfluxDB v2 store client.
//!
//! Writes batched Line Protocol over `/api/v2/write` and runs the Flux
//! queries the harness depends on (`/api/v2/query`, plain-CSV dialect).
//! Write failures are classified into retriable and non-retriable kinds so
//! the batching writer can decide whether to back off or abandon a batch.

use chrono::DateTime;
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Connection settings for the time-series store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network-layer failure; the write may have never reached the store.
    #[error("store transport error: {0}")]
    Transport(String),

    /// The store is unhealthy or throttling (5xx / 429).
    #[error("store unavailable (status {code}): {body}")]
    Unavailable { code: u16, body: String },

    /// A field in the batch conflicts with the type already established
    /// for that field name.
    #[error("store field type conflict: {0}")]
    SchemaConflict(String),

    /// Token or permissions rejected.
    #[error("store authorization rejected (status {code})")]
    Unauthorized { code: u16 },

    /// Any other rejection of the request itself (malformed batch etc.).
    #[error("store rejected request (status {code}): {body}")]
    Rejected { code: u16, body: String },

    /// A query succeeded at the HTTP level but returned CSV this client
    /// could not interpret.
    #[error("malformed query response: {0}")]
    QueryResponse(String),
}

impl StoreError {
    /// Retriable errors are backed off and retried by the writer;
    /// everything else aborts the batch.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Unavailable { .. })
    }
}

/// Classify a write response status into success or a [`StoreError`].
fn classify_write_status(code: u16, body: &str) -> Result<(), StoreError> {
    match code {
        204 => Ok(()),
        401 | 403 => Err(StoreError::Unauthorized { code }),
        400 | 422 if body.contains("type conflict") || body.contains("field type") => {
            Err(StoreError::SchemaConflict(body.to_string()))
        }
        429 => Err(StoreError::Unavailable {
            code,
            body: body.to_string(),
        }),
        500..=599 => Err(StoreError::Unavailable {
            code,
            body: body.to_string(),
        }),
        _ => Err(StoreError::Rejected {
            code,
            body: body.to_string(),
        }),
    }
}

/// One latency observation: a stored `publish_timestamp` field value with
/// its storage-assigned write time.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencySample {
    pub device_id: String,
    /// Device-side send time, seconds since epoch.
    pub publish_timestamp: f64,
    /// Store-assigned write time, seconds since epoch.
    pub write_time: f64,
}

/// Last-seen information for one device, derived from its newest stored
/// `speed` field.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLastSeen {
    pub device_id: String,
    /// Seconds since epoch of the newest stored point.
    pub last_seen: f64,
    /// A device is online iff its newest point is younger than 10 s.
    pub online: bool,
}

/// HTTP client for one InfluxDB org/bucket.
#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    config: StoreConfig,
}

impl StoreClient {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Health probe used by connect-required startup.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let url = format!("{}/ping", self.config.url);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                code: resp.status().as_u16(),
                body: String::new(),
            })
        }
    }

    /// Writes one batch of Line Protocol lines.
    pub async fn write_lines(&self, body: String) -> Result<(), StoreError> {
        let url = format!("{}/api/v2/write", self.config.url);
        let resp = self
            .http
            .post(url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let code = resp.status().as_u16();
        if code == 204 {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        classify_write_status(code, &body)
    }

    /// Runs a Flux query, returning plain CSV (no annotations, with header).
    pub async fn query_csv(&self, flux: &str) -> Result<String, StoreError> {
        let url = format!("{}/api/v2/query", self.config.url);
        let resp = self
            .http
            .post(url)
            .query(&[("org", self.config.org.as_str())])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Accept", "application/csv")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": { "annotations": [], "header": true },
            }))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let code = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if code == 200 {
            Ok(text)
        } else {
            classify_write_status(code, &text).map(|()| String::new())
        }
    }

    /// Fetches all `publish_timestamp` values written in the last `window`,
    /// with their storage-assigned write times.
    pub async fn latency_samples(
        &self,
        window: Duration,
    ) -> Result<Vec<LatencySample>, StoreError> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: -{secs}s)
  |> filter(fn: (r) => r._measurement == "device_data")
  |> filter(fn: (r) => r._field == "publish_timestamp")
  |> keep(columns: ["_time", "_value", "device_id"])"#,
            bucket = self.config.bucket,
            secs = window.as_secs(),
        );
        let csv = self.query_csv(&flux).await?;

        let mut samples = Vec::new();
        for row in parse_csv_tables(&csv, &["_time", "_value", "device_id"])? {
            samples.push(LatencySample {
                write_time: parse_rfc3339_seconds(&row[0])?,
                publish_timestamp: row[1]
                    .parse::<f64>()
                    .map_err(|e| StoreError::QueryResponse(e.to_string()))?,
                device_id: row[2].clone(),
            });
        }
        Ok(samples)
    }

    /// Last-seen per device over the last hour, from the newest `speed`
    /// field. Accepts the legacy `vehicle_speed` measurement alongside
    /// `device_data`.
    pub async fn device_last_seen(&self) -> Result<Vec<DeviceLastSeen>, StoreError> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: -1h)
  |> filter(fn: (r) => r._measurement == "device_data" or r._measurement == "vehicle_speed")
  |> filter(fn: (r) => r._field == "speed")
  |> group(columns: ["device_id"])
  |> last()
  |> keep(columns: ["device_id", "_time"])"#,
            bucket = self.config.bucket,
        );
        let csv = self.query_csv(&flux).await?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut devices = Vec::new();
        for row in parse_csv_tables(&csv, &["device_id", "_time"])? {
            let last_seen = parse_rfc3339_seconds(&row[1])?;
            devices.push(DeviceLastSeen {
                device_id: row[0].clone(),
                last_seen,
                online: now - last_seen < 10.0,
            });
        }
        Ok(devices)
    }
}

fn parse_rfc3339_seconds(s: &str) -> Result<f64, StoreError> {
    let dt = DateTime::parse_from_rfc3339(s)
        .map_err(|e| StoreError::QueryResponse(format!("bad _time {s:?}: {e}")))?;
    Ok(dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9)
}

/// Extracts the named columns from every data row of a plain-CSV Flux
/// response. Tables are separated by blank lines, each with its own header.
fn parse_csv_tables(csv: &str, columns: &[&str]) -> Result<Vec<Vec<String>>, StoreError> {
    let mut rows = Vec::new();
    let mut indices: Option<Vec<usize>> = None;

    for line in csv.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            indices = None; // next non-empty line is a new table header
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();

        match &indices {
            None => {
                let mapped = columns
                    .iter()
                    .map(|c| fields.iter().position(|f| f == c))
                    .collect::<Option<Vec<usize>>>()
                    .ok_or_else(|| {
                        StoreError::QueryResponse(format!(
                            "header {line:?} is missing one of {columns:?}"
                        ))
                    })?;
                indices = Some(mapped);
            }
            Some(mapped) => {
                let mut row = Vec::with_capacity(mapped.len());
                for &i in mapped {
                    let value = fields.get(i).ok_or_else(|| {
                        StoreError::QueryResponse(format!("short row {line:?}"))
                    })?;
                    row.push((*value).to_string());
                }
                rows.push(row);
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_status_classification() {
        assert!(classify_write_status(204, "").is_ok());
        assert!(matches!(
            classify_write_status(401, ""),
            Err(StoreError::Unauthorized { code: 401 })
        ));
        assert!(matches!(
            classify_write_status(400, "partial write: field type conflict"),
            Err(StoreError::SchemaConflict(_))
        ));
        assert!(matches!(
            classify_write_status(400, "unable to parse line"),
            Err(StoreError::Rejected { code: 400, .. })
        ));
        assert!(matches!(
            classify_write_status(503, "service unavailable"),
            Err(StoreError::Unavailable { code: 503, .. })
        ));
        assert!(matches!(
            classify_write_status(429, "over quota"),
            Err(StoreError::Unavailable { code: 429, .. })
        ));
    }

    #[test]
    fn retriable_split_matches_policy() {
        assert!(StoreError::Transport("reset".into()).is_retriable());
        assert!(StoreError::Unavailable {
            code: 502,
            body: String::new()
        }
        .is_retriable());
        assert!(!StoreError::SchemaConflict("speed".into()).is_retriable());
        assert!(!StoreError::Unauthorized { code: 403 }.is_retriable());
        assert!(!StoreError::Rejected {
            code: 400,
            body: String::new()
        }
        .is_retriable());
    }

    #[test]
    fn parses_plain_csv_tables() {
        let csv = "\
,result,table,_time,_value,device_id\r
,_result,0,2026-08-01T10:00:00.5Z,1753999200.1,veh_001\r
,_result,0,2026-08-01T10:00:01Z,1753999201.2,veh_002\r
\r
,result,table,_time,_value,device_id\r
,_result,1,2026-08-01T10:00:02Z,1753999202.3,veh_003\r
";
        let rows = parse_csv_tables(csv, &["_time", "_value", "device_id"]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][2], "veh_001");
        assert_eq!(rows[2][1], "1753999202.3");
    }

    #[test]
    fn missing_column_is_a_query_response_error() {
        let csv = ",result,table,_time\n,_result,0,2026-08-01T10:00:00Z\n";
        assert!(matches!(
            parse_csv_tables(csv, &["_time", "_value"]),
            Err(StoreError::QueryResponse(_))
        ));
    }

    #[test]
    fn rfc3339_to_epoch_seconds() {
        let secs = parse_rfc3339_seconds("1970-01-01T00:01:00.250Z").unwrap();
        assert!((secs - 60.25).abs() < 1e-9);
    }
}
