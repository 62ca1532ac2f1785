pub mod salt;

use crate::config::InterfacesConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Latest telemetry for one host, as written to its device row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub uptime: String,
    pub wired: i64,
    pub wireless: i64,
}

/// Parsed result of one collection call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    pub records: BTreeMap<String, TelemetryRecord>,
    /// Hosts present in the consulted batch, including dropped ones.
    pub reported: usize,
    /// Hosts that reported nothing or whose payload failed to parse.
    pub dropped: usize,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("запрос к salt-api не выполнен")]
    Http(#[from] reqwest::Error),
    #[error("salt-api отклонил учётные данные: {0}")]
    Auth(reqwest::StatusCode),
    #[error("salt-api вернул статус {0}")]
    Status(reqwest::StatusCode),
    #[error("неожиданный ответ salt-api: {0}")]
    Envelope(String),
}

/// Source of per-host telemetry for a whole fleet.
#[async_trait]
pub trait FleetSource: Send + Sync {
    async fn retrieve_data(&self) -> Result<FleetReport, CollectError>;
}

/// Turns one batch of `host -> payload` into records. `null` payloads are
/// skipped, anything that is not a parseable string payload is dropped.
pub fn parse_batch(
    batch: &serde_json::Map<String, Value>,
    interfaces: &InterfacesConfig,
) -> FleetReport {
    let mut report = FleetReport {
        reported: batch.len(),
        ..FleetReport::default()
    };
    for (host, payload) in batch {
        let record = match payload {
            Value::String(raw) => parse_host_report(raw, interfaces),
            Value::Null => None,
            other => {
                tracing::debug!(host = %host, payload = %other, "ответ хоста не является строкой");
                None
            }
        };
        match record {
            Some(record) => {
                report.records.insert(host.clone(), record);
            }
            None => {
                tracing::debug!(host = %host, "хост пропущен: нет пригодных данных");
                report.dropped += 1;
            }
        }
    }
    report
}

/// Parses one host's command output. Returns `None` on any problem so a
/// single bad host never yields a partial record.
pub fn parse_host_report(raw: &str, interfaces: &InterfacesConfig) -> Option<TelemetryRecord> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    let uptime = object.get("uptime")?.as_str()?.to_string();
    Some(TelemetryRecord {
        uptime,
        wired: sum_counters(object, &interfaces.wired)?,
        wireless: sum_counters(object, &interfaces.wireless)?,
    })
}

fn sum_counters(
    object: &serde_json::Map<String, Value>,
    names: &BTreeSet<String>,
) -> Option<i64> {
    names.iter().try_fold(0_i64, |acc, name| {
        let bytes = counter_value(object.get(name)?)?;
        acc.checked_add(i64::try_from(bytes).ok()?)
    })
}

fn counter_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
