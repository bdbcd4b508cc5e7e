// Series decoding - turns an analytics payload into ordered datapoints
//
// Payload shape:
// {"products": {"<product>": {"<metric>": {"<dimension>": [[ts, value], ...]}}}}

use serde_json::Value;
use thiserror::Error;

use crate::azion::MetricQuery;

/// One (timestamp, value) sample of an upstream series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    /// Seconds since the epoch as reported by the API
    pub timestamp: i64,

    /// `None` when the API reports `null` for the bucket
    pub value: Option<f64>,
}

/// Errors produced when a payload does not have the expected shape
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing key '{key}' under '{path}'")]
    MissingKey { path: String, key: String },

    #[error("expected {expected} at '{path}'")]
    UnexpectedShape { path: String, expected: &'static str },
}

/// Extracts the series addressed by `query`, sorted ascending by timestamp.
///
/// An empty payload or a `null` series decode to an empty series.
pub fn decode_series(payload: &[u8], query: &MetricQuery) -> Result<Vec<Datapoint>, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let root: Value = serde_json::from_slice(payload)?;

    let mut node = &root;
    let mut path = String::new();
    for key in [
        "products",
        query.product.as_str(),
        query.metric.as_str(),
        query.dimension.as_str(),
    ] {
        let object = node.as_object().ok_or_else(|| DecodeError::UnexpectedShape {
            path: display_path(&path),
            expected: "an object",
        })?;
        node = object.get(key).ok_or_else(|| DecodeError::MissingKey {
            path: display_path(&path),
            key: key.to_string(),
        })?;
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(key);
    }

    let entries = match node {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        _ => {
            return Err(DecodeError::UnexpectedShape {
                path,
                expected: "an array of [timestamp, value] pairs",
            })
        }
    };

    let mut datapoints = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| decode_pair(entry).ok_or_else(|| DecodeError::UnexpectedShape {
            path: format!("{}[{}]", path, index),
            expected: "a [timestamp, value] pair",
        }))
        .collect::<Result<Vec<_>, _>>()?;

    datapoints.sort_by_key(|datapoint| datapoint.timestamp);
    Ok(datapoints)
}

fn decode_pair(entry: &Value) -> Option<Datapoint> {
    let pair = entry.as_array()?;
    if pair.len() < 2 {
        return None;
    }

    let timestamp = match &pair[0] {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        _ => return None,
    };

    let value = match &pair[1] {
        Value::Null => None,
        Value::Number(n) => Some(n.as_f64()?),
        _ => return None,
    };

    Some(Datapoint { timestamp, value })
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}
