use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum nesting depth accepted when constructing a `Dict`/`List` datapoint.
///
/// Children are owned (never shared), so a true cycle cannot be constructed —
/// this guard only catches runaway nesting from a malicious or buggy plugin.
const MAX_NESTING_DEPTH: usize = 64;

/// Tagged union over every value shape a south plugin can report.
///
/// The tag and the variant are the same Rust value (an enum discriminant),
/// so there is no way to read `Float` data through an `Integer` match arm —
/// the compiler enforces the invariant the source's C++ union relied on
/// callers to respect by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum DatapointValue {
    Integer(i64),
    Float(f64),
    Str(String),
    FloatArray(Vec<f64>),
    FloatArray2D(Vec<Vec<f64>>),
    DataBuffer { item_size: usize, data: Vec<u8> },
    Image { width: u32, height: u32, depth: u8, data: Vec<u8> },
    Dict(Vec<(String, DatapointValue)>),
    List(Vec<DatapointValue>),
}

impl DatapointValue {
    /// Short type-name used in OMF type signatures and error reporting.
    pub fn type_name(&self) -> &'static str {
        match self {
            DatapointValue::Integer(_) => "integer",
            DatapointValue::Float(_) => "float",
            DatapointValue::Str(_) => "string",
            DatapointValue::FloatArray(_) => "float_array",
            DatapointValue::FloatArray2D(_) => "float_2d_array",
            DatapointValue::DataBuffer { .. } => "data_buffer",
            DatapointValue::Image { .. } => "image",
            DatapointValue::Dict(_) => "dict",
            DatapointValue::List(_) => "list",
        }
    }

    /// Depth of the tree rooted at this value (0 for scalars).
    pub fn depth(&self) -> usize {
        match self {
            DatapointValue::Dict(children) => {
                1 + children.iter().map(|(_, v)| v.depth()).max().unwrap_or(0)
            }
            DatapointValue::List(children) => {
                1 + children.iter().map(|v| v.depth()).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// JSON representation used by `Reading::to_json`.
    ///
    /// `NaN`/`Infinity` floats serialize as JSON `null` with a one-line
    /// warning (§4.1) rather than producing invalid JSON.
    pub fn to_json_value(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            DatapointValue::Integer(v) => json!(v),
            DatapointValue::Float(v) => {
                if v.is_finite() {
                    json!(v)
                } else {
                    tracing::warn!(value = v, "non-finite float datapoint serialized as null");
                    Value::Null
                }
            }
            DatapointValue::Str(v) => json!(v),
            DatapointValue::FloatArray(v) => json!(v),
            DatapointValue::FloatArray2D(v) => json!(v),
            DatapointValue::DataBuffer { item_size, data } => {
                use base64::Engine;
                json!({
                    "item_size": item_size,
                    "data": base64::engine::general_purpose::STANDARD.encode(data),
                })
            }
            DatapointValue::Image { width, height, depth, data } => {
                use base64::Engine;
                json!({
                    "width": width,
                    "height": height,
                    "depth": depth,
                    "data": base64::engine::general_purpose::STANDARD.encode(data),
                })
            }
            DatapointValue::Dict(children) => {
                let mut m = serde_json::Map::new();
                for (name, v) in children {
                    m.insert(name.clone(), v.to_json_value());
                }
                Value::Object(m)
            }
            DatapointValue::List(children) => {
                Value::Array(children.iter().map(|v| v.to_json_value()).collect())
            }
        }
    }
}

/// One observation: an asset name, a timestamp pair, and ordered datapoints.
///
/// `id` is absent until the reading buffer (C5) assigns one on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub asset: String,
    pub user_ts: DateTime<Utc>,
    pub system_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub datapoints: Vec<(String, DatapointValue)>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadingError {
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("datapoint tree nesting ({depth}) exceeds the maximum ({MAX_NESTING_DEPTH})")]
    TooDeep { depth: usize },
}

impl Reading {
    pub fn new(asset: impl Into<String>, datapoint: (String, DatapointValue)) -> Self {
        let now = Utc::now();
        Self {
            asset: asset.into(),
            user_ts: now,
            system_ts: now,
            id: None,
            uuid: None,
            datapoints: vec![datapoint],
        }
    }

    pub fn with_datapoints(
        asset: impl Into<String>,
        datapoints: Vec<(String, DatapointValue)>,
    ) -> Self {
        let now = Utc::now();
        Self {
            asset: asset.into(),
            user_ts: now,
            system_ts: now,
            id: None,
            uuid: None,
            datapoints,
        }
    }

    pub fn add_datapoint(&mut self, name: impl Into<String>, value: DatapointValue) {
        self.datapoints.push((name.into(), value));
    }

    pub fn datapoint(&self, name: &str) -> Option<&DatapointValue> {
        self.datapoints.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// `{"asset":..,"user_ts":ISO8601,"readings":{…}}` — the wire shape
    /// consumed by HTTP-forward north plugins (OMF uses its own translator
    /// in `libs/omf`, not this method).
    pub fn to_json(&self) -> serde_json::Value {
        let mut readings = serde_json::Map::new();
        for (name, value) in &self.datapoints {
            readings.insert(name.clone(), value.to_json_value());
        }
        serde_json::json!({
            "asset": self.asset,
            "user_ts": self.user_ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "readings": readings,
        })
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, ReadingError> {
        #[derive(Deserialize)]
        struct Wire {
            asset: String,
            user_ts: DateTime<Utc>,
            readings: std::collections::BTreeMap<String, serde_json::Value>,
        }
        let wire: Wire = serde_json::from_value(value.clone())?;
        let datapoints = wire
            .readings
            .into_iter()
            .map(|(name, v)| (name, value_from_json(&v)))
            .collect();
        Ok(Self {
            asset: wire.asset,
            user_ts: wire.user_ts,
            system_ts: Utc::now(),
            id: None,
            uuid: None,
            datapoints,
        })
    }

    /// Validate nesting depth; call before accepting a Reading from an
    /// external boundary (ingest or deserialization).
    pub fn check_depth(&self) -> Result<(), ReadingError> {
        for (_, v) in &self.datapoints {
            let d = v.depth();
            if d > MAX_NESTING_DEPTH {
                return Err(ReadingError::TooDeep { depth: d });
            }
        }
        Ok(())
    }
}

fn value_from_json(v: &serde_json::Value) -> DatapointValue {
    match v {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                DatapointValue::Integer(i)
            } else {
                DatapointValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => DatapointValue::Str(s.clone()),
        serde_json::Value::Array(items) => {
            if items.iter().all(|i| i.is_number()) {
                DatapointValue::FloatArray(items.iter().filter_map(|i| i.as_f64()).collect())
            } else {
                DatapointValue::List(items.iter().map(value_from_json).collect())
            }
        }
        serde_json::Value::Object(map) => DatapointValue::Dict(
            map.iter().map(|(k, v)| (k.clone(), value_from_json(v))).collect(),
        ),
        _ => DatapointValue::Str(v.to_string()),
    }
}

/// Ordered batch of Readings plus the max id seen, used to drive cursors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadingSet {
    pub readings: Vec<Reading>,
    pub last_id: Option<u64>,
}

impl ReadingSet {
    pub fn new(readings: Vec<Reading>) -> Self {
        let last_id = readings.iter().filter_map(|r| r.id).max();
        Self { readings, last_id }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_fidelity_for_supported_primitives() {
        let mut r = Reading::new("luxometer", ("lux".into(), DatapointValue::Float(45204.524)));
        r.add_datapoint("label", DatapointValue::Str("east wing".into()));
        r.add_datapoint("count", DatapointValue::Integer(7));

        let json = r.to_json();
        let back = Reading::from_json(&json).unwrap();

        assert_eq!(back.asset, r.asset);
        assert_eq!(
            back.user_ts.timestamp_micros(),
            r.user_ts.timestamp_micros()
        );
        for (name, value) in &r.datapoints {
            assert_eq!(back.datapoint(name), Some(value));
        }
    }

    #[test]
    fn non_finite_float_serializes_as_null() {
        let r = Reading::new("sensor", ("x".into(), DatapointValue::Float(f64::NAN)));
        let json = r.to_json();
        assert!(json["readings"]["x"].is_null());
    }

    #[test]
    fn nesting_depth_guard_rejects_runaway_trees() {
        let mut v = DatapointValue::Dict(vec![]);
        for _ in 0..(MAX_NESTING_DEPTH + 1) {
            v = DatapointValue::Dict(vec![("child".into(), v)]);
        }
        let r = Reading::new("deep", ("tree".into(), v));
        assert!(r.check_depth().is_err());
    }
}
