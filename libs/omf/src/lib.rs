//! C8: the OMF (OSIsoft Message Format) transmit engine. Translates
//! Readings into OMF Type/Container/Data messages and POSTs them to a
//! historian's ingress endpoint.
//!
//! Ground: HTTP client shape from `plugins/storage/clickhouse`'s
//! `reqwest::Client` usage; the checksum-over-canonicalized-JSON idiom for
//! hint/type signatures from `crc32fast`, a crate this repo adopts fresh
//! (the teacher carries no checksum crate) per the same reasoning the
//! stream handler adopts `rand`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;

use tokio::sync::RwLock;

use edge_api::reading::{DatapointValue, Reading};

#[derive(Debug, thiserror::Error)]
pub enum OmfError {
    #[error("transport (retriable={retriable}): {message}")]
    Transport { retriable: bool, message: String },
    #[error("schema rejected: {0}")]
    SchemaReject(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NamingScheme {
    Concise,
    Suffix,
    Hash,
    Compatibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OmfEndpoint {
    PiWeb,
    Eds,
}

/// Unchanged suffix table (§4.8): id==1 is bare for `Concise`/`Hash`,
/// `-type{id}` otherwise, always `-type{id}` for `Suffix`/`Compatibility`.
pub fn type_suffix(scheme: NamingScheme, type_id: u32) -> String {
    match scheme {
        NamingScheme::Concise | NamingScheme::Hash => {
            if type_id <= 1 {
                String::new()
            } else {
                format!("-type{type_id}")
            }
        }
        NamingScheme::Suffix | NamingScheme::Compatibility => format!("-type{type_id}"),
    }
}

/// Data containerid: `{type_id}measurement_{asset}`, with `Hash`/
/// `Compatibility` on PI-Web prefixing a leading `_`. No `-type{id}` suffix;
/// that belongs to the type-name ids (`type_suffix`), never the container id.
pub fn measurement_id(scheme: NamingScheme, endpoint: OmfEndpoint, asset: &str, type_id: u32) -> String {
    let base = format!("{type_id}measurement_{asset}");
    match scheme {
        NamingScheme::Hash | NamingScheme::Compatibility => match endpoint {
            OmfEndpoint::PiWeb => format!("_{base}"),
            OmfEndpoint::Eds => base,
        },
        NamingScheme::Concise | NamingScheme::Suffix => base,
    }
}

const PI_FORBIDDEN: &[char] = &['*', '?', ';', '{', '}', '[', ']', '|', '\\', '`', '\'', '"'];

/// Control characters and the PI-Server forbidden set become `_`; returns
/// whether anything changed.
pub fn sanitize_pi_name(name: &str) -> (String, bool) {
    let mut changed = false;
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control() || PI_FORBIDDEN.contains(&c) {
                changed = true;
                '_'
            } else {
                c
            }
        })
        .collect();
    (sanitized, changed)
}

/// CRC-ish checksum over the hint object, canonicalized by sorting keys,
/// excluding `AFLocation` when its value is a literal string (it never
/// affects schema) and including everything else.
pub fn hint_checksum(hint: &serde_json::Value) -> u16 {
    let Some(obj) = hint.as_object() else { return 0 };
    let mut entries: Vec<(&String, &serde_json::Value)> =
        obj.iter().filter(|(k, v)| !(k.as_str() == "AFLocation" && v.is_string())).collect();
    entries.sort_by_key(|(k, _)| k.as_str());
    let canonical = serde_json::to_string(&entries).unwrap_or_default();
    (crc32fast::hash(canonical.as_bytes()) & 0xFFFF) as u16
}

fn datapoint_display(v: &DatapointValue) -> Option<String> {
    match v {
        DatapointValue::Integer(i) => Some(i.to_string()),
        DatapointValue::Float(f) => Some(f.to_string()),
        DatapointValue::Str(s) => Some(s.clone()),
        _ => None,
    }
}

/// Resolves `${var[:default]}` against the Reading's own datapoints, one
/// substitution per occurrence. A missing variable with no default elides
/// the whole `${...}` segment; the resulting doubled path separator folds.
pub fn resolve_af_location(template: &str, datapoints: &[(String, DatapointValue)]) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() && chars[i + 1] == '{' {
            if let Some(end_offset) = chars[i + 2..].iter().position(|&c| c == '}') {
                let inner: String = chars[i + 2..i + 2 + end_offset].iter().collect();
                let (var, default) = match inner.split_once(':') {
                    Some((v, d)) => (v, Some(d)),
                    None => (inner.as_str(), None),
                };
                let resolved = datapoints
                    .iter()
                    .find(|(k, _)| k == var)
                    .and_then(|(_, v)| datapoint_display(v))
                    .or_else(|| default.map(|d| d.to_string()));
                if let Some(value) = resolved {
                    out.push_str(&value);
                }
                i += 2 + end_offset + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    fold_double_slashes(&out)
}

fn fold_double_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_slash = false;
    for c in s.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

/// A name-rule or metadata-rule entry; `pattern` supports a trailing `*`
/// wildcard, exact match otherwise.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AfRule {
    pub pattern: String,
    pub path: String,
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => candidate.starts_with(prefix),
        None => pattern == candidate,
    }
}

fn match_af_rules(rules: &[AfRule], candidate: &str) -> Option<String> {
    rules.iter().find(|r| glob_match(&r.pattern, candidate)).map(|r| r.path.clone())
}

fn omf_type_name(v: &DatapointValue) -> Option<&'static str> {
    match v {
        DatapointValue::Str(_) => Some("string"),
        DatapointValue::Integer(_) => Some("integer"),
        DatapointValue::Float(_) => Some("float"),
        _ => None,
    }
}

fn omf_property(v: &DatapointValue) -> Option<serde_json::Value> {
    match v {
        DatapointValue::Str(_) => Some(serde_json::json!({"type": "string"})),
        DatapointValue::Integer(_) => Some(serde_json::json!({"type": "integer", "format": "int64"})),
        DatapointValue::Float(_) => Some(serde_json::json!({"type": "number", "format": "float64"})),
        _ => None,
    }
}

fn types_checksum(datapoints: &[(String, DatapointValue)]) -> u64 {
    let mut entries: Vec<(&str, &'static str)> =
        datapoints.iter().filter_map(|(k, v)| omf_type_name(v).map(|t| (k.as_str(), t))).collect();
    entries.sort();
    let canonical = serde_json::to_string(&entries).unwrap_or_default();
    crc32fast::hash(canonical.as_bytes()) as u64
}

fn group_adjacent_by_asset(readings: &[Reading]) -> Vec<(String, Vec<Reading>)> {
    let mut groups: Vec<(String, Vec<Reading>)> = Vec::new();
    for r in readings {
        match groups.last_mut() {
            Some((asset, group)) if asset.as_str() == r.asset.as_str() => group.push(r.clone()),
            _ => groups.push((r.asset.clone(), vec![r.clone()])),
        }
    }
    groups
}

#[derive(Debug, Clone)]
pub struct OmfTypeRecord {
    pub type_id: u32,
    pub types_checksum: u64,
    pub naming_scheme: NamingScheme,
    pub af_hash: u64,
    pub af_path: String,
    pub af_path_original: String,
    pub hint_checksum: u16,
}

#[derive(Debug)]
pub enum SendOutcome {
    Sent(usize),
    Failed { unsent: usize },
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct OmfEngineConfig {
    pub base_url: String,
    pub producer_token: String,
    #[serde(default = "default_naming_scheme")]
    pub naming_scheme: NamingScheme,
    #[serde(default = "default_endpoint")]
    pub endpoint: OmfEndpoint,
    #[serde(default = "default_company")]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_af_path")]
    pub default_af_path: String,
    #[serde(default)]
    pub name_rules: Vec<AfRule>,
    #[serde(default)]
    pub metadata_rules: Vec<AfRule>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_naming_scheme() -> NamingScheme {
    NamingScheme::Concise
}
fn default_endpoint() -> OmfEndpoint {
    OmfEndpoint::PiWeb
}
fn default_company() -> String {
    "edge".to_string()
}
fn default_af_path() -> String {
    "edge/default".to_string()
}
fn default_send_timeout_ms() -> u64 {
    10_000
}

pub struct OmfEngine {
    config: OmfEngineConfig,
    http: reqwest::Client,
    types: RwLock<HashMap<String, OmfTypeRecord>>,
    reported_unsupported: StdMutex<HashSet<String>>,
}

impl OmfEngine {
    pub fn new(config: OmfEngineConfig) -> Result<Self, OmfError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(std::time::Duration::from_millis(config.send_timeout_ms))
            .build()
            .map_err(|e| OmfError::Transport { retriable: false, message: format!("HTTP client: {e}") })?;
        Ok(Self { config, http, types: RwLock::new(HashMap::new()), reported_unsupported: StdMutex::new(HashSet::new()) })
    }

    /// Seeds the type cache from persisted state at startup (§4.8).
    pub async fn seed_cache(&self, entries: impl IntoIterator<Item = (String, OmfTypeRecord)>) {
        let mut types = self.types.write().await;
        for (asset, record) in entries {
            types.insert(asset, record);
        }
    }

    pub async fn send(&self, readings: &[Reading]) -> Result<SendOutcome, OmfError> {
        let groups = group_adjacent_by_asset(readings);
        let mut data_messages = Vec::new();
        let mut sent_count = 0usize;

        for (asset, group) in &groups {
            let type_id = self.ensure_type(asset, group).await?;
            let container_id = measurement_id(self.config.naming_scheme, self.config.endpoint, asset, type_id);
            let msgs = self.data_messages_for_group(&container_id, group);
            sent_count += msgs.len();
            data_messages.extend(msgs);
        }

        if data_messages.is_empty() {
            return Ok(SendOutcome::Sent(0));
        }

        match self.post_data(&data_messages).await {
            Ok(()) => Ok(SendOutcome::Sent(sent_count)),
            Err(OmfError::SchemaReject(_)) => {
                tracing::warn!("OMF Data rejected (schema), bumping type ids and retrying once");
                for (asset, group) in &groups {
                    self.bump_type(asset, group).await?;
                }
                match self.post_data(&data_messages).await {
                    Ok(()) => Ok(SendOutcome::Sent(sent_count)),
                    Err(OmfError::SchemaReject(_)) => {
                        tracing::warn!("OMF Data rejected twice, dropping batch");
                        Ok(SendOutcome::Failed { unsent: sent_count })
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_type(&self, asset: &str, group: &[Reading]) -> Result<u32, OmfError> {
        let sample = &group[0].datapoints;
        let hint = sample.iter().find(|(k, _)| k == "OMFHint").map(|(_, v)| v.to_json_value());
        let hint_cs = hint.as_ref().map(hint_checksum).unwrap_or(0);
        let sig_checksum = types_checksum(sample);

        let cached = self.types.read().await.get(asset).cloned();
        if let Some(rec) = &cached {
            if rec.types_checksum == sig_checksum && rec.hint_checksum == hint_cs {
                return Ok(rec.type_id);
            }
        }

        let next_id = cached.as_ref().map(|r| r.type_id + 1).unwrap_or(1);
        self.emit_type_messages(asset, next_id, sample).await?;
        self.emit_container_message(asset, next_id).await?;
        self.emit_static_data(asset, next_id).await?;
        let (af_path, af_path_original) = self.resolve_af_path(asset, sample, hint.as_ref());
        self.emit_link_data(asset, &af_path).await?;

        let record = OmfTypeRecord {
            type_id: next_id,
            types_checksum: sig_checksum,
            naming_scheme: self.config.naming_scheme,
            af_hash: crc32fast::hash(af_path.as_bytes()) as u64,
            af_path,
            af_path_original,
            hint_checksum: hint_cs,
        };
        self.types.write().await.insert(asset.to_string(), record);
        Ok(next_id)
    }

    async fn bump_type(&self, asset: &str, group: &[Reading]) -> Result<(), OmfError> {
        let type_id = {
            let mut types = self.types.write().await;
            let next_id = types.get(asset).map(|r| r.type_id + 1).unwrap_or(1);
            if let Some(rec) = types.get_mut(asset) {
                rec.type_id = next_id;
            }
            next_id
        };
        let sample = &group[0].datapoints;
        self.emit_type_messages(asset, type_id, sample).await?;
        self.emit_container_message(asset, type_id).await
    }

    fn resolve_af_path(
        &self,
        asset: &str,
        datapoints: &[(String, DatapointValue)],
        hint: Option<&serde_json::Value>,
    ) -> (String, String) {
        if let Some(loc) = hint.and_then(|h| h.get("AFLocation")).and_then(|v| v.as_str()) {
            return (resolve_af_location(loc, datapoints), loc.to_string());
        }
        if let Some(path) = match_af_rules(&self.config.name_rules, asset) {
            return (path.clone(), path);
        }
        for (dp_name, _) in datapoints {
            if let Some(path) = match_af_rules(&self.config.metadata_rules, dp_name) {
                return (path.clone(), path);
            }
        }
        (self.config.default_af_path.clone(), self.config.default_af_path.clone())
    }

    /// One Data element per Reading in `group` that carries a supported
    /// datapoint, all sharing `container_id`. Readings with no supported
    /// datapoint contribute nothing (Testable Property scenario 2/3).
    fn data_messages_for_group(&self, container_id: &str, group: &[Reading]) -> Vec<serde_json::Value> {
        group
            .iter()
            .filter_map(|r| {
                self.reading_to_values(r).map(|values| serde_json::json!({ "containerid": container_id, "values": [values] }))
            })
            .collect()
    }

    fn reading_to_values(&self, r: &Reading) -> Option<serde_json::Value> {
        let mut obj = serde_json::Map::new();
        let mut any_supported = false;
        let mut any_unsupported = false;
        for (name, v) in &r.datapoints {
            if name == "OMFHint" {
                continue;
            }
            if omf_type_name(v).is_some() {
                obj.insert(name.clone(), v.to_json_value());
                any_supported = true;
            } else {
                any_unsupported = true;
            }
        }
        if any_unsupported {
            self.report_unsupported_once(&r.asset);
        }
        if !any_supported {
            return None;
        }
        obj.insert("Time".into(), serde_json::json!(r.user_ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)));
        Some(serde_json::Value::Object(obj))
    }

    fn report_unsupported_once(&self, asset: &str) {
        let mut reported = self.reported_unsupported.lock().unwrap();
        if reported.insert(asset.to_string()) {
            tracing::warn!(asset, "reading carries OMF-unsupported datapoint types, dropped from measurement type");
        }
    }

    async fn emit_type_messages(&self, asset: &str, type_id: u32, sample: &[(String, DatapointValue)]) -> Result<(), OmfError> {
        let mut props = serde_json::Map::new();
        props.insert("Time".into(), serde_json::json!({"type": "string", "format": "date-time", "isindex": true}));
        let mut any_unsupported = false;
        for (name, v) in sample {
            if name == "OMFHint" {
                continue;
            }
            match omf_property(v) {
                Some(p) => {
                    props.insert(name.clone(), p);
                }
                None => any_unsupported = true,
            }
        }
        if any_unsupported {
            self.report_unsupported_once(asset);
        }

        let static_type = serde_json::json!({
            "id": format!("{type_id}_{asset}_typename_sensor"),
            "type": "object",
            "classification": "static",
            "properties": {
                "Company": {"type": "string"},
                "Location": {"type": "string"},
                "Name": {"type": "string", "isindex": true},
            }
        });
        let dynamic_type = serde_json::json!({
            "id": format!("{type_id}_{asset}_typename_measurement"),
            "type": "object",
            "classification": "dynamic",
            "properties": props,
        });

        self.post_message("Type", "create", &[static_type, dynamic_type]).await
    }

    async fn emit_container_message(&self, asset: &str, type_id: u32) -> Result<(), OmfError> {
        let container_id = measurement_id(self.config.naming_scheme, self.config.endpoint, asset, type_id);
        let container = serde_json::json!({
            "id": container_id,
            "typeid": format!("{type_id}_{asset}_typename_measurement"),
        });
        self.post_message("Container", "create", &[container]).await
    }

    async fn emit_static_data(&self, asset: &str, type_id: u32) -> Result<(), OmfError> {
        let (sanitized, _) = sanitize_pi_name(asset);
        let static_data = serde_json::json!({
            "typeid": format!("{type_id}_{asset}_typename_sensor"),
            "values": [{
                "Name": sanitized,
                "Company": self.config.company,
                "Location": self.config.location,
            }]
        });
        self.post_message("Data", "create", &[static_data]).await
    }

    async fn emit_link_data(&self, asset: &str, af_path: &str) -> Result<(), OmfError> {
        let (sanitized, _) = sanitize_pi_name(asset);
        let link = serde_json::json!({
            "typeid": "__Link",
            "values": [{
                "source": {"typeid": "FTypeObject", "name": af_path},
                "target": {"typeid": "FTypeObject", "name": sanitized},
            }]
        });
        self.post_message("Data", "create", &[link]).await
    }

    async fn post_data(&self, data_messages: &[serde_json::Value]) -> Result<(), OmfError> {
        self.post_message("Data", "create", data_messages).await
    }

    async fn post_message(&self, message_type: &str, action: &str, body: &[serde_json::Value]) -> Result<(), OmfError> {
        let resp = self
            .http
            .post(&self.config.base_url)
            .header("messagetype", message_type)
            .header("producertoken", &self.config.producer_token)
            .header("omfversion", "1.2")
            .header("messageformat", "JSON")
            .header("action", action)
            .json(body)
            .send()
            .await
            .map_err(|e| OmfError::Transport { retriable: true, message: e.to_string() })?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 409 {
            Err(OmfError::SchemaReject(format!("HTTP {status} from OMF endpoint")))
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(OmfError::Transport { retriable: true, message: format!("HTTP {status}") })
        } else {
            Err(OmfError::Transport { retriable: false, message: format!("HTTP {status}") })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_scheme_suffix_table_matches_spec() {
        assert_eq!(type_suffix(NamingScheme::Concise, 1), "");
        assert_eq!(type_suffix(NamingScheme::Concise, 2), "-type2");
        assert_eq!(type_suffix(NamingScheme::Suffix, 1), "-type1");
        assert_eq!(type_suffix(NamingScheme::Hash, 1), "");
        assert_eq!(type_suffix(NamingScheme::Hash, 3), "-type3");
        assert_eq!(type_suffix(NamingScheme::Compatibility, 1), "-type1");
    }

    #[test]
    fn measurement_id_prefixes_only_for_hash_and_compatibility() {
        assert_eq!(measurement_id(NamingScheme::Concise, OmfEndpoint::PiWeb, "asset_1", 1), "1measurement_asset_1");
        assert_eq!(measurement_id(NamingScheme::Hash, OmfEndpoint::PiWeb, "asset_1", 2), "_2measurement_asset_1");
        assert_eq!(measurement_id(NamingScheme::Compatibility, OmfEndpoint::Eds, "asset_1", 3), "3measurement_asset_1");
    }

    #[test]
    fn measurement_id_default_scheme_matches_data_containerid_scenario() {
        assert_eq!(measurement_id(NamingScheme::Concise, OmfEndpoint::PiWeb, "luxometer", 1234), "1234measurement_luxometer");
    }

    #[test]
    fn pi_name_sanitizes_forbidden_characters() {
        let (sanitized, changed) = sanitize_pi_name("bad*name?");
        assert_eq!(sanitized, "bad_name_");
        assert!(changed);
        let (sanitized, changed) = sanitize_pi_name("fine_name");
        assert_eq!(sanitized, "fine_name");
        assert!(!changed);
    }

    #[test]
    fn hint_checksum_ignores_literal_af_location_but_keys_on_order() {
        let a = serde_json::json!({"AFLocation": "a/b", "number": "float32"});
        let b = serde_json::json!({"number": "float32", "AFLocation": "different/path"});
        assert_eq!(hint_checksum(&a), hint_checksum(&b));

        let c = serde_json::json!({"number": "float64"});
        assert_ne!(hint_checksum(&a), hint_checksum(&c));
    }

    #[test]
    fn af_location_template_resolves_and_elides_missing_without_default() {
        let dps = vec![("line".to_string(), DatapointValue::Str("L1".to_string()))];
        assert_eq!(resolve_af_location("plant/${line}/cell", &dps), "plant/L1/cell");
        assert_eq!(resolve_af_location("plant/${missing:default}/cell", &dps), "plant/default/cell");
        assert_eq!(resolve_af_location("plant/${missing}/cell", &dps), "plant/cell");
    }

    fn test_config() -> OmfEngineConfig {
        OmfEngineConfig {
            base_url: "http://127.0.0.1:1/ignored".into(),
            producer_token: "tok".into(),
            naming_scheme: NamingScheme::Concise,
            endpoint: OmfEndpoint::PiWeb,
            company: "acme".into(),
            location: "site1".into(),
            default_af_path: "acme/site1".into(),
            name_rules: vec![],
            metadata_rules: vec![],
            accept_invalid_certs: false,
            send_timeout_ms: 100,
        }
    }

    fn reading_at(asset: &str, dp: (&str, DatapointValue), ts: &str) -> Reading {
        let user_ts = chrono::DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&chrono::Utc);
        Reading {
            asset: asset.to_string(),
            user_ts,
            system_ts: user_ts,
            id: Some(1),
            uuid: None,
            datapoints: vec![(dp.0.to_string(), dp.1)],
        }
    }

    #[test]
    fn unsupported_only_reading_contributes_no_value_object() {
        let engine = OmfEngine::new(test_config()).unwrap();
        let reading = Reading {
            asset: "pump1".into(),
            user_ts: chrono::Utc::now(),
            system_ts: chrono::Utc::now(),
            id: Some(1),
            uuid: None,
            datapoints: vec![("waveform".to_string(), DatapointValue::FloatArray(vec![1.0, 2.0]))],
        };
        assert!(engine.reading_to_values(&reading).is_none());
    }

    #[test]
    fn scenario_one_two_reading_omf_emission_matches_expected_wire_payload() {
        let engine = OmfEngine::new(test_config()).unwrap();
        let container_id = measurement_id(NamingScheme::Concise, OmfEndpoint::PiWeb, "luxometer", 1234);
        let readings = vec![
            reading_at("luxometer", ("lux", DatapointValue::Float(45204.524)), "2018-06-11T14:00:08.532958Z"),
            reading_at("luxometer", ("lux", DatapointValue::Float(76834.361)), "2018-08-21T14:00:09.329580Z"),
        ];

        let messages = engine.data_messages_for_group(&container_id, &readings);

        let expected = serde_json::json!([
            {"containerid": "1234measurement_luxometer", "values": [{"lux": 45204.524, "Time": "2018-06-11T14:00:08.532958Z"}]},
            {"containerid": "1234measurement_luxometer", "values": [{"lux": 76834.361, "Time": "2018-08-21T14:00:09.329580Z"}]},
        ]);
        assert_eq!(serde_json::Value::Array(messages), expected);
    }

    #[test]
    fn scenario_three_mixed_supported_unsupported_keeps_exactly_two_elements() {
        let engine = OmfEngine::new(test_config()).unwrap();
        let container_id = measurement_id(NamingScheme::Concise, OmfEndpoint::PiWeb, "mixed", 1);
        let readings = vec![
            reading_at("mixed", ("lux", DatapointValue::Float(1.0)), "2018-06-11T14:00:08.000000Z"),
            reading_at("mixed", ("waveform", DatapointValue::FloatArray(vec![1.0, 2.0])), "2018-06-11T14:00:09.000000Z"),
            reading_at("mixed", ("waveform", DatapointValue::FloatArray(vec![3.0])), "2018-06-11T14:00:10.000000Z"),
            reading_at("mixed", ("lux", DatapointValue::Float(2.0)), "2018-06-11T14:00:11.000000Z"),
            reading_at("mixed", ("waveform", DatapointValue::FloatArray(vec![4.0])), "2018-06-11T14:00:12.000000Z"),
        ];

        let messages = engine.data_messages_for_group(&container_id, &readings);

        assert_eq!(messages.len(), 2);
    }
}
