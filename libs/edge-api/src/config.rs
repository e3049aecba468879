//! Typed plugin configuration declarations.
//!
//! A plugin declares its accepted parameters via `ConfigParam`; the engine
//! validates a TOML/JSON config block against that declaration before the
//! plugin is created, and consults `ParamContext` to decide whether a
//! changed parameter can be hot-reloaded or requires tearing the plugin
//! down and rebuilding it (§4.3's all-or-nothing pipeline swap).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    I64,
    U64,
    F64,
    Str,
}

/// When a parameter may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamContext {
    /// Set at load time only; a change requires rebuilding the plugin.
    Postmaster,
    /// May be changed by a runtime reconfigure notification.
    Sighup,
}

#[derive(Debug, Clone)]
pub struct ConfigParam {
    pub name: String,
    pub param_type: ParamType,
    pub context: ParamContext,
    pub required: bool,
    pub default: Option<ParamValue>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
}

/// Validated config values handed to a plugin at creation time.
#[derive(Debug, Clone, Default)]
pub struct ConfigValues {
    entries: Vec<(String, ParamValue)>,
}

impl ConfigValues {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == &name) {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(ParamValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(ParamValue::U64(v)) => Some(*v),
            Some(ParamValue::I64(v)) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(ParamValue::F64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(ParamValue::Str(v)) => Some(v),
            _ => None,
        }
    }
}

/// Build `ConfigValues` from a declared parameter set and a raw TOML table,
/// applying defaults and enforcing `required`. Rejects unknown keys.
pub fn validate_and_build(
    declared: &[ConfigParam],
    raw: &toml::value::Table,
) -> Result<ConfigValues, String> {
    for key in raw.keys() {
        if !declared.iter().any(|p| &p.name == key) {
            return Err(format!("unknown config key '{key}'"));
        }
    }

    let mut values = ConfigValues::new();
    for param in declared {
        let parsed = match raw.get(&param.name) {
            Some(v) => Some(toml_to_param_value(&param.name, param.param_type, v)?),
            None => param.default.clone(),
        };
        match parsed {
            Some(v) => values.set(param.name.clone(), v),
            None if param.required => {
                return Err(format!("missing required config key '{}'", param.name))
            }
            None => {}
        }
    }
    Ok(values)
}

fn toml_to_param_value(
    name: &str,
    expected: ParamType,
    v: &toml::Value,
) -> Result<ParamValue, String> {
    match (expected, v) {
        (ParamType::Bool, toml::Value::Boolean(b)) => Ok(ParamValue::Bool(*b)),
        (ParamType::I64, toml::Value::Integer(i)) => Ok(ParamValue::I64(*i)),
        (ParamType::U64, toml::Value::Integer(i)) if *i >= 0 => Ok(ParamValue::U64(*i as u64)),
        (ParamType::F64, toml::Value::Float(f)) => Ok(ParamValue::F64(*f)),
        (ParamType::F64, toml::Value::Integer(i)) => Ok(ParamValue::F64(*i as f64)),
        (ParamType::Str, toml::Value::String(s)) => Ok(ParamValue::Str(s.clone())),
        _ => Err(format!("config key '{name}' has the wrong type for {expected:?}")),
    }
}

/// Given the running config and a proposed new one, return the names of
/// parameters that changed. Callers compare this against each parameter's
/// declared `ParamContext` to decide hot-reload vs. full rebuild.
pub fn changed_params(declared: &[ConfigParam], old: &ConfigValues, new: &ConfigValues) -> Vec<String> {
    declared
        .iter()
        .filter(|p| old.get(&p.name) != new.get(&p.name))
        .map(|p| p.name.clone())
        .collect()
}

/// `true` if every changed parameter is `Sighup`-context (safe to hot-reload).
pub fn only_sighup_changed(declared: &[ConfigParam], changed: &[String]) -> bool {
    changed.iter().all(|name| {
        declared
            .iter()
            .find(|p| &p.name == name)
            .map(|p| p.context == ParamContext::Sighup)
            .unwrap_or(false)
    })
}
