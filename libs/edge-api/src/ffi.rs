//! FFI surface shared by the plugin host and every `.so` plugin.
//!
//! Host and plugins are expected to be built with the same compiler/ABI
//! (the `libloading` convention this whole workspace follows), so a
//! `Box<Box<dyn Trait>>` double-box round-trips safely across the
//! dynamic-library boundary: the outer `Box` is a thin pointer safe to
//! carry as `*mut ()`, the inner one restores the fat vtable pointer.

use crate::config::{ConfigParam, ConfigValues};
use crate::error::PluginError;

/// Bump whenever a plugin trait signature, `PluginCreateResult` layout, or
/// any FFI function signature changes in a binary-incompatible way.
pub const EDGE_ABI_VERSION: u32 = 1;

/// The kind of plugin being loaded — determines which symbols are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    South,
    North,
    Filter,
    Storage,
    NotificationRule,
    NotificationDelivery,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::South => "south",
            PluginKind::North => "north",
            PluginKind::Filter => "filter",
            PluginKind::Storage => "storage",
            PluginKind::NotificationRule => "notificationRule",
            PluginKind::NotificationDelivery => "notificationDelivery",
        }
    }
}

/// Metadata a plugin reports about itself via `plugin_info`.
#[derive(Debug, Clone)]
pub struct PluginInformation {
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    pub interface_version: String,
    pub flags: u32,
    pub config_default_json: serde_json::Value,
}

impl PluginInformation {
    /// Versions below "2.0.0" are normalized up, matching the source's
    /// downstream normalization so callers never branch on pre-2.0 strings.
    pub fn normalized_interface_version(&self) -> String {
        let below_2 = self
            .interface_version
            .split('.')
            .next()
            .and_then(|major| major.parse::<u32>().ok())
            .map(|major| major < 2)
            .unwrap_or(true);
        if below_2 {
            "2.0.0".to_string()
        } else {
            self.interface_version.clone()
        }
    }
}

#[repr(C)]
pub struct PluginCreateResult {
    /// `Box<Box<dyn Trait>>` as a thin pointer; null on failure.
    pub plugin_ptr: *mut (),
    /// `Box<String>` error message; null on success.
    pub error_ptr: *mut (),
}

unsafe impl Send for PluginCreateResult {}

pub type AbiVersionFn = unsafe extern "C" fn() -> u32;
pub type ConfigParamsFn = unsafe extern "C" fn() -> *mut ();
pub type CreatePluginFn = unsafe extern "C" fn(*const u8, usize) -> PluginCreateResult;
pub type DestroyPluginFn = unsafe extern "C" fn(*mut ());

pub fn plugin_ok<T: ?Sized>(val: Box<T>) -> PluginCreateResult {
    let boxed: Box<Box<T>> = Box::new(val);
    PluginCreateResult { plugin_ptr: Box::into_raw(boxed) as *mut (), error_ptr: std::ptr::null_mut() }
}

pub fn plugin_err(error: impl Into<String>) -> PluginCreateResult {
    let boxed: Box<String> = Box::new(error.into());
    PluginCreateResult { plugin_ptr: std::ptr::null_mut(), error_ptr: Box::into_raw(boxed) as *mut () }
}

/// Return config params from a plugin to the host. The host reconstructs
/// this as `Box<Vec<ConfigParam>>` and takes ownership.
pub fn config_params_ok(params: Vec<ConfigParam>) -> *mut () {
    Box::into_raw(Box::new(params)) as *mut ()
}

/// # Safety
/// `config_json_ptr` must point to `config_json_len` valid UTF-8 bytes.
pub unsafe fn parse_plugin_config<T: serde::de::DeserializeOwned>(
    config_json_ptr: *const u8,
    config_json_len: usize,
) -> Result<T, PluginError> {
    let bytes = unsafe { std::slice::from_raw_parts(config_json_ptr, config_json_len) };
    let s = std::str::from_utf8(bytes)
        .map_err(|e| PluginError::config(format!("invalid UTF-8 config: {e}")))?;
    serde_json::from_str(s).map_err(|e| PluginError::config(format!("invalid config JSON: {e}")))
}

/// Like [`parse_plugin_config`], but a null pointer or zero length parses
/// as `{}` instead of erroring — for plugins whose config is entirely
/// optional (every field has a `#[serde(default)]`).
///
/// # Safety
/// Same as `parse_plugin_config` when `config_json_ptr` is non-null.
pub unsafe fn parse_plugin_config_opt<T: serde::de::DeserializeOwned>(
    config_json_ptr: *const u8,
    config_json_len: usize,
) -> Result<T, PluginError> {
    if config_json_ptr.is_null() || config_json_len == 0 {
        return serde_json::from_str("{}")
            .map_err(|e| PluginError::config(format!("invalid default config JSON: {e}")));
    }
    unsafe { parse_plugin_config(config_json_ptr, config_json_len) }
}

/// Reconstruct `&ConfigValues` borrowed by the plugin from the host.
///
/// # Safety
/// `ptr` must be a valid pointer to a `ConfigValues` owned by the host for
/// the duration of the call.
pub unsafe fn config_from_ptr<'a>(ptr: *const ()) -> &'a ConfigValues {
    unsafe { &*(ptr as *const ConfigValues) }
}

#[macro_export]
macro_rules! edge_abi_version_fn {
    () => {
        #[unsafe(no_mangle)]
        pub extern "C" fn edge_abi_version() -> u32 {
            $crate::ffi::EDGE_ABI_VERSION
        }
    };
}

#[macro_export]
macro_rules! edge_destroy_fn {
    ($fn_name:ident, $trait_ty:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $fn_name(ptr: *mut ()) {
            if !ptr.is_null() {
                let _ = unsafe { Box::from_raw(ptr as *mut Box<dyn $trait_ty>) };
            }
        }
    };
}
