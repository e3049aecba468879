/// Category of an error raised by a plugin or a core component.
///
/// Lets a caller branch on the *shape* of the failure instead of matching
/// on message text: a storage-busy retry loop only cares that this is
/// `Transport`, not which backend produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration — permanent, fail at startup.
    Config,
    /// I/O or network error — transient, may retry.
    Io,
    /// Data format/parse error — bad input, skip record.
    Format,
    /// Plugin lifecycle error (load, init, symbol resolution).
    Plugin,
    /// Logical error (not found, invalid state).
    Logic,
    /// Downstream transport rejected the request (HTTP 4xx/5xx, schema reject).
    Transport,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Format => "format",
            ErrorKind::Plugin => "plugin",
            ErrorKind::Logic => "logic",
            ErrorKind::Transport => "transport",
        };
        f.write_str(s)
    }
}

/// Unified error type crossing a plugin ABI boundary.
///
/// Carries a [`ErrorKind`] plus a message. `From` impls assign the kind
/// automatically so plugin code can use `?` without manual wrapping.
#[derive(Clone)]
pub struct PluginError {
    kind: ErrorKind,
    message: String,
}

impl PluginError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn format_err(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Format, message: msg.into() }
    }

    pub fn plugin(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Plugin, message: msg.into() }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Transport, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prepend context, preserving the kind.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self { kind: self.kind, message: format!("{ctx}: {}", self.message) }
    }
}

impl std::fmt::Debug for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<String> for PluginError {
    fn from(s: String) -> Self {
        Self { kind: ErrorKind::Logic, message: s }
    }
}

impl From<&str> for PluginError {
    fn from(s: &str) -> Self {
        Self { kind: ErrorKind::Logic, message: s.to_string() }
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        Self { kind: ErrorKind::Io, message: e.to_string() }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self { kind: ErrorKind::Format, message: e.to_string() }
    }
}
