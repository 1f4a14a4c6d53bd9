use std::fmt;

/// A message produced during a sync that the operator should see.
///
/// Library code collects these instead of printing; the CLI decides how to
/// show them, and `emit` forwards them to the tracing subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Info(String),
    /// Something was skipped or degraded but the sync continued.
    Warning(String),
    /// Something failed; whether it was fatal depends on the caller.
    Error(String),
}

impl Feedback {
    pub fn info(msg: impl Into<String>) -> Self {
        Self::Info(msg.into())
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self::Warning(msg.into())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Info(msg) | Self::Warning(msg) | Self::Error(msg) => msg,
        }
    }

    /// Forward to the tracing subscriber at the matching level.
    pub fn emit(&self, scope: &str) {
        match self {
            Self::Info(msg) => tracing::info!(scope, "{msg}"),
            Self::Warning(msg) => tracing::warn!(scope, "{msg}"),
            Self::Error(msg) => tracing::error!(scope, "{msg}"),
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info(msg) => write!(f, "{msg}"),
            Self::Warning(msg) => write!(f, "warning: {msg}"),
            Self::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}
