use serde::Serialize;
use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_VALIDATION", message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEPENDENCY", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    /// Root elevation was refused. Callers must surface this; nothing retries it.
    pub fn privilege(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_PRIVILEGE", message, trace_id)
    }

    pub fn parse(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_PARSE", message, trace_id)
    }

    pub fn is_privilege(&self) -> bool {
        self.code == "ERR_PRIVILEGE"
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

pub fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_caller_trace_id_and_generates_otherwise() {
        assert_eq!(resolve_trace_id(Some("abc".to_string())), "abc");
        let generated = resolve_trace_id(Some("  ".to_string()));
        assert_eq!(generated.len(), 36);
        assert_ne!(generated, resolve_trace_id(None));
    }

    #[test]
    fn privilege_errors_are_tagged() {
        let err = AppError::privilege("denied", "t-1");
        assert!(err.is_privilege());
        assert_eq!(err.to_string(), "denied (ERR_PRIVILEGE)");
        assert!(!AppError::system("boom", "t-1").is_privilege());
    }
}
