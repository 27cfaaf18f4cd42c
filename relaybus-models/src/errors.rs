use std::fmt;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Coded failure for startup paths and handler results that have no richer type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    code: String,
    message: String,
}

impl RuntimeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn boxed(self) -> SendableError {
        Box::new(self)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RuntimeError {}
