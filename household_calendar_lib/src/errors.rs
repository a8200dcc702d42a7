use anyhow::Error as AnyhowError;
use stack_string::StackString;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("ValidationError {field}: {message}")]
    ValidationError {
        field: &'static str,
        message: StackString,
    },
    #[error("FetchError {0}")]
    FetchError(AnyhowError),
    #[error("PersistenceError {0}")]
    PersistenceError(AnyhowError),
    #[error("Notification permission not granted")]
    PermissionDenied,
    #[error("ConfigError {0}")]
    ConfigError(StackString),
    #[error("EmailError {0}")]
    EmailError(AnyhowError),
}

impl CalendarError {
    pub fn validation(field: &'static str, message: impl Into<StackString>) -> Self {
        Self::ValidationError {
            field,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ConfigError(_))
    }
}
