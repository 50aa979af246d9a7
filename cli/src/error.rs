//! CLI failure classification and exit codes.

use thiserror::Error;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("authentication failed; run `uniroute login`")]
    Auth,

    #[error("subdomain conflict: {0}")]
    Conflict(String),

    #[error("capacity or quota exceeded: {0}")]
    Capacity(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Auth => 2,
            CliError::Conflict(_) => 3,
            CliError::Capacity(_) => 4,
            CliError::Other(_) => 1,
        }
    }

    /// Classify an HTTP status from the edge.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            401 => CliError::Auth,
            409 => CliError::Conflict(context.to_string()),
            429 | 503 => CliError::Capacity(context.to_string()),
            _ => CliError::Other(anyhow::anyhow!("{context} (status {status})")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Auth.exit_code(), 2);
        assert_eq!(CliError::Conflict("x".into()).exit_code(), 3);
        assert_eq!(CliError::Capacity("x".into()).exit_code(), 4);
        assert_eq!(
            CliError::Other(anyhow::anyhow!("boom")).exit_code(),
            1
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(CliError::from_status(401, ""), CliError::Auth));
        assert!(matches!(
            CliError::from_status(409, "taken"),
            CliError::Conflict(_)
        ));
        assert!(matches!(
            CliError::from_status(503, ""),
            CliError::Capacity(_)
        ));
        assert!(matches!(
            CliError::from_status(500, ""),
            CliError::Other(_)
        ));
    }
}
