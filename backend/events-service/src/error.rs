use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised while loading the pipeline's configuration
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Config("NATS_BATCH_SIZE must be greater than 0".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: NATS_BATCH_SIZE must be greater than 0"
        );
    }

    #[test]
    fn test_env_error_keeps_its_cause() {
        let err = PipelineError::from(envy::Error::MissingValue("batch_size"));

        assert!(err.to_string().starts_with("Environment error:"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
