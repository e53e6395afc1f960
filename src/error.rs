use thiserror::Error;

/// Errors returned by the queue and its storage backends.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job must have a type")]
    MissingJobType,
    #[error("job type, {0}, is not registered")]
    UnknownJobType(String),
    #[error("jobs in one submission must share a type: expected {expected}, found {found}")]
    MixedJobTypes { expected: String, found: String },
    #[error("job type must have a name")]
    InvalidJobType,
    #[error("job type, {0}, is already registered")]
    JobTypeAlreadyRegistered(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("queue is not ready")]
    NotReady,
    #[error("queue is shutting down")]
    ShuttingDown,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl QueueError {
    /// True for input that was rejected before anything reached storage.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueueError::MissingJobType
                | QueueError::UnknownJobType(_)
                | QueueError::MixedJobTypes { .. }
                | QueueError::InvalidJobType
                | QueueError::JobTypeAlreadyRegistered(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn validation_errors_are_classified() {
        assert!(QueueError::MissingJobType.is_validation());
        assert!(QueueError::UnknownJobType("x".into()).is_validation());
        assert!(!QueueError::NotReady.is_validation());
        assert!(!QueueError::Storage(anyhow!("boom")).is_validation());
    }

    #[test]
    fn unknown_type_message_names_the_type() {
        let err = QueueError::UnknownJobType("email".into());
        assert_eq!(err.to_string(), "job type, email, is not registered");
    }
}
