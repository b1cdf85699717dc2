use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("feedback error: {0}")]
    Feedback(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ForemanError>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ForemanError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}
