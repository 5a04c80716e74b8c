pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("proxy is not active")]
    NotActive,

    #[error("graphics context lost")]
    ContextLost,

    #[error("import error: {0}")]
    Import(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn import(msg: impl Into<String>) -> Self {
        Self::Import(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether the error is terminal for the owning context.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ContextLost | Self::NotActive)
    }
}
