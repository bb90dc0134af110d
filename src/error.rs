use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("coverage error: {0}")]
    Coverage(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(String),
}

pub type Result<T> = std::result::Result<T, Error>;
