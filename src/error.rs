use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Container name conflict: {0} already exists")]
    NameConflict(String),

    #[error("Build stream already open for job {0}")]
    StreamAlreadyOpen(String),

    #[error("Container {name} not healthy after {attempts} attempts")]
    HealthCheckTimeout { name: String, attempts: u32 },

    #[error("Build config not found for builder {0}")]
    BuildConfigMissing(i64),

    #[error("Invalid container name: {0}")]
    InvalidContainerName(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Controller error: {0}")]
    Controller(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
