use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("engine: {0}")]
    Engine(#[from] driveboard_engine::EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),
}
