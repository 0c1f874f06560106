pub mod config;
pub mod error;
pub mod http;
pub mod tcp;
pub mod ws;

pub use config::BackendConfig;
pub use error::BackendError;
pub use http::AppState;
