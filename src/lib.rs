//! HTTP service that turns a photo of a math expression into normalized text
//! by asking a Gemini vision model to transcribe it.

pub mod config;
pub mod error;
pub mod gemini;
pub mod logging;
pub mod prompt;
pub mod routes;
pub mod upload;

pub use config::Config;
pub use error::{AppError, ConfigError};
pub use gemini::{GeminiClient, GeminiError};
pub use routes::{app, router, AppState, CalcResponse};
