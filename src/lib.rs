//! Body-fat estimation service: an upper-body gate and image classifier behind an
//! HTTP API with accounts, phone verification and per-user prediction history.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod vision;

pub use api::{router, AppState, AppUser};
pub use config::{AppConfig, ConfigError};
pub use error::{AppError, AppResult, ErrorKind, StartupError};
pub use pipeline::{BodyFatAnalyzer, PredictionError, PredictionResponse};
pub use store::{SqliteUserStore, UserStore};
