pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

pub use config::{Backend, Config};
pub use error::{AppError, Result};
pub use services::{BookmarkView, ViewOptions};
pub use state::{AppState, Platform};
