pub mod agenda;
pub mod auth;
pub mod chat;
pub mod error;
pub mod handlers;
pub mod notes;
pub mod presence;
pub mod rate_limit;
pub mod router;
pub mod socket;
pub mod state;

pub use error::AppError;
pub use state::{AppState, build_state, spawn_background_tasks};
