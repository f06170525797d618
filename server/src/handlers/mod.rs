mod admin_handlers;
mod health_handlers;
mod metrics_handlers;

pub(crate) use admin_handlers::*;
pub(crate) use health_handlers::*;
pub(crate) use metrics_handlers::*;
