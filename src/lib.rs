pub mod authentication;
pub mod channel;
pub mod configuration;
pub mod dispatcher;
pub mod domain;
pub mod routes;
pub mod scheduler;
pub mod startup;
pub mod store;
pub mod telemetry;
mod utils;
