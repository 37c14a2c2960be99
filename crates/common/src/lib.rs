pub mod domain;
pub mod http;
pub mod nats;
pub mod postgres;
pub mod telemetry;

pub use domain::*;
