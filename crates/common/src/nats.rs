mod client;
mod connector;
mod delivery;
mod trace_context;
mod traits;

pub use client::*;
pub use connector::*;
pub use delivery::*;
pub use trace_context::*;
pub use traits::*;
