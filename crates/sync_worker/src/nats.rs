mod consume_logging;
mod consume_types;
mod user_event_consumer;

pub use consume_logging::*;
pub use consume_types::*;
pub use user_event_consumer::*;
