mod user_client;

pub use user_client::*;
