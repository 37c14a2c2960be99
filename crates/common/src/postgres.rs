mod client;
mod config;
mod document_store;
mod meta_user_repository;
mod user_repository;

pub use client::*;
pub use config::*;
pub use document_store::*;
pub use meta_user_repository::*;
pub use user_repository::*;
