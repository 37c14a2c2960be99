mod reconcile;
mod topic;
mod user_sync_service;

pub use reconcile::*;
pub use topic::*;
pub use user_sync_service::*;
