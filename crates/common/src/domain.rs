mod event;
mod meta_user;
mod result;
mod user;

pub use event::*;
pub use meta_user::*;
pub use result::*;
pub use user::*;
