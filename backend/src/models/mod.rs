pub mod common;
pub mod invitation;
pub mod membership;
pub mod organization;
pub mod user;
