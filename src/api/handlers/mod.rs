pub mod admin;
pub mod services;
pub mod sys;

pub use admin::*;
pub use services::*;
pub use sys::*;
