pub mod calls;
pub mod config;
pub mod sessions;

pub use calls::*;
pub use config::*;
pub use sessions::*;
