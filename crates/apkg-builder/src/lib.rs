pub mod archive;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod icon;
pub mod modules;
pub mod pipeline;
pub mod planner;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
