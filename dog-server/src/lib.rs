//! # dog-server
//!
//! Composition root of the job queue: a static [`Container`] of services,
//! JSON configuration with `DOG__` environment overrides, and the handlers
//! compiled into the binary.

pub mod config;
pub mod container;
pub mod handlers;

pub use config::{config_path, DogConfig, CONFIG_PATH_VAR, ENV_PREFIX};
pub use container::Container;
pub use handlers::LogHandler;
