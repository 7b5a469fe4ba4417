#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod alarm;
pub mod config;
pub mod consent;
pub mod error;
pub mod fingerprint;
pub mod prefs;
pub mod scheduler;
pub mod service;
pub mod submit;

pub use config::Config;
pub use error::{Result, StatsError};
