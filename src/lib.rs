#![allow(clippy::module_name_repetitions)]

pub(crate) mod api;
pub mod app;
pub mod clients;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub(crate) mod schema;
pub mod store;
pub mod util;
