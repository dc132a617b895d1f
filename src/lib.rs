pub mod app;
pub mod auth;
pub mod broker;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod materialize;
pub mod netcdf;
pub mod order;
pub mod output;
pub mod poller;
pub mod progress;
pub mod query;
pub mod resolve;
pub mod submit;
