pub mod app;
pub mod cache;
pub mod companies;
pub mod config;
pub mod districts;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod hierarchy;
pub mod ibge;
pub mod output;
pub mod store;
pub mod tui;
pub mod writer;
