pub mod api;
pub mod app;
pub mod archive;
pub mod bundle;
pub mod config;
pub mod domain;
pub mod error;
pub mod output;
pub mod render;
pub mod session;
