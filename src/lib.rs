pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod images;
pub mod state;
pub mod storage;
