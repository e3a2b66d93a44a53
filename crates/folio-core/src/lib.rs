pub mod artifacts;
pub mod config;
pub mod context;
pub mod gateway;
pub mod maintenance;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod progress;
pub mod registry;
pub mod sqlite;
pub mod transform;
