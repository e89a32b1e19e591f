pub mod api;
pub mod archive;
pub mod error;
pub mod events;
pub mod host_manager;
pub mod logs;
mod proc_stats;
pub mod sandbox;
pub mod scanner;
pub mod server_config;
pub mod settings;
pub mod supervisor;
