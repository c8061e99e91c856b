pub mod agent;
pub mod app;
pub mod audio;
pub mod cli;
pub mod config;
pub mod db;
pub mod global;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod upload;
