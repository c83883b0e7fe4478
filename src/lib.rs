pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod import;
pub mod lease;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
