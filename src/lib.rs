//! Library crate for resolver-scan-rs exposing reusable modules.
pub mod config;
pub mod enumerator;
pub mod error;
pub mod gate;
pub mod output;
pub mod port_pool;
pub mod prober;
pub mod proxy_check;
pub mod ranges;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod tool;
pub mod tunnel;
pub mod types;
pub mod validator;
