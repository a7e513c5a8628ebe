pub mod blob;
pub mod body;
pub mod capture;
pub mod config;
pub mod hooks;
pub mod logging;
pub mod message;
pub mod recorder;
pub mod server;
pub mod store;
pub mod tap;
