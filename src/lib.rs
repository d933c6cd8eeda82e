pub mod channel;
pub mod commands;
pub mod config;
pub mod container;
pub mod ipc;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod shared;
pub mod store;
