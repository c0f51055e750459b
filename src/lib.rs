pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod entities;
pub mod error;
pub mod geo;
pub mod notifier;
pub mod scheduler;
pub mod server;
pub mod store;

#[cfg(test)]
mod testing;
