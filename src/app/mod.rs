pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod packages;
pub mod pkg_config;
pub mod privilege;
pub mod runner;
pub mod search;
pub mod state;
pub mod store;
pub mod updates;
pub mod view_models;

#[cfg(test)]
pub(crate) mod testing;
