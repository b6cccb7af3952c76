pub mod api;
pub mod bus;
pub mod config;
pub mod errors;
pub mod flow;
pub mod gaps;
pub mod logging;
pub mod models;
pub mod session;
pub mod stage;
pub mod state;
pub mod store;
pub mod stream;
pub mod ui;
