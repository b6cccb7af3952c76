//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `config` | `Config`         |

pub mod config;
pub mod run;

pub use config::cmd_config;
pub use run::{RunArgs, cmd_run};
