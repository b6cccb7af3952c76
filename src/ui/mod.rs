pub mod icons;
pub mod terminal;

pub use terminal::{TerminalView, spawn_event_printer};
