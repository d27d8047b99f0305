mod flag;
mod schedule;

pub use flag::*;
pub use schedule::*;
