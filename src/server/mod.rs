pub mod dto;
mod flags;
pub mod response;
mod router;
mod schedules;
pub mod validation;

pub use router::{AppState, create_router};
