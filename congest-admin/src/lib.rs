//! Congest Admin Control Plane
//!
//! Handles Unix socket connections and the line-oriented operator protocol
//! for inspecting and clearing congestion entries.

pub mod command;
pub mod listing;
pub mod server;

pub use command::{ControlCommand, Target};
pub use listing::{format_entry, ListingFormat, MAX_VERBOSITY};
pub use server::{AdminError, AdminServer, END_OF_RESPONSE};
