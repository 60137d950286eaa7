//! Immutable value types shared by every component.

pub mod record;
pub mod ticket;

pub use record::SessionRecord;
pub use ticket::{TicketId, TicketState, VerificationTicket};
