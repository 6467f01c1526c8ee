//! Kanban board state: tickets, columns, settings.
//!
//! The board is small, in-memory, and persisted as pretty-printed JSON with
//! debounced atomic writes. Every mutation is broadcast to subscribed
//! clients so front ends never poll.

pub mod store;
pub mod types;

pub use store::{BoardError, BoardEvent, BoardStore, NewTicket, TicketPatch};
pub use types::{AgentStatus, Board, BoardSettings, Column, Priority, Ticket, TicketStatus};
