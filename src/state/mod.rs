//! State Module
//!
//! Server-side lookup tables shared between the relay tasks.

pub mod nat;
pub mod session;

pub use nat::{NatTable, NatTuple, Translation};
pub use session::SessionTable;
