//! TCP serving: one listener per instrument, one session per connection,
//! and the manager that owns them.

pub mod manager;
pub mod server;
pub mod session;

pub use manager::{InstrumentStatus, ServerManager};
pub use server::InstrumentServer;
pub use session::{ConnectionSession, LineFramer, SessionSettings};
