pub mod backoff;
pub mod session_lease;

pub use backoff::Backoff;
pub use session_lease::{SessionLease, SessionLeases};
