pub mod gate;
pub mod store;

pub use gate::{ConfirmationGate, ConfirmationTicket, parameter_digest};
pub use store::{Session, SessionStore};
