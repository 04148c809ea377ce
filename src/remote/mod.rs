//! The authoritative backend the engine reconciles against.

pub mod memory;
pub mod traits;

pub use memory::InMemoryRemote;
pub use traits::{AckStatus, AuthoritativeState, RemoteStore, SubmitRequest, SubmitResponse, UserIdentity};
