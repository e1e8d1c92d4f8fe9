//! Card lifecycle and claim-token provisioning.
//!
//! [`Engine`] is the only entry point the HTTP layer and CLI use. The pieces
//! underneath are layered leaves first: [`quota`], [`registry`], [`claim`],
//! with [`lifecycle`] holding the pure guards they all share.

pub mod audit;
pub mod claim;
pub mod clock;
pub mod email;
pub mod error;
pub mod facade;
pub mod identifier;
pub mod lifecycle;
pub mod quota;
pub mod registry;
pub mod secrets;

pub use error::{EngineError, EngineResult};
pub use facade::{Actor, Engine, EngineBuilder};
