//! Registration Protocol Definitions
//!
//! A registrant announces itself by opening a TCP connection to the proxy's
//! registration port. It sends nothing: the source address of the connection is
//! the whole request. The proxy answers with exactly one response and closes the
//! connection.
//!
//! - `0` means the dynamic tunnel now points at the registrant
//! - anything else is a UTF-8 description of why it could not be set up

pub mod client;
pub mod destination;
pub mod response;

pub use client::{register, RegisterError};
pub use destination::Destination;
pub use response::{ProtoError, RegistrationResponse, FAILURE_PREFIX, SUCCESS_MARKER};

/// Default port the proxy listens on for registrations
pub const DEFAULT_REGISTRATION_PORT: u16 = 5899;

/// Default port of the dynamic tunnel (NetworkTables), same on both ends
pub const DEFAULT_DYNAMIC_PORT: u16 = 1735;
