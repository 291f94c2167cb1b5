//! IMAP4 Client Module
//!
//! Implements the subset of IMAP4rev1 a sweep needs, addressing messages
//! by UID throughout.
//!
//! Supported commands:
//! - LOGIN, SELECT, LOGOUT
//! - UID SEARCH, UID FETCH (peek only)
//! - UID COPY, UID STORE (\Deleted), EXPUNGE

pub mod command;
pub mod connector;
pub mod response;
pub mod session;
pub mod tls;

pub use connector::ImapConnector;
pub use session::{ImapSession, SessionState};
