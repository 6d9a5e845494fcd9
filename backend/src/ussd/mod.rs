//! USSD session holder. Menu rendering lives with the USSD gateway.

pub mod session;

pub use session::{InMemorySessionStore, SessionStore, UssdSession, DEFAULT_SESSION_TTL, MAIN_MENU};
