//! Conversation continuity for the direct streaming backend.
//!
//! Sessions are identified by an opaque string and hold the ordered
//! question/answer turns of one conversation. The store is bounded and
//! evicts by insertion order.
//!
//! # Example
//!
//! ```rust
//! use pdf_ask::session::{SessionStore, Turn};
//!
//! let store = SessionStore::new(50);
//! store.put("abc", vec![Turn::user("Hello!"), Turn::assistant("Hi.")]);
//!
//! let session = store.get("abc").unwrap();
//! assert_eq!(session.turns().len(), 2);
//! ```

mod thread;

pub use thread::{DEFAULT_MAX_SESSIONS, Session, SessionStore, Turn, TurnRole};
