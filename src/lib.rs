//! settingsd - a per-user configuration database daemon.
//!
//! Values live in an ordered chain of sources; clients subscribe to key
//! prefixes and are notified on change. Subscriptions are journaled to a
//! saved-state log so they survive a daemon restart.

pub mod config;
pub mod daemon;
pub mod error;
pub mod key;
pub mod logging;
pub mod sources;
pub mod value;

pub use error::{ConfError, ConfResult, ErrorKind};
pub use key::Key;
pub use value::{Entry, Lookup, Schema, Value, ValueType};
