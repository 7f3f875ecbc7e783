//! Interaction with the 1C:Enterprise platform.
//!
//! - [Rac]: cluster, infobase and session administration through `rac`.
//! - [Designer]: infobase dumps through `1cv8 CONFIG /DumpIB`.

mod designer;
mod rac;
pub mod records;

pub use designer::{now, Designer, DumpFiles, DUMP_EXTENSION, DUMP_TIMESTAMP_FORMAT};
pub use rac::{Rac, RacError};
pub use records::{Cluster, Infobase, Lock, Session};

/// Default infobase administrator of a fresh 1C installation.
pub const DEFAULT_ADMIN: &str = "Администратор";
pub const DEFAULT_ADMIN_PASSWORD: &str = "123123";

/// Infobase administrator credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new(DEFAULT_ADMIN, DEFAULT_ADMIN_PASSWORD)
    }
}
