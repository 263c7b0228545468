//! The capability seam between the Session Facade and a card. Production
//! code drives real hardware through `watcher::PcscDriver`; tests drive
//! `mock::MockDriver` instead, mirroring the hand-rolled `MockNFC` test
//! double the original prototype used for its handler tests.

use crate::error::Error;
use crate::tags::Tag;

/// One session's worth of card operations. Implementors assume the caller
/// already holds whatever exclusivity guarantee `CardDriver::with_session`
/// provides — methods here take `&mut self` but perform no locking of their
/// own.
pub trait CardOps {
    fn is_ready(&self) -> bool;
    fn get_uuid(&mut self) -> Result<String, Error>;
    fn auth(&mut self, password: u32) -> Result<(), Error>;
    fn set_password(&mut self, password: u32) -> Result<(), Error>;
    fn clear_password(&mut self) -> Result<(), Error>;
    fn read_tags(&mut self) -> Result<Vec<Tag>, Error>;
    fn write_tags(&mut self, tags: &[Tag]) -> Result<(), Error>;
    fn beep(&mut self, duration_ms: u32) -> Result<(), Error>;
}

/// Provides exclusive, scoped access to a `CardOps`. A single call locks the
/// one process-wide lock for the lifetime of the closure, so a whole Facade
/// operation (ready check, UUID check, auth, op, beep) runs under one
/// uninterrupted hold — and the lock is released on every exit path via the
/// closure's ordinary return, including `?`, with no separate unlock call to
/// forget.
pub trait CardDriver: Send + Sync {
    fn with_session<R>(&self, f: impl FnOnce(&mut dyn CardOps) -> Result<R, Error>) -> Result<R, Error>;
}
