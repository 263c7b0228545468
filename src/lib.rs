//! PC/SC-backed NTAG213/215/216 driver and the HTTP bridge the kiosk talks
//! to. The hard part lives in `apdu`/`ntag21x`/`tags`/`watcher`; `session`
//! is the only surface callers (HTTP or tests) are meant to use directly.

pub mod apdu;
pub mod driver;
pub mod error;
pub mod http;
pub mod ntag21x;
pub mod session;
pub mod tags;

#[cfg(feature = "nfc")]
pub mod watcher;

#[cfg(feature = "test-support")]
pub mod mock;
