//! Reader Watcher: owns the one `pcsc::Context` this process keeps open,
//! enumerates readers, and blocks on `get_status_change` to learn about
//! card taps and reader hot-plug events. Reworked from the original
//! prototype's single recursive function into one loop with two explicit
//! phases (`enumerate`, `observe`) run in a background thread; a reader
//! error is retried forever, a card error just ends the current session.
//!
//! `PcscDriver` is the `CardDriver` a real kiosk runs: `with_session` takes
//! the same lock the watcher thread holds while it's mid-tap, so HTTP
//! requests and card presence detection never race on the same card.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pcsc::{Context, Protocols, ReaderState, Scope, ShareMode, State, PNP_NOTIFICATION};

use crate::driver::{CardDriver, CardOps};
use crate::error::Error;
use crate::ntag21x::{self, CardProduct};
use crate::tags::Tag;

/// Published on `PresenceChannel` whenever the watcher thread notices a
/// reader or card state transition. `GET /events` relays these verbatim.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    ReaderAttached(String),
    ReaderRemoved(String),
    CardPresent { reader: String, uuid: String },
    CardAbsent { reader: String },
    ReaderError(String),
}

/// A validated, connected card. Reconnecting (required by `set_password`'s
/// reset-and-reauth sequence) replaces this wholesale.
struct CardSession {
    card: pcsc::Card,
    reader_name: CString,
    product: CardProduct,
}

impl CardSession {
    fn connect(ctx: &Context, reader_name: &CStr) -> Result<CardSession, Error> {
        let card = ctx.connect(reader_name, ShareMode::Shared, Protocols::ANY)?;
        let atr = {
            let mut names_buf = [0u8; 2048];
            let mut atr_buf = [0u8; 33];
            let status = card.status2(&mut names_buf, &mut atr_buf)?;
            status.atr().to_vec()
        };
        let (product, _version) = ntag21x::validate(&card, &atr)?;
        debug!("validated {:?} on {:?}", product, reader_name);
        Ok(CardSession {
            card,
            reader_name: reader_name.to_owned(),
            product,
        })
    }
}

/// Everything the watcher thread and `PcscDriver::with_session` share,
/// behind one lock. A fresh reader name wins over a stale session the
/// instant hot-plug detects it changed.
struct Inner {
    ctx: Context,
    reader_name: Option<CString>,
    session: Option<CardSession>,
}

impl Inner {
    fn reconnect(&mut self) -> Result<(), Error> {
        let reader_name = self
            .reader_name
            .clone()
            .ok_or(Error::CardNotReady)?;
        self.session = Some(CardSession::connect(&self.ctx, &reader_name)?);
        Ok(())
    }
}

/// `CardDriver` backed by the live PC/SC context the watcher thread shares
/// ownership of.
#[derive(Clone)]
pub struct PcscDriver {
    inner: Arc<Mutex<Inner>>,
}

impl PcscDriver {
    /// Establishes the PC/SC context and spawns the background watcher
    /// thread. `events` receives every presence transition the thread
    /// observes; the HTTP layer's SSE route subscribes to it.
    pub fn start(events: tokio::sync::broadcast::Sender<PresenceEvent>) -> Result<PcscDriver, Error> {
        let inner = Arc::new(Mutex::new(Inner {
            ctx: Context::establish(Scope::User)?,
            reader_name: None,
            session: None,
        }));

        let watcher_inner = Arc::clone(&inner);
        thread::spawn(move || run_watcher(watcher_inner, events));

        Ok(PcscDriver { inner })
    }
}

impl CardDriver for PcscDriver {
    fn with_session<R>(&self, f: impl FnOnce(&mut dyn CardOps) -> Result<R, Error>) -> Result<R, Error> {
        let mut guard = self.inner.lock();
        let mut ops = SessionOps { inner: &mut guard };
        f(&mut ops)
    }
}

/// Wraps a locked `Inner` as `CardOps`. Needs the whole `Inner`, not just
/// the `CardSession`, because `set_password` reconnects mid-operation.
struct SessionOps<'a> {
    inner: &'a mut Inner,
}

impl<'a> CardOps for SessionOps<'a> {
    fn is_ready(&self) -> bool {
        self.inner.reader_name.is_some()
    }

    fn get_uuid(&mut self) -> Result<String, Error> {
        let session = self.inner.session.as_ref().ok_or(Error::CardNotReady)?;
        ntag21x::uuid(&session.card)
    }

    fn auth(&mut self, password: u32) -> Result<(), Error> {
        let session = self.inner.session.as_ref().ok_or(Error::CardNotReady)?;
        ntag21x::pwd_auth(&session.card, password)
    }

    fn set_password(&mut self, password: u32) -> Result<(), Error> {
        {
            let session = self.inner.session.as_ref().ok_or(Error::CardNotReady)?;
            ntag21x::apply_password(&session.card, session.product, password)?;
        }
        // The new password only takes effect after a reset; reconnecting
        // gives us that for free (a fresh `connect` drops and re-powers).
        self.inner.reconnect()?;
        let session = self.inner.session.as_ref().ok_or(Error::CardNotReady)?;
        ntag21x::pwd_auth(&session.card, password)?;
        ntag21x::protect(&session.card, session.product)
    }

    fn clear_password(&mut self) -> Result<(), Error> {
        let session = self.inner.session.as_ref().ok_or(Error::CardNotReady)?;
        ntag21x::apply_password(&session.card, session.product, 0xFFFF_FFFF)?;
        ntag21x::unprotect(&session.card, session.product)
    }

    fn read_tags(&mut self) -> Result<Vec<Tag>, Error> {
        let session = self.inner.session.as_ref().ok_or(Error::CardNotReady)?;
        let mut reader = ntag21x::PageReader::new(&session.card);
        crate::tags::decode_from_reader(&mut reader)
    }

    /// Brackets the write in a PC/SC transaction (spec's
    /// `BeginTransaction`/`EndTransaction(LeaveCard)`) so a card pulled
    /// mid-write loses the reader's exclusive hold cleanly instead of
    /// leaving a half-written page sequence racing some other session.
    fn write_tags(&mut self, tags: &[Tag]) -> Result<(), Error> {
        let session = self.inner.session.as_mut().ok_or(Error::CardNotReady)?;
        let tx = session.card.transaction()?;
        let result = {
            let mut writer = ntag21x::PageWriter::new(&tx);
            crate::tags::encode_to_writer(&mut writer, tags)
        };
        match tx.end(pcsc::Disposition::LeaveCard) {
            Ok(()) => result,
            Err((_tx, e)) => result.and(Err(Error::from(e))),
        }
    }

    fn beep(&mut self, duration_ms: u32) -> Result<(), Error> {
        let session = self.inner.session.as_ref().ok_or(Error::CardNotReady)?;
        ntag21x::beep(&session.card, duration_ms)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The watcher thread: loops forever, alternating an `enumerate` phase
/// (rebuild the reader list) and an `observe` phase (block for up to
/// `POLL_INTERVAL` on state changes). Reader-list errors retry after a
/// short sleep; a lost card session is simply dropped so the next tap
/// reconnects.
fn run_watcher(inner: Arc<Mutex<Inner>>, events: tokio::sync::broadcast::Sender<PresenceEvent>) {
    let mut reader_states: Vec<ReaderState> = vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)];
    let mut present: HashMap<CString, bool> = HashMap::new();

    info!("reader watcher starting");
    loop {
        if let Err(msg) = enumerate(&inner, &mut reader_states, &events) {
            error!("reader enumeration failed: {}", msg);
            let _ = events.send(PresenceEvent::ReaderError(msg));
            thread::sleep(Duration::from_millis(500));
            continue;
        }

        if let Err(msg) = observe(&inner, &mut reader_states, &mut present, &events) {
            error!("get_status_change failed: {}", msg);
            let _ = events.send(PresenceEvent::ReaderError(msg));
            thread::sleep(Duration::from_millis(500));
        }
    }
}

/// Drops readers PC/SC has marked unknown/ignored and adds newly-seen ones,
/// excluding the ACR122U's own pseudo-readers (notably the Yubico virtual
/// reader some systems surface alongside a real one).
fn enumerate(
    inner: &Mutex<Inner>,
    reader_states: &mut Vec<ReaderState>,
    events: &tokio::sync::broadcast::Sender<PresenceEvent>,
) -> Result<(), String> {
    let mut guard = inner.lock();

    reader_states.retain(|rs| {
        let dead = rs.event_state().intersects(State::UNKNOWN | State::IGNORE);
        if dead && rs.name() != PNP_NOTIFICATION() {
            let name = rs.name().to_string_lossy().into_owned();
            warn!("reader removed: {}", name);
            let _ = events.send(PresenceEvent::ReaderRemoved(name));
            if guard.reader_name.as_deref() == Some(rs.name()) {
                guard.reader_name = None;
                guard.session = None;
            }
        }
        !dead
    });

    let mut readers_buf = [0u8; 2048];
    let names: Vec<CString> = match guard.ctx.list_readers(&mut readers_buf) {
        Ok(names) => names.map(|n| n.to_owned()).collect(),
        Err(pcsc::Error::ServiceStopped) | Err(pcsc::Error::NoService) => {
            guard.ctx = Context::establish(Scope::User).map_err(|e| e.to_string())?;
            return Ok(());
        }
        Err(e) => return Err(e.to_string()),
    };

    for name in names {
        if is_excluded(&name) {
            continue;
        }
        if !reader_states.iter().any(|rs| rs.name() == name.as_c_str()) {
            info!("reader attached: {}", name.to_string_lossy());
            let _ = events.send(PresenceEvent::ReaderAttached(name.to_string_lossy().into_owned()));
            reader_states.push(ReaderState::new(name.as_c_str(), State::UNAWARE));
            if guard.reader_name.is_none() {
                guard.reader_name = Some(name);
            }
        }
    }

    for rs in reader_states.iter_mut() {
        rs.sync_current_state();
    }
    Ok(())
}

fn is_excluded(name: &CStr) -> bool {
    name.to_string_lossy().to_lowercase().contains("yubico")
}

/// Blocks for up to `POLL_INTERVAL` on reader state changes, then connects
/// or drops the card session to match what PC/SC reports.
fn observe(
    inner: &Mutex<Inner>,
    reader_states: &mut Vec<ReaderState>,
    present: &mut HashMap<CString, bool>,
    events: &tokio::sync::broadcast::Sender<PresenceEvent>,
) -> Result<(), String> {
    {
        let mut guard = inner.lock();
        match guard.ctx.get_status_change(POLL_INTERVAL, reader_states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => return Ok(()),
            Err(pcsc::Error::ServiceStopped) | Err(pcsc::Error::NoService) => {
                guard.ctx = Context::establish(Scope::User).map_err(|e| e.to_string())?;
                return Ok(());
            }
            Err(e) => return Err(e.to_string()),
        }
    }

    for rs in reader_states.iter() {
        if rs.name() == PNP_NOTIFICATION() {
            continue;
        }
        let name = rs.name().to_owned();
        let label = name.to_string_lossy().into_owned();

        if rs.event_state().intersects(State::PRESENT) {
            if !*present.get(&name).unwrap_or(&false) {
                let mut guard = inner.lock();
                match CardSession::connect(&guard.ctx, &name) {
                    Ok(session) => {
                        let uuid = ntag21x::uuid(&session.card).unwrap_or_default();
                        info!("card present on {}: {}", label, uuid);
                        guard.reader_name = Some(name.clone());
                        guard.session = Some(session);
                        let _ = events.send(PresenceEvent::CardPresent { reader: label, uuid });
                    }
                    Err(e) => {
                        warn!("card validation failed on {}: {}", label, e);
                        let _ = events.send(PresenceEvent::ReaderError(e.to_string()));
                    }
                }
            }
            present.insert(name, true);
        } else if rs.event_state().intersects(State::EMPTY) {
            if *present.get(&name).unwrap_or(&false) {
                let mut guard = inner.lock();
                if guard.reader_name.as_ref() == Some(&name) {
                    guard.session = None;
                }
                info!("card removed from {}", label);
                let _ = events.send(PresenceEvent::CardAbsent { reader: label });
            }
            present.insert(name, false);
        }
    }
    Ok(())
}
