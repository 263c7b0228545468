//! The Session Facade: the only surface the HTTP layer (or a test) is meant
//! to call directly. Every public method here is the literal envelope from
//! the original prototype's handlers — lock, ready check, UUID check,
//! optional auth, perform, optional beep — just generalized over `CardDriver`
//! so production code and tests share one implementation.

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::driver::{CardDriver, CardOps};
use crate::error::Error;
use crate::tags::{self, CardPayload, PartialCardPayload};

/// Duration of the post-write confirmation beep (`BeepReader`). Non-fatal;
/// its result is always discarded.
const WRITE_BEEP_MS: u32 = 200;

/// Substituted for a caller-supplied password of `0`, which is this API's
/// convention for "no password set" — the card's own factory default.
const FACTORY_DEFAULT_PWD: u32 = 0xFFFF_FFFF;

pub struct Facade<D: CardDriver> {
    driver: D,
}

impl<D: CardDriver> Facade<D> {
    pub fn new(driver: D) -> Self {
        Facade { driver }
    }

    /// Backs `GET /healthcheck`: true only if a reader is present and ready,
    /// independent of whether a card is currently on it.
    pub fn is_ready(&self) -> bool {
        self.driver
            .with_session(|ops| Ok(ops.is_ready()))
            .unwrap_or(false)
    }

    /// Backs `GET /uuid`.
    pub fn uuid(&self) -> Result<String, Error> {
        self.driver.with_session(|ops| {
            Self::require_ready(ops)?;
            ops.get_uuid()
        })
    }

    /// Backs `PUT /read`. `password == 0` means "no password configured";
    /// reads substitute the card's factory default so an unprotected card
    /// can always be read with `password: 0`.
    pub fn read(&self, uuid: &str, password: u32) -> Result<CardPayload, Error> {
        self.driver.with_session(|ops| {
            Self::require_ready(ops)?;
            Self::check_uuid(ops, uuid)?;
            let effective = if password == 0 { FACTORY_DEFAULT_PWD } else { password };
            Self::auth_with_retry(ops, effective, password != 0)?;
            let tags = ops.read_tags()?;
            if tags.is_empty() {
                return Err(Error::CardEmpty);
            }
            debug!("read {}: {}", uuid, tags::describe(&tags).join(", "));
            tags::decode(&tags)
        })
    }

    /// Backs `POST /write`. Unlike reads, a zero password is rejected — you
    /// cannot write a card without deciding what password protects it.
    pub fn write(&self, uuid: &str, password: u32, payload: CardPayload) -> Result<(), Error> {
        if password == 0 {
            return Err(Error::BadRequest("password is required to write a card".into()));
        }
        self.driver.with_session(|ops| {
            Self::require_ready(ops)?;
            Self::check_uuid(ops, uuid)?;
            Self::auth_with_retry(ops, password, true)?;
            let tags = tags::encode(&payload);
            ops.write_tags(&tags)?;
            debug!("wrote {} tags to {}", tags.len(), uuid);
            let _ = ops.beep(WRITE_BEEP_MS);
            Ok(())
        })
    }

    /// Backs `PATCH /write`: merges `partial` onto whatever is already on
    /// the card, preserving the fields the caller didn't supply.
    pub fn update(&self, uuid: &str, password: u32, partial: PartialCardPayload) -> Result<(), Error> {
        if password == 0 {
            return Err(Error::BadRequest("password is required to update a card".into()));
        }
        self.driver.with_session(|ops| {
            Self::require_ready(ops)?;
            Self::check_uuid(ops, uuid)?;
            Self::auth_with_retry(ops, password, true)?;
            let existing = ops.read_tags()?;
            if existing.is_empty() {
                return Err(Error::CardEmpty);
            }
            let merged = tags::update(&existing, &partial)?;
            ops.write_tags(&merged)?;
            let _ = ops.beep(WRITE_BEEP_MS);
            Ok(())
        })
    }

    /// Backs `PUT /setpassword`. No pre-auth: a card with no password yet
    /// has its PWD page unprotected, so the first password can always be
    /// set. Re-keying an already-protected card isn't a supported flow (the
    /// request carries only the new password, never the old one).
    pub fn set_password(&self, uuid: &str, password: u32) -> Result<(), Error> {
        if password == 0 {
            return Err(Error::BadRequest("password must be non-zero".into()));
        }
        self.driver.with_session(|ops| {
            Self::require_ready(ops)?;
            Self::check_uuid(ops, uuid)?;
            ops.set_password(password)?;
            let _ = ops.beep(WRITE_BEEP_MS);
            Ok(())
        })
    }

    /// Backs `PUT /clearpassword`. Unlike `set_password`, this one *does*
    /// authenticate with the supplied password first — it's the only way to
    /// prove you're allowed to lift protection from the card, and a failure
    /// here is reported distinctly ("invalid password") rather than folded
    /// into the generic auth-failed case.
    pub fn clear_password(&self, uuid: &str, password: u32) -> Result<(), Error> {
        self.driver.with_session(|ops| {
            Self::require_ready(ops)?;
            Self::check_uuid(ops, uuid)?;
            let effective = if password == 0 { FACTORY_DEFAULT_PWD } else { password };
            ops.auth(effective).map_err(|_| Error::AuthFailed)?;
            ops.clear_password()?;
            let _ = ops.beep(WRITE_BEEP_MS);
            Ok(())
        })
    }

    fn require_ready(ops: &mut dyn CardOps) -> Result<(), Error> {
        if ops.is_ready() {
            Ok(())
        } else {
            Err(Error::CardNotReady)
        }
    }

    fn check_uuid(ops: &mut dyn CardOps, expected: &str) -> Result<(), Error> {
        let actual = ops.get_uuid()?;
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(Error::UuidMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }

    /// PWD_AUTH, with the single retry the NTAG's one-shot auth latch
    /// requires: a prior failed session can leave the tag reporting
    /// auth-required on the very next attempt even with the right password.
    /// Only retried for caller-supplied (non-substituted) passwords, per the
    /// original prototype's behavior.
    fn auth_with_retry(ops: &mut dyn CardOps, password: u32, retry_eligible: bool) -> Result<(), Error> {
        match ops.auth(password) {
            Ok(()) => Ok(()),
            Err(e) if retry_eligible && e.is_auth_required() => {
                warn!("PWD_AUTH reported auth-required on first attempt, retrying once after backoff");
                thread::sleep(Duration::from_secs(1));
                ops.auth(password)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(all(test, feature = "test-support"))]
mod tests {
    use super::*;
    use crate::mock::{MockDriver, MockState};
    use crate::tags::CardPayload;

    const UUID: &str = "04412a014b3403";

    fn facade_with_password(password: u32) -> Facade<MockDriver> {
        let mut state = MockState::new(UUID);
        state.password = password;
        Facade::new(MockDriver::new(state))
    }

    fn sample_payload() -> CardPayload {
        CardPayload {
            attendee_id: 123,
            convention_id: 32,
            issuance_count: 1,
            issuance_timestamp: 1_700_000_000,
            expiration: Some(1_700_086_400),
            signature: vec![0x11; 64],
        }
    }

    #[test]
    fn empty_read_is_card_empty() {
        let facade = facade_with_password(123);
        let err = facade.read(UUID, 123).unwrap_err();
        assert!(matches!(err, Error::CardEmpty));
    }

    #[test]
    fn write_then_read_round_trips() {
        let facade = facade_with_password(123);
        facade.write(UUID, 123, sample_payload()).unwrap();
        let read_back = facade.read(UUID, 123).unwrap();
        assert_eq!(read_back, sample_payload());
    }

    #[test]
    fn uuid_mismatch_is_rejected_before_any_mutation() {
        let facade = facade_with_password(123);
        let err = facade.read("not-the-right-uuid", 123).unwrap_err();
        assert!(matches!(err, Error::UuidMismatch { .. }));
        // No write ever landed - the card is still empty under the right UUID.
        assert!(matches!(facade.read(UUID, 123).unwrap_err(), Error::CardEmpty));
    }

    #[test]
    fn write_rejects_zero_password() {
        let facade = facade_with_password(0);
        let err = facade.write(UUID, 0, sample_payload()).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn password_lifecycle() {
        let facade = facade_with_password(0);
        facade.set_password(UUID, 124).unwrap();
        // Wrong password is rejected.
        assert!(matches!(facade.read(UUID, 1_111_111).unwrap_err(), Error::AuthFailed));
        // Clearing with the wrong password fails and leaves protection intact.
        assert!(matches!(
            facade.clear_password(UUID, 1_111_111).unwrap_err(),
            Error::AuthFailed
        ));
        assert!(matches!(facade.read(UUID, 0).unwrap_err(), Error::AuthFailed));
        // Clearing with the right password restores factory-default access.
        facade.clear_password(UUID, 124).unwrap();
        assert!(matches!(facade.read(UUID, 0).unwrap_err(), Error::CardEmpty));
    }
}
