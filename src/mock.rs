//! Hardware-free `CardDriver`, mirroring the hand-rolled `MockNFC` test
//! double from the original prototype's handler tests. Gated behind the
//! `test-support` feature so integration tests can use it without linking
//! `pcsc`.

use crate::driver::{CardDriver, CardOps};
use crate::error::Error;
use crate::tags::Tag;
use parking_lot::Mutex;

pub struct MockState {
    pub present: bool,
    pub uuid: String,
    /// 0 means no password set, matching the on-wire convention.
    pub password: u32,
    pub tags: Vec<Tag>,
}

impl MockState {
    pub fn new(uuid: impl Into<String>) -> Self {
        MockState {
            present: true,
            uuid: uuid.into(),
            password: 0,
            tags: Vec::new(),
        }
    }
}

impl CardOps for MockState {
    fn is_ready(&self) -> bool {
        self.present
    }

    fn get_uuid(&mut self) -> Result<String, Error> {
        if !self.present {
            return Err(Error::CardNotReady);
        }
        Ok(self.uuid.clone())
    }

    fn auth(&mut self, password: u32) -> Result<(), Error> {
        if !self.present {
            return Err(Error::CardNotReady);
        }
        // An unprotected card (no password ever set) authenticates with any
        // supplied password, matching the real tag's factory-default state
        // where PWD_AUTH against an unlocked page always succeeds.
        if self.password == 0 || password == self.password {
            Ok(())
        } else {
            Err(Error::AuthFailed)
        }
    }

    fn set_password(&mut self, password: u32) -> Result<(), Error> {
        if !self.present {
            return Err(Error::CardNotReady);
        }
        self.password = password;
        Ok(())
    }

    fn clear_password(&mut self) -> Result<(), Error> {
        if !self.present {
            return Err(Error::CardNotReady);
        }
        self.password = 0;
        Ok(())
    }

    fn read_tags(&mut self) -> Result<Vec<Tag>, Error> {
        if !self.present {
            return Err(Error::CardNotReady);
        }
        Ok(self.tags.clone())
    }

    fn write_tags(&mut self, tags: &[Tag]) -> Result<(), Error> {
        if !self.present {
            return Err(Error::CardNotReady);
        }
        self.tags = tags.to_vec();
        Ok(())
    }

    fn beep(&mut self, _duration_ms: u32) -> Result<(), Error> {
        Ok(())
    }
}

pub struct MockDriver(Mutex<MockState>);

impl MockDriver {
    pub fn new(state: MockState) -> Self {
        MockDriver(Mutex::new(state))
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.0.lock();
        f(&mut guard)
    }
}

impl CardDriver for MockDriver {
    fn with_session<R>(&self, f: impl FnOnce(&mut dyn CardOps) -> Result<R, Error>) -> Result<R, Error> {
        let mut guard = self.0.lock();
        f(&mut *guard)
    }
}
