//! Wire-level NTAG213/215/216 protocol: card validation, PWD_AUTH, page I/O,
//! and the SetPassword/ClearPassword page sequences.

use crate::apdu::{self, CardLike};
use crate::error::Error;
use std::thread;
use std::time::Duration;

pub const PAGE_SIZE: u8 = 4;
pub const STARTING_REGION: u8 = 0x10;

/// ACR122U's ATR for a MIFARE Ultralight family card.
const ATR_SIGNATURE: [u8; 15] = [
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x03,
];

/// NXP / NTAG / 50pF / V0 prefix, the first six bytes of a GET_VERSION reply.
const VERSION_PREFIX: [u8; 6] = [0x00, 0x04, 0x04, 0x02, 0x01, 0x00];

const VALIDATE_ATTEMPTS: u32 = 4;
const VALIDATE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardProduct {
    Ntag213,
    Ntag215,
    Ntag216,
}

impl CardProduct {
    fn from_version_byte(b: u8) -> Result<CardProduct, Error> {
        match b {
            0x0F => Ok(CardProduct::Ntag213),
            0x11 => Ok(CardProduct::Ntag215),
            0x13 => Ok(CardProduct::Ntag216),
            other => Err(Error::UnsupportedCard(format!(
                "unrecognized GET_VERSION storage size byte {:#04x}",
                other
            ))),
        }
    }

    pub fn memory_size(self) -> usize {
        match self {
            CardProduct::Ntag213 => 144,
            CardProduct::Ntag215 => 504,
            CardProduct::Ntag216 => 888,
        }
    }

    pub fn page_count(self) -> u8 {
        match self {
            CardProduct::Ntag213 => 45,
            CardProduct::Ntag215 => 135,
            CardProduct::Ntag216 => 231,
        }
    }

    pub fn pwd_page(self) -> u8 {
        match self {
            CardProduct::Ntag213 => 0x2B,
            CardProduct::Ntag215 => 0x85,
            CardProduct::Ntag216 => 0xE5,
        }
    }

    pub fn cfg_page(self) -> u8 {
        match self {
            CardProduct::Ntag213 => 0x29,
            CardProduct::Ntag215 => 0x83,
            CardProduct::Ntag216 => 0xE3,
        }
    }
}

/// Validates the ATR and GET_VERSION, retrying transient GET_VERSION
/// failures up to `VALIDATE_ATTEMPTS` times with a fixed backoff.
pub fn validate(card: &dyn CardLike, atr: &[u8]) -> Result<(CardProduct, Vec<u8>), Error> {
    if atr.len() < ATR_SIGNATURE.len() || atr[..ATR_SIGNATURE.len()] != ATR_SIGNATURE {
        return Err(Error::UnsupportedCard("ATR is not an NTAG21x-over-ACR122U".into()));
    }

    let mut last_err = None;
    for attempt in 0..VALIDATE_ATTEMPTS {
        match get_version(card) {
            Ok(version) => {
                if version.len() < 7 || version[..6] != VERSION_PREFIX {
                    return Err(Error::UnsupportedCard(
                        "GET_VERSION prefix did not match NXP/NTAG/50pF/V0".into(),
                    ));
                }
                let product = CardProduct::from_version_byte(version[6])?;
                return Ok((product, version));
            }
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < VALIDATE_ATTEMPTS {
                    thread::sleep(VALIDATE_BACKOFF);
                }
            }
        }
    }
    Err(last_err.expect("loop always runs at least once"))
}

fn get_version(card: &dyn CardLike) -> Result<Vec<u8>, Error> {
    let response = apdu::transmit_vendor(card, &[0x60])?;
    if response.is_empty() {
        return Err(Error::malformed("empty GET_VERSION response"));
    }
    if response[0] != 0x00 {
        return Err(Error::malformed(format!(
            "GET_VERSION vendor status {:#04x}",
            response[0]
        )));
    }
    Ok(response[1..].to_vec())
}

pub fn uuid(card: &dyn CardLike) -> Result<String, Error> {
    let body = apdu::transmit(card, &[0xFF, 0xCA, 0x00, 0x00, 0x00])?;
    Ok(hex::encode(body))
}

pub fn pwd_auth(card: &dyn CardLike, password: u32) -> Result<(), Error> {
    let mut body = vec![0x1B];
    body.extend_from_slice(&password.to_be_bytes());
    let response = apdu::transmit_vendor(card, &body)?;
    match response.first() {
        Some(0x00) => Ok(()),
        _ => Err(Error::AuthFailed),
    }
}

pub fn read_page(card: &dyn CardLike, page: u8) -> Result<Vec<u8>, Error> {
    apdu::transmit(card, &[0xFF, 0xB0, 0x00, page, PAGE_SIZE])
}

pub fn write_page(card: &dyn CardLike, page: u8, data: &[u8; 4]) -> Result<(), Error> {
    let apdu = [0xFF, 0xD6, 0x00, page, PAGE_SIZE, data[0], data[1], data[2], data[3]];
    apdu::transmit(card, &apdu)?;
    Ok(())
}

/// Services byte-wise TLV decoding by reading one page at a time from
/// `STARTING_REGION` onward.
pub struct PageReader<'a> {
    card: &'a dyn CardLike,
    cursor: u8,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> PageReader<'a> {
    pub fn new(card: &'a dyn CardLike) -> Self {
        PageReader {
            card,
            cursor: STARTING_REGION,
            buf: Vec::new(),
            pos: 0,
        }
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        if self.pos >= self.buf.len() {
            let mut page = read_page(self.card, self.cursor)?;
            page.truncate(PAGE_SIZE as usize);
            self.buf = page;
            self.pos = 0;
            self.cursor = self.cursor.wrapping_add(1);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }
}

/// Accumulates bytes and flushes one page every `PAGE_SIZE` bytes.
pub struct PageWriter<'a> {
    card: &'a dyn CardLike,
    cursor: u8,
    pending: Vec<u8>,
}

impl<'a> PageWriter<'a> {
    pub fn new(card: &'a dyn CardLike) -> Self {
        PageWriter {
            card,
            cursor: STARTING_REGION,
            pending: Vec::new(),
        }
    }

    pub fn write_byte(&mut self, b: u8) -> Result<(), Error> {
        self.pending.push(b);
        if self.pending.len() == PAGE_SIZE as usize {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        let mut data = [0u8; 4];
        data[..self.pending.len()].copy_from_slice(&self.pending);
        write_page(self.card, self.cursor, &data)?;
        self.cursor = self.cursor.wrapping_add(1);
        self.pending.clear();
        Ok(())
    }

    /// Writes the 0x00 terminator and pads/flushes any residual page.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.write_byte(0x00)?;
        if !self.pending.is_empty() {
            self.flush()?;
        }
        Ok(())
    }
}

pub fn beep(card: &dyn CardLike, duration_ms: u32) -> Result<(), Error> {
    let d = (duration_ms / 100).min(255) as u8;
    let apdu = [0xFF, 0x00, 0x40, 0x0A, 0x04, d, d, 0x02, 0x01];
    apdu::transmit(card, &apdu)?;
    Ok(())
}

fn cfg_pages(card: &dyn CardLike, cfg_page: u8) -> Result<[u8; 16], Error> {
    let mut cfg = [0u8; 16];
    let p0 = read_page(card, cfg_page)?;
    let p1 = read_page(card, cfg_page.wrapping_add(1))?;
    let p2 = read_page(card, cfg_page.wrapping_add(2))?;
    let p3 = read_page(card, cfg_page.wrapping_add(3))?;
    cfg[0..4].copy_from_slice(&p0[..4]);
    cfg[4..8].copy_from_slice(&p1[..4]);
    cfg[8..12].copy_from_slice(&p2[..4]);
    cfg[12..16].copy_from_slice(&p3[..4]);
    Ok(cfg)
}

/// Writes a 4-byte big-endian password to the product's PWD page. Used both
/// to set a caller-supplied password and, with `0xFFFFFFFF`, to clear one.
/// The reset+reauth step that makes a new password effective is the caller's
/// responsibility (it needs a reconnect, which this module has no access
/// to) — see `watcher::SharedState::set_password`.
pub fn apply_password(card: &dyn CardLike, product: CardProduct, password: u32) -> Result<(), Error> {
    let bytes = password.to_be_bytes();
    write_page(card, product.pwd_page(), &bytes)
}

pub fn protect(card: &dyn CardLike, product: CardProduct) -> Result<(), Error> {
    let cfg_page = product.cfg_page();
    let mut cfg = cfg_pages(card, cfg_page)?;
    cfg[3] = STARTING_REGION;
    cfg[4] |= 0x80;
    write_cfg(card, cfg_page, &cfg)
}

pub fn unprotect(card: &dyn CardLike, product: CardProduct) -> Result<(), Error> {
    let cfg_page = product.cfg_page();
    let mut cfg = cfg_pages(card, cfg_page)?;
    cfg[3] = 0xFF;
    cfg[4] &= 0x7F;
    write_cfg(card, cfg_page, &cfg)
}

/// Writes CFG and CFG+1. If the second write fails and the card now reports
/// auth-required, that's the PROT bit having just taken effect — treated as
/// success (the internal "latched as success" case from the error taxonomy).
fn write_cfg(card: &dyn CardLike, cfg_page: u8, cfg: &[u8; 16]) -> Result<(), Error> {
    let mut page0 = [0u8; 4];
    page0.copy_from_slice(&cfg[0..4]);
    write_page(card, cfg_page, &page0)?;

    let mut page1 = [0u8; 4];
    page1.copy_from_slice(&cfg[4..8]);
    match write_page(card, cfg_page.wrapping_add(1), &page1) {
        Ok(()) => Ok(()),
        Err(e) if e.is_auth_required() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_page_addresses() {
        assert_eq!(CardProduct::Ntag213.pwd_page(), 0x2B);
        assert_eq!(CardProduct::Ntag215.pwd_page(), 0x85);
        assert_eq!(CardProduct::Ntag216.pwd_page(), 0xE5);
        assert_eq!(CardProduct::Ntag213.cfg_page(), 0x29);
    }

    #[test]
    fn unknown_version_byte_is_unsupported() {
        assert!(CardProduct::from_version_byte(0x42).is_err());
    }
}
