use crate::error::{Error, TransportError, TransportErrorKind};

/// Anything that can carry a raw APDU, so the vendor-framing helpers below
/// work whether or not the caller is inside a `pcsc::Transaction`.
pub trait CardLike {
    fn transmit_raw(&self, apdu: &[u8]) -> Result<Vec<u8>, pcsc::Error>;
}

impl CardLike for pcsc::Card {
    fn transmit_raw(&self, apdu: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        Ok(self.transmit(apdu, &mut buf)?.to_vec())
    }
}

impl CardLike for pcsc::Transaction<'_> {
    fn transmit_raw(&self, apdu: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        Ok((**self).transmit(apdu, &mut buf)?.to_vec())
    }
}

/// Sends a plain APDU and splits the trailing status word off the response.
/// Success is signalled by a first status byte of 0x90; anything else comes
/// back as `Error::Transport` carrying the status so callers can inspect it
/// with `Error::is_auth_required`.
pub fn transmit(card: &dyn CardLike, apdu: &[u8]) -> Result<Vec<u8>, Error> {
    let rapdu = card.transmit_raw(apdu)?;
    if rapdu.len() < 2 {
        return Err(Error::Transport(TransportError {
            status: None,
            kind: TransportErrorKind::ShortResponse,
        }));
    }
    let split = rapdu.len() - 2;
    let status = [rapdu[split], rapdu[split + 1]];
    let body = rapdu[..split].to_vec();
    if status[0] == 0x90 {
        Ok(body)
    } else {
        Err(Error::status(status))
    }
}

/// Wraps an NXP InCommunicateThru command (0xD4, 0x42, ...) in the ACR122U's
/// pseudo-APDU envelope and strips the PN532's 0xD5, 0x43 reply prefix.
/// The first byte of what's returned is the PN532's own vendor status
/// (0x00 success); callers interpret it themselves since what a non-zero
/// status means differs between GET_VERSION and PWD_AUTH.
pub fn transmit_vendor(card: &dyn CardLike, inner: &[u8]) -> Result<Vec<u8>, Error> {
    let mut body = vec![0xD4, 0x42];
    body.extend_from_slice(inner);
    if body.len() > 0xFF {
        return Err(Error::malformed("vendor command too long to frame"));
    }
    let mut apdu = vec![0xFF, 0x00, 0x00, 0x00, body.len() as u8];
    apdu.extend_from_slice(&body);

    let response = transmit(card, &apdu)?;
    if response.len() < 3 || response[0] != 0xD5 || response[1] != 0x43 {
        return Err(Error::malformed("unexpected PN532 response prefix"));
    }
    Ok(response[2..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeCard {
        responses: RefCell<Vec<Vec<u8>>>,
    }
    impl CardLike for FakeCard {
        fn transmit_raw(&self, _apdu: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
            Ok(self.responses.borrow_mut().remove(0))
        }
    }

    #[test]
    fn success_status_strips_trailer() {
        let card = FakeCard {
            responses: RefCell::new(vec![vec![0xDE, 0xAD, 0x90, 0x00]]),
        };
        let body = transmit(&card, &[0x00]).unwrap();
        assert_eq!(body, vec![0xDE, 0xAD]);
    }

    #[test]
    fn non_success_status_is_typed_error() {
        let card = FakeCard {
            responses: RefCell::new(vec![vec![0x63, 0x00]]),
        };
        let err = transmit(&card, &[0x00]).unwrap_err();
        assert!(err.is_auth_required());
    }

    #[test]
    fn vendor_frame_strips_prefix_only() {
        let card = FakeCard {
            responses: RefCell::new(vec![vec![0xD5, 0x43, 0x00, 0x01, 0x02, 0x90, 0x00]]),
        };
        let body = transmit_vendor(&card, &[0x60]).unwrap();
        assert_eq!(body, vec![0x00, 0x01, 0x02]);
    }
}
