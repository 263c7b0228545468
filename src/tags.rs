//! Tag-length-value codec for the attendee payload packed into NTAG pages.

use std::convert::TryInto;

use crate::error::Error;
use crate::ntag21x::{PageReader, PageWriter};

pub const TAG_ATTENDEE_ID: u8 = 0x01;
pub const TAG_SIGNATURE: u8 = 0x02;
pub const TAG_ISSUANCE: u8 = 0x03;
pub const TAG_TIMESTAMP: u8 = 0x04;
pub const TAG_EXPIRATION: u8 = 0x05;
const TAG_TERMINATOR: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardPayload {
    pub attendee_id: u32,
    pub convention_id: u32,
    pub issuance_count: u32,
    pub issuance_timestamp: u64,
    pub expiration: Option<u64>,
    pub signature: Vec<u8>,
}

/// A partial update, as accepted by `PATCH /write`: `None` fields are left
/// untouched on the card.
#[derive(Debug, Clone, Default)]
pub struct PartialCardPayload {
    pub attendee_id: Option<u32>,
    pub convention_id: Option<u32>,
    pub issuance_count: Option<u32>,
    pub issuance_timestamp: Option<u64>,
    pub expiration: Option<u64>,
    pub signature: Option<Vec<u8>>,
}

/// Streams a full tag list, the `0x00` terminator, through a `PageWriter`.
pub fn encode_to_writer(writer: &mut PageWriter, tags: &[Tag]) -> Result<(), Error> {
    for tag in tags {
        if tag.data.len() > 0xFF {
            return Err(Error::malformed("tag data too long for a one-byte length"));
        }
        writer.write_byte(tag.id)?;
        writer.write_byte(tag.data.len() as u8)?;
        for &b in &tag.data {
            writer.write_byte(b)?;
        }
    }
    writer.finish()
}

/// Streams tags out of a `PageReader` until the terminator, or returns an
/// empty list if the terminator is the very first byte.
pub fn decode_from_reader(reader: &mut PageReader) -> Result<Vec<Tag>, Error> {
    let mut tags = Vec::new();
    loop {
        let id = reader.read_byte()?;
        if id == TAG_TERMINATOR {
            break;
        }
        let len = reader.read_byte()?;
        if len == 0 {
            return Err(Error::malformed("zero-length tag, probably corrupt data"));
        }
        if !matches!(
            id,
            TAG_ATTENDEE_ID | TAG_SIGNATURE | TAG_ISSUANCE | TAG_TIMESTAMP | TAG_EXPIRATION
        ) {
            return Err(Error::malformed(format!("unknown tag id {:#04x}", id)));
        }
        let mut data = vec![0u8; len as usize];
        for byte in data.iter_mut() {
            *byte = reader.read_byte()?;
        }
        tags.push(Tag { id, data });
    }
    Ok(tags)
}

pub fn encode(payload: &CardPayload) -> Vec<Tag> {
    let mut tags = Vec::new();

    let mut attendee = Vec::with_capacity(8);
    attendee.extend_from_slice(&payload.attendee_id.to_be_bytes());
    attendee.extend_from_slice(&payload.convention_id.to_be_bytes());
    tags.push(Tag {
        id: TAG_ATTENDEE_ID,
        data: attendee,
    });

    tags.push(Tag {
        id: TAG_ISSUANCE,
        data: payload.issuance_count.to_be_bytes().to_vec(),
    });

    tags.push(Tag {
        id: TAG_TIMESTAMP,
        data: payload.issuance_timestamp.to_be_bytes().to_vec(),
    });

    if let Some(expiration) = payload.expiration {
        if expiration != 0 {
            tags.push(Tag {
                id: TAG_EXPIRATION,
                data: expiration.to_be_bytes().to_vec(),
            });
        }
    }

    tags.push(Tag {
        id: TAG_SIGNATURE,
        data: payload.signature.clone(),
    });

    tags
}

pub fn decode(tags: &[Tag]) -> Result<CardPayload, Error> {
    let mut attendee_id = None;
    let mut convention_id = None;
    let mut issuance_count = None;
    let mut issuance_timestamp = None;
    let mut expiration = None;
    let mut signature = None;

    for tag in tags {
        match tag.id {
            TAG_ATTENDEE_ID => {
                if tag.data.len() != 8 {
                    return Err(Error::malformed("AttendeeId tag must be 8 bytes"));
                }
                attendee_id = Some(u32::from_be_bytes(tag.data[0..4].try_into().unwrap()));
                convention_id = Some(u32::from_be_bytes(tag.data[4..8].try_into().unwrap()));
            }
            TAG_ISSUANCE => {
                if tag.data.len() != 4 {
                    return Err(Error::malformed("Issuance tag must be 4 bytes"));
                }
                issuance_count = Some(u32::from_be_bytes(tag.data[0..4].try_into().unwrap()));
            }
            TAG_TIMESTAMP => {
                if tag.data.len() != 8 {
                    return Err(Error::malformed("Timestamp tag must be 8 bytes"));
                }
                issuance_timestamp = Some(u64::from_be_bytes(tag.data[0..8].try_into().unwrap()));
            }
            TAG_EXPIRATION => {
                if tag.data.len() != 8 {
                    return Err(Error::malformed("Expiration tag must be 8 bytes"));
                }
                expiration = Some(u64::from_be_bytes(tag.data[0..8].try_into().unwrap()));
            }
            TAG_SIGNATURE => {
                signature = Some(tag.data.clone());
            }
            other => return Err(Error::malformed(format!("unknown tag id {:#04x}", other))),
        }
    }

    Ok(CardPayload {
        attendee_id: attendee_id.ok_or_else(|| Error::malformed("missing AttendeeId tag"))?,
        convention_id: convention_id.ok_or_else(|| Error::malformed("missing AttendeeId tag"))?,
        issuance_count: issuance_count.ok_or_else(|| Error::malformed("missing Issuance tag"))?,
        issuance_timestamp: issuance_timestamp
            .ok_or_else(|| Error::malformed("missing Timestamp tag"))?,
        expiration,
        signature: signature.ok_or_else(|| Error::malformed("missing Signature tag"))?,
    })
}

/// Renders a tag list as human-readable lines for diagnostics. Unlike
/// `decode`, tolerates unknown tag ids and malformed lengths rather than
/// erroring - this is a best-effort dump, not a path anything downstream
/// depends on.
pub fn describe(tags: &[Tag]) -> Vec<String> {
    tags.iter().map(describe_one).collect()
}

fn describe_one(tag: &Tag) -> String {
    match tag.id {
        TAG_ATTENDEE_ID if tag.data.len() == 8 => {
            let attendee = u32::from_be_bytes(tag.data[0..4].try_into().unwrap());
            let convention = u32::from_be_bytes(tag.data[4..8].try_into().unwrap());
            format!("AttendeeId attendee={} convention={}", attendee, convention)
        }
        TAG_ISSUANCE if tag.data.len() == 4 => {
            let value = u32::from_be_bytes(tag.data[0..4].try_into().unwrap());
            format!("Issuance value={}", value)
        }
        TAG_TIMESTAMP if tag.data.len() == 8 => {
            let unix = u64::from_be_bytes(tag.data[0..8].try_into().unwrap());
            format!("Timestamp unix={}", unix)
        }
        TAG_EXPIRATION if tag.data.len() == 8 => {
            let unix = u64::from_be_bytes(tag.data[0..8].try_into().unwrap());
            format!("Expiration unix={}", unix)
        }
        TAG_SIGNATURE => format!("Signature ({} bytes)", tag.data.len()),
        other => format!("unknown tag id {:#04x} ({} bytes)", other, tag.data.len()),
    }
}

/// Replaces the data of records named by `partial`, preserving the length
/// and id order of `existing`.
pub fn update(existing: &[Tag], partial: &PartialCardPayload) -> Result<Vec<Tag>, Error> {
    let current = decode(existing)?;

    let attendee_id = partial.attendee_id.unwrap_or(current.attendee_id);
    let convention_id = partial.convention_id.unwrap_or(current.convention_id);
    let issuance_count = partial.issuance_count.unwrap_or(current.issuance_count);
    let issuance_timestamp = partial
        .issuance_timestamp
        .unwrap_or(current.issuance_timestamp);
    let expiration = partial.expiration.or(current.expiration);
    let signature = partial.signature.clone().unwrap_or(current.signature);

    let mut merged = Vec::with_capacity(existing.len());
    for tag in existing {
        let data = match tag.id {
            TAG_ATTENDEE_ID if partial.attendee_id.is_some() || partial.convention_id.is_some() => {
                let mut d = Vec::with_capacity(8);
                d.extend_from_slice(&attendee_id.to_be_bytes());
                d.extend_from_slice(&convention_id.to_be_bytes());
                d
            }
            TAG_ISSUANCE if partial.issuance_count.is_some() => {
                issuance_count.to_be_bytes().to_vec()
            }
            TAG_TIMESTAMP if partial.issuance_timestamp.is_some() => {
                issuance_timestamp.to_be_bytes().to_vec()
            }
            TAG_EXPIRATION if partial.expiration.is_some() => {
                expiration.unwrap_or(0).to_be_bytes().to_vec()
            }
            TAG_SIGNATURE if partial.signature.is_some() => signature.clone(),
            _ => tag.data.clone(),
        };
        merged.push(Tag { id: tag.id, data });
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CardPayload {
        CardPayload {
            attendee_id: 123,
            convention_id: 32,
            issuance_count: 1,
            issuance_timestamp: 1_700_000_000,
            expiration: Some(1_700_086_400),
            signature: vec![0xAB; 64],
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let payload = sample();
        let tags = encode(&payload);
        let decoded = decode(&tags).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn omits_expiration_tag_when_none_or_zero() {
        let mut payload = sample();
        payload.expiration = None;
        let tags = encode(&payload);
        assert!(!tags.iter().any(|t| t.id == TAG_EXPIRATION));

        payload.expiration = Some(0);
        let tags = encode(&payload);
        assert!(!tags.iter().any(|t| t.id == TAG_EXPIRATION));
    }

    #[test]
    fn decode_rejects_unknown_tag_id() {
        let tags = vec![Tag {
            id: 0x7F,
            data: vec![0x00],
        }];
        assert!(decode(&tags).is_err());
    }

    #[test]
    fn describe_tolerates_unknown_tag_id() {
        let tags = vec![Tag {
            id: 0x7F,
            data: vec![0x00],
        }];
        let lines = describe(&tags);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("unknown tag id"));
    }

    #[test]
    fn describe_formats_known_tags() {
        let payload = sample();
        let tags = encode(&payload);
        let lines = describe(&tags);
        assert!(lines.iter().any(|l| l.starts_with("AttendeeId")));
        assert!(lines.iter().any(|l| l.starts_with("Signature")));
    }

    #[test]
    fn update_preserves_order_and_length() {
        let payload = sample();
        let tags = encode(&payload);
        let partial = PartialCardPayload {
            convention_id: Some(33),
            ..Default::default()
        };
        let updated = update(&tags, &partial).unwrap();
        assert_eq!(updated.len(), tags.len());
        assert_eq!(
            updated.iter().map(|t| t.id).collect::<Vec<_>>(),
            tags.iter().map(|t| t.id).collect::<Vec<_>>()
        );
        let decoded = decode(&updated).unwrap();
        assert_eq!(decoded.convention_id, 33);
        assert_eq!(decoded.attendee_id, payload.attendee_id);
    }
}
