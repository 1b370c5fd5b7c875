//! Binary framing of the query protocol.
//!
//! Every integer is a 4-byte signed value in the host's native byte order.
//! A response starts with an entity count; `0` means the file does not exist
//! and `-1` means it could not be analyzed. Each entity then follows as
//! `firstLine, nameLength, textLength, name, displayText`.

use anyhow::{Context, Result};

use crate::tree::CodeEntity;

pub const STATUS_READY: i32 = 1;
pub const STATUS_DEGRADED: i32 = 0;

const COUNT_MISSING: i32 = 0;
const COUNT_FAILED: i32 = -1;
const FRAME_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFrame {
    pub first_line: u32,
    pub name: String,
    pub text: String,
}

impl From<&CodeEntity> for EntityFrame {
    fn from(entity: &CodeEntity) -> Self {
        EntityFrame {
            first_line: entity.first_line,
            name: entity.name.clone(),
            text: entity.display_text(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Missing,
    Failed,
    Entities(Vec<EntityFrame>),
}

impl Response {
    pub fn from_entities(entities: &[CodeEntity]) -> Self {
        Response::Entities(entities.iter().map(EntityFrame::from).collect())
    }

    /// Whole frame as one buffer, so a failure never leaves half a frame on
    /// the stream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Response::Missing => Ok(COUNT_MISSING.to_ne_bytes().to_vec()),
            Response::Failed => Ok(COUNT_FAILED.to_ne_bytes().to_vec()),
            Response::Entities(frames) => {
                let mut out = Vec::new();
                put_len(&mut out, frames.len(), "entity count")?;
                for frame in frames {
                    let first_line = i32::try_from(frame.first_line)
                        .with_context(|| format!("Line {} does not fit a frame", frame.first_line))?;
                    out.extend_from_slice(&first_line.to_ne_bytes());
                    put_len(&mut out, frame.name.len(), "name length")?;
                    put_len(&mut out, frame.text.len(), "text length")?;
                    out.extend_from_slice(frame.name.as_bytes());
                    out.extend_from_slice(frame.text.as_bytes());
                }
                Ok(out)
            }
        }
    }

    /// Parses one response from the start of `bytes`, returning it with the
    /// number of bytes consumed. `None` when `bytes` holds an incomplete frame.
    pub fn decode(bytes: &[u8]) -> Option<(Response, usize)> {
        let mut cursor = 0;
        let count = take_i32(bytes, &mut cursor)?;
        match count {
            COUNT_MISSING => return Some((Response::Missing, cursor)),
            COUNT_FAILED => return Some((Response::Failed, cursor)),
            _ => {}
        }

        let count = usize::try_from(count).ok()?;
        if count > (bytes.len() - cursor) / FRAME_HEADER_LEN {
            return None;
        }
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let first_line = u32::try_from(take_i32(bytes, &mut cursor)?).ok()?;
            let name_len = usize::try_from(take_i32(bytes, &mut cursor)?).ok()?;
            let text_len = usize::try_from(take_i32(bytes, &mut cursor)?).ok()?;
            let name = take_str(bytes, &mut cursor, name_len)?;
            let text = take_str(bytes, &mut cursor, text_len)?;
            frames.push(EntityFrame {
                first_line,
                name,
                text,
            });
        }
        Some((Response::Entities(frames), cursor))
    }
}

pub fn encode_status(ready: bool) -> [u8; 4] {
    let status = if ready { STATUS_READY } else { STATUS_DEGRADED };
    status.to_ne_bytes()
}

fn put_len(out: &mut Vec<u8>, len: usize, what: &str) -> Result<()> {
    let value = i32::try_from(len).with_context(|| format!("{what} {len} does not fit a frame"))?;
    out.extend_from_slice(&value.to_ne_bytes());
    Ok(())
}

fn take_i32(bytes: &[u8], cursor: &mut usize) -> Option<i32> {
    let raw: [u8; 4] = bytes.get(*cursor..*cursor + 4)?.try_into().ok()?;
    *cursor += 4;
    Some(i32::from_ne_bytes(raw))
}

fn take_str(bytes: &[u8], cursor: &mut usize, len: usize) -> Option<String> {
    let raw = bytes.get(*cursor..*cursor + len)?;
    *cursor += len;
    String::from_utf8(raw.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_counts() {
        assert_eq!(Response::Missing.encode().unwrap(), 0i32.to_ne_bytes());
        assert_eq!(Response::Failed.encode().unwrap(), (-1i32).to_ne_bytes());
        assert_eq!(encode_status(true), 1i32.to_ne_bytes());
        assert_eq!(encode_status(false), 0i32.to_ne_bytes());
    }

    #[test]
    fn entity_frame_layout() {
        let response = Response::Entities(vec![EntityFrame {
            first_line: 7,
            name: "m".to_string(),
            text: "C.m(self)".to_string(),
        }]);
        let bytes = response.encode().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&1i32.to_ne_bytes());
        expected.extend_from_slice(&7i32.to_ne_bytes());
        expected.extend_from_slice(&1i32.to_ne_bytes());
        expected.extend_from_slice(&9i32.to_ne_bytes());
        expected.extend_from_slice(b"m");
        expected.extend_from_slice(b"C.m(self)");
        assert_eq!(bytes, expected);

        assert_eq!(Response::decode(&bytes), Some((response, bytes.len())));
    }

    #[test]
    fn truncated_frames_do_not_decode() {
        let bytes = Response::Entities(vec![EntityFrame {
            first_line: 1,
            name: "f".to_string(),
            text: "f()".to_string(),
        }])
        .encode()
        .unwrap();
        assert_eq!(Response::decode(&bytes[..bytes.len() - 1]), None);
        assert_eq!(Response::decode(&[0, 0]), None);
    }

    #[test]
    fn oversized_counts_are_incomplete_frames() {
        let mut bytes = i32::MAX.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 24]);
        assert_eq!(Response::decode(&bytes), None);
    }

    #[test]
    fn empty_entity_list_reads_as_missing() {
        // a zero count is indistinguishable from a missing file on the wire
        let bytes = Response::Entities(Vec::new()).encode().unwrap();
        assert_eq!(Response::decode(&bytes), Some((Response::Missing, 4)));
    }
}
