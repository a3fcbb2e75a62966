//! Async-event record layouts and decoding
//!
//! Format-string actions (printf/system/cat) reserve a 10000-wide id range
//! each: the record's action word is `base + call_site_id`, and the id keys
//! into the per-program argument tables the code generator fills in.
//! Everything from `Exit` up is a fixed action with its own record layout.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of each format-string id range.
pub const FORMAT_ID_RANGE: u64 = 10_000;

pub const ACTION_BASE_PRINTF: u64 = 0;
pub const ACTION_BASE_SYSTEM: u64 = 10_000;
pub const ACTION_BASE_CAT: u64 = 20_000;

/// Action discriminator stored in the first 8 bytes of every record.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncAction {
    Printf = ACTION_BASE_PRINTF,
    System = ACTION_BASE_SYSTEM,
    Cat = ACTION_BASE_CAT,
    Exit = 30_000,
    Print,
    PrintNonMap,
    Clear,
    Zero,
    Time,
    Strftime,
    Join,
    HelperError,
}

impl AsyncAction {
    pub fn id(self) -> u64 {
        self as u64
    }
}

/// A decoded ring-buffer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncEvent {
    /// Format-string actions carry the call-site id; argument bytes follow
    /// at the offsets recorded in the matching `*_args` table.
    Printf { id: u64, args: Vec<u8> },
    System { id: u64, args: Vec<u8> },
    Cat { id: u64, args: Vec<u8> },
    Exit,
    PrintMap { map_id: u64, top: u64, div: u64 },
    PrintNonMap { id: u64, content: Vec<u8> },
    Clear { map_id: u64 },
    Zero { map_id: u64 },
    Time { fmt_id: u64 },
    Strftime { fmt_id: u64, ts: u64 },
    Join { join_id: u64, data: Vec<u8> },
    HelperError { error_id: u64, retcode: i64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown action id {0}")]
    UnknownAction(u64),
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, DecodeError> {
    let end = offset + 8;
    if buf.len() < end {
        return Err(DecodeError::Truncated {
            need: end,
            have: buf.len(),
        });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..end]);
    Ok(u64::from_le_bytes(bytes))
}

impl AsyncEvent {
    /// Decode one record from raw ring-buffer bytes.
    pub fn decode(buf: &[u8]) -> Result<AsyncEvent, DecodeError> {
        let action = read_u64(buf, 0)?;

        if action < ACTION_BASE_SYSTEM {
            return Ok(AsyncEvent::Printf {
                id: action - ACTION_BASE_PRINTF,
                args: buf[8..].to_vec(),
            });
        }
        if action < ACTION_BASE_CAT {
            return Ok(AsyncEvent::System {
                id: action - ACTION_BASE_SYSTEM,
                args: buf[8..].to_vec(),
            });
        }
        if action < AsyncAction::Exit.id() {
            return Ok(AsyncEvent::Cat {
                id: action - ACTION_BASE_CAT,
                args: buf[8..].to_vec(),
            });
        }

        let event = match action {
            a if a == AsyncAction::Exit.id() => AsyncEvent::Exit,
            a if a == AsyncAction::Print.id() => AsyncEvent::PrintMap {
                map_id: read_u64(buf, 8)?,
                top: read_u64(buf, 16)?,
                div: read_u64(buf, 24)?,
            },
            a if a == AsyncAction::PrintNonMap.id() => AsyncEvent::PrintNonMap {
                id: read_u64(buf, 8)?,
                content: buf[16..].to_vec(),
            },
            a if a == AsyncAction::Clear.id() => AsyncEvent::Clear {
                map_id: read_u64(buf, 8)?,
            },
            a if a == AsyncAction::Zero.id() => AsyncEvent::Zero {
                map_id: read_u64(buf, 8)?,
            },
            a if a == AsyncAction::Time.id() => AsyncEvent::Time {
                fmt_id: read_u64(buf, 8)?,
            },
            a if a == AsyncAction::Strftime.id() => AsyncEvent::Strftime {
                fmt_id: read_u64(buf, 8)?,
                ts: read_u64(buf, 16)?,
            },
            a if a == AsyncAction::Join.id() => AsyncEvent::Join {
                join_id: read_u64(buf, 8)?,
                data: buf[16..].to_vec(),
            },
            a if a == AsyncAction::HelperError.id() => AsyncEvent::HelperError {
                error_id: read_u64(buf, 8)?,
                retcode: read_u64(buf, 16)? as i64,
            },
            other => return Err(DecodeError::UnknownAction(other)),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(words: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        for w in words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf
    }

    #[test]
    fn test_action_id_bases() {
        assert_eq!(AsyncAction::Printf.id(), 0);
        assert_eq!(AsyncAction::System.id(), 10_000);
        assert_eq!(AsyncAction::Cat.id(), 20_000);
        assert_eq!(AsyncAction::Exit.id(), 30_000);
        // Fixed actions continue directly after exit
        assert_eq!(AsyncAction::Print.id(), 30_001);
        assert_eq!(AsyncAction::HelperError.id(), 30_008);
    }

    #[test]
    fn test_decode_printf_with_id() {
        let buf = record(&[42, 0xdead]);
        assert_eq!(
            AsyncEvent::decode(&buf),
            Ok(AsyncEvent::Printf {
                id: 42,
                args: 0xdeadu64.to_le_bytes().to_vec()
            })
        );
    }

    #[test]
    fn test_decode_system_and_cat_strip_base() {
        let buf = record(&[ACTION_BASE_SYSTEM + 3]);
        assert!(matches!(
            AsyncEvent::decode(&buf),
            Ok(AsyncEvent::System { id: 3, .. })
        ));
        let buf = record(&[ACTION_BASE_CAT + 7]);
        assert!(matches!(
            AsyncEvent::decode(&buf),
            Ok(AsyncEvent::Cat { id: 7, .. })
        ));
    }

    #[test]
    fn test_decode_print_map() {
        let buf = record(&[AsyncAction::Print.id(), 5, 10, 1000]);
        assert_eq!(
            AsyncEvent::decode(&buf),
            Ok(AsyncEvent::PrintMap {
                map_id: 5,
                top: 10,
                div: 1000
            })
        );
    }

    #[test]
    fn test_decode_exit_and_clear() {
        assert_eq!(
            AsyncEvent::decode(&record(&[AsyncAction::Exit.id()])),
            Ok(AsyncEvent::Exit)
        );
        assert_eq!(
            AsyncEvent::decode(&record(&[AsyncAction::Clear.id(), 2])),
            Ok(AsyncEvent::Clear { map_id: 2 })
        );
    }

    #[test]
    fn test_decode_strftime_carries_timestamp() {
        let buf = record(&[AsyncAction::Strftime.id(), 1, 123_456_789]);
        assert_eq!(
            AsyncEvent::decode(&buf),
            Ok(AsyncEvent::Strftime {
                fmt_id: 1,
                ts: 123_456_789
            })
        );
    }

    #[test]
    fn test_decode_helper_error_negative_retcode() {
        let buf = record(&[AsyncAction::HelperError.id(), 9, (-14i64) as u64]);
        assert_eq!(
            AsyncEvent::decode(&buf),
            Ok(AsyncEvent::HelperError {
                error_id: 9,
                retcode: -14
            })
        );
    }

    #[test]
    fn test_decode_truncated_record() {
        let buf = record(&[AsyncAction::Print.id(), 5]);
        assert_eq!(
            AsyncEvent::decode(&buf[..12]),
            Err(DecodeError::Truncated { need: 16, have: 12 })
        );
    }

    #[test]
    fn test_decode_unknown_action() {
        let buf = record(&[99_999]);
        assert_eq!(AsyncEvent::decode(&buf), Err(DecodeError::UnknownAction(99_999)));
    }
}
