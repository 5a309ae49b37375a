//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! EventTime: the 8-byte (seconds, nanoseconds) extension value used as the
//! timestamp of every forwarded entry.

use crate::error::{FluentError, Result};
use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// MessagePack extension type code for EventTime.
pub const EVENT_TIME_EXT_TYPE: i8 = 0;

/// A (epoch_seconds, nanoseconds) pair, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventTime {
    pub epoch_seconds: u32,
    pub nanoseconds: u32,
}

impl EventTime {
    pub fn from_epoch(seconds: u64, nanoseconds: u32) -> Result<Self> {
        if seconds >= u32::MAX as u64 + 1 {
            return Err(FluentError::EventTimeRange(seconds));
        }
        Ok(Self {
            epoch_seconds: seconds as u32,
            nanoseconds,
        })
    }

    pub fn from_millis(ms: u64) -> Result<Self> {
        let seconds = ms / 1000;
        let nanos = (ms % 1000) as u32 * 1_000_000;
        Self::from_epoch(seconds, nanos)
    }

    pub fn from_date(wall: DateTime<Utc>) -> Result<Self> {
        let seconds = wall.timestamp();
        if seconds < 0 {
            return Err(FluentError::EventTimeRange(0));
        }
        Self::from_epoch(seconds as u64, wall.timestamp_subsec_nanos())
    }

    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        // SystemTime::now() is always within u32 range until year 2106.
        Self {
            epoch_seconds: dur.as_secs() as u32,
            nanoseconds: dur.subsec_nanos(),
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.epoch_seconds.to_be_bytes());
        out[4..8].copy_from_slice(&self.nanoseconds.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(FluentError::DataType(format!(
                "EventTime extension must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        let mut sec = [0u8; 4];
        let mut nanos = [0u8; 4];
        sec.copy_from_slice(&bytes[0..4]);
        nanos.copy_from_slice(&bytes[4..8]);
        Ok(Self {
            epoch_seconds: u32::from_be_bytes(sec),
            nanoseconds: u32::from_be_bytes(nanos),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let et = EventTime {
            epoch_seconds: 1_700_000_000,
            nanoseconds: 123_456_789,
        };
        let bytes = et.encode();
        assert_eq!(bytes.len(), 8);
        let back = EventTime::decode(&bytes).unwrap();
        assert_eq!(et, back);
    }

    #[test]
    fn from_millis_splits_nanos() {
        let et = EventTime::from_millis(1_700_000_123).unwrap();
        assert_eq!(et.epoch_seconds, 1_700_000);
        assert_eq!(et.nanoseconds, 123_000_000);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = EventTime { epoch_seconds: 10, nanoseconds: 999 };
        let b = EventTime { epoch_seconds: 11, nanoseconds: 0 };
        assert!(a < b);

        let c = EventTime { epoch_seconds: 10, nanoseconds: 500 };
        assert!(c < a);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(EventTime::decode(&[0u8; 7]).is_err());
        assert!(EventTime::decode(&[0u8; 9]).is_err());
    }

    #[test]
    fn from_epoch_rejects_out_of_range_seconds() {
        assert!(EventTime::from_epoch(u32::MAX as u64 + 1, 0).is_err());
        assert!(EventTime::from_epoch(u32::MAX as u64, 0).is_ok());
    }
}
