// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stored item envelope.
//!
//! ```text
//! ┌──────────────────┬──────────────────────┐
//! │ Expiry (4B LE)   │ Payload (variable)   │
//! └──────────────────┴──────────────────────┘
//! ```
//!
//! Expiry is an absolute unix timestamp in seconds; `0` never expires.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::ensure;

use crate::protocol::{MalformedEnvelopeSnafu, ProtocolError};

const EXPIRY_SIZE: usize = 4;

/// Packs `payload` with its expiry for storage.
pub fn pack(expiry: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(EXPIRY_SIZE + payload.len());
    buf.put_u32_le(expiry);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a stored item into `(expiry, payload)` without copying the payload.
pub fn unpack(mut item: Bytes) -> Result<(u32, Bytes), ProtocolError> {
    ensure!(
        item.len() >= EXPIRY_SIZE,
        MalformedEnvelopeSnafu { len: item.len() }
    );
    let expiry = item.get_u32_le();
    Ok((expiry, item))
}

/// Whether an item with `expiry` is still live at `now` (unix seconds).
pub fn is_live(expiry: u32, now: i64) -> bool { expiry == 0 || i64::from(expiry) >= now }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let item = pack(0x0102_0304, b"hi");
        assert_eq!(&item[..], &[0x04, 0x03, 0x02, 0x01, b'h', b'i']);
    }

    #[test]
    fn test_unpack_empty_payload() {
        let (expiry, payload) = unpack(pack(7, b"")).unwrap();
        assert_eq!(expiry, 7);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_unpack_rejects_short_item() {
        assert!(matches!(
            unpack(Bytes::from_static(b"ab")),
            Err(ProtocolError::MalformedEnvelope { len: 2, .. })
        ));
    }

    #[test]
    fn test_liveness() {
        assert!(is_live(0, 1_000));
        assert!(is_live(1_000, 1_000));
        assert!(is_live(1_010, 1_000));
        assert!(!is_live(990, 1_000));
    }
}
