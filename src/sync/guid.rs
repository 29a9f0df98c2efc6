//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Syncbak.
//
// Syncbak is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Syncbak is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty  of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU  General Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Syncbak. If not, see <http://www.gnu.org/licenses/>.

//! 160-bit message content identifiers.
//!
//! A GUID is the SHA-1 of a message's raw bytes. On the wire and in the
//! index it is always the 40-character lowercase hex encoding.

use std::fmt;

use crate::support::{error::Error, hash};

pub const GUID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid([u8; GUID_SIZE]);

impl Guid {
    pub fn from_bytes(bytes: [u8; GUID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Computes the GUID of raw message content.
    pub fn of_content(data: &[u8]) -> Result<Self, Error> {
        let mut sha = hash::Sha1::new()?;
        sha.update(data)?;

        let hex = sha.finish_hex()?;
        Ok(Self::decode(&hex).expect("SHA-1 hex did not round-trip"))
    }

    /// Decodes the 40-character hex form, returning `None` if `s` is not
    /// one.
    pub fn decode(s: &str) -> Option<Self> {
        if 2 * GUID_SIZE != s.len() {
            return None;
        }

        let mut bytes = [0u8; GUID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = (s.as_bytes()[2 * i] as char).to_digit(16)?;
            let lo = (s.as_bytes()[2 * i + 1] as char).to_digit(16)?;
            *byte = (hi << 4 | lo) as u8;
        }

        Some(Self(bytes))
    }

    pub fn encode(&self) -> String {
        hash::hex(&self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.encode())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let guid = Guid::of_content(b"hello").unwrap();
        let encoded = guid.encode();
        assert_eq!(40, encoded.len());
        assert_eq!(Some(guid), Guid::decode(&encoded));
    }

    #[test]
    fn test_known_content() {
        assert_eq!(
            "a9993e364706816aba3e25717850c26c9cd0d89d",
            Guid::of_content(b"abc").unwrap().encode(),
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(None, Guid::decode(""));
        assert_eq!(None, Guid::decode("abc"));
        assert_eq!(
            None,
            Guid::decode("zzzz3e364706816aba3e25717850c26c9cd0d89d"),
        );
        // Upper-case is not the canonical form but decodes.
        assert!(
            Guid::decode("A9993E364706816ABA3E25717850C26C9CD0D89D").is_some()
        );
    }
}
