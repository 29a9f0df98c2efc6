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

//! SHA-1 plumbing for the backup format.
//!
//! Every chunk carries two checksums: the SHA-1 of the data file up to the
//! chunk's offset, and the SHA-1 of the chunk's decompressed content. Both
//! are stored as lowercase hex.

use std::fs;
use std::io::{Read, Seek, SeekFrom};

use openssl::hash::{Hasher, MessageDigest};

use crate::support::error::Error;

/// Streaming SHA-1 whose final form is a lowercase hex digest.
pub struct Sha1 {
    hasher: Hasher,
}

impl std::fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha1").finish_non_exhaustive()
    }
}

impl Sha1 {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            hasher: Hasher::new(MessageDigest::sha1())?,
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), Error> {
        self.hasher.update(data)?;
        Ok(())
    }

    pub fn finish_hex(mut self) -> Result<String, Error> {
        let digest = self.hasher.finish()?;
        Ok(hex(&digest))
    }
}

/// Formats `bytes` as lowercase hex.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(2 * bytes.len());
    for &b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// SHA-1 of the first `limit` bytes of `file`, as lowercase hex.
///
/// Pass `u64::MAX` to hash the whole file. The file position is left
/// wherever the hashing stopped; callers must not rely on it.
pub fn sha1_file_prefix(file: &mut fs::File, limit: u64) -> Result<String, Error> {
    file.seek(SeekFrom::Start(0))?;

    let mut sha = Sha1::new()?;
    let mut buf = [0u8; 8192];
    let mut remaining = limit;

    while remaining > 0 {
        let want = usize::try_from(remaining).unwrap_or(buf.len()).min(buf.len());
        let nread = file.read(&mut buf[..want])?;
        if 0 == nread {
            break;
        }

        sha.update(&buf[..nread])?;
        remaining -= nread as u64;
    }

    sha.finish_hex()
}
