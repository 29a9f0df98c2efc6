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

//! Iteration over concatenated gzip members in a single file.
//!
//! The backup data file is a sequence of independent gzip members, one per
//! chunk. Validation and restore need to start decompression at an
//! arbitrary chunk boundary recorded in the index, and reindex needs to
//! walk every member in sequence, so this reader exposes member boundaries
//! instead of splicing the members together the way a plain multi-stream
//! decoder would.
//!
//! `read_member` never crosses into the next member. A member ends only
//! after its deflate stream terminates and the CRC32/ISIZE trailer has been
//! verified; a truncated or damaged member surfaces as `Corrupt`.

use std::fs;
use std::io::{self, Read};
use std::ops::Range;
use std::os::unix::fs::FileExt;

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Decompress, FlushDecompress, Status};

use crate::support::error::Error;

const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;
const FRESERVED: u8 = 0xe0;

const STAGING_SIZE: usize = 8192;

pub struct Gzuncat {
    file: fs::File,
    /// Staging buffer for compressed bytes, with `range` being the portion
    /// holding data read from the file but not yet consumed.
    buf: Vec<u8>,
    range: Range<usize>,
    /// File offset of the byte just past the end of `buf`'s content.
    ///
    /// All file access is positioned (`read_at`), so this reader neither
    /// perturbs nor depends on the descriptor's seek cursor; the session
    /// hashes and appends through other descriptors of the same file
    /// while a reader is live.
    file_pos: u64,
    member: Option<Member>,
}

struct Member {
    offset: u64,
    inflate: Decompress,
    crc: flate2::Crc,
    stream_end: bool,
}

impl Gzuncat {
    /// Opens a reader over `file`, positioned at offset 0 with no member
    /// started.
    pub fn new(file: fs::File) -> Result<Self, Error> {
        Ok(Self {
            file,
            buf: vec![0u8; STAGING_SIZE],
            range: 0..0,
            file_pos: 0,
            member: None,
        })
    }

    /// The file offset of the next byte this reader will consume.
    fn position(&self) -> u64 {
        self.file_pos - self.range.len() as u64
    }

    /// The file offset at which the current member starts.
    ///
    /// # Panics
    /// Panics if no member has been started.
    pub fn member_offset(&self) -> u64 {
        self.member.as_ref().expect("no gzip member started").offset
    }

    /// Begins decoding the member found at the current position.
    pub fn member_start(&mut self) -> Result<(), Error> {
        assert!(self.member.is_none(), "gzip member already started");

        let offset = self.position();
        self.parse_member_header()?;
        self.member = Some(Member {
            offset,
            inflate: Decompress::new(false),
            crc: flate2::Crc::new(),
            stream_end: false,
        });
        Ok(())
    }

    /// Seeks to `offset` and begins decoding the member found there.
    pub fn member_start_from(&mut self, offset: u64) -> Result<(), Error> {
        assert!(self.member.is_none(), "gzip member already started");

        self.file_pos = offset;
        self.range = 0..0;
        self.member_start()
    }

    /// Whether the current member's content has been fully decoded.
    pub fn member_eof(&self) -> bool {
        self.member.as_ref().map_or(true, |m| m.stream_end)
    }

    /// Finishes the current member, consuming any content not yet read, and
    /// returns the file offset just past its trailer, which is where the
    /// next member (or end of file) begins.
    pub fn member_end(&mut self) -> Result<u64, Error> {
        assert!(self.member.is_some(), "no gzip member started");

        let mut scratch = [0u8; STAGING_SIZE];
        while !self.member_eof() {
            self.read_member(&mut scratch)?;
        }

        self.member = None;
        Ok(self.position())
    }

    /// Whether the reader is positioned at the end of the file.
    ///
    /// Only meaningful between members.
    pub fn eof(&mut self) -> Result<bool, Error> {
        if !self.range.is_empty() {
            return Ok(false);
        }

        self.fill()?;
        Ok(self.range.is_empty())
    }

    /// Reads decompressed bytes from the current member.
    ///
    /// Returns 0 only at member EOF (or for an empty `out`). Never crosses
    /// into the next member.
    pub fn read_member(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            let (consumed, produced, end) = {
                // Split borrows: the staging buffer feeds the member's
                // decompressor.
                let Self {
                    ref mut member,
                    ref buf,
                    ref range,
                    ..
                } = *self;
                let member =
                    member.as_mut().expect("no gzip member started");
                if member.stream_end {
                    return Ok(0);
                }

                let input = &buf[range.clone()];
                let before_in = member.inflate.total_in();
                let before_out = member.inflate.total_out();
                let status = member
                    .inflate
                    .decompress(input, out, FlushDecompress::None)
                    .map_err(|_| Error::Corrupt)?;

                let consumed =
                    (member.inflate.total_in() - before_in) as usize;
                let produced =
                    (member.inflate.total_out() - before_out) as usize;
                member.crc.update(&out[..produced]);

                (consumed, produced, Status::StreamEnd == status)
            };

            self.range.start += consumed;

            if end {
                self.verify_trailer()?;
            }

            if produced > 0 || end {
                return Ok(produced);
            }

            // The decompressor made no progress; it needs more input.
            if self.range.is_empty() {
                self.fill()?;
                if self.range.is_empty() {
                    // EOF in the middle of a member.
                    return Err(Error::Corrupt);
                }
            } else if 0 == consumed {
                // Input available but refused: the stream is unusable.
                return Err(Error::Corrupt);
            }
        }
    }

    /// Reads and discards `n` decompressed bytes from the current member,
    /// failing with `Corrupt` if the member ends first.
    pub fn skip_member(&mut self, mut n: u64) -> Result<(), Error> {
        let mut scratch = [0u8; STAGING_SIZE];
        while n > 0 {
            let want =
                usize::try_from(n).unwrap_or(scratch.len()).min(scratch.len());
            let nread = self.read_member(&mut scratch[..want])?;
            if 0 == nread {
                return Err(Error::Corrupt);
            }
            n -= nread as u64;
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<(), Error> {
        if !self.range.is_empty() {
            return Ok(());
        }

        let nread = self.file.read_at(&mut self.buf, self.file_pos)?;
        self.range = 0..nread;
        self.file_pos += nread as u64;
        Ok(())
    }

    fn next_byte(&mut self) -> Result<u8, Error> {
        self.fill()?;
        if self.range.is_empty() {
            return Err(Error::Corrupt);
        }

        let byte = self.buf[self.range.start];
        self.range.start += 1;
        Ok(byte)
    }

    fn parse_member_header(&mut self) -> Result<(), Error> {
        if 0x1f != self.next_byte()? || 0x8b != self.next_byte()? {
            return Err(Error::Corrupt);
        }
        // CM must be deflate.
        if 8 != self.next_byte()? {
            return Err(Error::Corrupt);
        }

        let flg = self.next_byte()?;
        if 0 != flg & FRESERVED {
            return Err(Error::Corrupt);
        }

        // MTIME, XFL, OS carry no information we need.
        for _ in 0..6 {
            self.next_byte()?;
        }

        if 0 != flg & FEXTRA {
            let mut len_bytes = [0u8; 2];
            len_bytes[0] = self.next_byte()?;
            len_bytes[1] = self.next_byte()?;
            for _ in 0..LittleEndian::read_u16(&len_bytes) {
                self.next_byte()?;
            }
        }

        if 0 != flg & FNAME {
            while 0 != self.next_byte()? {}
        }

        if 0 != flg & FCOMMENT {
            while 0 != self.next_byte()? {}
        }

        if 0 != flg & FHCRC {
            self.next_byte()?;
            self.next_byte()?;
        }

        Ok(())
    }

    fn verify_trailer(&mut self) -> Result<(), Error> {
        let mut trailer = [0u8; 8];
        for byte in &mut trailer {
            *byte = self.next_byte()?;
        }

        let member = self.member.as_mut().expect("no gzip member started");
        let crc32 = LittleEndian::read_u32(&trailer[..4]);
        let isize = LittleEndian::read_u32(&trailer[4..]);

        if crc32 != member.crc.sum() || isize != member.crc.amount() {
            return Err(Error::Corrupt);
        }

        member.stream_end = true;
        Ok(())
    }
}

/// `Read` over the current member, for feeding the command parser.
///
/// Corruption surfaces as `InvalidData` so the caller can distinguish a
/// damaged member from plain I/O failure.
impl Read for Gzuncat {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self.read_member(out) {
            Ok(n) => Ok(n),
            Err(Error::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write as _;

    use tempfile::NamedTempFile;

    use super::*;

    fn gz_member(content: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        );
        enc.write_all(content).unwrap();
        enc.finish().unwrap()
    }

    fn file_of(data: &[u8]) -> fs::File {
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(data).unwrap();
        tf.reopen().unwrap()
    }

    fn read_all_member(gzuc: &mut Gzuncat) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7]; // odd size to exercise partial reads
        loop {
            let n = gzuc.read_member(&mut buf).unwrap();
            if 0 == n {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_sequential_members() {
        let mut data = gz_member(b"first member\r\n");
        let second_offset = data.len() as u64;
        data.extend_from_slice(&gz_member(b"second member\r\n"));

        let mut gzuc = Gzuncat::new(file_of(&data)).unwrap();

        assert!(!gzuc.eof().unwrap());
        gzuc.member_start().unwrap();
        assert_eq!(0, gzuc.member_offset());
        assert_eq!(b"first member\r\n".to_vec(), read_all_member(&mut gzuc));
        assert!(gzuc.member_eof());
        assert_eq!(second_offset, gzuc.member_end().unwrap());

        assert!(!gzuc.eof().unwrap());
        gzuc.member_start().unwrap();
        assert_eq!(second_offset, gzuc.member_offset());
        assert_eq!(b"second member\r\n".to_vec(), read_all_member(&mut gzuc));
        assert_eq!(data.len() as u64, gzuc.member_end().unwrap());

        assert!(gzuc.eof().unwrap());
    }

    #[test]
    fn test_member_start_from() {
        let mut data = gz_member(b"aaaa");
        let second_offset = data.len() as u64;
        data.extend_from_slice(&gz_member(b"bbbb"));

        let mut gzuc = Gzuncat::new(file_of(&data)).unwrap();
        gzuc.member_start_from(second_offset).unwrap();
        assert_eq!(second_offset, gzuc.member_offset());
        assert_eq!(b"bbbb".to_vec(), read_all_member(&mut gzuc));
    }

    #[test]
    fn test_member_end_skips_content() {
        let mut data = gz_member(b"skipped entirely");
        let second_offset = data.len() as u64;
        data.extend_from_slice(&gz_member(b"kept"));

        let mut gzuc = Gzuncat::new(file_of(&data)).unwrap();
        gzuc.member_start().unwrap();
        assert_eq!(second_offset, gzuc.member_end().unwrap());

        gzuc.member_start().unwrap();
        assert_eq!(b"kept".to_vec(), read_all_member(&mut gzuc));
    }

    #[test]
    fn test_corrupt_magic() {
        let mut data = gz_member(b"hello");
        data[0] = b'x';

        let mut gzuc = Gzuncat::new(file_of(&data)).unwrap();
        assert_matches!(Err(Error::Corrupt), gzuc.member_start());
    }

    #[test]
    fn test_corrupt_content() {
        let mut data = gz_member(b"some content that compresses");
        let mid = data.len() / 2;
        data[mid] ^= 0xff;

        let mut gzuc = Gzuncat::new(file_of(&data)).unwrap();
        gzuc.member_start().unwrap();

        let mut result = Ok(());
        let mut buf = [0u8; 64];
        loop {
            match gzuc.read_member(&mut buf) {
                Ok(0) => break,
                Ok(_) => (),
                Err(e) => {
                    result = Err(e);
                    break;
                },
            }
        }
        assert_matches!(Err(Error::Corrupt), result);
    }

    #[test]
    fn test_truncated_member() {
        let data = gz_member(b"this member gets cut short");
        let truncated = &data[..data.len() - 6];

        let mut gzuc = Gzuncat::new(file_of(truncated)).unwrap();
        gzuc.member_start().unwrap();
        assert_matches!(Err(Error::Corrupt), gzuc.member_end());
    }

    #[test]
    fn test_skip_member() {
        let data = gz_member(b"0123456789");

        let mut gzuc = Gzuncat::new(file_of(&data)).unwrap();
        gzuc.member_start().unwrap();
        gzuc.skip_member(4).unwrap();
        assert_eq!(b"456789".to_vec(), read_all_member(&mut gzuc));

        let mut gzuc = Gzuncat::new(file_of(&data)).unwrap();
        gzuc.member_start().unwrap();
        assert_matches!(Err(Error::Corrupt), gzuc.skip_member(11));
    }

    #[test]
    fn test_empty_file() {
        let mut gzuc = Gzuncat::new(file_of(b"")).unwrap();
        assert!(gzuc.eof().unwrap());
    }
}
