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

//! Writes one gzip member, appended to the data file.
//!
//! The stock encoder wrappers only flush on their own schedule; the append
//! engine needs a full deflate flush after every command line so that a
//! crash loses nothing that `append` already reported durable, and so that
//! the member's compression state never leaks into bytes the reader could
//! misattribute. So the deflate stream is driven by hand here.
//!
//! A deflate stream error or allocation failure leaves the compressed
//! stream unusable with bytes already on disk; there is no way to continue
//! or rewind an append-only member, so those terminate the process.

use std::fs;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Compress, Compression, FlushCompress, Status};
use log::error;

use crate::support::error::Error;

/// Minimal member header: deflate, no flags, no mtime, unknown OS.
const MEMBER_HEADER: [u8; 10] =
    [0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 0xff];

const OUT_SIZE: usize = 8192;

#[derive(Debug)]
pub struct GzWriter {
    file: fs::File,
    deflate: Compress,
    crc: flate2::Crc,
    out: Vec<u8>,
}

impl GzWriter {
    /// Starts a new gzip member on `file`, which should be positioned (or
    /// opened in append mode) at the member's offset. The member header is
    /// written immediately.
    pub fn new(mut file: fs::File) -> Result<Self, Error> {
        file.write_all(&MEMBER_HEADER)?;
        Ok(Self {
            file,
            deflate: Compress::new(Compression::default(), false),
            crc: flate2::Crc::new(),
            out: vec![0u8; OUT_SIZE],
        })
    }

    /// Compresses the whole of `data` into the member.
    ///
    /// The compressed form is not necessarily on disk until the next
    /// `flush_full` or `finish`.
    pub fn write_all(&mut self, mut data: &[u8]) -> Result<(), Error> {
        self.crc.update(data);

        while !data.is_empty() {
            let before_in = self.deflate.total_in();
            let produced = self.drive(data, FlushCompress::None)?;
            let consumed = (self.deflate.total_in() - before_in) as usize;
            data = &data[consumed..];

            if 0 == consumed && 0 == produced {
                // Cannot happen with a healthy stream; treat as fatal
                // rather than spin.
                fatal_stream_error("deflate made no progress");
            }
        }

        Ok(())
    }

    /// Performs a full deflate flush: everything written so far becomes
    /// decodable from the bytes now on disk, independent of any data
    /// appended later.
    pub fn flush_full(&mut self) -> Result<(), Error> {
        loop {
            let produced = self.drive(&[], FlushCompress::Full)?;
            if produced < self.out.len() {
                break;
            }
        }
        self.file.flush()?;
        Ok(())
    }

    /// Terminates the member: finishes the deflate stream and writes the
    /// CRC32/ISIZE trailer.
    pub fn finish(mut self) -> Result<(), Error> {
        loop {
            let before_out = self.deflate.total_out();
            let status = match self.deflate.compress(
                &[],
                &mut self.out,
                FlushCompress::Finish,
            ) {
                Ok(status) => status,
                Err(e) => fatal_stream_error(&e.to_string()),
            };
            let produced = (self.deflate.total_out() - before_out) as usize;
            self.file.write_all(&self.out[..produced])?;

            if Status::StreamEnd == status {
                break;
            }
        }

        let mut trailer = [0u8; 8];
        LittleEndian::write_u32(&mut trailer[..4], self.crc.sum());
        LittleEndian::write_u32(&mut trailer[4..], self.crc.amount());
        self.file.write_all(&trailer)?;
        self.file.flush()?;

        Ok(())
    }

    /// One pass through the compressor, writing whatever it produced.
    /// Returns the number of produced bytes.
    fn drive(
        &mut self,
        input: &[u8],
        flush: FlushCompress,
    ) -> Result<usize, Error> {
        let before_out = self.deflate.total_out();
        if let Err(e) = self.deflate.compress(input, &mut self.out, flush) {
            fatal_stream_error(&e.to_string());
        }

        let produced = (self.deflate.total_out() - before_out) as usize;
        self.file.write_all(&self.out[..produced])?;
        Ok(produced)
    }
}

// Dropping without finish() deliberately leaves the member without a
// trailer; an aborted append keeps its bytes on disk as a dangling member
// which the next open rejects until reindex.

fn fatal_stream_error(what: &str) -> ! {
    error!("IOERROR: deflate stream unrecoverable: {}", what);
    std::process::exit(74);
}
