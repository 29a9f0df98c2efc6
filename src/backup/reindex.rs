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

//! Rebuilding the index from the data file alone.
//!
//! The data file is scanned member by member; each member becomes an
//! index-only append whose command lines are replayed through the normal
//! indexing policy. Chunk checksums are recomputed from the canonical
//! re-serialization of the APPLY lines, which matches the on-disk bytes
//! for any chunk this crate's own append engine wrote.
//!
//! A failure in the middle of a member rolls back that member's chunk row
//! and stops the scan; the members already processed stay indexed, and the
//! error carries the end offset of the last good member so an external
//! tool can truncate the file there and retry.

use std::io;
use std::path::Path;

use log::{error, info};

use super::append::{self, AppendMode};
use super::paths;
use super::session::Backup;
use crate::storage::types::UnixTimestamp;
use crate::support::{error::Error, gzuncat::Gzuncat, hash};
use crate::sync::dlist::{self, ParsedLine};

/// Rebuilds the index for the backup stored at `data_fname`.
///
/// The existing index is preserved as `<index>.old`; it is restored only
/// if the fresh index cannot be written at all. Scan failures leave the
/// fresh index holding every complete member.
pub fn reindex(data_fname: &Path) -> Result<(), Error> {
    let index_fname = paths::index_fname(data_fname);
    let mut backup = Backup::open_reindex(data_fname, &index_fname)?;

    let result = run(&mut backup);
    if let Err(ref e) = result {
        error!("{}: reindex failed: {}", data_fname.display(), e);
    }

    let close_result = backup.close();
    result.and(close_result)
}

fn run(backup: &mut Backup) -> Result<(), Error> {
    let mut gzuc = Gzuncat::new(backup.file.try_clone()?)?;
    let mut prev_member_ts: Option<UnixTimestamp> = None;
    let mut last_good_end: u64 = 0;

    while !gzuc.eof()? {
        gzuc.member_start()
            .map_err(|e| at_tail(e, last_good_end))?;
        let member_offset = gzuc.member_offset();
        info!(
            "{}: found chunk at offset {}",
            backup.data_fname().display(),
            member_offset,
        );

        let scanned = scan_member(
            backup,
            &mut gzuc,
            member_offset,
            &mut prev_member_ts,
        );
        if let Err(e) = scanned {
            if backup.append.is_some() {
                let _ = backup.append_abort();
            }
            return Err(at_tail(e, last_good_end));
        }

        last_good_end =
            gzuc.member_end().map_err(|e| at_tail(e, last_good_end))?;
    }

    info!(
        "{}: reindex reached end of file",
        backup.data_fname().display(),
    );
    Ok(())
}

/// Replays one member into an index-only append.
fn scan_member(
    backup: &mut Backup,
    gzuc: &mut Gzuncat,
    member_offset: u64,
    prev_member_ts: &mut Option<UnixTimestamp>,
) -> Result<(), Error> {
    let mut reader = dlist::LineReader::new(gzuc);
    let mut member_ts: Option<UnixTimestamp> = None;
    let mut last_line_ts: Option<UnixTimestamp> = None;
    let mut started = false;

    loop {
        let Some(parsed) = dlist::parse_any_line(&mut reader)? else {
            break;
        };

        match parsed {
            ParsedLine::Comment(comment) => {
                // The chunk header carries the start timestamp; it is the
                // only way to date a chunk with no commands.
                if member_ts.is_none() {
                    member_ts = append::chunk_header_ts(&comment);
                }
            },

            ParsedLine::Command(line) => {
                let ts = UnixTimestamp(line.ts);
                if member_ts.is_none() {
                    member_ts = Some(ts);
                }

                if !started {
                    start_member(
                        backup,
                        member_ts.expect("set above"),
                        member_offset,
                        *prev_member_ts,
                    )?;
                    started = true;
                }

                if last_line_ts.map_or(false, |prev| prev > ts) {
                    return Err(Error::TimestampRegression);
                }
                last_line_ts = Some(ts);

                if "APPLY" != line.verb {
                    continue;
                }

                let mut dl = line.dlist;
                dl.upcase_name();
                backup.append(&dl, ts)?;
            },
        }
    }

    if !started {
        // A chunk containing nothing but its header still gets a row; it
        // was a real (if empty) append, and skipping it would leave its
        // bytes looking unindexed.
        let Some(member_ts) = member_ts else {
            return Err(Error::MalformedCommand);
        };
        start_member(backup, member_ts, member_offset, *prev_member_ts)?;
    }

    *prev_member_ts = member_ts;
    backup.append_end()
}

fn start_member(
    backup: &mut Backup,
    member_ts: UnixTimestamp,
    member_offset: u64,
    prev_member_ts: Option<UnixTimestamp>,
) -> Result<(), Error> {
    if prev_member_ts.map_or(false, |prev| prev > member_ts) {
        return Err(Error::TimestampRegression);
    }

    let file_sha1 =
        hash::sha1_file_prefix(&mut backup.file, member_offset)?;
    backup.append_start_at(
        member_ts,
        member_offset,
        &file_sha1,
        AppendMode::INDEX_ONLY,
    )
}

/// Pins gzip-level damage to the end of the last complete member so the
/// caller knows where a safe truncation point lies.
fn at_tail(e: Error, valid_to: u64) -> Error {
    match e {
        Error::Corrupt => Error::CorruptTail { valid_to },
        Error::Io(ref io_e)
            if matches!(
                io_e.kind(),
                io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
            ) =>
        {
            Error::CorruptTail { valid_to }
        },
        e => e,
    }
}
