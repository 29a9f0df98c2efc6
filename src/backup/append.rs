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

//! The append engine.
//!
//! An append spans one chunk: `append_start` opens a gzip member on the
//! data file and a named index transaction, `append` writes command lines
//! into both, and `append_end` finalizes the chunk row and commits. The
//! index transaction is committed only after the gzip member is closed, so
//! a crash at any point leaves either a fully indexed chunk or a dangling
//! unindexed member — never an index entry for data that is not on disk.
//!
//! Only one append may be open per session; starting a second is a
//! contract violation and panics. Aborting rolls back the index but leaves
//! the already-written bytes, which the next open will reject until
//! reindex.

use bitflags::bitflags;

use super::model::{MailboxMessageUpsert, MailboxUpsert};
use super::session::Backup;
use crate::storage::types::{ChunkId, UnixTimestamp};
use crate::support::{
    error::Error,
    gzwriter::GzWriter,
    hash::{self, Sha1},
};
use crate::sync::{
    dlist::{self, Dlist, LiteralSpan, Value},
    guid::Guid,
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AppendMode: u8 {
        /// Update only the index; the data file already holds the chunk
        /// (reindex).
        const INDEX_ONLY = 1;
        /// Skip the per-command full flush. Cheaper, but a crash loses
        /// everything since the previous flush.
        const NO_FLUSH = 2;
    }
}

#[derive(Debug)]
pub(super) struct AppendState {
    mode: AppendMode,
    writer: Option<GzWriter>,
    sha: Sha1,
    wrote: u64,
    last_ts: UnixTimestamp,
    chunk_id: ChunkId,
}

/// The comment line opening every chunk.
pub(super) fn chunk_header(ts: UnixTimestamp) -> String {
    format!("# cyrus backup: chunk start {}\r\n", ts.0)
}

/// Recovers the timestamp from a chunk header comment.
pub(super) fn chunk_header_ts(comment: &[u8]) -> Option<UnixTimestamp> {
    std::str::from_utf8(comment)
        .ok()?
        .strip_prefix("# cyrus backup: chunk start ")?
        .trim()
        .parse()
        .ok()
        .map(UnixTimestamp)
}

impl Backup {
    /// Starts a new chunk at the end of the data file.
    pub fn append_start(&mut self) -> Result<(), Error> {
        self.append_start_mode(AppendMode::empty())
    }

    /// `append_start` without the per-command flush discipline.
    pub fn append_start_noflush(&mut self) -> Result<(), Error> {
        self.append_start_mode(AppendMode::NO_FLUSH)
    }

    fn append_start_mode(&mut self, mode: AppendMode) -> Result<(), Error> {
        let offset = self.file.metadata()?.len();
        let file_sha1 = hash::sha1_file_prefix(&mut self.file, u64::MAX)?;
        self.append_start_at(UnixTimestamp::now(), offset, &file_sha1, mode)
    }

    /// Starts an append at an explicit position, as reindex does when the
    /// chunk's bytes are already in the file.
    pub(super) fn append_start_at(
        &mut self,
        ts: UnixTimestamp,
        offset: u64,
        file_sha1: &str,
        mode: AppendMode,
    ) -> Result<(), Error> {
        assert!(self.append.is_none(), "backup append already started");

        let header = chunk_header(ts);

        let mut writer = None;
        if !mode.contains(AppendMode::INDEX_ONLY) {
            // A duplicate descriptor keeps the member writer's lifetime
            // independent of the session fd; O_APPEND is shared, so its
            // writes always land at EOF.
            let mut w = GzWriter::new(self.file.try_clone()?)?;
            w.write_all(header.as_bytes())?;
            if !mode.contains(AppendMode::NO_FLUSH) {
                w.flush_full()?;
            }
            writer = Some(w);
        }

        let mut sha = Sha1::new()?;
        sha.update(header.as_bytes())?;

        self.index.begin("backup_index")?;
        let chunk_id = match self.index.add_chunk(ts, offset, file_sha1) {
            Ok(chunk_id) => chunk_id,
            Err(e) => {
                let _ = self.index.rollback("backup_index");
                // The dropped writer leaves a headerless-trailer member
                // behind; the next open rejects it.
                return Err(e);
            },
        };

        self.append = Some(AppendState {
            mode,
            writer,
            sha,
            wrote: header.len() as u64,
            last_ts: ts,
            chunk_id,
        });
        Ok(())
    }

    /// Appends one replication command to the open chunk and indexes it.
    ///
    /// On error the append is no longer usable; the caller should
    /// `append_abort`.
    pub fn append(
        &mut self,
        dl: &Dlist,
        ts: UnixTimestamp,
    ) -> Result<(), Error> {
        assert!(self.append.is_some(), "backup append not started");

        let (line, literals) = {
            let state = self.append.as_ref().expect("checked above");
            dlist::format_line(ts.0, "APPLY", dl, state.wrote)?
        };

        {
            let state = self.append.as_mut().expect("checked above");
            state.sha.update(&line)?;

            if let Some(ref mut writer) = state.writer {
                writer.write_all(&line)?;
                // A full flush after every command bounds what a crash can
                // lose to commands not yet reported appended.
                if !state.mode.contains(AppendMode::NO_FLUSH) {
                    writer.flush_full()?;
                }
            }

            state.wrote += line.len() as u64;
            state.last_ts = ts;
        }

        self.index_command(dl, ts, &literals)
    }

    /// Finalizes the chunk: closes the gzip member, stamps the chunk row
    /// with its terminal fields, and commits the index transaction.
    pub fn append_end(&mut self) -> Result<(), Error> {
        let AppendState {
            mode: _,
            writer,
            sha,
            wrote,
            last_ts,
            chunk_id,
        } = self.append.take().expect("backup append not started");

        if let Some(writer) = writer {
            if let Err(e) = writer.finish() {
                let _ = self.index.rollback("backup_index");
                return Err(e);
            }
        }

        let data_sha1 = match sha.finish_hex() {
            Ok(data_sha1) => data_sha1,
            Err(e) => {
                let _ = self.index.rollback("backup_index");
                return Err(e);
            },
        };

        let result = self
            .index
            .finish_chunk(chunk_id, last_ts, wrote, &data_sha1)
            .and_then(|()| self.index.commit("backup_index"));
        if let Err(e) = result {
            let _ = self.index.rollback("backup_index");
            return Err(e);
        }

        Ok(())
    }

    /// Abandons the open append, rolling back its index transaction.
    ///
    /// The gzip bytes already written stay in the data file as a dangling
    /// member. Whether the file can be truncated back is the caller's
    /// decision; the next open will demand a reindex either way.
    pub fn append_abort(&mut self) -> Result<(), Error> {
        let state = self.append.take().expect("backup append not started");
        drop(state.writer);
        self.index.rollback("backup_index")
    }

    // -----------------------------------------------------------------
    // Per-command indexing policy

    fn index_command(
        &mut self,
        dl: &Dlist,
        ts: UnixTimestamp,
        literals: &[LiteralSpan],
    ) -> Result<(), Error> {
        let chunk_id =
            self.append.as_ref().expect("checked by append").chunk_id;

        match dl.name() {
            Some("MAILBOX") => self.index_mailbox(chunk_id, dl, ts),
            Some("MESSAGE") => self.index_message(chunk_id, dl, literals),
            Some("UNMAILBOX") => {
                let mboxname =
                    dl.atom("MBOXNAME").ok_or(Error::MalformedCommand)?;
                self.index.set_mailbox_deleted(mboxname, ts, chunk_id)
            },
            Some("EXPUNGE") => self.index_expunge(chunk_id, dl, ts),
            Some("RENAME") => {
                let oldmboxname =
                    dl.atom("OLDMBOXNAME").ok_or(Error::MalformedCommand)?;
                let newmboxname =
                    dl.atom("NEWMBOXNAME").ok_or(Error::MalformedCommand)?;
                self.index.rename_mailbox(
                    oldmboxname,
                    newmboxname,
                    dl.num32("UIDVALIDITY"),
                    chunk_id,
                )
            },
            // Anything else is preserved in the log for the future but has
            // no index representation.
            _ => Ok(()),
        }
    }

    fn index_mailbox(
        &mut self,
        chunk_id: ChunkId,
        dl: &Dlist,
        ts: UnixTimestamp,
    ) -> Result<(), Error> {
        let uniqueid =
            dl.atom("UNIQUEID").ok_or(Error::MalformedCommand)?;
        let mboxname =
            dl.atom("MBOXNAME").ok_or(Error::MalformedCommand)?;

        let up = MailboxUpsert {
            uniqueid: uniqueid.to_owned(),
            mboxname: mboxname.to_owned(),
            mboxtype: dl.atom("MBOXTYPE").map(str::to_owned),
            last_uid: dl.num32("LAST_UID").unwrap_or(0),
            highestmodseq: dl.num64("HIGHESTMODSEQ").unwrap_or(0),
            recentuid: dl.num32("RECENTUID").unwrap_or(0),
            recenttime: dl.date("RECENTTIME").unwrap_or(0),
            last_appenddate: dl.date("LAST_APPENDDATE").unwrap_or(0),
            pop3_last_login: dl.date("POP3_LAST_LOGIN").unwrap_or(0),
            pop3_show_after: dl.date("POP3_SHOW_AFTER").unwrap_or(0),
            uidvalidity: dl.num32("UIDVALIDITY").unwrap_or(0),
            partition: dl.atom("PARTITION").map(str::to_owned),
            acl: dl.atom("ACL").map(str::to_owned),
            options: dl.atom("OPTIONS").map(str::to_owned),
            sync_crc: dl.num32("SYNC_CRC").unwrap_or(0),
            sync_crc_annot: dl.num32("SYNC_CRC_ANNOT").unwrap_or(0),
            quotaroot: dl.atom("QUOTAROOT").map(str::to_owned),
            xconvmodseq: dl.num64("XCONVMODSEQ").unwrap_or(0),
            annotations: format_opt_map(dl.get("ANNOTATIONS"))?,
        };
        let mailbox_id = self.index.upsert_mailbox(&up, chunk_id)?;

        let Some(records) = dl.get("RECORD") else {
            return Ok(());
        };

        for record in records.children() {
            let uid = record.num32("UID").ok_or(Error::MalformedCommand)?;
            let guid = record
                .atom("GUID")
                .and_then(Guid::decode)
                .ok_or(Error::MalformedCommand)?;

            let (flags, was_expunged) = split_expunged(record.get("FLAGS"))?;
            let message_id = self.index.message_id_by_guid(&guid)?;

            let up = MailboxMessageUpsert {
                mailbox_id,
                message_id,
                uid,
                modseq: record.num64("MODSEQ").unwrap_or(0),
                last_updated: record.date("LAST_UPDATED").unwrap_or(0),
                flags,
                internaldate: record.date("INTERNALDATE").unwrap_or(0),
                guid,
                size: record.num32("SIZE").unwrap_or(0),
                annotations: format_opt_map(record.get("ANNOTATIONS"))?,
                expunged: if was_expunged { ts.0 } else { 0 },
            };
            self.index.upsert_mailbox_message(&up, chunk_id)?;
        }

        Ok(())
    }

    fn index_message(
        &mut self,
        chunk_id: ChunkId,
        dl: &Dlist,
        literals: &[LiteralSpan],
    ) -> Result<(), Error> {
        let items = dl.children();
        if items.len() != literals.len() {
            return Err(Error::MalformedCommand);
        }

        for (item, span) in items.iter().zip(literals) {
            let guid = item
                .atom("GUID")
                .and_then(Guid::decode)
                .ok_or(Error::MalformedCommand)?;
            let payload =
                item.literal("DATA").ok_or(Error::MalformedCommand)?;
            if payload.len() as u64 != span.length {
                return Err(Error::MalformedCommand);
            }

            // A guid we already carry is an idempotent no-op; the new copy
            // stays in the log but the index keeps pointing at the first.
            if self.index.message_id_by_guid(&guid)?.is_some() {
                continue;
            }

            self.index.insert_message(
                &guid,
                item.atom("PARTITION"),
                chunk_id,
                span.offset,
                span.length,
            )?;
        }

        Ok(())
    }

    fn index_expunge(
        &mut self,
        chunk_id: ChunkId,
        dl: &Dlist,
        ts: UnixTimestamp,
    ) -> Result<(), Error> {
        let uniqueid =
            dl.atom("UNIQUEID").ok_or(Error::MalformedCommand)?;
        let uids = dl.get("UID").ok_or(Error::MalformedCommand)?;

        // Expunging in a mailbox this backup has never seen is fine; the
        // mailbox's creation may simply predate the backup.
        let Some(mailbox_id) = self.index.mailbox_id_by_uniqueid(uniqueid)?
        else {
            return Ok(());
        };

        for uid in uids.children() {
            let uid = match *uid.value() {
                Value::Atom(ref s) => {
                    s.parse().map_err(|_| Error::MalformedCommand)?
                },
                _ => return Err(Error::MalformedCommand),
            };
            self.index
                .expunge_mailbox_message(mailbox_id, uid, ts, chunk_id)?;
        }

        Ok(())
    }
}

/// Serializes an optional kvlist/list value for storage in a TEXT column.
fn format_opt_map(dl: Option<&Dlist>) -> Result<Option<String>, Error> {
    let Some(dl) = dl else {
        return Ok(None);
    };

    let bytes = dlist::format_map(dl.value())?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| Error::MalformedCommand)
}

/// Splits an `\Expunged` marker out of a FLAGS list, returning the
/// remaining flags (serialized, `None` if empty) and whether the marker
/// was present.
fn split_expunged(
    flags: Option<&Dlist>,
) -> Result<(Option<String>, bool), Error> {
    let Some(flags) = flags else {
        return Ok((None, false));
    };

    let mut kept = Vec::new();
    let mut was_expunged = false;
    for flag in flags.children() {
        match *flag.value() {
            Value::Atom(ref s) if s.eq_ignore_ascii_case("\\Expunged") => {
                was_expunged = true;
            },
            _ => kept.push(flag.clone()),
        }
    }

    if kept.is_empty() {
        return Ok((None, was_expunged));
    }

    let bytes = dlist::format_map(&Value::List(kept))?;
    String::from_utf8(bytes)
        .map(|s| (Some(s), was_expunged))
        .map_err(|_| Error::MalformedCommand)
}
