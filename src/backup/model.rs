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

//! The typed rows the read API returns.
//!
//! Numeric widths follow the replication protocol: uid, uidvalidity, size
//! and the CRCs are 32-bit; modseqs are 64-bit; timestamps are signed
//! 64-bit UNIX seconds.

use crate::storage::types::*;
use crate::sync::guid::Guid;

/// One gzip member of the data file, as recorded in the index.
///
/// `ts_end`, `length` and `data_sha1` are `None` for a chunk whose append
/// never completed; such a chunk is rejected by open-time validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub ts_start: UnixTimestamp,
    pub ts_end: Option<UnixTimestamp>,
    pub offset: u64,
    pub length: Option<u64>,
    pub file_sha1: String,
    pub data_sha1: Option<String>,
}

impl FromRow for Chunk {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            ts_start: row.get("ts_start")?,
            ts_end: row.get("ts_end")?,
            offset: row.get::<_, i64>("offset")? as u64,
            length: row.get::<_, Option<i64>>("length")?.map(|l| l as u64),
            file_sha1: row.get("file_sha1")?,
            data_sha1: row.get("data_sha1")?,
        })
    }
}

/// A mailbox and its replicated metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    pub id: MailboxId,
    pub last_chunk_id: ChunkId,
    pub uniqueid: String,
    pub mboxname: String,
    pub mboxtype: Option<String>,
    pub last_uid: u32,
    pub highestmodseq: u64,
    pub recentuid: u32,
    pub recenttime: UnixTimestamp,
    pub last_appenddate: UnixTimestamp,
    pub pop3_last_login: UnixTimestamp,
    pub pop3_show_after: UnixTimestamp,
    pub uidvalidity: u32,
    pub partition: Option<String>,
    pub acl: Option<String>,
    pub options: Option<String>,
    pub sync_crc: u32,
    pub sync_crc_annot: u32,
    pub quotaroot: Option<String>,
    pub xconvmodseq: u64,
    pub annotations: Option<String>,
    /// When the mailbox was UNMAILBOXed; zero while live.
    pub deleted: UnixTimestamp,
    /// Per-message records, populated only on `want_records` lookups.
    pub records: Option<Vec<MailboxMessage>>,
}

impl FromRow for Mailbox {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            last_chunk_id: row.get("last_chunk_id")?,
            uniqueid: row.get("uniqueid")?,
            mboxname: row.get("mboxname")?,
            mboxtype: row.get("mboxtype")?,
            last_uid: row.get("last_uid")?,
            highestmodseq: row.get::<_, i64>("highestmodseq")? as u64,
            recentuid: row.get("recentuid")?,
            recenttime: row.get("recenttime")?,
            last_appenddate: row.get("last_appenddate")?,
            pop3_last_login: row.get("pop3_last_login")?,
            pop3_show_after: row.get("pop3_show_after")?,
            uidvalidity: row.get("uidvalidity")?,
            partition: row.get("partition")?,
            acl: row.get("acl")?,
            options: row.get("options")?,
            sync_crc: row.get("sync_crc")?,
            sync_crc_annot: row.get("sync_crc_annot")?,
            quotaroot: row.get("quotaroot")?,
            xconvmodseq: row.get::<_, i64>("xconvmodseq")? as u64,
            annotations: row.get("annotations")?,
            deleted: row.get("deleted")?,
            records: None,
        })
    }
}

/// One message's occurrence within a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxMessage {
    pub id: i64,
    pub mailbox_id: MailboxId,
    pub mailbox_uniqueid: String,
    /// The owning `message` row, if the GUID was known when the record was
    /// indexed.
    pub message_id: Option<MessageId>,
    pub last_chunk_id: ChunkId,
    pub uid: u32,
    pub modseq: u64,
    pub last_updated: UnixTimestamp,
    pub flags: Option<String>,
    pub internaldate: UnixTimestamp,
    pub guid: Guid,
    pub size: u32,
    pub annotations: Option<String>,
    /// When the record was expunged; zero while live.
    pub expunged: UnixTimestamp,
}

impl FromRow for MailboxMessage {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            mailbox_id: row.get("mailbox_id")?,
            mailbox_uniqueid: row.get("mailbox_uniqueid")?,
            message_id: row.get("message_id")?,
            last_chunk_id: row.get("last_chunk_id")?,
            uid: row.get("uid")?,
            modseq: row.get::<_, i64>("modseq")? as u64,
            last_updated: row.get("last_updated")?,
            flags: row.get("flags")?,
            internaldate: row.get("internaldate")?,
            guid: row.get("guid")?,
            size: row.get("size")?,
            annotations: row.get("annotations")?,
            expunged: row.get("expunged")?,
        })
    }
}

/// A message's first-carried location in the data file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub guid: Guid,
    pub partition: Option<String>,
    /// The chunk that first carried the message's bytes.
    pub chunk_id: ChunkId,
    /// Position of the raw bytes within that chunk's decompressed stream.
    pub offset: u64,
    pub length: u64,
}

impl FromRow for Message {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            guid: row.get("guid")?,
            partition: row.get("partition")?,
            chunk_id: row.get("chunk_id")?,
            offset: row.get::<_, i64>("offset")? as u64,
            length: row.get::<_, i64>("length")? as u64,
        })
    }
}

/// The full column set written by a MAILBOX upsert.
#[derive(Clone, Debug, Default)]
pub struct MailboxUpsert {
    pub uniqueid: String,
    pub mboxname: String,
    pub mboxtype: Option<String>,
    pub last_uid: u32,
    pub highestmodseq: u64,
    pub recentuid: u32,
    pub recenttime: i64,
    pub last_appenddate: i64,
    pub pop3_last_login: i64,
    pub pop3_show_after: i64,
    pub uidvalidity: u32,
    pub partition: Option<String>,
    pub acl: Option<String>,
    pub options: Option<String>,
    pub sync_crc: u32,
    pub sync_crc_annot: u32,
    pub quotaroot: Option<String>,
    pub xconvmodseq: u64,
    pub annotations: Option<String>,
}

/// The full column set written by a RECORD upsert.
#[derive(Clone, Debug)]
pub struct MailboxMessageUpsert {
    pub mailbox_id: MailboxId,
    pub message_id: Option<MessageId>,
    pub uid: u32,
    pub modseq: u64,
    pub last_updated: i64,
    pub flags: Option<String>,
    pub internaldate: i64,
    pub guid: Guid,
    pub size: u32,
    pub annotations: Option<String>,
    pub expunged: i64,
}
