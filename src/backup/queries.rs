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

//! Typed queries over the index, plus raw message retrieval.
//!
//! Everything here is idempotent and returns owned rows in insertion
//! order. The `foreach` variants drive a visitor; returning
//! `ControlFlow::Break` aborts the traversal and hands the break value
//! back to the caller. `chunk_id` filters restrict mailboxes and records
//! to those last touched by that chunk, and messages to those carried by
//! it; `None` means all chunks.
//!
//! A `want_records` lookup either returns a fully populated mailbox or
//! fails; it never hands back a half-populated row.

use std::ops::ControlFlow;

use super::model::{Chunk, Mailbox, MailboxMessage, Message};
use super::session::Backup;
use crate::storage::types::{ChunkId, MailboxId, MessageId};
use crate::support::{error::Error, gzuncat::Gzuncat};
use crate::sync::{
    dlist::{self, Dlist, Value},
    guid::Guid,
};

impl Backup {
    pub fn get_mailbox_id(
        &mut self,
        uniqueid: &str,
    ) -> Result<Option<MailboxId>, Error> {
        self.index.mailbox_id_by_uniqueid(uniqueid)
    }

    pub fn get_mailbox_by_name(
        &mut self,
        mboxname: &str,
        want_records: bool,
    ) -> Result<Option<Mailbox>, Error> {
        let Some(mut mailbox) = self.index.mailbox_by_name(mboxname)? else {
            return Ok(None);
        };

        if want_records {
            mailbox.records =
                Some(self.index.mailbox_messages_of(mailbox.id)?);
        }
        Ok(Some(mailbox))
    }

    pub fn get_mailboxes(
        &mut self,
        chunk_id: Option<ChunkId>,
        want_records: bool,
    ) -> Result<Vec<Mailbox>, Error> {
        let mut mailboxes = self.index.mailboxes(chunk_id)?;
        if want_records {
            for mailbox in &mut mailboxes {
                mailbox.records =
                    Some(self.index.mailbox_messages_of(mailbox.id)?);
            }
        }
        Ok(mailboxes)
    }

    pub fn mailbox_foreach<B>(
        &mut self,
        chunk_id: Option<ChunkId>,
        want_records: bool,
        mut proc: impl FnMut(&Mailbox) -> ControlFlow<B>,
    ) -> Result<Option<B>, Error> {
        for mailbox in self.get_mailboxes(chunk_id, want_records)? {
            if let ControlFlow::Break(abort) = proc(&mailbox) {
                return Ok(Some(abort));
            }
        }
        Ok(None)
    }

    pub fn get_mailbox_messages(
        &mut self,
        chunk_id: Option<ChunkId>,
    ) -> Result<Vec<MailboxMessage>, Error> {
        self.index.mailbox_messages(chunk_id)
    }

    pub fn get_message_id(
        &mut self,
        guid: &Guid,
    ) -> Result<Option<MessageId>, Error> {
        self.index.message_id_by_guid(guid)
    }

    pub fn get_message(
        &mut self,
        guid: &Guid,
    ) -> Result<Option<Message>, Error> {
        self.index.message_by_guid(guid)
    }

    pub fn message_foreach<B>(
        &mut self,
        chunk_id: Option<ChunkId>,
        mut proc: impl FnMut(&Message) -> ControlFlow<B>,
    ) -> Result<Option<B>, Error> {
        for message in self.index.messages(chunk_id)? {
            if let ControlFlow::Break(abort) = proc(&message) {
                return Ok(Some(abort));
            }
        }
        Ok(None)
    }

    pub fn get_chunks(&mut self) -> Result<Vec<Chunk>, Error> {
        self.index.chunks()
    }

    pub fn get_latest_chunk(&mut self) -> Result<Option<Chunk>, Error> {
        self.index.latest_chunk()
    }

    /// Fetches a message's raw bytes by GUID, decompressing the owning
    /// chunk from its recorded offset.
    pub fn read_message(
        &mut self,
        guid: &Guid,
    ) -> Result<Option<Vec<u8>>, Error> {
        let Some(message) = self.index.message_by_guid(guid)? else {
            return Ok(None);
        };
        let chunk = self
            .index
            .chunk_by_id(message.chunk_id)?
            .ok_or(Error::Corrupt)?;

        let mut gzuc = Gzuncat::new(self.file.try_clone()?)?;
        gzuc.member_start_from(chunk.offset)?;
        gzuc.skip_member(message.offset)?;

        let mut data =
            vec![
                0u8;
                usize::try_from(message.length)
                    .map_err(|_| Error::Corrupt)?
            ];
        let mut filled = 0;
        while filled < data.len() {
            let nread = gzuc.read_member(&mut data[filled..])?;
            if 0 == nread {
                return Err(Error::Corrupt);
            }
            filled += nread;
        }

        Ok(Some(data))
    }
}

/// Rebuilds the replication MAILBOX kvlist from an index row, records
/// included if the row carries them. This is the restore path's input.
pub fn mailbox_to_dlist(mailbox: &Mailbox) -> Result<Dlist, Error> {
    let mut dl = Dlist::kvlist("MAILBOX");
    dl.set_atom("UNIQUEID", &*mailbox.uniqueid)
        .set_atom("MBOXNAME", &*mailbox.mboxname);
    if let Some(ref mboxtype) = mailbox.mboxtype {
        dl.set_atom("MBOXTYPE", &**mboxtype);
    }
    dl.set_num32("LAST_UID", mailbox.last_uid)
        .set_num64("HIGHESTMODSEQ", mailbox.highestmodseq)
        .set_num32("RECENTUID", mailbox.recentuid)
        .set_date("RECENTTIME", mailbox.recenttime.0)
        .set_date("LAST_APPENDDATE", mailbox.last_appenddate.0)
        .set_date("POP3_LAST_LOGIN", mailbox.pop3_last_login.0)
        .set_date("POP3_SHOW_AFTER", mailbox.pop3_show_after.0)
        .set_num32("UIDVALIDITY", mailbox.uidvalidity);
    if let Some(ref partition) = mailbox.partition {
        dl.set_atom("PARTITION", &**partition);
    }
    if let Some(ref acl) = mailbox.acl {
        dl.set_atom("ACL", &**acl);
    }
    if let Some(ref options) = mailbox.options {
        dl.set_atom("OPTIONS", &**options);
    }
    dl.set_num32("SYNC_CRC", mailbox.sync_crc)
        .set_num32("SYNC_CRC_ANNOT", mailbox.sync_crc_annot);
    if let Some(ref quotaroot) = mailbox.quotaroot {
        dl.set_atom("QUOTAROOT", &**quotaroot);
    }
    dl.set_num64("XCONVMODSEQ", mailbox.xconvmodseq);
    if let Some(ref annotations) = mailbox.annotations {
        dl.set_value(
            "ANNOTATIONS",
            dlist::parse_map(annotations.as_bytes())?,
        );
    }

    let Some(ref records) = mailbox.records else {
        return Ok(dl);
    };

    let mut record_list = Vec::new();
    for record in records {
        let mut entry = Dlist::anonymous_kvlist();
        entry
            .set_num32("UID", record.uid)
            .set_num64("MODSEQ", record.modseq)
            .set_date("LAST_UPDATED", record.last_updated.0)
            .set_date("INTERNALDATE", record.internaldate.0)
            .set_atom("GUID", record.guid.encode())
            .set_num32("SIZE", record.size);

        let mut flags = match record.flags {
            Some(ref flags) => match dlist::parse_map(flags.as_bytes())? {
                Value::List(children) => children,
                _ => return Err(Error::MalformedCommand),
            },
            None => Vec::new(),
        };
        if record.expunged.0 != 0 {
            flags.push(Dlist::flag("\\Expunged"));
        }
        if !flags.is_empty() {
            entry.set_value("FLAGS", Value::List(flags));
        }

        if let Some(ref annotations) = record.annotations {
            entry.set_value(
                "ANNOTATIONS",
                dlist::parse_map(annotations.as_bytes())?,
            );
        }

        record_list.push(entry);
    }
    dl.set_value("RECORD", Value::List(record_list));

    Ok(dl)
}
