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

use std::path::Path;
use std::time::Duration;

use rusqlite::OptionalExtension as _;

use super::{db_migrations, types::*};
use crate::backup::model::*;
use crate::support::error::Error;
use crate::sync::guid::Guid;

/// A connection to a backup's `.index` database.
///
/// Writes happen inside named transactions (`SAVEPOINT`s) so that the
/// append engine can hold one logical transaction open across the whole
/// chunk while issuing many statements through `&mut self` methods.
#[derive(Debug)]
pub struct IndexDb {
    cxn: rusqlite::Connection,
}

static MIGRATIONS: &[&str] = &[include_str!("indexdb.v1.sql")];

impl IndexDb {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
        )?;

        cxn.pragma_update(None, "foreign_keys", true)?;
        cxn.busy_timeout(Duration::from_secs(10))?;

        db_migrations::apply_migrations(&mut cxn, "backup index", MIGRATIONS)?;

        Ok(Self { cxn })
    }

    pub fn close(self) -> Result<(), Error> {
        self.cxn.close().map_err(|(_, e)| e.into())
    }

    /// Whether the index contains any chunk at all.
    pub fn is_empty(&mut self) -> Result<bool, Error> {
        let count: i64 = self.cxn.query_row(
            "SELECT COUNT(*) FROM `chunk`",
            (),
            from_single,
        )?;
        Ok(0 == count)
    }

    // -----------------------------------------------------------------
    // Named transactions

    pub fn begin(&mut self, name: &str) -> Result<(), Error> {
        self.cxn
            .execute_batch(&format!("SAVEPOINT `{}`", savepoint(name)))?;
        Ok(())
    }

    pub fn commit(&mut self, name: &str) -> Result<(), Error> {
        self.cxn
            .execute_batch(&format!("RELEASE `{}`", savepoint(name)))?;
        Ok(())
    }

    pub fn rollback(&mut self, name: &str) -> Result<(), Error> {
        let name = savepoint(name);
        self.cxn.execute_batch(&format!(
            "ROLLBACK TO `{0}`; RELEASE `{0}`",
            name
        ))?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Chunks

    pub fn add_chunk(
        &mut self,
        ts_start: UnixTimestamp,
        offset: u64,
        file_sha1: &str,
    ) -> Result<ChunkId, Error> {
        self.cxn
            .execute(
                "INSERT INTO `chunk` (`ts_start`, `offset`, `file_sha1`) \
                 VALUES (?, ?, ?)",
                (ts_start, offset as i64, file_sha1),
            )
            .map_err(conflict)?;
        Ok(ChunkId(self.cxn.last_insert_rowid()))
    }

    pub fn finish_chunk(
        &mut self,
        id: ChunkId,
        ts_end: UnixTimestamp,
        length: u64,
        data_sha1: &str,
    ) -> Result<(), Error> {
        self.cxn.execute(
            "UPDATE `chunk` SET `ts_end` = ?, `length` = ?, `data_sha1` = ? \
             WHERE `id` = ?",
            (ts_end, length as i64, data_sha1, id),
        )?;
        Ok(())
    }

    pub fn latest_chunk(&mut self) -> Result<Option<Chunk>, Error> {
        self.cxn
            .query_row(
                "SELECT * FROM `chunk` ORDER BY `id` DESC LIMIT 1",
                (),
                from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn chunk_by_id(&mut self, id: ChunkId) -> Result<Option<Chunk>, Error> {
        self.cxn
            .query_row("SELECT * FROM `chunk` WHERE `id` = ?", (id,), from_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn chunks(&mut self) -> Result<Vec<Chunk>, Error> {
        self.cxn
            .prepare("SELECT * FROM `chunk` ORDER BY `id`")?
            .query_map((), from_row)?
            .collect::<Result<Vec<Chunk>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------
    // Mailboxes

    pub fn mailbox_id_by_uniqueid(
        &mut self,
        uniqueid: &str,
    ) -> Result<Option<MailboxId>, Error> {
        self.cxn
            .query_row(
                "SELECT `id` FROM `mailbox` WHERE `uniqueid` = ?",
                (uniqueid,),
                from_single,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Creates or fully overwrites the mailbox identified by
    /// `up.uniqueid`, stamping it with `last_chunk_id`. A re-applied
    /// mailbox comes back to life: `deleted` resets to zero.
    pub fn upsert_mailbox(
        &mut self,
        up: &MailboxUpsert,
        last_chunk_id: ChunkId,
    ) -> Result<MailboxId, Error> {
        let updated = self
            .cxn
            .execute(
                "UPDATE `mailbox` SET \
                 `last_chunk_id` = ?, `mboxname` = ?, `mboxtype` = ?, \
                 `last_uid` = ?, `highestmodseq` = ?, `recentuid` = ?, \
                 `recenttime` = ?, `last_appenddate` = ?, \
                 `pop3_last_login` = ?, `pop3_show_after` = ?, \
                 `uidvalidity` = ?, `partition` = ?, `acl` = ?, \
                 `options` = ?, `sync_crc` = ?, `sync_crc_annot` = ?, \
                 `quotaroot` = ?, `xconvmodseq` = ?, `annotations` = ?, \
                 `deleted` = 0 \
                 WHERE `uniqueid` = ?",
                rusqlite::params![
                    last_chunk_id,
                    up.mboxname,
                    up.mboxtype,
                    up.last_uid,
                    up.highestmodseq as i64,
                    up.recentuid,
                    up.recenttime,
                    up.last_appenddate,
                    up.pop3_last_login,
                    up.pop3_show_after,
                    up.uidvalidity,
                    up.partition,
                    up.acl,
                    up.options,
                    up.sync_crc,
                    up.sync_crc_annot,
                    up.quotaroot,
                    up.xconvmodseq as i64,
                    up.annotations,
                    up.uniqueid,
                ],
            )
            .map_err(conflict)?;

        if 0 != updated {
            return self
                .mailbox_id_by_uniqueid(&up.uniqueid)?
                .ok_or(Error::Corrupt);
        }

        self.cxn
            .execute(
                "INSERT INTO `mailbox` (\
                 `last_chunk_id`, `uniqueid`, `mboxname`, `mboxtype`, \
                 `last_uid`, `highestmodseq`, `recentuid`, `recenttime`, \
                 `last_appenddate`, `pop3_last_login`, `pop3_show_after`, \
                 `uidvalidity`, `partition`, `acl`, `options`, `sync_crc`, \
                 `sync_crc_annot`, `quotaroot`, `xconvmodseq`, \
                 `annotations`) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
                 ?, ?, ?, ?)",
                rusqlite::params![
                    last_chunk_id,
                    up.uniqueid,
                    up.mboxname,
                    up.mboxtype,
                    up.last_uid,
                    up.highestmodseq as i64,
                    up.recentuid,
                    up.recenttime,
                    up.last_appenddate,
                    up.pop3_last_login,
                    up.pop3_show_after,
                    up.uidvalidity,
                    up.partition,
                    up.acl,
                    up.options,
                    up.sync_crc,
                    up.sync_crc_annot,
                    up.quotaroot,
                    up.xconvmodseq as i64,
                    up.annotations,
                ],
            )
            .map_err(conflict)?;

        Ok(MailboxId(self.cxn.last_insert_rowid()))
    }

    /// Marks the named mailbox deleted (UNMAILBOX).
    ///
    /// Unknown names are a no-op, as a backup may legitimately see the
    /// removal of a mailbox whose creation predates the backup.
    pub fn set_mailbox_deleted(
        &mut self,
        mboxname: &str,
        deleted: UnixTimestamp,
        last_chunk_id: ChunkId,
    ) -> Result<(), Error> {
        self.cxn.execute(
            "UPDATE `mailbox` SET `deleted` = ?, `last_chunk_id` = ? \
             WHERE `mboxname` = ?",
            (deleted, last_chunk_id, mboxname),
        )?;
        Ok(())
    }

    /// Renames a mailbox (RENAME), optionally refreshing its uidvalidity.
    pub fn rename_mailbox(
        &mut self,
        oldmboxname: &str,
        newmboxname: &str,
        uidvalidity: Option<u32>,
        last_chunk_id: ChunkId,
    ) -> Result<(), Error> {
        match uidvalidity {
            Some(uidvalidity) => self.cxn.execute(
                "UPDATE `mailbox` SET `mboxname` = ?, `uidvalidity` = ?, \
                 `last_chunk_id` = ? WHERE `mboxname` = ?",
                (newmboxname, uidvalidity, last_chunk_id, oldmboxname),
            ),
            None => self.cxn.execute(
                "UPDATE `mailbox` SET `mboxname` = ?, `last_chunk_id` = ? \
                 WHERE `mboxname` = ?",
                (newmboxname, last_chunk_id, oldmboxname),
            ),
        }
        .map_err(conflict)?;
        Ok(())
    }

    pub fn mailbox_by_name(
        &mut self,
        mboxname: &str,
    ) -> Result<Option<Mailbox>, Error> {
        self.cxn
            .query_row(
                "SELECT * FROM `mailbox` WHERE `mboxname` = ? \
                 ORDER BY `id` LIMIT 1",
                (mboxname,),
                from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn mailboxes(
        &mut self,
        chunk_id: Option<ChunkId>,
    ) -> Result<Vec<Mailbox>, Error> {
        let rows = match chunk_id {
            None => self
                .cxn
                .prepare("SELECT * FROM `mailbox` ORDER BY `id`")?
                .query_map((), from_row)?
                .collect::<Result<Vec<Mailbox>, _>>(),
            Some(chunk_id) => self
                .cxn
                .prepare(
                    "SELECT * FROM `mailbox` WHERE `last_chunk_id` = ? \
                     ORDER BY `id`",
                )?
                .query_map((chunk_id,), from_row)?
                .collect::<Result<Vec<Mailbox>, _>>(),
        };
        rows.map_err(Into::into)
    }

    // -----------------------------------------------------------------
    // Mailbox messages

    const MAILBOX_MESSAGE_SELECT: &'static str =
        "SELECT `mailbox_message`.*, \
         `mailbox`.`uniqueid` AS `mailbox_uniqueid` \
         FROM `mailbox_message` \
         JOIN `mailbox` ON `mailbox`.`id` = `mailbox_message`.`mailbox_id`";

    pub fn upsert_mailbox_message(
        &mut self,
        up: &MailboxMessageUpsert,
        last_chunk_id: ChunkId,
    ) -> Result<(), Error> {
        let updated = self
            .cxn
            .execute(
                "UPDATE `mailbox_message` SET \
                 `message_id` = ?, `last_chunk_id` = ?, `modseq` = ?, \
                 `last_updated` = ?, `flags` = ?, `internaldate` = ?, \
                 `guid` = ?, `size` = ?, `annotations` = ?, `expunged` = ? \
                 WHERE `mailbox_id` = ? AND `uid` = ?",
                rusqlite::params![
                    up.message_id,
                    last_chunk_id,
                    up.modseq as i64,
                    up.last_updated,
                    up.flags,
                    up.internaldate,
                    up.guid,
                    up.size,
                    up.annotations,
                    up.expunged,
                    up.mailbox_id,
                    up.uid,
                ],
            )
            .map_err(conflict)?;

        if 0 != updated {
            return Ok(());
        }

        self.cxn
            .execute(
                "INSERT INTO `mailbox_message` (\
                 `mailbox_id`, `message_id`, `last_chunk_id`, `uid`, \
                 `modseq`, `last_updated`, `flags`, `internaldate`, \
                 `guid`, `size`, `annotations`, `expunged`) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    up.mailbox_id,
                    up.message_id,
                    last_chunk_id,
                    up.uid,
                    up.modseq as i64,
                    up.last_updated,
                    up.flags,
                    up.internaldate,
                    up.guid,
                    up.size,
                    up.annotations,
                    up.expunged,
                ],
            )
            .map_err(conflict)?;
        Ok(())
    }

    /// Marks one record expunged (EXPUNGE). Unknown uids are a no-op.
    pub fn expunge_mailbox_message(
        &mut self,
        mailbox_id: MailboxId,
        uid: u32,
        expunged: UnixTimestamp,
        last_chunk_id: ChunkId,
    ) -> Result<(), Error> {
        self.cxn.execute(
            "UPDATE `mailbox_message` SET `expunged` = ?, \
             `last_chunk_id` = ? \
             WHERE `mailbox_id` = ? AND `uid` = ?",
            (expunged, last_chunk_id, mailbox_id, uid),
        )?;
        Ok(())
    }

    pub fn mailbox_messages(
        &mut self,
        chunk_id: Option<ChunkId>,
    ) -> Result<Vec<MailboxMessage>, Error> {
        let rows = match chunk_id {
            None => self
                .cxn
                .prepare(&format!(
                    "{} ORDER BY `mailbox_message`.`id`",
                    Self::MAILBOX_MESSAGE_SELECT
                ))?
                .query_map((), from_row)?
                .collect::<Result<Vec<MailboxMessage>, _>>(),
            Some(chunk_id) => self
                .cxn
                .prepare(&format!(
                    "{} WHERE `mailbox_message`.`last_chunk_id` = ? \
                     ORDER BY `mailbox_message`.`id`",
                    Self::MAILBOX_MESSAGE_SELECT
                ))?
                .query_map((chunk_id,), from_row)?
                .collect::<Result<Vec<MailboxMessage>, _>>(),
        };
        rows.map_err(Into::into)
    }

    pub fn mailbox_messages_of(
        &mut self,
        mailbox_id: MailboxId,
    ) -> Result<Vec<MailboxMessage>, Error> {
        self.cxn
            .prepare(&format!(
                "{} WHERE `mailbox_message`.`mailbox_id` = ? \
                 ORDER BY `mailbox_message`.`id`",
                Self::MAILBOX_MESSAGE_SELECT
            ))?
            .query_map((mailbox_id,), from_row)?
            .collect::<Result<Vec<MailboxMessage>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------
    // Messages

    pub fn message_id_by_guid(
        &mut self,
        guid: &Guid,
    ) -> Result<Option<MessageId>, Error> {
        self.cxn
            .query_row(
                "SELECT `id` FROM `message` WHERE `guid` = ?",
                (guid,),
                from_single,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn insert_message(
        &mut self,
        guid: &Guid,
        partition: Option<&str>,
        chunk_id: ChunkId,
        offset: u64,
        length: u64,
    ) -> Result<MessageId, Error> {
        self.cxn
            .execute(
                "INSERT INTO `message` (\
                 `guid`, `partition`, `chunk_id`, `offset`, `length`) \
                 VALUES (?, ?, ?, ?, ?)",
                (guid, partition, chunk_id, offset as i64, length as i64),
            )
            .map_err(conflict)?;
        Ok(MessageId(self.cxn.last_insert_rowid()))
    }

    pub fn message_by_guid(
        &mut self,
        guid: &Guid,
    ) -> Result<Option<Message>, Error> {
        self.cxn
            .query_row(
                "SELECT * FROM `message` WHERE `guid` = ?",
                (guid,),
                from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn messages(
        &mut self,
        chunk_id: Option<ChunkId>,
    ) -> Result<Vec<Message>, Error> {
        let rows = match chunk_id {
            None => self
                .cxn
                .prepare("SELECT * FROM `message` ORDER BY `id`")?
                .query_map((), from_row)?
                .collect::<Result<Vec<Message>, _>>(),
            Some(chunk_id) => self
                .cxn
                .prepare(
                    "SELECT * FROM `message` WHERE `chunk_id` = ? \
                     ORDER BY `id`",
                )?
                .query_map((chunk_id,), from_row)?
                .collect::<Result<Vec<Message>, _>>(),
        };
        rows.map_err(Into::into)
    }
}

/// Maps unique/foreign key failures to the typed conflict error; anything
/// else is an index store failure in its own right.
fn conflict(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(f, _)
            if rusqlite::ErrorCode::ConstraintViolation == f.code =>
        {
            Error::UniqueConflict
        },
        e => Error::Sqlite(e),
    }
}

/// Savepoint names come from a fixed internal set; anything else is a
/// programming error, not an input validation problem.
fn savepoint(name: &str) -> &str {
    assert!(
        !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b'_' == b),
        "bad savepoint name: {:?}",
        name,
    );
    name
}
