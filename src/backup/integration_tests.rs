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

//! Whole-lifecycle tests over real file pairs: append, validate, corrupt,
//! abort, reindex, query.

use std::fs;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use tempfile::TempDir;

use super::queries::mailbox_to_dlist;
use super::reindex::reindex;
use super::session::Backup;
use crate::storage::types::UnixTimestamp;
use crate::support::{error::Error, gzuncat::Gzuncat, hash::Sha1};
use crate::sync::{
    dlist::{Dlist, Value},
    guid::Guid,
};

struct Fixture {
    _tmpdir: TempDir,
    data: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        crate::init_test_log();

        let tmpdir = TempDir::new().unwrap();
        let data = tmpdir.path().join("backup");
        Self {
            _tmpdir: tmpdir,
            data,
        }
    }

    fn open(&self) -> Result<Backup, Error> {
        Backup::open_paths(&self.data, None)
    }

    fn index(&self) -> PathBuf {
        super::paths::index_fname(&self.data)
    }

    fn data_bytes(&self) -> Vec<u8> {
        fs::read(&self.data).unwrap()
    }
}

fn ts(t: i64) -> UnixTimestamp {
    UnixTimestamp(t)
}

fn mailbox_dlist(uniqueid: &str, mboxname: &str, last_uid: u32) -> Dlist {
    let mut dl = Dlist::kvlist("MAILBOX");
    dl.set_atom("UNIQUEID", uniqueid)
        .set_atom("MBOXNAME", mboxname)
        .set_atom("MBOXTYPE", "default")
        .set_num32("LAST_UID", last_uid)
        .set_num64("HIGHESTMODSEQ", 4)
        .set_num32("UIDVALIDITY", 1570000000)
        .set_atom("PARTITION", "default")
        .set_atom("ACL", "fred lrswipkxtecdan")
        .set_num32("SYNC_CRC", 0x1234);
    dl
}

fn message_dlist(items: &[(Guid, &str, &[u8])]) -> Dlist {
    let mut dl = Dlist::list("MESSAGE");
    for &(ref guid, partition, payload) in items {
        let mut item = Dlist::anonymous_kvlist();
        item.set_atom("GUID", guid.encode())
            .set_atom("PARTITION", partition)
            .set_literal("DATA", payload.to_vec());
        dl.push(item);
    }
    dl
}

fn sha1_hex(data: &[u8]) -> String {
    let mut sha = Sha1::new().unwrap();
    sha.update(data).unwrap();
    sha.finish_hex().unwrap()
}

/// Decompresses the member starting at `offset` in the data file.
fn member_content(fixture: &Fixture, offset: u64) -> Vec<u8> {
    let mut gzuc =
        Gzuncat::new(fs::File::open(&fixture.data).unwrap()).unwrap();
    gzuc.member_start_from(offset).unwrap();

    let mut content = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let nread = gzuc.read_member(&mut buf).unwrap();
        if 0 == nread {
            break;
        }
        content.extend_from_slice(&buf[..nread]);
    }
    content
}

#[test]
fn test_s1_empty_round_trip() {
    let fixture = Fixture::new();

    let backup = fixture.open().unwrap();
    assert!(fixture.data.exists());
    assert_eq!(0, fs::metadata(&fixture.data).unwrap().len());
    assert!(fixture.index().exists());
    backup.close().unwrap();

    // Re-open: validation passes on the empty pair.
    let mut backup = fixture.open().unwrap();
    assert!(backup.get_chunks().unwrap().is_empty());
    assert_eq!(None, backup.get_latest_chunk().unwrap());
    backup.close().unwrap();
}

#[test]
fn test_s2_single_append() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();

    let chunks = backup.get_chunks().unwrap();
    assert_eq!(1, chunks.len());

    let mailbox = backup
        .get_mailbox_by_name("INBOX", false)
        .unwrap()
        .unwrap();
    assert_eq!("U1", mailbox.uniqueid);
    assert_eq!(chunks[0].id, mailbox.last_chunk_id);
    assert_eq!(
        Some(mailbox.id),
        backup.get_mailbox_id("U1").unwrap(),
    );

    // The recorded data hash matches a fresh decompression.
    let latest = backup.get_latest_chunk().unwrap().unwrap();
    let content = member_content(&fixture, latest.offset);
    assert_eq!(Some(content.len() as u64), latest.length);
    assert_eq!(Some(sha1_hex(&content)), latest.data_sha1);

    backup.close().unwrap();
}

#[test]
fn test_s3_two_chunks() {
    let fixture = Fixture::new();
    let guid = Guid::of_content(b"0123456789").unwrap();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(
            &message_dlist(&[(guid, "p", b"0123456789")]),
            ts(200),
        )
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    let chunks = backup.get_chunks().unwrap();
    assert_eq!(2, chunks.len());
    assert!(chunks[0].id < chunks[1].id);
    assert!(chunks[0].offset < chunks[1].offset);

    // The second chunk's file hash covers everything before it.
    let data = fixture.data_bytes();
    assert_eq!(
        sha1_hex(&data[..chunks[1].offset as usize]),
        chunks[1].file_sha1,
    );

    let message = backup.get_message(&guid).unwrap().unwrap();
    assert_eq!(chunks[1].id, message.chunk_id);
    assert_eq!(10, message.length);
    assert_eq!(
        Some(b"0123456789".to_vec()),
        backup.read_message(&guid).unwrap(),
    );

    backup.close().unwrap();
}

#[test]
fn test_s4_corruption_detected() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    // Flip one byte inside the first (only) gzip member.
    let len = fs::metadata(&fixture.data).unwrap().len();
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&fixture.data)
        .unwrap();
    file.seek(SeekFrom::Start(len / 2)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(len / 2)).unwrap();
    file.write_all(&byte).unwrap();
    drop(file);

    assert_matches!(Err(Error::Corrupt), fixture.open());
}

#[test]
fn test_s5_reindex_recovery() {
    let fixture = Fixture::new();
    let guid = Guid::of_content(b"message body\r\n").unwrap();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(
            &message_dlist(&[(guid, "default", b"message body\r\n")]),
            ts(100),
        )
        .unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 1), ts(101))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    let mailboxes_before = backup.get_mailboxes(None, true).unwrap();
    let messages_before = {
        let mut messages = Vec::new();
        backup
            .message_foreach::<()>(None, |m| {
                messages.push(m.clone());
                ControlFlow::Continue(())
            })
            .unwrap();
        messages
    };
    backup.close().unwrap();

    fs::remove_file(fixture.index()).unwrap();
    assert_matches!(Err(Error::ReindexRequired), fixture.open());

    reindex(&fixture.data).unwrap();

    let mut backup = fixture.open().unwrap();
    assert_eq!(
        mailboxes_before,
        backup.get_mailboxes(None, true).unwrap(),
    );
    let mut messages_after = Vec::new();
    backup
        .message_foreach::<()>(None, |m| {
            messages_after.push(m.clone());
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(messages_before, messages_after);

    assert_eq!(
        Some(b"message body\r\n".to_vec()),
        backup.read_message(&guid).unwrap(),
    );
    backup.close().unwrap();
}

#[test]
fn test_s6_duplicate_guid_is_noop() {
    let fixture = Fixture::new();
    let guid = Guid::of_content(b"same bytes").unwrap();

    for _ in 0..2 {
        let mut backup = fixture.open().unwrap();
        backup.append_start().unwrap();
        backup
            .append(&message_dlist(&[(guid, "p", b"same bytes")]), ts(50))
            .unwrap();
        backup.append_end().unwrap();
        backup.close().unwrap();
    }

    let mut backup = fixture.open().unwrap();
    let chunks = backup.get_chunks().unwrap();
    assert_eq!(2, chunks.len());

    // The index still points at the first copy...
    let message = backup.get_message(&guid).unwrap().unwrap();
    assert_eq!(chunks[0].id, message.chunk_id);

    // ...but the second chunk carries the bytes verbatim all the same.
    let second = member_content(&fixture, chunks[1].offset);
    assert!(second
        .windows(b"same bytes".len())
        .any(|w| b"same bytes" == w));

    backup.close().unwrap();
}

#[test]
fn test_s7_abort_with_prior_chunk() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let good_len = fs::metadata(&fixture.data).unwrap().len();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U2", "Archive", 0), ts(200))
        .unwrap();
    backup.append_abort().unwrap();
    backup.close().unwrap();

    // The dangling member's bytes are on disk but not indexed.
    assert!(fs::metadata(&fixture.data).unwrap().len() > good_len);
    assert_matches!(Err(Error::Corrupt), fixture.open());

    // Reindex stops at the dangling member, reporting where the good data
    // ends; truncating there and reindexing again restores consistency.
    let valid_to = match reindex(&fixture.data) {
        Err(Error::CorruptTail { valid_to }) => valid_to,
        unexpected => panic!("unexpected reindex result: {:?}", unexpected),
    };
    assert_eq!(good_len, valid_to);

    let file = fs::OpenOptions::new()
        .write(true)
        .open(&fixture.data)
        .unwrap();
    file.set_len(valid_to).unwrap();
    drop(file);

    reindex(&fixture.data).unwrap();

    let mut backup = fixture.open().unwrap();
    assert_eq!(1, backup.get_chunks().unwrap().len());
    assert!(backup
        .get_mailbox_by_name("INBOX", false)
        .unwrap()
        .is_some());
    assert!(backup
        .get_mailbox_by_name("Archive", false)
        .unwrap()
        .is_none());
    backup.close().unwrap();
}

#[test]
fn test_s7_abort_without_prior_chunk() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_abort().unwrap();
    backup.close().unwrap();

    assert!(fs::metadata(&fixture.data).unwrap().len() > 0);
    assert_matches!(Err(Error::ReindexRequired), fixture.open());
}

#[test]
fn test_open_close_is_noop() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 3), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let data_before = fixture.data_bytes();
    let mut backup = fixture.open().unwrap();
    let chunks_before = backup.get_chunks().unwrap();
    backup.close().unwrap();

    assert_eq!(data_before, fixture.data_bytes());
    let mut backup = fixture.open().unwrap();
    assert_eq!(chunks_before, backup.get_chunks().unwrap());
    backup.close().unwrap();
}

#[test]
fn test_reindex_is_observationally_idempotent() {
    let fixture = Fixture::new();
    let guid_a = Guid::of_content(b"first message").unwrap();
    let guid_b = Guid::of_content(b"second message").unwrap();

    // A history with a bit of everything: two chunks, mailbox records,
    // an expunge, a rename, and an unindexed verb.
    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(
            &message_dlist(&[
                (guid_a, "default", b"first message"),
                (guid_b, "default", b"second message"),
            ]),
            ts(100),
        )
        .unwrap();

    let mut mailbox = mailbox_dlist("U1", "INBOX", 2);
    let mut record1 = Dlist::anonymous_kvlist();
    record1
        .set_num32("UID", 1)
        .set_num64("MODSEQ", 4)
        .set_date("LAST_UPDATED", 99)
        .set_date("INTERNALDATE", 98)
        .set_atom("GUID", guid_a.encode())
        .set_num32("SIZE", 13)
        .set_value(
            "FLAGS",
            Value::List(vec![Dlist::flag("\\Seen"), Dlist::flag("keep")]),
        );
    let mut record2 = Dlist::anonymous_kvlist();
    record2
        .set_num32("UID", 2)
        .set_num64("MODSEQ", 5)
        .set_date("LAST_UPDATED", 99)
        .set_date("INTERNALDATE", 98)
        .set_atom("GUID", guid_b.encode())
        .set_num32("SIZE", 14);
    mailbox.set_value(
        "RECORD",
        Value::List(vec![record1, record2]),
    );
    backup.append(&mailbox, ts(101)).unwrap();

    let mut quota = Dlist::kvlist("QUOTA");
    quota.set_atom("ROOT", "user.fred").set_num32("LIMIT", 1024);
    backup.append(&quota, ts(102)).unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();

    let mut expunge = Dlist::kvlist("EXPUNGE");
    expunge
        .set_atom("MBOXNAME", "INBOX")
        .set_atom("UNIQUEID", "U1")
        .set_value("UID", Value::List(vec![Dlist::flag("2")]));
    backup.append(&expunge, ts(200)).unwrap();

    let mut rename = Dlist::kvlist("RENAME");
    rename
        .set_atom("OLDMBOXNAME", "INBOX")
        .set_atom("NEWMBOXNAME", "Archive")
        .set_num32("UIDVALIDITY", 1570000001);
    backup.append(&rename, ts(201)).unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    let chunks_before = backup.get_chunks().unwrap();
    let mailboxes_before = backup.get_mailboxes(None, true).unwrap();
    let records_before = backup.get_mailbox_messages(None).unwrap();
    backup.close().unwrap();

    reindex(&fixture.data).unwrap();

    // The old index is preserved alongside the new one.
    let mut old_index = fixture.index().into_os_string();
    old_index.push(".old");
    assert!(PathBuf::from(old_index).exists());

    let mut backup = fixture.open().unwrap();
    assert_eq!(chunks_before, backup.get_chunks().unwrap());
    assert_eq!(
        mailboxes_before,
        backup.get_mailboxes(None, true).unwrap(),
    );
    assert_eq!(
        records_before,
        backup.get_mailbox_messages(None).unwrap(),
    );

    // Spot-check the mutations surveyed the chunks: the rename landed and
    // the expunge marked uid 2.
    let mailbox = backup
        .get_mailbox_by_name("Archive", true)
        .unwrap()
        .unwrap();
    assert_eq!("U1", mailbox.uniqueid);
    assert_eq!(1570000001, mailbox.uidvalidity);
    let records = mailbox.records.unwrap();
    assert_eq!(2, records.len());
    assert_eq!(UnixTimestamp::ZERO, records[0].expunged);
    assert_eq!(ts(200), records[1].expunged);

    backup.close().unwrap();
}

#[test]
fn test_truncation_at_member_boundary_reindexes_cleanly() {
    let fixture = Fixture::new();

    for (uniqueid, name, t) in
        [("U1", "INBOX", 100), ("U2", "Archive", 200)]
    {
        let mut backup = fixture.open().unwrap();
        backup.append_start().unwrap();
        backup
            .append(&mailbox_dlist(uniqueid, name, 0), ts(t))
            .unwrap();
        backup.append_end().unwrap();
        backup.close().unwrap();
    }

    let mut backup = fixture.open().unwrap();
    let chunks = backup.get_chunks().unwrap();
    assert_eq!(2, chunks.len());
    let boundary = chunks[1].offset;
    backup.close().unwrap();

    // Truncate at the member boundary: the first chunk alone remains.
    let file = fs::OpenOptions::new()
        .write(true)
        .open(&fixture.data)
        .unwrap();
    file.set_len(boundary).unwrap();
    drop(file);

    reindex(&fixture.data).unwrap();

    let mut backup = fixture.open().unwrap();
    assert_eq!(1, backup.get_chunks().unwrap().len());
    assert!(backup
        .get_mailbox_by_name("INBOX", false)
        .unwrap()
        .is_some());
    assert!(backup
        .get_mailbox_by_name("Archive", false)
        .unwrap()
        .is_none());
    backup.close().unwrap();
}

#[test]
fn test_empty_chunk_survives_reindex() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    reindex(&fixture.data).unwrap();

    let mut backup = fixture.open().unwrap();
    let chunks = backup.get_chunks().unwrap();
    assert_eq!(1, chunks.len());
    assert!(chunks[0].length.unwrap() > 0);
    backup.close().unwrap();
}

#[test]
fn test_noflush_append_round_trip() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start_noflush().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    assert!(backup
        .get_mailbox_by_name("INBOX", false)
        .unwrap()
        .is_some());
    backup.close().unwrap();
}

#[test]
fn test_mailbox_to_dlist_round_trip() {
    let fixture = Fixture::new();
    let guid = Guid::of_content(b"body").unwrap();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&message_dlist(&[(guid, "default", b"body")]), ts(100))
        .unwrap();

    let mut mailbox = mailbox_dlist("U1", "INBOX", 1);
    let mut record = Dlist::anonymous_kvlist();
    record
        .set_num32("UID", 1)
        .set_num64("MODSEQ", 7)
        .set_date("LAST_UPDATED", 99)
        .set_date("INTERNALDATE", 98)
        .set_atom("GUID", guid.encode())
        .set_num32("SIZE", 4)
        .set_value(
            "FLAGS",
            Value::List(vec![
                Dlist::flag("\\Seen"),
                Dlist::flag("\\Expunged"),
            ]),
        );
    mailbox.set_value("RECORD", Value::List(vec![record]));
    backup.append(&mailbox, ts(101)).unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    let row = backup
        .get_mailbox_by_name("INBOX", true)
        .unwrap()
        .unwrap();
    let dl = mailbox_to_dlist(&row).unwrap();

    assert_eq!(Some("MAILBOX"), dl.name());
    assert_eq!(Some("U1"), dl.atom("UNIQUEID"));
    assert_eq!(Some(1), dl.num32("LAST_UID"));

    let records = dl.get("RECORD").unwrap().children();
    assert_eq!(1, records.len());
    assert_eq!(Some(1), records[0].num32("UID"));
    assert_eq!(Some(guid.encode().as_str()), records[0].atom("GUID"));

    // The expungement marker is reconstituted into FLAGS.
    let flags = records[0].get("FLAGS").unwrap().children();
    assert!(flags
        .iter()
        .any(|f| Value::Atom("\\Expunged".to_owned()) == *f.value()));
    assert!(flags
        .iter()
        .any(|f| Value::Atom("\\Seen".to_owned()) == *f.value()));

    backup.close().unwrap();
}

#[test]
fn test_mailbox_foreach_abort() {
    let fixture = Fixture::new();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup
        .append(&mailbox_dlist("U2", "Archive", 0), ts(101))
        .unwrap();
    backup.append_end().unwrap();

    let mut seen = Vec::new();
    let aborted = backup
        .mailbox_foreach(None, false, |mailbox| {
            seen.push(mailbox.uniqueid.clone());
            ControlFlow::Break(42)
        })
        .unwrap();
    assert_eq!(Some(42), aborted);
    assert_eq!(vec!["U1".to_owned()], seen);

    seen.clear();
    let finished = backup
        .mailbox_foreach::<i32>(None, false, |mailbox| {
            seen.push(mailbox.uniqueid.clone());
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(None, finished);
    assert_eq!(vec!["U1".to_owned(), "U2".to_owned()], seen);

    backup.close().unwrap();
}

#[test]
fn test_chunk_filters() {
    let fixture = Fixture::new();
    let guid = Guid::of_content(b"x").unwrap();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    backup.close().unwrap();

    let mut backup = fixture.open().unwrap();
    backup.append_start().unwrap();
    backup
        .append(&message_dlist(&[(guid, "p", b"x")]), ts(200))
        .unwrap();
    backup
        .append(&mailbox_dlist("U2", "Archive", 0), ts(201))
        .unwrap();
    backup.append_end().unwrap();

    let chunks = backup.get_chunks().unwrap();
    assert_eq!(2, chunks.len());

    let first = backup
        .get_mailboxes(Some(chunks[0].id), false)
        .unwrap();
    assert_eq!(1, first.len());
    assert_eq!("U1", first[0].uniqueid);

    let second = backup
        .get_mailboxes(Some(chunks[1].id), false)
        .unwrap();
    assert_eq!(1, second.len());
    assert_eq!("U2", second[0].uniqueid);

    let mut count = 0;
    backup
        .message_foreach::<()>(Some(chunks[0].id), |_| {
            count += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(0, count);
    backup
        .message_foreach::<()>(Some(chunks[1].id), |_| {
            count += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(1, count);

    backup.close().unwrap();
}

#[test]
fn test_single_writer_blocks_second_session() {
    let fixture = Fixture::new();

    let backup = fixture.open().unwrap();

    let data = fixture.data.clone();
    let (opened_tx, opened_rx) = mpsc::channel();
    let second = std::thread::spawn(move || {
        let backup = Backup::open_paths(&data, None).unwrap();
        opened_tx.send(()).unwrap();
        backup.close().unwrap();
    });

    // The second session stays parked on the lock while ours is open.
    assert_matches!(
        Err(mpsc::RecvTimeoutError::Timeout),
        opened_rx.recv_timeout(Duration::from_millis(200)),
    );

    backup.close().unwrap();
    opened_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("second session never acquired the lock");
    second.join().unwrap();
}

#[test]
fn test_open_by_user_resolves_and_creates() {
    let fixture = Fixture::new();
    let config = crate::support::system_config::BackupConfig::new(
        fixture._tmpdir.path().join("root"),
    );

    let mut backup = Backup::open(&config, "fred").unwrap();
    backup.append_start().unwrap();
    backup
        .append(&mailbox_dlist("U1", "INBOX", 0), ts(100))
        .unwrap();
    backup.append_end().unwrap();
    let data_fname = backup.data_fname().to_owned();
    backup.close().unwrap();

    // Opening again hits the same files via the mapping.
    let mut backup = Backup::open(&config, "fred").unwrap();
    assert_eq!(data_fname, backup.data_fname());
    assert!(backup
        .get_mailbox_by_name("INBOX", false)
        .unwrap()
        .is_some());
    backup.close().unwrap();
}
