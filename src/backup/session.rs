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

//! The backup session: the single-writer scope over one `{data, index}`
//! pair.
//!
//! Use cases:
//!  - the sync daemon appends to the data stream and updates the index
//!    (exclusive)
//!  - the daemon may create a new backup from scratch (exclusive)
//!  - reindex scans the data stream and rewrites the index (exclusive)
//!  - restore reads the data stream and index (shared)
//!
//! With only one shared case, we lock exclusively across the board. The
//! lock lives on the data file descriptor and is released when the
//! descriptor closes, so the two cannot get out of step.

use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::error;
use nix::fcntl::{flock, FlockArg};

use super::append::AppendState;
use super::paths::{self, BackupPaths};
use crate::storage::indexdb::IndexDb;
use crate::support::{
    error::Error,
    gzuncat::Gzuncat,
    hash::{self, Sha1},
    system_config::BackupConfig,
};

#[derive(Debug)]
pub struct Backup {
    data_fname: PathBuf,
    index_fname: PathBuf,
    pub(super) file: fs::File,
    pub(super) index: IndexDb,
    pub(super) append: Option<AppendState>,
    oldindex_fname: Option<PathBuf>,
}

enum OpenMode {
    Normal,
    Reindex,
}

impl Backup {
    /// Opens the backup belonging to `userid`, resolving (and if necessary
    /// creating) its file pair through the user→path mapping.
    pub fn open(
        config: &BackupConfig,
        userid: &str,
    ) -> Result<Self, Error> {
        let BackupPaths { data, index } =
            paths::resolve_user_paths(config, userid)?;
        Self::open_paths(&data, Some(&index))
    }

    /// Opens the backup stored at `data_fname`.
    ///
    /// If `index_fname` is `None`, it is derived from `data_fname`.
    pub fn open_paths(
        data_fname: &Path,
        index_fname: Option<&Path>,
    ) -> Result<Self, Error> {
        let index_fname = match index_fname {
            Some(path) => path.to_owned(),
            None => paths::index_fname(data_fname),
        };

        let mut backup =
            Self::open_internal(data_fname, &index_fname, OpenMode::Normal)?;
        match backup.validate_checksums() {
            Ok(()) => Ok(backup),
            Err(e) => {
                let _ = backup.close();
                Err(e)
            },
        }
    }

    /// Opens a session for reindexing: the existing index is moved aside
    /// to `<index>.old` and a fresh one created, all under the lock.
    ///
    /// No validation runs; the data file is about to be taken as the sole
    /// source of truth.
    pub(super) fn open_reindex(
        data_fname: &Path,
        index_fname: &Path,
    ) -> Result<Self, Error> {
        Self::open_internal(data_fname, index_fname, OpenMode::Reindex)
    }

    fn open_internal(
        data_fname: &Path,
        index_fname: &Path,
        mode: OpenMode,
    ) -> Result<Self, Error> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .create(true)
            .mode(0o600)
            .open(data_fname)
            .map_err(|e| {
                error!("IOERROR: open {}: {}", data_fname.display(), e);
                e
            })?;

        // The single-writer guarantee. Blocks until any other session on
        // this backup closes.
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| {
            error!("IOERROR: lock {}: {}", data_fname.display(), e);
            e
        })?;

        let mut oldindex_fname = None;
        match mode {
            OpenMode::Reindex => {
                // Move the old index out of the way and start a fresh,
                // empty one, while holding the lock.
                let old = {
                    let mut name = index_fname.as_os_str().to_owned();
                    name.push(".old");
                    PathBuf::from(name)
                };

                match fs::rename(index_fname, &old) {
                    Ok(()) => (),
                    Err(ref e)
                        if std::io::ErrorKind::NotFound == e.kind() => {},
                    Err(e) => {
                        error!(
                            "IOERROR: rename {} {}: {}",
                            index_fname.display(),
                            old.display(),
                            e,
                        );
                        return Err(e.into());
                    },
                }

                oldindex_fname = Some(old);
            },

            OpenMode::Normal => {
                // If there's data in the data file but the index file is
                // empty or doesn't exist, insist on a reindex before
                // opening.
                if file.metadata()?.len() > 0 {
                    let index_len = match fs::metadata(index_fname) {
                        Ok(md) => md.len(),
                        Err(ref e)
                            if std::io::ErrorKind::NotFound == e.kind() =>
                        {
                            0
                        },
                        Err(e) => {
                            error!(
                                "IOERROR: stat {}: {}",
                                index_fname.display(),
                                e,
                            );
                            return Err(e.into());
                        },
                    };

                    if 0 == index_len {
                        error!(
                            "reindex needed: {}",
                            index_fname.display(),
                        );
                        return Err(Error::ReindexRequired);
                    }
                }
            },
        }

        let index = IndexDb::open(index_fname)?;

        Ok(Self {
            data_fname: data_fname.to_owned(),
            index_fname: index_fname.to_owned(),
            file,
            index,
            append: None,
            oldindex_fname,
        })
    }

    /// End-to-end validation of the latest chunk against the data file.
    ///
    /// The file hash chain makes this transitive: a chunk's `file_sha1`
    /// covers every byte of every earlier chunk, so checking only the
    /// latest chunk still pins the whole file.
    fn validate_checksums(&mut self) -> Result<(), Error> {
        let data_len = self.file.metadata()?.len();

        let Some(chunk) = self.index.latest_chunk()? else {
            return if 0 == data_len {
                Ok(())
            } else {
                Err(Error::ReindexRequired)
            };
        };

        // A chunk left unterminated by a crashed append fails closed.
        let (length, data_sha1) = match (chunk.length, chunk.data_sha1) {
            (Some(length), Some(data_sha1)) => (length, data_sha1),
            _ => {
                error!(
                    "{}: chunk {} was never finalized",
                    self.data_fname.display(),
                    chunk.id.0,
                );
                return Err(Error::Corrupt);
            },
        };

        let file_sha1 =
            hash::sha1_file_prefix(&mut self.file, chunk.offset)?;
        if file_sha1 != chunk.file_sha1 {
            error!(
                "{}: file checksum mismatch: {} on disk, {} in index",
                self.data_fname.display(),
                file_sha1,
                chunk.file_sha1,
            );
            return Err(Error::Corrupt);
        }

        let mut gzuc = Gzuncat::new(self.file.try_clone()?)?;
        gzuc.member_start_from(chunk.offset)?;

        let mut sha = Sha1::new()?;
        let mut len: u64 = 0;
        let mut buf = [0u8; 8192];
        loop {
            let nread = gzuc.read_member(&mut buf)?;
            if 0 == nread {
                break;
            }
            sha.update(&buf[..nread])?;
            len += nread as u64;
        }
        let next_offset = gzuc.member_end()?;

        if len != length {
            error!(
                "{}: data length mismatch: {} on disk, {} in index",
                self.data_fname.display(),
                len,
                length,
            );
            return Err(Error::Corrupt);
        }

        let disk_sha1 = sha.finish_hex()?;
        if disk_sha1 != data_sha1 {
            error!(
                "{}: data checksum mismatch: {} on disk, {} in index",
                self.data_fname.display(),
                disk_sha1,
                data_sha1,
            );
            return Err(Error::Corrupt);
        }

        // Bytes past the end of the latest indexed member are the leavings
        // of a crashed or aborted append.
        if next_offset != data_len {
            error!(
                "{}: {} bytes of unindexed data after offset {}",
                self.data_fname.display(),
                data_len - next_offset,
                next_offset,
            );
            return Err(Error::Corrupt);
        }

        Ok(())
    }

    /// Closes the session: ends any active append, closes the index, and
    /// releases the lock. The first failure wins, but every step runs.
    pub fn close(mut self) -> Result<(), Error> {
        let append_result = if self.append.is_some() {
            self.append_end()
        } else {
            Ok(())
        };

        let Self {
            index,
            index_fname,
            oldindex_fname,
            file,
            ..
        } = self;

        let index_result = index.close();
        if index_result.is_err() {
            if let Some(ref old) = oldindex_fname {
                // The fresh index could not be written out; put the
                // original back.
                if let Err(e) = fs::rename(old, &index_fname) {
                    error!(
                        "IOERROR: rename {} {}: {}",
                        old.display(),
                        index_fname.display(),
                        e,
                    );
                }
            }
        }

        // Dropping the descriptor releases the flock.
        drop(file);

        append_result.and(index_result)
    }

    pub fn data_fname(&self) -> &Path {
        &self.data_fname
    }

    pub fn index_fname(&self) -> &Path {
        &self.index_fname
    }
}
