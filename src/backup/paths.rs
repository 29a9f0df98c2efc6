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

//! Mapping users to their `{data, index}` file pair.
//!
//! The mapping lives in a small database of its own, created on demand. A
//! user without an entry gets a fresh data file at
//! `<root>/<2-char-hash>/<user>_XXXXXX`; the unique suffix comes from the
//! kernel's atomic unique-file creation, so two processes resolving the
//! same new user cannot collide, and the mapping insert is transactional.
//! If the insert nevertheless fails, the just-created file is unlinked.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, warn};
use rusqlite::OptionalExtension as _;

use crate::storage::db_migrations;
use crate::support::{
    error::Error, hash::Sha1, system_config::BackupConfig,
};

/// The resolved file pair for one user's backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupPaths {
    pub data: PathBuf,
    pub index: PathBuf,
}

/// The index file path for a data file path: the same name with `.index`
/// appended.
pub fn index_fname(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_owned();
    name.push(".index");
    PathBuf::from(name)
}

/// Resolves `userid` to its backup file pair, creating a data file and
/// recording it in the mapping on first use.
pub fn resolve_user_paths(
    config: &BackupConfig,
    userid: &str,
) -> Result<BackupPaths, Error> {
    let data_root =
        config.data_root.as_deref().ok_or(Error::NoBackupDataRoot)?;
    let db_path = match config.backups_db {
        Some(ref path) => path.clone(),
        None => data_root.join("backups.db"),
    };

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut db = BackupsDb::open(&db_path)?;

    if let Some(data) = db.fetch(userid)? {
        if data.as_os_str().is_empty() {
            warn!("Unexpectedly got empty backup path for user {}", userid);
            return Err(Error::Corrupt);
        }

        let index = index_fname(&data);
        return Ok(BackupPaths { data, index });
    }

    let data = make_backup_path(data_root, userid)?;
    if let Err(e) = db.create(userid, &data) {
        // The file won't be referenced by anything; don't leave it behind.
        error!(
            "IOERROR: recording backup path for {}: {}; \
             unlinking {}",
            userid,
            e,
            data.display(),
        );
        let _ = fs::remove_file(&data);
        return Err(e);
    }

    let index = index_fname(&data);
    Ok(BackupPaths { data, index })
}

/// Creates a new, unique, empty backup data file for `userid`.
///
/// On success the file is left in place; its continued existence is what
/// guarantees the name is never handed out again.
fn make_backup_path(
    data_root: &Path,
    userid: &str,
) -> Result<PathBuf, Error> {
    let mut sha = Sha1::new()?;
    sha.update(userid.as_bytes())?;
    let user_hash = &sha.finish_hex()?[..2];

    let dir = data_root.join(user_hash);
    fs::create_dir_all(&dir)?;

    let (_file, path) = tempfile::Builder::new()
        .prefix(&format!("{}_", userid))
        .rand_bytes(6)
        .tempfile_in(&dir)?
        .keep()
        .map_err(|e| Error::Io(e.error))?;

    Ok(path)
}

/// The `backups.db` user→path mapping.
struct BackupsDb {
    cxn: rusqlite::Connection,
}

static MIGRATIONS: &[&str] = &[include_str!("backupsdb.v1.sql")];

impl BackupsDb {
    fn open(path: &Path) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
        )?;

        cxn.busy_timeout(Duration::from_secs(10))?;
        db_migrations::apply_migrations(&mut cxn, "backups", MIGRATIONS)?;

        Ok(Self { cxn })
    }

    fn fetch(&mut self, userid: &str) -> Result<Option<PathBuf>, Error> {
        self.cxn
            .query_row(
                "SELECT `data_path` FROM `user_backup` WHERE `userid` = ?",
                (userid,),
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|opt| opt.map(PathBuf::from))
            .map_err(Into::into)
    }

    fn create(&mut self, userid: &str, data: &Path) -> Result<(), Error> {
        let data = data.to_str().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "backup path is not UTF-8",
            ))
        })?;

        let txn = self.cxn.transaction_with_behavior(
            rusqlite::TransactionBehavior::Immediate,
        )?;
        txn.execute(
            "INSERT INTO `user_backup` (`userid`, `data_path`) \
             VALUES (?, ?)",
            (userid, data),
        )?;
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_resolution_is_stable() {
        let tmpdir = TempDir::new().unwrap();
        let config = BackupConfig::new(tmpdir.path());

        let first = resolve_user_paths(&config, "fred").unwrap();
        assert!(first.data.exists());
        assert_eq!(
            format!("{}.index", first.data.display()),
            first.index.display().to_string(),
        );
        assert!(first
            .data
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("fred_"));

        // The same user resolves to the same pair forever after.
        let second = resolve_user_paths(&config, "fred").unwrap();
        assert_eq!(first, second);

        // A different user gets a different file.
        let other = resolve_user_paths(&config, "barney").unwrap();
        assert_ne!(first.data, other.data);
    }

    #[test]
    fn test_no_data_root() {
        let config = BackupConfig::default();
        assert_matches!(
            Err(Error::NoBackupDataRoot),
            resolve_user_paths(&config, "fred"),
        );
    }

    #[test]
    fn test_explicit_backups_db_location() {
        let tmpdir = TempDir::new().unwrap();
        let mut config = BackupConfig::new(tmpdir.path().join("data"));
        config.backups_db = Some(tmpdir.path().join("mapping.db"));

        resolve_user_paths(&config, "fred").unwrap();
        assert!(tmpdir.path().join("mapping.db").exists());
        assert!(!tmpdir.path().join("data").join("backups.db").exists());
    }
}
