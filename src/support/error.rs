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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Backup data does not match index checksums")]
    Corrupt,
    #[error("Backup data file corrupt past offset {valid_to}")]
    CorruptTail { valid_to: u64 },
    #[error("Backup index missing or empty; reindex required")]
    ReindexRequired,
    #[error("Malformed replication command line")]
    MalformedCommand,
    #[error("Command timestamp older than previous")]
    TimestampRegression,
    #[error("No backup data root configured")]
    NoBackupDataRoot,
    #[error("Unique key violated in backup index")]
    UniqueConflict,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
}
