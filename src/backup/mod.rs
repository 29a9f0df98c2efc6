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

//! Per-user backup storage for the replication protocol.
//!
//! Each user's backup is a pair of files: an append-only data log of gzip
//! members ("chunks") holding a linear history of replication commands,
//! and a structured index giving random access to the mailboxes, messages
//! and chunk boundaries inside it. The index is always reconstructible
//! from the data file alone (`reindex`), and every open validates the pair
//! end to end before handing out a session.

mod append;
pub(crate) mod model;
mod paths;
mod queries;
mod reindex;
mod session;

#[cfg(test)]
mod integration_tests;

pub use append::AppendMode;
pub use model::{Chunk, Mailbox, MailboxMessage, Message};
pub use paths::{index_fname, resolve_user_paths, BackupPaths};
pub use queries::mailbox_to_dlist;
pub use reindex::reindex;
pub use session::Backup;
