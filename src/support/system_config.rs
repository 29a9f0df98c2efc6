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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration the backup store consumes.
///
/// How this gets populated (config file, daemon options) is the caller's
/// concern; the store only ever sees this struct.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BackupConfig {
    /// The directory under which per-user backup data files are created.
    ///
    /// Required for resolving users to paths; opening a backup by explicit
    /// paths works without it.
    #[serde(default)]
    pub data_root: Option<PathBuf>,

    /// The user→path mapping database.
    ///
    /// Defaults to `backups.db` under `data_root`.
    #[serde(default)]
    pub backups_db: Option<PathBuf>,
}

impl BackupConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: Some(data_root.into()),
            backups_db: None,
        }
    }
}
