// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusive lock serializing mutating operations on one chassis.

use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use nix::fcntl::flock;
use nix::fcntl::FlockArg;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

/// Held for as long as the value is alive; the kernel drops the lock when
/// the file is closed.
#[derive(Debug)]
pub(crate) struct OperationLock {
    _file: File,
}

impl OperationLock {
    /// Take the lock without waiting; fails if another process holds it.
    pub(crate) fn acquire(path: &Utf8Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open lock file {path}"))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).with_context(
            || format!("another firmware operation holds {path}"),
        )?;
        Ok(Self { _file: file })
    }
}
