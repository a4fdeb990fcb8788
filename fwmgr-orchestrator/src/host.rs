// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local side effects on the host: running programming tools, reading and
//! poking sysfs attributes.

use async_trait::async_trait;
use camino::Utf8Path;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// Run `program` to completion and return its exit code. A process
    /// killed by a signal reports `-1`.
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<i32>;

    /// Run `program` to completion and return its standard output. A
    /// non-zero exit is an error.
    async fn output(&self, program: &str, args: &[&str]) -> io::Result<String>;

    /// Read a sysfs attribute (or any file).
    async fn read_attr(&self, path: &Utf8Path) -> io::Result<String>;

    /// Write `value` to a sysfs attribute (or any file).
    async fn write_attr(&self, path: &Utf8Path, value: &str) -> io::Result<()>;

    async fn sleep(&self, duration: Duration);
}

#[async_trait]
impl<T: HostPlatform + ?Sized> HostPlatform for Arc<T> {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<i32> {
        (**self).run(program, args).await
    }

    async fn output(&self, program: &str, args: &[&str]) -> io::Result<String> {
        (**self).output(program, args).await
    }

    async fn read_attr(&self, path: &Utf8Path) -> io::Result<String> {
        (**self).read_attr(path).await
    }

    async fn write_attr(&self, path: &Utf8Path, value: &str) -> io::Result<()> {
        (**self).write_attr(path, value).await
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await
    }
}

/// The real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

#[async_trait]
impl HostPlatform for SystemHost {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<i32> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn output(&self, program: &str, args: &[&str]) -> io::Result<String> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{program} exited with {}", output.status),
            ));
        }
        String::from_utf8(output.stdout)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    async fn read_attr(&self, path: &Utf8Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn write_attr(&self, path: &Utf8Path, value: &str) -> io::Result<()> {
        tokio::fs::write(path, value.as_bytes()).await
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[tokio::test]
    async fn system_host_reports_exit_codes() {
        let host = SystemHost;
        assert_eq!(host.run("sh", &["-c", "exit 0"]).await.unwrap(), 0);
        assert_eq!(host.run("sh", &["-c", "exit 3"]).await.unwrap(), 3);
        assert!(host.run("/nonexistent/fwmgr-tool", &[]).await.is_err());
    }

    #[tokio::test]
    async fn system_host_captures_output() {
        let host = SystemHost;
        assert_eq!(
            host.output("sh", &["-c", "echo 5.13"]).await.unwrap(),
            "5.13\n"
        );
        assert!(host.output("sh", &["-c", "echo x; exit 1"]).await.is_err());
    }

    #[tokio::test]
    async fn system_host_writes_attrs() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("setreg");
        SystemHost.write_attr(&path, "0xa10a 0").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0xa10a 0");
        assert_eq!(SystemHost.read_attr(&path).await.unwrap(), "0xa10a 0");
    }
}
