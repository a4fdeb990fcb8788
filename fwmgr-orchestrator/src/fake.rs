// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted stand-ins for the controller and host, for tests.

use crate::error::TransportError;
use crate::host::HostPlatform;
use crate::transport::ControllerCommand;
use crate::transport::ControllerResponse;
use crate::transport::ControllerTransport;
use crate::transport::StagedImage;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use fwmgr_messages::FlashSlot;
use serde_json::json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct ControllerState {
    staged: Vec<Utf8PathBuf>,
    invoked: Vec<ControllerCommand>,
    /// Remaining scripted rejections per command name.
    rejections: BTreeMap<&'static str, usize>,
    /// Remaining scripted timeouts per command name.
    timeouts: BTreeMap<&'static str, usize>,
    payloads: BTreeMap<&'static str, Value>,
    unstageable: BTreeSet<String>,
}

/// Records every call; answers success unless scripted otherwise.
#[derive(Debug, Default)]
pub(crate) struct FakeController {
    state: Mutex<ControllerState>,
}

impl FakeController {
    pub(crate) fn new() -> Self {
        let this = Self::default();
        this.set_running_slot(FlashSlot::Master);
        this
    }

    /// The next `count` invocations of `command` are rejected.
    pub(crate) fn script_failures(&self, command: &'static str, count: usize) {
        self.state.lock().unwrap().rejections.insert(command, count);
    }

    /// The next `count` invocations of `command` time out.
    pub(crate) fn script_timeouts(&self, command: &'static str, count: usize) {
        self.state.lock().unwrap().timeouts.insert(command, count);
    }

    pub(crate) fn set_payload(&self, command: &'static str, payload: Value) {
        self.state.lock().unwrap().payloads.insert(command, payload);
    }

    pub(crate) fn set_running_slot(&self, slot: FlashSlot) {
        self.set_payload("query-running-slot", json!({ "Flash": slot }));
    }

    /// Staging any image with this file name fails.
    pub(crate) fn fail_staging(&self, file_name: &str) {
        self.state.lock().unwrap().unstageable.insert(file_name.to_string());
    }

    pub(crate) fn staged(&self) -> Vec<Utf8PathBuf> {
        self.state.lock().unwrap().staged.clone()
    }

    pub(crate) fn invoked(&self) -> Vec<ControllerCommand> {
        self.state.lock().unwrap().invoked.clone()
    }

    pub(crate) fn invocations(&self, command: &str) -> usize {
        self.invoked().iter().filter(|c| c.name() == command).count()
    }
}

fn take_one(scripts: &mut BTreeMap<&'static str, usize>, name: &str) -> bool {
    match scripts.get_mut(name) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl ControllerTransport for FakeController {
    async fn stage(
        &self,
        local: &Utf8Path,
    ) -> Result<StagedImage, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.staged.push(local.to_owned());
        let file_name = local.file_name().unwrap_or_default();
        if state.unstageable.contains(file_name) {
            return Err(TransportError::StageExhausted {
                path: local.to_owned(),
                attempts: 3,
            });
        }
        Ok(StagedImage { remote_path: format!("/tmp/{file_name}") })
    }

    async fn invoke(
        &self,
        command: &ControllerCommand,
    ) -> Result<ControllerResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.invoked.push(command.clone());
        let name = command.name();
        if take_one(&mut state.timeouts, name) {
            return Err(TransportError::Timeout {
                what: name.to_string(),
                after: Duration::from_secs(60),
            });
        }
        if take_one(&mut state.rejections, name) {
            return Ok(ControllerResponse::rejected(json!({
                "status": "FAILED"
            })));
        }
        let payload = state.payloads.get(name).cloned().unwrap_or(Value::Null);
        Ok(ControllerResponse::ok(payload))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostAction {
    Run(String),
    Read(Utf8PathBuf),
    Write(Utf8PathBuf, String),
    Sleep(Duration),
}

#[derive(Debug, Default)]
struct HostState {
    actions: Vec<HostAction>,
    exit_codes: BTreeMap<String, i32>,
    outputs: BTreeMap<String, String>,
    files: BTreeMap<Utf8PathBuf, String>,
    /// Value of each (attribute, register) pair.
    registers: BTreeMap<(Utf8PathBuf, String), String>,
    /// Last value written to each attribute.
    written: BTreeMap<Utf8PathBuf, String>,
    unwritable: BTreeSet<Utf8PathBuf>,
}

/// Records every action; commands exit 0 and writes succeed unless scripted
/// otherwise. Capturing output and reading attributes fail unless scripted.
/// Sleeps return immediately.
#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    /// Every run whose command line starts with `prefix` exits with `code`.
    pub(crate) fn exit_with(&self, prefix: &str, code: i32) {
        self.state.lock().unwrap().exit_codes.insert(prefix.to_string(), code);
    }

    /// Every captured run whose command line starts with `prefix` prints
    /// `stdout`.
    pub(crate) fn set_output(&self, prefix: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(prefix.to_string(), stdout.to_string());
    }

    pub(crate) fn set_file(&self, path: &Utf8Path, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_owned(), contents.to_string());
    }

    /// Reading `path` after writing `register` to it returns `value`.
    pub(crate) fn set_register(
        &self,
        path: &Utf8Path,
        register: &str,
        value: &str,
    ) {
        self.state.lock().unwrap().registers.insert(
            (path.to_owned(), register.to_string()),
            value.to_string(),
        );
    }

    pub(crate) fn fail_write(&self, path: &Utf8Path) {
        self.state.lock().unwrap().unwritable.insert(path.to_owned());
    }

    pub(crate) fn actions(&self) -> Vec<HostAction> {
        self.state.lock().unwrap().actions.clone()
    }
}

#[async_trait]
impl HostPlatform for FakeHost {
    async fn run(&self, program: &str, args: &[&str]) -> io::Result<i32> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let mut state = self.state.lock().unwrap();
        state.actions.push(HostAction::Run(line.clone()));
        let code = state
            .exit_codes
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(code)
    }

    async fn output(&self, program: &str, args: &[&str]) -> io::Result<String> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let mut state = self.state.lock().unwrap();
        state.actions.push(HostAction::Run(line.clone()));
        state
            .outputs
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no scripted output")
            })
    }

    async fn read_attr(&self, path: &Utf8Path) -> io::Result<String> {
        let mut state = self.state.lock().unwrap();
        state.actions.push(HostAction::Read(path.to_owned()));
        let register = state
            .written
            .get(path)
            .and_then(|r| state.registers.get(&(path.to_owned(), r.clone())));
        register
            .or_else(|| state.files.get(path))
            .cloned()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no scripted contents")
            })
    }

    async fn write_attr(&self, path: &Utf8Path, value: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .actions
            .push(HostAction::Write(path.to_owned(), value.to_string()));
        if state.unwritable.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "scripted write failure",
            ));
        }
        state.written.insert(path.to_owned(), value.to_string());
        Ok(())
    }

    async fn sleep(&self, duration: Duration) {
        self.state.lock().unwrap().actions.push(HostAction::Sleep(duration));
    }
}

/// A directory of image files for a test.
pub(crate) struct Images {
    dir: Utf8TempDir,
}

impl Images {
    pub(crate) fn new() -> Self {
        Self { dir: Utf8TempDir::new().unwrap() }
    }

    /// Create an image file and return its path.
    pub(crate) fn create(&self, name: &str) -> Utf8PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"image").unwrap();
        path
    }

    /// Path of an image that does not exist.
    pub(crate) fn missing(&self, name: &str) -> Utf8PathBuf {
        self.dir.path().join(name)
    }

    pub(crate) fn dir(&self) -> &Utf8Path {
        self.dir.path()
    }
}
