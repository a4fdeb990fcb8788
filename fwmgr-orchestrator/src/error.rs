// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::CpldSubtype;
use slog_error_chain::SlogInlineError;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub use crate::credential::CredentialError;
pub use crate::readiness::ReadinessError;
pub use crate::sku::ConfigLoadError;

/// Failures of the controller transport. A timeout is reported like any
/// other failure; callers treat it as a non-success response.
#[derive(Debug, Error, SlogInlineError)]
pub enum TransportError {
    #[error("controller credential unavailable")]
    CredentialMissing,
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("HTTP request to {uri} failed")]
    Http {
        uri: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("controller returned HTTP {status} for {uri}")]
    HttpStatus { uri: String, status: u16 },
    #[error("failed to decode controller response from {uri}")]
    Decode {
        uri: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        err: io::Error,
    },
    #[error("cannot stage {0}: path has no file name")]
    InvalidImagePath(Utf8PathBuf),
    #[error("failed to stage {path} (gave up after {attempts} attempts)")]
    StageExhausted { path: Utf8PathBuf, attempts: usize },
    #[error("command not supported by this controller: {0}")]
    Unsupported(String),
}

/// Rejections raised before any I/O is performed. No result is recorded for
/// these.
#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum RequestError {
    #[error("controller credential not found")]
    CredentialMissing,
    #[error("invalid flash mode {0:?}")]
    InvalidMode(String),
    #[error(
        "{paths} image path(s) given for {subtypes} subtype(s); \
         counts must match"
    )]
    InvalidSubtype { paths: usize, subtypes: usize },
    #[error("no component named to refresh")]
    NothingToRefresh,
    #[error("no image path given")]
    NoImage,
    #[error("{kind} takes exactly one image, got {count}")]
    TooManyImages { kind: ComponentKind, count: usize },
    #[error("{operation} is not supported for {kind}")]
    UnsupportedKind { operation: &'static str, kind: ComponentKind },
}

/// Failure of one step of an upgrade. These never escape the orchestrator;
/// they are logged and folded into a `FAILED` record.
#[derive(Debug, Error, SlogInlineError)]
pub enum StepError {
    #[error("image not found: {0}")]
    ImageNotFound(Utf8PathBuf),
    #[error("failed to upload {path} to the controller")]
    UploadFailed {
        path: Utf8PathBuf,
        #[source]
        err: TransportError,
    },
    #[error("controller rejected {command}: {detail}")]
    ControllerRejected { command: &'static str, detail: String },
    #[error("no response from controller for {command}")]
    ControllerUnreachable {
        command: &'static str,
        #[source]
        err: TransportError,
    },
    #[error("{command} failed (gave up after {attempts} attempts)")]
    AttemptsExhausted { command: &'static str, attempts: usize },
    #[error("unexpected payload for {command}: {detail}")]
    UnexpectedPayload { command: &'static str, detail: String },
    #[error("{tool} exited with status {status}")]
    DeviceProgramFailed { tool: String, status: i32 },
    #[error("failed to run {tool}")]
    DeviceProgramSpawn {
        tool: String,
        #[source]
        err: io::Error,
    },
    #[error("re-enumeration step {step:?} failed: {detail}")]
    RescanFailed { step: &'static str, detail: String },
    #[error("no controller type tag for subtype {0}")]
    UnmappedSubtype(CpldSubtype),
    #[error("refresh required for {subtypes} but no refresh image supplied")]
    MissingRefreshImage { subtypes: String },
}

/// Error type for the read-only and boot-slot operations, which surface
/// their failure directly rather than as a record.
#[derive(Debug, Error, SlogInlineError)]
pub enum QueryError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Step(#[from] StepError),
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ResultLogError {
    #[error("failed to access result log {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to serialize result record")]
    Serialize(#[from] serde_json::Error),
}
