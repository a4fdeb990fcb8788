// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistent record of upgrade outcomes, and reconciliation of it
//! against the controller's own upgrade history.
//!
//! The local log is JSON lines, one [`UpgradeRecord`] per line, each tagged
//! with the id of the invocation ("batch") that wrote it and that batch's
//! overall outcome. It is only ever appended to; rotation is left to the
//! system's log tooling.

use crate::error::ResultLogError;
use crate::sku::CpldTag;
use crate::sku::SkuConfig;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::UpgradeBatch;
use fwmgr_messages::UpgradeOutcome;
use fwmgr_messages::UpgradeRecord;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use slog::warn;
use slog::Logger;
use std::io;
use std::str::FromStr;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    batch: Uuid,
    timestamp: String,
    /// Absent in lines written before batch outcomes were recorded.
    #[serde(
        rename = "BatchResult",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    batch_outcome: Option<UpgradeOutcome>,
    #[serde(flatten)]
    record: UpgradeRecord,
}

/// The most recent batch and its overall outcome.
///
/// The outcome can be `FAILED` while every record is `DONE`: a CPLD batch
/// whose items installed but whose refresh failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastResult {
    pub records: UpgradeBatch,
    pub outcome: UpgradeOutcome,
}

impl LastResult {
    pub fn from_records(records: UpgradeBatch) -> Self {
        let outcome = records.outcome();
        Self { records, outcome }
    }
}

impl Default for LastResult {
    fn default() -> Self {
        Self::from_records(UpgradeBatch::default())
    }
}

#[derive(Debug, Clone)]
pub struct ResultLog {
    path: Utf8PathBuf,
    log: Logger,
}

impl ResultLog {
    pub fn new(path: impl Into<Utf8PathBuf>, log: &Logger) -> Self {
        Self { path: path.into(), log: log.clone() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn io_err(&self, err: io::Error) -> ResultLogError {
        ResultLogError::Io { path: self.path.clone(), err }
    }

    pub async fn append(
        &self,
        batch: Uuid,
        record: &UpgradeRecord,
        batch_outcome: UpgradeOutcome,
    ) -> Result<(), ResultLogError> {
        let entry = LogEntry {
            batch,
            timestamp: humantime::format_rfc3339_seconds(SystemTime::now())
                .to_string(),
            batch_outcome: Some(batch_outcome),
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.io_err(err))?;
        file.write_all(line.as_bytes()).await.map_err(|err| self.io_err(err))?;
        file.flush().await.map_err(|err| self.io_err(err))
    }

    /// Records of the most recent batch, in the order they were written, and
    /// the batch's outcome. A log that does not exist yet is empty.
    pub async fn last_batch(&self) -> Result<LastResult, ResultLogError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(LastResult::default());
            }
            Err(err) => return Err(self.io_err(err)),
        };

        let mut entries = Vec::new();
        for (i, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    self.log, "skipping unparseable result log line";
                    "path" => %self.path,
                    "line" => i + 1,
                    "err" => %err,
                ),
            }
        }

        let Some((last, batch_outcome)) =
            entries.last().map(|e| (e.batch, e.batch_outcome))
        else {
            return Ok(LastResult::default());
        };
        let records: UpgradeBatch = entries
            .into_iter()
            .filter(|e| e.batch == last)
            .map(|e| e.record)
            .collect();
        Ok(match batch_outcome {
            Some(outcome) => LastResult { records, outcome },
            None => LastResult::from_records(records),
        })
    }
}

/// Map a controller-reported result string onto an outcome.
fn controller_outcome(raw: &str) -> UpgradeOutcome {
    let raw = raw.trim().to_ascii_lowercase();
    if raw == "success" || raw == "done" {
        UpgradeOutcome::Done
    } else if raw.contains("fail") {
        UpgradeOutcome::Failed
    } else {
        UpgradeOutcome::NotPerformed
    }
}

/// Records of `kind` from the controller's upgrade log, oldest first.
///
/// Two shapes are understood: an array of records, and the older object
/// keyed by `"<KIND> upgrade log"` whose values are lists of
/// `"<tag>: <result>, firmware: <path>, time: <when>"` strings. Entries that
/// fit neither are ignored.
pub fn parse_controller_log(
    payload: &Value,
    kind: ComponentKind,
    sku: &SkuConfig,
) -> Vec<UpgradeRecord> {
    let kind_name: &'static str = kind.into();
    match payload {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|e| {
                serde_json::from_value::<UpgradeRecord>(e.clone()).ok()
            })
            .filter(|r| r.kind == kind)
            .collect(),
        Value::Object(sections) => sections
            .iter()
            .filter(|(key, _)| {
                key.split_whitespace()
                    .next()
                    .map(|k| k.eq_ignore_ascii_case(kind_name))
                    .unwrap_or(false)
            })
            .filter_map(|(_, lines)| lines.as_array())
            .flatten()
            .filter_map(Value::as_str)
            .filter_map(|line| parse_legacy_line(line, kind, sku))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_legacy_line(
    line: &str,
    kind: ComponentKind,
    sku: &SkuConfig,
) -> Option<UpgradeRecord> {
    let mut fields = line.split(',');
    let (tag, result) = fields.next()?.split_once(':')?;
    let path = fields.next()?.trim().strip_prefix("firmware:")?.trim();
    let tag = tag.trim();

    let extra = if kind == ComponentKind::Cpld {
        CpldTag::from_str(tag)
            .ok()
            .and_then(|tag| sku.subtype_for_tag(tag))
            .map(|subtype| subtype.to_string())
            .unwrap_or_else(|| tag.to_string())
    } else {
        tag.to_string()
    };

    Some(UpgradeRecord::new(
        kind,
        path,
        Some(extra),
        controller_outcome(result),
    ))
}

fn same_file_name(a: &str, b: &str) -> bool {
    let name = |p: &str| p.rsplit('/').next().unwrap_or(p).to_string();
    name(a).eq_ignore_ascii_case(&name(b))
}

/// Pick the result to report for the last batch given our local record of
/// it and the controller's history (oldest first).
///
/// If the controller's most recent entries correspond item for item (by
/// image file name, case-insensitively) to the local batch, they are the
/// result, and a local batch failure still fails it. Otherwise only the
/// single most recent controller entry is reported. With no controller
/// history the local batch stands.
pub fn reconcile(
    local: &LastResult,
    controller: &[UpgradeRecord],
) -> LastResult {
    let Some(latest) = controller.last() else {
        return local.clone();
    };

    let n = local.records.len();
    if n > 0 && controller.len() >= n {
        let tail = &controller[controller.len() - n..];
        let matches = tail
            .iter()
            .zip(local.records.records())
            .all(|(c, l)| same_file_name(&c.image_path, &l.image_path));
        if matches {
            let records = UpgradeBatch(tail.to_vec());
            let outcome =
                UpgradeOutcome::aggregate([local.outcome, records.outcome()]);
            return LastResult { records, outcome };
        }
    }

    LastResult::from_records(UpgradeBatch(vec![latest.clone()]))
}
