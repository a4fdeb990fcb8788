// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::wire;
use crate::ComponentKind;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;
use strum_macros::IntoStaticStr;

/// Terminal outcome of one upgrade item.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum UpgradeOutcome {
    Done,
    Failed,
    NotPerformed,
}

impl UpgradeOutcome {
    /// Combine the outcomes of a batch: any failure fails the batch, and a
    /// batch with nothing done was not performed.
    pub fn aggregate<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = Self::NotPerformed;
        for outcome in outcomes {
            match outcome {
                Self::Failed => return Self::Failed,
                Self::Done => result = Self::Done,
                Self::NotPerformed => (),
            }
        }
        result
    }
}

/// One installed (or attempted) image. Immutable once written.
///
/// The serialized field names match the keys the firmware tooling on the
/// switch has always used for its result log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRecord {
    #[serde(rename = "FwType")]
    pub kind: ComponentKind,
    #[serde(rename = "FwPath")]
    pub image_path: String,
    /// The CPLD subtype or flash mode this image was installed with.
    #[serde(rename = "FwExtra", default)]
    pub extra: Option<String>,
    #[serde(rename = "Result")]
    pub outcome: UpgradeOutcome,
}

impl UpgradeRecord {
    pub fn new(
        kind: ComponentKind,
        image_path: impl Into<String>,
        extra: Option<String>,
        outcome: UpgradeOutcome,
    ) -> Self {
        Self { kind, image_path: image_path.into(), extra, outcome }
    }
}

/// The records written by a single invocation, in item order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeBatch(pub Vec<UpgradeRecord>);

impl UpgradeBatch {
    pub fn records(&self) -> &[UpgradeRecord] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn kind(&self) -> Option<ComponentKind> {
        self.0.first().map(|r| r.kind)
    }

    pub fn outcome(&self) -> UpgradeOutcome {
        UpgradeOutcome::aggregate(self.0.iter().map(|r| r.outcome))
    }

    /// The `:`-joined `(kind, paths, extras, results)` tuple used to hand a
    /// batch back to callers that only speak strings.
    ///
    /// Returns `None` for an empty batch.
    pub fn to_wire(&self) -> Option<WireBatch> {
        let kind = self.kind()?;
        Some(WireBatch {
            kind: kind.to_string().to_ascii_uppercase(),
            paths: wire::join_list(
                self.0.iter().map(|r| r.image_path.as_str()),
            ),
            extras: wire::join_list(
                self.0.iter().map(|r| r.extra.as_deref().unwrap_or("None")),
            ),
            results: wire::join_list(self.0.iter().map(|r| {
                let s: &'static str = r.outcome.into();
                s
            })),
        })
    }
}

impl FromIterator<UpgradeRecord> for UpgradeBatch {
    fn from_iter<I: IntoIterator<Item = UpgradeRecord>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for UpgradeBatch {
    type Item = UpgradeRecord;
    type IntoIter = std::vec::IntoIter<UpgradeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// String form of an [`UpgradeBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBatch {
    pub kind: String,
    pub paths: String,
    pub extras: String,
    pub results: String,
}
