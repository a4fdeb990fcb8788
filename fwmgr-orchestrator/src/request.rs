// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::RequestError;
use crate::slot;
use camino::Utf8PathBuf;
use fwmgr_messages::wire::split_list;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::CpldSubtype;
use fwmgr_messages::FlashMode;
use fwmgr_messages::FlashSlot;
use fwmgr_messages::UpgradeBatch;
use fwmgr_messages::UpgradeOutcome;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpldItem {
    pub image: Utf8PathBuf,
    pub subtype: CpldSubtype,
}

/// A validated upgrade request. Constructing one performs every check that
/// must reject the request before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeRequest {
    Bmc { image: Utf8PathBuf, mode: FlashMode },
    Bios { image: Utf8PathBuf, slot: FlashSlot },
    Cpld { items: Vec<CpldItem>, refresh_image: Option<Utf8PathBuf> },
    Fpga { image: Utf8PathBuf },
}

impl UpgradeRequest {
    /// Build a request from its string form: `paths` is a `:`-joined list
    /// of images and `extra` is the flash mode (BMC, BIOS) or the
    /// `:`-joined subtype list (CPLD).
    ///
    /// A CPLD item whose subtype is `REFRESH_CPLD` is taken as the batch's
    /// refresh image rather than an image to install.
    pub fn parse(
        kind: ComponentKind,
        paths: &str,
        extra: Option<&str>,
    ) -> Result<Self, RequestError> {
        let images = split_list(paths);
        if images.is_empty() {
            return Err(RequestError::NoImage);
        }

        match kind {
            ComponentKind::Bmc => {
                let image = single_image(kind, images)?;
                let mode = slot::parse_mode(extra.unwrap_or(""))?;
                Ok(Self::Bmc { image, mode })
            }
            ComponentKind::Bios => {
                let image = single_image(kind, images)?;
                let slot = match extra.map(slot::parse_mode).transpose()? {
                    None => FlashSlot::Master,
                    Some(mode) => mode.fixed_slot().ok_or_else(|| {
                        RequestError::InvalidMode(mode.to_string())
                    })?,
                };
                Ok(Self::Bios { image, slot })
            }
            ComponentKind::Cpld => {
                let subtypes = extra.map(split_list).unwrap_or_default();
                if subtypes.len() != images.len() {
                    return Err(RequestError::InvalidSubtype {
                        paths: images.len(),
                        subtypes: subtypes.len(),
                    });
                }

                let mut items = Vec::with_capacity(images.len());
                let mut refresh_image = None;
                for (image, subtype) in images.into_iter().zip(subtypes) {
                    let subtype = CpldSubtype::new(&subtype);
                    if subtype.is_refresh_image() {
                        refresh_image = Some(Utf8PathBuf::from(image));
                    } else {
                        items.push(CpldItem { image: image.into(), subtype });
                    }
                }
                Ok(Self::Cpld { items, refresh_image })
            }
            ComponentKind::Fpga => {
                let image = single_image(kind, images)?;
                Ok(Self::Fpga { image })
            }
        }
    }

    /// Supply the CPLD refresh image out of band. Has no effect on other
    /// kinds; an image already given as a `REFRESH_CPLD` item is replaced.
    pub fn with_refresh_image(mut self, image: Utf8PathBuf) -> Self {
        if let Self::Cpld { refresh_image, .. } = &mut self {
            *refresh_image = Some(image);
        }
        self
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            Self::Bmc { .. } => ComponentKind::Bmc,
            Self::Bios { .. } => ComponentKind::Bios,
            Self::Cpld { .. } => ComponentKind::Cpld,
            Self::Fpga { .. } => ComponentKind::Fpga,
        }
    }
}

fn single_image(
    kind: ComponentKind,
    mut images: Vec<String>,
) -> Result<Utf8PathBuf, RequestError> {
    if images.len() != 1 {
        return Err(RequestError::TooManyImages { kind, count: images.len() });
    }
    Ok(Utf8PathBuf::from(images.remove(0)))
}

/// Result of one `upgrade` or `program` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    pub batch: Uuid,
    pub kind: ComponentKind,
    pub records: UpgradeBatch,
    /// Overall outcome. This can be `FAILED` while every record is `DONE`,
    /// when a batch-level step such as a CPLD refresh failed.
    pub outcome: UpgradeOutcome,
}

impl UpgradeReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == UpgradeOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmc_requires_valid_mode() {
        assert_eq!(
            UpgradeRequest::parse(
                ComponentKind::Bmc,
                "/fw/bmc.ima",
                Some("both")
            )
            .unwrap(),
            UpgradeRequest::Bmc {
                image: "/fw/bmc.ima".into(),
                mode: FlashMode::Both
            }
        );
        assert_eq!(
            UpgradeRequest::parse(ComponentKind::Bmc, "/fw/bmc.ima", None),
            Err(RequestError::InvalidMode(String::new()))
        );
        assert_eq!(
            UpgradeRequest::parse(ComponentKind::Bmc, "/fw/bmc.ima", Some("x")),
            Err(RequestError::InvalidMode("x".to_string()))
        );
    }

    #[test]
    fn bios_takes_a_single_fixed_slot() {
        assert_eq!(
            UpgradeRequest::parse(ComponentKind::Bios, "/fw/bios.bin", None)
                .unwrap(),
            UpgradeRequest::Bios {
                image: "/fw/bios.bin".into(),
                slot: FlashSlot::Master
            }
        );
        assert_eq!(
            UpgradeRequest::parse(
                ComponentKind::Bios,
                "/fw/bios.bin",
                Some("SLAVE")
            )
            .unwrap(),
            UpgradeRequest::Bios {
                image: "/fw/bios.bin".into(),
                slot: FlashSlot::Slave
            }
        );
        for mode in ["both", "pingpong"] {
            assert!(matches!(
                UpgradeRequest::parse(
                    ComponentKind::Bios,
                    "/fw/bios.bin",
                    Some(mode)
                ),
                Err(RequestError::InvalidMode(_))
            ));
        }
    }

    #[test]
    fn cpld_lists_must_match() {
        assert_eq!(
            UpgradeRequest::parse(
                ComponentKind::Cpld,
                "a.vme:b.vme",
                Some("CPU_CPLD")
            ),
            Err(RequestError::InvalidSubtype { paths: 2, subtypes: 1 })
        );
        assert_eq!(
            UpgradeRequest::parse(ComponentKind::Cpld, "a.vme", None),
            Err(RequestError::InvalidSubtype { paths: 1, subtypes: 0 })
        );
    }

    #[test]
    fn cpld_refresh_item_is_extracted() {
        let request = UpgradeRequest::parse(
            ComponentKind::Cpld,
            "base.vme:refresh.vme:fan.vme",
            Some("base_cpld:REFRESH_CPLD:FAN_CPLD"),
        )
        .unwrap();
        let UpgradeRequest::Cpld { items, refresh_image } = request else {
            panic!("expected a CPLD request");
        };
        assert_eq!(refresh_image, Some(Utf8PathBuf::from("refresh.vme")));
        assert_eq!(
            items,
            vec![
                CpldItem {
                    image: "base.vme".into(),
                    subtype: CpldSubtype::new("BASE_CPLD")
                },
                CpldItem {
                    image: "fan.vme".into(),
                    subtype: CpldSubtype::new("FAN_CPLD")
                },
            ]
        );
    }

    #[test]
    fn single_image_kinds_reject_lists() {
        assert_eq!(
            UpgradeRequest::parse(ComponentKind::Fpga, "a.bin:b.bin", None),
            Err(RequestError::TooManyImages {
                kind: ComponentKind::Fpga,
                count: 2
            })
        );
        assert_eq!(
            UpgradeRequest::parse(ComponentKind::Fpga, "", None),
            Err(RequestError::NoImage)
        );
    }
}
