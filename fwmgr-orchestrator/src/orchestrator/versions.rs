// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::Orchestrator;
use crate::error::QueryError;
use crate::host::HostPlatform;
use crate::sku::RegisterFormat;
use crate::sku::RegisterSource;
use crate::transport::ControllerCommand;
use crate::transport::ControllerTransport;
use serde_json::Value;
use slog::warn;
use std::collections::BTreeMap;
use std::io;

impl<T, H> Orchestrator<T, H>
where
    T: ControllerTransport,
    H: HostPlatform,
{
    /// Firmware versions keyed by component name: what the controller
    /// reports, plus the BIOS, ONIE, FPGA and CPLD versions this host can
    /// read itself.
    ///
    /// A controller failure fails the query. A local source that cannot be
    /// read is logged and left out.
    pub async fn firmware_versions(
        &self,
    ) -> Result<BTreeMap<String, String>, QueryError> {
        let mut versions = BTreeMap::new();

        let info = self.invoke_ok(&ControllerCommand::QueryInfo).await?;
        if let Some(version) = info.get("Version").and_then(Value::as_str) {
            versions.insert("BMC".to_string(), version.to_string());
        }

        let cpld = self.invoke_ok(&ControllerCommand::QueryVersions).await?;
        if let Value::Object(map) = cpld {
            for (name, version) in map {
                let version = match version {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                versions.insert(name, version);
            }
        }

        self.local_versions(&mut versions).await;
        Ok(versions)
    }

    async fn local_versions(&self, versions: &mut BTreeMap<String, String>) {
        let sources = &self.sku.versions;

        if sources.bios {
            let result = self
                .host
                .output("dmidecode", &["-s", "bios-version"])
                .await
                .and_then(|out| {
                    first_line(&out).ok_or_else(|| unexpected("empty output"))
                });
            match result {
                Ok(version) => {
                    versions.insert("BIOS".to_string(), version);
                }
                Err(err) => {
                    warn!(
                        self.log, "failed to read BIOS version";
                        "err" => %err,
                    );
                }
            }
        }

        if let Some(path) = &sources.onie_config {
            let result = self.host.read_attr(path).await.and_then(|conf| {
                onie_version(&conf)
                    .ok_or_else(|| unexpected("no onie_version entry"))
            });
            match result {
                Ok(version) => {
                    versions.insert("ONIE".to_string(), version);
                }
                Err(err) => {
                    warn!(
                        self.log, "failed to read ONIE version";
                        "path" => %path,
                        "err" => %err,
                    );
                }
            }
        }

        for source in &sources.registers {
            match self.read_register(source).await {
                Ok(version) => {
                    versions.insert(source.name.clone(), version);
                }
                Err(err) => {
                    warn!(
                        self.log, "failed to read version register";
                        "name" => &source.name,
                        "path" => %source.path,
                        "err" => %err,
                    );
                }
            }
        }
    }

    async fn read_register(
        &self,
        source: &RegisterSource,
    ) -> io::Result<String> {
        self.host.write_attr(&source.path, &source.register).await?;
        let raw = self.host.read_attr(&source.path).await?;
        decode_register(raw.trim(), source.format).ok_or_else(|| {
            unexpected(&format!("unexpected register value {raw:?}"))
        })
    }
}

fn unexpected(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.to_string())
}

fn first_line(out: &str) -> Option<String> {
    out.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string)
}

fn onie_version(conf: &str) -> Option<String> {
    conf.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "onie_version").then(|| value.trim().to_string())
    })
}

/// Render a `0x`-prefixed register value as `major.minor`.
fn decode_register(raw: &str, format: RegisterFormat) -> Option<String> {
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    if !digits.is_ascii() {
        return None;
    }
    let (major, minor) = match format {
        RegisterFormat::Nibbles if digits.len() >= 2 => {
            (&digits[..1], &digits[1..2])
        }
        RegisterFormat::HalfWords if digits.len() > 4 => digits.split_at(4),
        _ => return None,
    };
    let major = u32::from_str_radix(major, 16).ok()?;
    let minor = u32::from_str_radix(minor, 16).ok()?;
    Some(format!("{major}.{minor}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::HostAction;
    use crate::orchestrator::tests::Harness;
    use camino::Utf8Path;
    use serde_json::json;

    #[test]
    fn register_values_decode_per_format() {
        assert_eq!(
            decode_register("0x12", RegisterFormat::Nibbles).as_deref(),
            Some("1.2")
        );
        assert_eq!(
            decode_register("0x1a", RegisterFormat::Nibbles).as_deref(),
            Some("1.10")
        );
        assert_eq!(
            decode_register("0x0001000c", RegisterFormat::HalfWords)
                .as_deref(),
            Some("1.12")
        );
        assert_eq!(decode_register("0x1", RegisterFormat::Nibbles), None);
        assert_eq!(decode_register("12", RegisterFormat::Nibbles), None);
        assert_eq!(decode_register("0xzz", RegisterFormat::Nibbles), None);
    }

    #[test]
    fn onie_version_comes_from_machine_conf() {
        let conf =
            "onie_machine=as23\nonie_version=2019.05.01\nonie_arch=x86\n";
        assert_eq!(onie_version(conf).as_deref(), Some("2019.05.01"));
        assert_eq!(onie_version("onie_arch=x86\n"), None);
    }

    #[tokio::test]
    async fn local_versions_join_controller_versions() {
        let h = Harness::new("as23-128h");
        h.controller.set_payload("query-info", json!({"Version": "2.1"}));
        h.controller.set_payload("query-versions", json!({"CPLD_FAN": "1.0"}));
        h.host.set_output("dmidecode -s bios-version", "\n  5.13.1 \n");
        h.host.set_file(
            Utf8Path::new("/host/machine.conf"),
            "onie_version=2019.05.01\n",
        );
        let fpga = Utf8Path::new(
            "/sys/devices/platform/AS23128h.switchboard/FPGA/getreg",
        );
        h.host.set_register(fpga, "0x00", "0x00020003\n");
        let cpldb =
            Utf8Path::new("/sys/devices/platform/AS23128h.cpldb/getreg");
        h.host.set_register(cpldb, "0xA100", "0x21");
        h.host.set_register(cpldb, "0xA1E0", "0x13");

        let versions = h.orchestrator.firmware_versions().await.unwrap();
        assert_eq!(versions["BMC"], "2.1");
        assert_eq!(versions["CPLD_FAN"], "1.0");
        assert_eq!(versions["BIOS"], "5.13.1");
        assert_eq!(versions["ONIE"], "2019.05.01");
        assert_eq!(versions["FPGA"], "2.3");
        assert_eq!(versions["CPLD_B"], "2.1");
        assert_eq!(versions["CPLD_C"], "1.3");
        // Unreadable switchboard CPLDs are left out.
        assert!(!versions.contains_key("CPLD_1"));

        let actions = h.host.actions();
        let select = actions
            .iter()
            .position(|a| {
                *a == HostAction::Write(cpldb.to_owned(), "0xA1E0".to_string())
            })
            .unwrap();
        assert_eq!(actions[select + 1], HostAction::Read(cpldb.to_owned()));
    }

    #[tokio::test]
    async fn controller_failure_fails_the_query() {
        let h = Harness::new("as23-128h");
        h.controller.script_failures("query-versions", 1);
        assert!(h.orchestrator.firmware_versions().await.is_err());
    }
}
