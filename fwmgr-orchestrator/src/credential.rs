// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the management controller's password.
//!
//! On the switch the password is kept in a small file, obfuscated (not
//! encrypted) by adding a repeating key to each byte and base64-encoding the
//! result with the URL-safe alphabet.

use base64::Engine;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog_error_chain::SlogInlineError;
use std::io;
use thiserror::Error;

const OBFUSCATION_KEY: &[u8] = b"bmc";

#[derive(Debug, Error, SlogInlineError)]
pub enum CredentialError {
    #[error("failed to read password file {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("password file is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded password is not valid UTF-8")]
    NotUtf8,
}

/// Source of the controller password. Absence fails closed: callers must
/// refuse to proceed when `password()` returns `None`.
pub trait CredentialSource: Send + Sync {
    fn password(&self) -> Option<String>;
}

impl CredentialSource for Option<String> {
    fn password(&self) -> Option<String> {
        self.clone()
    }
}

/// The on-disk obfuscated password file.
#[derive(Debug, Clone)]
pub struct ObfuscatedPasswordFile {
    path: Utf8PathBuf,
}

impl ObfuscatedPasswordFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn read(&self) -> Result<String, CredentialError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|err| {
            CredentialError::Io { path: self.path.clone(), err }
        })?;
        decode(&contents)
    }
}

impl CredentialSource for ObfuscatedPasswordFile {
    fn password(&self) -> Option<String> {
        self.read().ok()
    }
}

pub fn decode(encoded: &str) -> Result<String, CredentialError> {
    let bytes = base64::engine::general_purpose::URL_SAFE
        .decode(encoded.trim())?;
    let plain = bytes
        .iter()
        .zip(OBFUSCATION_KEY.iter().cycle())
        .map(|(b, k)| b.wrapping_sub(*k))
        .collect::<Vec<_>>();
    String::from_utf8(plain).map_err(|_| CredentialError::NotUtf8)
}

pub fn encode(password: &str) -> String {
    let obfuscated = password
        .bytes()
        .zip(OBFUSCATION_KEY.iter().cycle())
        .map(|(b, k)| b.wrapping_add(*k))
        .collect::<Vec<_>>();
    base64::engine::general_purpose::URL_SAFE.encode(obfuscated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn known_vector() {
        assert_eq!(encode("abc"), "w8_G");
        assert_eq!(decode("w8_G").unwrap(), "abc");
        // Trailing newline as written by `echo`.
        assert_eq!(decode("w8_G\n").unwrap(), "abc");
    }

    #[test]
    fn decode_inverts_encode() {
        for pw in ["", "0penBmc", "a much longer password with spaces"] {
            assert_eq!(decode(&encode(pw)).unwrap(), pw);
        }
    }

    #[test]
    fn missing_or_corrupt_file_is_absent() {
        let dir = Utf8TempDir::new().unwrap();

        let missing = ObfuscatedPasswordFile::new(dir.path().join("bmcpwd"));
        assert!(missing.password().is_none());
        assert!(matches!(missing.read(), Err(CredentialError::Io { .. })));

        let corrupt_path = dir.path().join("corrupt");
        std::fs::write(&corrupt_path, "not base64 !!").unwrap();
        let corrupt = ObfuscatedPasswordFile::new(corrupt_path);
        assert!(corrupt.password().is_none());

        let good_path = dir.path().join("good");
        std::fs::write(&good_path, encode("0penBmc")).unwrap();
        let good = ObfuscatedPasswordFile::new(good_path);
        assert_eq!(good.password().as_deref(), Some("0penBmc"));
    }
}
