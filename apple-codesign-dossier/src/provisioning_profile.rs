// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning profile parsing.
//!
//! A provisioning profile is a plist wrapped in a CMS `SignedData` structure.
//! We only need to look inside: the certificates it authorizes and the
//! entitlements it grants. The CMS signature itself is not verified.

use {
    crate::error::DossierError,
    cryptographic_message_syntax::SignedData,
    std::path::{Path, PathBuf},
};

/// Compute the fingerprint of a DER encoded certificate.
///
/// This is the upper-case hex SHA-1 digest of the DER data, the same form
/// `security find-identity` prints and `codesign --sign` accepts.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, der);

    hex::encode_upper(digest.as_ref())
}

/// A parsed provisioning profile.
#[derive(Clone, Debug)]
pub struct ProvisioningProfile {
    path: PathBuf,
    plist: plist::Dictionary,
}

impl ProvisioningProfile {
    /// Read and parse a profile from a filesystem path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DossierError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        Self::from_data(path, &data)
    }

    /// Parse a profile from raw data.
    ///
    /// The data may be CMS `SignedData` (what `.mobileprovision` and
    /// `.provisionprofile` files contain) or the bare inner plist.
    pub fn from_data(path: &Path, data: &[u8]) -> Result<Self, DossierError> {
        let content = if looks_like_plist(data) {
            data.to_vec()
        } else {
            let signed_data = SignedData::parse_ber(data).map_err(|e| {
                DossierError::ProvisioningProfileMalformed(path.to_path_buf(), e.to_string())
            })?;

            signed_data
                .signed_content()
                .ok_or_else(|| {
                    DossierError::ProvisioningProfileMalformed(
                        path.to_path_buf(),
                        "CMS structure has no encapsulated content".into(),
                    )
                })?
                .to_vec()
        };

        let value = plist::Value::from_reader(std::io::Cursor::new(content))
            .map_err(|e| DossierError::PlistParse(path.to_path_buf(), e))?;

        let plist = value.into_dictionary().ok_or_else(|| {
            DossierError::ProvisioningProfileMalformed(
                path.to_path_buf(),
                "profile content is not a dictionary".into(),
            )
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            plist,
        })
    }

    /// The path this profile was read from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The profile's `Name`, if present.
    pub fn name(&self) -> Option<&str> {
        self.plist.get("Name").and_then(|v| v.as_string())
    }

    /// DER encoded certificates authorized by this profile, in profile order.
    pub fn developer_certificates(&self) -> Result<Vec<&[u8]>, DossierError> {
        let certs = match self.plist.get("DeveloperCertificates") {
            Some(value) => value.as_array().ok_or_else(|| {
                DossierError::ProvisioningProfileMalformed(
                    self.path.clone(),
                    "DeveloperCertificates is not an array".into(),
                )
            })?,
            None => return Ok(vec![]),
        };

        certs
            .iter()
            .map(|v| {
                v.as_data().ok_or_else(|| {
                    DossierError::ProvisioningProfileMalformed(
                        self.path.clone(),
                        "DeveloperCertificates entry is not data".into(),
                    )
                })
            })
            .collect()
    }

    /// Fingerprints of [Self::developer_certificates()], in profile order.
    pub fn certificate_fingerprints(&self) -> Result<Vec<String>, DossierError> {
        Ok(self
            .developer_certificates()?
            .into_iter()
            .map(certificate_fingerprint)
            .collect())
    }

    /// The entitlements granted by this profile.
    pub fn entitlements(&self) -> Option<&plist::Dictionary> {
        self.plist
            .get("Entitlements")
            .and_then(|v| v.as_dictionary())
    }
}

fn looks_like_plist(data: &[u8]) -> bool {
    let trimmed = match data.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &data[start..],
        None => return false,
    };

    trimmed.starts_with(b"<?xml")
        || trimmed.starts_with(b"<plist")
        || trimmed.starts_with(b"bplist")
}
