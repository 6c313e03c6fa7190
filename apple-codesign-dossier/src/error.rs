// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error};

/// Broad classification of a [DossierError].
///
/// Every error is fatal to the top-level operation that produced it. The
/// classification exists so callers can tell malformed input apart from
/// failures of the external signer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A manifest, dossier or referenced asset is missing or malformed.
    Load,
    /// No usable signing identity could be determined.
    Resolution,
    /// The external signer failed, timed out or was cancelled.
    Signing,
    /// A bundle tree or archive is malformed.
    Packaging,
    /// An embed or merge would overwrite existing content.
    Conflict,
    /// Anything else (I/O, argument parsing).
    Other,
}

/// Unified error type for dossier based code signing.
#[derive(Debug, Error)]
pub enum DossierError {
    #[error("bad argument")]
    CliBadArgument,

    #[error("{0}")]
    CliGeneralError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("dossier does not contain a manifest.json: {0}")]
    ManifestMissing(PathBuf),

    #[error("dossier does not exist: {0}")]
    DossierNotFound(PathBuf),

    #[error("manifest references {0} but no such asset exists in dossier {1}")]
    AssetMissing(String, PathBuf),

    #[error("malformed provisioning profile {0}: {1}")]
    ProvisioningProfileMalformed(PathBuf, String),

    #[error("error parsing plist {0}: {1}")]
    PlistParse(PathBuf, plist::Error),

    #[error("no codesign identity or provisioning profile to resolve an identity for {0}")]
    IdentityUnresolvable(PathBuf),

    #[error("no identity for {path} among the {profile_count} certificates in {profile}")]
    NoMatchingIdentity {
        path: PathBuf,
        profile: PathBuf,
        profile_count: usize,
    },

    #[error("entitlement {key} requested for {path} is not granted by its provisioning profile")]
    EntitlementNotAllowed { path: PathBuf, key: String },

    #[error("error parsing certificate {0}: {1}")]
    CertificateParse(PathBuf, String),

    #[error("unable to list signing identities: {0}")]
    IdentityListing(String),

    #[error("codesign failed for {path} ({status}): {output}")]
    SignerFailed {
        path: PathBuf,
        status: String,
        output: String,
    },

    #[error("codesign timed out after {seconds}s signing {path}")]
    SignerTimeout { path: PathBuf, seconds: u64 },

    #[error("unable to run codesign on {0}: {1}")]
    SignerSpawn(PathBuf, std::io::Error),

    #[error("signing of {0} was cancelled after an earlier failure")]
    SigningCancelled(PathBuf),

    #[error("malformed bundle tree {0}: {1}")]
    MalformedBundleTree(PathBuf, String),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive entry escapes the extraction directory: {0}")]
    ArchiveEntryUnsafe(String),

    #[error("an embedded manifest already exists at {0}")]
    EmbeddedPathConflict(String),

    #[error("asset {0} already exists in dossier {1}")]
    AssetConflict(String, PathBuf),
}

impl DossierError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestInvalid(_)
            | Self::ManifestMissing(_)
            | Self::DossierNotFound(_)
            | Self::AssetMissing(..)
            | Self::ProvisioningProfileMalformed(..)
            | Self::PlistParse(..) => ErrorKind::Load,
            Self::IdentityUnresolvable(_)
            | Self::NoMatchingIdentity { .. }
            | Self::EntitlementNotAllowed { .. }
            | Self::CertificateParse(..)
            | Self::IdentityListing(_) => ErrorKind::Resolution,
            Self::SignerFailed { .. }
            | Self::SignerTimeout { .. }
            | Self::SignerSpawn(..)
            | Self::SigningCancelled(_) => ErrorKind::Signing,
            Self::MalformedBundleTree(..) | Self::Zip(_) | Self::ArchiveEntryUnsafe(_) => {
                ErrorKind::Packaging
            }
            Self::EmbeddedPathConflict(_) | Self::AssetConflict(..) => ErrorKind::Conflict,
            Self::CliBadArgument | Self::CliGeneralError(_) | Self::Io(_) | Self::SerdeJson(_) => {
                ErrorKind::Other
            }
        }
    }
}
