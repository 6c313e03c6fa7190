// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing identity resolution.
//!
//! A manifest node either names its signing identity explicitly or leaves it
//! to be inferred. Inference intersects the certificates authorized by the
//! node's provisioning profile with the identities available locally (from a
//! keychain or a directory of certificates). The first certificate in
//! *profile order* that is available wins.

use {
    crate::{
        context::SigningContext,
        dossier::DossierStore,
        error::DossierError,
        manifest::{is_ad_hoc_identity, ManifestNode},
        provisioning_profile::{certificate_fingerprint, ProvisioningProfile},
    },
    log::{debug, info, warn},
    once_cell::sync::{Lazy, OnceCell},
    regex::Regex,
    std::path::{Path, PathBuf},
    x509_certificate::CapturedX509Certificate,
};

/// Matches an identity line of `security find-identity` output.
///
/// e.g. `  1) 0123456789ABCDEF0123456789ABCDEF01234567 "Apple Development: ..."`
static FIND_IDENTITY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+\)\s+([0-9A-Fa-f]{40})\s").expect("regex should compile"));

/// Something that can enumerate the identities usable for signing.
pub trait IdentitySource: Send + Sync {
    /// Obtain fingerprints of all usable signing identities.
    fn available_identities(&self) -> Result<Vec<String>, DossierError>;
}

/// Identities with a code signing private key in a macOS keychain.
///
/// Backed by `security find-identity -v -p codesigning`.
pub struct KeychainIdentities {
    keychain: Option<PathBuf>,
}

impl KeychainIdentities {
    pub fn new(keychain: Option<PathBuf>) -> Self {
        Self { keychain }
    }
}

impl IdentitySource for KeychainIdentities {
    fn available_identities(&self) -> Result<Vec<String>, DossierError> {
        let mut args = vec![
            "find-identity".to_string(),
            "-v".to_string(),
            "-p".to_string(),
            "codesigning".to_string(),
        ];
        if let Some(keychain) = &self.keychain {
            args.push(keychain.display().to_string());
        }

        debug!("running security {:?}", args);
        let output = duct::cmd("security", &args)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()
            .map_err(|e| DossierError::IdentityListing(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            return Err(DossierError::IdentityListing(stdout.trim().to_string()));
        }

        Ok(parse_find_identity_output(&stdout))
    }
}

/// Extract identity fingerprints from `security find-identity` output.
///
/// Order is preserved and duplicates are dropped.
pub fn parse_find_identity_output(output: &str) -> Vec<String> {
    let mut res: Vec<String> = vec![];

    for line in output.lines() {
        if let Some(caps) = FIND_IDENTITY_LINE.captures(line) {
            let fingerprint = caps[1].to_ascii_uppercase();
            if !res.contains(&fingerprint) {
                res.push(fingerprint);
            }
        }
    }

    res
}

/// Identities defined by certificate files in a directory.
///
/// Every non-hidden file in the directory is parsed as PEM (possibly holding
/// several certificates) or DER.
pub struct CertificateDirectoryIdentities {
    directory: PathBuf,
}

impl CertificateDirectoryIdentities {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl IdentitySource for CertificateDirectoryIdentities {
    fn available_identities(&self) -> Result<Vec<String>, DossierError> {
        let mut paths = std::fs::read_dir(&self.directory)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        paths.sort();

        let mut res: Vec<String> = vec![];

        for path in paths {
            let hidden = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true);
            if hidden || !path.is_file() {
                continue;
            }

            for fingerprint in certificate_file_fingerprints(&path)? {
                if !res.contains(&fingerprint) {
                    res.push(fingerprint);
                }
            }
        }

        Ok(res)
    }
}

fn certificate_file_fingerprints(path: &Path) -> Result<Vec<String>, DossierError> {
    let data = std::fs::read(path)?;

    if data.starts_with(b"-----BEGIN") {
        let certs = CapturedX509Certificate::from_pem_multiple(&data)
            .map_err(|e| DossierError::CertificateParse(path.to_path_buf(), e.to_string()))?;

        Ok(certs
            .iter()
            .map(|cert| certificate_fingerprint(cert.constructed_data()))
            .collect())
    } else {
        let cert = CapturedX509Certificate::from_der(data)
            .map_err(|e| DossierError::CertificateParse(path.to_path_buf(), e.to_string()))?;

        Ok(vec![certificate_fingerprint(cert.constructed_data())])
    }
}

/// A fixed list of identities.
pub struct StaticIdentities(pub Vec<String>);

impl IdentitySource for StaticIdentities {
    fn available_identities(&self) -> Result<Vec<String>, DossierError> {
        Ok(self.0.clone())
    }
}

/// Obtain the [IdentitySource] appropriate for a [SigningContext].
pub fn identity_source_for_context(ctx: &SigningContext) -> Box<dyn IdentitySource> {
    if let Some(dir) = ctx.certificate_directory() {
        Box::new(CertificateDirectoryIdentities::new(dir))
    } else {
        Box::new(KeychainIdentities::new(ctx.keychain().map(|p| p.to_path_buf())))
    }
}

/// Select the first identity in profile order that is locally available.
pub fn select_identity<'a>(
    profile_fingerprints: &'a [String],
    available: &[String],
) -> Option<&'a String> {
    profile_fingerprints.iter().find(|candidate| {
        available
            .iter()
            .any(|a| a.eq_ignore_ascii_case(candidate.as_str()))
    })
}

/// Resolves the signing identity of manifest nodes.
///
/// Available identities are enumerated at most once per resolver.
pub struct IdentityResolver {
    source: Box<dyn IdentitySource>,
    available: OnceCell<Vec<String>>,
}

impl IdentityResolver {
    pub fn new(source: Box<dyn IdentitySource>) -> Self {
        Self {
            source,
            available: OnceCell::new(),
        }
    }

    /// Fingerprints of identities usable for signing.
    pub fn available_identities(&self) -> Result<&[String], DossierError> {
        Ok(self
            .available
            .get_or_try_init(|| self.source.available_identities())?
            .as_slice())
    }

    /// Determine the identity to sign the bundle at `bundle_path` with.
    ///
    /// An explicit identity on the node (including ad-hoc) is returned
    /// unchanged and skips all provisioning profile and entitlements
    /// validation. Otherwise the identity is inferred from the node's
    /// provisioning profile.
    pub fn resolve(
        &self,
        node: &ManifestNode,
        dossier: &DossierStore,
        bundle_path: &Path,
        ctx: &SigningContext,
    ) -> Result<String, DossierError> {
        if let Some(identity) = &node.codesign_identity {
            if is_ad_hoc_identity(identity) {
                info!("{} will be signed ad-hoc", bundle_path.display());
            } else {
                info!(
                    "using explicit identity {} for {}",
                    identity,
                    bundle_path.display()
                );
            }

            return Ok(identity.clone());
        }

        let profile_ref = node
            .provisioning_profile_ref
            .as_deref()
            .ok_or_else(|| DossierError::IdentityUnresolvable(bundle_path.to_path_buf()))?;

        let profile = ProvisioningProfile::from_path(dossier.asset_path(profile_ref)?)?;
        let fingerprints = profile.certificate_fingerprints()?;
        let available = self.available_identities()?;

        let identity = select_identity(&fingerprints, available).ok_or_else(|| {
            DossierError::NoMatchingIdentity {
                path: bundle_path.to_path_buf(),
                profile: profile.path().to_path_buf(),
                profile_count: fingerprints.len(),
            }
        })?;

        warn!(
            "inferred identity {} for {} from provisioning profile {}",
            identity,
            bundle_path.display(),
            profile.name().unwrap_or(profile_ref)
        );

        if let Some(entitlements_ref) = &node.entitlements_ref {
            check_entitlements(
                &profile,
                &dossier.asset_path(entitlements_ref)?,
                bundle_path,
                ctx,
            )?;
        }

        Ok(identity.clone())
    }
}

/// Verify requested entitlements are granted by a provisioning profile.
///
/// Keys listed in [SigningContext::allowed_entitlements()] are always
/// accepted.
pub fn check_entitlements(
    profile: &ProvisioningProfile,
    entitlements_path: &Path,
    bundle_path: &Path,
    ctx: &SigningContext,
) -> Result<(), DossierError> {
    let value = plist::Value::from_file(entitlements_path)
        .map_err(|e| DossierError::PlistParse(entitlements_path.to_path_buf(), e))?;

    let requested = value.as_dictionary().ok_or_else(|| {
        DossierError::ManifestInvalid(format!(
            "entitlements {} is not a dictionary",
            entitlements_path.display()
        ))
    })?;

    let granted = profile.entitlements();

    for key in requested.keys() {
        let is_granted = granted.map(|d| d.contains_key(key)).unwrap_or(false);

        if !is_granted && !ctx.allowed_entitlements().contains(key) {
            return Err(DossierError::EntitlementNotAllowed {
                path: bundle_path.to_path_buf(),
                key: key.clone(),
            });
        }
    }

    Ok(())
}
