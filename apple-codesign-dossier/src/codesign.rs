// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the external code signing tool.
//!
//! Actual signing is delegated to Apple's `codesign` (or a compatible
//! program). This module defines the [CodeSigner] and [SignatureInspector]
//! seams used by the rest of the crate and an implementation of both backed
//! by the external program.

use {
    crate::{error::DossierError, manifest::is_ad_hoc_identity},
    futures::future::BoxFuture,
    log::{debug, error, info},
    once_cell::sync::Lazy,
    regex::Regex,
    std::{
        ffi::OsString,
        path::{Path, PathBuf},
        process::Stdio,
        time::Duration,
    },
};

/// Output lines from `codesign` that are informational only.
static BENIGN_OUTPUT: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^.*: replacing existing signature$",
        r"^.*: signed (app|bundle|generic|Mach-O)\b.*$",
        r"^.*: signed .*bundle with Mach-O .*$",
    ]
    .iter()
    .map(|s| Regex::new(s).expect("regex should compile"))
    .collect()
});

/// Remove known informational lines from signer output.
pub fn filter_signer_output(output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !BENIGN_OUTPUT.iter().any(|re| re.is_match(line)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A single invocation of the signer on one filesystem path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningTask {
    /// Path to sign. A bundle directory or a standalone binary.
    pub path: PathBuf,
    /// Resolved identity to sign with.
    pub identity: String,
    /// Entitlements plist to embed in the signature.
    pub entitlements: Option<PathBuf>,
}

/// Something that can sign filesystem paths.
///
/// Implementations must tolerate concurrent calls on disjoint paths.
pub trait CodeSigner: Send + Sync {
    /// Sign the path described by `task`.
    fn sign<'a>(&'a self, task: &'a SigningTask) -> BoxFuture<'a, Result<(), DossierError>>;
}

/// Signature metadata of an existing signed path.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SigningInfo {
    /// First `Authority=` line of the signature. e.g. `Apple Development: Jane (TEAM123456)`.
    ///
    /// `None` if the path is unsigned or only signed ad-hoc.
    pub authority: Option<String>,

    /// XML plist of the entitlements embedded in the signature.
    pub entitlements: Option<Vec<u8>>,
}

/// Something that can describe existing signatures.
pub trait SignatureInspector {
    fn signing_info(&self, path: &Path) -> Result<SigningInfo, DossierError>;
}

/// Parse the signing authority from `codesign --display --verbose=2` output.
pub fn parse_authority(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.strip_prefix("Authority=")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Extract a plist document from `codesign --display --entitlements` output.
pub fn extract_entitlements_plist(output: &[u8]) -> Option<Vec<u8>> {
    let start = output
        .windows(5)
        .position(|w| w == b"<?xml")
        .or_else(|| output.windows(6).position(|w| w == b"<plist"))?;

    let end = output
        .windows(8)
        .rposition(|w| w == b"</plist>")
        .map(|p| p + 8)?;

    if end <= start {
        return None;
    }

    let mut data = output[start..end].to_vec();
    data.push(b'\n');

    Some(data)
}

/// Drives an external `codesign` compatible program.
#[derive(Clone, Debug)]
pub struct ExternalCodesign {
    codesign_path: PathBuf,
    keychain: Option<PathBuf>,
    timeout: Duration,
}

impl ExternalCodesign {
    pub fn new(
        codesign_path: impl Into<PathBuf>,
        keychain: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            codesign_path: codesign_path.into(),
            keychain,
            timeout,
        }
    }

    /// Command line arguments used to perform `task`.
    pub fn sign_arguments(&self, task: &SigningTask) -> Vec<OsString> {
        let identity = if is_ad_hoc_identity(&task.identity) {
            "-"
        } else {
            task.identity.as_str()
        };

        let mut args: Vec<OsString> = vec!["--sign".into(), identity.into(), "--force".into()];

        if let Some(keychain) = &self.keychain {
            args.push("--keychain".into());
            args.push(keychain.into());
        }

        if let Some(entitlements) = &task.entitlements {
            args.push("--entitlements".into());
            args.push(entitlements.into());
        }

        args.push(task.path.as_os_str().to_os_string());

        args
    }

    async fn run_sign(&self, task: &SigningTask) -> Result<(), DossierError> {
        let args = self.sign_arguments(task);
        debug!("running {} {:?}", self.codesign_path.display(), args);

        // Dropping the child (which the timeout does) kills the process.
        let child = tokio::process::Command::new(&self.codesign_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DossierError::SignerSpawn(task.path.clone(), e))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|e| DossierError::SignerSpawn(task.path.clone(), e))?,
            Err(_) => {
                error!(
                    "codesign exceeded {}s on {}; terminating it",
                    self.timeout.as_secs(),
                    task.path.display()
                );
                return Err(DossierError::SignerTimeout {
                    path: task.path.clone(),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let filtered = filter_signer_output(&combined);

        if output.status.success() {
            for line in filtered.lines() {
                info!("codesign> {}", line);
            }

            Ok(())
        } else {
            for line in filtered.lines() {
                error!("codesign> {}", line);
            }

            Err(DossierError::SignerFailed {
                path: task.path.clone(),
                status: output.status.to_string(),
                output: filtered,
            })
        }
    }

    fn display(&self, path: &Path, extra: &[&str]) -> Result<std::process::Output, DossierError> {
        let mut args: Vec<OsString> = vec!["--display".into()];
        args.extend(extra.iter().map(OsString::from));
        args.push(path.as_os_str().to_os_string());

        debug!("running {} {:?}", self.codesign_path.display(), args);
        duct::cmd(&self.codesign_path, &args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|e| DossierError::SignerSpawn(path.to_path_buf(), e))
    }
}

impl CodeSigner for ExternalCodesign {
    fn sign<'a>(&'a self, task: &'a SigningTask) -> BoxFuture<'a, Result<(), DossierError>> {
        Box::pin(self.run_sign(task))
    }
}

impl SignatureInspector for ExternalCodesign {
    fn signing_info(&self, path: &Path) -> Result<SigningInfo, DossierError> {
        let output = self.display(path, &["--verbose=2"])?;

        // Details are printed to stderr.
        let mut text = String::from_utf8_lossy(&output.stderr).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stdout));

        let authority = if output.status.success() {
            parse_authority(&text)
        } else {
            None
        };

        if authority.is_none() {
            return Ok(SigningInfo::default());
        }

        let output = self.display(path, &["--entitlements", ":-"])?;
        let entitlements = if output.status.success() {
            extract_entitlements_plist(&output.stdout)
        } else {
            None
        };

        Ok(SigningInfo {
            authority,
            entitlements,
        })
    }
}
