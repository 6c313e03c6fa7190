// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End to end signing of bundles, archives and combined dossier archives.

use {
    crate::{
        archive::{
            copy_directory, extract_archive, extract_zip, find_payload_bundle, package_archive,
            zip_directory,
        },
        codesign::CodeSigner,
        context::SigningContext,
        dossier::DossierStore,
        error::DossierError,
        identity::IdentityResolver,
        orchestrator::DossierSigner,
    },
    log::warn,
    std::path::{Path, PathBuf},
    tempfile::TempDir,
};

/// Directory holding the dossier in a combined archive.
pub const COMBINED_DOSSIER_DIR: &str = "dossier";

/// Directory holding the bundle (or `.ipa` tree) in a combined archive.
pub const COMBINED_BUNDLE_DIR: &str = "bundle";

/// What is being signed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigningInput {
    /// A bundle directory, signed with a separate dossier.
    BundleDirectory(PathBuf),

    /// An `.ipa` style archive, signed with a separate dossier.
    Archive(PathBuf),

    /// An archive with top-level `dossier/` and `bundle/` directories.
    Combined(PathBuf),
}

impl SigningInput {
    /// Classify the `input` path given whether a dossier was supplied separately.
    pub fn classify(input: &Path, has_dossier: bool) -> Result<Self, DossierError> {
        if !input.exists() {
            return Err(DossierError::MalformedBundleTree(
                input.to_path_buf(),
                "input does not exist".into(),
            ));
        }

        if !has_dossier {
            if input.is_file() {
                Ok(Self::Combined(input.to_path_buf()))
            } else {
                Err(DossierError::CliGeneralError(format!(
                    "{} is a directory; signing a bundle directory requires --dossier",
                    input.display()
                )))
            }
        } else if input.is_dir() {
            Ok(Self::BundleDirectory(input.to_path_buf()))
        } else {
            Ok(Self::Archive(input.to_path_buf()))
        }
    }
}

/// Sign `input` and return the path of the signed result.
///
/// Bundle directories are signed in place unless `output` is given, in which
/// case the bundle is copied there first. Archives always require `output`.
pub fn sign_input(
    input: &SigningInput,
    dossier: Option<&Path>,
    output: Option<&Path>,
    ctx: &SigningContext,
    signer: &dyn CodeSigner,
    resolver: &IdentityResolver,
) -> Result<PathBuf, DossierError> {
    let dossier_signer = DossierSigner::new(ctx, signer, resolver);

    match input {
        SigningInput::BundleDirectory(bundle) => {
            let dossier = open_dossier(dossier)?;

            let dest = match output {
                Some(output) => {
                    if output.exists() {
                        return Err(DossierError::CliGeneralError(format!(
                            "output path {} already exists",
                            output.display()
                        )));
                    }
                    warn!("copying {} to {}", bundle.display(), output.display());
                    copy_directory(bundle, output)?;
                    output.to_path_buf()
                }
                None => bundle.clone(),
            };

            dossier_signer.sign_tree(&dest, &dossier)?;

            Ok(dest)
        }
        SigningInput::Archive(archive) => {
            let dossier = open_dossier(dossier)?;
            let output = require_output(output)?;

            let temp_dir = TempDir::new()?;
            let bundle = extract_archive(archive, temp_dir.path())?;

            dossier_signer.sign_tree(&bundle, &dossier)?;

            warn!("writing signed archive to {}", output.display());
            package_archive(temp_dir.path(), output)
        }
        SigningInput::Combined(archive) => {
            let output = require_output(output)?;

            let temp_dir = TempDir::new()?;
            extract_zip(archive, temp_dir.path())?;

            let dossier = DossierStore::open(temp_dir.path().join(COMBINED_DOSSIER_DIR))?;
            let bundle_root = temp_dir.path().join(COMBINED_BUNDLE_DIR);

            if !bundle_root.is_dir() {
                return Err(DossierError::MalformedBundleTree(
                    archive.clone(),
                    format!("archive has no {}/ directory", COMBINED_BUNDLE_DIR),
                ));
            }

            if bundle_root.join("Payload").is_dir() {
                let bundle = find_payload_bundle(&bundle_root)?;
                dossier_signer.sign_tree(&bundle, &dossier)?;

                warn!("writing signed archive to {}", output.display());
                package_archive(&bundle_root, output)
            } else {
                let bundle = find_bundle_directory(&bundle_root)?;
                dossier_signer.sign_tree(&bundle, &dossier)?;

                let name = bundle
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        DossierError::MalformedBundleTree(
                            bundle.clone(),
                            "bundle has no name".into(),
                        )
                    })?;

                warn!("writing signed bundle archive to {}", output.display());
                zip_directory(&bundle, output, Some(&name))?;

                Ok(output.to_path_buf())
            }
        }
    }
}

fn open_dossier(path: Option<&Path>) -> Result<DossierStore, DossierError> {
    let path = path.ok_or_else(|| DossierError::CliGeneralError("--dossier is required".into()))?;

    DossierStore::open(path)
}

fn require_output(output: Option<&Path>) -> Result<&Path, DossierError> {
    output.ok_or_else(|| {
        DossierError::CliGeneralError("--output is required when signing an archive".into())
    })
}

/// Find the single bundle directory directly under `root`.
fn find_bundle_directory(root: &Path) -> Result<PathBuf, DossierError> {
    let mut bundles = std::fs::read_dir(root)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| p.is_dir() && p.extension().is_some())
        .collect::<Vec<_>>();

    match bundles.len() {
        1 => Ok(bundles.remove(0)),
        0 => Err(DossierError::MalformedBundleTree(
            root.to_path_buf(),
            "no bundle found".into(),
        )),
        _ => Err(DossierError::MalformedBundleTree(
            root.to_path_buf(),
            "multiple bundles found".into(),
        )),
    }
}
