// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deriving dossiers from already signed bundles.

use {
    crate::{
        codesign::SignatureInspector,
        dossier::DossierStore,
        error::DossierError,
        manifest::{EmbeddedManifestNode, ManifestNode},
        orchestrator::{bundle_content_dir, embedded_profile_path},
    },
    log::{info, warn},
    std::path::Path,
};

/// Directories that may hold nested signed code, in traversal order.
pub const EMBEDDING_DIRECTORIES: &[&str] =
    &["AppClips", "Extensions", "Frameworks", "PlugIns", "Watch"];

/// Describe the signed bundle at `bundle_path` as a manifest node.
///
/// Entitlements and provisioning profiles are copied into `store` as new
/// assets. Returns `None` if the bundle isn't signed with an identity, in
/// which case nothing beneath it is described either.
///
/// Frameworks and dylibs directly inside a `Frameworks` directory are only
/// described when they differ from their parent: a different authority, or
/// their own entitlements or provisioning profile. Ones signed exactly like
/// their parent are left out because signing discovers them and signs them
/// with the parent's identity anyway. Signing the generated dossier thus
/// reproduces the signatures it was generated from.
pub fn generate(
    bundle_path: &Path,
    inspector: &dyn SignatureInspector,
    store: &mut DossierStore,
) -> Result<Option<ManifestNode>, DossierError> {
    generate_node(bundle_path, inspector, store, None)
}

fn generate_node(
    bundle_path: &Path,
    inspector: &dyn SignatureInspector,
    store: &mut DossierStore,
    parent_authority: Option<&str>,
) -> Result<Option<ManifestNode>, DossierError> {
    let info = inspector.signing_info(bundle_path)?;

    let authority = match info.authority {
        Some(authority) => authority,
        None => {
            info!("{} is not signed; ignoring", bundle_path.display());
            return Ok(None);
        }
    };

    let mut node = ManifestNode {
        codesign_identity: Some(authority.clone()),
        ..Default::default()
    };

    if let Some(entitlements) = &info.entitlements {
        node.entitlements_ref = Some(store.add_asset_data(entitlements, "entitlements")?);
    }

    let profile = embedded_profile_path(bundle_path);
    if profile.is_file() {
        let extension = profile
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mobileprovision".to_string());
        node.provisioning_profile_ref = Some(store.add_asset(&profile, &extension)?);
    }

    // Loose code in Frameworks signed like its parent is rediscovered at
    // signing time, so it only needs a node when it differs.
    if parent_authority == Some(authority.as_str())
        && node.entitlements_ref.is_none()
        && node.provisioning_profile_ref.is_none()
        && is_in_frameworks(bundle_path)
    {
        let nested = generate_embedded(bundle_path, inspector, store, &authority)?;
        if nested.is_empty() {
            return Ok(None);
        }
        node.embedded = nested;
        return Ok(Some(node));
    }

    node.embedded = generate_embedded(bundle_path, inspector, store, &authority)?;

    Ok(Some(node))
}

fn is_in_frameworks(path: &Path) -> bool {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|name| name == "Frameworks")
        .unwrap_or(false)
}

fn generate_embedded(
    bundle_path: &Path,
    inspector: &dyn SignatureInspector,
    store: &mut DossierStore,
    authority: &str,
) -> Result<Vec<EmbeddedManifestNode>, DossierError> {
    let content_dir = bundle_content_dir(bundle_path);
    let mut embedded = vec![];

    for dir_name in EMBEDDING_DIRECTORIES {
        let dir = content_dir.join(dir_name);
        if !dir.is_dir() {
            continue;
        }

        let mut entries = std::fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort();

        for path in entries {
            if let Some(node) = generate_node(&path, inspector, store, Some(authority))? {
                let relative_path = path
                    .strip_prefix(bundle_path)
                    .map_err(|_| {
                        DossierError::MalformedBundleTree(
                            path.clone(),
                            "embedded path is outside of its bundle".into(),
                        )
                    })?
                    .to_string_lossy()
                    .replace('\\', "/");

                embedded.push(EmbeddedManifestNode {
                    relative_path,
                    node,
                });
            }
        }
    }

    Ok(embedded)
}

/// Generate a complete dossier describing the bundle at `bundle_path`.
///
/// The returned store is temporary; use [DossierStore::write_to()] to keep it.
pub fn generate_dossier(
    bundle_path: &Path,
    inspector: &dyn SignatureInspector,
) -> Result<DossierStore, DossierError> {
    if !bundle_path.is_dir() {
        return Err(DossierError::MalformedBundleTree(
            bundle_path.to_path_buf(),
            "not a bundle directory".into(),
        ));
    }

    let mut store = DossierStore::new_temporary()?;

    let manifest = generate(bundle_path, inspector, &mut store)?.ok_or_else(|| {
        DossierError::MalformedBundleTree(bundle_path.to_path_buf(), "bundle is not signed".into())
    })?;

    warn!(
        "generated manifest for {} with {} embedded bundles",
        bundle_path.display(),
        manifest.embedded.len()
    );

    store.set_manifest(manifest)?;

    Ok(store)
}
