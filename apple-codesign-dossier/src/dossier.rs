// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dossier storage.
//!
//! A dossier is a directory holding a `manifest.json` plus a flat namespace of
//! asset files (entitlements plists and provisioning profiles) the manifest
//! refers to by name. Asset names are generated from random UUIDs so that
//! dossiers can be embedded into one another without collisions.
//!
//! Dossiers may also be stored as zip archives. An archive is expanded into a
//! temporary directory when opened, and that directory is deleted when the
//! [DossierStore] is dropped.

use {
    crate::{
        archive::{copy_directory, extract_zip, zip_directory},
        error::DossierError,
        manifest::ManifestNode,
    },
    log::{info, warn},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
    tempfile::TempDir,
};

/// Name of the manifest file at the root of a dossier.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Generate a new, collision free asset name with the given extension.
pub fn new_asset_name(extension: &str) -> String {
    format!(
        "{}.{}",
        uuid::Uuid::new_v4().to_string().to_uppercase(),
        extension
    )
}

fn validate_asset_name(name: &str) -> Result<(), DossierError> {
    let mut components = Path::new(name).components();

    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(()),
        _ => Err(DossierError::ManifestInvalid(format!(
            "asset reference is not a plain file name: {}",
            name
        ))),
    }
}

/// A dossier on the filesystem.
pub struct DossierStore {
    root: PathBuf,
    manifest: ManifestNode,
    /// Archive this dossier was expanded from and is written back to.
    archive_path: Option<PathBuf>,
    /// Keeps the expansion directory alive for temporary dossiers.
    _temp_dir: Option<TempDir>,
}

impl DossierStore {
    /// Open an existing dossier from a directory or zip archive.
    ///
    /// The manifest is parsed and every asset it references must exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DossierError> {
        let path = path.as_ref();

        if path.is_dir() {
            let manifest = read_manifest(path)?;

            let store = Self {
                root: path.to_path_buf(),
                manifest,
                archive_path: None,
                _temp_dir: None,
            };
            store.validate_assets()?;

            Ok(store)
        } else if path.is_file() {
            let temp_dir = TempDir::new()?;
            extract_zip(path, temp_dir.path())?;

            let root = locate_dossier_root(temp_dir.path())
                .ok_or_else(|| DossierError::ManifestMissing(path.to_path_buf()))?;
            let manifest = read_manifest(&root)?;

            let store = Self {
                root,
                manifest,
                archive_path: Some(path.to_path_buf()),
                _temp_dir: Some(temp_dir),
            };
            store.validate_assets()?;

            Ok(store)
        } else {
            Err(DossierError::DossierNotFound(path.to_path_buf()))
        }
    }

    /// Create an empty dossier in a new directory.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DossierError> {
        let path = path.as_ref();
        ensure_empty_destination(path)?;
        std::fs::create_dir_all(path)?;

        let store = Self {
            root: path.to_path_buf(),
            manifest: ManifestNode::default(),
            archive_path: None,
            _temp_dir: None,
        };
        store.write_manifest()?;

        Ok(store)
    }

    /// Create an empty dossier in a temporary directory.
    ///
    /// The directory is deleted when the instance is dropped. Use
    /// [Self::write_to()] to keep its content.
    pub fn new_temporary() -> Result<Self, DossierError> {
        let temp_dir = TempDir::new()?;

        let store = Self {
            root: temp_dir.path().to_path_buf(),
            manifest: ManifestNode::default(),
            archive_path: None,
            _temp_dir: Some(temp_dir),
        };
        store.write_manifest()?;

        Ok(store)
    }

    /// The directory holding the manifest and assets.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// The root manifest.
    pub fn manifest(&self) -> &ManifestNode {
        &self.manifest
    }

    /// Replace the root manifest.
    ///
    /// Every referenced asset must already exist in this dossier.
    pub fn set_manifest(&mut self, manifest: ManifestNode) -> Result<(), DossierError> {
        for name in manifest.asset_refs() {
            self.asset_path(name)?;
        }

        self.manifest = manifest;
        self.write_manifest()
    }

    /// Resolve the filesystem path of a named asset.
    pub fn asset_path(&self, name: &str) -> Result<PathBuf, DossierError> {
        validate_asset_name(name)?;

        let path = self.root.join(name);

        if path.is_file() {
            Ok(path)
        } else {
            Err(DossierError::AssetMissing(
                name.to_string(),
                self.root.clone(),
            ))
        }
    }

    /// Verify every asset referenced by the manifest exists.
    pub fn validate_assets(&self) -> Result<(), DossierError> {
        for name in self.manifest.asset_refs() {
            self.asset_path(name)?;
        }

        Ok(())
    }

    /// Add raw data as a new asset, returning its generated name.
    pub fn add_asset_data(&mut self, data: &[u8], extension: &str) -> Result<String, DossierError> {
        let name = new_asset_name(extension);
        let path = self.root.join(&name);

        if path.exists() {
            return Err(DossierError::AssetConflict(name, self.root.clone()));
        }

        std::fs::write(&path, data)?;

        Ok(name)
    }

    /// Copy a file into this dossier as a new asset, returning its generated name.
    pub fn add_asset(&mut self, source: &Path, extension: &str) -> Result<String, DossierError> {
        let name = new_asset_name(extension);
        let path = self.root.join(&name);

        if path.exists() {
            return Err(DossierError::AssetConflict(name, self.root.clone()));
        }

        info!("copying {} into dossier as {}", source.display(), name);
        std::fs::copy(source, &path)?;

        Ok(name)
    }

    /// Embed another dossier as a new child of the root manifest.
    ///
    /// The other dossier's assets are copied in under fresh names. If an
    /// embedded manifest already exists at `relative_path`, nothing is
    /// modified and an error is returned.
    pub fn embed(&mut self, other: &DossierStore, relative_path: &str) -> Result<(), DossierError> {
        if self.manifest.embedded_at(relative_path).is_some() {
            return Err(DossierError::EmbeddedPathConflict(relative_path.to_string()));
        }

        other.validate_assets()?;

        let mut renames = BTreeMap::new();
        let mut child = other.manifest.clone();
        child.rename_assets(&mut |name| {
            renames
                .entry(name.to_string())
                .or_insert_with(|| {
                    let extension = Path::new(name)
                        .extension()
                        .map(|e| e.to_string_lossy().to_string())
                        .unwrap_or_else(|| "asset".to_string());
                    new_asset_name(&extension)
                })
                .clone()
        });

        for new_name in renames.values() {
            if self.root.join(new_name).exists() {
                return Err(DossierError::AssetConflict(
                    new_name.clone(),
                    self.root.clone(),
                ));
            }
        }

        let mut manifest = self.manifest.clone();
        manifest.merge_embed(child, relative_path)?;

        for (old_name, new_name) in &renames {
            std::fs::copy(other.asset_path(old_name)?, self.root.join(new_name))?;
        }

        warn!(
            "embedded dossier {} at {}",
            other.root_dir().display(),
            relative_path
        );

        self.manifest = manifest;
        self.write_manifest()
    }

    /// Write `manifest.json` to the dossier directory.
    pub fn write_manifest(&self) -> Result<(), DossierError> {
        std::fs::write(self.root.join(MANIFEST_FILENAME), self.manifest.dump()?)?;

        Ok(())
    }

    /// Save changes back to where this dossier was opened from.
    ///
    /// Dossiers opened from an archive have the archive rewritten.
    pub fn persist(&self) -> Result<(), DossierError> {
        self.write_manifest()?;

        if let Some(archive_path) = &self.archive_path {
            zip_directory(&self.root, archive_path, None)?;
        }

        Ok(())
    }

    /// Write this dossier to a new directory or zip archive.
    pub fn write_to(&self, dest: impl AsRef<Path>, as_zip: bool) -> Result<(), DossierError> {
        let dest = dest.as_ref();
        self.write_manifest()?;

        if as_zip {
            if dest.exists() {
                std::fs::remove_file(dest)?;
            }
            zip_directory(&self.root, dest, None)
        } else {
            ensure_empty_destination(dest)?;
            copy_directory(&self.root, dest)
        }
    }
}

fn read_manifest(root: &Path) -> Result<ManifestNode, DossierError> {
    let manifest_path = root.join(MANIFEST_FILENAME);

    if !manifest_path.is_file() {
        return Err(DossierError::ManifestMissing(root.to_path_buf()));
    }

    ManifestNode::load(&std::fs::read(&manifest_path)?)
}

/// Find the directory holding `manifest.json` in an expanded archive.
///
/// The manifest is either at the archive root or inside a single top-level
/// directory.
fn locate_dossier_root(expanded: &Path) -> Option<PathBuf> {
    if expanded.join(MANIFEST_FILENAME).is_file() {
        return Some(expanded.to_path_buf());
    }

    let mut dirs = std::fs::read_dir(expanded)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect::<Vec<_>>();

    if dirs.len() == 1 && dirs[0].join(MANIFEST_FILENAME).is_file() {
        dirs.pop()
    } else {
        None
    }
}

fn ensure_empty_destination(path: &Path) -> Result<(), DossierError> {
    if path.is_dir() && std::fs::read_dir(path)?.next().is_none() {
        return Ok(());
    }

    if path.exists() {
        return Err(DossierError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} already exists", path.display()),
        )));
    }

    Ok(())
}

/// Assemble a new dossier from its individual parts.
///
/// Embedded dossiers are `(relative path, dossier path)` pairs.
pub fn create_dossier(
    codesign_identity: Option<String>,
    provisioning_profile: Option<&Path>,
    entitlements: Option<&Path>,
    embedded: &[(String, PathBuf)],
) -> Result<DossierStore, DossierError> {
    let mut store = DossierStore::new_temporary()?;

    let mut manifest = ManifestNode {
        codesign_identity,
        ..Default::default()
    };

    if let Some(path) = provisioning_profile {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mobileprovision".to_string());
        manifest.provisioning_profile_ref = Some(store.add_asset(path, &extension)?);
    }

    if let Some(path) = entitlements {
        manifest.entitlements_ref = Some(store.add_asset(path, "entitlements")?);
    }

    store.set_manifest(manifest)?;

    for (relative_path, path) in embedded {
        let other = DossierStore::open(path)?;
        store.embed(&other, relative_path)?;
    }

    Ok(store)
}
