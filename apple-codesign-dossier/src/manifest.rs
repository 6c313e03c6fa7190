// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The manifest describing how a bundle tree is to be signed.
//!
//! A manifest is a recursive structure. The root node describes the main
//! bundle. Each embedded node describes a bundle nested inside its parent,
//! addressed by a path relative to the parent's root directory.
//!
//! Manifests are persisted as JSON inside a [crate::DossierStore]:
//!
//! ```json
//! {
//!   "codesign_identity": "0123456789ABCDEF0123456789ABCDEF01234567",
//!   "embedded_bundle_manifests": [
//!     {
//!       "embedded_bundle_manifests": [],
//!       "embedded_relative_path": "PlugIns/Ext.appex",
//!       "provisioning_profile": "5D2C....mobileprovision"
//!     }
//!   ],
//!   "entitlements": "A1B7....entitlements"
//! }
//! ```

use {
    crate::error::DossierError,
    serde::{Deserialize, Serialize},
    std::{
        collections::HashSet,
        path::{Component, Path},
    },
};

/// Identity value requesting an ad-hoc signature.
pub const AD_HOC_IDENTITY: &str = "ad-hoc";

/// Whether an identity string requests ad-hoc signing.
///
/// `-` is what `codesign` itself uses for ad-hoc signing and is accepted as a
/// synonym.
pub fn is_ad_hoc_identity(identity: &str) -> bool {
    identity == AD_HOC_IDENTITY || identity == "-"
}

/// Describes a single signable unit: a root bundle or an embedded bundle.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ManifestNode {
    /// Requested signing identity.
    ///
    /// A certificate fingerprint, a raw certificate reference understood by
    /// the signer, or [AD_HOC_IDENTITY].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codesign_identity: Option<String>,

    /// Name of the entitlements plist asset in the dossier.
    #[serde(
        default,
        rename = "entitlements",
        skip_serializing_if = "Option::is_none"
    )]
    pub entitlements_ref: Option<String>,

    /// Name of the provisioning profile asset in the dossier.
    #[serde(
        default,
        rename = "provisioning_profile",
        skip_serializing_if = "Option::is_none"
    )]
    pub provisioning_profile_ref: Option<String>,

    /// Nested bundles, in manifest order.
    #[serde(default, rename = "embedded_bundle_manifests")]
    pub embedded: Vec<EmbeddedManifestNode>,
}

/// A [ManifestNode] nested inside a parent bundle.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EmbeddedManifestNode {
    /// Path of this bundle relative to the parent bundle's root.
    ///
    /// e.g. `PlugIns/Foo.appex` or `Watch/WatchApp.app`.
    #[serde(rename = "embedded_relative_path")]
    pub relative_path: String,

    #[serde(flatten)]
    pub node: ManifestNode,
}

impl ManifestNode {
    /// Parse a manifest from JSON data.
    ///
    /// Structural invariants are validated: every embedded relative path must
    /// be a normalized relative path and unique among its siblings.
    pub fn load(data: &[u8]) -> Result<Self, DossierError> {
        let node = serde_json::from_slice::<Self>(data)
            .map_err(|e| DossierError::ManifestInvalid(e.to_string()))?;
        node.validate()?;

        Ok(node)
    }

    /// Serialize to JSON.
    ///
    /// Object keys are emitted in sorted order, so dumping an unchanged
    /// manifest always yields identical bytes.
    pub fn dump(&self) -> Result<Vec<u8>, DossierError> {
        // serde_json::Value objects are backed by a BTreeMap.
        let value = serde_json::to_value(self)?;
        let mut data = serde_json::to_vec_pretty(&value)?;
        data.push(b'\n');

        Ok(data)
    }

    /// Whether this node requests an ad-hoc signature.
    pub fn is_ad_hoc(&self) -> bool {
        self.codesign_identity
            .as_deref()
            .map(is_ad_hoc_identity)
            .unwrap_or(false)
    }

    /// Find an embedded child by its relative path.
    pub fn embedded_at(&self, relative_path: &str) -> Option<&EmbeddedManifestNode> {
        self.embedded
            .iter()
            .find(|e| e.relative_path == relative_path)
    }

    /// Append `child` as a new embedded entry at `relative_path`.
    ///
    /// Fails without modifying `self` if an entry already exists at that path.
    pub fn merge_embed(
        &mut self,
        child: ManifestNode,
        relative_path: impl ToString,
    ) -> Result<(), DossierError> {
        let relative_path = relative_path.to_string();
        validate_relative_path(&relative_path)?;

        if self.embedded_at(&relative_path).is_some() {
            return Err(DossierError::EmbeddedPathConflict(relative_path));
        }

        self.embedded.push(EmbeddedManifestNode {
            relative_path,
            node: child,
        });

        Ok(())
    }

    /// All asset names referenced by this node and its descendants.
    pub fn asset_refs(&self) -> Vec<&str> {
        let mut refs = vec![];

        if let Some(v) = &self.entitlements_ref {
            refs.push(v.as_str());
        }
        if let Some(v) = &self.provisioning_profile_ref {
            refs.push(v.as_str());
        }

        for embedded in &self.embedded {
            refs.extend(embedded.node.asset_refs());
        }

        refs
    }

    /// Rewrite every asset reference in this tree through `f`.
    pub fn rename_assets(&mut self, f: &mut impl FnMut(&str) -> String) {
        if let Some(v) = self.entitlements_ref.as_mut() {
            *v = f(v);
        }
        if let Some(v) = self.provisioning_profile_ref.as_mut() {
            *v = f(v);
        }

        for embedded in self.embedded.iter_mut() {
            embedded.node.rename_assets(f);
        }
    }

    fn validate(&self) -> Result<(), DossierError> {
        let mut seen = HashSet::new();

        for embedded in &self.embedded {
            validate_relative_path(&embedded.relative_path)?;

            if !seen.insert(embedded.relative_path.as_str()) {
                return Err(DossierError::EmbeddedPathConflict(
                    embedded.relative_path.clone(),
                ));
            }

            embedded.node.validate()?;
        }

        Ok(())
    }
}

fn validate_relative_path(path: &str) -> Result<(), DossierError> {
    if path.is_empty() {
        return Err(DossierError::ManifestInvalid(
            "embedded relative path is empty".into(),
        ));
    }

    if !Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(DossierError::ManifestInvalid(format!(
            "embedded relative path must stay inside its parent bundle: {}",
            path
        )));
    }

    Ok(())
}
