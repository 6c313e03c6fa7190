// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Settings shared by every step of a signing run.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

/// Default upper bound on concurrently running signer processes.
pub const DEFAULT_MAX_CONCURRENT_SIGNS: usize = 8;

/// Default wall-clock limit for a single signer invocation.
pub const DEFAULT_SIGNER_TIMEOUT: Duration = Duration::from_secs(600);

/// How embedded bundles obtain their signing identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdentityPolicy {
    /// Embedded bundles are signed with the identity resolved for the
    /// containing bundle.
    ///
    /// Signature validation rejects app trees signed with mixed identities,
    /// so this is the default.
    SharedWithParent,

    /// Every manifest node resolves its own identity.
    PerBundle,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self::SharedWithParent
    }
}

/// Immutable settings threaded through identity resolution and signing.
#[derive(Clone, Debug)]
pub struct SigningContext {
    keychain: Option<PathBuf>,
    certificate_directory: Option<PathBuf>,
    allowed_entitlements: BTreeSet<String>,
    max_concurrent_signs: usize,
    signer_timeout: Duration,
    identity_policy: IdentityPolicy,
}

impl Default for SigningContext {
    fn default() -> Self {
        Self {
            keychain: None,
            certificate_directory: None,
            allowed_entitlements: BTreeSet::new(),
            max_concurrent_signs: DEFAULT_MAX_CONCURRENT_SIGNS,
            signer_timeout: DEFAULT_SIGNER_TIMEOUT,
            identity_policy: IdentityPolicy::default(),
        }
    }
}

impl SigningContext {
    /// The keychain to find identities in and sign with.
    ///
    /// `None` means the user's default keychain search list.
    pub fn keychain(&self) -> Option<&Path> {
        self.keychain.as_deref()
    }

    pub fn set_keychain(&mut self, path: impl Into<PathBuf>) {
        self.keychain = Some(path.into());
    }

    /// Directory of certificates defining the identities available for signing.
    ///
    /// When set, this takes precedence over the keychain for determining
    /// available identities.
    pub fn certificate_directory(&self) -> Option<&Path> {
        self.certificate_directory.as_deref()
    }

    pub fn set_certificate_directory(&mut self, path: impl Into<PathBuf>) {
        self.certificate_directory = Some(path.into());
    }

    /// Entitlement keys permitted even if the provisioning profile lacks them.
    pub fn allowed_entitlements(&self) -> &BTreeSet<String> {
        &self.allowed_entitlements
    }

    pub fn allow_entitlement(&mut self, key: impl ToString) {
        self.allowed_entitlements.insert(key.to_string());
    }

    pub fn max_concurrent_signs(&self) -> usize {
        self.max_concurrent_signs
    }

    /// Set the signer pool size. Values below 1 are clamped to 1.
    pub fn set_max_concurrent_signs(&mut self, value: usize) {
        self.max_concurrent_signs = value.max(1);
    }

    pub fn signer_timeout(&self) -> Duration {
        self.signer_timeout
    }

    pub fn set_signer_timeout(&mut self, value: Duration) {
        self.signer_timeout = value;
    }

    pub fn identity_policy(&self) -> IdentityPolicy {
        self.identity_policy
    }

    pub fn set_identity_policy(&mut self, policy: IdentityPolicy) {
        self.identity_policy = policy;
    }
}
