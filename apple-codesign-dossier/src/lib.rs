// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dossier driven code signing for Apple application bundles.
//!
//! A *dossier* is a portable record of how to sign a bundle tree: a
//! `manifest.json` naming the signing identity, entitlements and provisioning
//! profile for a bundle and, recursively, for every bundle embedded inside it.
//! Entitlements and profiles are stored next to the manifest as flat assets
//! with generated, collision free names.
//!
//! Dossiers decouple *building* an application from *signing* it. A build
//! can emit an unsigned bundle plus a dossier and signing can happen later,
//! on another machine with access to the signing identities.
//!
//! # Features and Capabilities
//!
//! This crate can:
//!
//! * Create dossiers from their parts and merge dossiers into each other.
//!   (See [DossierStore] and [create_dossier()].)
//! * Infer the signing identity of a bundle from its provisioning profile
//!   and the identities available in a keychain or certificate directory.
//!   (See [IdentityResolver].)
//! * Sign a bundle tree bottom-up, signing independent bundles concurrently
//!   and stopping at the first failure. (See [DossierSigner].)
//! * Produce a dossier from an already signed bundle tree. (See
//!   [generate_dossier()].)
//! * Sign `.ipa` archives and combined dossier plus bundle archives. (See
//!   [sign_input()].)
//!
//! Actual signatures are produced by Apple's `codesign` tool (or a
//! compatible program), driven through the [CodeSigner] trait.

mod archive;
pub use archive::*;
mod codesign;
pub use codesign::*;
mod context;
pub use context::*;
mod dossier;
pub use dossier::*;
mod error;
pub use error::*;
mod generate;
pub use generate::*;
mod identity;
pub use identity::*;
mod manifest;
pub use manifest::*;
mod orchestrator;
pub use orchestrator::*;
mod pipeline;
pub use pipeline::*;
mod provisioning_profile;
pub use provisioning_profile::*;
