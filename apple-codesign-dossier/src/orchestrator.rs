// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing a bundle tree according to a dossier.
//!
//! Signing happens in two phases.
//!
//! First a [SigningPlan] is built. The manifest is walked against the bundle
//! directory, identities are resolved, referenced assets are located and
//! loose frameworks and dylibs are discovered. Any problem with the input is
//! reported here, before anything on disk is modified.
//!
//! Then the plan is executed. A bundle is only signed after everything nested
//! inside it has been signed successfully. Units without a containment
//! relationship are signed concurrently, bounded by
//! [SigningContext::max_concurrent_signs()]. The first failure anywhere in the
//! tree stops any signing that has not started yet. Signer processes already
//! running are allowed to exit and exactly one error (the first) is reported.

use {
    crate::{
        codesign::{CodeSigner, SigningTask},
        context::{IdentityPolicy, SigningContext},
        dossier::DossierStore,
        error::DossierError,
        identity::IdentityResolver,
        manifest::ManifestNode,
    },
    futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt},
    log::{info, warn},
    once_cell::sync::OnceCell,
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, Ordering},
    },
    tokio::sync::Semaphore,
};

/// Something to be signed, before its identity is known.
#[derive(Clone, Debug)]
pub enum SignableUnit<'a> {
    /// A bundle described by a manifest node.
    FromManifest { path: PathBuf, node: &'a ManifestNode },

    /// A framework or dylib found in a `Frameworks` directory without a
    /// manifest node of its own.
    ///
    /// These are signed with the identity of the containing bundle.
    FromDiscoveredPath { path: PathBuf },
}

impl<'a> SignableUnit<'a> {
    pub fn path(&self) -> &Path {
        match self {
            Self::FromManifest { path, .. } => path,
            Self::FromDiscoveredPath { path } => path,
        }
    }
}

/// A resolved signing operation and everything that must be signed before it.
#[derive(Clone, Debug)]
pub struct SigningPlan {
    /// The signer invocation for this unit.
    pub task: SigningTask,

    /// Provisioning profile to install into the bundle before signing it.
    pub provisioning_profile: Option<PathBuf>,

    /// Units nested inside this one.
    pub children: Vec<SigningPlan>,
}

impl SigningPlan {
    /// Total number of signer invocations this plan performs.
    pub fn task_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|c| c.task_count())
            .sum::<usize>()
    }
}

/// The directory holding a bundle's content.
///
/// `Foo.app/Contents` for macOS style bundles, the bundle root otherwise.
pub fn bundle_content_dir(bundle_path: &Path) -> PathBuf {
    let contents = bundle_path.join("Contents");

    if contents.is_dir() {
        contents
    } else {
        bundle_path.to_path_buf()
    }
}

/// Where a bundle's embedded provisioning profile lives.
pub fn embedded_profile_path(bundle_path: &Path) -> PathBuf {
    let contents = bundle_path.join("Contents");

    if contents.is_dir() {
        contents.join("embedded.provisionprofile")
    } else {
        bundle_path.join("embedded.mobileprovision")
    }
}

/// Find frameworks and dylibs directly inside a bundle's `Frameworks` directory.
///
/// Results are sorted. Paths in `exclude` are omitted.
pub fn discover_frameworks(
    bundle_path: &Path,
    exclude: &HashSet<PathBuf>,
) -> Result<Vec<PathBuf>, DossierError> {
    let frameworks_dir = bundle_content_dir(bundle_path).join("Frameworks");

    if !frameworks_dir.is_dir() {
        return Ok(vec![]);
    }

    let mut res = vec![];

    for entry in std::fs::read_dir(&frameworks_dir)? {
        let path = entry?.path();

        let signable = match path.extension().and_then(|e| e.to_str()) {
            Some("framework") => path.is_dir(),
            Some("dylib") => path.is_file(),
            _ => false,
        };

        if signable && !exclude.contains(&path) {
            res.push(path);
        }
    }

    res.sort();

    Ok(res)
}

/// Signs bundle trees using a dossier.
pub struct DossierSigner<'a> {
    ctx: &'a SigningContext,
    signer: &'a dyn CodeSigner,
    resolver: &'a IdentityResolver,
}

impl<'a> DossierSigner<'a> {
    pub fn new(
        ctx: &'a SigningContext,
        signer: &'a dyn CodeSigner,
        resolver: &'a IdentityResolver,
    ) -> Self {
        Self {
            ctx,
            signer,
            resolver,
        }
    }

    /// Build the complete signing plan for the bundle at `root_path`.
    pub fn plan(
        &self,
        root_path: &Path,
        dossier: &DossierStore,
    ) -> Result<SigningPlan, DossierError> {
        self.plan_unit(
            SignableUnit::FromManifest {
                path: root_path.to_path_buf(),
                node: dossier.manifest(),
            },
            dossier,
            None,
        )
    }

    fn plan_unit(
        &self,
        unit: SignableUnit<'_>,
        dossier: &DossierStore,
        inherited_identity: Option<&str>,
    ) -> Result<SigningPlan, DossierError> {
        match unit {
            SignableUnit::FromManifest { path, node } => {
                if !path.exists() {
                    return Err(DossierError::MalformedBundleTree(
                        path,
                        "bundle described by manifest does not exist".into(),
                    ));
                }

                // Loose binaries such as dylibs may have their own node. They
                // have no nested content and nowhere to hold a profile.
                let is_bundle = path.is_dir();

                let identity = match inherited_identity {
                    Some(identity) => identity.to_string(),
                    None => self.resolver.resolve(node, dossier, &path, self.ctx)?,
                };

                let entitlements = node
                    .entitlements_ref
                    .as_deref()
                    .map(|name| dossier.asset_path(name))
                    .transpose()?;
                let provisioning_profile = node
                    .provisioning_profile_ref
                    .as_deref()
                    .filter(|_| is_bundle)
                    .map(|name| dossier.asset_path(name))
                    .transpose()?;

                let embedded_identity = match self.ctx.identity_policy() {
                    IdentityPolicy::SharedWithParent => Some(identity.as_str()),
                    IdentityPolicy::PerBundle => None,
                };

                let mut children = vec![];
                let mut described = HashSet::new();

                for embedded in &node.embedded {
                    let child_path = path.join(&embedded.relative_path);
                    described.insert(child_path.clone());

                    children.push(self.plan_unit(
                        SignableUnit::FromManifest {
                            path: child_path,
                            node: &embedded.node,
                        },
                        dossier,
                        embedded_identity,
                    )?);
                }

                let discovered = if is_bundle {
                    discover_frameworks(&path, &described)?
                } else {
                    vec![]
                };

                for discovered in discovered {
                    children.push(self.plan_unit(
                        SignableUnit::FromDiscoveredPath { path: discovered },
                        dossier,
                        Some(identity.as_str()),
                    )?);
                }

                Ok(SigningPlan {
                    task: SigningTask {
                        path,
                        identity,
                        entitlements,
                    },
                    provisioning_profile,
                    children,
                })
            }
            SignableUnit::FromDiscoveredPath { path } => {
                let identity = inherited_identity
                    .ok_or_else(|| DossierError::IdentityUnresolvable(path.clone()))?
                    .to_string();

                let children = if path.is_dir() {
                    discover_frameworks(&path, &HashSet::new())?
                        .into_iter()
                        .map(|nested| {
                            self.plan_unit(
                                SignableUnit::FromDiscoveredPath { path: nested },
                                dossier,
                                Some(identity.as_str()),
                            )
                        })
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    vec![]
                };

                Ok(SigningPlan {
                    task: SigningTask {
                        path,
                        identity,
                        entitlements: None,
                    },
                    provisioning_profile: None,
                    children,
                })
            }
        }
    }

    /// Execute a previously built plan.
    pub async fn execute(&self, plan: &SigningPlan) -> Result<(), DossierError> {
        let scheduler = Scheduler {
            signer: self.signer,
            permits: Semaphore::new(self.ctx.max_concurrent_signs()),
            failed: AtomicBool::new(false),
            first_error: OnceCell::new(),
        };

        let res = scheduler.execute(plan).await;

        match res {
            Ok(()) => Ok(()),
            Err(Aborted) => Err(scheduler
                .first_error
                .into_inner()
                .unwrap_or_else(|| DossierError::SigningCancelled(plan.task.path.clone()))),
        }
    }

    /// Sign the bundle at `root_path` according to `dossier`.
    ///
    /// This drives [Self::execute()] on a private current-thread tokio
    /// runtime and must not be called from within a tokio runtime, where it
    /// would panic. Async callers should use [Self::plan()] and
    /// [Self::execute()] directly.
    pub fn sign_tree(&self, root_path: &Path, dossier: &DossierStore) -> Result<(), DossierError> {
        let plan = self.plan(root_path, dossier)?;

        warn!(
            "signing {} ({} signing operations)",
            root_path.display(),
            plan.task_count()
        );

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(self.execute(&plan))
    }
}

/// Marker for a unit that did not complete; the cause is in [Scheduler::first_error].
#[derive(Debug)]
struct Aborted;

struct Scheduler<'a> {
    signer: &'a dyn CodeSigner,
    permits: Semaphore,
    failed: AtomicBool,
    first_error: OnceCell<DossierError>,
}

impl<'a> Scheduler<'a> {
    fn record_failure(&self, err: DossierError) {
        self.failed.store(true, Ordering::SeqCst);

        if self.first_error.set(err).is_err() {
            info!("discarding error reported after the first failure");
        }
    }

    fn execute<'s>(&'s self, plan: &'s SigningPlan) -> BoxFuture<'s, Result<(), Aborted>> {
        Box::pin(async move {
            let mut pending = plan
                .children
                .iter()
                .map(|child| self.execute(child))
                .collect::<FuturesUnordered<_>>();

            // Drain everything so in-flight signers exit before we report.
            let mut aborted = false;
            while let Some(res) = pending.next().await {
                if res.is_err() {
                    aborted = true;
                }
            }

            if aborted {
                return Err(Aborted);
            }

            self.run_task(plan).await
        })
    }

    async fn run_task(&self, plan: &SigningPlan) -> Result<(), Aborted> {
        let _permit = self.permits.acquire().await.map_err(|_| Aborted)?;

        if self.failed.load(Ordering::SeqCst) {
            info!(
                "not signing {} due to an earlier failure",
                plan.task.path.display()
            );
            return Err(Aborted);
        }

        if let Some(profile) = &plan.provisioning_profile {
            let dest = embedded_profile_path(&plan.task.path);
            info!("installing provisioning profile to {}", dest.display());

            if let Err(e) = std::fs::copy(profile, &dest) {
                self.record_failure(DossierError::MalformedBundleTree(
                    plan.task.path.clone(),
                    format!("unable to install provisioning profile: {}", e),
                ));
                return Err(Aborted);
            }
        }

        warn!("signing {}", plan.task.path.display());

        match self.signer.sign(&plan.task).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_failure(err);
                Err(Aborted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::ErrorKind, identity::StaticIdentities, manifest::EmbeddedManifestNode},
        std::sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        tempfile::TempDir,
    };

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum Event {
        Start(PathBuf),
        Finish(PathBuf),
        Failed(PathBuf),
    }

    #[derive(Default)]
    struct RecordingSigner {
        events: Mutex<Vec<Event>>,
        identities: Mutex<Vec<(PathBuf, String)>>,
        profiles_present: Mutex<Vec<PathBuf>>,
        fail_path: Option<PathBuf>,
        fail_first: bool,
        failed_once: AtomicBool,
    }

    impl RecordingSigner {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn position(&self, event: Event) -> usize {
            self.events()
                .iter()
                .position(|e| e == &event)
                .unwrap_or_else(|| panic!("{:?} not recorded", event))
        }

        fn starts(&self) -> Vec<PathBuf> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Start(p) => Some(p),
                    _ => None,
                })
                .collect()
        }

        fn identity_of(&self, path: &Path) -> String {
            self.identities
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| p == path)
                .map(|(_, id)| id.clone())
                .unwrap()
        }
    }

    impl CodeSigner for RecordingSigner {
        fn sign<'a>(&'a self, task: &'a SigningTask) -> BoxFuture<'a, Result<(), DossierError>> {
            Box::pin(async move {
                self.events
                    .lock()
                    .unwrap()
                    .push(Event::Start(task.path.clone()));
                self.identities
                    .lock()
                    .unwrap()
                    .push((task.path.clone(), task.identity.clone()));
                if embedded_profile_path(&task.path).exists() {
                    self.profiles_present.lock().unwrap().push(task.path.clone());
                }

                tokio::task::yield_now().await;

                let fail = self.fail_path.as_ref() == Some(&task.path)
                    || (self.fail_first && !self.failed_once.swap(true, Ordering::SeqCst));

                if fail {
                    self.events
                        .lock()
                        .unwrap()
                        .push(Event::Failed(task.path.clone()));
                    return Err(DossierError::SignerFailed {
                        path: task.path.clone(),
                        status: "exit status: 1".into(),
                        output: "failure".into(),
                    });
                }

                self.events
                    .lock()
                    .unwrap()
                    .push(Event::Finish(task.path.clone()));

                Ok(())
            })
        }
    }

    fn embedded(relative_path: &str, node: ManifestNode) -> EmbeddedManifestNode {
        EmbeddedManifestNode {
            relative_path: relative_path.into(),
            node,
        }
    }

    fn identity(id: &str) -> ManifestNode {
        ManifestNode {
            codesign_identity: Some(id.into()),
            ..Default::default()
        }
    }

    struct Fixture {
        _td: TempDir,
        root: PathBuf,
        dossier: DossierStore,
    }

    fn fixture(dirs: &[&str], files: &[&str], manifest: ManifestNode) -> Fixture {
        let td = TempDir::new().unwrap();
        let root = td.path().join("fake.app");
        std::fs::create_dir_all(&root).unwrap();

        for dir in dirs {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        for file in files {
            let path = root.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"\xcf\xfa\xed\xfe").unwrap();
        }

        let mut dossier = DossierStore::new_temporary().unwrap();
        dossier.set_manifest(manifest).unwrap();

        Fixture {
            _td: td,
            root,
            dossier,
        }
    }

    fn sign(
        fixture: &Fixture,
        signer: &RecordingSigner,
        ctx: &SigningContext,
    ) -> Result<(), DossierError> {
        let resolver = IdentityResolver::new(Box::new(StaticIdentities(vec![])));
        DossierSigner::new(ctx, signer, &resolver).sign_tree(&fixture.root, &fixture.dossier)
    }

    fn watch_manifest() -> ManifestNode {
        let mut watch_app = identity("ad-hoc");
        watch_app
            .embedded
            .push(embedded("PlugIns/WatchExt.appex", identity("ad-hoc")));

        let mut root = identity("ad-hoc");
        root.embedded
            .push(embedded("Extensions/Ext.appex", identity("ad-hoc")));
        root.embedded.push(embedded("Watch/WatchApp.app", watch_app));

        root
    }

    #[test]
    fn nested_bundles_signed_bottom_up() -> Result<(), DossierError> {
        let fixture = fixture(
            &[
                "Extensions/Ext.appex",
                "Watch/WatchApp.app/PlugIns/WatchExt.appex",
            ],
            &[],
            watch_manifest(),
        );
        let signer = RecordingSigner::default();
        sign(&fixture, &signer, &SigningContext::default())?;

        let root = fixture.root.clone();
        let ext = root.join("Extensions/Ext.appex");
        let watch = root.join("Watch/WatchApp.app");
        let watch_ext = watch.join("PlugIns/WatchExt.appex");

        assert_eq!(signer.starts().len(), 4);
        assert!(
            signer.position(Event::Finish(watch_ext.clone()))
                < signer.position(Event::Start(watch.clone()))
        );
        assert!(
            signer.position(Event::Finish(ext.clone()))
                < signer.position(Event::Start(root.clone()))
        );
        assert!(
            signer.position(Event::Finish(watch.clone()))
                < signer.position(Event::Start(root.clone()))
        );
        assert_eq!(signer.events().last(), Some(&Event::Finish(root)));

        Ok(())
    }

    #[test]
    fn fan_out_is_children_plus_root() -> Result<(), DossierError> {
        let mut manifest = identity("ad-hoc");
        let mut dirs = vec![];
        for i in 0..6 {
            let rel = format!("PlugIns/Ext{}.appex", i);
            manifest.embedded.push(embedded(&rel, ManifestNode::default()));
            dirs.push(rel);
        }
        let dirs = dirs.iter().map(|s| s.as_str()).collect::<Vec<_>>();

        let fixture = fixture(&dirs, &[], manifest);
        let signer = RecordingSigner::default();

        let mut ctx = SigningContext::default();
        ctx.set_max_concurrent_signs(2);
        sign(&fixture, &signer, &ctx)?;

        assert_eq!(signer.starts().len(), 7);
        assert_eq!(signer.starts().last(), Some(&fixture.root));

        Ok(())
    }

    #[test]
    fn discovered_frameworks_inherit_identity() -> Result<(), DossierError> {
        let mut manifest = identity("ROOTIDENTITY");
        manifest.embedded.push(embedded(
            "Frameworks/Described.framework",
            identity("OTHER"),
        ));

        let fixture = fixture(
            &[
                "Frameworks/Described.framework",
                "Frameworks/Loose.framework/Frameworks/Inner.framework",
                "Frameworks/NotSignable",
            ],
            &[
                "Frameworks/libA.dylib",
                "Frameworks/Loose.framework/Frameworks/libInner.dylib",
                "Frameworks/README.txt",
            ],
            manifest,
        );
        let signer = RecordingSigner::default();
        sign(&fixture, &signer, &SigningContext::default())?;

        let frameworks = fixture.root.join("Frameworks");
        let loose = frameworks.join("Loose.framework");
        let inner = loose.join("Frameworks/Inner.framework");
        let inner_lib = loose.join("Frameworks/libInner.dylib");

        let mut starts = signer.starts();
        starts.sort();
        let mut expected = vec![
            fixture.root.clone(),
            frameworks.join("Described.framework"),
            loose.clone(),
            inner.clone(),
            inner_lib.clone(),
            frameworks.join("libA.dylib"),
        ];
        expected.sort();
        assert_eq!(starts, expected);

        for path in [&loose, &inner, &inner_lib, &frameworks.join("libA.dylib")] {
            assert_eq!(signer.identity_of(path), "ROOTIDENTITY");
        }
        // Shared identity policy overrides the embedded node's own identity.
        assert_eq!(
            signer.identity_of(&frameworks.join("Described.framework")),
            "ROOTIDENTITY"
        );

        assert!(
            signer.position(Event::Finish(inner)) < signer.position(Event::Start(loose.clone()))
        );
        assert!(
            signer.position(Event::Finish(inner_lib))
                < signer.position(Event::Start(loose.clone()))
        );
        assert!(
            signer.position(Event::Finish(loose))
                < signer.position(Event::Start(fixture.root.clone()))
        );

        Ok(())
    }

    #[test]
    fn per_bundle_identity_policy() -> Result<(), DossierError> {
        let mut manifest = identity("ROOT");
        manifest
            .embedded
            .push(embedded("PlugIns/Ext.appex", identity("EXT")));

        let fixture = fixture(&["PlugIns/Ext.appex"], &[], manifest);

        let signer = RecordingSigner::default();
        sign(&fixture, &signer, &SigningContext::default())?;
        assert_eq!(
            signer.identity_of(&fixture.root.join("PlugIns/Ext.appex")),
            "ROOT"
        );

        let signer = RecordingSigner::default();
        let mut ctx = SigningContext::default();
        ctx.set_identity_policy(IdentityPolicy::PerBundle);
        sign(&fixture, &signer, &ctx)?;
        assert_eq!(
            signer.identity_of(&fixture.root.join("PlugIns/Ext.appex")),
            "EXT"
        );
        assert_eq!(signer.identity_of(&fixture.root), "ROOT");

        Ok(())
    }

    #[test]
    fn fail_fast_single_worker() -> Result<(), DossierError> {
        let mut manifest = identity("ad-hoc");
        let mut dirs = vec![];
        for i in 0..5 {
            let rel = format!("PlugIns/Ext{}.appex", i);
            manifest.embedded.push(embedded(&rel, ManifestNode::default()));
            dirs.push(rel);
        }
        let dirs = dirs.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        let fixture = fixture(&dirs, &["Frameworks/libA.dylib"], manifest);

        let signer = RecordingSigner {
            fail_first: true,
            ..Default::default()
        };
        let mut ctx = SigningContext::default();
        ctx.set_max_concurrent_signs(1);

        let err = sign(&fixture, &signer, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Signing);

        let events = signer.events();
        assert_eq!(events.len(), 2);
        let failed = match &events[1] {
            Event::Failed(path) => path.clone(),
            e => panic!("unexpected event {:?}", e),
        };
        assert_eq!(events[0], Event::Start(failed.clone()));
        assert!(matches!(err, DossierError::SignerFailed { ref path, .. } if *path == failed));

        Ok(())
    }

    #[test]
    fn fail_fast_bounded_pool_starts_nothing_after_failure() -> Result<(), DossierError> {
        let mut manifest = identity("ad-hoc");
        let mut dirs = vec![];
        for i in 0..12 {
            let rel = format!("PlugIns/Ext{:02}.appex", i);
            manifest.embedded.push(embedded(&rel, ManifestNode::default()));
            dirs.push(rel);
        }
        let dirs = dirs.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        let fixture = fixture(&dirs, &[], manifest);

        let signer = RecordingSigner {
            fail_first: true,
            ..Default::default()
        };
        let mut ctx = SigningContext::default();
        ctx.set_max_concurrent_signs(2);

        let err = sign(&fixture, &signer, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Signing);

        let events = signer.events();
        let failed_at = events
            .iter()
            .position(|e| matches!(e, Event::Failed(_)))
            .unwrap();
        assert!(events[failed_at..]
            .iter()
            .all(|e| !matches!(e, Event::Start(_))));
        assert!(signer.starts().len() <= 2);
        assert!(!signer.starts().contains(&fixture.root));

        // Signers already running when the failure happened are drained.
        for path in signer.starts() {
            assert!(
                events.contains(&Event::Finish(path.clone()))
                    || events.contains(&Event::Failed(path))
            );
        }

        Ok(())
    }

    #[test]
    fn described_loose_dylib_is_signed() -> Result<(), DossierError> {
        let td = TempDir::new()?;
        let root = td.path().join("fake.app");
        std::fs::create_dir_all(root.join("Frameworks"))?;
        let dylib = root.join("Frameworks/libOther.dylib");
        std::fs::write(&dylib, b"\xcf\xfa\xed\xfe")?;

        let mut dossier = DossierStore::new_temporary()?;
        let profile = dossier.add_asset_data(b"profile", "mobileprovision")?;

        let mut dylib_node = identity("DYLIB");
        dylib_node.provisioning_profile_ref = Some(profile);

        let mut manifest = identity("ROOT");
        manifest
            .embedded
            .push(embedded("Frameworks/libOther.dylib", dylib_node));
        dossier.set_manifest(manifest)?;

        let signer = RecordingSigner::default();
        let mut ctx = SigningContext::default();
        ctx.set_identity_policy(IdentityPolicy::PerBundle);
        let resolver = IdentityResolver::new(Box::new(StaticIdentities(vec![])));
        let dossier_signer = DossierSigner::new(&ctx, &signer, &resolver);

        let plan = dossier_signer.plan(&root, &dossier)?;
        assert_eq!(plan.task_count(), 2);
        assert!(plan.children[0].provisioning_profile.is_none());
        assert!(plan.children[0].children.is_empty());

        dossier_signer.sign_tree(&root, &dossier)?;

        assert_eq!(signer.starts(), vec![dylib.clone(), root.clone()]);
        assert_eq!(signer.identity_of(&dylib), "DYLIB");
        assert!(!root.join("embedded.mobileprovision").exists());

        Ok(())
    }

    #[test]
    fn fail_fast_nested_reports_first_error() -> Result<(), DossierError> {
        let fixture = fixture(
            &[
                "Extensions/Ext.appex",
                "Watch/WatchApp.app/PlugIns/WatchExt.appex",
            ],
            &[],
            watch_manifest(),
        );
        let watch_ext = fixture.root.join("Watch/WatchApp.app/PlugIns/WatchExt.appex");

        let signer = RecordingSigner {
            fail_path: Some(watch_ext.clone()),
            ..Default::default()
        };

        let err = sign(&fixture, &signer, &SigningContext::default()).unwrap_err();
        assert!(matches!(err, DossierError::SignerFailed { ref path, .. } if path == &watch_ext));

        let starts = signer.starts();
        assert!(!starts.contains(&fixture.root.join("Watch/WatchApp.app")));
        assert!(!starts.contains(&fixture.root));

        Ok(())
    }

    #[test]
    fn missing_embedded_bundle_fails_before_signing() {
        let fixture = fixture(&["Extensions/Ext.appex"], &[], watch_manifest());
        let signer = RecordingSigner::default();

        let err = sign(&fixture, &signer, &SigningContext::default()).unwrap_err();
        assert!(matches!(err, DossierError::MalformedBundleTree(..)));
        assert!(signer.events().is_empty());
    }

    #[test]
    fn unresolvable_identity_fails_before_signing() {
        let mut manifest = identity("ad-hoc");
        manifest
            .embedded
            .push(embedded("PlugIns/Ext.appex", ManifestNode::default()));
        let fixture = fixture(&["PlugIns/Ext.appex"], &["Frameworks/libA.dylib"], manifest);

        let signer = RecordingSigner::default();
        let mut ctx = SigningContext::default();
        ctx.set_identity_policy(IdentityPolicy::PerBundle);

        let err = sign(&fixture, &signer, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(signer.events().is_empty());
    }

    #[test]
    fn provisioning_profile_installed_before_signing() -> Result<(), DossierError> {
        let td = TempDir::new()?;
        let root = td.path().join("fake.app");
        std::fs::create_dir_all(root.join("PlugIns/Ext.appex"))?;

        let mut dossier = DossierStore::new_temporary()?;
        let profile = dossier.add_asset_data(b"profile", "mobileprovision")?;
        let entitlements = dossier.add_asset_data(b"<plist/>", "entitlements")?;

        let mut manifest = identity("ad-hoc");
        manifest.provisioning_profile_ref = Some(profile);
        manifest.entitlements_ref = Some(entitlements.clone());
        manifest
            .embedded
            .push(embedded("PlugIns/Ext.appex", ManifestNode::default()));
        dossier.set_manifest(manifest)?;

        let signer = RecordingSigner::default();
        let ctx = SigningContext::default();
        let resolver = IdentityResolver::new(Box::new(StaticIdentities(vec![])));
        let dossier_signer = DossierSigner::new(&ctx, &signer, &resolver);

        let plan = dossier_signer.plan(&root, &dossier)?;
        assert_eq!(plan.task_count(), 2);
        assert_eq!(
            plan.task.entitlements.as_deref(),
            Some(dossier.root_dir().join(&entitlements).as_path())
        );

        dossier_signer.sign_tree(&root, &dossier)?;

        assert_eq!(std::fs::read(root.join("embedded.mobileprovision"))?, b"profile");
        assert_eq!(*signer.profiles_present.lock().unwrap(), vec![root]);

        Ok(())
    }

    #[test]
    fn macos_layout() -> Result<(), DossierError> {
        let td = TempDir::new()?;
        let root = td.path().join("Mac.app");
        std::fs::create_dir_all(root.join("Contents/Frameworks"))?;
        std::fs::write(root.join("Contents/Frameworks/libz.dylib"), b"")?;

        assert_eq!(bundle_content_dir(&root), root.join("Contents"));
        assert_eq!(
            embedded_profile_path(&root),
            root.join("Contents/embedded.provisionprofile")
        );
        assert_eq!(
            discover_frameworks(&root, &HashSet::new())?,
            vec![root.join("Contents/Frameworks/libz.dylib")]
        );

        Ok(())
    }
}
