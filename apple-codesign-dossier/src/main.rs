// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_codesign_dossier::{
        create_dossier, generate_dossier, identity_source_for_context, sign_input, DossierError,
        DossierStore, ExternalCodesign, IdentityPolicy, IdentityResolver, SigningContext,
        SigningInput, DEFAULT_MAX_CONCURRENT_SIGNS, DEFAULT_SIGNER_TIMEOUT,
    },
    clap::{Arg, ArgGroup, ArgMatches, Command},
    log::{error, warn, LevelFilter},
    std::{
        path::{Path, PathBuf},
        str::FromStr,
        time::Duration,
    },
};

const DEFAULT_CODESIGN: &str = "/usr/bin/codesign";

const SIGN_ABOUT: &str = "\
Sign a bundle tree using a dossier.

INPUT may be:

* A bundle directory (e.g. `Foo.app`). --dossier is required. The bundle is
  signed in place unless --output is given, in which case it is copied
  there first.
* An application archive (e.g. `Foo.ipa`). --dossier and --output are
  required.
* A combined archive with top-level `dossier/` and `bundle/` directories.
  --dossier must not be given and --output is required.

Every bundle described by the dossier is signed, innermost first. Frameworks
and dylibs found in `Frameworks` directories that the dossier doesn't describe
are signed with the identity of the bundle containing them.

Bundles without an explicit codesign identity have their identity inferred by
matching the certificates in their provisioning profile against the signing
identities available in --keychain (or the default keychain search list) or,
if given, --certificates.

Signing stops at the first failure. Signer processes already running are
allowed to finish but nothing else is started.
";

const GENERATE_ABOUT: &str = "\
Generate a dossier describing an already signed bundle tree.

The signing authority, entitlements and embedded provisioning profile of the
bundle and its signed embedded bundles are recorded. Unsigned and ad-hoc
signed bundles are not described.
";

const EMBED_ABOUT: &str = "\
Embed a dossier into another dossier.

The embedded dossier becomes a child of the target dossier's root manifest at
the given path relative to the root bundle. Assets are copied in under new
names. The target dossier is modified in place, and is left untouched if it
already describes a bundle at that path.
";

fn path_arg(args: &ArgMatches, name: &str) -> Option<PathBuf> {
    args.value_of(name).map(PathBuf::from)
}

fn required_path_arg(args: &ArgMatches, name: &str) -> Result<PathBuf, DossierError> {
    path_arg(args, name).ok_or(DossierError::CliBadArgument)
}

fn command_sign(args: &ArgMatches) -> Result<(), DossierError> {
    let mut ctx = SigningContext::default();

    if let Some(keychain) = path_arg(args, "keychain") {
        ctx.set_keychain(keychain);
    }
    if let Some(certificates) = path_arg(args, "certificates") {
        ctx.set_certificate_directory(certificates);
    }
    if let Some(values) = args.values_of("allow_entitlement") {
        for key in values {
            ctx.allow_entitlement(key);
        }
    }
    if let Some(jobs) = args.value_of("jobs") {
        let jobs = usize::from_str(jobs).map_err(|_| DossierError::CliBadArgument)?;
        ctx.set_max_concurrent_signs(jobs);
    }
    if let Some(seconds) = args.value_of("timeout_seconds") {
        let seconds = u64::from_str(seconds).map_err(|_| DossierError::CliBadArgument)?;
        ctx.set_signer_timeout(Duration::from_secs(seconds));
    }
    if args.is_present("per_bundle_identity") {
        ctx.set_identity_policy(IdentityPolicy::PerBundle);
    }

    let input = required_path_arg(args, "input")?;
    let dossier = path_arg(args, "dossier");
    let output = path_arg(args, "output");

    let input = SigningInput::classify(&input, dossier.is_some())?;

    let codesign = ExternalCodesign::new(
        required_path_arg(args, "codesign")?,
        ctx.keychain().map(Path::to_path_buf),
        ctx.signer_timeout(),
    );
    let resolver = IdentityResolver::new(identity_source_for_context(&ctx));

    let signed = sign_input(
        &input,
        dossier.as_deref(),
        output.as_deref(),
        &ctx,
        &codesign,
        &resolver,
    )?;

    warn!("signed {}", signed.display());

    Ok(())
}

fn command_generate(args: &ArgMatches) -> Result<(), DossierError> {
    let bundle = required_path_arg(args, "bundle")?;
    let output = required_path_arg(args, "output")?;

    let codesign = ExternalCodesign::new(
        required_path_arg(args, "codesign")?,
        None,
        DEFAULT_SIGNER_TIMEOUT,
    );

    let store = generate_dossier(&bundle, &codesign)?;

    warn!("writing dossier to {}", output.display());
    store.write_to(&output, args.is_present("zip"))
}

fn command_create(args: &ArgMatches) -> Result<(), DossierError> {
    let output = required_path_arg(args, "output")?;

    let identity = if args.is_present("infer_identity") {
        None
    } else {
        Some(
            args.value_of("codesign_identity")
                .ok_or(DossierError::CliBadArgument)?
                .to_string(),
        )
    };

    let profile = path_arg(args, "provisioning_profile");
    let entitlements = path_arg(args, "entitlements_file");

    let mut embedded = vec![];
    if let Some(values) = args.values_of("embedded_dossier") {
        let values = values.collect::<Vec<_>>();

        for pair in values.chunks(2) {
            match pair {
                [relative_path, path] => {
                    embedded.push((relative_path.to_string(), PathBuf::from(path)));
                }
                _ => {
                    error!("--embedded-dossier requires a relative path and a dossier path");
                    return Err(DossierError::CliBadArgument);
                }
            }
        }
    }

    let store = create_dossier(
        identity,
        profile.as_deref(),
        entitlements.as_deref(),
        &embedded,
    )?;

    warn!("writing dossier to {}", output.display());
    store.write_to(&output, args.is_present("zip"))
}

fn command_embed(args: &ArgMatches) -> Result<(), DossierError> {
    let target = required_path_arg(args, "dossier")?;
    let embedded = required_path_arg(args, "embedded_dossier_path")?;
    let relative_path = args
        .value_of("embedded_relative_artifact_path")
        .ok_or(DossierError::CliBadArgument)?;

    let mut store = DossierStore::open(&target)?;
    let other = DossierStore::open(&embedded)?;

    warn!(
        "embedding {} into {} at {}",
        embedded.display(),
        target.display(),
        relative_path
    );
    store.embed(&other, relative_path)?;
    store.persist()
}

fn main_impl() -> Result<(), DossierError> {
    let default_jobs = DEFAULT_MAX_CONCURRENT_SIGNS.to_string();
    let default_timeout = DEFAULT_SIGNER_TIMEOUT.as_secs().to_string();

    let app = Command::new("Dossier based Apple code signing")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign Apple application bundles using signing dossiers")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("create")
            .about("Create a dossier from a codesign identity, profile and entitlements")
            .arg(
                Arg::new("output")
                    .long("output")
                    .takes_value(true)
                    .required(true)
                    .help("Path to write the dossier to"),
            )
            .arg(
                Arg::new("zip")
                    .long("zip")
                    .help("Write the dossier as a zip archive"),
            )
            .arg(
                Arg::new("codesign_identity")
                    .long("codesign-identity")
                    .takes_value(true)
                    .help("Identity to sign with. `ad-hoc` for ad-hoc signing"),
            )
            .arg(
                Arg::new("infer_identity")
                    .long("infer-identity")
                    .help("Infer the identity from the provisioning profile at signing time"),
            )
            .group(
                ArgGroup::new("identity")
                    .args(&["codesign_identity", "infer_identity"])
                    .required(true),
            )
            .arg(
                Arg::new("provisioning_profile")
                    .long("provisioning-profile")
                    .takes_value(true)
                    .help("Provisioning profile to embed in the bundle"),
            )
            .arg(
                Arg::new("entitlements_file")
                    .long("entitlements-file")
                    .takes_value(true)
                    .help("Entitlements plist to sign with"),
            )
            .arg(
                Arg::new("embedded_dossier")
                    .long("embedded-dossier")
                    .takes_value(true)
                    .number_of_values(2)
                    .multiple_occurrences(true)
                    .value_names(&["RELATIVE_PATH", "DOSSIER"])
                    .help("Dossier of a bundle embedded at a path relative to the root bundle"),
            ),
    );

    let app = app.subcommand(
        Command::new("embed")
            .about("Embed a dossier into another dossier")
            .long_about(EMBED_ABOUT)
            .arg(
                Arg::new("dossier")
                    .long("dossier")
                    .takes_value(true)
                    .required(true)
                    .help("Dossier to modify"),
            )
            .arg(
                Arg::new("embedded_dossier_path")
                    .long("embedded-dossier-path")
                    .takes_value(true)
                    .required(true)
                    .help("Dossier to embed"),
            )
            .arg(
                Arg::new("embedded_relative_artifact_path")
                    .long("embedded-relative-artifact-path")
                    .takes_value(true)
                    .required(true)
                    .help("Path of the embedded bundle relative to the root bundle"),
            ),
    );

    let app = app.subcommand(
        Command::new("generate")
            .about("Generate a dossier from a signed bundle")
            .long_about(GENERATE_ABOUT)
            .arg(
                Arg::new("output")
                    .long("output")
                    .takes_value(true)
                    .required(true)
                    .help("Path to write the dossier to"),
            )
            .arg(
                Arg::new("zip")
                    .long("zip")
                    .help("Write the dossier as a zip archive"),
            )
            .arg(
                Arg::new("codesign")
                    .long("codesign")
                    .takes_value(true)
                    .default_value(DEFAULT_CODESIGN)
                    .help("Path to the codesign tool"),
            )
            .arg(
                Arg::new("bundle")
                    .required(true)
                    .help("Signed bundle to describe"),
            ),
    );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign a bundle tree using a dossier")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("codesign")
                    .long("codesign")
                    .takes_value(true)
                    .default_value(DEFAULT_CODESIGN)
                    .help("Path to the codesign tool"),
            )
            .arg(
                Arg::new("dossier")
                    .long("dossier")
                    .takes_value(true)
                    .help("Dossier directory or zip archive describing how to sign"),
            )
            .arg(
                Arg::new("output")
                    .long("output")
                    .takes_value(true)
                    .help("Where to write the signed bundle or archive"),
            )
            .arg(
                Arg::new("keychain")
                    .long("keychain")
                    .takes_value(true)
                    .help("Keychain to find identities in and sign with"),
            )
            .arg(
                Arg::new("certificates")
                    .long("certificates")
                    .takes_value(true)
                    .help("Directory of certificates defining the available identities"),
            )
            .arg(
                Arg::new("allow_entitlement")
                    .long("allow-entitlement")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Entitlement key to accept even if the provisioning profile lacks it"),
            )
            .arg(
                Arg::new("jobs")
                    .long("jobs")
                    .short('j')
                    .takes_value(true)
                    .default_value(&default_jobs)
                    .help("Maximum number of concurrent codesign processes"),
            )
            .arg(
                Arg::new("timeout_seconds")
                    .long("timeout-seconds")
                    .takes_value(true)
                    .default_value(&default_timeout)
                    .help("Terminate a codesign process running longer than this"),
            )
            .arg(
                Arg::new("per_bundle_identity")
                    .long("per-bundle-identity")
                    .help("Resolve the identity of every embedded bundle independently"),
            )
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("Bundle, archive or combined archive to sign"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("create", args)) => command_create(args),
        Some(("embed", args)) => command_embed(args),
        Some(("generate", args)) => command_generate(args),
        Some(("sign", args)) => command_sign(args),
        _ => Err(DossierError::CliGeneralError("unknown command".into())),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
