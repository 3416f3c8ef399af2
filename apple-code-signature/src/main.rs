// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    anyhow::{anyhow, Context, Result},
    apple_code_signature::{
        macho_allocate, parse_requirement_expression, parse_requirements, remove_signature,
        reader::SignatureReader, CmsSigningIdentity, CodeRequirements, CodeSignatureFlags,
        DigestType, RequirementsSource, SettingsScope, Signer, SigningSettings, StaticCode,
        ValidationFlags, ValidityTrustEvaluator,
    },
    clap::{Arg, ArgMatches, Command},
    log::{info, warn, LevelFilter},
    std::{path::PathBuf, str::FromStr, sync::Arc},
    x509_certificate::CapturedX509Certificate,
};

const SIGN_ABOUT: &str = "\
Sign a Mach-O binary or bundle.

Without a signing identity, an ad-hoc signature is produced. Ad-hoc
signatures carry code digests but no cryptographic signature.

A signing identity is provided as a PEM file holding a PKCS#8 PRIVATE KEY
and the signing CERTIFICATE, optionally followed by issuing certificates.

Settings that apply to individual binaries accept a scope prefix of the
form <scope>:<value>. Scopes are:

main
   The main binary (the default when no prefix is given).
@<index>
   A universal binary slice by index.
@[cpu_type=<int>]
   A universal binary slice by CPU type.
<path>
   A nested binary by path relative to the bundle root.
<path>@<index>, <path>@[cpu_type=<int>]
   A slice of a nested binary.
";

const VERIFY_ABOUT: &str = "\
Statically validate signed code.

The code directories, the CMS signature, every code page and, for bundles,
every sealed resource are checked. Nested code is validated recursively.

Certificate chains are only trusted when their root is given with
--anchor-pem.
";

const ALLOCATE_ABOUT: &str = "\
Reserve signature space in a Mach-O binary.

The __LINKEDIT segment is grown and an LC_CODE_SIGNATURE load command
pointing to the reserved space is added or updated. With --size 0 the
signature space is removed instead.
";

const SUPPORTED_HASHES: &[&str; 5] = &[
    "sha1",
    "sha256",
    "sha256-truncated",
    "sha384",
    "sha512",
];

fn parse_scoped_value(s: &str) -> Result<(SettingsScope, &str)> {
    match s.split_once(':') {
        None => Ok((SettingsScope::Main, s)),
        Some((scope, value)) => Ok((SettingsScope::try_from(scope)?, value)),
    }
}

fn scoped_values<'a>(args: &'a ArgMatches, name: &str) -> Result<Vec<(SettingsScope, &'a str)>> {
    args.values_of(name)
        .into_iter()
        .flatten()
        .map(parse_scoped_value)
        .collect()
}

fn read_certificates(path: &str) -> Result<Vec<CapturedX509Certificate>> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path))?;

    Ok(CapturedX509Certificate::from_pem_multiple(data)?)
}

fn command_sign(args: &ArgMatches) -> Result<()> {
    let mut settings = SigningSettings::default();

    if let Some(path) = args.value_of("pem_source") {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path))?;
        let mut identity = CmsSigningIdentity::from_pem_data(&data)?;

        if let Some(url) = args.value_of("timestamp_url") {
            warn!("using time-stamp protocol server {}", url);
            identity = identity.with_time_stamp_url(url);
        }

        warn!("registering signing identity from {}", path);
        settings.set_signing_identity(Arc::new(identity));
    }

    if let Some(values) = args.values_of("digest") {
        let digests = values
            .map(DigestType::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        settings.set_digest_types(digests);
    }

    if let Some(prefix) = args.value_of("identifier_prefix") {
        settings.set_identifier_prefix(prefix);
    }

    if let Some(value) = args.value_of("page_size") {
        settings.set_page_size(u32::from_str(value)?)?;
    }

    if let Some(path) = args.value_of("resource_rules") {
        settings.set_resource_rules_xml(&std::fs::read(path)?)?;
    }

    settings.set_detached(args.is_present("detached"));
    settings.set_dry_run(args.is_present("dry_run"));
    settings.set_top_directory(args.is_present("top_directory"));
    settings.set_seal_v1(args.is_present("seal_v1"));
    settings.set_single_threaded(args.is_present("single_threaded"));

    for (scope, identifier) in scoped_values(args, "binary_identifier")? {
        settings.set_binary_identifier(scope, identifier);
    }

    for (scope, team_id) in scoped_values(args, "team_id")? {
        settings.set_team_id(scope, team_id);
    }

    for (scope, path) in scoped_values(args, "code_requirements_path")? {
        let data = std::fs::read(path)?;
        let reqs = CodeRequirements::parse_blob(&data)?.0;
        for expr in reqs.iter() {
            warn!("setting designated code requirements for {}: {}", scope, expr);
        }
        settings.set_requirements(scope, RequirementsSource::Blob(data))?;
    }

    for (scope, text) in scoped_values(args, "requirement")? {
        warn!("setting designated code requirements for {}: {}", scope, text);
        settings.set_requirements(scope, RequirementsSource::Text(text.to_string()))?;
    }

    for (scope, path) in scoped_values(args, "code_resources")? {
        warn!("setting code resources data for {} from path {}", scope, path);
        settings.set_code_resources_data(scope, std::fs::read(path)?);
    }

    for (scope, value) in scoped_values(args, "code_signature_flags_set")? {
        let flags = CodeSignatureFlags::from_str(value)?;
        settings.set_code_signature_flags(scope, flags);
    }

    for (scope, path) in scoped_values(args, "entitlements_xml_path")? {
        warn!("setting entitlements XML for {} from path {}", scope, path);
        settings.set_entitlements_xml(scope, std::fs::read_to_string(path)?)?;
    }

    for (scope, value) in scoped_values(args, "runtime_version")? {
        settings.set_runtime_version(scope, semver::Version::parse(value)?);
    }

    for (scope, path) in scoped_values(args, "info_plist_path")? {
        settings.set_info_plist_data(scope, std::fs::read(path)?);
    }

    let input_path = PathBuf::from(
        args.value_of("input_path")
            .ok_or_else(|| anyhow!("input path is required"))?,
    );

    let signer = Signer::new(settings);

    if let Some(output_path) = args.value_of("output_path") {
        warn!("signing {} to {}", input_path.display(), output_path);
        signer.sign_path(&input_path, output_path)?;
    } else {
        warn!("signing {} in place", input_path.display());
        signer.sign_path_in_place(&input_path)?;
    }

    Ok(())
}

fn command_verify(args: &ArgMatches) -> Result<()> {
    let path = args
        .value_of("path")
        .ok_or_else(|| anyhow!("path is required"))?;

    let mut trust = ValidityTrustEvaluator::default();
    for anchor in args.values_of("anchor_pem").into_iter().flatten() {
        for cert in read_certificates(anchor)? {
            trust = trust.with_anchor(cert);
        }
    }

    let mut code = StaticCode::open(path)?.with_trust_evaluator(Arc::new(trust));

    if let Some(detached) = args.value_of("detached_signature") {
        code.attach_detached_signature(std::fs::read(detached)?);
    }

    let flags = ValidationFlags {
        check_executable: !args.is_present("no_executable"),
        check_resources: !args.is_present("no_resources"),
        strict: args.is_present("strict"),
        check_top_directory: args.is_present("strict"),
        allow_expired: args.is_present("allow_expired"),
        no_network: args.is_present("no_network"),
        single_threaded: args.is_present("single_threaded"),
        all_architectures: args.is_present("all_architectures"),
        legacy_sc_info_tolerance: args.is_present("legacy_sc_info"),
        ..Default::default()
    };

    let requirement = match args.value_of("requirement") {
        Some(text) => Some(parse_requirement_expression(text)?),
        None => None,
    };

    let report = match code.validate(&flags, requirement.as_ref()) {
        Ok(report) => report,
        Err(e) => {
            for problem in e.resource_problems() {
                println!("{}: {}", problem.kind, problem.path);
            }
            return Err(e.into());
        }
    };

    println!("identifier: {}", report.identifier);
    println!(
        "team: {}",
        report.team_id.as_deref().unwrap_or("not set")
    );
    println!("flags: {:?}", report.flags);
    for (digest, cdhash) in &report.cd_hashes {
        println!("cdhash {}: {}", digest, hex::encode(cdhash));
    }
    if let Some(time) = report.signing_time {
        println!("signed: {}", time);
    }
    for arch in &report.architectures {
        for (i, subject) in arch.certificates.iter().enumerate() {
            println!("authority {}: {}", i, subject);
        }
    }
    if let Some(resources) = report.resources {
        println!(
            "resources: {} sealed; {} nested",
            resources.sealed, resources.nested
        );
    }
    println!("designated => {}", code.designated_requirement(&flags)?);

    info!("{} is valid", report.path.display());

    Ok(())
}

fn command_remove_signature(args: &ArgMatches) -> Result<()> {
    let path = args
        .value_of("path")
        .ok_or_else(|| anyhow!("path is required"))?;

    warn!("removing signature from {}", path);
    remove_signature(path)?;

    Ok(())
}

fn command_allocate(args: &ArgMatches) -> Result<()> {
    let input = PathBuf::from(
        args.value_of("input_path")
            .ok_or_else(|| anyhow!("input path is required"))?,
    );
    let output = args
        .value_of("output_path")
        .map(PathBuf::from)
        .unwrap_or_else(|| input.clone());

    let default_size = u32::from_str(args.value_of("size").unwrap_or("0"))?;

    let mut sizes = vec![];
    for value in args.values_of("arch_size").into_iter().flatten() {
        let (cputype, size) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("expected <cputype>:<size>; got {}", value))?;
        sizes.push((u32::from_str(cputype)?, u32::from_str(size)?));
    }

    macho_allocate::allocate(&input, &output, |cputype, _| {
        sizes
            .iter()
            .find(|(c, _)| *c == cputype)
            .map(|(_, size)| *size)
            .unwrap_or(default_size)
    })?;

    Ok(())
}

fn command_print_signature(args: &ArgMatches) -> Result<()> {
    let path = args
        .value_of("path")
        .ok_or_else(|| anyhow!("path is required"))?;

    let entities = SignatureReader::from_path(path)?.entities()?;
    serde_json::to_writer_pretty(std::io::stdout(), &entities)?;
    println!();

    Ok(())
}

fn command_parse_requirement(args: &ArgMatches) -> Result<()> {
    if let Some(text) = args.value_of("text") {
        let requirements = parse_requirements(text)?;
        println!("{}", requirements);

        if let Some(output) = args.value_of("output_path") {
            std::fs::write(output, requirements.to_blob_data()?)?;
        }
    } else if let Some(path) = args.value_of("path") {
        let data = std::fs::read(path)?;
        let requirements = CodeRequirements::parse_blob(&data)?.0;

        for expr in requirements.iter() {
            println!("{}", expr);
        }
    }

    Ok(())
}

fn scoped_arg(name: &'static str, long: &'static str, help: &'static str) -> Arg<'static> {
    Arg::new(name)
        .long(long)
        .takes_value(true)
        .multiple_occurrences(true)
        .number_of_values(1)
        .help(help)
}

fn main_impl() -> Result<()> {
    let app = Command::new("Apple code signatures in pure Rust")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign and validate Apple code signatures")
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
        Command::new("sign")
            .about("Sign a Mach-O binary or bundle")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("pem_source")
                    .long("pem-source")
                    .takes_value(true)
                    .help("Path to PEM data holding the signing key and certificates"),
            )
            .arg(
                Arg::new("timestamp_url")
                    .long("timestamp-url")
                    .takes_value(true)
                    .requires("pem_source")
                    .help("URL of an RFC 3161 server to obtain a signed time-stamp from"),
            )
            .arg(scoped_arg(
                "binary_identifier",
                "identifier",
                "Identifier string for binary. The value normally used by CFBundleIdentifier",
            ))
            .arg(
                Arg::new("identifier_prefix")
                    .long("identifier-prefix")
                    .takes_value(true)
                    .help("Prefix for identifiers derived from file names"),
            )
            .arg(scoped_arg(
                "team_id",
                "team-id",
                "Team identifier to include in code signature",
            ))
            .arg(
                Arg::new("digest")
                    .long("digest")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .possible_values(SUPPORTED_HASHES)
                    .help("Digest algorithm to use. Repeat to add code directories"),
            )
            .arg(
                Arg::new("page_size")
                    .long("page-size")
                    .takes_value(true)
                    .help("Code page size in bytes. A power of two, or 0 for unpaged"),
            )
            .arg(scoped_arg(
                "entitlements_xml_path",
                "entitlements-xml-path",
                "Path to a plist file containing entitlements",
            ))
            .arg(scoped_arg(
                "code_requirements_path",
                "code-requirements-path",
                "Path to a file containing binary code requirements data",
            ))
            .arg(scoped_arg(
                "requirement",
                "requirement",
                "Designated requirement in requirement language text",
            ))
            .arg(scoped_arg(
                "code_resources",
                "code-resources-path",
                "Path to an XML plist file containing code resources",
            ))
            .arg(
                scoped_arg(
                    "code_signature_flags_set",
                    "code-signature-flags",
                    "Code signature flags to set",
                ),
            )
            .arg(scoped_arg(
                "runtime_version",
                "runtime-version",
                "Hardened runtime version to use",
            ))
            .arg(scoped_arg(
                "info_plist_path",
                "info-plist-path",
                "Path to an Info.plist file whose digest to include in Mach-O signature",
            ))
            .arg(
                Arg::new("resource_rules")
                    .long("resource-rules")
                    .takes_value(true)
                    .help("Path to an XML plist with resource rules to seal bundles with"),
            )
            .arg(
                Arg::new("detached")
                    .long("detached")
                    .help("Write a detached signature to the output path"),
            )
            .arg(
                Arg::new("dry_run")
                    .long("dry-run")
                    .help("Compute signatures without writing anything"),
            )
            .arg(
                Arg::new("top_directory")
                    .long("top-directory")
                    .help("Record an index of signature slots"),
            )
            .arg(
                Arg::new("seal_v1")
                    .long("seal-v1")
                    .help("Also write version 1 resource seals"),
            )
            .arg(
                Arg::new("single_threaded")
                    .long("single-threaded")
                    .help("Digest resources on one thread"),
            )
            .arg(
                Arg::new("input_path")
                    .required(true)
                    .help("Path to Mach-O binary or bundle to sign"),
            )
            .arg(Arg::new("output_path").help("Path to write signed content to")),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Validate signed code")
            .long_about(VERIFY_ABOUT)
            .arg(
                Arg::new("anchor_pem")
                    .long("anchor-pem")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Path to PEM certificates to trust as anchors"),
            )
            .arg(
                Arg::new("detached_signature")
                    .long("detached-signature")
                    .takes_value(true)
                    .help("Path to a detached signature to validate against"),
            )
            .arg(
                Arg::new("requirement")
                    .long("requirement")
                    .short('R')
                    .takes_value(true)
                    .help("Requirement the code must satisfy"),
            )
            .arg(
                Arg::new("strict")
                    .long("strict")
                    .help("Reject weak resource rules and obsolete resource envelopes"),
            )
            .arg(
                Arg::new("no_network")
                    .long("no-network")
                    .help("Do not access the network during trust evaluation"),
            )
            .arg(
                Arg::new("allow_expired")
                    .long("allow-expired")
                    .help("Accept expired certificates"),
            )
            .arg(
                Arg::new("all_architectures")
                    .long("all-architectures")
                    .help("Validate every slice of universal binaries"),
            )
            .arg(
                Arg::new("no_executable")
                    .long("no-executable")
                    .help("Do not re-hash executable pages"),
            )
            .arg(
                Arg::new("no_resources")
                    .long("no-resources")
                    .help("Do not validate bundle resources"),
            )
            .arg(
                Arg::new("single_threaded")
                    .long("single-threaded")
                    .help("Validate resources on one thread"),
            )
            .arg(
                Arg::new("legacy_sc_info")
                    .long("legacy-sc-info")
                    .help("Ignore problems with legacy SC_Info store metadata"),
            )
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path of Mach-O binary or bundle to validate"),
            ),
    );

    let app = app.subcommand(
        Command::new("remove-signature")
            .about("Remove the signature from a Mach-O binary or bundle")
            .arg(Arg::new("path").required(true).help("Path to unsign in place")),
    );

    let app = app.subcommand(
        Command::new("allocate")
            .about("Reserve signature space in a Mach-O binary")
            .long_about(ALLOCATE_ABOUT)
            .arg(
                Arg::new("size")
                    .long("size")
                    .takes_value(true)
                    .default_value("0")
                    .help("Bytes to reserve in every slice"),
            )
            .arg(
                Arg::new("arch_size")
                    .long("arch-size")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Bytes to reserve for one CPU type, as <cputype>:<size>"),
            )
            .arg(
                Arg::new("input_path")
                    .required(true)
                    .help("Path to Mach-O binary"),
            )
            .arg(Arg::new("output_path").help("Path to write to. Defaults to the input")),
    );

    let app = app.subcommand(
        Command::new("print-signature")
            .about("Print signature data of a binary, bundle or detached signature")
            .arg(Arg::new("path").required(true).help("Path to examine")),
    );

    let app = app.subcommand(
        Command::new("parse-requirement")
            .about("Parse code requirements in text or binary form")
            .arg(
                Arg::new("text")
                    .long("text")
                    .takes_value(true)
                    .conflicts_with("path")
                    .help("Requirement language text"),
            )
            .arg(
                Arg::new("output_path")
                    .long("output")
                    .takes_value(true)
                    .requires("text")
                    .help("Write the compiled requirement set here"),
            )
            .arg(
                Arg::new("path")
                    .required_unless_present("text")
                    .help("Path to binary requirements data"),
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
        Some(("allocate", args)) => command_allocate(args),
        Some(("parse-requirement", args)) => command_parse_requirement(args),
        Some(("print-signature", args)) => command_print_signature(args),
        Some(("remove-signature", args)) => command_remove_signature(args),
        Some(("sign", args)) => command_sign(args),
        Some(("verify", args)) => command_verify(args),
        _ => Err(anyhow!("unknown command")),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
