//! Command-line interface for xmlguard

#[cfg(feature = "cli")]
use clap::{Args, Parser, Subcommand};

#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
use xmlguard::{Feature, SecureConfiguration, SecureReader};

#[cfg(feature = "cli")]
#[derive(Parser, Debug)]
#[command(name = "xmlguard")]
#[command(author, version, about = "XML resource-limit checker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Force secure processing on
    #[arg(long, conflicts_with = "no_secure")]
    secure: bool,

    /// Turn secure processing off
    #[arg(long)]
    no_secure: bool,

    /// Set a limit or access list, e.g. jdk.xml.entityExpansionLimit=1000
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    properties: Vec<(String, String)>,

    /// Set a feature, e.g. http://apache.org/xml/features/disallow-doctype-decl=false
    #[arg(long = "feature", value_name = "KEY=BOOL", value_parser = parse_key_val)]
    features: Vec<(String, String)>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a document against the effective limits
    Check {
        /// Path to the XML file to check
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,

        /// Output the report as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the effective limits and where they come from
    Limits {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

#[cfg(feature = "cli")]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check { file, config, json } => cmd_check(file, config, json),
        Commands::Limits { config, json } => cmd_limits(config, json),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(feature = "cli")]
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

#[cfg(feature = "cli")]
fn build_config(args: ConfigArgs) -> Result<SecureConfiguration, Box<dyn std::error::Error>> {
    let mut config = SecureConfiguration::new()?;

    if args.no_secure {
        config.set_feature(Feature::SecureProcessing.uri(), false)?;
    } else if args.secure {
        config.set_feature(Feature::SecureProcessing.uri(), true)?;
    }

    for (key, value) in args.features {
        let enabled = match value.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => return Err(format!("feature {} needs true or false, got '{}'", key, value).into()),
        };
        config.set_feature(&key, enabled)?;
    }

    for (key, value) in args.properties {
        config.set_property(&key, value)?;
    }

    Ok(config)
}

#[cfg(feature = "cli")]
fn cmd_check(file: PathBuf, args: ConfigArgs, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = build_config(args)?;
    let report = SecureReader::new(&mut config).check_file(&file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("✓ {}: within limits", file.display());
        println!("  Elements: {} (max depth {})", report.elements, report.max_depth);
        println!("  Entity expansions: {}", report.entity_expansions);
        println!("  Entity text: {}", report.entity_text);
        if report.skipped_external {
            println!("  External DTD content was not loaded");
        }
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn cmd_limits(args: ConfigArgs, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(args)?;
    let settings = config.effective_settings();

    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    println!("xmlguard v{}", xmlguard::VERSION);
    println!();
    for entry in &settings {
        let value = match &entry.value {
            xmlguard::PropertyValue::Int(n) if *n == xmlguard::UNLIMITED => "unlimited".to_string(),
            xmlguard::PropertyValue::Str(s) if s.is_empty() => "(none)".to_string(),
            other => other.to_string(),
        };
        println!("  {:<64} {:<12} {}", entry.name, value, entry.source);
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Rebuild with --features cli");
    std::process::exit(1);
}
