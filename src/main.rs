//! VPN PKI command line
//!
//! ```bash
//! # bootstrap a PKI (skip if EasyRSA already built one)
//! vpn-pki init-ca --common-name "Acme VPN CA" --organization Acme --country US
//!
//! # issue and download
//! vpn-pki issue office alice --passphrase-env ALICE_PASS
//! vpn-pki ovpn office alice --out alice.ovpn
//! vpn-pki list
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

use vpn_pki::ca_context::CaContext;
use vpn_pki::cert_store;
use vpn_pki::configs::AppConfig;
use vpn_pki::error::PkiError;
use vpn_pki::generate_root_ca::{init_pki_dir, RsaRootCABuilder};
use vpn_pki::issuance::IssuanceService;
use vpn_pki::ovpn;

#[derive(Parser)]
#[command(name = "vpn-pki", version, about = "Issue OpenVPN client certificates")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new PKI directory with a self-signed CA
    InitCa {
        #[arg(long)]
        common_name: String,
        #[arg(long, default_value = "")]
        organization: String,
        #[arg(long, default_value = "")]
        organizational_unit: String,
        #[arg(long, default_value = "")]
        locality: String,
        #[arg(long, default_value = "")]
        state: String,
        #[arg(long, default_value = "")]
        country: String,
        #[arg(long, default_value_t = 3650)]
        days: u32,
        #[arg(long, default_value_t = 4096)]
        key_size: u32,
        /// Generate fresh DH parameters of this size instead of the RFC 5114 group
        #[arg(long)]
        dh_bits: Option<u32>,
    },
    /// Issue a client certificate and store it in the PKI
    Issue {
        endpoint: String,
        name: String,
        /// Environment variable holding the private key passphrase
        #[arg(long)]
        passphrase_env: Option<String>,
    },
    /// List issued certificates
    List,
    /// Render the .ovpn config for a previously issued certificate
    Ovpn {
        endpoint: String,
        name: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remove a leftover index lock
    Unlock,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            exit_code(&e)
        }
    }
}

/// 2 for "try again" conditions, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<PkiError>().map(PkiError::status_code) {
        Some(409) | Some(423) | Some(400) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::from_file(&cli.config)?;
    let paths = config.pki.paths();

    match cli.command {
        Commands::InitCa {
            common_name,
            organization,
            organizational_unit,
            locality,
            state,
            country,
            days,
            key_size,
            dh_bits,
        } => {
            let builder = RsaRootCABuilder::new()
                .subject_common_name(common_name)
                .organization(organization)
                .organizational_unit(organizational_unit)
                .locality(locality)
                .state(state)
                .country(country)
                .validity_days(days)
                .key_size(key_size);
            let passphrase = config.pki.ca_passphrase()?;
            init_pki_dir(&paths, builder, passphrase.as_deref(), dh_bits)
                .context("Failed to initialize PKI")?;
            println!("✓ PKI initialized at {}", paths.path.display());
        }
        Commands::Issue {
            endpoint,
            name,
            passphrase_env,
        } => {
            config.check_files()?;
            let endpoint = config.endpoint(&endpoint)?;
            let passphrase = match passphrase_env {
                Some(var) => Some(
                    std::env::var(&var).context(format!("Variable {} is not set", var))?,
                ),
                None => None,
            };

            let ca = CaContext::load(&paths, config.pki.ca_passphrase()?.as_deref())?;
            let service = IssuanceService::new(&paths).with_lock_lease(config.pki.lock_lease());
            let bundle = service
                .issue(&ca, &endpoint.profile(), &name, passphrase.as_deref())
                .await?;
            let written = cert_store::write_bundle(&paths.path, &name, &bundle).await?;

            println!("✓ Issued certificate for {} (serial {:02})", name, bundle.serial);
            println!("  key:  {}", written.private_key.display());
            println!("  cert: {}", written.certificate.display());
        }
        Commands::List => {
            let service = IssuanceService::new(&paths);
            for record in service.list().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.state,
                    record.expires.format("%Y-%m-%d %H:%M:%S UTC"),
                    record.serial_text,
                    record.name
                );
            }
        }
        Commands::Ovpn {
            endpoint,
            name,
            out,
        } => {
            let endpoint = config.endpoint(&endpoint)?;
            let template_path = endpoint
                .ovpn_template
                .as_ref()
                .context(format!("Endpoint {} has no ovpn_template", endpoint.name))?;
            let template = tokio::fs::read_to_string(template_path)
                .await
                .context(format!("Failed to read template {}", template_path.display()))?;

            let credentials = cert_store::load_credentials(&paths, &name).await?;
            let rendered = ovpn::render(&template, &credentials);

            let out = out.unwrap_or_else(|| {
                PathBuf::from(ovpn::file_name(&name, endpoint.suffix.as_deref()))
            });
            ovpn::write_config(&out, &rendered).await?;
            println!("✓ Client config written to {}", out.display());
        }
        Commands::Unlock => {
            let service = IssuanceService::new(&paths);
            match service.lock().holder().await? {
                Some(acquired_at) => {
                    service.lock().release().await?;
                    println!("✓ Removed lock taken at {}", acquired_at.to_rfc3339());
                }
                None => println!("Index is not locked"),
            }
        }
    }

    Ok(())
}
