use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use keyguard_server::keys::{generate_credential, hash_credential, ApiKeyRecord};
use keyguard_server::ApiKeyPolicy;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "keyguardd",
    about = "Keyguardd — API key policy guard daemon",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Keyguard HTTP server
    Serve {
        /// Port to listen on (default: $KEYGUARD_PORT or 8080)
        #[arg(long, env = "KEYGUARD_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $KEYGUARD_HOST or 0.0.0.0)
        #[arg(long, env = "KEYGUARD_HOST", default_value = "0.0.0.0")]
        host: String,
        /// JSON file of issued keys (default: $KEYGUARD_KEYS_FILE)
        #[arg(long, env = "KEYGUARD_KEYS_FILE")]
        keys_file: PathBuf,
        /// Log level: error, warn, info, debug, verbose (default: $KEYGUARD_LOG_LEVEL or warn)
        #[arg(long, env = "KEYGUARD_LOG_LEVEL")]
        log_level: Option<String>,
    },
    /// Issue a new key. Prints the credential once on stderr and the record
    /// to append to the keys file on stdout.
    Keygen {
        /// Identifier shown in logs
        #[arg(long)]
        id: String,
        /// Restrict the key to this forwarded host
        #[arg(long, default_value = "")]
        fqdn: String,
        /// Allowed origin range in CIDR notation (repeatable)
        #[arg(long = "ip")]
        ips: Vec<String>,
        /// Lifetime, e.g. "30d" or "12h" (default: never expires)
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw_level = match &cli.command {
        Commands::Serve { log_level, .. } => log_level.clone(),
        Commands::Keygen { .. } => None,
    }
    .or_else(|| std::env::var("KEYGUARD_LOG_LEVEL").ok())
    .unwrap_or_else(|| "warn".into());

    let effective_log_level = if raw_level.eq_ignore_ascii_case("verbose") {
        "debug".to_owned()
    } else {
        raw_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            keys_file,
            log_level: _,
        } => cmd_serve(host, port, keys_file).await,

        Commands::Keygen { id, fqdn, ips, ttl } => cmd_keygen(id, fqdn, ips, ttl),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, keys_file: PathBuf) -> Result<()> {
    let cfg = keyguard_server::ServerConfig {
        host,
        port,
        keys_file: Some(keys_file),
        ..Default::default()
    };

    keyguard_server::run(cfg).await
}

fn cmd_keygen(id: String, fqdn: String, ips: Vec<String>, ttl: Option<Duration>) -> Result<()> {
    for ip in &ips {
        ip.parse::<IpNet>()
            .with_context(|| format!("invalid CIDR range {ip:?}"))?;
    }

    let expires_at = ttl
        .map(|d| -> Result<i64> {
            let secs = i64::try_from(d.as_secs()).context("ttl too large")?;
            keyguard_server::policy::unix_now()
                .checked_add(secs)
                .context("ttl too large")
        })
        .transpose()?;

    let credential = generate_credential();
    let record = ApiKeyRecord {
        id,
        key_sha256: hash_credential(&credential),
        policy: ApiKeyPolicy {
            allowed_fqdn: fqdn,
            allowed_ips: ips,
            expires_at,
        },
    };

    eprintln!("api key (shown once): {credential}");
    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("encode key record")?
    );
    Ok(())
}
