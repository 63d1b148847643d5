//! `tcfaudit` command line.
//!
//! ## Commands
//!
//! - `run`: audit every domain in a list, resuming from the checkpoint
//! - `generate-ca`: write a fresh CA certificate and key for the proxy

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tcfaudit::batch::{read_domains, BatchOrchestrator, CsvReport, FileCheckpoint};
use tcfaudit::browser::ChromeBrowser;
use tcfaudit::config::AuditConfig;
use tcfaudit::consent::{ConsentPolicy, ConsentRecordBuilder};
use tcfaudit::proxy::CertificateAuthority;
use tcfaudit::runner::ComplianceRunner;
use tcfaudit::telemetry::init_tracing;
use tracing::{info, Level};

const CA_COMMON_NAME: &str = "tcfaudit interception CA";

#[derive(Parser)]
#[command(name = "tcfaudit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "TCF consent injection and third-party cookie capture", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Audit every domain in the list
    Run(RunArgs),

    /// Write a new CA certificate and private key (PEM)
    GenerateCa {
        #[arg(long, default_value = "tcfaudit-ca.pem")]
        cert: PathBuf,

        #[arg(long, default_value = "tcfaudit-ca.key")]
        key: PathBuf,

        #[arg(long, default_value = CA_COMMON_NAME)]
        common_name: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    DenyAll,
    GrantPurposes,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Domain list, one domain per line
    #[arg(long, env = "TCFAUDIT_DOMAINS", default_value = "domains.csv")]
    domains: PathBuf,

    /// Report file (appended to)
    #[arg(long, env = "TCFAUDIT_OUTPUT", default_value = "output.csv")]
    output: PathBuf,

    /// Checkpoint file
    #[arg(long, env = "TCFAUDIT_CHECKPOINT", default_value = "progress.txt")]
    checkpoint: PathBuf,

    /// Proxy listen address
    #[arg(long, env = "TCFAUDIT_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Consent decision to inject
    #[arg(long, value_enum, default_value = "grant-purposes")]
    policy: PolicyArg,

    /// Last consented purpose for `grant-purposes` (1-24)
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(1..=24))]
    last_purpose: u8,

    /// Highest consented vendor id for `grant-purposes`
    #[arg(long, default_value_t = 1200)]
    max_vendor_id: u16,

    /// Chrome executable
    #[arg(long, env = "TCFAUDIT_CHROME", default_value = "google-chrome")]
    chrome: PathBuf,

    /// Attach to a running browser's DevTools endpoint (http://host:port)
    #[arg(long, env = "TCFAUDIT_ATTACH")]
    attach: Option<String>,

    #[arg(long)]
    headless: bool,

    /// Chrome profile directory
    #[arg(long)]
    user_data_dir: Option<PathBuf>,

    /// CA certificate (PEM); a throwaway CA is generated when omitted
    #[arg(long, env = "TCFAUDIT_CA_CERT", requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// CA private key (PEM)
    #[arg(long, env = "TCFAUDIT_CA_KEY", requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Verify origin certificates on the proxy's outbound leg
    #[arg(long)]
    verify_upstream: bool,

    /// Per-domain deadline in seconds
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,

    /// Consent API readiness timeout in seconds
    #[arg(long, default_value_t = 10)]
    api_timeout: u64,
}

impl RunArgs {
    fn into_config(self) -> (AuditConfig, Option<(PathBuf, PathBuf)>) {
        let mut config = AuditConfig::default();
        config.paths.domains = self.domains;
        config.paths.output = self.output;
        config.paths.checkpoint = self.checkpoint;
        config.proxy.listen_addr = self.listen;
        config.proxy.verify_upstream = self.verify_upstream;
        config.policy = match self.policy {
            PolicyArg::DenyAll => ConsentPolicy::DenyAll,
            PolicyArg::GrantPurposes => ConsentPolicy::GrantPurposes {
                last_purpose: self.last_purpose,
                max_vendor_id: self.max_vendor_id,
            },
        };
        config.browser.executable = self.chrome;
        config.browser.attach_to = self.attach;
        config.browser.headless = self.headless;
        config.browser.user_data_dir = self.user_data_dir;
        config.session.deadline = Duration::from_secs(self.session_timeout);
        config.session.readiness.timeout = Duration::from_secs(self.api_timeout);
        let ca = self.ca_cert.zip(self.ca_key);
        (config, ca)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::GenerateCa {
            cert,
            key,
            common_name,
        } => cmd_generate_ca(&cert, &key, &common_name),
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let (config, ca_paths) = args.into_config();
    config.policy.validate().context("Invalid consent policy")?;

    let domains = read_domains(&config.paths.domains)
        .with_context(|| format!("Failed to read {}", config.paths.domains.display()))?;
    let report = CsvReport::open(&config.paths.output)
        .with_context(|| format!("Failed to open {}", config.paths.output.display()))?;

    let ca = match ca_paths {
        Some((cert, key)) => CertificateAuthority::load(&cert, &key)
            .with_context(|| format!("Failed to load CA from {}", cert.display()))?,
        None => {
            info!("no CA given, generating a throwaway one");
            CertificateAuthority::generate(CA_COMMON_NAME).context("Failed to generate CA")?
        }
    };

    let browser = ChromeBrowser::start(&config.browser, config.proxy.listen_addr)
        .await
        .context("Failed to start browser")?;

    info!(
        domains = domains.len(),
        policy = config.policy.name(),
        proxy = %config.proxy.listen_addr,
        "starting batch"
    );

    let runner = ComplianceRunner::new(
        browser,
        ConsentRecordBuilder::new(config.policy),
        config.proxy.clone(),
        config.session.clone(),
        Some(Arc::new(ca)),
    );
    let mut batch = BatchOrchestrator::new(
        runner,
        FileCheckpoint::new(&config.paths.checkpoint),
        report,
    );
    let result = batch.run(&domains).await;

    let (runner, _, _) = batch.into_parts();
    runner.into_pages().shutdown().await;

    let summary = result.context("Batch aborted")?;
    info!(
        processed = summary.processed,
        failed = summary.failed,
        rows = summary.rows_written,
        resumed_from = summary.resumed_from,
        "done"
    );
    Ok(())
}

fn cmd_generate_ca(cert: &Path, key: &Path, common_name: &str) -> Result<()> {
    let ca = CertificateAuthority::generate(common_name).context("Failed to generate CA")?;
    ca.write_pem(cert, key)
        .with_context(|| format!("Failed to write {} / {}", cert.display(), key.display()))?;
    println!("CA certificate: {}", cert.display());
    println!("CA private key: {}", key.display());
    Ok(())
}
