// txrelay: command-line front end for the disconnected transaction relay
//
// Key generation, QR page encoding/decoding, and a loopback simulation of a
// wallet paying a merchant over a lossy BLE link.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use txrelay_core::clock::{Clock, SystemClock};
use txrelay_core::codec::SessionId;
use txrelay_core::crypto::{generate_ephemeral_key_pair, SharedKey, StaticKeyPair};
use txrelay_core::relay::{
    EnvelopeMetadata, Progress, StaticIdentityResolver, TransactionEnvelope, TransactionRelay,
};
use txrelay_core::transport::ble::{DeviceId, LoopbackRadio};
use txrelay_core::transport::qr::{build_qr_pages, QrScanCollector};

#[derive(Parser)]
#[command(name = "txrelay")]
#[command(about = "Offline transaction relay over BLE and QR", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a static X25519 key pair for a receiving device
    Keygen,
    /// Encode or decode QR pages
    Qr {
        #[command(subcommand)]
        action: QrAction,
    },
    /// Run a wallet → merchant transfer over a simulated radio
    Simulate {
        /// Transaction payload size in bytes
        #[arg(short, long, default_value = "4096")]
        size: usize,
        /// Drop every Nth packet on the link (0 = lossless)
        #[arg(short, long, default_value = "0")]
        drop_every: u64,
        /// ACK timeout used for the run, in milliseconds
        #[arg(long, default_value = "200")]
        ack_timeout_ms: u64,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QrAction {
    /// Split a signed transaction file into QR page strings (one per line)
    Encode {
        file: PathBuf,
        /// Sender secret key (hex); a fresh ephemeral key is used when omitted
        #[arg(long)]
        key_hex: Option<String>,
        /// Receiver public key (hex); pages are unencrypted when omitted
        #[arg(long)]
        peer_hex: Option<String>,
    },
    /// Reassemble a transaction from a file of scanned pages
    Decode {
        pages_file: PathBuf,
        /// Receiver secret key (hex)
        #[arg(long)]
        key_hex: Option<String>,
        /// Sender public key printed by `qr encode` (hex)
        #[arg(long)]
        peer_hex: Option<String>,
        /// Write the payload here instead of printing it as hex
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(config.log_dir.as_deref());

    match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Qr { action } => cmd_qr(action, &config),
        Commands::Simulate {
            size,
            drop_every,
            ack_timeout_ms,
        } => cmd_simulate(size, drop_every, ack_timeout_ms, &config).await,
        Commands::Config { action } => cmd_config(action, config),
    }
}

/// Stderr logging (default `warn`), plus a daily log file when `log_dir` is set
fn init_logging(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "txrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn cmd_keygen() -> Result<()> {
    let pair = StaticKeyPair::generate();

    println!("{}", "New receiver key pair".bold());
    println!("  Public key: {}", pair.public_key_hex().bright_yellow());
    println!("  Secret key: {}", pair.secret_hex().bright_red());
    println!();
    println!(
        "{}",
        "Share the public key with senders. Keep the secret key on this device.".dimmed()
    );
    Ok(())
}

fn parse_public_hex(value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim()).context("Public key is not valid hex")
}

fn cmd_qr(action: QrAction, config: &config::Config) -> Result<()> {
    match action {
        QrAction::Encode {
            file,
            key_hex,
            peer_hex,
        } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let bytes = TransactionEnvelope::new(payload)
                .to_bytes()
                .context("Failed to encode envelope")?;

            let key = match (key_hex, peer_hex) {
                (_, None) => None,
                (Some(secret), Some(peer)) => {
                    let pair = StaticKeyPair::from_secret_hex(&secret)
                        .context("Invalid sender secret key")?;
                    let key = pair
                        .derive_shared_key(&parse_public_hex(&peer)?)
                        .context("Key agreement failed")?;
                    eprintln!("{} Sender key: {}", "•".cyan(), pair.public_key_hex());
                    Some(key)
                }
                (None, Some(peer)) => {
                    let ephemeral = generate_ephemeral_key_pair();
                    let public = hex::encode(ephemeral.public_key_raw());
                    let key = ephemeral
                        .derive_shared_key(&parse_public_hex(&peer)?)
                        .context("Key agreement failed")?;
                    eprintln!("{} Sender key: {}", "•".cyan(), public.bright_yellow());
                    Some(key)
                }
            };

            let session_id = SessionId::new_random();
            let pages = build_qr_pages(
                session_id,
                &bytes,
                key.as_ref(),
                config.relay.qr_page_payload_size,
            )
            .context("Failed to build QR pages")?;

            for page in &pages {
                println!("{}", page);
            }
            eprintln!(
                "{} Session {}: {} pages{}",
                "✓".green(),
                session_id.short(),
                pages.len(),
                if key.is_some() { " (encrypted)" } else { "" }
            );
        }

        QrAction::Decode {
            pages_file,
            key_hex,
            peer_hex,
            out,
        } => {
            let contents = std::fs::read_to_string(&pages_file)
                .with_context(|| format!("Failed to read {}", pages_file.display()))?;

            let key: Option<SharedKey> = match (key_hex, peer_hex) {
                (None, None) => None,
                (Some(secret), Some(peer)) => {
                    let pair = StaticKeyPair::from_secret_hex(&secret)
                        .context("Invalid receiver secret key")?;
                    Some(
                        pair.derive_shared_key(&parse_public_hex(&peer)?)
                            .context("Key agreement failed")?,
                    )
                }
                _ => anyhow::bail!("--key-hex and --peer-hex must be given together"),
            };

            let mut collector = QrScanCollector::new();
            for (line_no, page) in contents.lines().enumerate() {
                if page.trim().is_empty() {
                    continue;
                }
                let progress = collector
                    .push(page)
                    .with_context(|| format!("Line {}", line_no + 1))?;
                if !progress.new_page {
                    eprintln!("{} Line {}: page already scanned", "•".dimmed(), line_no + 1);
                }
            }

            let progress = collector.progress();
            eprintln!(
                "{} Scanned {}/{} pages",
                "•".cyan(),
                progress.received,
                progress.total
            );
            let bytes = collector
                .finish(key.as_ref())
                .context("Failed to reassemble pages")?;
            let envelope =
                TransactionEnvelope::from_bytes(&bytes).context("Pages do not hold an envelope")?;

            match out {
                Some(path) => {
                    std::fs::write(&path, &envelope.payload)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    eprintln!(
                        "{} Wrote {} bytes to {}",
                        "✓".green(),
                        envelope.payload.len(),
                        path.display()
                    );
                }
                None => println!("{}", hex::encode(&envelope.payload)),
            }
        }
    }

    Ok(())
}

async fn cmd_simulate(
    size: usize,
    drop_every: u64,
    ack_timeout_ms: u64,
    config: &config::Config,
) -> Result<()> {
    let relay_config = txrelay_core::config::RelayConfig {
        ack_timeout_ms,
        ..config.relay.clone()
    };
    relay_config.validate().context("Invalid simulation settings")?;

    println!("{}", "Simulating wallet → merchant transfer".bold());
    println!(
        "  Payload: {} bytes, loss: {}",
        size,
        if drop_every == 0 {
            "none".to_string()
        } else {
            format!("every {} packets", drop_every)
        }
    );
    println!();

    let radio = LoopbackRadio::new();
    if drop_every > 0 {
        let mut seen: u64 = 0;
        radio.set_filter(move |_, _, _| {
            seen += 1;
            seen % drop_every != 0
        });
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let merchant_identity = StaticKeyPair::generate();
    let resolver = StaticIdentityResolver::new()
        .with_peer("merchant", merchant_identity.public_key_raw());

    let merchant = TransactionRelay::new(
        relay_config.clone(),
        Arc::new(radio.attach("merchant", "Merchant")),
        Arc::new(StaticIdentityResolver::new()),
        merchant_identity,
        clock.clone(),
    )
    .context("Failed to build merchant relay")?;
    let wallet = TransactionRelay::new(
        relay_config,
        Arc::new(radio.attach("wallet", "Wallet")),
        Arc::new(resolver),
        StaticKeyPair::generate(),
        clock,
    )
    .context("Failed to build wallet relay")?;

    let (tx, mut received) = mpsc::unbounded_channel();
    merchant.on_envelope_received(Arc::new(move |envelope| {
        let _ = tx.send(envelope);
    }));
    merchant.start();
    wallet.start();
    merchant
        .enter_receiving_mode()
        .await
        .context("Merchant failed to advertise")?;
    println!("  {} Merchant advertising", "✓".green());

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let envelope = TransactionEnvelope::new(payload).with_metadata(EnvelopeMetadata {
        amount: Some("1.00".to_string()),
        recipient: Some("merchant".to_string()),
        memo: Some("simulation".to_string()),
    });

    let started = Instant::now();
    let outcome = wallet
        .send_envelope(
            &DeviceId::from("merchant"),
            &envelope,
            Some(Arc::new(print_progress)),
        )
        .await;
    println!();

    if !outcome.success {
        wallet.shutdown().await;
        merchant.shutdown().await;
        anyhow::bail!(
            "Transfer failed: {}",
            outcome.reason.unwrap_or_else(|| "unknown".to_string())
        );
    }

    println!(
        "  {} Delivered in {} ms",
        "✓".green(),
        started.elapsed().as_millis()
    );
    println!(
        "  {} Receipt: {}",
        if outcome.peer_confirmation {
            "✓".green()
        } else {
            "•".yellow()
        },
        if outcome.peer_confirmation {
            "confirmed"
        } else {
            "not received"
        }
    );
    println!("  Packets dropped: {}", radio.dropped_packets());

    match tokio::time::timeout(Duration::from_secs(5), received.recv()).await {
        Ok(Some(inbound)) => match inbound.result {
            Ok(got) if got == envelope => {
                println!("  {} Merchant payload matches", "✓".green())
            }
            Ok(_) => println!("  {} Merchant payload differs", "✗".red()),
            Err(reason) => println!("  {} Merchant failed: {}", "✗".red(), reason),
        },
        _ => println!("  {} Merchant reported nothing", "✗".red()),
    }

    let status = wallet.get_status();
    tracing::debug!("Simulation status: {:?}", status);
    println!(
        "  Key derivations: {}, active sessions: {}",
        status.key_derivations, status.active_sessions
    );

    wallet.shutdown().await;
    merchant.shutdown().await;
    Ok(())
}

fn print_progress(progress: Progress) {
    const WIDTH: usize = 30;
    let filled = (progress.percentage / 100.0 * WIDTH as f64).round() as usize;
    print!(
        "\r  [{}{}] {:>5.1}% ({}/{})",
        "#".repeat(filled.min(WIDTH)).green(),
        ".".repeat(WIDTH - filled.min(WIDTH)),
        progress.percentage,
        progress.completed,
        progress.total
    );
    let _ = std::io::stdout().flush();
}

fn cmd_config(action: ConfigAction, mut config: config::Config) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}
