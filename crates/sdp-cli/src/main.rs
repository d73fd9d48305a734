//! SDP command-line tool
//!
//! Frame inspection, configuration management and an in-memory two-node
//! simulation of the messaging engine.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sdp_core::{
    Alignment, MacAddress, MediaType, Node, NodeConfig, PayloadBuilder, PeerHandle, PowerControl,
    WorkType, build_frame, parse_frame, verify_crc,
};
use sdp_transport::{MemoryBus, MemoryTransport};

use config::Config;

/// SDP - multi-media messaging for embedded nodes
#[derive(Parser)]
#[command(name = "sdp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two nodes over an in-memory bus and exchange requests
    Simulate {
        /// Requests to send
        #[arg(short, long, default_value_t = 5)]
        messages: u32,

        /// Send failures to inject on the CAN link before starting
        #[arg(long, default_value_t = 0)]
        fail: u32,

        /// Take the CAN link down entirely
        #[arg(long)]
        link_down: bool,

        /// Also send a priority message
        #[arg(long)]
        priority: bool,

        /// Align wake windows with the peer before sending
        #[arg(long)]
        orchestrate: bool,

        /// Address of the simulated peer
        #[arg(long, default_value = "02:00:00:00:00:02")]
        peer_address: String,
    },

    /// Encode or decode raw frames
    Frame {
        #[command(subcommand)]
        action: FrameAction,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List provisioned peers
    Peers,
}

#[derive(Subcommand)]
enum FrameAction {
    /// Build a frame and print it as hex
    Encode {
        /// Work type (handshake, request, reply, data, priority, orchestration, qos)
        #[arg(short = 't', long, default_value = "data")]
        work_type: WorkType,

        /// Conversation id
        #[arg(short = 'i', long, default_value_t = 0)]
        conversation: u16,

        /// Payload fields, each null-terminated on the wire
        fields: Vec<String>,
    },

    /// Parse a hex-encoded frame
    Decode {
        /// Frame bytes as hex
        hex: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        init_logging(cli.verbose, "info");
        return init_config(&config_path, *force);
    }

    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else if cli.config.is_none() {
        Config::load_or_default()?
    } else {
        Config::load(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?
    };
    config.validate()?;
    init_logging(cli.verbose, &config.node.logging.level);

    match cli.command {
        Commands::Simulate {
            messages,
            fail,
            link_down,
            priority,
            orchestrate,
            peer_address,
        } => {
            let peer_address: MacAddress = peer_address
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let options = SimulateOptions {
                messages,
                fail,
                link_down,
                priority,
                orchestrate,
                peer_address,
            };
            simulate(&config, &options)?;
        }
        Commands::Frame { action } => match action {
            FrameAction::Encode {
                work_type,
                conversation,
                fields,
            } => encode_frame(work_type, conversation, &fields),
            FrameAction::Decode { hex } => decode_frame(&hex)?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", toml::to_string_pretty(&config)?),
            ConfigAction::Init { force } => init_config(&config_path, force)?,
        },
        Commands::Peers => list_peers(&config)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(if verbose { "debug" } else { level })
        .init();
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn encode_frame(work_type: WorkType, conversation: u16, fields: &[String]) {
    let payload = fields
        .iter()
        .fold(PayloadBuilder::new(), |b, f| b.text(f))
        .build();
    let frame = build_frame(work_type, conversation, &payload);
    println!("{}", hex::encode(frame));
}

fn decode_frame(input: &str) -> anyhow::Result<()> {
    let bytes = hex::decode(input.trim()).context("frame is not valid hex")?;
    let item = parse_frame(&bytes)?;

    println!("Type:         {}", item.work_type);
    println!("Conversation: {}", item.conversation_id);
    match verify_crc(&bytes) {
        Ok(crc) => println!("CRC:          {crc:08x} (ok)"),
        Err(e) => println!("CRC:          {:08x} ({e})", item.crc),
    }
    println!("Fields:       {}", item.field_count());
    for (i, field) in item.fields().enumerate() {
        match std::str::from_utf8(field) {
            Ok(text) => println!("  [{i}] {text:?}"),
            Err(_) => println!("  [{i}] 0x{}", hex::encode(field)),
        }
    }
    Ok(())
}

fn list_peers(config: &Config) -> anyhow::Result<()> {
    if config.peers.is_empty() {
        println!("No peers provisioned");
        return Ok(());
    }
    println!("{:<16} {:<18} MEDIA", "NAME", "ADDRESS");
    for peer in &config.peers {
        let (address, media) = peer.parse()?;
        println!("{:<16} {:<18} {}", peer.name, address, media);
    }
    Ok(())
}

struct SimulateOptions {
    messages: u32,
    fail: u32,
    link_down: bool,
    priority: bool,
    orchestrate: bool,
    peer_address: MacAddress,
}

/// Logs the sleep instead of taking it so a simulation finishes promptly
struct ReportOnly;

impl PowerControl for ReportOnly {
    fn sleep_for(&self, duration: Duration) {
        tracing::info!("Simulated sleep of {:?}", duration);
    }
}

const SIM_MEDIA: [MediaType; 2] = [MediaType::BusCan, MediaType::RadioShort];

fn simulate(config: &Config, options: &SimulateOptions) -> anyhow::Result<()> {
    let bus = MemoryBus::new();
    let local = config.node.address()?;
    if local == options.peer_address {
        anyhow::bail!("peer address must differ from the local address {local}");
    }

    let mut peer_config: NodeConfig = config.node.clone();
    peer_config.node.name = "sdp-sim-peer".to_string();
    peer_config.node.address = options.peer_address.to_string();

    let local_links: Vec<Arc<MemoryTransport>> =
        SIM_MEDIA.iter().map(|m| bus.attach(local, *m)).collect();

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut builder = Node::builder(config.node.clone())
        .power(Arc::new(ReportOnly))
        .on_message(move |_, item| {
            let _ = tx.send(item);
        });
    for link in &local_links {
        builder = builder.transport(link.clone());
    }
    let node = builder.build()?;

    let mut builder = Node::builder(peer_config)
        .power(Arc::new(ReportOnly))
        .on_message(|dispatcher, item| {
            if item.work_type == WorkType::Request {
                let echo = item.field_str(0).unwrap_or_default();
                let payload = PayloadBuilder::new().text("ack").text(echo).build();
                if let Err(e) = dispatcher.reply(&item, &payload) {
                    tracing::warn!("Reply failed: {}", e);
                }
            }
        })
        .on_priority(|item| {
            tracing::info!("Peer handled priority message (crc {:08x})", item.crc);
        });
    for media in SIM_MEDIA {
        builder = builder.transport(bus.attach(options.peer_address, media));
    }
    let peer_node = builder.build()?;

    let media = SIM_MEDIA.into_iter().collect();
    let remote = node
        .dispatcher()
        .provision_peer("sim-peer", options.peer_address, media)?;
    peer_node
        .dispatcher()
        .provision_peer(&config.node.node.name, local, media)?;

    node.start()?;
    peer_node.start()?;

    if options.fail > 0 {
        local_links[0].fail_next(options.fail);
    }
    if options.link_down {
        local_links[0].set_link_down(true);
    }

    if options.orchestrate {
        peer_node.orchestrator().start_window();
        match node
            .orchestrator()
            .give_control(node.dispatcher().as_ref(), remote)?
        {
            Alignment::Aligned { slept, awake } => {
                println!("Aligned with peer: slept {slept:?}, peer awake for {awake:?}")
            }
            Alignment::NoAnswer { slept } => println!("Peer never answered, slept {slept:?}"),
        }
    }

    let timeout = Duration::from_secs(2);
    let mut answered = 0;
    for i in 0..options.messages {
        let payload = PayloadBuilder::new().text(&format!("msg-{i}")).build();
        let id = match node
            .dispatcher()
            .start_conversation(remote, WorkType::Request, "simulate", &payload)
        {
            Ok(id) => id,
            Err(e) => {
                println!("#{i:<3} send failed: {e}");
                continue;
            }
        };
        match rx.recv_timeout(timeout) {
            Ok(reply) => {
                answered += 1;
                println!(
                    "#{i:<3} conv {id:<5} -> {} via {}",
                    reply.field_str(1).unwrap_or("?"),
                    reply.media.map_or("?", MediaType::name)
                );
            }
            Err(_) => println!("#{i:<3} conv {id:<5} -> no reply"),
        }
    }

    if options.priority {
        let payload = PayloadBuilder::new().text("alarm").build();
        node.dispatcher().send(remote, WorkType::Priority, 0, &payload)?;
        match rx.recv_timeout(timeout) {
            Ok(receipt) => println!(
                "Priority receipt: crc 0x{}",
                hex::encode(receipt.field(0).unwrap_or_default())
            ),
            Err(_) => println!("Priority receipt: none"),
        }
    }

    println!();
    println!("Replies: {}/{}", answered, options.messages);
    print_link_report(&node, remote)?;

    peer_node.shutdown();
    node.shutdown();
    Ok(())
}

fn print_link_report(node: &Node, remote: PeerHandle) -> anyhow::Result<()> {
    let stats = node.dispatcher().stats();
    println!(
        "Sent: {}  Send failures: {}  Received: {}",
        sdp_core::DispatcherStats::get(&stats.sent),
        sdp_core::DispatcherStats::get(&stats.send_failures),
        sdp_core::DispatcherStats::get(&stats.received),
    );

    let peer = node.peers().snapshot(remote)?;
    println!();
    println!("{:<12} {:>8} {:>14} {:>8}", "MEDIA", "SCORE", "FAILURE RATE", "HISTORY");
    for media in peer.media().iter() {
        if let Some(s) = peer.stats(media) {
            let score = s
                .last_score
                .map_or_else(|| "-".to_string(), |v| format!("{v:.1}"));
            println!(
                "{:<12} {:>8} {:>14.2} {:>8}",
                media,
                score,
                s.average_failure_rate(),
                s.history_len()
            );
        }
    }
    Ok(())
}
