// flexlink command-line tool -- exercises discovery, SmartLink, the command
// channel and the stream channel against real radios.
//
// Usage:
//   flexlink-cli discover --seconds 5
//   flexlink-cli smartlink --token eyJhbGciOi... --seconds 30
//   flexlink-cli command --host 192.168.1.100 info version "sub slice all"
//   flexlink-cli stream --host 192.168.1.100 --handle 0x40000001 --seconds 5
//
// Logging goes to stderr. `-v` enables info, `-vv` debug, `-vvv` trace;
// RUST_LOG overrides both.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use flexlink::codec::CommandReply;
use flexlink::command::{CommandChannel, CommandEvent, CommandOptions};
use flexlink::discovery::{DISCOVERY_PORT, LanListener, LanOptions};
use flexlink::endpoint::CommandEndpoint;
use flexlink::registry::Registry;
use flexlink::smartlink::{
    DEFAULT_RELAY_HOST, DEFAULT_RELAY_PORT, SmartlinkListener, SmartlinkOptions,
};
use flexlink::stream::{
    DEFAULT_LOCAL_UDP_PORT, DEFAULT_RADIO_UDP_PORT, StreamChannel, StreamOptions,
};
use flexlink::{OwnedPacket, StaticToken};
use flexlink_core::{ChangeEvent, DEFAULT_COMMAND_PORT, Origin, Radio, parse_handle};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// flexlink command-line tool -- find FlexRadio transceivers and talk to them.
#[derive(Parser)]
#[command(name = "flexlink-cli", version, about)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for LAN discovery broadcasts and print registry changes.
    Discover {
        /// How long to listen.
        #[arg(long, default_value_t = 5)]
        seconds: u64,

        /// Discovery port.
        #[arg(long, default_value_t = DISCOVERY_PORT)]
        port: u16,
    },

    /// Register with the SmartLink relay and print what it reports.
    Smartlink {
        /// Pre-issued SmartLink identity token.
        #[arg(long)]
        token: String,

        #[arg(long, default_value = DEFAULT_RELAY_HOST)]
        host: String,

        #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,

        /// How long to stay registered.
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },

    /// Connect the command channel and send each command in turn.
    Command {
        /// Radio address or host name.
        #[arg(long)]
        host: String,

        #[arg(long, default_value_t = DEFAULT_COMMAND_PORT)]
        port: u16,

        /// Upgrade to TLS after connecting (remote radios).
        #[arg(long)]
        tls: bool,

        /// Seconds to wait for each reply.
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Commands to send, e.g. `info` or "sub slice all".
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Bind a stream channel, register a client handle and print frames.
    Stream {
        /// Radio IP address.
        #[arg(long)]
        host: IpAddr,

        /// Client handle from the command channel (hex, e.g. 0x40000001).
        #[arg(long, value_parser = parse_hex_handle)]
        handle: u32,

        /// First local UDP port to try.
        #[arg(long, default_value_t = DEFAULT_LOCAL_UDP_PORT)]
        local_port: u16,

        /// Radio's stream port.
        #[arg(long, default_value_t = DEFAULT_RADIO_UDP_PORT)]
        radio_port: u16,

        /// How long to receive.
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

/// Parse a handle like "0x40000001" or "40000001".
fn parse_hex_handle(s: &str) -> std::result::Result<u32, String> {
    parse_handle(s).ok_or_else(|| format!("invalid handle: {s}"))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "flexlink=info,flexlink_transport=info,warn",
        2 => "flexlink=debug,flexlink_transport=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Time left until `deadline`, or `None` once it has passed.
fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn print_radio_header() {
    println!(
        "{:<8}  {:<12}  {:<12}  {:<16}  {:<18}  {:<10}  Version",
        "Origin", "Serial", "Model", "Nickname", "Address", "Status"
    );
    println!(
        "{:<8}  {:<12}  {:<12}  {:<16}  {:<18}  {:<10}  {}",
        "-".repeat(8),
        "-".repeat(12),
        "-".repeat(12),
        "-".repeat(16),
        "-".repeat(18),
        "-".repeat(10),
        "-".repeat(10),
    );
}

fn print_radio(radio: &Radio) {
    let address = match radio.origin {
        Origin::Local => radio
            .ip
            .map(|ip| format!("{ip}:{}", radio.port))
            .unwrap_or_default(),
        Origin::Relay => match (radio.public_ip, radio.public_tls_port) {
            (Some(ip), Some(port)) => format!("{ip}:{port}"),
            (Some(ip), None) => format!("{ip} (punch)"),
            _ => String::new(),
        },
    };
    println!(
        "{:<8}  {:<12}  {:<12}  {:<16}  {:<18}  {:<10}  {}",
        radio.origin.to_string(),
        radio.serial,
        radio.model,
        radio.nickname,
        address,
        radio.status,
        radio.version
    );
}

fn print_change(event: &ChangeEvent) {
    match event {
        ChangeEvent::Radio { action, radio } => {
            println!(
                "[radio {action:?}] {} {} {} ({})",
                radio.origin, radio.serial, radio.nickname, radio.status
            );
        }
        ChangeEvent::Client {
            action,
            radio,
            client,
        } => {
            println!(
                "[client {action:?}] {} handle=0x{:08X} program={} station={} host={}",
                radio.serial, client.handle, client.program, client.station, client.host
            );
        }
    }
}

fn print_reply(seq: u64, command: &str, reply: &CommandReply) {
    if reply.is_ok() {
        println!("R{seq} {command}: ok {}", reply.message);
    } else {
        println!(
            "R{seq} {command}: error 0x{:08X} {}",
            reply.error_code, reply.message
        );
    }
}

fn print_frame(frame: &OwnedPacket) {
    let stream_id = frame
        .header
        .stream_id
        .map(|id| format!("0x{id:08X}"))
        .unwrap_or_else(|| "-".to_string());
    let kind = frame
        .header
        .stream_type()
        .map(|t| format!("{t:?}"))
        .unwrap_or_else(|| "no class".to_string());
    println!(
        "[frame] stream={stream_id} type={kind} count={} payload={} bytes",
        frame.header.packet_count,
        frame.payload.len()
    );
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_discover(seconds: u64, port: u16) -> Result<()> {
    let registry = Registry::new();
    let mut changes = registry.subscribe();
    let listener = LanListener::new(
        registry.clone(),
        LanOptions {
            port,
            ..LanOptions::default()
        },
    );
    let local = listener
        .start()
        .await
        .context("failed to start LAN discovery")?;

    println!("Listening for FlexRadio broadcasts on {local} ({seconds} seconds)...");
    println!();

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while let Some(left) = remaining(deadline) {
        match tokio::time::timeout(left, changes.recv()).await {
            Ok(Ok(event)) => print_change(&event),
            Ok(Err(RecvError::Lagged(n))) => println!("[warning] missed {n} events"),
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        }
    }
    listener.stop().await;

    let radios = registry.snapshot().await;
    println!();
    if radios.is_empty() {
        println!("No FlexRadio radios found.");
        return Ok(());
    }
    print_radio_header();
    for radio in &radios {
        print_radio(radio);
    }
    println!();
    println!("{} radio(s) found.", radios.len());
    Ok(())
}

async fn cmd_smartlink(token: String, host: String, port: u16, seconds: u64) -> Result<()> {
    let registry = Registry::new();
    let mut changes = registry.subscribe();
    let listener = SmartlinkListener::new(
        registry.clone(),
        Arc::new(StaticToken::new(token)),
        SmartlinkOptions {
            host,
            port,
            ..SmartlinkOptions::default()
        },
    );
    let mut relay_events = listener.subscribe();
    let mut status = listener.subscribe_status();

    listener
        .start("")
        .await
        .context("failed to register with the SmartLink relay")?;
    println!("Registered with SmartLink ({seconds} seconds)...");

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while let Some(left) = remaining(deadline) {
        tokio::select! {
            _ = tokio::time::sleep(left) => break,
            event = changes.recv() => match event {
                Ok(event) => print_change(&event),
                Err(RecvError::Lagged(n)) => println!("[warning] missed {n} events"),
                Err(RecvError::Closed) => break,
            },
            event = relay_events.recv() => match event {
                Ok(event) => println!("[relay] {event:?}"),
                Err(RecvError::Lagged(n)) => println!("[warning] missed {n} relay events"),
                Err(RecvError::Closed) => break,
            },
            status = status.recv() => if let Ok(status) = status {
                println!("[status] {} {}:{} {}", status.state, status.host, status.port, status.error.unwrap_or_default());
                if status.state == flexlink_core::ChannelState::Disconnected {
                    break;
                }
            },
        }
    }

    let radios = registry.snapshot().await;
    listener.stop().await;

    println!();
    if !radios.is_empty() {
        print_radio_header();
        for radio in &radios {
            print_radio(radio);
        }
    }
    println!("{} radio(s) listed.", radios.len());
    Ok(())
}

async fn cmd_command(
    host: String,
    port: u16,
    tls: bool,
    timeout: u64,
    commands: &[String],
) -> Result<()> {
    let channel = CommandChannel::new(CommandOptions::default());
    let mut events = channel.subscribe();

    channel
        .connect_endpoint(&CommandEndpoint {
            host: host.clone(),
            port,
            tls,
            local_bind: None,
        })
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;

    // The radio announces its version and our handle right after connect.
    match tokio::time::timeout(Duration::from_secs(2), channel.wait_for_handle()).await {
        Ok(Ok(handle)) => println!("Connected, handle 0x{handle:08X}"),
        _ => println!("Connected (no handle received yet)"),
    }
    if let Some(version) = channel.version().await {
        println!("Protocol version {version}");
    }

    let mut result = Ok(());
    for command in commands {
        let (seq, reply) = match channel.send_with_reply(command).await {
            Ok(sent) => sent,
            Err(e) => {
                result = Err(e).with_context(|| format!("failed to send {command:?}"));
                break;
            }
        };
        match tokio::time::timeout(Duration::from_secs(timeout), reply).await {
            Ok(Ok(reply)) => print_reply(seq, command, &reply),
            Ok(Err(_)) => {
                result = Err(anyhow::anyhow!("connection closed before reply to {command:?}"));
                break;
            }
            Err(_) => println!("R{seq} {command}: no reply within {timeout}s"),
        }
    }

    // Show anything unsolicited that arrived meanwhile.
    while let Ok(event) = events.try_recv() {
        match event {
            CommandEvent::Status(status) => {
                println!("[status 0x{:08X}] {}", status.handle, status.object)
            }
            CommandEvent::Message { code, text } => println!("[message 0x{code:08X}] {text}"),
            _ => {}
        }
    }

    channel.disconnect().await;
    result
}

async fn cmd_stream(
    host: IpAddr,
    handle: u32,
    local_port: u16,
    radio_port: u16,
    seconds: u64,
) -> Result<()> {
    if handle == 0 {
        bail!("handle must be non-zero");
    }

    let mut radio = Radio::new("cli", Origin::Local);
    radio.ip = Some(host);

    let channel = StreamChannel::new(StreamOptions {
        local_udp_port: local_port,
        radio_udp_port: radio_port,
        ..StreamOptions::default()
    });
    let mut frames = channel
        .bind(&radio)
        .await
        .context("failed to bind stream channel")?;
    if let Some(local) = channel.local_addr().await {
        println!("Stream bound on {local}, registering handle 0x{handle:08X}...");
    }
    channel.register(handle).await?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut count: u64 = 0;
    let mut bytes: u64 = 0;
    while let Some(left) = remaining(deadline) {
        match tokio::time::timeout(left, frames.recv()).await {
            Ok(Some(frame)) => {
                count += 1;
                bytes += frame.payload.len() as u64;
                if count <= 20 {
                    print_frame(&frame);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    println!();
    println!(
        "{count} frame(s), {bytes} payload bytes, registered: {}",
        channel.is_registered()
    );
    channel.unbind().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Discover { seconds, port } => cmd_discover(seconds, port).await,
        Command::Smartlink {
            token,
            host,
            port,
            seconds,
        } => cmd_smartlink(token, host, port, seconds).await,
        Command::Command {
            host,
            port,
            tls,
            timeout,
            commands,
        } => cmd_command(host, port, tls, timeout, &commands).await,
        Command::Stream {
            host,
            handle,
            local_port,
            radio_port,
            seconds,
        } => cmd_stream(host, handle, local_port, radio_port, seconds).await,
    }
}
