use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{load_settings, load_settings_from, ClientMirror, Connector};
use serde_json::Value;
use shared::{
    domain::{ChannelId, ClientId, ConnectArgs, DataStats, PingStats, UserId, VoiceTarget},
    protocol::EntityKey,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker::{AudioPacket, SimulatedConnector, SimulatedServerBuilder};

/// Drives the voice bridge against an in-process simulated server.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "voice.example.org")]
    host: String,
    #[arg(long, default_value = "desktop")]
    username: String,
    #[arg(long)]
    password: Option<String>,
    /// Settings file; defaults to ./bridge.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    sample_rate: Option<u32>,
    /// Call to issue after connecting, e.g. "user 6 setMute true" or
    /// "channel 2 sendMessage hello". May be repeated.
    #[arg(long = "call")]
    calls: Vec<String>,
    /// Milliseconds of test tone sent as microphone audio.
    #[arg(long, default_value_t = 100)]
    speak_ms: u32,
    /// How long to keep processing pushes before printing the outcome.
    #[arg(long, default_value_t = 250)]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(rate) = args.sample_rate {
        settings.sample_rate = rate;
    }
    let samples_per_packet = settings.samples_per_packet;

    let (protocol, server) = demo_server(&args.username).build();
    let (mut connector, mut playback) =
        Connector::with_queued_playback(settings, worker::launcher(Arc::new(protocol)));

    let connect_args = ConnectArgs {
        username: args.username.clone(),
        password: args.password.clone(),
        tokens: Vec::new(),
    };
    let client_id = match connector.connect(&args.host, connect_args).await {
        Ok(client_id) => client_id,
        Err(err) => bail!("{} error: {err}", err.category().label()),
    };
    let mut signals = connector.subscribe_client(client_id)?;
    print_tree(connector.client(client_id).context("client mirror missing")?);

    for line in &args.calls {
        let (key, method, call_args) = parse_call(client_id, line)?;
        let req_id = connector.invoke(key, &method, &call_args)?;
        println!("sent {method} as request {req_id}");
    }

    let speech = server.start_voice(6);
    tokio::spawn(async move {
        for target in [VoiceTarget::Normal, VoiceTarget::Normal, VoiceTarget::Shout] {
            let packet = AudioPacket {
                pcm: tone(480, 48_000),
                target,
            };
            if speech.send(packet).await.is_err() {
                break;
            }
        }
    });
    server.add_user(9, "late-joiner", None, 1);
    server.text_message(Some(6), "hello from the simulated server", &[1]);
    server.data_ping(DataStats {
        udp: PingStats {
            packets: 42,
            average_ms: 18.5,
            variance: 2.0,
        },
        good: 420,
        ..DataStats::default()
    });

    let sample_rate = connector.settings().sample_rate;
    let mut mic = connector.create_voice_stream(client_id, VoiceTarget::Normal)?;
    let total = (sample_rate as usize) * (args.speak_ms as usize) / 1000;
    for chunk in tone(total, sample_rate).chunks((sample_rate / 100).max(1) as usize) {
        mic.write(chunk)?;
    }
    mic.finish()?;

    let settle = tokio::time::sleep(Duration::from_millis(args.settle_ms));
    tokio::pin!(settle);
    loop {
        tokio::select! {
            result = connector.pump() => result?,
            _ = &mut settle => break,
        }
    }

    while let Ok(signal) = signals.try_recv() {
        println!("client signal: {signal:?}");
    }
    while let Ok(mut stream) = playback.try_recv() {
        let mut frames = 0;
        let mut samples = 0;
        while let Ok(frame) = stream.frames.try_recv() {
            frames += 1;
            samples += frame.samples.len();
        }
        println!(
            "played voice {} from {:?}: {frames} frames, {samples} samples",
            stream.voice_id, stream.origin
        );
    }
    for (i, stream) in server.outbound_streams().iter().enumerate() {
        println!(
            "server received outbound stream {i} ({:?}): {} packets, ended={}",
            stream.target,
            stream.packets.len(),
            stream.ended
        );
    }

    let client = connector.client(client_id).context("client mirror missing")?;
    print_tree(client);
    println!(
        "bitrate: max={:?} actual={}",
        client.max_bitrate(samples_per_packet, false),
        client.actual_bitrate(samples_per_packet, false)
    );

    connector.disconnect(client_id)?;
    connector.drain()?;
    connector.shutdown();
    info!(calls = ?server.calls(), "done");
    Ok(())
}

fn demo_server(username: &str) -> SimulatedServerBuilder {
    SimulatedConnector::builder()
        .channel(1, 0, "Lobby")
        .channel(2, 0, "Music")
        .channel(3, 1, "AFK")
        .link(1, 2)
        .user(5, username, Some(42), 1)
        .user(6, "echo", None, 2)
        .self_user(5)
}

/// Parses "client <method> [args..]", "channel <id> <method> [args..]" or
/// "user <id> <method> [args..]". Arguments are JSON, falling back to strings.
fn parse_call(client_id: ClientId, line: &str) -> Result<(EntityKey, String, Vec<Value>)> {
    let mut tokens = line.split_whitespace();
    let key = match tokens.next() {
        Some("client") => EntityKey::Client { client_id },
        Some("channel") => EntityKey::Channel {
            client_id,
            channel_id: ChannelId(next_id(&mut tokens, line)?),
        },
        Some("user") => EntityKey::User {
            client_id,
            user_id: UserId(next_id(&mut tokens, line)?),
        },
        _ => bail!("call `{line}` must start with client, channel or user"),
    };
    let method = tokens
        .next()
        .with_context(|| format!("call `{line}` names no method"))?
        .to_string();
    let args = tokens
        .map(|token| serde_json::from_str(token).unwrap_or_else(|_| Value::String(token.into())))
        .collect();
    Ok((key, method, args))
}

fn next_id<'a>(tokens: &mut impl Iterator<Item = &'a str>, line: &str) -> Result<u32> {
    tokens
        .next()
        .with_context(|| format!("call `{line}` is missing an id"))?
        .parse()
        .with_context(|| format!("call `{line}` has a malformed id"))
}

fn print_tree(client: &ClientMirror) {
    if let Some(message) = &client.welcome_message {
        println!("{message}");
    }
    match client.root_id {
        Some(root) => print_channel(client, root, 0),
        None => println!("(no channel tree)"),
    }
}

fn print_channel(client: &ClientMirror, id: ChannelId, depth: usize) {
    let Some(channel) = client.channel(id) else {
        return;
    };
    let indent = "  ".repeat(depth);
    println!("{indent}#{} {}", channel.id, channel.name);
    for user in client.users_in(id) {
        let me = if client.self_id == Some(user.id) { " (you)" } else { "" };
        println!("{indent}  - {}{me}", user.username);
    }
    let mut children = client.children_of(id);
    children.sort_by_key(|child| (child.position, child.id));
    for child in children {
        print_channel(client, child.id, depth + 1);
    }
}

/// A quiet 440 Hz sine wave.
fn tone(samples: usize, sample_rate: u32) -> Vec<f32> {
    (0..samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (t * 440.0 * std::f32::consts::TAU).sin() * 0.2
        })
        .collect()
}
