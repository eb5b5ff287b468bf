use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use mosaic::compositor::placeholder;
use mosaic::session::parse_key_value_options;
use mosaic::{
    ChannelRegistry, CompositorConfig, ControlServer, OutputTarget, ServerConfig, SessionConfig,
    SessionManager, SessionState, SourceSettings, StartRequest,
};

#[derive(Parser)]
#[command(name = "mosaic", version, about = "Live multiviewer: tiles many video feeds into one output")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the channels in a registry with their normalised source URLs
    Channels {
        #[arg(long, short)]
        registry: PathBuf,
    },
    /// Write a placeholder mosaic (every tile empty) as a PPM image
    Snapshot {
        #[arg(long, short)]
        registry: PathBuf,
        /// Only these channels (repeatable); default is all
        #[arg(long = "channel")]
        channels: Vec<String>,
        #[arg(long, short, default_value = "mosaic.ppm")]
        output: PathBuf,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Run one live session until Enter is pressed or it ends
    Live(LiveArgs),
    /// Run the HTTP control server until Enter is pressed
    Serve(ServeArgs),
}

#[derive(Args)]
struct LayoutArgs {
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Label height in pixels
    #[arg(long, default_value_t = 28)]
    font_size: u32,
    /// Inset of each picture inside its cell
    #[arg(long, default_value_t = 8)]
    padding: u32,
}

impl LayoutArgs {
    fn compositor(&self) -> CompositorConfig {
        CompositorConfig {
            width: self.width,
            height: self.height,
            label_font_size: self.font_size,
            padding: self.padding,
            ..CompositorConfig::default()
        }
    }
}

#[derive(Args)]
struct EngineArgs {
    /// Parent directory for per-session SDP and HLS files
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Decoder input option for every source, e.g. `fflags=nobuffer` (repeatable)
    #[arg(long = "input-opt", value_name = "KEY=VALUE")]
    input_options: Vec<String>,
    /// Give up on a source after this many consecutive failures
    #[arg(long)]
    max_failures: Option<u32>,
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,
    #[arg(long, default_value = "ffplay")]
    ffplay: String,
}

impl EngineArgs {
    fn session_config(&self, compositor: CompositorConfig) -> mosaic::Result<SessionConfig> {
        let mut config = SessionConfig {
            compositor,
            source: SourceSettings {
                max_failures: self.max_failures,
                input_options: parse_key_value_options(&self.input_options)?,
                ..SourceSettings::default()
            },
            ..SessionConfig::default()
        };
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        config.encoder.encoder_program = self.ffmpeg.clone();
        config.encoder.player_program = self.ffplay.clone();
        Ok(config)
    }
}

#[derive(Args)]
struct LiveArgs {
    #[arg(long, short)]
    registry: PathBuf,
    /// Only these channels (repeatable); default is all
    #[arg(long = "channel")]
    channels: Vec<String>,
    /// Stream over RTP to HOST[:PORT] instead of opening a window
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "hls")]
    rtp_out: Option<String>,
    /// Write an HLS stream with this name instead of opening a window
    #[arg(long, value_name = "NAME")]
    hls: Option<String>,
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Stop automatically after this many seconds
    #[arg(long)]
    ttl: Option<u64>,
    /// Encoder option, e.g. `c:v=libx264` (repeatable)
    #[arg(long = "encoder-opt", value_name = "KEY=VALUE")]
    encoder_options: Vec<String>,
    #[command(flatten)]
    layout: LayoutArgs,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, short)]
    registry: PathBuf,
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8080")]
    bind: String,
    /// RTP port used when a start request gives none
    #[arg(long, default_value_t = mosaic::session::DEFAULT_RTP_PORT)]
    default_port: u16,
    /// Session lifetime in seconds when a start request gives none
    #[arg(long)]
    ttl: Option<u64>,
    #[command(flatten)]
    layout: LayoutArgs,
    #[command(flatten)]
    engine: EngineArgs,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Channels { registry } => channels(registry),
        Command::Snapshot {
            registry,
            channels,
            output,
            layout,
        } => snapshot(registry, &channels, output, &layout),
        Command::Live(args) => live(args),
        Command::Serve(args) => serve(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn channels(registry: PathBuf) -> mosaic::Result<ExitCode> {
    let registry = ChannelRegistry::load(registry)?;
    for channel in registry.channels() {
        let url = if channel.url.is_empty() { "-" } else { &channel.url };
        println!("{}\t{}", channel.name, url);
    }
    Ok(ExitCode::SUCCESS)
}

fn snapshot(registry: PathBuf, names: &[String], output: PathBuf, layout: &LayoutArgs) -> mosaic::Result<ExitCode> {
    let registry = ChannelRegistry::load(registry)?;
    let selected = registry.select(names)?;
    let names: Vec<String> = selected.into_iter().map(|c| c.name).collect();
    let mosaic = placeholder(&names, &layout.compositor());
    fs::write(&output, mosaic.frame.to_ppm())?;
    println!(
        "wrote {}x{} mosaic of {} channels to {}",
        mosaic.width(),
        mosaic.height(),
        names.len(),
        output.display()
    );
    Ok(ExitCode::SUCCESS)
}

/// Delivers a message once a line (or EOF) arrives on stdin.
fn enter_pressed() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut input = String::new();
        let _ = io::stdin().read_line(&mut input);
        let _ = tx.send(());
    });
    rx
}

fn live(args: LiveArgs) -> mosaic::Result<ExitCode> {
    let registry = ChannelRegistry::load(&args.registry)?;
    tracing::info!(registry = %args.registry.display(), channels = registry.len(), "registry loaded");
    let channels = registry.select(&args.channels)?;

    let target = match (&args.rtp_out, &args.hls) {
        (Some(dest), _) => OutputTarget::rtp(dest, None)?,
        (None, Some(name)) => OutputTarget::hls(name)?,
        (None, None) => OutputTarget::window(),
    }
    .with_fps(args.fps)
    .with_options(parse_key_value_options(&args.encoder_options)?);

    let config = args.engine.session_config(args.layout.compositor())?;
    let manager = SessionManager::new(config)?;

    let mut request = StartRequest::new(target, channels);
    request.ttl = args.ttl.map(Duration::from_secs);
    let session = manager.start_session(request)?;

    match session.artifact() {
        Some(artifact) => println!("session {} streaming: {}", session.id, artifact.path().display()),
        None => println!("session {} running on {}", session.id, session.key),
    }
    println!("press Enter to stop");

    let enter = enter_pressed();
    let state = loop {
        let state = session.wait(Some(Duration::from_millis(200)));
        if state.is_terminal() {
            break state;
        }
        if enter.try_recv().is_ok() {
            break manager.stop_session(&session.id).unwrap_or(SessionState::Stopped);
        }
    };
    manager.shutdown();

    match (state, session.error()) {
        (SessionState::Failed, Some(error)) => {
            eprintln!("session failed: {error}");
            Ok(ExitCode::FAILURE)
        }
        _ => {
            println!("session stopped after {} frames", session.frames());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn serve(args: ServeArgs) -> mosaic::Result<ExitCode> {
    let registry = ChannelRegistry::load(&args.registry)?;
    tracing::info!(registry = %args.registry.display(), channels = registry.len(), "registry loaded");
    let mut config = args.engine.session_config(args.layout.compositor())?;
    config.default_ttl = args.ttl.map(Duration::from_secs);
    let manager = SessionManager::new(config)?;

    let mut server = ControlServer::new(
        manager.clone(),
        registry,
        ServerConfig {
            bind_addr: args.bind.clone(),
            default_rtp_port: args.default_port,
        },
    );
    server.start()?;

    println!("control server on {}, press Enter to stop", args.bind);
    let _ = enter_pressed().recv();

    server.stop();
    tracing::info!(sessions = manager.list_sessions().len(), "stopping remaining sessions");
    manager.shutdown();
    Ok(ExitCode::SUCCESS)
}
