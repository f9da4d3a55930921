// ledsand - sandboxed Lua frame server for addressable LED strips
// Usage: ledsand <DEVICE> <PORT> <MOUNT>

mod exit_codes;
mod signals;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use ledsand_config::Settings;
use ledsand_engine::scheduler::SchedulerConfig;
use ledsand_engine::{
    Delay, DiscardSink, Engine, FrameSink, Sandbox, SandboxConfig, SchedulerHandle, SerialSink,
};
use ledsand_server::{Reactor, ServerConfig};

use exit_codes::{
    EXIT_BIND, EXIT_BOOTSTRAP, EXIT_CONFIG, EXIT_ERROR, EXIT_HARDWARE, EXIT_INTERPRETER, EXIT_SUCCESS,
};

/// Device path that selects the discarding sink.
const NO_DEVICE: &str = "-";

#[derive(Parser, Debug)]
#[command(name = "ledsand")]
#[command(about = "Run uploaded Lua programs that drive an LED strip")]
#[command(long_version = long_version())]
#[command(version)]
#[command(after_help = "\
Examples:
  ledsand /dev/ttyACM0 8000 /
  ledsand - 8000 /leds --bootstrap init.lua -v

Upload a script over WebSocket at ws://HOST:PORT/. Status endpoints:
  GET <MOUNT>/code       current program source
  GET <MOUNT>/examples   example script names
  GET <MOUNT>/status     JSON status and counters")]
struct Cli {
    /// Serial device the frames are written to ('-' discards frames)
    device: String,

    /// TCP port for uploads and status requests
    port: u16,

    /// HTTP mount path for the status endpoints
    mount: String,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Settings file (default: <config dir>/ledsand/settings.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Lua file run once before sandboxing
    #[arg(long, value_name = "PATH")]
    bootstrap: Option<PathBuf>,

    /// Concurrent upload connections
    #[arg(long, value_name = "N")]
    max_clients: Option<usize>,

    /// Directory listed by the examples endpoint
    #[arg(long, value_name = "DIR")]
    examples_dir: Option<PathBuf>,

    /// Bytes available to scripts above the bootstrap baseline
    #[arg(long, value_name = "BYTES")]
    memory_budget: Option<usize>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_COMMIT_HASH"), ")",
        "\nengine:  ledsand-engine ", env!("CARGO_PKG_VERSION"),
        "\nlua:     5.4 (vendored)",
        "\ntarget:  ", env!("TARGET"),
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message }) => {
            log::error!("{}", message);
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => log::LevelFilter::Warn,
        (false, 0) => log::LevelFilter::Info,
        (false, 1) => log::LevelFilter::Debug,
        (false, _) => log::LevelFilter::Trace,
    };
    colog::default_builder()
        .filter_level(level)
        .parse_default_env()
        .init();
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
}

impl CliError {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Apply command-line overrides on top of the settings file.
fn resolve_settings(cli: &Cli) -> Result<Settings, CliError> {
    let mut settings = Settings::load(cli.config.as_deref()).map_err(|e| CliError::new(EXIT_CONFIG, e.to_string()))?;
    if let Some(path) = &cli.bootstrap {
        settings.bootstrap = Some(path.clone());
    }
    if let Some(n) = cli.max_clients {
        settings.max_clients = n;
    }
    if let Some(dir) = &cli.examples_dir {
        settings.examples_dir = dir.clone();
    }
    if let Some(bytes) = cli.memory_budget {
        settings.memory_budget = bytes;
    }
    settings.validate().map_err(|e| CliError::new(EXIT_CONFIG, e.to_string()))?;
    Ok(settings)
}

fn create_sandbox(settings: &Settings) -> Result<Sandbox, CliError> {
    let bootstrap = match &settings.bootstrap {
        Some(path) => Some(fs::read_to_string(path).map_err(|e| {
            CliError::new(EXIT_BOOTSTRAP, format!("cannot read bootstrap {}: {}", path.display(), e))
        })?),
        None => None,
    };
    let has_bootstrap = bootstrap.is_some();

    Sandbox::new(SandboxConfig {
        pixel_count: settings.pixel_count,
        memory_budget: settings.memory_budget,
        instruction_limit: settings.instruction_limit,
        bootstrap,
    })
    .map_err(|e| {
        if has_bootstrap {
            CliError::new(EXIT_BOOTSTRAP, format!("bootstrap failed: {}", e))
        } else {
            CliError::new(EXIT_INTERPRETER, format!("cannot create interpreter: {}", e))
        }
    })
}

fn open_sink(device: &str, baud: u32) -> Result<Box<dyn FrameSink>, CliError> {
    if device == NO_DEVICE {
        log::warn!("No frame device; frames are discarded");
        return Ok(Box::new(DiscardSink));
    }
    let sink = SerialSink::open(Path::new(device), baud).map_err(|e| CliError::new(EXIT_HARDWARE, e.to_string()))?;
    Ok(Box::new(sink))
}

fn run(cli: Cli) -> Result<(), CliError> {
    let settings = resolve_settings(&cli)?;
    let sandbox = create_sandbox(&settings)?;
    let sink = open_sink(&cli.device, settings.baud)?;
    let engine = Engine::new(sandbox, sink);

    let running = signals::install();

    let mut scheduler = SchedulerHandle::spawn(
        engine.clone(),
        SchedulerConfig {
            quantum: settings.quantum(),
            initial_delay: Delay::Millis(settings.initial_delay_ms),
        },
    )
    .map_err(|e| CliError::new(EXIT_ERROR, format!("cannot start scheduler: {}", e)))?;

    let server_config = ServerConfig {
        max_clients: settings.max_clients,
        max_upload: settings.max_upload,
        outbox_depth: settings.outbox_depth,
        mount: cli.mount.clone(),
        examples_dir: settings.examples_dir.clone(),
    };
    let mut reactor = match Reactor::bind((cli.host.as_str(), cli.port), engine.clone(), server_config) {
        Ok(reactor) => reactor,
        Err(e) => {
            scheduler.stop();
            return Err(CliError::new(EXIT_BIND, format!("cannot listen on {}:{}: {}", cli.host, cli.port, e)));
        }
    };

    log::info!(
        "Serving {} pixels on port {} (mount {}), device {}",
        settings.pixel_count,
        cli.port,
        cli.mount,
        cli.device
    );
    reactor.run(running);

    log::info!("Shutdown requested, stopping scheduler");
    scheduler.stop();
    log::info!("Stopped: {:?}", engine.metrics().snapshot());
    Ok(())
}
