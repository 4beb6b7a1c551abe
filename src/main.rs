use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hdmi_capture::config::{AppConfig, ConfigStore};
use hdmi_capture::events::EventBus;
use hdmi_capture::video::edid;
use hdmi_capture::video::hal::{EncodeEngine, HdmiSubdevice};
use hdmi_capture::video::monitor::query_signal;
use hdmi_capture::video::service::extract_status_log;
use hdmi_capture::video::subdev::read_kernel_log;
use hdmi_capture::video::{
    DmaHeapAllocator, FrameSink, V4l2Subdev, V4l2rCaptureOpener, VideoBackends, VideoService,
    VideoState, WriterSink,
};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// hdmi-capture command line arguments
#[derive(Parser, Debug)]
#[command(name = "hdmi-capture")]
#[command(version, about = "HDMI capture and H.264 streaming", long_about = None)]
struct CliArgs {
    /// Configuration file
    #[arg(
        short = 'c',
        long,
        value_name = "FILE",
        default_value = "/etc/hdmi-capture/config.toml"
    )]
    config: PathBuf,

    /// Capture device (overrides config)
    #[arg(long, value_name = "DEVICE")]
    capture_device: Option<String>,

    /// HDMI receiver subdevice (overrides config)
    #[arg(long, value_name = "DEVICE")]
    subdev: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream H.264 until Ctrl-C
    Stream {
        /// Output file ("-" for stdout)
        #[arg(short = 'o', long, default_value = "-")]
        output: String,

        /// Quality factor in [0, 1] for this run (overrides config)
        #[arg(short = 'q', long)]
        quality: Option<f64>,
    },
    /// Detect the HDMI input once and print its state as JSON
    Status,
    /// Read or write the receiver EDID
    Edid {
        #[command(subcommand)]
        action: EdidAction,
    },
    /// Dump the receiver status from the kernel log
    LogStatus,
    /// Persist the stream quality factor
    Quality {
        /// Quality factor in [0, 1]
        value: f64,
    },
}

#[derive(Subcommand, Debug)]
enum EdidAction {
    /// Print the current EDID as hex
    Get,
    /// Write an EDID given as hex; an empty string restores the default
    Set {
        hex: String,
        /// Do not store the EDID in the config file
        #[arg(long)]
        no_save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    let config_store = ConfigStore::new(&args.config).await?;
    let mut config = (*config_store.get()).clone();
    if let Some(device) = args.capture_device {
        config.video.capture_device = device;
    }
    if let Some(device) = args.subdev {
        config.video.subdev_device = device;
    }

    match args.command {
        Command::Stream { output, quality } => {
            if let Some(q) = quality {
                config.video.quality_factor = q;
                config.validate()?;
            }
            run_stream(&config, &output).await
        }
        Command::Status => {
            let subdev = V4l2Subdev::open(&config.video.subdev_device)?;
            let state = query_signal(&subdev)?;
            println!("{}", serde_json::to_string_pretty(&VideoState::from(state))?);
            Ok(())
        }
        Command::Edid { action } => match action {
            EdidAction::Get => {
                let subdev = V4l2Subdev::open(&config.video.subdev_device)?;
                let mut buf = [0u8; edid::MAX_EDID_SIZE];
                let len = subdev.get_edid(&mut buf)?;
                println!("{}", edid::to_hex(&buf[..len]));
                Ok(())
            }
            EdidAction::Set { hex, no_save } => {
                let subdev = V4l2Subdev::open(&config.video.subdev_device)?;
                let data = edid::prepare(&hex)?;
                subdev.set_edid(&data)?;
                tracing::info!("EDID written ({} bytes)", data.len());
                if !no_save {
                    let stored = edid::to_hex(&data);
                    config_store
                        .update(|c| c.video.edid = Some(stored))
                        .await?;
                }
                Ok(())
            }
        },
        Command::LogStatus => {
            let subdev = V4l2Subdev::open(&config.video.subdev_device)?;
            subdev.log_status()?;
            let log = read_kernel_log()?;
            print!("{}", extract_status_log(&log));
            Ok(())
        }
        Command::Quality { value } => {
            config_store
                .update(|c| c.video.quality_factor = value)
                .await?;
            tracing::info!(
                "Quality factor {} saved to {}",
                value,
                config_store.path().display()
            );
            Ok(())
        }
    }
}

async fn run_stream(config: &AppConfig, output: &str) -> anyhow::Result<()> {
    tracing::info!("Starting hdmi-capture v{}", env!("CARGO_PKG_VERSION"));

    let writer: Box<dyn Write + Send> = if output == "-" {
        Box::new(std::io::stdout())
    } else {
        Box::new(BufWriter::new(File::create(output)?))
    };
    let sink: Arc<dyn FrameSink> = Arc::new(WriterSink::new(writer));

    let backends = VideoBackends {
        opener: Arc::new(V4l2rCaptureOpener::new(&config.video.capture_device)),
        engine: build_engine(config)?,
        subdev: Arc::new(V4l2Subdev::open(&config.video.subdev_device)?),
        allocator: Arc::new(DmaHeapAllocator::open(&config.video.dma_heap)?),
        kernel_log: Arc::new(read_kernel_log),
    };

    let events = Arc::new(EventBus::new());
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!("{}", json),
                    Err(e) => tracing::warn!("Failed to serialize {}: {}", event.event_name(), e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let service = Arc::new(VideoService::init(
        backends,
        sink,
        &config.video,
        Some(events),
    )?);
    service.start_streaming()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    // Joins worker threads
    tokio::task::spawn_blocking(move || service.shutdown()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(feature = "x264")]
fn build_engine(config: &AppConfig) -> anyhow::Result<Arc<dyn EncodeEngine>> {
    use hdmi_capture::video::encoder::X264Engine;

    Ok(Arc::new(X264Engine::new(
        config.encoder.preset,
        config.encoder.fps,
    )))
}

#[cfg(not(feature = "x264"))]
fn build_engine(_config: &AppConfig) -> anyhow::Result<Arc<dyn EncodeEngine>> {
    anyhow::bail!("no H.264 encode engine available (rebuild with --features x264)")
}

/// Initialize logging with tracing; output goes to stderr so stdout can carry the stream
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "hdmi_capture=error",
        LogLevel::Warn => "hdmi_capture=warn",
        LogLevel::Info => "hdmi_capture=info",
        LogLevel::Verbose => "hdmi_capture=debug,v4l2r=info",
        LogLevel::Debug => "hdmi_capture=debug,v4l2r=debug",
        LogLevel::Trace => "hdmi_capture=trace,v4l2r=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
