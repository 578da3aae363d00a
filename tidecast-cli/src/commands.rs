//! CLI command implementations

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use tidecast_core::cast::{MdnsDiscovery, ReceiverDiscovery};
use tidecast_core::config::TidecastConfig;
use tidecast_core::{
    DispatchEvent, DispatchOutcome, MediaLibrary, PipelineOrchestrator, PipelineOutcome,
    PlaybackRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Serve the library and the playback API
    Serve {
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// Address the listener binds to
        #[arg(long)]
        bind: Option<IpAddr>,
        /// Address receivers use to reach this server
        #[arg(long)]
        public_address: Option<IpAddr>,
        /// Library directory override
        #[arg(long)]
        library: Option<PathBuf>,
    },
    /// Play a file from the library
    Play {
        /// File name within the library
        file: String,
        /// Receiver friendly name override
        #[arg(short, long)]
        receiver: Option<String>,
    },
    /// Download a magnet link into the library and play it
    Fetch {
        /// Magnet link
        locator: String,
        /// Receiver friendly name override
        #[arg(short, long)]
        receiver: Option<String>,
    },
    /// List library files
    List {
        /// Library directory override
        #[arg(long)]
        library: Option<PathBuf>,
    },
    /// Print receivers announcing themselves on the network
    Discover {
        /// How long to listen
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let mut config = TidecastConfig::from_env();

    match command {
        Commands::Serve {
            port,
            bind,
            public_address,
            library,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if let Some(address) = public_address {
                config.server.public_address = address;
            }
            if let Some(library) = library {
                config.library.directory = library;
            }
            serve(config).await
        }
        Commands::Play { file, receiver } => {
            override_receiver(&mut config, receiver);
            play(config, PlaybackRequest::Local { file_name: file }).await
        }
        Commands::Fetch { locator, receiver } => {
            override_receiver(&mut config, receiver);
            play(config, PlaybackRequest::Transfer { locator }).await
        }
        Commands::List { library } => {
            if let Some(library) = library {
                config.library.directory = library;
            }
            list_library(config).await
        }
        Commands::Discover { seconds } => {
            discover_receivers(config, Duration::from_secs(seconds)).await
        }
    }
}

fn override_receiver(config: &mut TidecastConfig, receiver: Option<String>) {
    if let Some(name) = receiver {
        config.cast.receiver_name = name;
    }
}

/// Run the HTTP server until Ctrl-C.
///
/// # Errors
/// - Pipeline setup, bind or serve failures
async fn serve(config: TidecastConfig) -> anyhow::Result<()> {
    tidecast_web::run_server(config, CancellationToken::new())
        .await
        .context("server failed")
}

/// Run one playback request and report how dispatch went.
///
/// The library is served in the background so the receiver can fetch the
/// URL; after a successful dispatch it keeps serving until Ctrl-C.
///
/// # Errors
/// - Pipeline setup errors
/// - Request failures (invalid input, failed transfer or transcode)
async fn play(config: TidecastConfig, request: PlaybackRequest) -> anyhow::Result<()> {
    MediaLibrary::open(&config.library.directory).await?;
    let pipeline =
        PipelineOrchestrator::production(&config).context("failed to set up pipeline")?;

    let shutdown = CancellationToken::new();
    let server = spawn_server(config.clone(), shutdown.clone());
    let interrupt = interrupt_on_ctrl_c(shutdown.clone());

    let (observer, events) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(events));

    let result = pipeline.run(request, Some(observer), &shutdown).await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            shutdown.cancel();
            let _ = server.await;
            return Err(e).context("playback request failed");
        }
    };

    let PipelineOutcome {
        file,
        media_url,
        dispatch,
        ..
    } = outcome;
    println!("{} ({}) at {}", file.name, file.size_label(), media_url);

    let dispatched = dispatch.outcome().await;
    let _ = printer.await;

    match &dispatched {
        DispatchOutcome::Playing { receiver } => {
            println!("Playing on {receiver}; serving until Ctrl-C");
            shutdown.cancelled().await;
        }
        other => {
            println!("Dispatch ended: {other:?}");
            shutdown.cancel();
        }
    }

    interrupt.abort();
    let _ = server.await;
    Ok(())
}

fn spawn_server(config: TidecastConfig, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Another tidecast may already be serving the library on this port
        if let Err(e) = tidecast_web::run_server(config, shutdown).await {
            tracing::warn!("Library server not started: {}", e);
        }
    })
}

fn interrupt_on_ctrl_c(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            shutdown.cancel();
        }
    })
}

async fn print_events(mut events: mpsc::UnboundedReceiver<DispatchEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::Playing { receiver, url } => println!("{receiver} is playing {url}"),
            DispatchEvent::Failed {
                receiver: Some(receiver),
                reason,
            } => println!("{receiver} refused playback: {reason}"),
            DispatchEvent::Failed {
                receiver: None,
                reason,
            } => println!("Receiver discovery failed: {reason}"),
            DispatchEvent::TimedOut { after } => {
                println!("No matching receiver within {}s", after.as_secs())
            }
            DispatchEvent::Cancelled => println!("Dispatch cancelled"),
        }
    }
}

/// List the library directory with sizes.
///
/// # Errors
/// - Library directory missing or unreadable
async fn list_library(config: TidecastConfig) -> anyhow::Result<()> {
    let library = MediaLibrary::new(&config.library.directory);
    let mut files = library
        .list()
        .await
        .with_context(|| format!("cannot list {}", config.library.directory.display()))?;
    files.sort_by(|a, b| a.name.cmp(&b.name));

    if files.is_empty() {
        println!("No media in {}", config.library.directory.display());
        return Ok(());
    }
    for file in files {
        println!("{:>10}  {}", file.size_label(), file.name);
    }
    Ok(())
}

/// Print every receiver announced within `window`.
///
/// # Errors
/// - mDNS daemon could not be started
async fn discover_receivers(config: TidecastConfig, window: Duration) -> anyhow::Result<()> {
    let discovery = MdnsDiscovery::new(config.cast.service_type.clone());
    let mut subscription = discovery.subscribe().await?;
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            announced = subscription.next() => match announced {
                Some(receiver) => {
                    seen += 1;
                    println!(
                        "{} ({}) at {} [{}]",
                        receiver.friendly_name, receiver.model, receiver.address, receiver.id
                    );
                }
                None => break,
            },
        }
    }
    subscription.unsubscribe();

    if seen == 0 {
        println!("No receivers found in {}s", window.as_secs());
    }
    Ok(())
}
