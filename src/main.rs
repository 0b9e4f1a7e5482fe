use clap::{Parser, Subcommand};
use moshi_connect::ipc::{ErrorCode, LogLevel, LogStream, StatusData, VpnStatus};
use moshi_connect::service::LogBridge;
use moshi_connect::{DestinationNetwork, Service, ServiceClient, ServiceConfig, VpnProfile, VpnStatusCallback};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

/// How long one-shot commands wait for the service to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "moshi-connect")]
#[command(about = "Privilege-separated OpenConnect supervisor with split tunneling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./moshi-connect.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background service
    ///
    /// Needs the privileges required to create tunnel devices and edit the
    /// routing table.
    Serve,
    /// Connect through a running service and stay attached
    ///
    /// Ctrl+C disconnects the tunnel before exiting.
    Connect {
        /// Profile name shown in status messages
        #[arg(short, long, default_value = "default")]
        name: String,
        /// VPN server URL
        #[arg(short, long)]
        url: String,
        /// Authentication cookie (read from stdin when omitted)
        #[arg(long)]
        cookie: Option<String>,
        /// Route only this network through the tunnel (CIDR, repeatable)
        #[arg(short, long = "route")]
        routes: Vec<DestinationNetwork>,
    },
    /// Ask the service to disconnect the tunnel
    Disconnect,
    /// Show current VPN status
    Status,
    /// Generate default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let bridge = matches!(cli.command, Commands::Serve).then(LogBridge::new);
    init_logging(cli.verbose, bridge.as_ref())?;

    let config = ServiceConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(&config, bridge).await?,
        Commands::Connect {
            name,
            url,
            cookie,
            routes,
        } => {
            let cookie = match cookie {
                Some(cookie) => cookie,
                None => read_cookie()?,
            };
            let profile = VpnProfile::new(name, url).with_routes(routes);
            connect(&config, profile, cookie).await?;
        }
        Commands::Disconnect => {
            let (client, mut events) = attach(&config).await?;
            client.disconnect().await;
            match wait_for(&mut events, |e| e.is_final()).await {
                Some(CliEvent::Status(VpnStatus::Disconnected)) => println!("VPN disconnected"),
                Some(CliEvent::Failed(message)) => println!("Disconnect failed: {}", message),
                _ => println!("No confirmation from the service"),
            }
            client.shutdown().await;
        }
        Commands::Status => {
            let (client, mut events) = attach(&config).await?;
            client.query_status().await;
            match wait_for(&mut events, |e| matches!(e, CliEvent::Status(_))).await {
                Some(CliEvent::Status(status)) => println!("VPN Status: {}", status),
                _ => println!("VPN Status: unknown (no reply from service)"),
            }
            client.shutdown().await;
        }
        Commands::Init => {
            info!("Generating default config...");
            let path = PathBuf::from(moshi_connect::config::CONFIG_FILE_NAME);
            ServiceConfig::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, bridge: Option<&LogBridge>) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    // Logs go to stderr; stdout carries command output
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        );
    let forwarded = bridge.map(|b| b.layer().with_filter(LevelFilter::DEBUG));

    tracing_subscriber::registry()
        .with(console)
        .with(forwarded)
        .try_init()?;
    Ok(())
}

fn ctrl_c_channel() -> Result<mpsc::UnboundedReceiver<()>, ctrlc::Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    Ok(rx)
}

async fn serve(config: &ServiceConfig, bridge: Option<LogBridge>) -> Result<(), Box<dyn std::error::Error>> {
    let mut interrupted = ctrl_c_channel()?;
    let service = Service::start(config, bridge).await?;
    info!("Press Ctrl+C to stop");

    interrupted.recv().await;
    info!("Received shutdown signal");
    service.stop().await;
    Ok(())
}

fn read_cookie() -> std::io::Result<String> {
    eprintln!("Paste authentication cookie and press Enter:");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn connect(config: &ServiceConfig, profile: VpnProfile, cookie: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut interrupted = ctrl_c_channel()?;
    let (client, mut events) = attach(config).await?;
    println!("Connecting to {} ({})", profile.name, profile.url);
    client.connect(profile, cookie).await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) if event.is_final() => break,
                Some(_) => {}
                None => break,
            },
            _ = interrupted.recv() => {
                println!("Disconnecting...");
                client.disconnect().await;
                if wait_for(&mut events, |e| e.is_final()).await.is_none() {
                    warn!("Service did not confirm the disconnect");
                }
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn attach(
    config: &ServiceConfig,
) -> Result<(Arc<ServiceClient>, mpsc::UnboundedReceiver<CliEvent>), Box<dyn std::error::Error>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = ServiceClient::new(config.address(), Arc::new(ConsoleCallback { events: tx }));
    if !client.connect_to_service().await {
        error!("VPN service is not running at {}", config.address());
        return Err("start it with `moshi-connect serve`".into());
    }
    Ok((client, rx))
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<CliEvent>,
    pred: impl Fn(&CliEvent) -> bool,
) -> Option<CliEvent> {
    tokio::time::timeout(REPLY_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// What the CLI needs to know to decide when to exit.
#[derive(Debug)]
enum CliEvent {
    Status(VpnStatus),
    Failed(String),
    ServiceLost,
}

impl CliEvent {
    fn is_final(&self) -> bool {
        matches!(
            self,
            CliEvent::Status(VpnStatus::Disconnected) | CliEvent::Failed(_) | CliEvent::ServiceLost
        )
    }
}

struct ConsoleCallback {
    events: mpsc::UnboundedSender<CliEvent>,
}

impl VpnStatusCallback for ConsoleCallback {
    fn on_status_message(&self, status: VpnStatus, message: &str, data: &StatusData) {
        println!("[{}] {}", status, message);
        for (key, value) in data {
            println!("    {}: {}", key, value);
        }
        let _ = self.events.send(CliEvent::Status(status));
    }

    fn on_command_output(&self, line: &str, stream: LogStream, process_name: &str) {
        match stream {
            LogStream::Stdout => println!("{}> {}", process_name, line),
            LogStream::Stderr => eprintln!("{}! {}", process_name, line),
        }
    }

    fn on_service_log(&self, level: LogLevel, message: &str, _logger_name: &str) {
        if level >= LogLevel::Info {
            eprintln!("service {}: {}", level, message);
        }
    }

    fn on_error(&self, error_message: &str, error_code: ErrorCode, details: Option<&str>) {
        match details {
            Some(details) => eprintln!("Error [{}]: {} ({})", error_code, error_message, details),
            None => eprintln!("Error [{}]: {}", error_code, error_message),
        }
        // a rejected duplicate request does not end the session
        if error_code != ErrorCode::AlreadyInProgress {
            let _ = self.events.send(CliEvent::Failed(error_message.to_string()));
        }
    }

    fn on_service_connection(&self, connected: bool) {
        if !connected {
            let _ = self.events.send(CliEvent::ServiceLost);
        }
    }
}
