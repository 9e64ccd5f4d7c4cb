//! SessionLens CLI - drive a simulated page through the tracker

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use sessionlens_core::channels::console::REPORT_DELAY;
use sessionlens_core::host::LoadEndListener;
use sessionlens_core::prelude::{
    ElementInfo, FetchApi, FetchError, FetchRequest, FetchResponse, HostEvent, LegacyRequest,
    LegacyRequestFactory, LogLevel, MANUAL_TRIGGER, NullConsole, PageEnvironment, TrackerBuilder,
    TrackerConfig,
};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request header carrying the status the simulated network answers with
const STATUS_HEADER: &str = "x-simulated-status";

#[derive(Parser)]
#[command(name = "sessionlens")]
#[command(about = "SessionLens capture engine CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Load configuration from this TOML file instead of the default sources
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a page script through a tracker and print the session report
    Simulate {
        /// Script file; reads stdin when omitted
        script: Option<PathBuf>,

        /// Trigger name recorded on the final report
        #[arg(long, default_value = MANUAL_TRIGGER)]
        trigger: String,

        /// Initial page URL
        #[arg(long, default_value = "https://app.example.com/")]
        url: String,

        /// How long to wait for report delivery before exiting
        #[arg(long, default_value_t = 1000, env = "SESSIONLENS_GRACE_MS")]
        grace_ms: u64,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },
    /// Print the effective configuration
    Config,
    /// Version information
    Version,
}

// single-threaded so bus observers run in emit order
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("sessionlens {}", env!("CARGO_PKG_VERSION"));
            println!("sessionlens-core {}", sessionlens_core::VERSION);
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            script,
            trigger,
            url,
            grace_ms,
            pretty,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let lines = read_script(script.as_ref())?;
            simulate(config, &lines, &trigger, url, Duration::from_millis(grace_ms), pretty).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<TrackerConfig> {
    let config = match path {
        Some(path) => TrackerConfig::from_file(path)?,
        None => TrackerConfig::load()?,
    };
    Ok(config)
}

fn read_script(path: Option<&PathBuf>) -> Result<Vec<String>> {
    let lines = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?
            .lines()
            .map(str::to_string)
            .collect(),
        None => BufReader::new(std::io::stdin())
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .context("failed to read script from stdin")?,
    };
    Ok(lines)
}

async fn simulate(
    config: TrackerConfig,
    lines: &[String],
    trigger: &str,
    url: String,
    grace: Duration,
    pretty: bool,
) -> Result<()> {
    let next_status = Arc::new(AtomicU16::new(200));
    let page = Arc::new(
        PageEnvironment::builder()
            .console(Arc::new(NullConsole))
            .fetch(Arc::new(SimulatedFetch))
            .legacy_requests(Arc::new(SimulatedRequests {
                next_status: next_status.clone(),
            }))
            .user_agent(format!("sessionlens-cli/{}", env!("CARGO_PKG_VERSION")))
            .url(url)
            .build(),
    );

    let delivering = config.report_endpoint.is_some();
    let tracker = TrackerBuilder::from_config(config)
        .with_page(page.clone())
        .build()?;
    info!(session_id = %tracker.session_id(), "tracker started");

    for (index, line) in lines.iter().enumerate() {
        run_line(&page, &next_status, line)
            .await
            .with_context(|| format!("script line {}: {}", index + 1, line))?;
    }

    // let pending console-triggered reports fire
    tokio::time::sleep(REPORT_DELAY * 2).await;

    let report = tracker.create_report(trigger);
    let rendered = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{rendered}");

    if delivering {
        debug!(
            grace_ms = whole_millis(grace),
            "waiting for delivery"
        );
        tokio::time::sleep(grace).await;
    }

    tracker.shutdown()?;
    Ok(())
}

async fn run_line(page: &PageEnvironment, next_status: &AtomicU16, line: &str) -> Result<()> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(());
    }

    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "console" => {
            let (level, message) = rest.split_once(' ').unwrap_or((rest, ""));
            let level: LogLevel = serde_json::from_value(json!(level))
                .map_err(|_| anyhow!("unknown console level '{level}'"))?;
            page.console().call(level, &[json!(message)]);
        }
        "error" => page.window.dispatch(&HostEvent::RuntimeError {
            message: rest.to_string(),
            error: json!({ "name": "Error", "message": rest }),
            stack: None,
        }),
        "reject" => page.window.dispatch(&HostEvent::UnhandledRejection {
            reason: json!(rest),
            stack: None,
        }),
        "resource" => {
            let (tag, html) = rest.split_once(' ').unwrap_or((rest, ""));
            let mut element = ElementInfo::new(tag);
            if !html.is_empty() {
                element = element.with_outer_html(html);
            }
            page.window.dispatch(&HostEvent::ResourceError { element });
        }
        "click" => {
            let target = element_arg(rest).map(|(tag, text)| ElementInfo::new(tag).with_text(text));
            page.window.dispatch(&HostEvent::Click { target });
        }
        "input" => {
            let target =
                element_arg(rest).map(|(tag, value)| ElementInfo::new(tag).with_value(value));
            page.window.dispatch(&HostEvent::Input { target });
        }
        "fetch" => {
            let (method, url, status) = request_args(rest)?;
            let request = FetchRequest::new(method, url).header(STATUS_HEADER, status.to_string());
            if let Err(e) = page.fetch(request).await {
                warn!(url, error = %e, "simulated fetch failed");
            }
        }
        "xhr" => {
            let (method, url, status) = request_args(rest)?;
            next_status.store(status, Ordering::SeqCst);
            let mut request = page.new_legacy_request();
            request.open(method, url);
            request.send(None);
        }
        "hide" => page.window.dispatch(&HostEvent::VisibilityChange { hidden: true }),
        "show" => page.window.dispatch(&HostEvent::VisibilityChange { hidden: false }),
        "navigate" => page.set_url(rest),
        "wait" => {
            let millis: u64 = rest.parse().context("wait takes milliseconds")?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        other => bail!("unknown command '{other}'"),
    }
    Ok(())
}

/// Milliseconds in `duration`, saturating at `u64::MAX`
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `TAG rest of line`; an empty argument means an event with no target
fn element_arg(rest: &str) -> Option<(&str, &str)> {
    if rest.is_empty() {
        return None;
    }
    Some(rest.split_once(' ').unwrap_or((rest, "")))
}

/// `METHOD URL [STATUS]`; status `0` simulates a transport failure
fn request_args(rest: &str) -> Result<(&str, &str, u16)> {
    let mut parts = rest.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let url = parts.next().ok_or_else(|| anyhow!("missing url"))?;
    let status = match parts.next() {
        Some(status) => status.parse().context("status must be a number")?,
        None => 200,
    };
    Ok((method, url, status))
}

/// Fetch that answers with the status named in the request header
struct SimulatedFetch;

#[derive(Debug)]
struct SimulatedFailure(String);

impl std::fmt::Display for SimulatedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "network request to {} failed", self.0)
    }
}

impl std::error::Error for SimulatedFailure {}

#[async_trait]
impl FetchApi for SimulatedFetch {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<FetchResponse, FetchError> {
        let status = request
            .headers
            .iter()
            .find(|(name, _)| name == STATUS_HEADER)
            .and_then(|(_, value)| value.parse::<u16>().ok())
            .unwrap_or(200);
        if status == 0 {
            return Err(Box::new(SimulatedFailure(request.url)));
        }
        let mut response = FetchResponse::new(status);
        response.body = Value::Null.to_string().into_bytes();
        Ok(response)
    }
}

struct SimulatedRequests {
    next_status: Arc<AtomicU16>,
}

impl LegacyRequestFactory for SimulatedRequests {
    fn create(&self) -> Box<dyn LegacyRequest> {
        Box::new(SimulatedRequest {
            respond_with: self.next_status.load(Ordering::SeqCst),
            status: 0,
            listeners: Vec::new(),
        })
    }
}

struct SimulatedRequest {
    respond_with: u16,
    status: u16,
    listeners: Vec<LoadEndListener>,
}

impl LegacyRequest for SimulatedRequest {
    fn open(&mut self, _method: &str, _url: &str) {}

    fn send(&mut self, _body: Option<Vec<u8>>) {
        self.status = self.respond_with;
        for listener in self.listeners.drain(..) {
            listener(self.status);
        }
    }

    fn status(&self) -> u16 {
        self.status
    }

    fn add_load_end_listener(&mut self, listener: LoadEndListener) {
        self.listeners.push(listener);
    }
}
