//! Egress tunnel supervision
//!
//! Spawns one of several tunnel provider binaries, parses its startup output
//! for the public URL, and keeps the child for the lifetime of the handle.
//! The tunnel's HTTP origin is added to the runtime origin allow-set on
//! start and cleared on stop. A missing provider binary is not an error:
//! the gateway runs without a public URL.

use regex::Regex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::origin::OriginPolicy;
use crate::types::{GatewayError, Result};

/// How long a provider gets to publish its URL after spawn
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `stop` waits after signalling before abandoning the child
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Supported tunnel providers, in autodetection order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProvider {
    Cloudflared,
    Ngrok,
    Localxpose,
    Zrok,
}

impl TunnelProvider {
    pub const AUTODETECT_ORDER: [TunnelProvider; 4] = [
        TunnelProvider::Cloudflared,
        TunnelProvider::Ngrok,
        TunnelProvider::Localxpose,
        TunnelProvider::Zrok,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cloudflared" => Some(TunnelProvider::Cloudflared),
            "ngrok" => Some(TunnelProvider::Ngrok),
            "localxpose" => Some(TunnelProvider::Localxpose),
            "zrok" => Some(TunnelProvider::Zrok),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunnelProvider::Cloudflared => "cloudflared",
            TunnelProvider::Ngrok => "ngrok",
            TunnelProvider::Localxpose => "localxpose",
            TunnelProvider::Zrok => "zrok",
        }
    }

    /// Binary on PATH; localxpose ships as `loclx`
    pub fn binary(&self) -> &'static str {
        match self {
            TunnelProvider::Cloudflared => "cloudflared",
            TunnelProvider::Ngrok => "ngrok",
            TunnelProvider::Localxpose => "loclx",
            TunnelProvider::Zrok => "zrok",
        }
    }

    /// The one place each provider's URL pattern lives. Ngrok is special:
    /// its URL arrives as the `url` field of a JSON log line.
    fn url_pattern(&self) -> Option<&'static str> {
        match self {
            TunnelProvider::Cloudflared => Some(r"https://[a-z0-9-]+\.trycloudflare\.com"),
            TunnelProvider::Ngrok => None,
            TunnelProvider::Localxpose => Some(r"https?://[^\s]+\.loclx\.io"),
            TunnelProvider::Zrok => Some(r"https?://[^\s]+\.zrok\.[^\s]+"),
        }
    }

    /// Extract the public URL from one line of provider output
    fn extract_url(&self, line: &str) -> Option<String> {
        match self.url_pattern() {
            Some(pattern) => {
                let re = Regex::new(pattern).expect("provider URL pattern");
                re.find(line).map(|m| m.as_str().to_string())
            }
            None => {
                // ngrok with --log-format json
                let log: serde_json::Value = serde_json::from_str(line).ok()?;
                log.get("url")
                    .and_then(serde_json::Value::as_str)
                    .filter(|u| u.starts_with("http"))
                    .map(String::from)
            }
        }
    }
}

/// What to launch
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// `auto`, `none`, or a provider name
    pub provider: String,
    /// Local gateway port the tunnel forwards to
    pub port: u16,
    pub auth_token: Option<String>,
    pub domain: Option<String>,
}

impl TunnelConfig {
    pub fn from_args(args: &crate::config::Args) -> Self {
        Self {
            provider: args.tunnel_provider.clone(),
            port: args.listen.port(),
            auth_token: args.tunnel_auth_token.clone(),
            domain: args.tunnel_domain.clone(),
        }
    }
}

/// A running tunnel. Dropping the handle abandons the child; call `stop`.
pub struct TunnelHandle {
    /// Gateway URL clients dial (`wss://...`)
    pub public_url: String,
    /// HTTP origin of the tunnel (`https://...`)
    pub public_origin: String,
    pub provider: &'static str,
    child: Mutex<Option<Child>>,
    origin: Arc<OriginPolicy>,
}

impl TunnelHandle {
    /// Signal the child and wait briefly for it to exit. Idempotent; clears
    /// the runtime origin allow-set.
    pub async fn stop(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(_) => info!(provider = self.provider, "tunnel stopped"),
            Err(_) => warn!(
                provider = self.provider,
                "tunnel did not exit after signal, abandoning"
            ),
        }

        self.origin.clear_runtime();
    }
}

/// Start the configured tunnel, if any.
///
/// Returns `Ok(None)` when no provider is configured or the chosen binary is
/// unavailable; the gateway keeps running without a public URL.
pub async fn start(config: &TunnelConfig, origin: Arc<OriginPolicy>) -> Result<Option<TunnelHandle>> {
    let provider = match config.provider.as_str() {
        "none" => return Ok(None),
        "auto" => match autodetect().await {
            Some(provider) => provider,
            None => {
                info!("no tunnel provider binary found, continuing without tunnel");
                return Ok(None);
            }
        },
        name => match TunnelProvider::from_name(name) {
            Some(provider) if is_available(provider).await => provider,
            Some(provider) => {
                warn!(
                    binary = provider.binary(),
                    "tunnel provider binary unavailable, continuing without tunnel"
                );
                return Ok(None);
            }
            None => {
                warn!(provider = name, "unknown tunnel provider, continuing without tunnel");
                return Ok(None);
            }
        },
    };

    if let Some(ref token) = config.auth_token {
        run_auth_step(provider, token).await?;
    }

    let mut child = spawn_tunnel(provider, config)?;

    let public_origin = match tokio::time::timeout(
        STARTUP_TIMEOUT,
        await_public_url(provider, &mut child),
    )
    .await
    {
        Ok(Some(url)) => url.trim_end_matches('/').to_string(),
        Ok(None) => {
            let _ = child.start_kill();
            return Err(GatewayError::internal(format!(
                "{} exited before publishing a URL",
                provider.name()
            )));
        }
        Err(_) => {
            let _ = child.start_kill();
            return Err(GatewayError::internal(format!(
                "{} startup timed out (30s)",
                provider.name()
            )));
        }
    };

    let public_url = to_ws_url(&public_origin);
    origin.allow_runtime(&public_origin);
    info!(
        provider = provider.name(),
        url = %public_url,
        origin = %public_origin,
        "tunnel established"
    );

    Ok(Some(TunnelHandle {
        public_url,
        public_origin,
        provider: provider.name(),
        child: Mutex::new(Some(child)),
        origin,
    }))
}

/// First available provider in preference order
pub async fn autodetect() -> Option<TunnelProvider> {
    for provider in TunnelProvider::AUTODETECT_ORDER {
        if is_available(provider).await {
            return Some(provider);
        }
    }
    None
}

/// Probe `<binary> --version` to confirm the provider is installed
async fn is_available(provider: TunnelProvider) -> bool {
    Command::new(provider.binary())
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// One-time account/token setup some providers need before sharing
async fn run_auth_step(provider: TunnelProvider, token: &str) -> Result<()> {
    let args: &[&str] = match provider {
        TunnelProvider::Ngrok => &["config", "add-authtoken"],
        TunnelProvider::Localxpose => &["account", "login", "--token"],
        _ => return Ok(()),
    };

    let status = Command::new(provider.binary())
        .args(args)
        .arg(token)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| {
            GatewayError::internal(format!("{} auth step failed: {}", provider.name(), e))
        })?;

    if !status.success() {
        warn!(provider = provider.name(), "auth step exited non-zero");
    }
    Ok(())
}

fn spawn_tunnel(provider: TunnelProvider, config: &TunnelConfig) -> Result<Child> {
    let local = format!("http://localhost:{}", config.port);
    let mut command = Command::new(provider.binary());

    match provider {
        TunnelProvider::Cloudflared => {
            command.args(["tunnel", "--url", local.as_str()]);
            if let Some(ref domain) = config.domain {
                command.args(["--hostname", domain.as_str()]);
            }
        }
        TunnelProvider::Ngrok => {
            let port = config.port.to_string();
            command.args([
                "http",
                port.as_str(),
                "--log",
                "stdout",
                "--log-format",
                "json",
            ]);
            if let Some(ref domain) = config.domain {
                command.args(["--domain", domain.as_str()]);
            }
        }
        TunnelProvider::Localxpose => {
            let to = format!("localhost:{}", config.port);
            command.args(["tunnel", "http", "--to", to.as_str()]);
            if let Some(ref domain) = config.domain {
                command.args(["--subdomain", domain.as_str()]);
            }
        }
        TunnelProvider::Zrok => {
            command.args(["share", "public", local.as_str()]);
        }
    }

    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| {
            GatewayError::internal(format!("spawning {}: {}", provider.binary(), e))
        })
}

/// Watch the child's stdout and stderr for the provider's URL
async fn await_public_url(provider: TunnelProvider, child: &mut Child) -> Option<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx.clone());
    }
    drop(tx);

    while let Some(line) = rx.recv().await {
        debug!(provider = provider.name(), line = %line, "tunnel output");
        if let Some(url) = provider.extract_url(&line) {
            return Some(url);
        }
    }
    None
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Convert the tunnel's HTTP origin into the gateway's WS dial URL
fn to_ws_url(origin: &str) -> String {
    let trimmed = origin.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    }
}
