use anyhow::{bail, Context};
use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use umb_hub::{HubConfig, PendingPolicy, PluginHub};

#[derive(Clone, Debug)]
struct Config {
    hub: HubConfig,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "umb-hub-rs")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 30)]
    command_timeout: u64,
    #[arg(long, default_value_t = 15)]
    keep_alive_interval: u64,
    #[arg(long, default_value_t = 30)]
    server_timeout: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value = "")]
    pending_on_disconnect: String,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = config
        .hub
        .addr
        .parse()
        .with_context(|| format!("invalid hub addr {}", config.hub.addr))?;
    let hub = Arc::new(PluginHub::new(config.hub.clone()));
    hub.clone().start_reaper();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        event = "hub_start",
        addr = %addr,
        pending_on_disconnect = %config.hub.pending_on_disconnect
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let served = umb_hub::serve(hub.clone(), listener, shutdown).await;
    hub.shutdown();
    if let Err(err) = served {
        error!(event = "hub_error", error = %err);
        return Err(err.into());
    }
    info!(event = "hub_stop");
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let debug = args.debug || env_true("UMB_HUB_DEBUG");
    let pending_raw = resolve_flag(&args.pending_on_disconnect, "UMB_PENDING_ON_DISCONNECT");
    let pending_on_disconnect = match pending_raw {
        Some(raw) => raw.parse::<PendingPolicy>().map_err(anyhow::Error::msg)?,
        None => PendingPolicy::default(),
    };
    if args.queue_capacity == 0 {
        bail!("--queue-capacity must be at least 1");
    }
    let hub = HubConfig {
        addr: resolve_flag(&args.addr, "UMB_HUB_ADDR")
            .unwrap_or_else(|| umb_hub::config::DEFAULT_HUB_ADDR.to_string()),
        command_timeout: Duration::from_secs(args.command_timeout),
        keep_alive_interval: Duration::from_secs(args.keep_alive_interval),
        server_timeout: Duration::from_secs(args.server_timeout),
        queue_capacity: args.queue_capacity,
        write_timeout: Duration::from_secs(args.write_timeout),
        pending_on_disconnect,
    };
    Ok(Config {
        hub,
        debug,
        log_dir: resolve_flag(&args.log_dir, "UMB_LOG_DIR").unwrap_or_else(|| ".umb/logs".to_string()),
    })
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("UMB_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.hub.addr) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, addr: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let port = addr.rsplit(':').next().unwrap_or("hub");
    let path = dir.join(format!("umb-hub-{port}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => umb_core::config::is_truthy(&value),
        Err(_) => false,
    }
}

fn resolve_flag(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    std::env::var(env_key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
