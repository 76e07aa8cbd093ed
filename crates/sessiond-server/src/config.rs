use anyhow::{Context, Result, anyhow};
use nix::unistd::Uid;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use libsessiond::ServiceConfig;
use sessiond_protocol::paths;

const DEFAULT_OUTBOUND_QUEUE: usize = 1024;
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub socket_path: PathBuf,
    /// Private directory created with mode 0700; only set when the socket
    /// lives at its default location.
    pub runtime_dir: Option<PathBuf>,
    pub pid_file: PathBuf,
    pub allowed_uid: u32,
    pub outbound_queue: usize,
    pub event_capacity: usize,
}

impl RuntimeConfig {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            event_capacity: self.event_capacity,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub socket_path: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub outbound_queue: Option<usize>,
    pub event_capacity: Option<usize>,
}

#[derive(Debug, Default)]
pub struct Args {
    pub socket_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub outbound_queue: Option<usize>,
}

impl Args {
    pub fn parse() -> Result<Self> {
        Self::parse_from(std::env::args().skip(1))
    }

    fn parse_from(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--socket" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--socket requires a value"))?;
                    parsed.socket_path = Some(PathBuf::from(value));
                }
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--config requires a value"))?;
                    parsed.config_path = Some(PathBuf::from(value));
                }
                "--outbound-queue" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--outbound-queue requires a value"))?;
                    let size = value
                        .parse::<usize>()
                        .with_context(|| format!("invalid --outbound-queue value: {value}"))?;
                    parsed.outbound_queue = Some(size);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    return Err(anyhow!("unknown argument: {other}"));
                }
            }
        }
        Ok(parsed)
    }
}

fn print_help() {
    println!("sessiond-server [--socket PATH] [--config PATH] [--outbound-queue N]");
}

/// Merge CLI arguments over the config file over built-in defaults.
///
/// Without `--config`, the default config path is read if it exists.
pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = match &args.config_path {
        Some(path) => read_file_config(path)?,
        None => {
            let default_path = paths::config_path();
            if default_path.exists() {
                read_file_config(&default_path)?
            } else {
                FileConfig::default()
            }
        }
    };

    let (socket_path, runtime_dir) = match args.socket_path.clone().or(file_cfg.socket_path) {
        Some(path) => (path, None),
        None => (paths::default_socket_path(), Some(paths::default_runtime_dir())),
    };
    let pid_file = file_cfg
        .pid_file
        .unwrap_or_else(|| socket_path.with_extension("pid"));

    let outbound_queue = args
        .outbound_queue
        .or(file_cfg.outbound_queue)
        .unwrap_or(DEFAULT_OUTBOUND_QUEUE);
    if outbound_queue == 0 {
        return Err(anyhow!("outbound_queue must be at least 1"));
    }

    Ok(RuntimeConfig {
        socket_path,
        runtime_dir,
        pid_file,
        allowed_uid: Uid::effective().as_raw(),
        outbound_queue,
        event_capacity: file_cfg.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY),
    })
}

fn read_file_config(path: &std::path::Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}
