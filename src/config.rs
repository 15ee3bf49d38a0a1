//! Environment configuration.
//!
//! The daemon takes no command-line arguments besides `--help`; everything is
//! configured through `KND_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Watchdog timeout while the sensor is starting up.
    pub init_timeout: Duration,
    /// Watchdog timeout once frames are flowing.
    pub run_timeout: Duration,
    /// Zone catalog save directory; zones are not persisted without it.
    pub savedir: Option<PathBuf>,
    /// Minimum interval between catalog saves.
    pub save_interval: Duration,
    /// TCP listen port.
    pub port: u16,
    /// Zero-based sensor device index.
    pub device: usize,
}

fn default_init_timeout() -> f64 {
    7.0
}
fn default_run_timeout() -> f64 {
    0.75
}
fn default_port() -> u16 {
    crate::DEFAULT_PORT
}

/// Parses a float env var, falling back to `default` when unset or garbage.
fn env_secs(name: &str, default: f64) -> Duration {
    let secs = match env::var(name) {
        Ok(v) => match v.trim().parse::<f64>() {
            Ok(s) if s > 0.0 => {
                tracing::info!("Setting {} to {}", name, s);
                s
            }
            _ => {
                tracing::warn!("Ignoring unparseable {}={:?}", name, v);
                default
            }
        },
        Err(_) => default,
    };
    Duration::from_secs_f64(secs)
}

impl Config {
    pub fn from_env() -> Self {
        let savedir = env::var_os("KND_SAVEDIR").map(PathBuf::from);
        if let Some(dir) = &savedir {
            tracing::info!("Setting save location to '{}'", dir.display());
        }

        let port = env::var("KND_PORT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(default_port);

        let device = env::var("KND_DEVICE")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        Self {
            init_timeout: env_secs("KND_INITTIMEOUT", default_init_timeout()),
            run_timeout: env_secs("KND_RUNTIMEOUT", default_run_timeout()),
            savedir,
            save_interval: Duration::from_secs(2),
            port,
            device,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs_f64(default_init_timeout()),
            run_timeout: Duration::from_secs_f64(default_run_timeout()),
            savedir: None,
            save_interval: Duration::from_secs(2),
            port: default_port(),
            device: 0,
        }
    }
}

pub fn usage(program: &str) {
    println!("Usage:");
    println!("\t{program}");
    println!("\nEnvironment variables:");
    println!("\tKND_INITTIMEOUT - Initialization timeout (defaults to 7 seconds)");
    println!("\tKND_RUNTIMEOUT - Runtime timeout (defaults to 0.75 seconds)");
    println!("\tKND_SAVEDIR - Sets data location (no default; zones are not saved without this variable)");
    println!("\tKND_PORT - TCP listen port (defaults to 14308)");
    println!("\tKND_DEVICE - Zero-based sensor index (defaults to 0)");
    println!("\tKND_LOG_LEVEL - Log filter (tracing EnvFilter syntax)");
    println!("\nExample:");
    println!("\tKND_SAVEDIR=/var/tmp {program}");
}
