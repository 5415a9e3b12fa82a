use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use treat_core::config::{CaptureConfig, CaptureStrategy, DispenserConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] treat_core::ConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Serial character display. Baud rate is set on the device beforehand.
    pub device: PathBuf,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyAMA0"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Treat history file. Kept in memory only when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub api_addr: Option<String>,
}

/// Contents of the `--config` TOML file. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub machine: DispenserConfig,
    pub camera: CaptureConfig,
    pub display: DisplayConfig,
    pub history: HistoryConfig,
    pub web: WebConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.machine.validate()?;
        self.camera.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub config_path: Option<PathBuf>,
    pub simulate: bool,
    pub no_camera: bool,
    pub api_addr: Option<String>,
    pub history_path: Option<PathBuf>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            config_path: None,
            simulate: false,
            no_camera: false,
            api_addr: None,
            history_path: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--run-seconds" => {
                    if i + 1 < args.len() {
                        cfg.run_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "-C" | "--config" => {
                    if i + 1 < args.len() {
                        cfg.config_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--no-camera" => {
                    cfg.no_camera = true;
                }
                "--api-addr" => {
                    if i + 1 < args.len() {
                        cfg.api_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--history" => {
                    if i + 1 < args.len() {
                        cfg.history_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    if i + 1 < args.len() {
                        cfg.log_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--audit-log" => {
                    if i + 1 < args.len() {
                        cfg.audit_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    /// Load the config file (if any) and fold the command-line overrides
    /// into it.
    pub fn resolve(&self) -> Result<FileConfig, ConfigError> {
        let mut file = match &self.config_path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        if self.no_camera {
            file.camera.strategy = CaptureStrategy::Disabled;
        }
        if let Some(addr) = &self.api_addr {
            file.web.api_addr = Some(addr.clone());
        }
        if let Some(path) = &self.history_path {
            file.history.path = Some(path.clone());
        }
        file.validate()?;
        Ok(file)
    }

    pub fn print_help() {
        println!(
            r#"Treater - automated pet-treat dispenser

USAGE:
    treater [OPTIONS]

OPTIONS:
    -C, --config <PATH>     TOML config file ([machine] [camera] [display] [history] [web])
    --simulate              Use simulated pins, feeder and display instead of hardware
    --no-camera             Disable image capture
    --api-addr <ADDR>       Serve the request surface on address (e.g., 0.0.0.0:8080)
    --history <PATH>        Treat history file (in memory when unset)
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write daily-rolling JSON logs to this directory
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,treat_core=trace)

EXAMPLES:
    # Run on the device with the request surface and metrics
    treater -C /etc/treater.toml --api-addr 0.0.0.0:8080 --metrics-addr 0.0.0.0:9090

    # Short simulated run
    treater --simulate --no-camera --run-seconds 10
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("treater")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parses_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--simulate",
            "--api-addr",
            "127.0.0.1:8080",
            "--run-seconds",
            "5",
            "-C",
            "/etc/treater.toml",
            "--bogus",
        ]));
        assert!(cfg.simulate);
        assert_eq!(cfg.api_addr.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(cfg.run_seconds, Some(5));
        assert_eq!(cfg.config_path, Some(PathBuf::from("/etc/treater.toml")));
        assert!(!cfg.show_help);
    }

    #[test]
    fn file_sections_override_defaults() {
        let file = FileConfig::parse(
            r#"
            [machine]
            max_treats_per_cycle = 3
            treat_recovery_secs = 30.0

            [machine.pins]
            button = 23

            [camera]
            strategy = "motion"
            captures_to_retain = 20

            [camera.motion]
            motion_sensitivity = 50

            [display]
            device = "/dev/ttyUSB0"

            [web]
            api_addr = "0.0.0.0:8080"
            "#,
        )
        .unwrap();

        assert_eq!(file.machine.max_treats_per_cycle, 3);
        assert_eq!(file.machine.treat_recovery_secs, 30.0);
        assert_eq!(file.machine.pins.button.0, 23);
        assert_eq!(file.machine.pins.treat_power.0, 25);
        assert_eq!(file.camera.strategy, CaptureStrategy::Motion);
        assert_eq!(file.camera.motion.motion_sensitivity, 50);
        assert_eq!(file.camera.motion.motion_threshold, 10);
        assert_eq!(file.display.device, PathBuf::from("/dev/ttyUSB0"));
        assert!(file.validate().is_ok());
    }

    #[test]
    fn command_line_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("treater.toml");
        std::fs::write(&path, "[web]\napi_addr = \"0.0.0.0:80\"\n").unwrap();

        let cfg = RuntimeConfig::from_args(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--api-addr",
            "127.0.0.1:9000",
            "--no-camera",
        ]));
        let file = cfg.resolve().unwrap();
        assert_eq!(file.web.api_addr.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(file.camera.strategy, CaptureStrategy::Disabled);
    }

    #[test]
    fn invalid_file_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("treater.toml");
        std::fs::write(&path, "[camera]\ncaptures_to_retain = 0\n").unwrap();

        let cfg = RuntimeConfig {
            config_path: Some(path),
            ..RuntimeConfig::default()
        };
        assert!(matches!(cfg.resolve(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let cfg = RuntimeConfig {
            config_path: Some(PathBuf::from("/nonexistent/treater.toml")),
            ..RuntimeConfig::default()
        };
        assert!(matches!(cfg.resolve(), Err(ConfigError::Read { .. })));
    }
}
