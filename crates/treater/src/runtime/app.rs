use crate::infra::audit::{capture_entry, dispenser_entry, AuditEventType, AuditLogger};
use crate::runtime::config::{ConfigError, FileConfig, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use treat_core::hal::{DisplayMode, DisplayPort, HalError, HardwarePort, PinDirection, PinId};
use treat_core::{
    Dispenser, SimulatedDisplay, SimulatedFeeder, SimulatedHardware, TimeBase, TreatHistory,
};
use treat_io::{
    serve_api, spawn_capture, spawn_dispenser, ApiError, ApiState, CaptureError, CaptureEvent,
    DispenserEvent, SerialLcd, SysfsGpio,
};

/// Time for one simulated treat to drop past the detector.
const SIM_TREAT_PERIOD: Duration = Duration::from_millis(1500);
const SIM_STEP: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("hardware setup failed: {0}")]
    Hardware(#[from] HalError),

    #[error("capture engine failed to start: {0}")]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("failed to open audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

enum TreaterHardware {
    Simulated(SimulatedHardware),
    Sysfs(SysfsGpio),
}

impl HardwarePort for TreaterHardware {
    fn setup(
        &mut self,
        pin: PinId,
        direction: PinDirection,
        initial: Option<bool>,
    ) -> Result<(), HalError> {
        match self {
            Self::Simulated(hw) => hw.setup(pin, direction, initial),
            Self::Sysfs(hw) => hw.setup(pin, direction, initial),
        }
    }

    fn read(&mut self, pin: PinId) -> Result<bool, HalError> {
        match self {
            Self::Simulated(hw) => hw.read(pin),
            Self::Sysfs(hw) => hw.read(pin),
        }
    }

    fn write(&mut self, pin: PinId, value: bool) -> Result<(), HalError> {
        match self {
            Self::Simulated(hw) => hw.write(pin, value),
            Self::Sysfs(hw) => hw.write(pin, value),
        }
    }

    fn release(&mut self, pin: PinId) -> Result<(), HalError> {
        match self {
            Self::Simulated(hw) => hw.release(pin),
            Self::Sysfs(hw) => hw.release(pin),
        }
    }
}

enum TreaterDisplay {
    Simulated(SimulatedDisplay),
    Serial(SerialLcd<File>),
}

impl DisplayPort for TreaterDisplay {
    fn write_lines(&mut self, line1: &str, line2: &str) -> Result<(), HalError> {
        match self {
            Self::Simulated(d) => d.write_lines(line1, line2),
            Self::Serial(d) => d.write_lines(line1, line2),
        }
    }

    fn set_backlight(&mut self, on: bool) -> Result<(), HalError> {
        match self {
            Self::Simulated(d) => d.set_backlight(on),
            Self::Serial(d) => d.set_backlight(on),
        }
    }

    fn set_display_mode(&mut self, mode: DisplayMode) -> Result<(), HalError> {
        match self {
            Self::Simulated(d) => d.set_display_mode(mode),
            Self::Serial(d) => d.set_display_mode(mode),
        }
    }

    fn clear(&mut self) -> Result<(), HalError> {
        match self {
            Self::Simulated(d) => d.clear(),
            Self::Serial(d) => d.clear(),
        }
    }
}

pub fn run_from_args() -> Result<(), StartupError> {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return Ok(());
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> Result<(), StartupError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    let file = config.resolve()?;
    info!(
        config = ?config.config_path,
        strategy = ?file.camera.strategy,
        simulate = config.simulate,
        "Configuration loaded"
    );

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;
    let handle = runtime.handle().clone();
    runtime.block_on(serve(config, file, handle))
}

fn build_hardware(
    config: &RuntimeConfig,
    file: &FileConfig,
) -> Result<(TreaterHardware, TreaterDisplay, Option<SimulatedFeeder>), StartupError> {
    if config.simulate {
        let pins = file.machine.pins;
        let hw = SimulatedHardware::new();
        // Button released.
        hw.set_input(pins.button, file.machine.button_active_low);
        let feeder = SimulatedFeeder::new(
            hw.clone(),
            pins.treat_power,
            pins.treat_detector,
            SIM_TREAT_PERIOD,
        );
        info!("Using simulated pins, feeder and display");
        return Ok((
            TreaterHardware::Simulated(hw),
            TreaterDisplay::Simulated(SimulatedDisplay::new()),
            Some(feeder),
        ));
    }

    info!(device = %file.display.device.display(), "Opening serial display");
    let display = SerialLcd::open(&file.display.device)?;
    Ok((
        TreaterHardware::Sysfs(SysfsGpio::new()),
        TreaterDisplay::Serial(display),
        None,
    ))
}

fn spawn_feeder(mut feeder: SimulatedFeeder) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SIM_STEP);
        loop {
            ticker.tick().await;
            feeder.step(SIM_STEP);
        }
    })
}

fn spawn_audit_forwarder(
    logger: Arc<AuditLogger>,
    timebase: TimeBase,
    mut machine: broadcast::Receiver<DispenserEvent>,
    mut capture: Option<broadcast::Receiver<CaptureEvent>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let entry = tokio::select! {
                event = machine.recv() => match event {
                    Ok(event) => dispenser_entry(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "audit journal fell behind dispenser events");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = recv_capture(&mut capture) => match event {
                    Ok(event) => Some(capture_entry(&event)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "audit journal fell behind capture events");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        capture = None;
                        None
                    }
                },
            };
            if let Some((event_type, details)) = entry {
                if let Err(e) =
                    logger.log_event(timebase.now_us(), timebase.unix_us(), event_type, details)
                {
                    warn!(error = %e, "failed to write audit entry");
                }
            }
        }
    })
}

async fn recv_capture(
    capture: &mut Option<broadcast::Receiver<CaptureEvent>>,
) -> Result<CaptureEvent, broadcast::error::RecvError> {
    match capture {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn init_audit_logger(audit_path: Option<&PathBuf>) -> Result<Option<Arc<AuditLogger>>, StartupError> {
    audit_path
        .map(|path| match AuditLogger::new(path) {
            Ok(logger) => {
                info!(path = %path.display(), "Audit logging enabled");
                Ok(Arc::new(logger))
            }
            Err(source) => Err(StartupError::Audit {
                path: path.clone(),
                source,
            }),
        })
        .transpose()
}

async fn wait_for_shutdown(run_seconds: Option<u64>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    match run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for limited duration");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = ctrl_c => info!("Ctrl-C received"),
            }
        }
        None => {
            ctrl_c.await;
            info!("Ctrl-C received");
        }
    }
}

async fn serve(
    config: RuntimeConfig,
    file: FileConfig,
    runtime: tokio::runtime::Handle,
) -> Result<(), StartupError> {
    let timebase = TimeBase::new();
    let audit_logger = init_audit_logger(config.audit_path.as_ref())?;

    if let Some(ref logger) = audit_logger {
        let _ = logger.log_event(
            timebase.now_us(),
            timebase.unix_us(),
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "simulate": config.simulate,
                "capture_strategy": file.camera.strategy,
                "api_enabled": file.web.api_addr.is_some(),
            }),
        );
    }

    let (hardware, display, feeder) = build_hardware(&config, &file)?;
    let history = match &file.history.path {
        Some(path) => TreatHistory::open(path),
        None => TreatHistory::in_memory(),
    };

    info!(
        max_treats_per_cycle = file.machine.max_treats_per_cycle,
        treat_enabled_secs = file.machine.treat_enabled_secs,
        treat_recovery_secs = file.machine.treat_recovery_secs,
        "Starting dispenser"
    );
    let dispenser = Dispenser::new(hardware, display, history, timebase, file.machine.clone())?;
    let (dispenser_handle, dispenser_join) = spawn_dispenser(dispenser);
    let feeder_task = feeder.map(spawn_feeder);

    let (capture, _capture_join) = spawn_capture(&file.camera)?;

    let audit_task = audit_logger.clone().map(|logger| {
        spawn_audit_forwarder(
            logger,
            timebase,
            dispenser_handle.subscribe(),
            capture.subscribe(),
        )
    });

    if let Some(addr) = &file.web.api_addr {
        let state = ApiState {
            dispenser: dispenser_handle.clone(),
            capture: capture.clone(),
            capture_dir: file.camera.capture_dir.clone(),
        };
        serve_api(addr, state, runtime)?;
    }

    info!("Treater running");
    wait_for_shutdown(config.run_seconds).await;

    capture.shutdown().await;
    let final_status = dispenser_handle.status().await.ok();
    if dispenser_handle.shutdown().await.is_err() {
        warn!("dispenser task had already stopped");
    }
    if let Err(e) = dispenser_join.await {
        error!(error = %e, "dispenser task ended abnormally");
    }
    if let Some(task) = feeder_task {
        task.abort();
    }
    if let Some(task) = audit_task {
        task.abort();
    }

    if let Some(status) = final_status {
        info!(
            ticks = status.stats.ticks,
            tick_errors = status.stats.tick_errors,
            cycles_completed = status.stats.cycles_completed,
            treats_detected = status.stats.treats_detected,
            dispenses_rejected = status.stats.dispenses_rejected,
            "Run complete"
        );
        if let Some(ref logger) = audit_logger {
            let _ = logger.log_event(
                timebase.now_us(),
                timebase.unix_us(),
                AuditEventType::SystemShutdown,
                serde_json::json!({
                    "cycles_completed": status.stats.cycles_completed,
                    "treats_detected": status.stats.treats_detected,
                    "dispenses_rejected": status.stats.dispenses_rejected,
                }),
            );
        }
    } else if let Some(ref logger) = audit_logger {
        let _ = logger.log_event(
            timebase.now_us(),
            timebase.unix_us(),
            AuditEventType::SystemShutdown,
            serde_json::json!({}),
        );
    }
    Ok(())
}
