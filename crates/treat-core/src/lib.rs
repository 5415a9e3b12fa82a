pub mod capture_cycle;
pub mod capture_name;
pub mod config;
pub mod dispenser;
pub mod hal;
#[cfg(any(test, feature = "simulation"))]
pub mod hal_sim;
pub mod history;
pub mod machine;
pub mod motion;
pub mod status;
pub mod timebase;

pub use capture_cycle::{CaptureCycle, CaptureCycleState, CycleAction};
pub use capture_name::{CaptureNameError, CaptureRecord};
pub use config::{CaptureConfig, CaptureStrategy, ConfigError, DispenserConfig};
pub use dispenser::{Dispenser, DispenserStats};
pub use hal::{DisplayMode, DisplayPort, HalError, HardwarePort, HistoryPort, PinDirection, PinId, TreatStats};
#[cfg(any(test, feature = "simulation"))]
pub use hal_sim::{SimulatedDisplay, SimulatedFeeder, SimulatedHardware};
pub use history::{HistoryError, TreatEvent, TreatHistory};
pub use machine::{MachineState, StateKind};
pub use motion::MotionDetector;
pub use status::StatusProjection;
pub use timebase::{Clock, ManualClock, TimeBase};
