pub mod api;
pub mod capture;
pub mod dispenser_task;
pub mod gpio_sysfs;
pub mod lcd_serial;
pub mod metrics;

pub use api::{serve_api, ApiError, ApiState};
pub use capture::{spawn_capture, CaptureError, CaptureEvent, CaptureHandle, MotionStatus};
pub use dispenser_task::{spawn_dispenser, DispenserEvent, DispenserGone, DispenserHandle, DispenserStatus};
pub use gpio_sysfs::SysfsGpio;
pub use lcd_serial::SerialLcd;
pub use metrics::{init_metrics, serve_metrics};
