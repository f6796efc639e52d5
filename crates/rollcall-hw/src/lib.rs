//! rollcall-hw — Hardware boundary for the attendance engine.
//!
//! Provides the remote MJPEG frame source with reconnect/backoff, a local
//! V4L2 fallback camera, frame utilities, and the ESP32 display/buzzer
//! bridge.

pub mod camera;
pub mod frame;
pub mod notifier;
pub mod stream;

pub use camera::{CameraError, CameraSource, PixelFormat};
pub use frame::Frame;
pub use notifier::{BuzzerTone, Notification, NotifierClient, NotifyError, LCD_COLUMNS};
pub use stream::{Backoff, FrameSource, MjpegSource, StreamConfig, StreamError};
