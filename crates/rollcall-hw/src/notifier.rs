//! ESP32 display/buzzer bridge.
//!
//! The microcontroller exposes a tiny HTTP API on the classroom LAN: a 16×2
//! LCD fed via `POST /lcd` and a buzzer triggered via `GET /buzzer/success`
//! or `GET /buzzer/error`. Delivery is best-effort with a short timeout and
//! must never stall or fail the caller's pipeline — callers log the error
//! and move on.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Character width of one LCD line.
pub const LCD_COLUMNS: usize = 16;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("hardware unreachable: {0}")]
    Unreachable(String),
    #[error("hardware rejected command: http {0}")]
    Rejected(u16),
}

/// Buzzer pattern: short beep for success, long/double beep for failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzerTone {
    Success,
    Failure,
}

impl BuzzerTone {
    fn endpoint(&self) -> &'static str {
        match self {
            BuzzerTone::Success => "/buzzer/success",
            BuzzerTone::Failure => "/buzzer/error",
        }
    }
}

/// One piece of hardware feedback: two display lines plus a tone.
#[derive(Debug, Clone)]
pub struct Notification {
    pub line1: String,
    pub line2: String,
    pub tone: BuzzerTone,
}

#[derive(Serialize)]
struct LcdPayload<'a> {
    line1: &'a str,
    line2: &'a str,
}

/// HTTP client for the ESP32 bridge.
pub struct NotifierClient {
    agent: ureq::Agent,
    base_url: String,
}

impl NotifierClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::builder()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Push one notification: display text first, then the tone.
    pub fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = LcdPayload {
            line1: clip(&notification.line1),
            line2: clip(&notification.line2),
        };
        self.post_json("/lcd", &payload)?;
        self.get(notification.tone.endpoint())?;
        Ok(())
    }

    /// Probe the bridge; used by diagnostics, not by the pipeline.
    pub fn ping(&self) -> Result<(), NotifyError> {
        self.get("/status")
    }

    fn post_json(&self, endpoint: &str, payload: &impl Serialize) -> Result<(), NotifyError> {
        let url = format!("{}{endpoint}", self.base_url);
        match self.agent.post(&url).send_json(payload) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(NotifyError::Rejected(code)),
            Err(e) => Err(NotifyError::Unreachable(format!("{url}: {e}"))),
        }
    }

    fn get(&self, endpoint: &str) -> Result<(), NotifyError> {
        let url = format!("{}{endpoint}", self.base_url);
        match self.agent.get(&url).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(NotifyError::Rejected(code)),
            Err(e) => Err(NotifyError::Unreachable(format!("{url}: {e}"))),
        }
    }
}

/// Clip a display line to the LCD width on a character boundary.
fn clip(line: &str) -> &str {
    match line.char_indices().nth(LCD_COLUMNS) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_lcd_width() {
        assert_eq!(clip("short"), "short");
        assert_eq!(clip("exactly sixteen!"), "exactly sixteen!");
        assert_eq!(clip("this line is far too long for the LCD"), "this line is far");
    }

    #[test]
    fn clip_is_char_boundary_safe() {
        let line = "ÅÅÅÅÅÅÅÅÅÅÅÅÅÅÅÅÅÅ"; // 18 two-byte chars
        assert_eq!(clip(line).chars().count(), LCD_COLUMNS);
    }

    #[test]
    fn tone_endpoints() {
        assert_eq!(BuzzerTone::Success.endpoint(), "/buzzer/success");
        assert_eq!(BuzzerTone::Failure.endpoint(), "/buzzer/error");
    }

    #[test]
    fn lcd_payload_shape() {
        let payload = LcdPayload {
            line1: "Attendance OK!",
            line2: "Ada Obi",
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["line1"], "Attendance OK!");
        assert_eq!(value["line2"], "Ada Obi");
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = NotifierClient::new("http://10.0.0.5:80/", Duration::from_millis(500));
        assert_eq!(client.base_url, "http://10.0.0.5:80");
    }
}
