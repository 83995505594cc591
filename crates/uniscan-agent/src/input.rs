//! Input execution capability.
//!
//! Focusing a window and emitting keystrokes is platform code that lives
//! behind [`InputDriver`]. The queue only sees success, the method used, or
//! an [`ExecError`] whose code is reported to the gateway.

use tracing::info;

use crate::config::TargetWindow;

/// Key pressed after the barcode text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixKey {
    Enter,
    Tab,
    None,
}

impl SuffixKey {
    /// Case-insensitive; anything unrecognised means no suffix.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "enter" | "return" => Self::Enter,
            "tab" => Self::Tab,
            _ => Self::None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "Enter",
            Self::Tab => "Tab",
            Self::None => "None",
        }
    }
}

/// Failure inside a driver primitive.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

/// Why one execution attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("target window not found")]
    TargetNotFound,

    #[error("focus failed: {0}")]
    FocusFail(String),

    #[error("input injection failed: {0}")]
    SendInputFail(String),

    #[error("suffix key failed: {0}")]
    SuffixFail(String),
}

impl ExecError {
    /// Code carried in `deliverAck.error`.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TargetNotFound => "TARGET_NOT_FOUND",
            Self::FocusFail(_) => "FOCUS_FAIL",
            Self::SendInputFail(_) => "SENDINPUT_FAIL",
            Self::SuffixFail(_) => "SUFFIX_FAIL",
        }
    }
}

/// Platform keystroke capability. Calls block; the queue runs them on the
/// blocking pool.
pub trait InputDriver: Send + Sync {
    /// `Ok(false)` when nothing matches.
    fn find_target(&self, target: &TargetWindow) -> Result<bool, DriverError>;
    fn focus(&self, target: &TargetWindow) -> Result<(), DriverError>;
    /// Type `text`, returning the name of the method that worked.
    fn type_text(&self, text: &str) -> Result<String, DriverError>;
    fn press_suffix(&self, key: SuffixKey) -> Result<(), DriverError>;
}

/// One attempt: locate and focus the target (when configured), type, then
/// press the suffix key. Returns the input method.
pub fn execute_once(
    driver: &dyn InputDriver,
    target: Option<&TargetWindow>,
    barcode: &str,
    suffix: SuffixKey,
) -> Result<String, ExecError> {
    if let Some(target) = target {
        match driver.find_target(target) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(ExecError::TargetNotFound),
        }
        driver
            .focus(target)
            .map_err(|e| ExecError::FocusFail(e.0))?;
    }
    let method = driver
        .type_text(barcode)
        .map_err(|e| ExecError::SendInputFail(e.0))?;
    if suffix != SuffixKey::None {
        driver
            .press_suffix(suffix)
            .map_err(|e| ExecError::SuffixFail(e.0))?;
    }
    Ok(method)
}

/// Headless driver: logs what it would type and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDriver;

impl InputDriver for LogDriver {
    fn find_target(&self, _target: &TargetWindow) -> Result<bool, DriverError> {
        Ok(true)
    }

    fn focus(&self, _target: &TargetWindow) -> Result<(), DriverError> {
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<String, DriverError> {
        info!(barcode = %text, "Typing barcode");
        Ok("log".to_string())
    }

    fn press_suffix(&self, key: SuffixKey) -> Result<(), DriverError> {
        info!(key = key.as_str(), "Pressing suffix key");
        Ok(())
    }
}
