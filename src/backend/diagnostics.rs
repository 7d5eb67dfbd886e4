// Diagnostics - validation layer message sink
//
// The debug messenger hands every message to a `DiagnosticsSink` as a
// (severity, category, message) triple. The default sink forwards to the
// `log` crate and optionally appends to a log file.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn from_vk(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Severity::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Severity::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Severity::Info
        } else {
            Severity::Verbose
        }
    }

    fn level(self) -> log::Level {
        match self {
            Severity::Error => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Info => log::Level::Debug,
            Severity::Verbose => log::Level::Trace,
        }
    }
}

pub fn category_name(types: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// Receiver for backend diagnostic messages.
///
/// May be called from driver threads, hence `Send + Sync`.
pub trait DiagnosticsSink: Send + Sync {
    fn message(&self, severity: Severity, category: &str, message: &str);
}

/// Forwards diagnostics to `log`, and to a file when one is configured
pub struct LogSink {
    file: Option<Mutex<File>>,
}

impl LogSink {
    pub fn new(log_file: Option<&Path>) -> Result<Self> {
        let file = match log_file {
            Some(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .with_context(|| format!("Failed to open debug log file {:?}", path))?;
                writeln!(file, "=== Vulkan Renderer Log ===")?;
                writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
                writeln!(file)?;
                Some(Mutex::new(file))
            }
            None => None,
        };

        Ok(Self { file })
    }
}

impl DiagnosticsSink for LogSink {
    fn message(&self, severity: Severity, category: &str, message: &str) {
        log::log!(severity.level(), "[Vulkan/{}] {}", category, message);

        if let Some(file) = &self.file {
            // Best effort; a failing log file must not take the renderer down
            let _ = writeln!(file.lock(), "[{:?}] [{}] {}", severity, category, message);
        }
    }
}

/// Debug messenger callback. `p_user_data` points at an `Arc<dyn DiagnosticsSink>`
/// owned by the instance for the messenger's whole lifetime.
pub(crate) unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }

    let sink = &*(p_user_data as *const Arc<dyn DiagnosticsSink>);
    let data = &*p_callback_data;
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };

    sink.message(Severity::from_vk(message_severity), category_name(message_type), &message);

    vk::FALSE
}
