// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global logger instance.
//!
//! A process-wide singleton holding the installed [`Output`] and the minimum
//! level. Initialization is one-shot; later calls are ignored so libraries
//! embedding the runtime cannot hijack an application's logger.

use super::output::{LogLevel, Output};
use std::sync::{Arc, OnceLock};

static LOGGER: OnceLock<GlobalLogger> = OnceLock::new();

struct GlobalLogger {
    output: Arc<dyn Output>,
    level_filter: LogLevel,
}

/// Install the global log output.
///
/// Only the first call has any effect. Messages emitted before installation
/// are dropped.
pub fn init_logger(output: Arc<dyn Output>, level: LogLevel) {
    let _ = LOGGER.set(GlobalLogger {
        output,
        level_filter: level,
    });
}

/// Emit a message through the installed output, if any.
///
/// Called by the logging macros; write failures are swallowed because a
/// broken log sink must never take the runtime down with it.
#[inline]
pub fn log_message(level: LogLevel, message: &str) {
    if let Some(logger) = LOGGER.get() {
        if level >= logger.level_filter {
            let _ = logger.output.write(level, message);
        }
    }
}

/// Flush the installed output. Safe to call before installation.
pub fn flush_logger() {
    if let Some(logger) = LOGGER.get() {
        let _ = logger.output.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::output::ConsoleOutput;

    #[test]
    fn test_log_before_init_is_noop() {
        log_message(LogLevel::Error, "dropped on the floor");
        flush_logger();
    }

    #[test]
    fn test_init_is_one_shot() {
        init_logger(Arc::new(ConsoleOutput::new()), LogLevel::Warning);
        init_logger(Arc::new(ConsoleOutput::new()), LogLevel::Debug);
        log_message(LogLevel::Info, "filtered by the first installation");
    }
}
