// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use log::{LevelFilter, Log, Metadata, Record};
use std::sync::{Mutex, Once, PoisonError};

pub type LoggerCallback = Box<dyn Fn(&Record) + Send>;

struct Logger {
    callback: Mutex<Option<LoggerCallback>>,
}

impl Logger {
    fn update(&self, callback: LoggerCallback) {
        let mut cur = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        *cur = Some(callback);
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, rec: &Record) {
        if !self.enabled(rec.metadata()) {
            return;
        }

        let callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = callback.as_ref() {
            callback(rec);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger {
    callback: Mutex::new(None),
};

/// Routes log records up to `filter` to `callback`.  Can be called again to replace both.
pub fn init(filter: LevelFilter, callback: LoggerCallback) {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = log::set_logger(&LOGGER);
    });

    LOGGER.update(callback);
    log::set_max_level(filter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_init() {
        let msgs = Arc::new(Mutex::new(Vec::new()));

        let sink = msgs.clone();
        init(
            LevelFilter::Warn,
            Box::new(move |rec| {
                let msg = format!("{}", rec.args());
                // other tests may log concurrently
                if msg.starts_with("log-test") {
                    sink.lock().unwrap().push(msg);
                }
            }),
        );

        log::warn!("log-test kept");
        log::info!("log-test filtered");
        log::error!("log-test also kept");

        let msgs = msgs.lock().unwrap();
        assert_eq!(
            *msgs,
            vec!["log-test kept".to_string(), "log-test also kept".to_string()]
        );
    }
}
