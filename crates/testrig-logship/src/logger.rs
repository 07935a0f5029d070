//! A `log` backend that ships every record.

use crate::buffer::BufferedHandler;
use crate::http::Delivery;
use crate::record::LogRecord;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Targets of the delivery stack itself; shipping them would feed back
/// into the flush that produced them.
const DELIVERY_TARGETS: &[&str] = &["reqwest", "hyper", "h2", "rustls", "testrig_logship"];

pub struct ShippingLogger<D: Delivery> {
    handler: BufferedHandler<D>,
    level: LevelFilter,
}

impl<D: Delivery> ShippingLogger<D> {
    pub fn new(handler: BufferedHandler<D>, level: LevelFilter) -> Self {
        Self { handler, level }
    }

    pub fn handler(&self) -> &BufferedHandler<D> {
        &self.handler
    }

    /// Make this the process-wide logger.
    ///
    /// Returns a handle to the buffer so the caller can `close()` it at exit.
    pub fn install(self) -> Result<BufferedHandler<D>, SetLoggerError> {
        let handler = self.handler.clone();
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(handler)
    }
}

fn from_delivery_stack(target: &str) -> bool {
    DELIVERY_TARGETS.iter().any(|prefix| {
        target == *prefix || target.strip_prefix(prefix).is_some_and(|rest| rest.starts_with("::"))
    })
}

impl<D: Delivery> Log for ShippingLogger<D> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level && !from_delivery_stack(metadata.target())
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.handler.append(LogRecord::from(record));
        }
    }

    fn flush(&self) {
        if let Err(err) = self.handler.flush() {
            self.handler.retain_error(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ChannelDelivery, FailingDelivery};
    use log::Level;
    use std::time::Duration;

    const LONG: Duration = Duration::from_secs(3600);

    fn emit(logger: &dyn Log, level: Level, target: &str, message: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target(target)
                .args(format_args!("{}", message))
                .build(),
        );
    }

    #[test]
    fn ships_enabled_records_on_flush() {
        let (delivery, batches) = ChannelDelivery::new();
        let logger = ShippingLogger::new(
            BufferedHandler::new(delivery, 100, LONG).unwrap(),
            LevelFilter::Info,
        );

        emit(&logger, Level::Debug, "testrig_fixture::process", "noise");
        emit(&logger, Level::Info, "testrig_fixture::process", "[mongod:20000] waiting");
        emit(&logger, Level::Warn, "reqwest::connect", "retrying");
        emit(&logger, Level::Error, "testrig_hooks::job", "Job 0: failed");
        assert_eq!(logger.handler().buffered(), 2);

        logger.flush();
        let batch = batches.try_recv().unwrap();
        let shipped: Vec<(&str, &str)> = batch
            .iter()
            .map(|r| (r.level.as_str(), r.message.as_str()))
            .collect();
        assert_eq!(
            shipped,
            vec![("INFO", "[mongod:20000] waiting"), ("ERROR", "Job 0: failed")]
        );
    }

    #[test]
    fn flush_failures_wait_for_close() {
        let logger = ShippingLogger::new(
            BufferedHandler::new(FailingDelivery, 100, LONG).unwrap(),
            LevelFilter::Trace,
        );
        emit(&logger, Level::Info, "testrig_hooks::stepdown", "stepping down");
        logger.flush();

        let err = logger.handler().close().unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn delivery_stack_targets_are_matched_by_path() {
        assert!(from_delivery_stack("reqwest"));
        assert!(from_delivery_stack("hyper::client::pool"));
        assert!(!from_delivery_stack("hyperloglog"));
        assert!(!from_delivery_stack("testrig_hooks::job"));
    }
}
