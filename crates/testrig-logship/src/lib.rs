//! Buffered shipping of structured log records to a remote collector.
//!
//! Records are appended to a [`BufferedHandler`] without blocking on the
//! network.  A background timer flushes the buffer every interval, or right
//! away once it reaches capacity, and hands the batch to a [`Delivery`].
//! [`HttpDelivery`] posts it as a JSON array, retrying transient statuses
//! with exponential backoff.
//!
//! # Example
//!
//! ```no_run
//! use log::LevelFilter;
//! use testrig_logship::{BufferedHandler, HttpDelivery, ShipperConfig, ShippingLogger};
//!
//! let config = ShipperConfig {
//!     url_root: "https://logs.example.com".into(),
//!     endpoint: "build/42/test/7".into(),
//!     username: "runner".into(),
//!     password: Some("secret".into()),
//!     ..ShipperConfig::default()
//! };
//! let handler = BufferedHandler::new(HttpDelivery::new(&config)?, config.capacity, config.interval())?;
//! let handler = ShippingLogger::new(handler, LevelFilter::Info).install()?;
//!
//! log::info!("job 0 started");
//! handler.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod http;
pub mod logger;
pub mod record;
pub mod timer;
#[cfg(test)]
mod testutil;

pub use buffer::BufferedHandler;
pub use config::{RetryPolicy, ShipperConfig};
pub use error::DeliveryError;
pub use http::{Delivery, HttpDelivery};
pub use logger::ShippingLogger;
pub use record::LogRecord;
pub use timer::{Scheduler, TimerHandle};
