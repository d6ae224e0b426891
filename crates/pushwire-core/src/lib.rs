//! Core domain models and notification storage.
//!
//! Provides the notification and app models with their lifecycle
//! transitions, the [`NotificationStore`] persistence boundary, and the clock
//! abstraction used for every scheduling decision. The delivery engine and
//! the daemon binary depend on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{App, AppId, NewNotification, Notification, NotificationId, Protocol};
pub use storage::{MemoryStore, NotificationStore, PgStore, ReconnectPolicy};
pub use time::{Clock, RealClock, TestClock};
