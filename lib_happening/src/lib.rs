//! # lib_happening
//!
//! A TCP event hub. Producers stream `<from>|<sent_on>|<type>\r\n` records to
//! the events port; each record becomes an [`Event`] that is queued for the
//! archiver and broadcast to in-process subscribers. Clients announce an id on
//! the clients port and can then be reached by that id.

#![forbid(unsafe_code)]

pub mod configs;
pub mod core;
pub mod loggers;
pub mod storage;

pub use configs::config_hub::{load_config, ConfigArgs, ConfigError, HubConfig};
pub use crate::core::{Event, Hub, Lifecycle, LifecycleState, ServiceError};
pub use loggers::loggerhub::{setup_logging, LoggerError};
pub use storage::{open_backend, KvPair, StorageBackend, StorageError};
