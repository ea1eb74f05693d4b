//! # Core Engine Module
//!
//! Everything between the sockets and storage:
//!
//! - **`event`** / **`framing`**: the wire grammar, from raw reads to parsed events.
//! - **`queue`**: the growable FIFO the ingestion handlers append to.
//! - **`lifecycle`** / **`listener`**: cancellation, task tracking and the
//!   accept loop shared by both services.
//! - **`ingestion`**: the events service handler (queue plus broadcast fan-out).
//! - **`registry`**: the clients service handler and its id map.
//! - **`archiver`**: drains the queue into storage.
//! - **`hub`**: both services wired together.

pub mod archiver;
pub mod event;
pub mod framing;
pub mod hub;
pub mod ingestion;
pub mod lifecycle;
pub mod listener;
pub mod queue;
pub mod registry;

pub use archiver::Archiver;
pub use event::{Event, ParseError};
pub use framing::{FrameBatch, RecordFramer};
pub use hub::Hub;
pub use ingestion::{EventsHandler, IngestionSettings, StatsSnapshot};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use listener::{Connection, ConnectionHandler, ListenerService, NetworkService, ServiceError};
pub use queue::{EventQueue, Queue};
pub use registry::{ClientHandle, ClientRegistry, ClientStore};
