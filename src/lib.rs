//! # SmartScale-RS: live weight logging for BLE scales
//!
//! Streams weight readings from a BLE kitchen/bathroom scale through an
//! external acquisition helper, keeps an ordered in-memory log and fans the
//! readings out to consumers (table, chart, CSV exporter).
//!
//! ## Architecture
//!
//! - **Producer**: the helper process, launched per session, printing one JSON
//!   sample or `ERROR:` line per line of stdout
//! - **Protocol**: stateless decoder turning a line into a measurement or a
//!   protocol error
//! - **Session**: supervises the producer with a reader thread and a liveness
//!   watchdog, drives the session state machine
//! - **Store**: thread-safe ordered log with subscriber fan-out
//! - **Communication**: subscriber callbacks on the reader thread, or crossbeam
//!   channels via [`session::ChannelSubscriber`]
//!
//! ## Configuration
//!
//! Configuration and app state live in the platform-appropriate data directory
//! under `dev.smartscale.smartscale-rs`:
//!
//! - **Linux**: `~/.local/share/dev.smartscale.smartscale-rs/`
//! - **macOS**: `~/Library/Application Support/dev.smartscale.smartscale-rs/`
//! - **Windows**: `%APPDATA%\dev.smartscale.smartscale-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use smartscale::{
//!     config::AppConfig,
//!     producer::ProcessProducer,
//!     session::{AcquisitionSession, ChannelSubscriber, SessionEvent, Subscriber},
//!     store::RecordStore,
//! };
//! use std::sync::Arc;
//!
//! let config = AppConfig::load_or_default();
//! let producer = ProcessProducer::new(config.producer.stream_command()?);
//! let session = AcquisitionSession::new(Arc::new(producer), RecordStore::new(), config.session);
//!
//! let (subscriber, events) = ChannelSubscriber::unbounded();
//! let subscriber: Arc<dyn Subscriber> = subscriber;
//! session.subscribe(&subscriber);
//! session.start("AA:BB:CC:DD:EE:FF")?;
//!
//! for event in events.iter() {
//!     match event {
//!         SessionEvent::Measurement(m) => println!("{} kg", m.weight_string()),
//!         SessionEvent::ProtocolError(e) => eprintln!("{}", e),
//!         SessionEvent::SessionEnded(_) => break,
//!     }
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod export;
pub mod producer;
pub mod protocol;
pub mod session;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, AppState, SessionConfig};
pub use error::{Result, ScaleError};
pub use protocol::{decode_line, ProtocolError};
pub use session::{AcquisitionSession, ChannelSubscriber, SessionEvent, Subscriber};
pub use store::RecordStore;
pub use types::{FailureReason, Measurement, SessionState, SessionStats};
