//! Playbook runs driven through `ansible-runner`
//!
//! - [`config`]: task definitions whose fields may be deferred references,
//!   and the fully resolved [`ExecutionConfig`]
//! - [`resolver`]: turns one into the other against upstream outputs
//! - [`credentials`]: connection lookup for target hosts
//! - [`runner`]: spawns the engine from a provisioned environment and
//!   streams its events
//! - [`event`]: event kinds and the last-event / per-host aggregator
//! - [`report`]: the task's output map and success classification
//!
//! ## Example
//!
//! ```no_run
//! use convenient_ansible::{
//!     EventAggregator, MemoryChannel, PlaybookRunner, TaskConfig, VarMap, finalize, resolve,
//!     credentials::{ConnectionProvider, ConnectionStore},
//! };
//! use std::collections::BTreeMap;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let task = TaskConfig::load(Path::new("deploy.yml"))?;
//! let store = ConnectionStore::load(Path::new("connections.yml"))?;
//! let connection = store.connection(&task.conn_id)?;
//!
//! let upstream: BTreeMap<String, VarMap> = BTreeMap::new();
//! let config = resolve(&task, &upstream, &VarMap::new(), &connection)?;
//!
//! let mut events = EventAggregator::new(config.track_hosts);
//! let result = PlaybookRunner::new()
//!     .run(&config, Path::new("/opt/venv/bin"), &connection, &mut events)
//!     .await?;
//!
//! let mut outputs = MemoryChannel::new();
//! let report = finalize(&result, &events, &mut outputs)?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod event;
pub mod report;
pub mod resolver;
pub mod runner;

pub use config::{ConfigError, Deferrable, DeferredRef, ExecutionConfig, Inventory, TaskConfig, VarMap};
pub use credentials::{Connection, ConnectionProvider, ConnectionStore, KeyCache};
pub use event::{EventAggregator, EventKind, EventSink, RunEvent};
pub use report::{MemoryChannel, OutputChannel, OutputError, RUNNER_ID_KEY, ReportError, finalize};
pub use resolver::{UpstreamValues, resolve};
pub use runner::{PlaybookRunner, RunError, RunResult, RunStatus};
