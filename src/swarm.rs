//! Swarm coordination.
//!
//! [`Swarm`] decides what to ask every peer for, what to answer, and when
//! a download is done. It is driven by messages and never owns a socket,
//! which keeps it testable without a network. [`Session`] wraps a swarm
//! in a tokio event loop with real peer connections, an optional listener
//! and a UDP tracker task.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarmbit::config::SwarmConfig;
//! use swarmbit::metainfo::Metainfo;
//! use swarmbit::storage::ExistingDirProvider;
//! use swarmbit::swarm::{NullSink, Session, Source};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metainfo = Arc::new(Metainfo::from_bytes(&std::fs::read("example.torrent")?)?);
//! let session = Session::new(
//!     Source::Torrent(metainfo),
//!     ExistingDirProvider,
//!     "./downloads".into(),
//!     SwarmConfig::default(),
//!     NullSink,
//! )?;
//! let swarm = session.run().await?;
//! println!("downloaded {} bytes", swarm.downloaded());
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod driver;
mod error;
mod events;
mod picker;

pub use coordinator::{Phase, Swarm};
pub use driver::{Session, Source};
pub use error::SwarmError;
pub use events::{NullSink, ProgressSink, SwarmEvent};
pub use picker::{PickPolicy, PiecePicker};
