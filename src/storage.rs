//! Piece storage and verification.
//!
//! Torrents split content into fixed-size pieces, and pieces may span
//! several files. [`PieceStore`] tracks which blocks of each piece have been
//! requested and received, hashes complete pieces, and writes verified
//! pieces through a [`FileSet`] of already-open handles. Opening those
//! handles is the job of a [`FileProvider`]; the store never creates
//! directories or chooses paths.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarmbit::metainfo::Metainfo;
//! use swarmbit::storage::{ExistingDirProvider, FileSet, PieceStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metainfo = Arc::new(Metainfo::from_bytes(&std::fs::read("example.torrent")?)?);
//! let files = FileSet::open(&ExistingDirProvider, metainfo.clone(), "./downloads".into()).await?;
//!
//! let mut store = PieceStore::from_metainfo(&metainfo, 16384)?;
//! store.attach(files);
//! let have = store.verify_existing(|done, total| println!("{done}/{total}")).await?;
//! println!("{} of {} pieces already on disk", have.count(), have.piece_count());
//! # Ok(())
//! # }
//! ```

mod error;
mod file;
mod handles;
mod piece_store;

pub use error::StorageError;
pub use file::{map_range, FileEntry, FileSegment};
pub use handles::{ExistingDirProvider, FileProvider, FileSet, OpenRequest, ProviderError};
pub use piece_store::{check_digest, BlockOutcome, PieceState, PieceStore};

#[cfg(test)]
mod tests;
