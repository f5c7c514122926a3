//! # vaultfs - Encrypted Virtual Filesystem Engine
//!
//! vaultfs stores files in an encrypted mirror of a real directory tree.
//! Contents use AES-256-CTR with per-chunk HMAC-SHA256 tags, names are
//! encrypted separately, and every nonce comes from a persisted sequencer
//! so no nonce is ever used twice under a drive key, even across devices.
//!
//! ## Features
//!
//! - **Random Access**: CTR mode and chunk-local tags allow seeking anywhere
//! - **Integrity**: Tampering fails the affected chunk, never returns plaintext
//! - **Nonce Sequencer**: Disjoint nonce ranges per authorized device
//! - **Parallel I/O**: Multi-threaded transforms with identical output
//! - **Cache Reader**: Buffered reads for scrub-heavy consumers
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vaultfs::drive::{Drive, DriveOptions};
//! use vaultfs::real_file::LocalFile;
//! use vaultfs::sequencer::FileSequencer;
//! use vaultfs::serializer::JsonSequenceSerializer;
//!
//! fn main() -> vaultfs::error::Result<()> {
//!     let sequencer = FileSequencer::new("./vaultfs.seq", Box::new(JsonSequenceSerializer))?;
//!     let drive = Drive::create(
//!         Box::new(LocalFile::new("./vault")),
//!         "password",
//!         Arc::new(sequencer),
//!         DriveOptions::default(),
//!     )?;
//!
//!     let file = drive.root().create_file("secret.txt")?;
//!     file.write_all(b"sensitive data")?;
//!     assert_eq!(file.read_all()?, b"sensitive data");
//!     Ok(())
//! }
//! ```
//!
//! ## Content Format
//!
//! ```text
//! [header:16][tag:32][chunk][tag:32][chunk]...
//! ```
//!
//! See [`header`] for the header layout and length math.

pub mod auth;
pub mod cache;
pub mod cipher;
pub mod commander;
pub mod config;
pub mod drive;
pub mod encryptor;
pub mod error;
pub mod header;
pub mod integrity;
pub mod key_manager;
pub mod names;
pub mod nonce;
pub mod parallel;
pub mod real_file;
pub mod sequencer;
pub mod serializer;
pub mod streaming;
pub mod virtual_file;

// Re-export common types for convenience
pub use drive::{Drive, DriveOptions};
pub use error::VaultError;
pub use nonce::Nonce;
pub use virtual_file::VirtualFile;
