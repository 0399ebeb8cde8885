//! # Conclave Persistence
//!
//! Durable stores for the coordination record a node must recover after a
//! crash: its current term and its last accepted cluster state.
//!
//! ## Implementations
//!
//! - [`InMemoryStore`] - record kept in memory (testing/non-persistent)
//! - [`FileStore`] - record kept in a checksummed file, rewritten atomically
//!
//! ## Example
//!
//! ```rust
//! use conclave_persistence::{FileStore, InMemoryStore};
//! use conclave_core::store::CoordinationStore;
//! use conclave_core::Term;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryStore::new();
//! store.store_term(Term(3)).await.unwrap();
//! assert_eq!(store.load().await.unwrap().unwrap().current_term, Term(3));
//!
//! let dir = tempfile::tempdir().unwrap();
//! let file_store = FileStore::open(dir.path()).await.unwrap();
//! file_store.store_term(Term(5)).await.unwrap();
//! assert_eq!(file_store.load().await.unwrap().unwrap().current_term, Term(5));
//! # });
//! ```

pub mod file_system;
pub mod in_memory;

pub use file_system::FileStore;
pub use in_memory::InMemoryStore;
