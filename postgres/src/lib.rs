//! `PostgreSQL` dead-letter store for the inventory sync engine.
//!
//! Failed events outlive restarts here, so retries and operator replays
//! survive a deploy. The schema lives in `migrations/` and is applied by
//! [`PostgresDeadLetterStore::migrate`].
//!
//! # Example
//!
//! ```ignore
//! use inventory_sync_postgres::PostgresDeadLetterStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresDeadLetterStore::connect("postgres://localhost/inventory").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

mod dead_letter_queue;

pub use dead_letter_queue::PostgresDeadLetterStore;
