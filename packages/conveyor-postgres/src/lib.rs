//! PostgreSQL implementations of conveyor's store and queue contracts.
//!
//! - [`PostgresJobStore`] - `jobs` table with a partial unique index for
//!   idempotency and conditional-`UPDATE` transitions
//! - [`PostgresWorkQueue`] - channelized `queue_messages` table with
//!   visibility leases, `FOR UPDATE SKIP LOCKED` claiming, and
//!   max-delivery-count redrive to a dead-letter channel
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{SubmissionCoordinator, WorkerLoop, DeadLetterFinalizer};
//! use conveyor_postgres::{PgSettings, PostgresJobStore, PostgresWorkQueue, PostgresQueueConfig};
//!
//! let settings = PgSettings::from_env()?;
//! let pool = settings.connect().await?;
//! conveyor_postgres::run_migrations(&pool).await?;
//!
//! let store = Arc::new(PostgresJobStore::new(pool.clone()));
//! let work = Arc::new(PostgresWorkQueue::work(pool.clone(), PostgresQueueConfig::default()));
//! let dead = Arc::new(PostgresWorkQueue::dead_letters(pool, PostgresQueueConfig::default()));
//!
//! let coordinator = SubmissionCoordinator::new(store.clone(), work.clone());
//! let worker = WorkerLoop::new(store.clone(), work, registry);
//! let finalizer = DeadLetterFinalizer::new(store, dead);
//! ```

mod queue;
mod settings;
mod store;

pub use queue::{PostgresQueueConfig, PostgresWorkQueue};
pub use settings::{run_migrations, PgSettings};
pub use store::PostgresJobStore;
