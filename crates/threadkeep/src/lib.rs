//! threadkeep - incremental comment and reply ingestion.
//!
//! This library walks a paginated, externally hosted comment thread by
//! continuation token and keeps a deduplicated local copy of it: main
//! comments through a batching write path, replies through a bounded
//! worker pool with retry and rate limit handling. Every store mutation is
//! announced on an in-process event bus.
//!
//! # Features
//!
//! - `sqlite` / `postgres` - database drivers for [`SeaOrmStore`].
//! - `migrate` - Enables database migration support. When enabled, you can use
//!   [`connect_and_migrate`] to automatically run migrations on connection.
//! - `http` - [`ReqwestTransport`](source::http::reqwest_transport::ReqwestTransport)
//!   for [`HttpCommentSource`](source::http::HttpCommentSource).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use threadkeep::{IngestSession, SeaOrmStore, connect_and_migrate};
//!
//! let db = connect_and_migrate("sqlite://threadkeep.db?mode=rwc").await?;
//! let session = IngestSession::builder()
//!     .store(Arc::new(SeaOrmStore::new(db)))
//!     .source(source)
//!     .build()?;
//!
//! let report = session.ingest("video-123", bootstrap_token).await?;
//! println!("{} comments stored", report.stored);
//! ```

pub mod accumulator;
pub mod cancel;
pub mod crawler;
pub mod db;
pub mod entity;
pub mod error;
pub mod events;
pub mod record;
pub mod replies;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod store;
pub mod token;
pub mod transform;

#[cfg(feature = "migrate")]
pub mod migration;

pub use accumulator::{AccumulatorOptions, AccumulatorSnapshot, WriteBatchAccumulator};
pub use cancel::CancelSignal;
pub use crawler::{ContinuationCrawler, CrawlConfig, CrawlOutcome, CrawlProgress, CrawlStatus};
pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use entity::prelude::*;
pub use error::{ErrorKind, ErrorReport, IngestError};
pub use events::{ChangeEvent, ChangeEventBus, ChangeEventType, EventPayload, EventStats};
pub use record::{CommentLevel, Record, ReplyTask};
pub use replies::{
    BatchSummary, RateLimitNotice, ReplyCallbacks, ReplyProgress, ReplyQueueConfig,
    ReplyWorkQueue, TaskId, TaskReport, TaskStatus,
};
pub use retry::{RetryPolicy, RetryingSource};
pub use scheduler::{Pacing, PriorityReplyScheduler};
pub use session::{IngestReport, IngestSession, IngestSessionBuilder, SessionError};
pub use source::{FetchError, FetchOptions, RawPage, RateLimitedSource, RemoteCommentSource};
pub use store::{DedupUpsertStore, MemoryStore, SeaOrmStore, StoreError, UpsertOptions, UpsertSummary};
pub use token::{TokenExtractor, TokenMatch, TokenStrategy};
pub use transform::{JsonTransform, Transform, TransformContext};
