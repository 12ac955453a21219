//! Embedded MongoDB-compatible document store on SQLite with JSON/JSONB
//! storage. Queries, update operators, and aggregation pipelines are
//! translated into SQL where possible, staged through temporary tables
//! when a single statement cannot express them, and evaluated in host
//! code as the final fallback; the three tiers agree on results.

pub mod aggregation;
pub mod aggregation_cursor;
pub mod binary;
pub mod bulk;
pub mod changestream;
pub mod collection;
pub mod connection;
pub mod cursor;
pub mod datetime;
pub mod document;
pub mod error;
pub mod fallback;
pub mod index;
pub mod matcher;
pub mod objectid;
pub mod query;
pub mod quez;
pub mod store;
pub mod translate;
pub mod update;

pub use aggregation_cursor::AggregationCursor;
pub use binary::Binary;
pub use bulk::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult, WriteModel,
};
pub use changestream::ChangeStream;
pub use collection::Collection;
pub use connection::Connection;
pub use cursor::{Cursor, RawBatchCursor};
pub use document::Document;
pub use error::{Error, Result};
pub use fallback::{FallbackConfig, force_fallback, set_force_fallback};
pub use index::{IndexInfo, IndexOptions};
pub use objectid::ObjectId;
pub use store::ConnectionOptions;
