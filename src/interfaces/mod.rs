//! Abstract interfaces for couchline components.
//!
//! These traits define the contracts for:
//! - Document storage (the CouchDB-style store both components talk to)
//! - Observer notification (table-level refresh signals)

pub mod document_store;
pub mod observer;

pub use document_store::{
    BulkItemResult, ChangesOptions, Document, DocumentStore, FeedDelivery, FeedMode, FeedPayload,
    FetchRow, FindResponse, IndexRequest, IndexResponse, MangoQuery, StoreError, WriteResponse,
};
pub use observer::{ObserverError, ObserverNotifier};
