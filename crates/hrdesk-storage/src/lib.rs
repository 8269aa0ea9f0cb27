//! Durable storage for HRDesk: issue and run persistence, media objects and outbound HTTP.

mod http;
mod memory;
mod object;
mod postgres;
mod store;

pub use http::{url_host, FetchError, FetchRequest, FetchedBody, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use memory::MemoryStore;
pub use object::{sha256_hex, ObjectStore, StoredObject};
pub use postgres::PgStore;
pub use store::{IssueRepository, MarkStore, RetryLedger, RunAcquisition, RunLedger, SyncStore};

pub const CRATE_NAME: &str = "hrdesk-storage";
