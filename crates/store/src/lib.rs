//! Session-scoped result cache: write-once publication, projected reads,
//! age-based eviction.

mod csv;
mod error;
mod result_store;
mod sessions;

pub use csv::render_csv;
pub use error::{Result, StoreError};
pub use result_store::{LoadedRows, ResultStore, DEFAULT_RETENTION};
pub use sessions::SessionRegistry;
