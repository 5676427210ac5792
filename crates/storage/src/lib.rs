pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemoryReadStore, InMemoryWriteStore};
pub use postgres::{PostgresReadStore, PostgresWriteStore};
pub use store::{ReadStore, WriteStore};
