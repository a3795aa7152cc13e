//! Purpose: Define the public Rust API boundary for patient-query.
//! Exports: Record/store/query types, the loader, errors, and `RemoteClient`.
//! Role: The surface used by the CLI binary, the server, and integration tests.
//! Invariants: Everything here is read-only over an already-loaded store.

mod remote;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::query::{
    INVALID_ORDER_MESSAGE, INVALID_SORT_FIELD_MESSAGE, NO_MATCH_MESSAGE, Query, SortOrder,
};
pub use crate::core::record::{Field, Record};
pub use crate::core::store::Store;
pub use crate::data_source::{DEFAULT_DATA_PATH, from_json_str, load};
pub use remote::RemoteClient;
