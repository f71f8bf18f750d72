//! cmdbsync-api: the CMDB and tenant directory collaborators.
//!
//! [`CmdbApi`] is the set of CMDB calls the synchronizer makes, one client
//! per tenant. [`CmdbClientRegistry`] hands those clients out, building
//! them lazily through a [`CmdbClientFactory`]. [`HttpCmdbClient`] is the
//! production implementation; the `test-util` feature adds an in-memory
//! [`mock::MockCmdb`].

pub mod client;
pub mod error;
pub mod http;
pub mod registry;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{CmdbApi, StaticDirectory, TenantDirectory, fetch_all_pages};
pub use error::{ApiError, ApiResult};
pub use http::{HttpClientFactory, HttpCmdbClient, HttpDirectory};
pub use registry::{CmdbClientFactory, CmdbClientRegistry};
pub use types::{Page, Paged, Record, TopoNode};
