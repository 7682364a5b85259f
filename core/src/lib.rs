//! Rate-limited client core for the Ore plugin repository API.
//!
//! # Overview
//! Remote work is submitted to a [`Dispatcher`], which runs it one task at a
//! time and only as fast as an [`AdmissionPolicy`] allows (by default two
//! requests per second and eighty per minute). Results come back through a
//! [`TaskHandle`] that can be waited on, polled, cancelled or awaited.
//! Fetched projects and versions are kept for a few minutes in an
//! [`ObjectCache`] so repeated reads do not cost requests.
//!
//! # Design
//! - `OreClient` is stateless: each endpoint is split into `build_*`
//!   (produces an `HttpRequest`) and `parse_*` (consumes an `HttpResponse`).
//!   The host supplies a `Transport` that does the actual I/O.
//! - `OreApi` ties client, dispatcher, session and cache together.
//! - Everything time-dependent reads a [`Clock`], so tests can drive expiry
//!   and admission windows deterministically.
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod api;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expiring;
pub mod http;
pub mod limiter;
pub mod session;
pub mod task;
pub mod ttl;
pub mod types;

pub use api::{ApiHandle, OreApi, OreApiBuilder};
pub use cache::{ObjectCache, OreCache, ProjectIdentity, VersionIdentity};
pub use client::OreClient;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, ClientConfig, DispatcherConfig, LimitsConfig};
pub use dispatcher::{Dispatcher, DispatcherState, ListenerId};
pub use error::{ApiError, ApiTaskError, DispatchError, MissingPermissions};
pub use expiring::{Expired, ExpiringValue};
pub use http::{HttpMethod, HttpRequest, HttpResponse, Transport};
pub use limiter::{AdmissionPolicy, AveragingLimiter, LimiterStrategy, Limits, TokenBucket};
pub use session::Session;
pub use task::{DeferredTask, TaskError, TaskHandle, TaskResult, TaskStateError};
pub use ttl::TtlCollection;
pub use types::{
    Namespace, Pagination, Permission, PermissionGrant, PermissionScope, Project, ProjectPatch,
    ProjectQuery, ProjectRef, ProjectStats, ProjectTemplate, ResultList, SessionGrant, Version,
    Visibility,
};
