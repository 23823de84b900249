//! swarmgrad-store: window-keyed artifact storage
//!
//! Artifacts are addressed by `(role_id, window, kind)` and stored under the
//! canonical key `{kind}-{window}-{role_id}-v{version}`. Two production
//! backends are provided:
//!
//! - [`LocalBackend`]: filesystem, `<root>/<role_id>/<window>/<key>`
//! - [`RemoteBackend`]: S3-compatible bucket over HTTP
//!
//! [`ObjectStore`] layers the publish/fetch/cleanup contract on top:
//! bounded retry, publish-time window gating, and retention.

pub mod backend;
pub mod error;
pub mod fakes;
pub mod key;
pub mod local;
pub mod remote;
pub mod retry;
pub mod store;
pub mod window;

pub use backend::{Backend, StoredObject};
pub use error::{StoreError, StoreResult};
pub use key::{ArtifactKind, StorageKey};
pub use local::LocalBackend;
pub use remote::{BucketConfig, RemoteBackend};
pub use retry::{retry, RetryPolicy};
pub use store::{FetchOutcome, ObjectStore, PublishRecord, RetentionResult};
pub use window::{TimeWindow, WindowPosition};
