//! Provider client: the single point of contact with the remote file API.
//!
//! - Spacing gate + retry/backoff policy ([`client`])
//! - Authenticated caller boundary ([`caller`])
//! - Wire types and failure classification ([`types`], [`error`])

pub mod caller;
pub mod client;
pub mod error;
pub mod types;

pub use caller::{parse_retry_after, AuthorizedCaller, CallerResponse, HttpCaller};
pub use client::{ProviderClient, ProviderConfig};
pub use error::ProviderError;
pub use types::{Change, ChangeList, FileList, RemoteFile, StartPageToken};
