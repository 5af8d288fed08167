//! Member proxy: the engine-side handle to one plugin client.
//!
//! Each member gets an independent request channel served by one task that
//! owns the plugin instance. Requests on one channel are processed strictly
//! in order, one at a time; every request resolves exactly once — with a
//! reply, a remote error, a deadline expiry, or a hangup when the serving
//! task dies. Whether the plugin really runs in-process or behind an OS
//! pipe is invisible above this crate: the engine only ever sees message
//! latency.

mod client;
mod error;
mod proto;
mod proxy;

pub use error::{ProxyError, ProxyResult};
pub use proto::{RemoteError, Reply, Request, RequestKind};
pub use proxy::{MemberProxy, ProxyState, ProxyTimeouts, SentRequest};
