//! wiretap-proxy: a programmable HTTP/1.1, HTTP/2 and WebSocket intercepting mock proxy.
//!
//! Clients configure [`Rule`](rule::Rule)s that match incoming requests and respond
//! either with a fixed reply, a streamed body, a callback, a JSON-RPC envelope, a
//! connection close/reset, an indefinite hang, or a pass-through to the real
//! upstream server with optional request/response transformations.
//!
//! The crate is organized around the request-handling engine described in the
//! project design docs:
//!
//! - [`matcher`] — pure predicates over a request.
//! - [`completion`] — bounded counters that retire a rule after N matches.
//! - [`rule`] — matchers + step pipeline + completion policy.
//! - [`selector`] — picks the winning rule for a request.
//! - [`step`] — the response pipeline a winning rule drives a request through.
//! - [`executor`] — runs a rule's step pipeline to completion.
//! - [`passthrough`] — upstream forwarding for HTTP and WebSocket traffic.
//! - [`channel`] — the framed duplex wire protocol used by remote admin clients.
//! - [`events`] — the observability event bus.
//! - [`engine`] — ties listeners, the rule set, and the event bus together.
//! - [`server`] — the hyper-based listener that feeds requests into the engine.
#![forbid(unsafe_code)]

pub mod channel;
pub mod completion;
pub mod config;
pub mod decision_cache;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod matcher;
pub mod metrics;
pub mod passthrough;
pub mod request;
pub mod rule;
pub mod selector;
pub mod server;
pub mod step;

pub use completion::CompletionChecker;
pub use config::Config;
pub use engine::Engine;
pub use error::ProxyError;
pub use matcher::Matcher;
pub use request::{Protocol, RequestFingerprint};
pub use rule::{CompletedRequest, Rule, RuleBuilder};
pub use step::Step;
