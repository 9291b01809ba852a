//! Client SDK for the Lishi streaming API.
//!
//! The crate is organized by concern:
//! - `auth`: access token issuance, caching and refresh.
//! - `http`: request/response transport and authorized API calls.
//! - `stream`: the shared websocket transport and logical stream registry.
//! - `graphql`: GraphQL queries over HTTP and subscriptions over websocket.
//! - `client`: [`client::LishiClient`], which wires everything together.
//! - `retry`: shared backoff, retry and timeout utilities.

/// Access tokens, issuers, token stores and the credential manager.
pub mod auth;
/// Top-level client and its configuration.
pub mod client;
/// Error taxonomy shared by every module.
pub mod error;
/// GraphQL query and subscription facade.
pub mod graphql;
/// HTTP request collaborator.
pub mod http;
/// Backoff, retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime stream transport, codecs and registry.
pub mod stream;

pub use client::{ClientOptions, Endpoints, LishiClient};
pub use error::{LishiError, Result};
