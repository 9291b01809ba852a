//! Realtime stream modules.
//!
//! - `proto`: wire envelopes for push streams and GraphQL subscriptions.
//! - `codec`: protocol-neutral envelope classification and frame building.
//! - `transport`: the shared websocket connection, reconnect and handshake.
//! - `registry`: logical stream records, routing and replay on reconnect.
//! - `push`: typed push-stream requests on top of the registry.

/// Envelope codecs for both wire flavors.
pub mod codec;
/// Wire-level message types.
pub mod proto;
/// Typed push-stream subscriptions.
pub mod push;
/// Stream registry and stream handles.
pub mod registry;
/// Websocket transport with reconnect-and-backoff.
pub mod transport;
