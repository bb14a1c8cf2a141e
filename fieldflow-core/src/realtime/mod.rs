//! Realtime change propagation.
//!
//! Committed computed values are described as [`Change`]s, translated to
//! [`OtOp`]s and fanned out to document and collection subscribers.

mod change;
mod hub;

pub use change::{
    collection_channel, document_channel, record_collection, translate, Change, OtOp, PathSegment,
};
pub use hub::{RealtimeHub, SubscriberId, Subscription};
