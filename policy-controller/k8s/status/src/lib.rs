//! Status maintenance for `HeaderPropagationPolicy`.
//!
//! Watches feed an [`Index`] that maps resource events to the policies
//! they affect; a [`Controller`] drains the resulting work queue, counts
//! the matching forwarder-bearing pods through the API, and patches each
//! policy's `status` subresource.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod index;
mod resource_id;

pub use self::controller::Controller;
pub use self::index::{Index, SharedIndex};
pub use self::resource_id::ResourceId;
