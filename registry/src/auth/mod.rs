//! Authorization pipeline: credential dispatch, scope filtering,
//! and challenge construction.

pub mod pipeline;
pub mod scope_filter;

pub use pipeline::{Authorization, Challenge, IncomingRequest};
