//! Upstream wire protocol: message codec and event normalization.

pub mod codec;
pub mod normalize;

pub use codec::*;
pub use normalize::*;
