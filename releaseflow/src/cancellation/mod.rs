//! Run-level cooperative cancellation.
//!
//! A cancelled run starts no new stages. Running stages observe the token
//! around their external invocations but never in the middle of an
//! artifact or asset write.

mod token;

pub use token::CancellationToken;
