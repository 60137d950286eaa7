//! Identity service seam and its HTTP implementation.

mod client;
mod error;
pub mod identity;

pub use client::HttpIdentityService;
pub use identity::IdentityService;

#[cfg(test)]
pub(crate) use identity::ScriptedIdentity;
