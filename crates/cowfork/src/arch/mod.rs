//! Conversions between the portable types and the hardware encodings of the target.
//!
//! [`crate::PermissionSet`] and [`crate::FaultErrorCode`] already use the hardware bit layout;
//! this module only bridges them to the `x86_64` crate's types for callers that work with
//! those directly.

#[cfg(target_arch = "x86_64")]
mod x86_64;
