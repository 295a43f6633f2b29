//! Lodestar Crypto: primitives for the Nebula certificate authority.
//!
//! Provides the Nebula v1 certificate codec (protobuf details, Ed25519
//! signature, PEM armour), node X25519 and CA Ed25519 key material with
//! zeroize-on-drop, and SHA-256 digests with constant-time comparison.

pub mod digest;
pub mod keys;
pub mod nebula;
