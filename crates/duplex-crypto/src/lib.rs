//! # DUPLEX Crypto
//!
//! Cryptographic primitives for the DUPLEX call engine.
//!
//! This crate provides:
//! - The shared call key and the key schedule derived from it
//! - `XChaCha20-Poly1305` sealing for path datagrams and signaling payloads
//! - The derived-state blob that carries continuity between calls
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | KDF | keyed BLAKE3 with context | 128-bit |
//!
//! ## Key schedule
//!
//! ```text
//!                        call key (256 bytes)
//!                               │
//!      ┌──────────────┬─────────┼──────────────┬───────────────┐
//!      ▼              ▼         ▼              ▼               ▼
//!  link (out→in)  link (in→out)  signaling ×2  derived-state  fingerprint
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod derived;
pub mod error;
pub mod hash;
pub mod keys;
pub mod random;

pub use aead::{AeadKey, PacketSealer};
pub use derived::{DerivedRecord, DerivedState};
pub use error::CryptoError;
pub use keys::{CALL_KEY_SIZE, CallKey, Direction, KeyMaterial, KeySchedule};
