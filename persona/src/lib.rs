#![cfg_attr(docsrs, feature(doc_cfg))]
//! Persona identity derivation and signed API requests.
//!
//! A single mnemonic seed phrase is the root of a client's identity. From it
//! the crate derives an sr25519 master key and one child keypair per persona
//! (`"<phrase>//<index>"`). Each persona is named by its pkh, the blake2b-256
//! hash of its public key, and every outbound request is signed with a
//! single-use envelope (`sent_at`, `nonce`, payload).
//!
//! The pieces, leaves first:
//!
//! - [`keyring`]: secret URI parsing, sr25519 derivation and signing, and the
//!   keyring cache
//! - [`seed`]: loading, generating and migrating the seed; the master key
//! - [`persona`]: persona derivation and [`Pkh`]
//! - [`store`]: the versioned persona key store and its reconciliation
//! - [`signer`] / [`verify`]: building and checking request envelopes
//! - [`client`]: a GraphQL client that signs every request
//! - [`session`]: [`IdentitySession`], which wires it all together
//!
//! Persistence goes through the [`storage::KeyValueStore`] trait.

pub mod client;
pub mod config;
pub mod error;
pub mod keyring;
pub mod persona;
pub mod prelude;
pub mod seed;
pub mod session;
pub mod signer;
pub mod storage;
pub mod store;
pub mod verify;

pub use error::{Error, Result};
pub use persona::{PersonaKey, Pkh, derive_key_at};
pub use session::IdentitySession;
