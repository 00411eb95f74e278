//! # Commands Module
//!
//! The two top-level modes of peerback:
//!
//! ## `encrypt`
//! Generates the persistent encrypted-password file:
//! - Encrypts the two archive passwords with AES-128-CBC
//! - Writes the ciphertext to the configured path and exits
//!
//! ## `backup`
//! Runs one peer of a backup session:
//! - Loads the archive passwords from the password file, if configured
//! - Elects a role against the other peer through the FILE.io mailbox
//! - Negotiates a WebRTC connection (SDP and ICE candidates over the mailbox)
//! - Sends or receives exactly one file over the data channel
//! - Rotates received files through the bounded version chain

use crate::cryptography::{AesCbc, CryptoError};
use crate::passwords::PasswordStore;
use std::path::PathBuf;

pub mod backup;
pub mod encrypt;

// NOTE: preset key and IV kept for compatibility with existing password
// files; replace them with your own material before trusting the password
// file with anything sensitive.
const AES_KEY: &[u8; 16] = b"AES-128-key-1234";
const AES_IV: &[u8; 16] = b"IV-1234567890123";

fn password_store(path: PathBuf) -> Result<PasswordStore, CryptoError> {
    Ok(PasswordStore::new(path, AesCbc::new(AES_KEY, AES_IV)?))
}
