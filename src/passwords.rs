//! Encrypted storage of the two archive passwords.
//!
//! The store encrypts the inner-archive password (p1) and the outer-archive
//! password (p2) with [`AesCbc`] and writes the result to a local file. The
//! plaintext layout is `u8 len(p1) | p1 | u8 len(p2) | p2`, so each password
//! is limited to 255 bytes.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;

use crate::cryptography::{AesCbc, CryptoError};

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password too long: {0} bytes (max 255)")]
    TooLong(usize),
    #[error("password file is truncated")]
    Truncated,
    #[error("stored password is not valid UTF-8")]
    NotUtf8,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct PasswordStore {
    path: PathBuf,
    crypto: AesCbc,
}

impl PasswordStore {
    pub fn new(path: PathBuf, crypto: AesCbc) -> Self {
        Self { path, crypto }
    }

    pub fn save(&self, p1: &str, p2: &str) -> Result<(), PasswordError> {
        let mut plain = Vec::with_capacity(2 + p1.len() + p2.len());

        write_password(&mut plain, p1)?;
        write_password(&mut plain, p2)?;

        fs::write(&self.path, self.crypto.encrypt(&plain))?;

        Ok(())
    }

    pub fn load(&self) -> Result<(String, String), PasswordError> {
        let payload = fs::read(&self.path)?;
        let plain = self.crypto.decrypt(&payload)?;

        let mut rest = plain.as_slice();
        let p1 = read_password(&mut rest)?;
        let p2 = read_password(&mut rest)?;

        Ok((p1, p2))
    }
}

fn write_password(buf: &mut Vec<u8>, password: &str) -> Result<(), PasswordError> {
    let bytes = password.as_bytes();

    if bytes.len() > u8::MAX as usize {
        return Err(PasswordError::TooLong(bytes.len()));
    }

    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);

    Ok(())
}

fn read_password(rest: &mut &[u8]) -> Result<String, PasswordError> {
    let (&len, tail) = rest.split_first().ok_or(PasswordError::Truncated)?;

    if tail.len() < len as usize {
        return Err(PasswordError::Truncated);
    }

    let (password, tail) = tail.split_at(len as usize);
    *rest = tail;

    String::from_utf8(password.to_vec()).map_err(|_| PasswordError::NotUtf8)
}
