//! Filename encryption.
//!
//! A name is encrypted as headered content without tags under its own nonce,
//! then base64 encoded with `/` replaced by `-` so it is a valid path
//! segment on any backend.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Cursor;

use crate::cipher::ProviderType;
use crate::error::{Result, VaultError};
use crate::integrity::Integrity;
use crate::key_manager::SecretKey;
use crate::nonce::Nonce;
use crate::streaming::ContentStream;

pub fn encrypt_name(
    name: &str,
    key: &SecretKey,
    nonce: Nonce,
    provider: ProviderType,
) -> Result<String> {
    let mut stream = ContentStream::encrypt(
        Cursor::new(Vec::new()),
        key,
        nonce,
        Integrity::disabled(),
        provider,
    )?;
    stream.write_plain(name.as_bytes())?;
    let bytes = stream.finish()?.into_inner();
    Ok(STANDARD.encode(bytes).replace('/', "-"))
}

pub fn decrypt_name(encrypted: &str, key: &SecretKey, provider: ProviderType) -> Result<String> {
    let foreign = || VaultError::auth(format!("{encrypted:?} is not a name encrypted by this drive"));
    let bytes = STANDARD
        .decode(encrypted.replace('-', "/"))
        .map_err(|_| foreign())?;
    let mut stream = ContentStream::decrypt(Cursor::new(bytes), key, None, false, provider)
        .map_err(|_| foreign())?;
    let mut plain = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read_plain(&mut buf)?;
        if n == 0 {
            break;
        }
        plain.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(plain).map_err(|_| foreign())
}
