//! Device authorization.
//!
//! An active device hands part of its nonce range to another device: it
//! splits `[next, max]` at a pivot, keeps `[next, pivot)` by lowering its own
//! max, and writes an encrypted artifact granting `[pivot, max]` to the target
//! auth id. The two ranges never overlap, so the devices can write the same
//! drive without reusing a nonce.
//!
//! ## Artifact Format
//!
//! Content-format file (tagged) under a nonce from the exporting device:
//!
//! ```text
//! [drive_id:16][auth_id:16][start_nonce:8][max_nonce:8]
//! ```

use std::io::{Read, Write};
use tracing::info;

use crate::drive::Drive;
use crate::error::{Result, VaultError};
use crate::integrity::Integrity;
use crate::key_manager::{AUTH_ID_LENGTH, DRIVE_ID_LENGTH};
use crate::nonce::{Nonce, NONCE_LENGTH};
use crate::real_file::RealFile;
use crate::sequencer::SequenceStatus;
use crate::streaming::ContentStream;

pub const AUTH_CONFIG_FILENAME: &str = "auth.cfg";

const AUTH_CONFIG_LENGTH: usize = DRIVE_ID_LENGTH + AUTH_ID_LENGTH + 2 * NONCE_LENGTH;

/// Decrypted contents of an authorization artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub drive_id: [u8; DRIVE_ID_LENGTH],
    pub auth_id: [u8; AUTH_ID_LENGTH],
    pub start_nonce: Nonce,
    pub max_nonce: Nonce,
}

impl AuthConfig {
    pub fn to_bytes(&self) -> [u8; AUTH_CONFIG_LENGTH] {
        let mut out = [0u8; AUTH_CONFIG_LENGTH];
        let (ids, nonces) = out.split_at_mut(DRIVE_ID_LENGTH + AUTH_ID_LENGTH);
        ids[..DRIVE_ID_LENGTH].copy_from_slice(&self.drive_id);
        ids[DRIVE_ID_LENGTH..].copy_from_slice(&self.auth_id);
        nonces[..NONCE_LENGTH].copy_from_slice(self.start_nonce.as_bytes());
        nonces[NONCE_LENGTH..].copy_from_slice(self.max_nonce.as_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AUTH_CONFIG_LENGTH {
            return Err(VaultError::format(format!(
                "authorization artifact must hold {AUTH_CONFIG_LENGTH} bytes, found {}",
                bytes.len()
            )));
        }
        let mut drive_id = [0u8; DRIVE_ID_LENGTH];
        drive_id.copy_from_slice(&bytes[..DRIVE_ID_LENGTH]);
        let mut auth_id = [0u8; AUTH_ID_LENGTH];
        auth_id.copy_from_slice(&bytes[DRIVE_ID_LENGTH..DRIVE_ID_LENGTH + AUTH_ID_LENGTH]);
        let nonces = &bytes[DRIVE_ID_LENGTH + AUTH_ID_LENGTH..];
        Ok(Self {
            drive_id,
            auth_id,
            start_nonce: Nonce::from_slice(&nonces[..NONCE_LENGTH])?,
            max_nonce: Nonce::from_slice(&nonces[NONCE_LENGTH..])?,
        })
    }
}

fn parse_auth_id(auth_id: &str) -> Result<[u8; AUTH_ID_LENGTH]> {
    hex::decode(auth_id)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| VaultError::auth(format!("{auth_id:?} is not a valid auth id")))
}

/// Grants part of this device's nonce range to `target_auth_id`, writing
/// the artifact to `file`.
pub fn export_auth_file(
    drive: &Drive,
    target_auth_id: &str,
    file: &dyn RealFile,
) -> Result<AuthConfig> {
    let target = parse_auth_id(target_auth_id)?;
    let drive_id = drive.drive_id();
    let sequencer = drive.sequencer();

    let artifact_nonce = drive.next_nonce()?;
    let sequence = sequencer
        .get_sequence(&drive_id)?
        .filter(|s| s.status == SequenceStatus::Active)
        .ok_or_else(|| VaultError::sequence("this device is not authorized for the drive"))?;
    let (next, max) = match (sequence.next_nonce, sequence.max_nonce) {
        (Some(next), Some(max)) => (next, max),
        _ => return Err(VaultError::sequence("sequence has no nonce range")),
    };
    let pivot = Nonce::split_range(next, max)?;
    sequencer.set_max_nonce(&drive_id, &sequence.auth_id, pivot)?;

    let config = AuthConfig {
        drive_id: *drive.drive_id_bytes(),
        auth_id: target,
        start_nonce: pivot,
        max_nonce: max,
    };
    let keys = drive.keys();
    let integrity = Integrity::for_writing(
        true,
        Some(keys.hash_key().clone()),
        drive.options().chunk_size,
    )?;
    let mut base = file.open_write()?;
    base.set_length(0)?;
    let mut stream = ContentStream::encrypt(
        base,
        keys.drive_key(),
        artifact_nonce,
        integrity,
        drive.options().provider,
    )?;
    stream.write_all(&config.to_bytes())?;
    stream.finish()?;

    info!(
        drive_id = %drive_id,
        target_auth = target_auth_id,
        %pivot,
        %max,
        "exported device authorization"
    );
    Ok(config)
}

/// Activates this device with the range granted in `file`.
pub fn import_auth_file(drive: &Drive, file: &dyn RealFile) -> Result<AuthConfig> {
    let drive_id = drive.drive_id();
    let sequencer = drive.sequencer();
    if let Some(sequence) = sequencer.get_sequence(&drive_id)? {
        if sequence.status == SequenceStatus::Active {
            return Err(VaultError::auth("this device is already authorized"));
        }
    }

    let keys = drive.keys();
    let foreign = |err: VaultError| {
        if err.is_integrity() {
            VaultError::auth("authorization artifact was not issued for this drive")
        } else {
            err
        }
    };
    let mut stream = ContentStream::decrypt(
        file.open_read()?,
        keys.drive_key(),
        Some(keys.hash_key().clone()),
        true,
        drive.options().provider,
    )?;
    let mut bytes = Vec::with_capacity(AUTH_CONFIG_LENGTH);
    stream
        .read_to_end(&mut bytes)
        .map_err(|e| foreign(VaultError::from(e)))?;
    let config = AuthConfig::parse(&bytes)?;

    if &config.drive_id != drive.drive_id_bytes() {
        return Err(VaultError::auth("authorization was issued for another drive"));
    }
    let auth_id = drive.auth_id()?;
    if hex::encode(config.auth_id) != auth_id.to_ascii_lowercase() {
        return Err(VaultError::auth("authorization was issued for another device"));
    }
    sequencer.initialize_sequence(&drive_id, &auth_id, config.start_nonce, config.max_nonce)?;
    info!(
        drive_id = %drive_id,
        start = %config.start_nonce,
        max = %config.max_nonce,
        "imported device authorization"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_layout() {
        let config = AuthConfig {
            drive_id: [1u8; 16],
            auth_id: [2u8; 16],
            start_nonce: Nonce::from_u64(8),
            max_nonce: Nonce::from_u64(10),
        };
        let bytes = config.to_bytes();
        assert_eq!(&bytes[..16], &[1u8; 16]);
        assert_eq!(&bytes[16..32], &[2u8; 16]);
        assert_eq!(&bytes[32..40], &8u64.to_be_bytes());
        assert_eq!(&bytes[40..], &10u64.to_be_bytes());
        assert_eq!(AuthConfig::parse(&bytes).unwrap(), config);
        assert!(AuthConfig::parse(&bytes[..20]).is_err());
    }

    #[test]
    fn auth_ids_must_be_hex() {
        assert!(parse_auth_id("zz").is_err());
        assert!(parse_auth_id("0011").is_err());
        assert!(parse_auth_id(&"ab".repeat(16)).is_ok());
    }
}
