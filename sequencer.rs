//! Nonce sequencer: the only source of nonces for a drive.
//!
//! Each drive id has at most one live sequence per device. A sequence moves
//! `New -> Active -> Revoked` and never back. While `Active` it hands out
//! `next_nonce` and persists `next_nonce + 1`, refusing to pass `max_nonce`.
//! `max_nonce` can only shrink.
//!
//! Every operation is a read-modify-write of the whole table under one lock,
//! so two callers in this process can never receive the same nonce.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};
use crate::nonce::Nonce;
use crate::serializer::SequenceSerializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    /// Created, waiting for a nonce range
    New,
    /// Holds a range and can issue nonces
    Active,
    /// Can never issue nonces again
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceSequence {
    pub id: String,
    pub auth_id: String,
    pub next_nonce: Option<Nonce>,
    pub max_nonce: Option<Nonce>,
    pub status: SequenceStatus,
}

impl NonceSequence {
    pub fn new(id: impl Into<String>, auth_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            auth_id: auth_id.into(),
            next_nonce: None,
            max_nonce: None,
            status: SequenceStatus::New,
        }
    }

    /// Table key; a revoked sequence and its replacement live side by side.
    pub fn key(&self) -> String {
        format!(
            "{}:{}",
            self.id.to_ascii_lowercase(),
            self.auth_id.to_ascii_lowercase()
        )
    }

    pub fn is_live(&self) -> bool {
        self.status != SequenceStatus::Revoked
    }

    fn matches(&self, drive_id: &str) -> bool {
        self.id.eq_ignore_ascii_case(drive_id)
    }
}

pub type SequenceMap = BTreeMap<String, NonceSequence>;

/// Issues and tracks nonce ranges per drive.
pub trait NonceSequencer: Send + Sync {
    /// Registers this device for `drive_id`; fails if a live sequence exists.
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> Result<()>;

    /// Assigns the range `[start, max]` to a `New` sequence and activates it.
    fn initialize_sequence(&self, drive_id: &str, auth_id: &str, start: Nonce, max: Nonce)
        -> Result<()>;

    /// Shrinks the upper bound of the active range.
    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max: Nonce) -> Result<()>;

    /// Returns the next unused nonce and persists the advance.
    fn next_nonce(&self, drive_id: &str) -> Result<Nonce>;

    /// Permanently stops this device from issuing nonces for `drive_id`.
    fn revoke_sequence(&self, drive_id: &str) -> Result<()>;

    /// The live (`New` or `Active`) sequence for `drive_id`, if any.
    fn get_sequence(&self, drive_id: &str) -> Result<Option<NonceSequence>>;
}

fn find_live<'a>(map: &'a SequenceMap, drive_id: &str) -> Result<Option<&'a NonceSequence>> {
    let mut live = map.values().filter(|s| s.matches(drive_id) && s.is_live());
    let first = live.next();
    if live.next().is_some() {
        return Err(VaultError::sequence(format!(
            "more than one live sequence for drive {drive_id}, sequence file is corrupt"
        )));
    }
    Ok(first)
}

fn find_live_mut<'a>(map: &'a mut SequenceMap, drive_id: &str) -> Result<&'a mut NonceSequence> {
    let key = find_live(map, drive_id)?
        .map(NonceSequence::key)
        .ok_or_else(|| VaultError::sequence(format!("no sequence found for drive {drive_id}")))?;
    map.get_mut(&key)
        .ok_or_else(|| VaultError::sequence(format!("no sequence found for drive {drive_id}")))
}

fn create(map: &mut SequenceMap, drive_id: &str, auth_id: &str) -> Result<()> {
    if find_live(map, drive_id)?.is_some() {
        return Err(VaultError::sequence(format!(
            "a sequence already exists for drive {drive_id}"
        )));
    }
    let sequence = NonceSequence::new(drive_id, auth_id);
    map.insert(sequence.key(), sequence);
    Ok(())
}

fn initialize(
    map: &mut SequenceMap,
    drive_id: &str,
    auth_id: &str,
    start: Nonce,
    max: Nonce,
) -> Result<()> {
    let sequence = find_live_mut(map, drive_id)?;
    if sequence.status != SequenceStatus::New {
        return Err(VaultError::sequence(format!(
            "sequence for drive {drive_id} is already initialized"
        )));
    }
    if sequence.next_nonce.is_some() || sequence.max_nonce.is_some() {
        return Err(VaultError::sequence(format!(
            "sequence for drive {drive_id} already has a nonce range"
        )));
    }
    if !sequence.auth_id.eq_ignore_ascii_case(auth_id) {
        return Err(VaultError::sequence(format!(
            "sequence for drive {drive_id} belongs to another device"
        )));
    }
    if start > max {
        return Err(VaultError::sequence("start nonce is beyond max nonce"));
    }
    sequence.next_nonce = Some(start);
    sequence.max_nonce = Some(max);
    sequence.status = SequenceStatus::Active;
    Ok(())
}

fn active_bounds(sequence: &NonceSequence) -> Result<(Nonce, Nonce)> {
    match (sequence.status, sequence.next_nonce, sequence.max_nonce) {
        (SequenceStatus::Active, Some(next), Some(max)) => Ok((next, max)),
        (SequenceStatus::Active, _, _) => Err(VaultError::sequence(format!(
            "sequence for drive {} has no nonce range",
            sequence.id
        ))),
        _ => Err(VaultError::sequence(format!(
            "sequence for drive {} is not active",
            sequence.id
        ))),
    }
}

fn set_max(map: &mut SequenceMap, drive_id: &str, auth_id: &str, max: Nonce) -> Result<()> {
    let sequence = find_live_mut(map, drive_id)?;
    if !sequence.auth_id.eq_ignore_ascii_case(auth_id) {
        return Err(VaultError::sequence(format!(
            "sequence for drive {drive_id} belongs to another device"
        )));
    }
    let (next, current_max) = active_bounds(sequence)?;
    if max > current_max {
        return Err(VaultError::sequence(
            "max nonce can only decrease, refusing to extend the range",
        ));
    }
    if max < next {
        return Err(VaultError::sequence(
            "max nonce cannot be set below the next nonce",
        ));
    }
    sequence.max_nonce = Some(max);
    Ok(())
}

fn next(map: &mut SequenceMap, drive_id: &str) -> Result<Nonce> {
    let sequence = find_live_mut(map, drive_id)?;
    let (next, max) = active_bounds(sequence)?;
    sequence.next_nonce = Some(next.increase(max)?);
    Ok(next)
}

fn revoke(map: &mut SequenceMap, drive_id: &str) -> Result<()> {
    let sequence = find_live_mut(map, drive_id)?;
    sequence.status = SequenceStatus::Revoked;
    Ok(())
}

/// Sequencer persisted to a file through a [`SequenceSerializer`].
pub struct FileSequencer {
    path: PathBuf,
    serializer: Box<dyn SequenceSerializer>,
    lock: Mutex<()>,
}

impl FileSequencer {
    pub fn new(path: impl Into<PathBuf>, serializer: Box<dyn SequenceSerializer>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "using sequence file");
        Ok(Self {
            path,
            serializer,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<SequenceMap> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => self.serializer.deserialize(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SequenceMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, map: &SequenceMap) -> Result<()> {
        let contents = self.serializer.serialize(map)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn transact<T>(&self, op: impl FnOnce(&mut SequenceMap) -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| VaultError::sequence("sequencer lock poisoned"))?;
        let mut map = self.load()?;
        let out = op(&mut map)?;
        self.save(&map)?;
        Ok(out)
    }
}

impl NonceSequencer for FileSequencer {
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> Result<()> {
        self.transact(|map| create(map, drive_id, auth_id))?;
        info!(drive_id, auth_id, "sequence created");
        Ok(())
    }

    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start: Nonce,
        max: Nonce,
    ) -> Result<()> {
        self.transact(|map| initialize(map, drive_id, auth_id, start, max))?;
        info!(drive_id, %start, %max, "sequence initialized");
        Ok(())
    }

    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max: Nonce) -> Result<()> {
        self.transact(|map| set_max(map, drive_id, auth_id, max))?;
        debug!(drive_id, %max, "max nonce lowered");
        Ok(())
    }

    fn next_nonce(&self, drive_id: &str) -> Result<Nonce> {
        self.transact(|map| next(map, drive_id))
    }

    fn revoke_sequence(&self, drive_id: &str) -> Result<()> {
        self.transact(|map| revoke(map, drive_id))?;
        warn!(drive_id, "sequence revoked, this device can no longer write");
        Ok(())
    }

    fn get_sequence(&self, drive_id: &str) -> Result<Option<NonceSequence>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| VaultError::sequence("sequencer lock poisoned"))?;
        let map = self.load()?;
        Ok(find_live(&map, drive_id)?.cloned())
    }
}

/// Volatile sequencer for ephemeral drives and tests.
#[derive(Default)]
pub struct MemorySequencer {
    table: Mutex<SequenceMap>,
}

impl MemorySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn transact<T>(&self, op: impl FnOnce(&mut SequenceMap) -> Result<T>) -> Result<T> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| VaultError::sequence("sequencer lock poisoned"))?;
        // work on a copy so a failed operation leaves the table untouched
        let mut map = table.clone();
        let out = op(&mut map)?;
        *table = map;
        Ok(out)
    }

    /// Snapshot of every sequence, revoked ones included.
    pub fn sequences(&self) -> Result<SequenceMap> {
        self.transact(|map| Ok(map.clone()))
    }
}

impl NonceSequencer for MemorySequencer {
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> Result<()> {
        self.transact(|map| create(map, drive_id, auth_id))
    }

    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start: Nonce,
        max: Nonce,
    ) -> Result<()> {
        self.transact(|map| initialize(map, drive_id, auth_id, start, max))
    }

    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max: Nonce) -> Result<()> {
        self.transact(|map| set_max(map, drive_id, auth_id, max))
    }

    fn next_nonce(&self, drive_id: &str) -> Result<Nonce> {
        self.transact(|map| next(map, drive_id))
    }

    fn revoke_sequence(&self, drive_id: &str) -> Result<()> {
        self.transact(|map| revoke(map, drive_id))
    }

    fn get_sequence(&self, drive_id: &str) -> Result<Option<NonceSequence>> {
        self.transact(|map| Ok(find_live(map, drive_id)?.cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSequenceSerializer;
    use std::sync::Arc;
    use tempfile::TempDir;

    const DRIVE: &str = "00112233445566778899aabbccddeeff";
    const AUTH: &str = "ffeeddccbbaa99887766554433221100";

    fn active(sequencer: &dyn NonceSequencer, start: u64, max: u64) {
        sequencer.create_sequence(DRIVE, AUTH).unwrap();
        sequencer
            .initialize_sequence(DRIVE, AUTH, Nonce::from_u64(start), Nonce::from_u64(max))
            .unwrap();
    }

    #[test]
    fn ten_nonces_then_exhausted() {
        let sequencer = MemorySequencer::new();
        active(&sequencer, 0, 10);
        for expected in 0..10 {
            assert_eq!(sequencer.next_nonce(DRIVE).unwrap().to_u64(), expected);
        }
        let err = sequencer.next_nonce(DRIVE).unwrap_err();
        assert!(matches!(err, VaultError::RangeExceeded(_)), "{err:?}");
    }

    #[test]
    fn max_nonce_only_shrinks() {
        let sequencer = MemorySequencer::new();
        active(&sequencer, 0, 100);
        assert!(sequencer.set_max_nonce(DRIVE, AUTH, Nonce::from_u64(101)).is_err());
        sequencer.set_max_nonce(DRIVE, AUTH, Nonce::from_u64(50)).unwrap();
        assert!(sequencer.set_max_nonce(DRIVE, AUTH, Nonce::from_u64(60)).is_err());
        let seq = sequencer.get_sequence(DRIVE).unwrap().unwrap();
        assert_eq!(seq.max_nonce, Some(Nonce::from_u64(50)));
    }

    #[test]
    fn state_machine_order() {
        let sequencer = MemorySequencer::new();
        // nothing to initialize yet
        assert!(sequencer
            .initialize_sequence(DRIVE, AUTH, Nonce::START, Nonce::MAX)
            .is_err());
        sequencer.create_sequence(DRIVE, AUTH).unwrap();
        assert!(sequencer.create_sequence(DRIVE, AUTH).is_err());
        // New sequences cannot issue nonces
        assert!(sequencer.next_nonce(DRIVE).is_err());
        sequencer
            .initialize_sequence(DRIVE, AUTH, Nonce::START, Nonce::MAX)
            .unwrap();
        assert!(sequencer
            .initialize_sequence(DRIVE, AUTH, Nonce::START, Nonce::MAX)
            .is_err());
    }

    #[test]
    fn revocation_is_terminal() {
        let sequencer = MemorySequencer::new();
        active(&sequencer, 0, 100);
        sequencer.revoke_sequence(DRIVE).unwrap();
        assert!(sequencer.next_nonce(DRIVE).is_err());
        assert!(sequencer.set_max_nonce(DRIVE, AUTH, Nonce::from_u64(5)).is_err());
        assert!(sequencer.revoke_sequence(DRIVE).is_err());
        assert_eq!(sequencer.get_sequence(DRIVE).unwrap(), None);

        // a fresh device registration restores write capability
        sequencer.create_sequence(DRIVE, "0a0b").unwrap();
        sequencer
            .initialize_sequence(DRIVE, "0a0b", Nonce::from_u64(200), Nonce::from_u64(300))
            .unwrap();
        assert_eq!(sequencer.next_nonce(DRIVE).unwrap().to_u64(), 200);
        assert_eq!(sequencer.sequences().unwrap().len(), 2);
    }

    #[test]
    fn drive_ids_are_case_insensitive() {
        let sequencer = MemorySequencer::new();
        active(&sequencer, 3, 10);
        assert_eq!(
            sequencer.next_nonce(&DRIVE.to_uppercase()).unwrap().to_u64(),
            3
        );
    }

    #[test]
    fn wrong_device_cannot_initialize() {
        let sequencer = MemorySequencer::new();
        sequencer.create_sequence(DRIVE, AUTH).unwrap();
        assert!(sequencer
            .initialize_sequence(DRIVE, "deadbeef", Nonce::START, Nonce::MAX)
            .is_err());
    }

    #[test]
    fn duplicate_live_sequences_are_corruption() {
        let mut map = SequenceMap::new();
        let mut a = NonceSequence::new(DRIVE, "01");
        a.status = SequenceStatus::Active;
        let b = NonceSequence::new(DRIVE, "02");
        map.insert(a.key(), a);
        map.insert(b.key(), b);
        assert!(matches!(find_live(&map, DRIVE), Err(VaultError::Sequence(_))));
    }

    #[test]
    fn file_sequencer_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("sequences.json");
        {
            let sequencer =
                FileSequencer::new(&path, Box::new(JsonSequenceSerializer)).unwrap();
            active(&sequencer, 0, 1000);
            assert_eq!(sequencer.next_nonce(DRIVE).unwrap().to_u64(), 0);
            assert_eq!(sequencer.next_nonce(DRIVE).unwrap().to_u64(), 1);
        }
        let reopened = FileSequencer::new(&path, Box::new(JsonSequenceSerializer)).unwrap();
        assert_eq!(reopened.next_nonce(DRIVE).unwrap().to_u64(), 2);
    }

    #[test]
    fn concurrent_callers_never_share_a_nonce() {
        let tmp = TempDir::new().unwrap();
        let sequencer = Arc::new(
            FileSequencer::new(tmp.path().join("seq.json"), Box::new(JsonSequenceSerializer))
                .unwrap(),
        );
        active(sequencer.as_ref(), 0, 10_000);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| sequencer.next_nonce(DRIVE).unwrap().to_u64())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
