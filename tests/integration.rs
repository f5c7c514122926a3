use anyhow::Result;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vaultfs::auth::{export_auth_file, import_auth_file};
use vaultfs::cache::{CacheOptions, CachedReader};
use vaultfs::commander::{FileCommander, ProgressEvent};
use vaultfs::nonce::Nonce;
use vaultfs::real_file::LocalFile;
use vaultfs::sequencer::{FileSequencer, NonceSequencer, SequenceStatus};
use vaultfs::serializer::JsonSequenceSerializer;
use vaultfs::{Drive, DriveOptions, VaultError};

fn options() -> DriveOptions {
    DriveOptions {
        iterations: 1000,
        chunk_size: 4096,
        ..Default::default()
    }
}

fn sequencer(path: &Path) -> Result<Arc<dyn NonceSequencer>> {
    Ok(Arc::new(FileSequencer::new(
        path,
        Box::new(JsonSequenceSerializer),
    )?))
}

fn data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn setup_test_env() -> Result<(TempDir, Drive)> {
    let tmp = TempDir::new()?;
    let root = tmp.path().join("vault");
    fs::create_dir(&root)?;
    let drive = Drive::create(
        Box::new(LocalFile::new(&root)),
        "correct horse",
        sequencer(&tmp.path().join("device-a.seq"))?,
        options(),
    )?;
    Ok((tmp, drive))
}

fn open_as(tmp: &TempDir, seq_file: &str, password: &str) -> vaultfs::error::Result<Drive> {
    let sequencer: Arc<dyn NonceSequencer> = Arc::new(FileSequencer::new(
        tmp.path().join(seq_file),
        Box::new(JsonSequenceSerializer),
    )?);
    Drive::open(
        Box::new(LocalFile::new(tmp.path().join("vault"))),
        password,
        sequencer,
        options(),
    )
}

#[test]
fn drive_roundtrip_survives_reopen() -> Result<()> {
    let (tmp, drive) = setup_test_env()?;
    let docs = drive.root().create_directory("docs")?;
    let content = data(20_000);
    docs.create_file("report.pdf")?.write_all(&content)?;
    drive.close();

    let drive = open_as(&tmp, "device-a.seq", "correct horse")?;
    let file = drive.resolve("/docs/report.pdf")?.expect("file exists");
    assert_eq!(file.path()?, "/docs/report.pdf");
    assert_eq!(file.length()?, content.len() as u64);
    assert_eq!(file.read_all()?, content);

    // nonces are never reused across sessions
    let nonce = file.header()?.expect("header").nonce();
    assert!(drive.next_nonce()? > nonce);
    Ok(())
}

#[test]
fn wrong_password_is_rejected() -> Result<()> {
    let (tmp, drive) = setup_test_env()?;
    drive.close();
    let err = open_as(&tmp, "device-a.seq", "battery staple").unwrap_err();
    assert!(matches!(err, VaultError::Auth(_)), "{err:?}");
    Ok(())
}

#[test]
fn names_are_encrypted_on_disk() -> Result<()> {
    let (tmp, drive) = setup_test_env()?;
    drive.root().create_file("diary.txt")?.write_all(b"dear diary")?;
    for entry in fs::read_dir(tmp.path().join("vault").join("fs"))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        assert!(!name.contains("diary"), "{name}");
    }
    Ok(())
}

#[test]
fn authorization_splits_nonce_range() -> Result<()> {
    let (tmp, drive_a) = setup_test_env()?;
    let drive_id = drive_a.drive_id();
    let auth_a = drive_a.auth_id()?;

    // bring device A to next = 5, max = 10
    for expected in 0..5 {
        assert_eq!(drive_a.next_nonce()?, Nonce::from_u64(expected));
    }
    drive_a
        .sequencer()
        .set_max_nonce(&drive_id, &auth_a, Nonce::from_u64(10))?;

    let drive_b = open_as(&tmp, "device-b.seq", "correct horse")?;
    let auth_b = drive_b.auth_id()?;
    assert_ne!(auth_a, auth_b);

    let artifact = LocalFile::new(tmp.path().join("auth.cfg"));
    let exported = export_auth_file(&drive_a, &auth_b, &artifact)?;
    // nonce 5 encrypted the artifact, the remaining [6, 10] is split
    let pivot = exported.start_nonce;
    assert_eq!(pivot, Nonce::from_u64(8));
    assert!(pivot > Nonce::from_u64(5) && pivot <= Nonce::from_u64(10));
    assert_eq!(exported.max_nonce, Nonce::from_u64(10));

    let local = drive_a.sequencer().get_sequence(&drive_id)?.expect("sequence");
    assert_eq!(local.max_nonce, Some(pivot));

    let imported = import_auth_file(&drive_b, &artifact)?;
    assert_eq!(imported, exported);
    let remote = drive_b.sequencer().get_sequence(&drive_id)?.expect("sequence");
    assert_eq!(remote.status, SequenceStatus::Active);
    assert_eq!(remote.next_nonce, Some(pivot));

    // A may use 6 and 7, B owns 8 and 9
    assert_eq!(drive_a.next_nonce()?, Nonce::from_u64(6));
    assert_eq!(drive_a.next_nonce()?, Nonce::from_u64(7));
    assert!(matches!(drive_a.next_nonce(), Err(VaultError::RangeExceeded(_))));
    assert_eq!(drive_b.next_nonce()?, Nonce::from_u64(8));
    assert_eq!(drive_b.next_nonce()?, Nonce::from_u64(9));
    assert!(matches!(drive_b.next_nonce(), Err(VaultError::RangeExceeded(_))));

    // a second import onto an active device is refused
    assert!(import_auth_file(&drive_b, &artifact).is_err());
    Ok(())
}

#[test]
fn artifact_for_another_device_is_rejected() -> Result<()> {
    let (tmp, drive_a) = setup_test_env()?;
    let drive_b = open_as(&tmp, "device-b.seq", "correct horse")?;
    drive_b.auth_id()?;
    let drive_c = open_as(&tmp, "device-c.seq", "correct horse")?;
    let auth_c = drive_c.auth_id()?;

    let artifact = LocalFile::new(tmp.path().join("auth.cfg"));
    export_auth_file(&drive_a, &auth_c, &artifact)?;
    let err = import_auth_file(&drive_b, &artifact).unwrap_err();
    assert!(matches!(err, VaultError::Auth(_)), "{err:?}");
    Ok(())
}

#[test]
fn artifact_from_another_drive_is_rejected() -> Result<()> {
    let (tmp, _drive) = setup_test_env()?;
    let other_root = tmp.path().join("other");
    fs::create_dir(&other_root)?;
    let other = Drive::create(
        Box::new(LocalFile::new(&other_root)),
        "correct horse",
        sequencer(&tmp.path().join("other.seq"))?,
        options(),
    )?;
    let drive_b = open_as(&tmp, "device-b.seq", "correct horse")?;
    let auth_b = drive_b.auth_id()?;

    let artifact = LocalFile::new(tmp.path().join("auth.cfg"));
    export_auth_file(&other, &auth_b, &artifact)?;
    let err = import_auth_file(&drive_b, &artifact).unwrap_err();
    assert!(matches!(err, VaultError::Auth(_)), "{err:?}");
    Ok(())
}

#[test]
fn revoked_device_cannot_write() -> Result<()> {
    let (_tmp, drive) = setup_test_env()?;
    let file = drive.root().create_file("before.txt")?;
    file.write_all(b"still readable")?;

    drive.revoke_authorization()?;
    let err = drive.root().create_file("after.txt").unwrap_err();
    assert!(matches!(err, VaultError::Sequence(_)), "{err:?}");
    assert_eq!(file.read_all()?, b"still readable");
    Ok(())
}

#[test]
fn cached_reader_over_drive_file() -> Result<()> {
    let (_tmp, drive) = setup_test_env()?;
    let content = data(300_000);
    let file = drive.root().create_file("video.mp4")?;
    file.write_all(&content)?;

    let options = CacheOptions {
        buffer_size: 64 * 1024,
        ..Default::default()
    };
    let mut reader = CachedReader::with_threads(file, options, 4)?;
    reader.seek(SeekFrom::Start(250_000))?;
    let mut buf = vec![0u8; 1000];
    reader.read_exact(&mut buf)?;
    assert_eq!(buf, &content[250_000..251_000]);

    reader.seek(SeekFrom::Start(0))?;
    let mut all = Vec::new();
    reader.read_to_end(&mut all)?;
    assert_eq!(all, content);
    Ok(())
}

#[test]
fn tampered_file_reports_integrity() -> Result<()> {
    let (tmp, drive) = setup_test_env()?;
    let file = drive.root().create_file("ledger.db")?;
    file.write_all(&data(10_000))?;

    let real = fs::read_dir(tmp.path().join("vault").join("fs"))?
        .next()
        .expect("one file")?
        .path();
    let mut bytes = fs::read(&real)?;
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&real, bytes)?;

    let err = file.read_all().unwrap_err();
    assert!(err.is_integrity(), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn batch_import_isolates_failures() -> Result<()> {
    let (tmp, drive) = setup_test_env()?;
    let input = tmp.path().join("input");
    fs::create_dir_all(input.join("nested"))?;
    fs::write(input.join("a.txt"), data(5000))?;
    fs::write(input.join("nested").join("b.bin"), data(70_000))?;
    let missing = tmp.path().join("missing.txt");

    let commander = FileCommander::new(Arc::new(drive), 3);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = commander
        .import_files(
            vec![missing.clone(), input.clone()],
            "/".to_string(),
            tx,
            CancellationToken::new(),
        )
        .await?;

    assert_eq!(result.succeeded.len(), 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, missing);
    assert!(!result.cancelled);

    let mut finished = 0;
    while let Some(event) = rx.recv().await {
        if matches!(event, ProgressEvent::Finished { .. }) {
            finished += 1;
        }
    }
    assert_eq!(finished, 2);

    let drive = commander.drive();
    let b = drive.resolve("/input/nested/b.bin")?.expect("imported");
    assert_eq!(b.read_all()?, data(70_000));

    // and back out again
    let out = tmp.path().join("out");
    fs::create_dir(&out)?;
    let (tx, _rx) = mpsc::unbounded_channel();
    let exported = commander
        .export_files(
            vec!["/input".to_string()],
            out.clone(),
            tx,
            CancellationToken::new(),
        )
        .await?;
    assert!(exported.failed.is_empty(), "{:?}", exported.failed);
    assert_eq!(fs::read(out.join("input").join("a.txt"))?, data(5000));
    assert_eq!(fs::read(out.join("input").join("nested").join("b.bin"))?, data(70_000));
    Ok(())
}

#[tokio::test]
async fn cancelled_batch_stops_before_next_file() -> Result<()> {
    let (tmp, drive) = setup_test_env()?;
    let one = tmp.path().join("one.txt");
    fs::write(&one, b"1")?;

    let commander = FileCommander::new(Arc::new(drive), 1);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = commander
        .import_files(vec![one], "/".to_string(), tx, cancel)
        .await?;

    assert!(result.cancelled);
    assert!(result.succeeded.is_empty());
    assert_eq!(rx.recv().await, Some(ProgressEvent::Cancelled));
    assert!(commander.drive().resolve("/one.txt")?.is_none());
    Ok(())
}
