//! File transfer and version retention.
//!
//! Exactly one frame crosses the data channel per session:
//! a one-byte name length, the filename, then the raw content until the
//! sender half-closes. A sender streams either a single file verbatim or a
//! doubly-zipped directory: the outer archive holds one member named
//! `${dirname}.zip` (protected with the second password when set) whose
//! content is an inner archive of every regular file under the source
//! directory (members protected with the first password when set).
//!
//! A receiver saves the file under its destination directory, rotating any
//! files of the same name through a bounded version chain first: `name` is
//! the newest, `name.1` the previous one, and so on up to the configured
//! cap, oldest deleted.

use std::io::{Cursor, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use indicatif::ProgressBar;
use log::{debug, error, info};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use walkdir::WalkDir;
use zip::unstable::write::FileOptionsExt;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{0:?}: not a directory")]
    NotDirectory(PathBuf),
    #[error("{0:?}: is a directory")]
    IsDirectory(PathBuf),
    #[error("output filename is empty")]
    EmptyOutputFilename,
    #[error("filename too long: {0} bytes (max 255)")]
    NameTooLong(usize),
    #[error("invalid filename: {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone, Debug, Default)]
pub struct TransferConfig {
    pub zip_dir: bool,
    pub source_entry: Option<PathBuf>,
    pub destination_dir: Option<PathBuf>,
    pub output_filename: Option<String>,
    pub versions: u16,
    pub password1: String,
    pub password2: String,
}

pub struct Transfer {
    cfg: TransferConfig,
}

impl Transfer {
    /// Validates the configured paths up front: a bad path discovered after
    /// the peer connection is already up would waste the whole session.
    pub fn new(mut cfg: TransferConfig) -> Result<Self, TransferError> {
        if let Some(dir) = &cfg.destination_dir {
            if !fs::metadata(dir)?.is_dir() {
                return Err(TransferError::NotDirectory(dir.clone()));
            }
        }

        if let Some(source) = &cfg.source_entry {
            let meta = fs::metadata(source)?;

            if cfg.zip_dir {
                if !meta.is_dir() {
                    return Err(TransferError::NotDirectory(source.clone()));
                }
                if cfg.output_filename.as_deref().unwrap_or_default().is_empty() {
                    return Err(TransferError::EmptyOutputFilename);
                }
            } else if meta.is_dir() {
                return Err(TransferError::IsDirectory(source.clone()));
            }
        }

        cfg.versions = cfg.versions.max(1);

        Ok(Self { cfg })
    }

    /// Runs the single transfer of the session: send if a source entry is
    /// configured, receive otherwise. I/O failures are logged rather than
    /// propagated; a partial file on the receiving side is left in place.
    pub async fn run<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(source) = self.cfg.source_entry.clone() {
            match self.send_source_entry(&source, &mut stream).await {
                Ok(()) => info!("file sent"),
                Err(e) => error!("send: {}", e),
            }

            // Half-close to signal EOF, then drain whatever the peer still
            // sends so its graceful close is not cut short.
            if let Err(e) = stream.shutdown().await {
                error!("shutdown data channel: {}", e);
            }
            drain(&mut stream).await;
        } else {
            match self.receive_file(&mut stream).await {
                Ok(()) => info!("file received"),
                Err(e) => error!("receive: {}", e),
            }
        }
    }

    async fn send_source_entry<S>(&self, source: &Path, stream: &mut S) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.cfg.zip_dir {
            self.send_source_dir_archived(source, stream).await
        } else {
            self.send_source_file(source, stream).await
        }
    }

    async fn send_source_file<S>(&self, source: &Path, stream: &mut S) -> Result<(), TransferError>
    where
        S: AsyncWrite + Unpin,
    {
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidName(source.display().to_string()))?;

        write_filename(stream, &name).await?;

        info!("sending file: {}", source.display());

        let mut file = File::open(source).await?;
        tokio::io::copy(&mut file, stream).await?;

        Ok(())
    }

    async fn send_source_dir_archived<S>(
        &self,
        source: &Path,
        stream: &mut S,
    ) -> Result<(), TransferError>
    where
        S: AsyncWrite + Unpin,
    {
        let name = self.cfg.output_filename.clone().unwrap_or_default();

        write_filename(stream, &name).await?;

        info!("sending file: {}", name);

        let spinner = ProgressBar::new_spinner();
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message("Archiving directory");

        let src = source.to_path_buf();
        let password1 = self.cfg.password1.clone();
        let password2 = self.cfg.password2.clone();
        let archive =
            tokio::task::spawn_blocking(move || build_double_archive(&src, &password1, &password2))
                .await??;

        spinner.finish_with_message("Directory archived");

        stream.write_all(&archive).await?;

        Ok(())
    }

    async fn receive_file<S>(&self, stream: &mut S) -> Result<(), TransferError>
    where
        S: AsyncRead + Unpin,
    {
        let name = read_filename(stream).await?;

        let path = self
            .cfg
            .destination_dir
            .clone()
            .unwrap_or_default()
            .join(&name);

        shift_file_versions(&path, self.cfg.versions);

        info!("receiving file: {}", name);

        let mut file = File::create(&path).await?;
        tokio::io::copy(stream, &mut file).await?;
        file.flush().await?;

        Ok(())
    }
}

/// Writes the frame header: a one-byte length followed by the name itself.
pub async fn write_filename<W>(w: &mut W, name: &str) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = name.as_bytes();

    if bytes.is_empty() {
        return Err(TransferError::InvalidName(name.to_string()));
    }
    if bytes.len() > u8::MAX as usize {
        return Err(TransferError::NameTooLong(bytes.len()));
    }

    w.write_u8(bytes.len() as u8).await?;
    w.write_all(bytes).await?;

    Ok(())
}

/// Reads the frame header and validates the name. The name came from the
/// remote peer, so anything that could escape the destination directory is
/// rejected outright.
pub async fn read_filename<R>(r: &mut R) -> Result<String, TransferError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u8().await?;

    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;

    let name = String::from_utf8(buf)
        .map_err(|e| TransferError::InvalidName(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;

    if !is_safe_filename(&name) {
        return Err(TransferError::InvalidName(name));
    }

    Ok(name)
}

/// A received filename must be a single path segment: no separators and no
/// `..`.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Rotates the version chain at `path` so the target itself is free:
/// `path.(cap-1)` is deleted, every younger version moves one suffix up and
/// `path` becomes `path.1`. Missing versions are skipped; individual rename
/// or remove failures are logged and rotation carries on.
pub fn shift_file_versions(path: &Path, versions: u16) {
    let oldest = i64::from(versions.max(1)) - 1;

    for i in (0..=oldest).rev() {
        let old = versioned_path(path, i);

        if !old.exists() {
            continue;
        }

        if i == oldest {
            if let Err(e) = fs::remove_file(&old) {
                error!("remove {}: {}", old.display(), e);
            }
            continue;
        }

        let new = versioned_path(path, i + 1);
        if let Err(e) = fs::rename(&old, &new) {
            error!("rename {}: {}", old.display(), e);
        }
    }
}

fn versioned_path(path: &Path, version: i64) -> PathBuf {
    if version == 0 {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.{}", path.display(), version))
    }
}

/// Builds the doubly-zipped directory archive in memory. Both layers use
/// deflate: storing the inner archive uncompressed trips short-write issues
/// when the outer layer is streamed, and the extra compression pass is
/// cheap.
fn build_double_archive(
    source: &Path,
    password1: &str,
    password2: &str,
) -> Result<Vec<u8>, TransferError> {
    let inner = archive_dir(source, password1)?;

    let inner_name = source
        .file_name()
        .map(|name| format!("{}.zip", name.to_string_lossy()))
        .ok_or_else(|| TransferError::InvalidName(source.display().to_string()))?;

    let mut buf = Vec::new();
    {
        let mut outer = ZipWriter::new(Cursor::new(&mut buf));

        outer.start_file(inner_name, archive_options(password2))?;
        outer.write_all(&inner)?;
        outer.finish()?;
    }

    Ok(buf)
}

/// Zips every regular file under `source` recursively, member names
/// relative to `source`. Directories are not stored as members.
fn archive_dir(source: &Path, password: &str) -> Result<Vec<u8>, TransferError> {
    info!("archiving directory: {}", source.display());

    let mut buf = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buf));

        for entry in WalkDir::new(source) {
            let entry = entry?;

            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry
                .path()
                .strip_prefix(source)
                .map_err(|_| TransferError::InvalidName(entry.path().display().to_string()))?
                .to_string_lossy()
                .replace('\\', "/");

            zip.start_file(name, archive_options(password))?;

            let mut file = fs::File::open(entry.path())?;
            io::copy(&mut file, &mut zip)?;
        }

        zip.finish()?;
    }

    Ok(buf)
}

fn archive_options(password: &str) -> FileOptions {
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    if password.is_empty() {
        options
    } else {
        options.with_deprecated_encryption(password.as_bytes())
    }
}

/// Reads the inbound half until EOF. Once the peer tears the channel down a
/// read error is equivalent to EOF here.
async fn drain<R>(stream: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();

    if let Err(e) = tokio::io::copy(stream, &mut sink).await {
        debug!("drain after shutdown: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use zip::ZipArchive;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("test_transfer_{}_{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    // ========================================================================
    // Framing
    // ========================================================================

    #[tokio::test]
    async fn test_filename_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_filename(&mut a, "backup.tar").await.unwrap();
        let name = read_filename(&mut b).await.unwrap();

        assert_eq!(name, "backup.tar");
    }

    #[tokio::test]
    async fn test_filename_roundtrip_max_length() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let long = "x".repeat(255);

        write_filename(&mut a, &long).await.unwrap();
        assert_eq!(read_filename(&mut b).await.unwrap(), long);
    }

    #[tokio::test]
    async fn test_filename_too_long_rejected() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let long = "x".repeat(256);

        assert!(matches!(
            write_filename(&mut a, &long).await,
            Err(TransferError::NameTooLong(256))
        ));
    }

    #[tokio::test]
    async fn test_received_traversal_names_rejected() {
        for name in ["../evil", "a/b", "a\\b", "..", "x..y"] {
            let (mut a, mut b) = tokio::io::duplex(1024);

            let bytes = name.as_bytes();
            a.write_u8(bytes.len() as u8).await.unwrap();
            a.write_all(bytes).await.unwrap();

            assert!(
                matches!(read_filename(&mut b).await, Err(TransferError::InvalidName(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_received_empty_name_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u8(0).await.unwrap();

        assert!(read_filename(&mut b).await.is_err());
    }

    // ========================================================================
    // Version rotation
    // ========================================================================

    #[test]
    fn test_rotation_single_version_deletes_target() {
        let dir = temp_dir("rot1");
        let target = dir.join("a.txt");
        fs::write(&target, "old").unwrap();

        shift_file_versions(&target, 1);

        assert!(!target.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_shifts_existing_file() {
        let dir = temp_dir("rot2");
        let target = dir.join("a.txt");
        fs::write(&target, "hello").unwrap();

        shift_file_versions(&target, 2);

        assert!(!target.exists());
        assert_eq!(fs::read_to_string(dir.join("a.txt.1")).unwrap(), "hello");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_drops_oldest_at_cap() {
        let dir = temp_dir("rot3");
        let target = dir.join("a.txt");
        fs::write(&target, "new").unwrap();
        fs::write(dir.join("a.txt.1"), "old").unwrap();

        shift_file_versions(&target, 2);

        assert!(!target.exists());
        assert_eq!(fs::read_to_string(dir.join("a.txt.1")).unwrap(), "new");
        assert!(!dir.join("a.txt.2").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_keeps_chain_gap_free() {
        let dir = temp_dir("rot4");
        let target = dir.join("a.txt");
        fs::write(&target, "v3").unwrap();
        fs::write(dir.join("a.txt.1"), "v2").unwrap();
        fs::write(dir.join("a.txt.2"), "v1").unwrap();

        shift_file_versions(&target, 4);

        assert!(!target.exists());
        assert_eq!(fs::read_to_string(dir.join("a.txt.1")).unwrap(), "v3");
        assert_eq!(fs::read_to_string(dir.join("a.txt.2")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(dir.join("a.txt.3")).unwrap(), "v1");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_skips_missing_versions() {
        let dir = temp_dir("rot5");
        let target = dir.join("a.txt");
        // Nothing on disk at all: rotation is a no-op, not an error.
        shift_file_versions(&target, 3);
        assert!(!target.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    // ========================================================================
    // Constructor validation
    // ========================================================================

    #[test]
    fn test_new_rejects_missing_destination() {
        let cfg = TransferConfig {
            destination_dir: Some(PathBuf::from("/definitely/not/here")),
            ..Default::default()
        };

        assert!(Transfer::new(cfg).is_err());
    }

    #[test]
    fn test_new_rejects_file_destination() {
        let dir = temp_dir("valdst");
        let file = dir.join("plain.txt");
        fs::write(&file, "x").unwrap();

        let cfg = TransferConfig { destination_dir: Some(file), ..Default::default() };
        assert!(matches!(Transfer::new(cfg), Err(TransferError::NotDirectory(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_new_rejects_dir_source_without_zipdir() {
        let dir = temp_dir("valsrc");

        let cfg = TransferConfig { source_entry: Some(dir.clone()), ..Default::default() };
        assert!(matches!(Transfer::new(cfg), Err(TransferError::IsDirectory(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_new_requires_output_filename_for_zipdir() {
        let dir = temp_dir("valout");

        let cfg = TransferConfig {
            zip_dir: true,
            source_entry: Some(dir.clone()),
            ..Default::default()
        };
        assert!(matches!(Transfer::new(cfg), Err(TransferError::EmptyOutputFilename)));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_new_rejects_file_source_with_zipdir() {
        let dir = temp_dir("valzip");
        let file = dir.join("plain.txt");
        fs::write(&file, "x").unwrap();

        let cfg = TransferConfig {
            zip_dir: true,
            source_entry: Some(file),
            output_filename: Some("out.zip".into()),
            ..Default::default()
        };
        assert!(matches!(Transfer::new(cfg), Err(TransferError::NotDirectory(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    // ========================================================================
    // Archive layout
    // ========================================================================

    #[test]
    fn test_double_archive_layout_with_encryption() {
        let base = temp_dir("arch");
        let source = base.join("dir");
        fs::create_dir_all(source.join("x")).unwrap();
        fs::write(source.join("x/y.txt"), "Y").unwrap();
        fs::write(source.join("z.txt"), "Z").unwrap();

        let archive = build_double_archive(&source, "p1", "p2").unwrap();

        // Outer layer: exactly one member, named after the source directory.
        let mut outer = ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(outer.len(), 1);

        let mut inner_bytes = Vec::new();
        outer
            .by_name_decrypt("dir.zip", b"p2")
            .unwrap()
            .expect("outer password should match")
            .read_to_end(&mut inner_bytes)
            .unwrap();

        // Inner layer: the directory's regular files with relative paths.
        let mut inner = ZipArchive::new(Cursor::new(inner_bytes)).unwrap();
        assert_eq!(inner.len(), 2);

        let mut y = String::new();
        inner
            .by_name_decrypt("x/y.txt", b"p1")
            .unwrap()
            .expect("inner password should match")
            .read_to_string(&mut y)
            .unwrap();
        assert_eq!(y, "Y");

        let mut z = String::new();
        inner
            .by_name_decrypt("z.txt", b"p1")
            .unwrap()
            .expect("inner password should match")
            .read_to_string(&mut z)
            .unwrap();
        assert_eq!(z, "Z");

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_double_archive_unencrypted_when_passwords_empty() {
        let base = temp_dir("archplain");
        let source = base.join("data");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("f.txt"), "plain").unwrap();

        let archive = build_double_archive(&source, "", "").unwrap();

        let mut outer = ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut inner_bytes = Vec::new();
        outer
            .by_name("data.zip")
            .expect("outer member should be readable without a password")
            .read_to_end(&mut inner_bytes)
            .unwrap();

        let mut inner = ZipArchive::new(Cursor::new(inner_bytes)).unwrap();
        let mut content = String::new();
        inner
            .by_name("f.txt")
            .expect("inner member should be readable without a password")
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "plain");

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_archive_skips_directory_members() {
        let base = temp_dir("archdirs");
        let source = base.join("tree");
        fs::create_dir_all(source.join("sub/deeper")).unwrap();
        fs::write(source.join("sub/deeper/only.txt"), "leaf").unwrap();

        let inner = archive_dir(&source, "").unwrap();

        let mut archive = ZipArchive::new(Cursor::new(inner)).unwrap();
        assert_eq!(archive.len(), 1);
        assert!(archive.by_name("sub/deeper/only.txt").is_ok());

        let _ = fs::remove_dir_all(&base);
    }
}
