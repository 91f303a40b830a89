//! Unpacking image tarballs into layer directories.
//!
//! A layer is named by the SHA-256 of the archive it came from, so loading
//! the same tarball under two image ids unpacks it once.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use capsule_common::error::{CapsuleError, Result};

/// Gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A layer unpacked on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Hex SHA-256 of the source archive.
    pub digest: String,
    /// Directory the archive was unpacked into.
    pub path: PathBuf,
    /// Bytes of regular file content in the layer.
    pub size_bytes: u64,
}

/// Unpacks a plain or gzip-compressed tar archive into
/// `layers_dir/<digest>`. An archive whose layer is already on disk is
/// not unpacked again.
///
/// Compression is detected from the archive's first bytes, so the file
/// name does not matter. The archive is unpacked next to its final
/// location first, so an interrupted extraction never leaves a layer that
/// looks complete.
///
/// # Errors
///
/// Returns `Io` if the archive cannot be read or `Image` if it is not a
/// valid tar stream.
pub fn extract_layer(archive_path: &Path, layers_dir: &Path) -> Result<Layer> {
    let digest = crate::hash::hash_file(archive_path)?;
    let target = layers_dir.join(&digest);
    if target.is_dir() {
        tracing::debug!(digest = %digest, "layer already present");
        let size_bytes = dir_size(&target)?;
        return Ok(Layer {
            digest,
            path: target,
            size_bytes,
        });
    }
    tracing::info!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting layer"
    );

    let partial = layers_dir.join(format!("{digest}.partial"));
    remove_dir_if_exists(&partial)?;
    std::fs::create_dir_all(&partial).map_err(|e| CapsuleError::io(&partial, e))?;
    if let Err(e) = unpack(archive_path, &partial) {
        if let Err(cleanup) = remove_dir_if_exists(&partial) {
            tracing::warn!(error = %cleanup, "failed to remove partial layer");
        }
        return Err(e);
    }
    std::fs::rename(&partial, &target).map_err(|e| CapsuleError::io(&target, e))?;

    let size_bytes = dir_size(&target)?;
    tracing::info!(digest = %digest, size = size_bytes, "layer extracted");
    Ok(Layer {
        digest,
        path: target,
        size_bytes,
    })
}

fn unpack(archive_path: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path).map_err(|e| CapsuleError::io(archive_path, e))?;
    let mut reader = BufReader::new(file);
    let gzip = is_gzip(&mut reader).map_err(|e| CapsuleError::io(archive_path, e))?;
    let unpacked = if gzip {
        tar::Archive::new(flate2::read::GzDecoder::new(reader)).unpack(target)
    } else {
        tar::Archive::new(reader).unpack(target)
    };
    unpacked.map_err(|e| CapsuleError::Image {
        message: format!("unpack {}: {e}", archive_path.display()),
    })
}

/// Removes a directory tree. A missing directory is fine.
///
/// # Errors
///
/// Returns `Io` for any other failure.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CapsuleError::io(path, e)),
    }
}

fn is_gzip(reader: &mut impl BufRead) -> std::io::Result<bool> {
    let head = reader.fill_buf()?;
    Ok(head.starts_with(&GZIP_MAGIC))
}

/// Total size of regular files below `path`. Symlinks are not followed.
///
/// # Errors
///
/// Returns `Io` if a directory cannot be listed.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| CapsuleError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CapsuleError::io(&dir, e))?;
            let meta = entry
                .metadata()
                .map_err(|e| CapsuleError::io(entry.path(), e))?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_tar(dir: &Path, name: &str) -> PathBuf {
        let tar_path = dir.join(name);
        let file = std::fs::File::create(&tar_path).expect("failed to create tar file");
        let mut builder = tar::Builder::new(file);
        append(&mut builder, "bin/sh", b"#!fake shell");
        append(&mut builder, "etc/hostname", b"image\n");
        builder.finish().expect("failed to finish tar");
        tar_path
    }

    fn create_test_tar_gz(dir: &Path, name: &str) -> PathBuf {
        let tar_gz_path = dir.join(name);
        let file = std::fs::File::create(&tar_gz_path).expect("failed to create tar.gz");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append(&mut builder, "gzhello.txt", b"hello from gzipped layer");
        let encoder = builder.into_inner().expect("failed to finish encoder");
        let _ = encoder.finish().expect("failed to finish gzip");
        tar_gz_path
    }

    fn append<W: std::io::Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data)
            .expect("failed to append data");
    }

    #[test]
    fn plain_tar_unpacks_with_digest_and_size() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let tar_path = create_test_tar(dir.path(), "rootfs.tar");
        let layers = dir.path().join("layers");

        let layer = extract_layer(&tar_path, &layers).expect("extract failed");
        assert_eq!(layer.digest, crate::hash::hash_file(&tar_path).unwrap());
        assert_eq!(layer.path, layers.join(&layer.digest));
        assert_eq!(
            std::fs::read_to_string(layer.path.join("etc/hostname")).unwrap(),
            "image\n"
        );
        assert_eq!(layer.size_bytes, 12 + 6);
        assert!(!layers.join(format!("{}.partial", layer.digest)).exists());
    }

    #[test]
    fn existing_layer_is_reused() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let tar_path = create_test_tar(dir.path(), "rootfs.tar");
        let layers = dir.path().join("layers");
        let first = extract_layer(&tar_path, &layers).expect("extract failed");
        std::fs::write(first.path.join("marker"), "kept").unwrap();

        let second = extract_layer(&tar_path, &layers).expect("reuse failed");
        assert_eq!(second.path, first.path);
        assert!(second.path.join("marker").exists());
    }

    #[test]
    fn gzip_is_detected_by_content_not_name() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let archive = create_test_tar_gz(dir.path(), "misnamed.tar");
        let layer = extract_layer(&archive, &dir.path().join("layers")).expect("extract failed");
        let content =
            std::fs::read_to_string(layer.path.join("gzhello.txt")).expect("read failed");
        assert_eq!(content, "hello from gzipped layer");
    }

    #[test]
    fn missing_archive_is_an_io_error() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let err = extract_layer(&dir.path().join("missing.tar"), &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, CapsuleError::Io { .. }));
    }

    #[test]
    fn garbage_archive_is_an_image_error() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let archive = dir.path().join("junk.tar");
        std::fs::write(&archive, vec![0x5a; 1024]).unwrap();
        let layers = dir.path().join("layers");
        let err = extract_layer(&archive, &layers).unwrap_err();
        assert!(matches!(err, CapsuleError::Image { .. }));
        assert_eq!(std::fs::read_dir(&layers).unwrap().count(), 0);
    }
}
