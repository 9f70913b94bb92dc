//! Canonical tar streaming and gzip compression.
//!
//! Layer identity depends on byte-stable archives: the same directory tree
//! must produce the same tar on every machine and every run. Entries are
//! therefore written in sorted path order with zeroed timestamps and
//! numeric-only root ownership; file modes come from the source tree.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use kubeimage_core::{EngineError, Result};
use sha2::{Digest, Sha256};

use crate::digest::sha256_reader;

/// A writer that tees bytes into a SHA-256 hasher.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.count)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write the canonical tar of `root` into `out`.
pub fn write_canonical_tar<W: Write>(root: &Path, out: W) -> Result<W> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    let mut paths = Vec::new();
    collect_paths(root, root, &mut paths)?;
    paths.sort();

    for rel in paths {
        let abs = root.join(&rel);
        let meta = std::fs::symlink_metadata(&abs)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(file_mode(&meta));

        if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &rel, io::empty())
                .map_err(|e| tar_err(&rel, e))?;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&abs)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, &rel, &target)
                .map_err(|e| tar_err(&rel, e))?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            let file = File::open(&abs)?;
            builder
                .append_data(&mut header, &rel, file)
                .map_err(|e| tar_err(&rel, e))?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| EngineError::Storage(format!("failed to finalize tar: {}", e)))
}

/// Canonical digest of a directory tree.
///
/// Returns the hex SHA-256 of the canonical tar and the tar's size in
/// bytes (the layer's uncompressed size).
pub fn tree_digest(root: &Path) -> Result<(String, u64)> {
    let writer = write_canonical_tar(root, HashingWriter::new(io::sink()))?;
    let (_, digest, size) = writer.finish();
    Ok((digest, size))
}

/// Canonical digest of a path that may be a file or a directory.
///
/// Single files hash as a one-entry archive named by the file name, so a
/// `COPY` source keeps the same cache id whether it is moved or renamed in
/// the build context only when its name and content are unchanged.
pub fn path_digest(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .map_err(|e| EngineError::Storage(format!("cannot stat {}: {}", path.display(), e)))?;
    if meta.is_dir() {
        return Ok(tree_digest(path)?.0);
    }

    let name = path
        .file_name()
        .ok_or_else(|| EngineError::Storage(format!("invalid source path {}", path.display())))?;
    let mut writer = HashingWriter::new(io::sink());
    {
        let mut builder = tar::Builder::new(&mut writer);
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(file_mode(&meta));
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
        builder
            .append_data(&mut header, Path::new(name), File::open(path)?)
            .map_err(|e| tar_err(Path::new(name), e))?;
        builder
            .finish()
            .map_err(|e| EngineError::Storage(format!("failed to finalize tar: {}", e)))?;
    }
    let (_, digest, _) = writer.finish();
    Ok(digest)
}

/// Write the canonical tar of `root` to a spool file.
///
/// Returns the tree digest and the tar size. The spool is what the
/// registry transport compresses and streams upward.
pub fn spool_canonical_tar(root: &Path, spool: &Path) -> Result<(String, u64)> {
    let file = File::create(spool)?;
    let writer = write_canonical_tar(root, HashingWriter::new(file))?;
    let (file, digest, size) = writer.finish();
    file.sync_all()?;
    Ok((digest, size))
}

/// Gzip-compress a reader into `out`, teeing the compressed bytes through
/// SHA-256.
///
/// Returns the digest of the *compressed* stream (the distribution digest)
/// and the compressed size.
pub fn gzip_spool<R: Read>(mut input: R, out: &Path) -> Result<(String, u64)> {
    let file = File::create(out)?;
    let mut encoder = GzEncoder::new(HashingWriter::new(file), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    let writer = encoder
        .finish()
        .map_err(|e| EngineError::Storage(format!("gzip failed: {}", e)))?;
    let (file, digest, size) = writer.finish();
    file.sync_all()?;
    Ok((digest, size))
}

/// Unpack a plain tar stream into `dest`.
pub fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| EngineError::Storage(format!("failed to unpack tar to {}: {}", dest.display(), e)))
}

/// Unpack a gzip-compressed tar stream into `dest`.
pub fn unpack_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    unpack_tar(flate2::read::GzDecoder::new(reader), dest)
}

/// Decompress a gzip stream, returning the digest and size of the
/// *decompressed* bytes.
pub fn gunzip_digest<R: Read>(reader: R) -> Result<(String, u64)> {
    sha256_reader(flate2::read::GzDecoder::new(reader))
}

fn collect_paths(root: &Path, current: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(current)
        .map_err(|e| EngineError::Storage(format!("cannot read {}: {}", current.display(), e)))?
    {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|e| EngineError::Storage(format!("path outside root: {}", e)))?
            .to_path_buf();
        let meta = std::fs::symlink_metadata(&path)?;
        out.push(rel);
        if meta.is_dir() {
            collect_paths(root, &path, out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn tar_err(path: &Path, e: io::Error) -> EngineError {
    EngineError::Storage(format!("failed to archive {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_tree(dir: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, content).unwrap();
        }
    }

    #[test]
    fn test_tree_digest_deterministic() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        write_tree(&a, &[("etc/conf", "v=1\n"), ("bin/tool", "#!/bin/sh\n")]);
        write_tree(&b, &[("bin/tool", "#!/bin/sh\n"), ("etc/conf", "v=1\n")]);

        let (da, sa) = tree_digest(&a).unwrap();
        let (db, sb) = tree_digest(&b).unwrap();
        assert_eq!(da, db);
        assert_eq!(sa, sb);
        assert!(sa > 0);
    }

    #[test]
    fn test_tree_digest_ignores_mtime() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tree");
        fs::create_dir_all(&dir).unwrap();
        write_tree(&dir, &[("file.txt", "same content")]);
        let (before, _) = tree_digest(&dir).unwrap();

        // rewrite identical content; mtime changes, digest must not
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.join("file.txt"), "same content").unwrap();
        let (after, _) = tree_digest(&dir).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_tree_digest_content_sensitive() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tree");
        fs::create_dir_all(&dir).unwrap();
        write_tree(&dir, &[("file.txt", "one")]);
        let (before, _) = tree_digest(&dir).unwrap();
        write_tree(&dir, &[("file.txt", "two")]);
        let (after, _) = tree_digest(&dir).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_path_digest_file_vs_dir() {
        let tmp = TempDir::new().unwrap();
        write_tree(tmp.path(), &[("single.yaml", "kind: Pod\n")]);
        let file_digest = path_digest(&tmp.path().join("single.yaml")).unwrap();
        let (dir_digest, _) = tree_digest(tmp.path()).unwrap();
        assert_eq!(file_digest.len(), 64);
        // a one-file archive and the enclosing directory tree differ
        assert_ne!(file_digest, dir_digest);
    }

    #[test]
    fn test_spool_matches_tree_digest() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tree");
        fs::create_dir_all(&dir).unwrap();
        write_tree(&dir, &[("manifests/dep.yaml", "image: nginx:1.19\n")]);

        let spool = tmp.path().join("layer.tar");
        let (digest, size) = spool_canonical_tar(&dir, &spool).unwrap();
        let (expected, expected_size) = tree_digest(&dir).unwrap();
        assert_eq!(digest, expected);
        assert_eq!(size, expected_size);
        assert_eq!(fs::metadata(&spool).unwrap().len(), size);
    }

    #[test]
    fn test_tar_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        write_tree(
            &src,
            &[("charts/app/Chart.yaml", "name: app\n"), ("top.txt", "x")],
        );

        let spool = tmp.path().join("t.tar");
        spool_canonical_tar(&src, &spool).unwrap();

        let dest = tmp.path().join("dest");
        unpack_tar(File::open(&spool).unwrap(), &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("charts/app/Chart.yaml")).unwrap(),
            "name: app\n"
        );
        assert_eq!(fs::read_to_string(dest.join("top.txt")).unwrap(), "x");

        // unpacked tree hashes identically to the source
        assert_eq!(tree_digest(&src).unwrap().0, tree_digest(&dest).unwrap().0);
    }

    #[test]
    fn test_gzip_spool_digest_is_of_compressed_stream() {
        let tmp = TempDir::new().unwrap();
        let gz = tmp.path().join("out.gz");
        let (digest, size) = gzip_spool(&b"payload bytes"[..], &gz).unwrap();

        let on_disk = fs::read(&gz).unwrap();
        assert_eq!(on_disk.len() as u64, size);
        assert_eq!(digest, crate::digest::sha256_bytes(&on_disk));

        // and the decompressed side matches the original
        let (plain_digest, plain_size) = gunzip_digest(&on_disk[..]).unwrap();
        assert_eq!(plain_size, 13);
        assert_eq!(plain_digest, crate::digest::sha256_bytes(b"payload bytes"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_preserved() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        write_tree(&src, &[("bin/real", "binary")]);
        std::os::unix::fs::symlink("real", src.join("bin/alias")).unwrap();

        let spool = tmp.path().join("t.tar");
        spool_canonical_tar(&src, &spool).unwrap();
        let dest = tmp.path().join("dest");
        unpack_tar(File::open(&spool).unwrap(), &dest).unwrap();

        let link = fs::read_link(dest.join("bin/alias")).unwrap();
        assert_eq!(link, PathBuf::from("real"));
    }
}
