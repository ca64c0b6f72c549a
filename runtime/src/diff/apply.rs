//! Tar layer application with OCI whiteout handling.
//!
//! The blob may be plain, gzip, bzip2 or xz compressed tar; the format is
//! detected from its leading bytes. The uncompressed stream is hashed while
//! it is extracted, and that hash is the diff ID reported back.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use imgpull_core::{
    uncompressed_media_type, Algorithm, BlobStore, Descriptor, DiffService, Digest, Digester,
    Mount, PullError, Result,
};
use parking_lot::Mutex;
use tar::Archive;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use xz2::read::XzDecoder;

use crate::fs::remove_path;

const WHITEOUT_PREFIX: &str = ".wh.";
/// Opaque-directory marker, after `WHITEOUT_PREFIX` is stripped.
const OPAQUE_MARKER: &str = ".wh..opq";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// An extraction running on the blocking pool.
#[derive(Clone)]
struct Extraction {
    stop: Arc<AtomicBool>,
    done: CancellationToken,
}

/// Sets the stop flag when the awaiting `apply` future goes away.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Applies layer blobs from a blob store onto a single writable bind mount.
///
/// Extraction runs on the blocking pool. Dropping an `apply` future asks the
/// extraction to stop at the next archive entry; [`DiffService::settle`]
/// waits until it has.
pub struct TarApplier {
    store: Arc<dyn BlobStore>,
    running: Arc<Mutex<HashMap<PathBuf, Extraction>>>,
}

impl TarApplier {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl DiffService for TarApplier {
    async fn apply(&self, mounts: &[Mount], layer: &Descriptor) -> Result<Descriptor> {
        let target = writable_target(mounts)?;
        let data = self.store.get(&layer.digest).await?;

        let extraction = Extraction {
            stop: Arc::new(AtomicBool::new(false)),
            done: CancellationToken::new(),
        };
        self.running.lock().insert(target.clone(), extraction.clone());
        let _stop = StopOnDrop(extraction.stop.clone());

        let running = self.running.clone();
        let dir = target.clone();
        let (diff_id, size) = tokio::task::spawn_blocking(move || {
            let _done = extraction.done.clone().drop_guard();
            let result = apply_layer_until(&data, &dir, &extraction.stop);

            let mut running = running.lock();
            if running
                .get(&dir)
                .is_some_and(|e| Arc::ptr_eq(&e.stop, &extraction.stop))
            {
                running.remove(&dir);
            }
            result
        })
        .await
        .map_err(|e| PullError::Io(format!("layer extraction task failed: {}", e)))??;

        debug!(
            digest = %layer.digest,
            diff_id = %diff_id,
            target = %target.display(),
            "Applied layer"
        );
        Ok(Descriptor::new(
            uncompressed_media_type(&layer.media_type),
            diff_id,
            size as i64,
        ))
    }

    async fn settle(&self, mounts: &[Mount]) -> Result<()> {
        let Ok(target) = writable_target(mounts) else {
            return Ok(());
        };
        let extraction = self.running.lock().get(&target).cloned();
        if let Some(extraction) = extraction {
            extraction.stop.store(true, Ordering::SeqCst);
            extraction.done.cancelled().await;
            debug!(target = %target.display(), "Abandoned extraction stopped");
        }
        Ok(())
    }
}

fn writable_target(mounts: &[Mount]) -> Result<PathBuf> {
    match mounts {
        [mount] if mount.kind == "bind" && !mount.is_read_only() => {
            Ok(PathBuf::from(&mount.source))
        }
        [mount] => Err(PullError::FailedPrecondition(format!(
            "cannot apply a layer onto a {} mount with options {:?}",
            mount.kind, mount.options
        ))),
        _ => Err(PullError::FailedPrecondition(format!(
            "expected exactly one mount, got {}",
            mounts.len()
        ))),
    }
}

/// Extract a (possibly compressed) tar layer into `target`.
///
/// Returns the sha256 digest and length of the uncompressed tar stream.
pub fn apply_layer(data: &[u8], target: &Path) -> Result<(Digest, u64)> {
    apply_layer_until(data, target, &AtomicBool::new(false))
}

/// Like [`apply_layer`], but gives up with `Canceled` before the next entry
/// once `stop` is set.
pub fn apply_layer_until(data: &[u8], target: &Path, stop: &AtomicBool) -> Result<(Digest, u64)> {
    std::fs::create_dir_all(target)?;

    let mut archive = Archive::new(HashingReader::new(decoder(data)?));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    // Paths this layer has written, with their ancestors. Whiteouts only
    // hide content from lower layers.
    let mut written = HashSet::new();

    for entry in archive.entries().map_err(extract_error)? {
        if stop.load(Ordering::SeqCst) {
            return Err(PullError::Canceled("layer extraction stopped".to_string()));
        }

        let mut entry = entry.map_err(extract_error)?;
        let path = entry.path().map_err(extract_error)?.into_owned();
        let relative = entry_path(&path)?;

        let whiteout = relative
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(WHITEOUT_PREFIX))
            .map(|name| name.to_string());

        match whiteout {
            Some(name) => apply_whiteout(target, &relative, &name, &written)?,
            None => {
                if entry.unpack_in(target).map_err(extract_error)? {
                    for ancestor in relative.ancestors() {
                        if ancestor.as_os_str().is_empty() {
                            break;
                        }
                        if !written.insert(ancestor.to_path_buf()) {
                            break;
                        }
                    }
                }
            }
        }
    }

    // Hash any trailing bytes the tar reader stopped short of.
    let mut reader = archive.into_inner();
    io::copy(&mut reader, &mut io::sink()).map_err(extract_error)?;
    Ok(reader.finish())
}

fn decoder<'a>(data: &'a [u8]) -> Result<Box<dyn Read + 'a>> {
    if data.starts_with(GZIP_MAGIC) {
        Ok(Box::new(GzDecoder::new(data)))
    } else if data.starts_with(BZIP2_MAGIC) {
        Ok(Box::new(BzDecoder::new(data)))
    } else if data.starts_with(XZ_MAGIC) {
        Ok(Box::new(XzDecoder::new(data)))
    } else if data.starts_with(ZSTD_MAGIC) {
        Err(PullError::FailedPrecondition(
            "zstd-compressed layers are not supported".to_string(),
        ))
    } else {
        Ok(Box::new(data))
    }
}

fn apply_whiteout(
    target: &Path,
    relative: &Path,
    name: &str,
    written: &HashSet<PathBuf>,
) -> Result<()> {
    let parent_rel = relative.parent().unwrap_or(Path::new(""));
    let Some(parent) = existing_dir(target, parent_rel)? else {
        // Nothing below to hide.
        return Ok(());
    };

    if name == OPAQUE_MARKER {
        return clear_lower(&parent, parent_rel, written);
    }

    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(PullError::FailedPrecondition(format!(
            "invalid whiteout entry {}",
            relative.display()
        )));
    }
    if written.contains(&parent_rel.join(name)) {
        return Ok(());
    }
    remove_path(&parent.join(name))?;
    Ok(())
}

/// Remove everything under `dir` that the current layer did not write.
fn clear_lower(dir: &Path, relative: &Path, written: &HashSet<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let child = relative.join(entry.file_name());
        if !written.contains(&child) {
            remove_path(&entry.path())?;
        } else if entry.file_type()?.is_dir() {
            clear_lower(&entry.path(), &child, written)?;
        }
    }
    Ok(())
}

/// Walk `relative` down from `root` through directories already on disk.
///
/// Fails if a component is a symlink, since following it could leave
/// `root`. Returns `None` when a component is missing or not a directory.
fn existing_dir(root: &Path, relative: &Path) -> Result<Option<PathBuf>> {
    let mut dir = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => dir.push(part),
            Component::CurDir => continue,
            _ => return Err(escapes(relative)),
        }
        let meta = match std::fs::symlink_metadata(&dir) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.file_type().is_symlink() {
            return Err(PullError::FailedPrecondition(format!(
                "whiteout under {} passes through a symlink",
                relative.display()
            )));
        }
        if !meta.is_dir() {
            return Ok(None);
        }
    }
    Ok(Some(dir))
}

fn escapes(relative: &Path) -> PullError {
    PullError::FailedPrecondition(format!(
        "layer entry {} escapes the target directory",
        relative.display()
    ))
}

/// Normalize an archive path to one relative to the layer root.
///
/// A leading `/` is dropped, as `tar` does on unpack; `..` is an error.
fn entry_path(path: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            _ => return Err(escapes(path)),
        }
    }
    Ok(relative)
}

fn extract_error(err: io::Error) -> PullError {
    PullError::Io(format!("Failed to extract layer: {}", err))
}

/// Passes bytes through while hashing them.
struct HashingReader<R> {
    inner: R,
    digester: Digester,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            digester: Digester::new(Algorithm::Sha256),
            count: 0,
        }
    }

    fn finish(self) -> (Digest, u64) {
        (self.digester.finish(), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}
