//! # Archive Streaming
//!
//! Tar extraction shared by both module sources, plus the fan-out that lets
//! one network read feed several consumers.
//!
//! - Forge releases arrive as `.tar.gz` and are written to disk and extracted
//!   in the same pass ([`tee_download`]).
//! - Git trees arrive as the plain tar stream of `git archive`
//!   ([`extract_tar`]).
//! - Persisted Forge archives are verified by hashing them with MD5 and
//!   SHA-256 concurrently ([`digest_file`]).
//!
//! The fan-out uses bounded `sync_channel` queues: the producer blocks as
//! soon as the slowest consumer is `QUEUE_DEPTH` chunks behind. Extractors
//! always drain their input to EOF so the producer never blocks on a
//! consumer that stopped reading.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use flate2::read::GzDecoder;
use log::{debug, trace};
use sha2::{Digest, Sha256};
use tar::EntryType;

use crate::error::{Error, Result};
use crate::path::{is_blacklisted, is_contained};

const CHUNK_SIZE: usize = 64 * 1024;
const QUEUE_DEPTH: usize = 16;

type Chunk = Arc<Vec<u8>>;

/// A `Read` adapter over the receiving end of a chunk queue.
struct ChannelReader {
    receiver: Receiver<Chunk>,
    current: Chunk,
    position: usize,
}

impl ChannelReader {
    fn new(receiver: Receiver<Chunk>) -> Self {
        Self {
            receiver,
            current: Arc::new(Vec::new()),
            position: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.current.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.position = 0;
                }
                // Sender gone: end of stream
                Err(_) => return Ok(0),
            }
        }
        let available = &self.current[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Read `source` to EOF, handing every chunk to each live sink. Returns the
/// number of bytes read. A sink whose consumer has hung up is skipped.
fn pump<R: Read>(mut source: R, sinks: Vec<SyncSender<Chunk>>) -> io::Result<u64> {
    let mut live: Vec<Option<SyncSender<Chunk>>> = sinks.into_iter().map(Some).collect();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        total += n as u64;
        let chunk: Chunk = Arc::new(buf[..n].to_vec());
        for slot in live.iter_mut() {
            let disconnected = match slot {
                Some(sender) => sender.send(Arc::clone(&chunk)).is_err(),
                None => false,
            };
            if disconnected {
                *slot = None;
            }
        }
    }
    Ok(total)
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>, what: &str) -> Result<T> {
    handle.join().map_err(|_| Error::Cache {
        message: format!("{} thread panicked", what),
    })?
}

/// Stream a gzip-compressed tarball from `source` into `archive_path` and,
/// concurrently, extract it into `extract_dir`.
///
/// The first path component of every entry (the `author-name-version/`
/// directory of a Forge release) is stripped. Returns the number of bytes
/// read from `source`.
pub fn tee_download<R: Read>(
    source: R,
    archive_path: &Path,
    extract_dir: &Path,
    blacklist: &[String],
) -> Result<u64> {
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;
    }
    fs::create_dir_all(extract_dir).map_err(|e| Error::filesystem(extract_dir, e))?;

    let (file_tx, file_rx) = mpsc::sync_channel::<Chunk>(QUEUE_DEPTH);
    let (extract_tx, extract_rx) = mpsc::sync_channel::<Chunk>(QUEUE_DEPTH);

    thread::scope(|scope| {
        let writer = scope.spawn(move || -> Result<()> {
            let file =
                File::create(archive_path).map_err(|e| Error::filesystem(archive_path, e))?;
            let mut out = BufWriter::new(file);
            for chunk in file_rx {
                out.write_all(&chunk)?;
            }
            out.flush()?;
            Ok(())
        });
        let extractor = scope.spawn(move || -> Result<()> {
            extract_tar_gz(ChannelReader::new(extract_rx), extract_dir, blacklist, 1)
                .map(|_| ())
        });

        let pumped = pump(source, vec![file_tx, extract_tx]);

        let written = join(writer, "archive writer");
        let extracted = join(extractor, "archive extractor");
        let total = pumped?;
        written?;
        extracted?;
        debug!(
            "Downloaded {} bytes to {} and extracted into {}",
            total,
            archive_path.display(),
            extract_dir.display()
        );
        Ok(total)
    })
}

/// Extract a gzip-compressed tarball, then drain whatever follows the
/// compressed stream.
pub fn extract_tar_gz<R: Read>(
    mut reader: R,
    dest: &Path,
    blacklist: &[String],
    strip_components: usize,
) -> Result<usize> {
    let count = {
        let decoder = GzDecoder::new(&mut reader);
        extract_tar(decoder, dest, blacklist, strip_components)?
    };
    io::copy(&mut reader, &mut io::sink())?;
    Ok(count)
}

/// Extract a tar stream into `dest`, returning the number of entries
/// written.
///
/// Entries are skipped when they are blacklisted (relative to `dest` after
/// stripping) or are pax headers. Entries escaping `dest` are rejected. The
/// rest of the stream is drained once the archive ends.
pub fn extract_tar<R: Read>(
    mut reader: R,
    dest: &Path,
    blacklist: &[String],
    strip_components: usize,
) -> Result<usize> {
    let mut written = 0;
    {
        let mut archive = tar::Archive::new(&mut reader);
        archive.set_preserve_mtime(true);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_type = entry.header().entry_type();
            if matches!(
                entry_type,
                EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName
            ) {
                continue;
            }

            let raw_path = entry.path()?.into_owned();
            let Some(relative) = strip(&raw_path, strip_components) else {
                continue;
            };
            if !is_contained(&relative) {
                return Err(Error::filesystem(
                    dest,
                    format!("archive entry escapes destination: {}", raw_path.display()),
                ));
            }
            if is_blacklisted(&relative, blacklist) {
                trace!("Skipping blacklisted entry {}", relative.display());
                continue;
            }

            let target = dest.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;
            }

            if entry_type == EntryType::Link {
                let link = entry
                    .link_name()?
                    .map(|l| l.into_owned())
                    .and_then(|l| strip(&l, strip_components))
                    .filter(|l| is_contained(l))
                    .ok_or_else(|| {
                        Error::filesystem(
                            &target,
                            "hardlink entry without a valid target in archive",
                        )
                    })?;
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target).map_err(|e| Error::filesystem(&target, e))?;
                }
                fs::hard_link(dest.join(link), &target)
                    .map_err(|e| Error::filesystem(&target, e))?;
            } else {
                entry
                    .unpack(&target)
                    .map_err(|e| Error::filesystem(&target, e))?;
            }
            written += 1;
        }
    }

    io::copy(&mut reader, &mut io::sink())?;
    Ok(written)
}

fn strip(path: &Path, components: usize) -> Option<PathBuf> {
    let stripped: PathBuf = path.components().skip(components).collect();
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

/// Checksums and size of a persisted archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    pub md5: String,
    pub sha256: String,
    pub size: u64,
}

/// Hash `path` with MD5 and SHA-256 concurrently while counting its size.
pub fn digest_file(path: &Path) -> Result<Digests> {
    let file = File::open(path).map_err(|e| Error::filesystem(path, e))?;

    let (md5_tx, md5_rx) = mpsc::sync_channel::<Chunk>(QUEUE_DEPTH);
    let (sha_tx, sha_rx) = mpsc::sync_channel::<Chunk>(QUEUE_DEPTH);

    thread::scope(|scope| {
        let md5_worker = scope.spawn(move || -> Result<String> {
            let mut context = md5::Context::new();
            for chunk in md5_rx {
                context.consume(chunk.as_slice());
            }
            Ok(format!("{:x}", context.compute()))
        });
        let sha_worker = scope.spawn(move || -> Result<String> {
            let mut hasher = Sha256::new();
            for chunk in sha_rx {
                hasher.update(chunk.as_slice());
            }
            Ok(format!("{:x}", hasher.finalize()))
        });

        let size = pump(file, vec![md5_tx, sha_tx]);
        let md5 = join(md5_worker, "md5")?;
        let sha256 = join(sha_worker, "sha256")?;
        Ok(Digests {
            md5,
            sha256,
            size: size.map_err(|e| Error::filesystem(path, e))?,
        })
    })
}
