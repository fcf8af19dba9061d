//! Disk I/O for download output files.
//!
//! A writer owns one output file and serializes every positional write,
//! flush, and size query through a single worker, so concurrent segment
//! workers never need external locking. Preallocation reserves the full
//! file length up front (fallocate when available) so positional writes
//! never grow the file piecemeal and out-of-space surfaces early.

mod fs;

pub use fs::FsFileWriter;

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;

impl std::fmt::Debug for dyn FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter").finish()
    }
}

/// Positional read/write handle over one output target.
#[async_trait]
pub trait FileWriter: Send + Sync {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;
    async fn flush(&self) -> io::Result<()>;
    async fn size(&self) -> io::Result<u64>;
    /// Sets the file length so later positional writes never extend it.
    async fn preallocate(&self, size: u64) -> io::Result<()>;
    async fn close(&self);
    async fn delete(&self) -> io::Result<()>;
}

/// Opens writers for destination strings.
pub trait FileWriterFactory: Send + Sync {
    fn open(&self, target: &str) -> io::Result<Arc<dyn FileWriter>>;
}

/// Factory for plain filesystem paths (and `file://` URIs). Parent
/// directories are created on open. Other URI schemes belong to platform
/// writers and are rejected here.
pub struct FsWriterFactory;

impl FileWriterFactory for FsWriterFactory {
    fn open(&self, target: &str) -> io::Result<Arc<dyn FileWriter>> {
        let path = match target.split_once("://") {
            None => Path::new(target),
            Some(("file", rest)) => Path::new(rest),
            Some((scheme, _)) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("no filesystem writer for {}:// targets", scheme),
                ));
            }
        };
        Ok(Arc::new(FsFileWriter::open(path)?))
    }
}

/// Writer for sources that manage their own I/O (e.g. torrent engines).
pub struct NoopWriter;

#[async_trait]
impl FileWriter for NoopWriter {
    async fn write_at(&self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    async fn size(&self) -> io::Result<u64> {
        Ok(0)
    }

    async fn preallocate(&self, _size: u64) -> io::Result<()> {
        Ok(())
    }

    async fn close(&self) {}

    async fn delete(&self) -> io::Result<()> {
        Ok(())
    }
}
