//! Filesystem writer backed by a dedicated I/O worker thread.

use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

use super::FileWriter;

enum Cmd {
    WriteAt {
        offset: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<io::Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<io::Result<()>>,
    },
    Size {
        reply: oneshot::Sender<io::Result<u64>>,
    },
    Preallocate {
        size: u64,
        reply: oneshot::Sender<io::Result<()>>,
    },
    Delete {
        reply: oneshot::Sender<io::Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Writer over a local path. All operations are executed in order by one
/// worker thread owning the file handle, so callers on any task see a
/// consistent file state without locking.
pub struct FsFileWriter {
    tx: mpsc::Sender<Cmd>,
    path: PathBuf,
}

impl FsFileWriter {
    /// Opens (or creates) the file for positional writes without
    /// truncating, so a resumed download keeps its bytes. Parent
    /// directories are created as needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let (tx, rx) = mpsc::channel(64);
        let worker_path = path.to_path_buf();
        std::thread::spawn(move || worker(file, worker_path, rx));

        Ok(Self { tx, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<io::Result<T>>) -> Cmd,
    ) -> io::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| closed_err())?;
        rx.await.map_err(|_| closed_err())?
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "file writer is closed")
}

#[async_trait]
impl FileWriter for FsFileWriter {
    async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let data = data.to_vec();
        self.send(|reply| Cmd::WriteAt { offset, data, reply }).await
    }

    async fn flush(&self) -> io::Result<()> {
        self.send(|reply| Cmd::Flush { reply }).await
    }

    async fn size(&self) -> io::Result<u64> {
        self.send(|reply| Cmd::Size { reply }).await
    }

    async fn preallocate(&self, size: u64) -> io::Result<()> {
        self.send(|reply| Cmd::Preallocate { size, reply }).await
    }

    async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Cmd::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn delete(&self) -> io::Result<()> {
        self.send(|reply| Cmd::Delete { reply }).await
    }
}

fn worker(file: File, path: PathBuf, mut rx: mpsc::Receiver<Cmd>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Cmd::WriteAt { offset, data, reply } => {
                let _ = reply.send(write_all_at(&file, offset, &data));
            }
            Cmd::Flush { reply } => {
                let _ = reply.send(file.sync_all());
            }
            Cmd::Size { reply } => {
                let _ = reply.send(file.metadata().map(|m| m.len()));
            }
            Cmd::Preallocate { size, reply } => {
                let _ = reply.send(preallocate(&file, size));
            }
            Cmd::Delete { reply } => {
                let _ = reply.send(std::fs::remove_file(&path));
            }
            Cmd::Close { reply } => {
                let _ = file.sync_all();
                let _ = reply.send(());
                break;
            }
        }
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(data)
}

/// Reserves the full file length up front. Real block allocation where the
/// platform offers it (surfaces ENOSPC before the first write); setting the
/// length alone is enough everywhere else.
fn preallocate(file: &File, size: u64) -> io::Result<()> {
    if try_fallocate(file, size) {
        return Ok(());
    }
    file.set_len(size)
}

#[cfg(unix)]
fn try_fallocate(file: &File, size: u64) -> bool {
    use std::os::unix::io::AsRawFd;
    if size == 0 {
        return false;
    }
    let errno = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    if errno != 0 {
        tracing::debug!(errno, size, "posix_fallocate unavailable, length-only preallocation");
    }
    errno == 0
}

#[cfg(not(unix))]
fn try_fallocate(_file: &File, _size: u64) -> bool {
    false
}
