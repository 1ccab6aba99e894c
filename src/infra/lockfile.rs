//! Lock files backing lease slots.
//!
//! Two flavours exist. A *hard* lock is an exclusive `flock(2)` on the file
//! and is released by the kernel if the holder dies. A *soft* lock is the mere
//! existence of the file; it works on any filesystem but a crashed holder
//! leaves its marker behind, so the file records the holder's pid.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::util::current_pid;

/// Locking mechanism used for a lease's slot files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// OS-level exclusive file lock.
    Hard,
    /// Marker-file existence.
    Soft,
}

enum Held {
    Hard(Flock<File>),
    Soft(File),
}

impl Held {
    fn file(&self) -> &File {
        match self {
            Self::Hard(lock) => &**lock,
            Self::Soft(file) => file,
        }
    }
}

/// An acquired lock file.
///
/// Dropping a `LockFile` without calling [`LockFile::release`] leaves the file
/// on disk (a hard lock is still unlocked by the kernel when the descriptor
/// closes).
pub struct LockFile {
    path: PathBuf,
    held: Held,
}

impl std::fmt::Debug for LockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFile")
            .field("path", &self.path)
            .field("kind", &self.kind())
            .finish()
    }
}

impl LockFile {
    /// Attempt a non-blocking exclusive lock on `path`.
    ///
    /// Returns `Ok(None)` when another holder has it. The parent directory is
    /// recreated if it vanished underneath us.
    ///
    /// # Errors
    ///
    /// Any I/O failure other than contention.
    pub fn try_acquire(kind: LockKind, path: &Path) -> io::Result<Option<Self>> {
        match kind {
            LockKind::Hard => Self::try_hard(path),
            LockKind::Soft => Self::try_soft(path),
        }
    }

    fn try_hard(path: &Path) -> io::Result<Option<Self>> {
        // A releasing holder unlinks the file before unlocking, so the inode
        // we lock may already be detached from `path`. Start over once.
        for _ in 0..2 {
            let file = with_parent(path, || {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
            })?;
            let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => lock,
                Err((_, Errno::EWOULDBLOCK)) => return Ok(None),
                Err((_, errno)) => return Err(errno.into()),
            };
            if refers_to(&lock, path)? {
                return Ok(Some(Self {
                    path: path.to_path_buf(),
                    held: Held::Hard(lock),
                }));
            }
            debug!(path = %path.display(), "locked inode was unlinked, retrying");
        }
        Ok(None)
    }

    fn try_soft(path: &Path) -> io::Result<Option<Self>> {
        let opened = with_parent(path, || {
            OpenOptions::new().write(true).create_new(true).open(path)
        });
        match opened {
            Ok(file) => Ok(Some(Self {
                path: path.to_path_buf(),
                held: Held::Soft(file),
            })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Overwrite the file contents with the holder's pid.
    ///
    /// # Errors
    ///
    /// I/O failure while writing.
    pub fn record_holder(&self, pid: u32) -> io::Result<()> {
        let mut file = self.held.file();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{pid}")?;
        file.flush()
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mechanism protecting this file.
    #[must_use]
    pub const fn kind(&self) -> LockKind {
        match self.held {
            Held::Hard(_) => LockKind::Hard,
            Held::Soft(_) => LockKind::Soft,
        }
    }

    /// Delete the file, then drop the lock.
    ///
    /// Deleting after unlocking would let a contender lock the old inode
    /// while a third party creates a fresh file at the same path.
    ///
    /// # Errors
    ///
    /// I/O failure while deleting or unlocking.
    pub fn release(self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "lock file already removed");
            }
            Err(e) => return Err(e),
        }
        match self.held {
            Held::Hard(lock) => lock.unlock().map(drop).map_err(|(_, errno)| errno.into()),
            Held::Soft(file) => {
                drop(file);
                Ok(())
            }
        }
    }
}

fn with_parent<T>(path: &Path, mut open: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    match open() {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            open()
        }
        other => other,
    }
}

fn refers_to(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Pid recorded in a lock file, if it holds a parsable one.
///
/// A holder that crashed between creating the file and writing its pid
/// leaves an empty file, which yields `None`.
#[must_use]
pub fn read_holder_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Remove `dir` if it is empty. Returns whether it was removed.
pub fn remove_dir_if_empty(dir: &Path) -> bool {
    let empty = fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
    // A concurrent acquirer may add a file between the check and the removal;
    // remove_dir refuses non-empty directories so that race is harmless.
    empty && fs::remove_dir(dir).is_ok()
}

/// Check whether `dir` supports real exclusive locks.
///
/// Takes two independent handles on a throwaway file and verifies that the
/// second is refused while the first holds the lock. `dir` must exist.
#[must_use]
pub fn probe_hard_lock_support(dir: &Path) -> bool {
    let probe = dir.join(format!(
        ".probe.{}.{}.lock",
        current_pid(),
        uuid::Uuid::new_v4().simple()
    ));
    let outcome = probe_exclusion(&probe);
    if let Err(e) = fs::remove_file(&probe) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %probe.display(), error = %e, "failed to remove lock probe");
        }
    }
    match outcome {
        Ok(excludes) => excludes,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "lock probe failed");
            false
        }
    }
}

fn probe_exclusion(probe: &Path) -> io::Result<bool> {
    let open = || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(probe)
    };
    let first = open()?;
    let second = open()?;
    let held = Flock::lock(first, FlockArg::LockExclusiveNonblock).map_err(|(_, e)| io::Error::from(e))?;
    let excludes = match Flock::lock(second, FlockArg::LockExclusiveNonblock) {
        Ok(_) => false,
        Err((_, Errno::EWOULDBLOCK)) => true,
        Err((_, e)) => return Err(e.into()),
    };
    drop(held);
    Ok(excludes)
}
