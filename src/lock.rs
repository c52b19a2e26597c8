use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Advisory lock on a file shared by every process using the same data
/// directory.
///
/// Locks belong to the open file, so two guards never coexist even inside one
/// process. The kernel drops the lock when its holder exits.
#[derive(Clone, Debug)]
pub struct RunLock {
    path: PathBuf,
}

/// Held while a save runs; closing the file releases the lock.
#[derive(Debug)]
pub struct RunGuard {
    _file: File,
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), operation) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl RunLock {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
    }

    /// Takes the lock, or returns `None` when another holder has it.
    pub fn try_acquire(&self) -> io::Result<Option<RunGuard>> {
        let file = self.open()?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(RunGuard { _file: file })),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Waits for the lock on a blocking thread.
    pub async fn acquire(&self) -> io::Result<RunGuard> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || {
            let file = lock.open()?;
            loop {
                match flock(&file, libc::LOCK_EX) {
                    Ok(()) => return Ok(RunGuard { _file: file }),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }
}
