use anyhow::{Context, Result, bail};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lock name taken by the `run` command
pub const RUN_LOCK: &str = "aerotrack-run";

/// Exclusive advisory lock on `<dir>/<name>.lock`, held until drop.
///
/// Two pipelines writing to one database would both predict the same
/// surrogate ids, so only one `run` may hold the lock at a time.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock in the runtime directory (`XDG_RUNTIME_DIR`, else temp)
    pub fn new(name: &str) -> Result<Self> {
        Self::acquire_in(&runtime_dir(), name)
    }

    /// Acquire the lock in `dir`; fails without blocking if it is held
    pub fn acquire_in(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory {}", dir.display()))?;
        let path = lock_path(dir, name);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if !try_flock(&file)? {
            bail!(
                "Another aerotrack instance holds {}",
                path.display()
            );
        }

        // Record our pid for operators; the lock itself is the flock
        file.set_len(0).context("Failed to truncate lock file")?;
        let pid = std::process::id();
        (&file)
            .write_all(format!("{}\n", pid).as_bytes())
            .context("Failed to write pid to lock file")?;

        info!("Acquired instance lock {} (pid {})", path.display(), pid);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether some other open file description holds the lock in `dir`
    pub fn is_held_in(dir: &Path, name: &str) -> Result<bool> {
        let path = lock_path(dir, name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).context("Failed to open lock file"),
        };
        if try_flock(&file)? {
            unlock(&file);
            Ok(false)
        } else {
            Ok(true)
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        unlock(&self.file);
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released instance lock {}", self.path.display()),
            Err(e) => debug!("Lock file {} not removed: {}", self.path.display(), e),
        }
    }
}

fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lock", name))
}

/// Non-blocking exclusive flock. `Ok(false)` when someone else holds it.
#[cfg(unix)]
fn try_flock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err).context("Failed to lock instance file")
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
