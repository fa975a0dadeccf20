//! Cross-Process GPIO Lock
//!
//! ## Overview
//!
//! All HX711 channels of a HoneyPi hang off the same GPIO lines, and they are
//! bit-banged by independent processes: the scheduled measurement loop, the
//! "measure now" action of the web interface and the maintenance weighings. An
//! in-memory mutex cannot serialise those, so the lock is a file.
//!
//! ## Protocol
//!
//! ```text
//! loop:
//!     create lock file exclusively (O_CREAT | O_EXCL), write "<pid> <nonce>"
//!       ok             -> raise priority, return lease
//!       already exists -> older than `stale_after`? take it over, retry
//!                         otherwise sleep `poll_interval`, retry
//! ```
//!
//! The exclusive create is the only step that grants ownership. A holder
//! keeps its lock fresh with [`LockLease::touch`], so only a crashed or hung
//! holder is ever taken over, after at most `stale_after`.
//!
//! Removing a file is always done by renaming it to a private name first
//! and checking it there: a takeover deletes the file only if it is still
//! the stale one it saw, and a release only if it still holds the lease
//! token. Anything else is put back. A lease that was taken over reports
//! [`LockError::Lost`] instead of deleting the new holder's lock.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use honeypi_core::lock::{ExclusiveAccessGuard, LockConfig};
//!
//! let guard = ExclusiveAccessGuard::new(LockConfig::new("/home/pi/HoneyPi/rpi-scripts/.isActive"));
//! let weight = guard.with_lock(|lease| {
//!     // bit-bang the HX711 here, touching the lease between long steps
//!     lease.touch()?;
//!     Ok::<_, honeypi_core::LockError>(42.0)
//! })??;
//! # Ok::<(), honeypi_core::LockError>(())
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::constants::timing::{LOCK_POLL_INTERVAL, LOCK_STALE_AFTER};
use crate::errors::LockError;

/// File name of the lock inside the HoneyPi scripts folder
pub const LOCK_FILE_NAME: &str = ".isActive";

/// Niceness while holding the lock
const RAISED_NICENESS: i32 = -19;

/// Niceness restored on release
const NORMAL_NICENESS: i32 = 0;

/// Location and timing of the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Lock file location
    pub path: PathBuf,
    /// Lock age after which the holder is presumed dead
    pub stale_after: Duration,
    /// Wait between checks while the lock is held
    pub poll_interval: Duration,
}

impl LockConfig {
    /// Lock at `path` with the default timing
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_after: LOCK_STALE_AFTER,
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }

    /// Lock file [`LOCK_FILE_NAME`] inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(LOCK_FILE_NAME))
    }

    /// Override the staleness window
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Override the wait between checks
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Scheduling priority adjustment around the critical section
///
/// Bit-banging suffers from scheduler jitter, so the holder runs at a higher
/// priority. Implementations are best effort and must not fail the caller.
pub trait PriorityControl: Send + Sync {
    /// Called once the lock is taken
    fn raise(&self);
    /// Called when the lease ends
    fn restore(&self);
}

/// Leaves the scheduling priority alone
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPriorityChange;

impl PriorityControl for NoPriorityChange {
    fn raise(&self) {}
    fn restore(&self) {}
}

/// Adjusts the niceness of the current process with `renice`
#[derive(Debug, Clone, Copy)]
pub struct Renice {
    sudo: bool,
}

impl Renice {
    /// `sudo` runs `renice` through non-interactive sudo, needed for
    /// negative niceness when not running as root
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    fn renice(&self, niceness: i32) {
        let pid = std::process::id().to_string();
        let niceness = niceness.to_string();

        let mut command = if self.sudo {
            let mut command = Command::new("sudo");
            command.args(["-n", "renice"]);
            command
        } else {
            Command::new("renice")
        };
        command
            .args(["-n", niceness.as_str(), "-p", pid.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match command.status() {
            Ok(status) if status.success() => debug!("process {} reniced to {}", pid, niceness),
            Ok(status) => debug!("renice to {} exited with {}", niceness, status),
            Err(e) => debug!("renice unavailable: {}", e),
        }
    }
}

impl PriorityControl for Renice {
    fn raise(&self) {
        self.renice(RAISED_NICENESS);
    }

    fn restore(&self) {
        self.renice(NORMAL_NICENESS);
    }
}

/// File based mutual exclusion for the shared HX711 bus
#[derive(Clone)]
pub struct ExclusiveAccessGuard {
    config: LockConfig,
    clock: Arc<dyn Clock>,
    priority: Arc<dyn PriorityControl>,
}

impl std::fmt::Debug for ExclusiveAccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveAccessGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExclusiveAccessGuard {
    /// Guard on the system clock that leaves priority untouched
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            priority: Arc::new(NoPriorityChange),
        }
    }

    /// Clock used for lock ages, polling and lease refreshes
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Priority adjustment applied while a lease is held
    pub fn with_priority(mut self, priority: Arc<dyn PriorityControl>) -> Self {
        self.priority = priority;
        self
    }

    /// Location and timing of the lock
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Block until the lock is ours
    ///
    /// Fails only when the lock file cannot be created for reasons other than
    /// contention, or when a stale lock cannot be removed.
    pub fn acquire(&self) -> Result<LockLease, LockError> {
        let path = &self.config.path;
        let io_error = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };
        let mut announced = false;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => {
                    let token = new_token();
                    if let Err(source) = write_token(file, &token) {
                        // Without our token nobody could tell the file is ours
                        let _ = fs::remove_file(path);
                        return Err(io_error(source));
                    }
                    self.priority.raise();
                    debug!("acquired GPIO lock {} as {}", path.display(), token);
                    return Ok(LockLease {
                        path: path.clone(),
                        token,
                        clock: Arc::clone(&self.clock),
                        priority: Arc::clone(&self.priority),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(io_error(source)),
            }

            let observed = match LockSnapshot::read(path) {
                Ok(observed) => observed,
                // Released between our create and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => return Err(io_error(source)),
            };

            if self.clock.elapsed_since(observed.modified) > self.config.stale_after {
                warn!(
                    "GPIO lock {} is older than {:?}, previous measurement was likely not finished properly; removing it",
                    path.display(),
                    self.config.stale_after
                );
                self.remove_stale(&observed)?;
                continue;
            }

            if !announced {
                info!("measurement waits for another measurement job to finish");
                announced = true;
            }
            self.clock.sleep(self.config.poll_interval);
        }
    }

    /// Run `f` while holding the lock
    ///
    /// `f` gets the lease so long running work can [`LockLease::touch`] it.
    pub fn with_lock<T>(&self, f: impl FnOnce(&LockLease) -> T) -> Result<T, LockError> {
        let lease = self.acquire()?;
        let result = f(&lease);
        lease.release()?;
        Ok(result)
    }

    /// Delete the stale lock `observed`, unless it changed since
    fn remove_stale(&self, observed: &LockSnapshot) -> Result<(), LockError> {
        let path = &self.config.path;
        let unremovable = |source: io::Error| {
            error!(
                "CRITICAL: stale GPIO lock {} cannot be removed: {}",
                path.display(),
                source
            );
            LockError::StaleLockUnremovable {
                path: path.clone(),
                source,
            }
        };

        if !observed.is_file {
            return Err(unremovable(io::Error::new(
                io::ErrorKind::Other,
                "lock path is not a regular file",
            )));
        }

        let taken = take_if(path, &private_path(path, &new_token()), |moved| {
            moved.holder == observed.holder && moved.modified == observed.modified
        })
        .map_err(unremovable)?;
        match taken {
            Taken::Removed => debug!("removed stale GPIO lock {}", path.display()),
            Taken::Gone => debug!("stale GPIO lock {} vanished before removal", path.display()),
            Taken::Foreign => debug!("GPIO lock {} was renewed, not removed", path.display()),
        }
        Ok(())
    }
}

/// Held GPIO lock; released on drop
///
/// The lock file holds the lease token. Only a file still holding it is ever
/// deleted, so a lease that outlived a takeover never removes the lock of
/// the new holder.
#[must_use = "the lock is released as soon as the lease is dropped"]
pub struct LockLease {
    path: PathBuf,
    token: String,
    clock: Arc<dyn Clock>,
    priority: Arc<dyn PriorityControl>,
    released: bool,
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("path", &self.path)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockLease {
    /// Location of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid and nonce written into the lock file
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Reset the age of the lock file so waiters do not consider it stale
    ///
    /// Fails with [`LockError::Lost`] once the file no longer holds our token.
    pub fn touch(&self) -> Result<(), LockError> {
        let io_error = |source: io::Error| LockError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(self.lost()),
            Err(source) => return Err(io_error(source)),
        };

        // Checked and touched through the same handle, so a file swapped in
        // meanwhile is never refreshed by mistake
        let mut holder = String::new();
        file.read_to_string(&mut holder).map_err(io_error)?;
        if holder.trim() != self.token {
            return Err(self.lost());
        }
        file.set_modified(self.clock.now()).map_err(io_error)
    }

    /// Release now and report filesystem errors instead of logging them
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.priority.restore();
        match self.remove_own() {
            Ok(Taken::Removed) => {
                debug!("released GPIO lock {}", self.path.display());
                Ok(())
            }
            Ok(Taken::Gone) => {
                warn!("GPIO lock {} was already gone on release", self.path.display());
                Ok(())
            }
            Ok(Taken::Foreign) => Err(self.lost()),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn remove_own(&self) -> io::Result<Taken> {
        let token = self.token.as_str();
        take_if(&self.path, &private_path(&self.path, token), |moved| {
            moved.holder.as_deref() == Some(token)
        })
    }

    fn lost(&self) -> LockError {
        error!(
            "CRITICAL: GPIO lock {} was taken over while still held by {}",
            self.path.display(),
            self.token
        );
        LockError::Lost {
            path: self.path.clone(),
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.priority.restore();
        match self.remove_own() {
            Ok(Taken::Removed) => debug!("released GPIO lock {}", self.path.display()),
            Ok(Taken::Gone) => warn!("GPIO lock {} was already gone on release", self.path.display()),
            Ok(Taken::Foreign) => {
                let _ = self.lost();
            }
            Err(e) => error!("could not remove GPIO lock {}: {}", self.path.display(), e),
        }
    }
}

/// Lock file as seen at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockSnapshot {
    modified: SystemTime,
    holder: Option<String>,
    is_file: bool,
}

impl LockSnapshot {
    /// Age and content read through one handle, so both describe the same file
    fn read(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let holder = if meta.is_file() {
            let mut content = String::new();
            file.read_to_string(&mut content)?;
            Some(content.trim().to_string())
        } else {
            None
        };
        Ok(Self {
            modified: meta.modified()?,
            holder,
            is_file: meta.is_file(),
        })
    }
}

/// Result of [`take_if`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Taken {
    /// The file matched and was deleted
    Removed,
    /// Nothing at the lock path
    Gone,
    /// Another file was found and put back
    Foreign,
}

/// Delete the file at `path` only if `matches` accepts it
///
/// The file is first renamed to `private`, which nobody else uses, and
/// inspected there. A rename either moves one whole file or nothing, so the
/// check and the delete apply to the same file even while other processes
/// create or replace the lock.
fn take_if(path: &Path, private: &Path, matches: impl Fn(&LockSnapshot) -> bool) -> io::Result<Taken> {
    match fs::rename(path, private) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Taken::Gone),
        Err(e) => return Err(e),
    }

    let moved = match LockSnapshot::read(private) {
        Ok(moved) => moved,
        Err(e) => {
            restore(private, path)?;
            return Err(e);
        }
    };
    if matches(&moved) {
        fs::remove_file(private)?;
        return Ok(Taken::Removed);
    }
    restore(private, path)?;
    Ok(Taken::Foreign)
}

/// Put a file taken by mistake back, unless a new lock was created meanwhile
fn restore(private: &Path, path: &Path) -> io::Result<()> {
    // hard_link never replaces an existing file, unlike rename
    match fs::hard_link(private, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!("GPIO lock {} was recreated while being checked", path.display())
        }
        Err(e) => return Err(e),
    }
    fs::remove_file(private)
}

/// Sibling of `path` reserved for the holder of `token`
fn private_path(path: &Path, token: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| LOCK_FILE_NAME.to_string());
    path.with_file_name(format!("{}.{}.tmp", name, token.replace(' ', "-")))
}

/// Pid plus a nonce unique within this process
fn new_token() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.subsec_nanos())
        .unwrap_or_default();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{} {:08x}{:04x}", std::process::id(), nanos, sequence)
}

fn write_token(mut file: File, token: &str) -> io::Result<()> {
    writeln!(file, "{}", token)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPriority {
        raised: AtomicUsize,
        restored: AtomicUsize,
    }

    impl PriorityControl for CountingPriority {
        fn raise(&self) {
            self.raised.fetch_add(1, Ordering::SeqCst);
        }
        fn restore(&self) {
            self.restored.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lease_creates_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ExclusiveAccessGuard::new(LockConfig::in_dir(dir.path()));

        let lease = guard.acquire().unwrap();
        assert!(lease.path().exists());
        assert_eq!(lease.path().file_name().unwrap(), LOCK_FILE_NAME);
        drop(lease);
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn priority_is_raised_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let priority = Arc::new(CountingPriority::default());
        let guard = ExclusiveAccessGuard::new(LockConfig::in_dir(dir.path())).with_priority(priority.clone());

        guard.with_lock(|_| ()).unwrap();
        guard.acquire().unwrap().release().unwrap();

        assert_eq!(priority.raised.load(Ordering::SeqCst), 2);
        assert_eq!(priority.restored.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fresh_foreign_lock_is_waited_on() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig::in_dir(dir.path());
        fs::write(&config.path, "4242\n").unwrap();

        // The manual clock makes every poll age the foreign lock by one second
        let clock = Arc::new(ManualClock::starting_now());
        let guard = ExclusiveAccessGuard::new(config).with_clock(clock.clone());

        let lease = guard.acquire().unwrap();
        assert!(clock.sleep_count() >= 120);
        assert!(clock.total_slept() <= LOCK_STALE_AFTER + 2 * LOCK_POLL_INTERVAL);
        drop(lease);
    }

    #[test]
    fn release_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ExclusiveAccessGuard::new(LockConfig::in_dir(dir.path()));

        let lease = guard.acquire().unwrap();
        fs::remove_file(lease.path()).unwrap();
        assert!(lease.release().is_ok());
    }

    #[test]
    fn lock_file_holds_a_unique_token() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ExclusiveAccessGuard::new(LockConfig::in_dir(dir.path()));

        let first = guard.acquire().unwrap();
        let content = fs::read_to_string(first.path()).unwrap();
        assert_eq!(content.trim(), first.token());
        assert!(first.token().starts_with(&format!("{} ", std::process::id())));
        first.release().unwrap();

        let second = guard.acquire().unwrap();
        assert_ne!(second.token(), content.trim());
    }

    #[test]
    fn touch_refreshes_the_lock_age() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let guard = ExclusiveAccessGuard::new(LockConfig::in_dir(dir.path())).with_clock(clock.clone());

        let lease = guard.acquire().unwrap();
        clock.advance(Duration::from_secs(100));
        lease.touch().unwrap();

        let modified = fs::metadata(lease.path()).unwrap().modified().unwrap();
        assert!(clock.elapsed_since(modified) < Duration::from_secs(1));
    }

    #[test]
    fn replaced_lock_is_neither_touched_nor_removed() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ExclusiveAccessGuard::new(LockConfig::in_dir(dir.path()));

        let lease = guard.acquire().unwrap();
        let path = lease.path().to_path_buf();
        fs::write(&path, "4242 00000001\n").unwrap();

        assert!(matches!(lease.touch(), Err(LockError::Lost { .. })));
        assert!(matches!(lease.release(), Err(LockError::Lost { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242 00000001\n");
        // No private copy left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn dropped_lease_leaves_a_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ExclusiveAccessGuard::new(LockConfig::in_dir(dir.path()));

        let lease = guard.acquire().unwrap();
        let path = lease.path().to_path_buf();
        fs::remove_file(&path).unwrap();
        fs::write(&path, "4242 00000001\n").unwrap();
        drop(lease);

        assert!(path.exists());
    }

    #[test]
    fn take_if_puts_back_what_it_does_not_want() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);
        let private = dir.path().join("private");
        fs::write(&path, "4242 00000001\n").unwrap();
        let before = fs::metadata(&path).unwrap().modified().unwrap();

        let taken = take_if(&path, &private, |moved| moved.holder.as_deref() == Some("1 1")).unwrap();
        assert_eq!(taken, Taken::Foreign);
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242 00000001\n");
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
        assert!(!private.exists());

        let taken = take_if(&path, &private, |moved| moved.holder.as_deref() == Some("4242 00000001")).unwrap();
        assert_eq!(taken, Taken::Removed);
        assert!(!path.exists());
        assert_eq!(take_if(&path, &private, |_| true).unwrap(), Taken::Gone);
    }

    #[test]
    fn renewed_lock_survives_a_stale_takeover() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig::in_dir(dir.path());
        fs::write(&config.path, "4242 00000001\n").unwrap();
        let guard = ExclusiveAccessGuard::new(config.clone());

        // Seen as stale, then touched by its holder before the takeover ran
        let mut observed = LockSnapshot::read(&config.path).unwrap();
        observed.modified -= Duration::from_secs(600);
        guard.remove_stale(&observed).unwrap();

        assert_eq!(fs::read_to_string(&config.path).unwrap(), "4242 00000001\n");
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ExclusiveAccessGuard::new(LockConfig::new(dir.path().join("missing").join(LOCK_FILE_NAME)));
        assert!(matches!(guard.acquire(), Err(LockError::Io { .. })));
    }
}
