//! Named shared-memory segments.
//!
//! A segment is a file-backed `MAP_SHARED` mapping that a peer process can
//! find by `(name, owner pid)`. The backing file lives at
//! `<namespace dir>/pktio-<owner pid>-<name>`, so two processes may export
//! objects with the same name without colliding, and an importer must know
//! which process it is attaching to.
//!
//! Only the creator removes an object (see [`ShmSegment::unlink`]). Dropping
//! a segment handle releases the local mapping and nothing else.

use crate::error::{ShmError, ShmResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

/// Maximum length of a shared object name in bytes
pub const SHM_NAME_LEN: usize = 32;

const FILE_PREFIX: &str = "pktio";

/// Directory in which shared objects are published.
///
/// Peer processes must agree on the namespace to find each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNamespace {
    dir: Arc<PathBuf>,
}

impl ShmNamespace {
    /// Namespace rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    /// System namespace: `/dev/shm` when available, otherwise the temp dir
    pub fn system() -> Self {
        let dev_shm = Path::new("/dev/shm");
        if dev_shm.is_dir() {
            Self::new(dev_shm)
        } else {
            Self::new(std::env::temp_dir())
        }
    }

    /// Directory holding the objects
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the object `name` exported by `pid`
    pub fn object_path(&self, name: &str, pid: u32) -> PathBuf {
        let name: String = name
            .chars()
            .map(|c| if c == '/' { '_' } else { c })
            .collect();
        self.dir.join(format!("{FILE_PREFIX}-{pid}-{name}"))
    }
}

impl Default for ShmNamespace {
    fn default() -> Self {
        Self::system()
    }
}

/// Id of the calling process, as used in object paths
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Reject names that do not fit [`SHM_NAME_LEN`]
pub fn check_name(name: &str) -> ShmResult<()> {
    if name.is_empty() {
        return Err(ShmError::InvalidConfig(
            "shared object name is empty".into(),
        ));
    }
    if name.len() > SHM_NAME_LEN {
        return Err(ShmError::NameTooLong {
            name: name.to_string(),
            max: SHM_NAME_LEN,
        });
    }
    Ok(())
}

/// A mapped shared-memory object
pub struct ShmSegment {
    /// Base of the local mapping
    ptr: *mut u8,
    /// Mapping length in bytes
    len: usize,
    /// Keeps the descriptor alive for the lifetime of the mapping
    _file: File,
    name: String,
    owner_pid: u32,
    path: PathBuf,
}

impl ShmSegment {
    /// Create and map a new object owned by the calling process.
    ///
    /// Fails with [`ShmError::AlreadyExists`] if this process already
    /// exported an object of that name. The contents start zeroed.
    pub fn reserve(ns: &ShmNamespace, name: &str, size: usize) -> ShmResult<Self> {
        check_name(name)?;
        if size == 0 {
            return Err(ShmError::InvalidConfig(format!(
                "segment {name}: size must be > 0"
            )));
        }

        let pid = current_pid();
        let path = ns.object_path(name, pid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => ShmError::AlreadyExists {
                    name: name.to_string(),
                },
                _ => ShmError::Io(e),
            })?;

        let mapped = file
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .and_then(|()| file.set_len(size as u64))
            .and_then(|()| map_shared(&file, size));
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(ShmError::Io(e));
            }
        };

        tracing::debug!("Reserved shm {} ({} bytes) at {}", name, size, path.display());

        Ok(Self {
            ptr,
            len: size,
            _file: file,
            name: name.to_string(),
            owner_pid: pid,
            path,
        })
    }

    /// Map an object exported by process `pid`.
    pub fn import(ns: &ShmNamespace, name: &str, pid: u32) -> ShmResult<Self> {
        check_name(name)?;
        let path = ns.object_path(name, pid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ShmError::NotFound {
                    name: name.to_string(),
                    pid,
                },
                _ => ShmError::Io(e),
            })?;

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            // Creator has not sized the file yet
            return Err(ShmError::NotFound {
                name: name.to_string(),
                pid,
            });
        }
        let ptr = map_shared(&file, size)?;

        tracing::debug!("Imported shm {} of pid {} ({} bytes)", name, pid, size);

        Ok(Self {
            ptr,
            len: size,
            _file: file,
            name: name.to_string(),
            owner_pid: pid,
            path,
        })
    }

    /// Remove the calling process's object `name`.
    ///
    /// Existing mappings stay valid until dropped. Returns `false` if there
    /// was nothing to remove.
    pub fn unlink(ns: &ShmNamespace, name: &str) -> ShmResult<bool> {
        let path = ns.object_path(name, current_pid());
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Unlinked shm {}", name);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ShmError::Io(e)),
        }
    }

    /// Base address of the local mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapping length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-sized segments are rejected at creation
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process that exported the object
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("owner_pid", &self.owner_pid)
            .field("len", &self.len)
            .finish()
    }
}

fn map_shared(file: &File, size: usize) -> io::Result<*mut u8> {
    // SAFETY: mmap with a valid descriptor and a non-zero length. MAP_FAILED
    // is checked before the pointer is used.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    Ok(ptr as *mut u8)
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: unmapping the region obtained from mmap with its original size
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping is valid for the lifetime of the segment. Concurrent
// access to its contents is coordinated by the structures placed inside it
// (atomics for ring counters and handshake flags).
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}
