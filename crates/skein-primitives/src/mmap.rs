//! File-backed memory-mapped regions shared across processes.
//!
//! A log file is created once by the driver and attached by every producer
//! and consumer that needs it, all mapping with `MAP_SHARED` so stores are
//! visible across the process boundary.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::buffer::AtomicBuffer;

/// File-backed memory-mapped region.
pub struct MmapRegion {
    /// Pointer to the mapped memory.
    ptr: *mut u8,
    /// Length of the mapping in bytes.
    len: usize,
    /// The underlying file, kept open to maintain the mapping.
    #[allow(dead_code)]
    file: File,
    /// Path to the file.
    path: PathBuf,
    /// Whether this region owns the file and deletes it on drop.
    owns_file: bool,
}

impl MmapRegion {
    /// Create the backing file, size it, and map it with `MAP_SHARED`.
    ///
    /// The file is created with permissions 0600. The created region owns
    /// the file and removes it on drop; failure to map removes the partial
    /// file before returning.
    pub fn create(path: &Path, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let setup = (|| {
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            file.set_len(size as u64)?;
            map_shared(&file, size)
        })();

        match setup {
            Ok(ptr) => Ok(Self {
                ptr,
                len: size,
                file,
                path: path.to_path_buf(),
                owns_file: true,
            }),
            Err(e) => {
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }

    /// Map an existing file with `MAP_SHARED`. The file size determines the
    /// mapping size. Attached regions never delete the file.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log file is empty",
            ));
        }

        let ptr = map_shared(&file, size)?;

        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: false,
        })
    }

    /// An [`AtomicBuffer`] view over the whole mapping.
    #[inline]
    pub fn buffer(&self) -> AtomicBuffer {
        // SAFETY: the mapping is valid for the lifetime of this region.
        unsafe { AtomicBuffer::from_raw(self.ptr, self.len) }
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is zero bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path to the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// After this call the file is deleted when this region drops.
    pub fn take_ownership(&mut self) {
        self.owns_file = true;
    }

    /// After this call the file survives this region dropping.
    pub fn release_ownership(&mut self) {
        self.owns_file = false;
    }
}

fn map_shared(file: &File, size: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
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

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }

        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// SAFETY: the mapping stays valid for the region's lifetime and the shared
// memory behind it is only mutated through atomic protocols.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}
