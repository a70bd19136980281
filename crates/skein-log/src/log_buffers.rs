//! The mapped log: three term partitions plus the metadata page.
//!
//! A log is created once (driver side) and attached by producers and
//! consumers. Creation writes the metadata page; attach validates it. For
//! in-process use and tests a heap-backed log provides the same layout
//! without a file.

use std::io;
use std::path::Path;

use skein_primitives::{AtomicBuffer, HeapBuffer, MmapRegion};

use crate::descriptor::{
    self, compute_log_length, LogMetaData, LogMetaDataInit, LOG_META_DATA_LENGTH, MTU_MAX_LENGTH,
    MTU_MIN_LENGTH, PAGE_MAX_SIZE, PAGE_MIN_SIZE, PARTITION_COUNT, TERM_MAX_LENGTH,
    TERM_MIN_LENGTH,
};
use crate::frame::FRAME_ALIGNMENT;

/// Parameters for creating a new log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Length of each term partition in bytes (power of two).
    pub term_length: i32,
    /// Page size the log file is sized against.
    pub page_size: i32,
    /// Maximum frame length; payloads above `mtu - header` fragment.
    pub mtu_length: i32,
    /// First term id of the stream.
    pub initial_term_id: i32,
    /// Session the publication writes under.
    pub session_id: i32,
    /// Stream within the channel.
    pub stream_id: i32,
    /// Registration correlation id stamped into the metadata.
    pub correlation_id: i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            term_length: 16 * 1024 * 1024,
            page_size: 4096,
            mtu_length: 1408,
            initial_term_id: 0,
            session_id: 0,
            stream_id: 0,
            correlation_id: 0,
        }
    }
}

impl LogConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.term_length.is_positive() || !(self.term_length as u32).is_power_of_two() {
            return Err("term_length must be a power of two");
        }
        if self.term_length < TERM_MIN_LENGTH || self.term_length > TERM_MAX_LENGTH {
            return Err("term_length must be 64 KiB to 1 GiB");
        }
        if !self.page_size.is_positive() || !(self.page_size as u32).is_power_of_two() {
            return Err("page_size must be a power of two");
        }
        if self.page_size < PAGE_MIN_SIZE || self.page_size > PAGE_MAX_SIZE {
            return Err("page_size must be 4 KiB to 1 GiB");
        }
        if self.mtu_length < MTU_MIN_LENGTH || self.mtu_length > MTU_MAX_LENGTH {
            return Err("mtu_length out of range");
        }
        if self.mtu_length % FRAME_ALIGNMENT != 0 {
            return Err("mtu_length must be a multiple of the frame alignment");
        }
        Ok(())
    }
}

enum Backing {
    Mapped(MmapRegion),
    Heap(HeapBuffer),
}

impl Backing {
    fn buffer(&self) -> AtomicBuffer {
        match self {
            Backing::Mapped(region) => region.buffer(),
            Backing::Heap(heap) => heap.buffer(),
        }
    }
}

/// Errors from attaching to an existing log.
#[derive(Debug)]
pub enum AttachError {
    Io(io::Error),
    BadMetaData(&'static str),
}

impl From<io::Error> for AttachError {
    fn from(e: io::Error) -> Self {
        AttachError::Io(e)
    }
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::Io(e) => write!(f, "I/O error: {e}"),
            AttachError::BadMetaData(msg) => write!(f, "bad log metadata: {msg}"),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttachError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// An open log: the mapping, its term partitions and its metadata page.
pub struct LogBuffers {
    backing: Backing,
    term_length: i32,
}

impl LogBuffers {
    /// Create a new log file at `path` and initialize its metadata page.
    ///
    /// The creating side owns the file; it is removed when this log drops.
    pub fn create(path: &Path, config: &LogConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;

        let length = compute_log_length(config.term_length);
        let region = MmapRegion::create(path, length)?;
        let log = Self {
            backing: Backing::Mapped(region),
            term_length: config.term_length,
        };
        log.init_meta(config);
        Ok(log)
    }

    /// Attach to an existing log file at `path` and validate its metadata.
    pub fn attach(path: &Path) -> Result<Self, AttachError> {
        let region = MmapRegion::attach(path)?;
        let buffer = region.buffer();

        if buffer.capacity() < LOG_META_DATA_LENGTH {
            return Err(AttachError::BadMetaData("file shorter than metadata page"));
        }

        // The metadata page sits after the partitions, so its offset is a
        // function of the term length it declares. Recover the term length
        // from the file size and cross-check against the metadata.
        let term_length = ((buffer.capacity() - LOG_META_DATA_LENGTH) / PARTITION_COUNT) as i32;
        if term_length < TERM_MIN_LENGTH || !(term_length as u32).is_power_of_two() {
            return Err(AttachError::BadMetaData(
                "file size does not fit a power-of-two term length",
            ));
        }
        let meta_offset = PARTITION_COUNT * term_length as usize;
        let meta: &LogMetaData = unsafe { buffer.get_struct(meta_offset) };
        meta.validate().map_err(AttachError::BadMetaData)?;

        if meta.term_length() != term_length {
            return Err(AttachError::BadMetaData(
                "file size does not match declared term length",
            ));
        }

        Ok(Self {
            backing: Backing::Mapped(region),
            term_length,
        })
    }

    /// A heap-backed log with the same layout, for in-process use.
    pub fn anonymous(config: &LogConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let heap = HeapBuffer::new_zeroed(compute_log_length(config.term_length));
        let log = Self {
            backing: Backing::Heap(heap),
            term_length: config.term_length,
        };
        log.init_meta(config);
        Ok(log)
    }

    fn init_meta(&self, config: &LogConfig) {
        let meta: &mut LogMetaData = unsafe {
            self.backing
                .buffer()
                .get_struct_mut(self.meta_offset())
        };
        meta.init(LogMetaDataInit {
            correlation_id: config.correlation_id,
            initial_term_id: config.initial_term_id,
            mtu_length: config.mtu_length,
            term_length: config.term_length,
            page_size: config.page_size,
            session_id: config.session_id,
            stream_id: config.stream_id,
        });
    }

    #[inline]
    fn meta_offset(&self) -> usize {
        PARTITION_COUNT * self.term_length as usize
    }

    /// The metadata page.
    #[inline]
    pub fn meta(&self) -> &LogMetaData {
        unsafe { self.backing.buffer().get_struct(self.meta_offset()) }
    }

    /// One term partition as a buffer window.
    #[inline]
    pub fn term_buffer(&self, index: usize) -> AtomicBuffer {
        assert!(index < PARTITION_COUNT, "partition index out of range");
        self.backing
            .buffer()
            .slice(index * self.term_length as usize, self.term_length as usize)
    }

    /// All three term partitions.
    #[inline]
    pub fn term_buffers(&self) -> [AtomicBuffer; PARTITION_COUNT] {
        [
            self.term_buffer(0),
            self.term_buffer(1),
            self.term_buffer(2),
        ]
    }

    /// Length of each term partition in bytes.
    #[inline]
    pub fn term_length(&self) -> i32 {
        self.term_length
    }

    /// Total mapped length in bytes.
    #[inline]
    pub fn log_length(&self) -> usize {
        descriptor::compute_log_length(self.term_length)
    }

    /// Path of the backing file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Mapped(region) => Some(region.path()),
            Backing::Heap(_) => None,
        }
    }
}
