// Log creation/mapping: file-backed or anonymous memory carved into terms and metadata.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use fs2::FileExt;
use memmap2::MmapMut;

use crate::core::atomic_buffer::AtomicBuffer;
use crate::core::config::LogConfig;
use crate::core::descriptor::{
    self, LOG_META_DATA_LENGTH, LogMetadata, PARTITION_COUNT, TERM_META_DATA_LENGTH,
    TERM_STATUS_OFFSET, TERM_TAIL_COUNTER_OFFSET, TermStatus,
};
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::frame::{FrameHeader, HEADER_LENGTH};

/// Owner of a mapped log. Shared by `Arc` between a publication and any other view of the same
/// log; the mapping is released when the last holder drops it.
pub struct LogBuffers {
    path: Option<PathBuf>,
    _file: Option<File>,
    mmap: MmapMut,
    base: NonNull<u8>,
    term_length: usize,
}

// All access to the mapping goes through `AtomicBuffer` views; see its contract.
unsafe impl Send for LogBuffers {}
unsafe impl Sync for LogBuffers {}

impl LogBuffers {
    /// Creates and initialises a log file. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, config: &LogConfig) -> Result<Self, Error> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let log_length = descriptor::compute_log_length(config.term_length);

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        file.allocate(log_length as u64)
            .map_err(|err| io_error(&path, err))?;
        file.set_len(log_length as u64)
            .map_err(|err| io_error(&path, err))?;

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|err| io_error(&path, err))? };
        let buffers = Self::from_mmap(mmap, Some(path), Some(file), config.term_length)?;
        buffers.initialize(config)?;
        buffers.flush()?;
        tracing::info!(
            path = ?buffers.path,
            term_length = config.term_length,
            mtu_length = config.mtu_length,
            "created log"
        );
        Ok(buffers)
    }

    /// Maps a log some other party already created and initialised.
    pub fn map_existing(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        let log_length = file
            .metadata()
            .map(|meta| meta.len() as usize)
            .map_err(|err| io_error(&path, err))?;

        let term_length = descriptor::compute_term_length(log_length);
        descriptor::check_term_length(term_length).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message(format!("log length {log_length} does not describe a valid log"))
                .with_path(&path)
                .with_source(err)
        })?;
        if descriptor::compute_log_length(term_length) != log_length {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("log length is not three terms plus metadata")
                .with_path(&path));
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|err| io_error(&path, err))? };
        let buffers = Self::from_mmap(mmap, Some(path), Some(file), term_length)?;
        buffers.validate_metadata()?;
        tracing::debug!(path = ?buffers.path, term_length, "mapped log");
        Ok(buffers)
    }

    /// Anonymous, process-private log; no driver can see it.
    pub fn in_memory(config: &LogConfig) -> Result<Self, Error> {
        config.validate()?;
        let log_length = descriptor::compute_log_length(config.term_length);
        let mmap = MmapMut::map_anon(log_length).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to map anonymous log")
                .with_source(err)
        })?;
        let buffers = Self::from_mmap(mmap, None, None, config.term_length)?;
        buffers.initialize(config)?;
        Ok(buffers)
    }

    fn from_mmap(
        mut mmap: MmapMut,
        path: Option<PathBuf>,
        file: Option<File>,
        term_length: usize,
    ) -> Result<Self, Error> {
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("mapping returned a null pointer")
        })?;
        Ok(Self {
            path,
            _file: file,
            mmap,
            base,
            term_length,
        })
    }

    fn initialize(&self, config: &LogConfig) -> Result<(), Error> {
        let (initial_term_id, session_id) = config.resolve_ids()?;
        let template = FrameHeader::data(0, 0, session_id, config.stream_id, 0).encode();
        self.log_metadata().initialize(
            config.registration_id,
            initial_term_id,
            config.mtu_length as i32,
            config.term_length as i32,
            &template,
        );

        // Partitions 1 and 2 start out holding the terms "before" the initial one so that every
        // tail's term id only ever moves forward.
        for index in 0..PARTITION_COUNT {
            let term_id = if index == 0 {
                initial_term_id
            } else {
                initial_term_id.wrapping_add(index as i32 - PARTITION_COUNT as i32)
            };
            let meta = self.term_meta_buffer(index);
            meta.put_i32_ordered(TERM_STATUS_OFFSET, TermStatus::Clean as i32);
            meta.put_i64_ordered(TERM_TAIL_COUNTER_OFFSET, descriptor::pack_tail(term_id, 0));
        }
        Ok(())
    }

    fn validate_metadata(&self) -> Result<(), Error> {
        let metadata = self.log_metadata();
        let corrupt = |message: String| {
            let err = Error::new(ErrorKind::Corrupt).with_message(message);
            match &self.path {
                Some(path) => err.with_path(path),
                None => err,
            }
        };
        if metadata.term_length() as usize != self.term_length {
            return Err(corrupt(format!(
                "stored term length {} does not match file layout {}",
                metadata.term_length(),
                self.term_length
            )));
        }
        if metadata.default_frame_header_length() as usize != HEADER_LENGTH {
            return Err(corrupt(format!(
                "unexpected default header length {}",
                metadata.default_frame_header_length()
            )));
        }
        let mtu_length = metadata.mtu_length();
        if mtu_length <= 0 {
            return Err(corrupt(format!("invalid mtu length {mtu_length}")));
        }
        descriptor::check_mtu_length(mtu_length as usize, self.term_length)
            .map_err(|err| corrupt(format!("invalid mtu length {mtu_length}")).with_source(err))?;
        FrameHeader::decode(&metadata.default_frame_header())
            .map_err(|err| corrupt("invalid default frame header".to_string()).with_source(err))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn log_length(&self) -> usize {
        self.mmap.len()
    }

    pub fn term_buffer(&self, index: usize) -> AtomicBuffer {
        assert!(index < PARTITION_COUNT, "partition index out of range: {index}");
        self.region(
            descriptor::term_offset_in_log(index, self.term_length),
            self.term_length,
        )
    }

    pub fn term_meta_buffer(&self, index: usize) -> AtomicBuffer {
        assert!(index < PARTITION_COUNT, "partition index out of range: {index}");
        self.region(
            descriptor::term_meta_data_offset_in_log(index, self.term_length),
            TERM_META_DATA_LENGTH,
        )
    }

    pub fn log_meta_buffer(&self) -> AtomicBuffer {
        self.region(
            descriptor::log_meta_data_offset_in_log(self.term_length),
            LOG_META_DATA_LENGTH,
        )
    }

    pub fn log_metadata(&self) -> LogMetadata {
        LogMetadata::new(self.log_meta_buffer())
    }

    pub fn raw_tail_volatile(&self, index: usize) -> i64 {
        self.term_meta_buffer(index)
            .get_i64_volatile(TERM_TAIL_COUNTER_OFFSET)
    }

    pub fn term_status(&self, index: usize) -> Result<TermStatus, Error> {
        TermStatus::from_i32(self.term_meta_buffer(index).get_i32_volatile(TERM_STATUS_OFFSET))
    }

    /// Driver duty: zero a retired partition so stale frame lengths cannot be mistaken for
    /// committed frames once it is reused.
    pub fn clean_partition(&self, index: usize) {
        let term = self.term_buffer(index);
        term.set_memory(0, term.capacity(), 0);
        self.term_meta_buffer(index)
            .put_i32_ordered(TERM_STATUS_OFFSET, TermStatus::Clean as i32);
        tracing::debug!(partition = index, "cleaned partition");
    }

    pub fn flush(&self) -> Result<(), Error> {
        if self.path.is_none() {
            return Ok(());
        }
        self.mmap.flush().map_err(|err| {
            let err = Error::new(ErrorKind::Io).with_source(err);
            match &self.path {
                Some(path) => err.with_path(path),
                None => err,
            }
        })
    }

    fn region(&self, offset: usize, length: usize) -> AtomicBuffer {
        assert!(offset + length <= self.mmap.len());
        // SAFETY: the region lies inside the mapping, which lives as long as `self`; mapped memory
        // is page aligned and every region offset is a multiple of 8.
        unsafe {
            AtomicBuffer::wrap(
                NonNull::new_unchecked(self.base.as_ptr().add(offset)),
                length,
            )
        }
    }
}

impl std::fmt::Debug for LogBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffers")
            .field("path", &self.path)
            .field("term_length", &self.term_length)
            .field("log_length", &self.mmap.len())
            .finish()
    }
}
