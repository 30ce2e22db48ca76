// Reader-side walk over committed frames of a term (availability scan and frame iteration).
use crate::core::atomic_buffer::AtomicBuffer;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, FrameHeader, HEADER_LENGTH};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanOutcome {
    /// Bytes of contiguous committed frames, counting a trailing padding frame as its header only.
    pub available: usize,
    /// Payload bytes of that trailing padding frame, which a sender would skip.
    pub padding: usize,
}

/// Scans forward from `offset` for committed frames, stopping at the first uncommitted slot, at
/// `max_length`, or at the end of the term.
pub fn scan_for_availability(term: &AtomicBuffer, offset: usize, max_length: usize) -> ScanOutcome {
    let max_length = max_length.min(term.capacity().saturating_sub(offset));
    let mut available = 0usize;
    let mut padding = 0usize;

    while available + padding < max_length {
        let frame_offset = offset + available;
        let frame_length = frame::frame_length_volatile(term, frame_offset);
        if frame_length <= 0 {
            break;
        }

        let mut aligned_length = frame::align_frame_length(frame_length as usize);
        if frame::is_padding_frame(term, frame_offset) {
            padding = aligned_length - HEADER_LENGTH;
            aligned_length = HEADER_LENGTH;
        }

        available += aligned_length;
        if available > max_length {
            available -= aligned_length;
            padding = 0;
            break;
        }
    }

    ScanOutcome { available, padding }
}

/// Iterates committed frames of a term from `offset`, yielding `(offset, header)`.
///
/// Stops at the first uncommitted slot or the end of the term; a header that fails validation is
/// reported once as an error and ends iteration. With `with_term_id`, a frame stamped with any
/// other term id also ends iteration: it is left over from the term that last used the
/// partition.
pub struct FrameIter<'a> {
    term: &'a AtomicBuffer,
    offset: usize,
    term_id: Option<i32>,
    done: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(term: &'a AtomicBuffer, offset: usize) -> Self {
        Self {
            term,
            offset,
            term_id: None,
            done: false,
        }
    }

    /// Only yields frames of `term_id`, normally the term id held in the partition's tail.
    pub fn with_term_id(mut self, term_id: i32) -> Self {
        self.term_id = Some(term_id);
        self
    }

    /// Offset the next call to `next` will read.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Result<(usize, FrameHeader), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset + HEADER_LENGTH > self.term.capacity() {
            return None;
        }
        let offset = self.offset;
        let header = match FrameHeader::read_committed(self.term, offset) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(err) => {
                self.done = true;
                return Some(Err(err.with_offset(offset as u64)));
            }
        };
        if self.term_id.is_some_and(|term_id| term_id != header.term_id) {
            self.done = true;
            return None;
        }
        if let Err(err) = header.validate(self.term.capacity()) {
            self.done = true;
            return Some(Err(err));
        }
        if header.term_offset as usize != offset {
            self.done = true;
            return Some(Err(Error::new(ErrorKind::Corrupt)
                .with_message("frame term offset does not match its position")
                .with_offset(offset as u64)));
        }
        self.offset += frame::align_frame_length(header.frame_length as usize);
        Some(Ok((offset, header)))
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameIter, ScanOutcome, scan_for_availability};
    use crate::core::appender::{AppendOutcome, TermAppender};
    use crate::core::config::LogConfig;
    use crate::core::descriptor::{TERM_MIN_LENGTH, TERM_TAIL_COUNTER_OFFSET, pack_tail};
    use crate::core::error::ErrorKind;
    use crate::core::frame::{HEADER_LENGTH, HeaderWriter};
    use crate::core::log_buffers::LogBuffers;

    fn setup() -> (LogBuffers, TermAppender, HeaderWriter) {
        let config = LogConfig::new(TERM_MIN_LENGTH, 4096)
            .with_initial_term_id(0)
            .with_session_id(1);
        let log = LogBuffers::in_memory(&config).expect("log");
        let appender = TermAppender::new(log.term_buffer(0), log.term_meta_buffer(0));
        (log, appender, HeaderWriter::new(1, 1))
    }

    #[test]
    fn empty_term_has_nothing_available() {
        let (log, _, _) = setup();
        let outcome = scan_for_availability(&log.term_buffer(0), 0, TERM_MIN_LENGTH);
        assert_eq!(outcome, ScanOutcome::default());
    }

    #[test]
    fn scan_stops_at_uncommitted_claim() {
        let (log, appender, header) = setup();
        appender.append_unfragmented(&header, &[0u8; 64]);
        appender.claim(&header, 64);
        appender.append_unfragmented(&header, &[0u8; 64]);

        let outcome = scan_for_availability(&log.term_buffer(0), 0, TERM_MIN_LENGTH);
        assert_eq!(outcome.available, 96);
        assert_eq!(outcome.padding, 0);
    }

    #[test]
    fn scan_respects_max_length() {
        let (log, appender, header) = setup();
        for _ in 0..4 {
            appender.append_unfragmented(&header, &[0u8; 64]);
        }
        let outcome = scan_for_availability(&log.term_buffer(0), 0, 250);
        assert_eq!(outcome.available, 192);
    }

    #[test]
    fn trailing_padding_is_reported_separately() {
        let (log, appender, header) = setup();
        log.term_meta_buffer(0).put_i64_ordered(
            TERM_TAIL_COUNTER_OFFSET,
            pack_tail(0, TERM_MIN_LENGTH as i32 - 256),
        );
        appender.append_unfragmented(&header, &[0u8; 64]);
        let outcome = appender.append_unfragmented(&header, &[0u8; 200]);
        assert_eq!(outcome, AppendOutcome::Tripped { term_id: 0 });

        let outcome = scan_for_availability(
            &log.term_buffer(0),
            TERM_MIN_LENGTH - 256,
            TERM_MIN_LENGTH,
        );
        assert_eq!(outcome.available, 96 + HEADER_LENGTH);
        assert_eq!(outcome.padding, 160 - HEADER_LENGTH);
    }

    #[test]
    fn iterates_committed_frames_in_order() {
        let (log, appender, header) = setup();
        for len in [1usize, 31, 32, 100] {
            appender.append_unfragmented(&header, &vec![7u8; len]);
        }
        let term = log.term_buffer(0);
        let frames: Vec<_> = FrameIter::new(&term, 0)
            .collect::<Result<Vec<_>, _>>()
            .expect("frames");
        let summary: Vec<(usize, usize)> = frames
            .iter()
            .map(|(offset, header)| (*offset, header.payload_length()))
            .collect();
        assert_eq!(summary, vec![(0, 1), (64, 31), (128, 32), (192, 100)]);
    }

    #[test]
    fn iteration_stops_at_frames_of_an_earlier_term() {
        let (log, appender, header) = setup();
        for _ in 0..3 {
            appender.append_unfragmented(&header, &[1u8; 64]);
        }
        // Partition reused for term 3 without cleaning: one new frame over the old ones.
        let meta = log.term_meta_buffer(0);
        meta.put_i64_ordered(TERM_TAIL_COUNTER_OFFSET, pack_tail(3, 0));
        appender.append_unfragmented(&header, &[2u8; 64]);

        let term = log.term_buffer(0);
        assert_eq!(FrameIter::new(&term, 0).count(), 3);
        let frames: Vec<_> = FrameIter::new(&term, 0)
            .with_term_id(3)
            .collect::<Result<Vec<_>, _>>()
            .expect("frames");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1.term_id, 3);
    }

    #[test]
    fn iteration_reports_misplaced_frame() {
        let (log, appender, header) = setup();
        appender.append_unfragmented(&header, &[0u8; 8]);
        let term = log.term_buffer(0);
        term.put_i32(crate::core::frame::TERM_OFFSET_FIELD_OFFSET, 4096);

        let mut iter = FrameIter::new(&term, 0);
        let err = iter.next().expect("item").expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(iter.next().is_none());
    }
}
