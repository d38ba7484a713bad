//! Incremental merge of overlapping chunk decodes into an ordered,
//! de-duplicated transcript.
//!
//! Inference runs over overlapping windows, so the same stretch of speech is
//! usually decoded more than once; a later, wider window often decodes a
//! boundary-spanning utterance more completely than an earlier partial one.
//! The accumulator reconciles these by replacing a slot only when the new
//! decode is strictly longer, so the total decoded text for a time slot
//! never shrinks.

use echoscribe_proto::Segment;

/// Boundary tolerance when matching a new chunk against an accumulated
/// segment. Timestamps are whole seconds, so with tolerance 1 "within
/// tolerance" means the same rounded second.
pub const MERGE_TOLERANCE_SECS: u32 = 1;

/// One decoded window before merging. `end` may be absent when the decoder
/// did not produce an end boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub text: String,
    pub start: u32,
    pub end: Option<u32>,
    pub speaker: Option<u32>,
}

impl RawChunk {
    pub fn new(text: impl Into<String>, start: u32, end: Option<u32>) -> Self {
        Self {
            text: text.into(),
            start,
            end,
            speaker: None,
        }
    }
}

/// Ordered, de-duplicated segment sequence for one job.
#[derive(Debug)]
pub struct ResultAccumulator {
    stride_secs: u32,
    segments: Vec<Segment>,
}

impl ResultAccumulator {
    pub fn new(stride_secs: u32) -> Self {
        Self {
            stride_secs,
            segments: Vec::new(),
        }
    }

    /// Merge one decoded chunk. Empty or whitespace-only text is dropped.
    ///
    /// The sequence is re-sorted by `start` and re-indexed after every
    /// insertion, so `segments()` is always a valid transcript.
    pub fn merge(&mut self, chunk: RawChunk) {
        let text = chunk.text.trim();
        if text.is_empty() {
            return;
        }

        let start = chunk.start;
        let end = self.resolve_end(start, chunk.end);

        let slot = self.segments.iter().position(|existing| {
            existing.start.abs_diff(start) < MERGE_TOLERANCE_SECS
                && existing.end.abs_diff(end) < MERGE_TOLERANCE_SECS
        });

        match slot {
            Some(i) => {
                // Same time slot decoded again; keep whichever text is more
                // complete.
                if text.len() > self.segments[i].text.len() {
                    self.segments[i].text = text.to_string();
                    self.segments[i].start = start;
                    self.segments[i].end = end;
                    self.segments[i].speaker = chunk.speaker;
                }
            }
            None => self.segments.push(Segment {
                index: self.segments.len(),
                text: text.to_string(),
                start,
                end,
                speaker: chunk.speaker,
            }),
        }

        self.segments.sort_by_key(|s| s.start);
        for (i, segment) in self.segments.iter_mut().enumerate() {
            segment.index = i;
        }
    }

    /// Missing or zero end boundaries are synthesized as
    /// `start + round(0.9 * stride)`.
    fn resolve_end(&self, start: u32, end: Option<u32>) -> u32 {
        match end {
            Some(e) if e > 0 => e.max(start),
            _ => start + (0.9 * self.stride_secs as f32).round() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// End timestamp of the last accumulated segment, for the
    /// `completedUntilTimestamp` field of `RESULT` events.
    pub fn last_timestamp(&self) -> u32 {
        match self.segments.last() {
            Some(s) if s.end > 0 => s.end,
            Some(s) => s.start,
            None => 0,
        }
    }
}

#[cfg(test)]
#[path = "accumulator_test.rs"]
mod tests;
