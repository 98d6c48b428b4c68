//! Stream demultiplexer.
//!
//! The model answers for every policy of a session in one stream. Each
//! policy's region starts with a marker:
//!
//! ```text
//! <<<POLICY:content_safety>>>
//! ### Problem
//! ...
//! <<<POLICY:privacy>>>
//! ### Problem
//! ...
//! ```
//!
//! The demultiplexer works on raw bytes so chunks may split anywhere, including
//! inside a marker or inside a multi-byte character. A trailing partial marker
//! candidate is held back until the next chunk decides it; every other byte is
//! binned verbatim into the current policy's buffer. Markers themselves are
//! never part of any buffer.

use std::collections::HashSet;

/// Opening bytes of a policy marker.
pub const MARKER_OPEN: &[u8] = b"<<<POLICY:";

/// Closing bytes of a policy marker.
pub const MARKER_CLOSE: &[u8] = b">>>";

/// Longest policy id a marker may carry.
pub const MAX_POLICY_ID_LEN: usize = 64;

/// Render the marker that opens `policy_id`'s region.
pub fn policy_marker(policy_id: &str) -> String {
    format!(
        "{}{}{}",
        String::from_utf8_lossy(MARKER_OPEN),
        policy_id,
        String::from_utf8_lossy(MARKER_CLOSE)
    )
}

/// What happened while consuming input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// First region for a policy id.
    Opened {
        policy_id: String,
        unknown_policy: bool,
    },
    /// A later region for an id whose buffer already exists.
    Reopened { policy_id: String },
    /// Bytes appended to a policy's buffer, in stream order.
    Data { policy_id: String, bytes: Vec<u8> },
    /// The policy's sub-stream is complete (for now).
    Closed { policy_id: String },
}

/// Append-only buffer for one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubStream {
    pub policy_id: String,
    pub unknown_policy: bool,
    pub buffer: Vec<u8>,
    pub complete: bool,
    /// Number of marker regions seen for this id.
    pub regions: usize,
}

impl SubStream {
    /// Buffer contents as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

enum MarkerScan {
    Complete { policy_id: String, len: usize },
    NeedMore,
    NotAMarker,
}

/// Splits one interleaved stream into per-policy sub-streams.
#[derive(Debug)]
pub struct StreamDemultiplexer {
    known: HashSet<String>,
    pending: Vec<u8>,
    cursor: Option<usize>,
    streams: Vec<SubStream>,
    preamble: Vec<u8>,
    finished: bool,
}

impl StreamDemultiplexer {
    /// Create a demultiplexer. Ids outside `known_policies` are still
    /// collected but flagged `unknown_policy`.
    pub fn new<I, S>(known_policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known_policies.into_iter().map(Into::into).collect(),
            pending: Vec::new(),
            cursor: None,
            streams: Vec::new(),
            preamble: Vec::new(),
            finished: false,
        }
    }

    /// Consume one chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DemuxEvent> {
        let mut events = Vec::new();
        if self.finished {
            tracing::warn!(bytes = chunk.len(), "Chunk pushed after end of stream, ignored");
            return events;
        }

        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);

        let consumed = self.scan(&data, &mut events);
        self.pending = data[consumed..].to_vec();

        events
    }

    /// Signal end-of-stream. Flushes any held-back bytes as text and marks
    /// every sub-stream complete.
    pub fn finish(&mut self) -> Vec<DemuxEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let pending = std::mem::take(&mut self.pending);
        self.emit(&pending, &mut events);

        for stream in &mut self.streams {
            if !stream.complete {
                stream.complete = true;
                events.push(DemuxEvent::Closed {
                    policy_id: stream.policy_id.clone(),
                });
            }
        }

        self.cursor = None;
        self.finished = true;
        events
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sub-streams in order of first appearance.
    pub fn sub_streams(&self) -> &[SubStream] {
        &self.streams
    }

    pub fn sub_stream(&self, policy_id: &str) -> Option<&SubStream> {
        self.streams.iter().find(|s| s.policy_id == policy_id)
    }

    /// Text seen before the first marker.
    pub fn preamble(&self) -> &[u8] {
        &self.preamble
    }

    pub fn into_sub_streams(self) -> Vec<SubStream> {
        self.streams
    }

    /// Scan `data`, returning how many bytes were consumed. The rest is a
    /// partial marker candidate.
    fn scan(&mut self, data: &[u8], events: &mut Vec<DemuxEvent>) -> usize {
        let mut pos = 0;

        loop {
            let Some(offset) = find(&data[pos..], MARKER_OPEN) else {
                let end = data.len() - partial_open_suffix(&data[pos..]);
                self.emit(&data[pos..end], events);
                return end;
            };

            let start = pos + offset;
            self.emit(&data[pos..start], events);

            match parse_marker(&data[start..]) {
                MarkerScan::Complete { policy_id, len } => {
                    self.switch_to(policy_id, events);
                    pos = start + len;
                }
                MarkerScan::NeedMore => return start,
                MarkerScan::NotAMarker => {
                    self.emit(&data[start..start + 1], events);
                    pos = start + 1;
                }
            }
        }
    }

    fn emit(&mut self, bytes: &[u8], events: &mut Vec<DemuxEvent>) {
        if bytes.is_empty() {
            return;
        }

        let Some(index) = self.cursor else {
            self.preamble.extend_from_slice(bytes);
            return;
        };

        let stream = &mut self.streams[index];
        stream.buffer.extend_from_slice(bytes);

        match events.last_mut() {
            Some(DemuxEvent::Data { policy_id, bytes: pending }) if *policy_id == stream.policy_id => {
                pending.extend_from_slice(bytes);
            }
            _ => events.push(DemuxEvent::Data {
                policy_id: stream.policy_id.clone(),
                bytes: bytes.to_vec(),
            }),
        }
    }

    fn switch_to(&mut self, policy_id: String, events: &mut Vec<DemuxEvent>) {
        if let Some(index) = self.cursor {
            let current = &mut self.streams[index];
            if current.policy_id == policy_id {
                // Repeated marker for the active region.
                return;
            }
            current.complete = true;
            events.push(DemuxEvent::Closed {
                policy_id: current.policy_id.clone(),
            });
        }

        if let Some(index) = self.streams.iter().position(|s| s.policy_id == policy_id) {
            let stream = &mut self.streams[index];
            stream.complete = false;
            stream.regions += 1;
            tracing::debug!(policy = %policy_id, regions = stream.regions, "Policy region reopened");
            events.push(DemuxEvent::Reopened { policy_id });
            self.cursor = Some(index);
            return;
        }

        let unknown_policy = !self.known.contains(&policy_id);
        if unknown_policy {
            tracing::warn!(policy = %policy_id, "Stream names a policy outside the session's set");
        }

        self.streams.push(SubStream {
            policy_id: policy_id.clone(),
            unknown_policy,
            buffer: Vec::new(),
            complete: false,
            regions: 1,
        });
        self.cursor = Some(self.streams.len() - 1);
        events.push(DemuxEvent::Opened {
            policy_id,
            unknown_policy,
        });
    }
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `data` that is a proper prefix of
/// [`MARKER_OPEN`].
fn partial_open_suffix(data: &[u8]) -> usize {
    (1..MARKER_OPEN.len())
        .rev()
        .find(|&k| data.ends_with(&MARKER_OPEN[..k]))
        .unwrap_or(0)
}

/// Classify bytes that start with [`MARKER_OPEN`].
fn parse_marker(data: &[u8]) -> MarkerScan {
    let rest = &data[MARKER_OPEN.len()..];
    let id_len = rest.iter().take_while(|b| is_id_byte(**b)).count();
    if id_len > MAX_POLICY_ID_LEN {
        return MarkerScan::NotAMarker;
    }

    let after = &rest[id_len..];
    if after.is_empty() {
        return MarkerScan::NeedMore;
    }
    if id_len == 0 {
        return MarkerScan::NotAMarker;
    }

    if after.len() < MARKER_CLOSE.len() {
        return if MARKER_CLOSE.starts_with(after) {
            MarkerScan::NeedMore
        } else {
            MarkerScan::NotAMarker
        };
    }

    if after.starts_with(MARKER_CLOSE) {
        MarkerScan::Complete {
            policy_id: String::from_utf8_lossy(&rest[..id_len]).into_owned(),
            len: MARKER_OPEN.len() + id_len + MARKER_CLOSE.len(),
        }
    } else {
        MarkerScan::NotAMarker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn demux_all(known: &[&str], chunks: &[&[u8]]) -> StreamDemultiplexer {
        let mut demux = StreamDemultiplexer::new(known.iter().copied());
        for chunk in chunks {
            demux.push(chunk);
        }
        demux.finish();
        demux
    }

    #[test]
    fn test_single_chunk_two_policies() {
        let text = b"<<<POLICY:P1>>>alpha\n<<<POLICY:P2>>>beta\n";
        let demux = demux_all(&["P1", "P2"], &[text]);

        assert_eq!(demux.sub_streams().len(), 2);
        assert_eq!(demux.sub_stream("P1").unwrap().buffer, b"alpha\n");
        assert_eq!(demux.sub_stream("P2").unwrap().buffer, b"beta\n");
        assert!(demux.sub_streams().iter().all(|s| s.complete));
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let demux = demux_all(
            &["P1", "P2"],
            &[b"<<<POL", b"ICY:P1>", b">>one<<", b"<POLICY:P", b"2>>", b">two"],
        );

        assert_eq!(demux.sub_stream("P1").unwrap().buffer, b"one");
        assert_eq!(demux.sub_stream("P2").unwrap().buffer, b"two");
    }

    #[test]
    fn test_switch_only_after_marker_is_unambiguous() {
        let mut demux = StreamDemultiplexer::new(["P1", "P2"]);
        demux.push(b"<<<POLICY:P1>>>text");

        let events = demux.push(b"<<<POLICY:P2");
        assert!(events.is_empty(), "no switch before the closing bytes");
        assert!(!demux.sub_stream("P1").unwrap().complete);

        let events = demux.push(b">>>");
        assert_eq!(
            events,
            vec![
                DemuxEvent::Closed { policy_id: "P1".to_string() },
                DemuxEvent::Opened { policy_id: "P2".to_string(), unknown_policy: false },
            ]
        );
        assert!(demux.sub_stream("P1").unwrap().complete);
    }

    #[test]
    fn test_near_miss_marker_is_text() {
        let demux = demux_all(&["P1"], &[b"<<<POLICY:P1>>>a <<<POLICY:bad id>>> b <<<POLICY:>>> c"]);
        assert_eq!(
            demux.sub_stream("P1").unwrap().buffer,
            b"a <<<POLICY:bad id>>> b <<<POLICY:>>> c"
        );
        assert_eq!(demux.sub_streams().len(), 1);
    }

    #[test]
    fn test_overlong_id_is_text() {
        let long_id = "x".repeat(MAX_POLICY_ID_LEN + 1);
        let text = format!("<<<POLICY:P1>>>a<<<POLICY:{}>>>b", long_id);
        let demux = demux_all(&["P1"], &[text.as_bytes()]);
        assert_eq!(demux.sub_streams().len(), 1);
        assert_eq!(
            demux.sub_stream("P1").unwrap().text(),
            format!("a<<<POLICY:{}>>>b", long_id)
        );
    }

    #[test]
    fn test_trailing_partial_marker_flushed_as_text() {
        let demux = demux_all(&["P1"], &[b"<<<POLICY:P1>>>tail <<<POLICY:P"]);
        assert_eq!(demux.sub_stream("P1").unwrap().buffer, b"tail <<<POLICY:P");
    }

    #[test]
    fn test_unknown_policy_flagged_but_collected() {
        let demux = demux_all(&["P1"], &[b"<<<POLICY:P1>>>a<<<POLICY:ZZ>>>b"]);
        let unknown = demux.sub_stream("ZZ").unwrap();
        assert!(unknown.unknown_policy);
        assert_eq!(unknown.buffer, b"b");
        assert!(!demux.sub_stream("P1").unwrap().unknown_policy);
    }

    #[test]
    fn test_preamble_routed_nowhere() {
        let demux = demux_all(&["P1"], &[b"Sure, here are the results.\n<<<POLICY:P1>>>x"]);
        assert_eq!(demux.preamble(), b"Sure, here are the results.\n");
        assert_eq!(demux.sub_stream("P1").unwrap().buffer, b"x");
    }

    #[test]
    fn test_reopened_region_appends() {
        let demux = demux_all(
            &["P1", "P2"],
            &[b"<<<POLICY:P1>>>a<<<POLICY:P2>>>b<<<POLICY:P1>>>c"],
        );
        let p1 = demux.sub_stream("P1").unwrap();
        assert_eq!(p1.buffer, b"ac");
        assert_eq!(p1.regions, 2);
        assert!(p1.complete);
    }

    #[test]
    fn test_finish_closes_open_stream() {
        let mut demux = StreamDemultiplexer::new(["P1"]);
        demux.push(b"<<<POLICY:P1>>>body");
        let events = demux.finish();
        assert_eq!(events, vec![DemuxEvent::Closed { policy_id: "P1".to_string() }]);
        assert!(demux.push(b"late").is_empty());
        assert_eq!(demux.sub_stream("P1").unwrap().buffer, b"body");
    }

    #[test]
    fn test_multibyte_character_split() {
        let text = "<<<POLICY:P1>>>café ✓".as_bytes();
        let chunks: Vec<&[u8]> = text.chunks(1).collect();
        let demux = demux_all(&["P1"], &chunks);
        assert_eq!(demux.sub_stream("P1").unwrap().text(), "café ✓");
    }

    fn body_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 #:.<>é\n-]{0,80}".prop_filter("body must not contain a marker", |b| {
            !b.contains("<<<POLICY:")
        })
    }

    proptest! {
        #[test]
        fn prop_chunking_preserves_every_buffer(
            preamble in "[a-z ]{0,20}",
            sections in prop::collection::vec((0usize..4, body_strategy()), 1..8),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let ids = ["P0", "P1", "P2", "P3"];
            let mut text = preamble.clone().into_bytes();
            let mut expected: Vec<(String, Vec<u8>)> = Vec::new();

            for (idx, body) in &sections {
                let id = ids[*idx];
                text.extend_from_slice(policy_marker(id).as_bytes());
                text.extend_from_slice(body.as_bytes());
                match expected.iter_mut().find(|(p, _)| p == id) {
                    Some((_, buf)) => buf.extend_from_slice(body.as_bytes()),
                    None => expected.push((id.to_string(), body.as_bytes().to_vec())),
                }
            }

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(text.len() + 1)).collect();
            points.push(0);
            points.push(text.len());
            points.sort_unstable();
            points.dedup();

            let mut demux = StreamDemultiplexer::new(ids);
            for window in points.windows(2) {
                demux.push(&text[window[0]..window[1]]);
            }
            demux.finish();

            prop_assert_eq!(demux.sub_streams().len(), expected.len());
            prop_assert_eq!(demux.preamble(), preamble.as_bytes());
            for (id, buf) in &expected {
                let stream = demux.sub_stream(id).unwrap();
                prop_assert!(stream.complete);
                prop_assert_eq!(&stream.buffer, buf);
            }
        }
    }
}
