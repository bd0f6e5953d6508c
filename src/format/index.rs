use super::{FormatParser, ReadStatus};
use crate::av::Packet;
use crate::format::io::IoContext;
use crate::{PipelineError, Result};
use log::debug;
use std::ops::BitOr;

/// How a seek picks its landing point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekFlags(u8);

impl SeekFlags {
    /// Land on the last point at or before the target (the default is the
    /// first point at or after it).
    pub const BACKWARD: SeekFlags = SeekFlags(0x1);
    /// Non-key packets are acceptable landing points.
    pub const ANY: SeekFlags = SeekFlags(0x4);

    pub const fn empty() -> Self {
        SeekFlags(0)
    }

    pub fn contains(&self, other: SeekFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SeekFlags {
    type Output = SeekFlags;

    fn bitor(self, rhs: SeekFlags) -> SeekFlags {
        SeekFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset where reading must resume to get this packet.
    pub pos: u64,
    /// Packet timestamp in its track's time base.
    pub pts: i64,
    /// The same timestamp in milliseconds.
    pub time_ms: i64,
    pub track: usize,
    pub key: bool,
}

/// Seek points collected while reading.
#[derive(Debug, Default, Clone)]
pub struct SeekIndex {
    entries: Vec<IndexEntry>,
    complete: bool,
}

impl SeekIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry, keeping entries ordered by position. A position
    /// already indexed is ignored.
    pub fn add(&mut self, entry: IndexEntry) {
        if let Err(at) = self.entries.binary_search_by_key(&entry.pos, |e| e.pos) {
            self.entries.insert(at, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }

    /// Marks that the whole stream has been indexed.
    pub fn set_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether a lookup for `time_ms` on `track` (any track when `None`) can
    /// be answered without reading further. Forward seeks need a landing
    /// point at or past the target.
    pub fn covers(&self, track: Option<usize>, time_ms: i64, flags: SeekFlags) -> bool {
        let need_key = !flags.contains(SeekFlags::BACKWARD) && !flags.contains(SeekFlags::ANY);
        self.complete
            || self.entries.iter().rev().any(|e| {
                track.map_or(true, |t| e.track == t) && e.time_ms >= time_ms && (e.key || !need_key)
            })
    }

    pub fn lookup(&self, track: Option<usize>, time_ms: i64, flags: SeekFlags) -> Option<&IndexEntry> {
        let mut candidates = self.entries.iter().filter(|e| {
            track.map_or(true, |t| e.track == t) && (e.key || flags.contains(SeekFlags::ANY))
        });

        if flags.contains(SeekFlags::BACKWARD) {
            let mut best: Option<&IndexEntry> = None;
            let mut first: Option<&IndexEntry> = None;
            for entry in candidates {
                first.get_or_insert(entry);
                if entry.time_ms <= time_ms && best.map_or(true, |b| entry.time_ms >= b.time_ms) {
                    best = Some(entry);
                }
            }
            best.or(first)
        } else {
            candidates.find(|e| e.time_ms >= time_ms)
        }
    }
}

/// Parsers that keep a [`SeekIndex`] and can restart reading from an entry.
pub trait Indexed {
    fn index(&self) -> &SeekIndex;

    fn index_mut(&mut self) -> &mut SeekIndex;

    /// Drops partial read state and resumes as if `entry` were the next packet.
    fn reset_to(&mut self, entry: &IndexEntry);
}

/// Seeks an indexed parser, scanning forward first when the target lies past
/// the indexed range. Returns the timestamp (ms) of the landing point.
pub async fn seek_indexed<P>(
    parser: &mut P,
    io: &mut IoContext,
    track: Option<usize>,
    time_ms: i64,
    flags: SeekFlags,
) -> Result<i64>
where
    P: FormatParser + Indexed + ?Sized,
{
    if !parser.index().covers(track, time_ms, flags) {
        if let Some(last) = parser.index().last().copied() {
            io.seek(last.pos).await?;
            parser.reset_to(&last);
        }
        let mut scratch = Packet::default();
        while !parser.index().covers(track, time_ms, flags) {
            if let ReadStatus::End = parser.read_packet(io, &mut scratch).await? {
                parser.index_mut().set_complete();
            }
        }
        debug!("scanned index forward to {} entries", parser.index().len());
    }

    let entry = parser
        .index()
        .lookup(track, time_ms, flags)
        .or_else(|| parser.index().lookup(track, time_ms, flags | SeekFlags::BACKWARD))
        .copied()
        .ok_or_else(|| PipelineError::DataInvalid(format!("no seek point for {} ms", time_ms)))?;

    io.seek(entry.pos).await?;
    parser.reset_to(&entry);
    Ok(entry.time_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn index() -> SeekIndex {
        let mut index = SeekIndex::new();
        for (i, key) in [true, false, false, true, false].into_iter().enumerate() {
            index.add(IndexEntry {
                pos: i as u64 * 100,
                pts: i as i64 * 3600,
                time_ms: i as i64 * 40,
                track: 0,
                key,
            });
        }
        index.add(IndexEntry {
            pos: 250,
            pts: 0,
            time_ms: 0,
            track: 1,
            key: true,
        });
        index
    }

    #[test]
    fn test_add_keeps_position_order() {
        let mut index = index();
        assert_eq!(index.len(), 6);
        index.add(IndexEntry {
            pos: 200,
            pts: 1,
            time_ms: 1,
            track: 1,
            key: true,
        });
        assert_eq!(index.len(), 6);
        assert_eq!(index.last().unwrap().pos, 400);
    }

    #[test]
    fn test_lookup() {
        let index = index();
        let at = |ms, flags| index.lookup(Some(0), ms, flags).map(|e| e.pos);

        assert_eq!(at(90, SeekFlags::BACKWARD), Some(0));
        assert_eq!(at(120, SeekFlags::BACKWARD), Some(300));
        assert_eq!(at(90, SeekFlags::BACKWARD | SeekFlags::ANY), Some(200));
        assert_eq!(at(50, SeekFlags::empty()), Some(300));
        assert_eq!(at(50, SeekFlags::ANY), Some(200));
        assert_eq!(at(500, SeekFlags::empty()), None);
        assert_eq!(index.lookup(Some(1), 0, SeekFlags::empty()).map(|e| e.pos), Some(250));
        assert_eq!(index.lookup(None, 130, SeekFlags::BACKWARD).map(|e| e.pos), Some(300));
    }

    #[test]
    fn test_covers() {
        let mut index = index();
        assert!(index.covers(Some(0), 160, SeekFlags::BACKWARD));
        assert!(!index.covers(Some(0), 161, SeekFlags::BACKWARD));
        assert!(index.covers(Some(0), 120, SeekFlags::empty()));
        assert!(!index.covers(Some(0), 130, SeekFlags::empty()));
        assert!(index.covers(Some(0), 130, SeekFlags::ANY));
        index.set_complete();
        assert!(index.covers(Some(0), 10_000, SeekFlags::empty()));
    }
}
