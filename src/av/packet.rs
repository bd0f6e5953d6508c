use super::pool::Recycle;
use super::Rational;
use bytes::Bytes;

/// Data attached to a packet next to its payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideData {
    /// Codec extradata that replaces the stream's current one from this packet on.
    pub new_extra_data: Option<Bytes>,
}

/// One compressed access unit of a track.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub stream_index: usize,
    pub is_key: bool,
    /// Duration in `time_base` units, 0 when unknown.
    pub duration: i64,
    pub time_base: Rational,
    /// Byte offset of the packet in the container, when the parser knows it.
    pub pos: Option<u64>,
    pub side_data: Option<SideData>,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_stream_index(mut self, index: usize) -> Self {
        self.stream_index = index;
        self
    }

    pub fn with_key_flag(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_time_base(mut self, time_base: Rational) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Presentation time, falling back to the decode time.
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }

    /// Presentation time in milliseconds on the packet's own time base.
    pub fn pts_millis(&self) -> Option<i64> {
        self.timestamp().map(|ts| self.time_base.to_millis(ts))
    }

    /// Replacement extradata carried by this packet, if any.
    pub fn new_extra_data(&self) -> Option<&Bytes> {
        self.side_data.as_ref().and_then(|s| s.new_extra_data.as_ref())
    }

    pub fn set_new_extra_data(&mut self, extra_data: Bytes) {
        self.side_data
            .get_or_insert_with(SideData::default)
            .new_extra_data = Some(extra_data);
    }
}

impl Recycle for Packet {
    fn recycle(&mut self) {
        self.data = Bytes::new();
        self.pts = None;
        self.dts = None;
        self.stream_index = 0;
        self.is_key = false;
        self.duration = 0;
        self.pos = None;
        self.side_data = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps() {
        let packet = Packet::new(vec![1, 2, 3])
            .with_dts(1800)
            .with_time_base(Rational::MPEG);
        assert_eq!(packet.timestamp(), Some(1800));
        assert_eq!(packet.pts_millis(), Some(20));
        assert_eq!(packet.size(), 3);
    }

    #[test]
    fn test_recycle_clears_side_data() {
        let mut packet = Packet::new(vec![0x65]).with_key_flag(true);
        packet.set_new_extra_data(Bytes::from_static(&[0x67, 0x42]));
        assert!(packet.new_extra_data().is_some());

        packet.recycle();
        assert!(packet.new_extra_data().is_none());
        assert!(!packet.is_key);
        assert!(packet.data.is_empty());
    }
}
