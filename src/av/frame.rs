use super::pool::Recycle;
use super::Rational;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An image owned by a platform decoder (GPU surface, system decoder buffer).
#[derive(Clone)]
pub struct NativeImage {
    handle: Arc<dyn Any + Send + Sync>,
}

impl NativeImage {
    pub fn new<T: Any + Send + Sync>(handle: T) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for NativeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeImage")
    }
}

/// A decoded picture plus its timing.
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub data: Vec<Bytes>, // planes
    pub width: u32,
    pub height: u32,
    pub pts: i64,
    pub duration: i64,
    pub time_base: Rational,
    pub key_frame: bool,
    pub native: Option<NativeImage>,
}

impl VideoFrame {
    pub fn pts_millis(&self) -> i64 {
        self.time_base.to_millis(self.pts)
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }
}

impl Recycle for VideoFrame {
    fn recycle(&mut self) {
        self.data.clear();
        self.width = 0;
        self.height = 0;
        self.pts = 0;
        self.duration = 0;
        self.key_frame = false;
        self.native = None;
    }
}
