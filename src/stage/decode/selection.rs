use super::DecodeOptions;
use crate::av::{FramePool, StreamInfo};
use crate::codec::engine::{
    default_thread_count, DecoderEngine, EngineContext, EngineFactory, EngineKind, EngineMessage,
    SkipPolicy,
};
use crate::{PipelineError, Result};
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An engine together with the serial its output is tagged with.
pub(super) struct EngineSlot {
    pub engine: Box<dyn DecoderEngine>,
    pub serial: u64,
    pub opened: bool,
    /// Frames accepted from this engine.
    pub frames: u64,
}

impl EngineSlot {
    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }
}

impl fmt::Debug for EngineSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind(), self.serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Target {
    Hardware,
    Software,
}

/// Which engines a decode task holds and which one it feeds.
#[derive(Debug, Default)]
pub(super) struct Selection {
    pub software: Option<EngineSlot>,
    pub hardware: Option<EngineSlot>,
    pub target: Option<Target>,
    pub need_keyframe: bool,
    pub hardware_retries: u32,
}

impl Selection {
    pub fn target_slot(&self) -> Option<&EngineSlot> {
        match self.target? {
            Target::Hardware => self.hardware.as_ref(),
            Target::Software => self.software.as_ref(),
        }
    }

    pub fn target_slot_mut(&mut self) -> Option<&mut EngineSlot> {
        match self.target? {
            Target::Hardware => self.hardware.as_mut(),
            Target::Software => self.software.as_mut(),
        }
    }

    pub fn target_kind(&self) -> Option<EngineKind> {
        self.target_slot().map(EngineSlot::kind)
    }

    /// Serial of the engine whose frames are delivered.
    pub fn target_serial(&self) -> Option<u64> {
        self.target_slot().map(|slot| slot.serial)
    }

    /// Takes every engine out, leaving an empty selection.
    pub fn take_engines(&mut self) -> Vec<EngineSlot> {
        self.target = None;
        self.hardware.take().into_iter().chain(self.software.take()).collect()
    }
}

/// Point-in-time view of a decode task's engine selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSnapshot {
    pub target: Option<EngineKind>,
    pub software: Option<EngineKind>,
    pub hardware: bool,
    pub need_keyframe: bool,
    pub hardware_retries: u32,
    pub frames_decoded: u64,
}

impl Selection {
    pub fn snapshot(&self, frames_decoded: u64) -> SelectionSnapshot {
        SelectionSnapshot {
            target: self.target_kind(),
            software: self.software.as_ref().map(EngineSlot::kind),
            hardware: self.hardware.is_some(),
            need_keyframe: self.need_keyframe,
            hardware_retries: self.hardware_retries,
            frames_decoded,
        }
    }
}

/// Creates and opens engines for one decode task.
pub(super) struct EngineBuilder {
    pub task: u32,
    pub factory: Arc<dyn EngineFactory>,
    pub pool: FramePool,
    pub events: mpsc::UnboundedSender<EngineMessage>,
    pub allow_native: bool,
    pub threads: Option<usize>,
    pub skip_policy: SkipPolicy,
    next_serial: u64,
}

impl EngineBuilder {
    pub fn new(
        task: u32,
        factory: Arc<dyn EngineFactory>,
        pool: FramePool,
        events: mpsc::UnboundedSender<EngineMessage>,
        options: &DecodeOptions,
    ) -> Self {
        Self {
            task,
            factory,
            pool,
            events,
            allow_native: options.allow_native,
            threads: options.threads,
            skip_policy: SkipPolicy::None,
            next_serial: 1,
        }
    }

    pub fn create(&mut self, kind: EngineKind, params: &StreamInfo) -> Option<EngineSlot> {
        let serial = self.next_serial;
        let ctx = EngineContext::new(serial, self.pool.clone(), self.events.clone());
        let engine = self.factory.create(kind, params, ctx)?;
        self.next_serial += 1;
        Some(EngineSlot {
            engine,
            serial,
            opened: false,
            frames: 0,
        })
    }

    /// The preferred software engine for `params`.
    pub fn create_software(&mut self, params: &StreamInfo) -> Option<EngineSlot> {
        if self.allow_native {
            if let Some(slot) = self.create(EngineKind::SoftwareNative, params) {
                return Some(slot);
            }
        }
        self.create(EngineKind::SoftwarePortable, params)
    }

    pub async fn open(&self, slot: &mut EngineSlot, params: &StreamInfo) -> Result<()> {
        let kind = slot.kind();
        let threads = if kind.is_software() {
            self.threads.unwrap_or_else(|| default_thread_count(params))
        } else {
            1
        };
        slot.engine.open(params, threads).await?;
        if kind.is_software() {
            slot.engine.set_skip_policy(self.skip_policy);
        }
        slot.opened = true;
        debug!(
            "decode task {}: opened {:?} with {} threads",
            self.task, slot, threads
        );
        Ok(())
    }

    /// Makes sure `selection` has an opened software engine, replacing a
    /// platform-native one that fails to open with the portable engine.
    pub async fn open_software(&mut self, selection: &mut Selection, params: &StreamInfo) -> Result<()> {
        if selection.software.is_none() {
            selection.software = self.create_software(params);
        }
        loop {
            let Some(slot) = selection.software.as_mut() else {
                return Err(PipelineError::CodecNotSupport(format!(
                    "no software decoder for {:?}",
                    params.codec_type
                )));
            };
            if slot.opened {
                return Ok(());
            }
            let Err(e) = self.open(slot, params).await else {
                return Ok(());
            };

            warn!("decode task {}: {:?} failed to open: {}", self.task, slot, e);
            if let Some(mut failed) = selection.software.take() {
                failed.engine.close().await;
                if failed.kind() == EngineKind::SoftwareNative {
                    selection.software = self.create(EngineKind::SoftwarePortable, params);
                }
            }
        }
    }

    /// Fresh engines for `params`, with the target opened. Hardware is
    /// preferred when allowed and it opens.
    pub async fn build(&mut self, params: &StreamInfo, allow_hardware: bool) -> Result<Selection> {
        let mut selection = Selection {
            need_keyframe: true,
            ..Default::default()
        };

        if allow_hardware {
            if let Some(mut slot) = self.create(EngineKind::Hardware, params) {
                match self.open(&mut slot, params).await {
                    Ok(()) => {
                        selection.hardware = Some(slot);
                        selection.target = Some(Target::Hardware);
                        selection.software = self.create_software(params);
                        return Ok(selection);
                    }
                    Err(e) => {
                        warn!("decode task {}: hardware decoder failed to open: {}", self.task, e);
                        slot.engine.close().await;
                    }
                }
            }
        }

        selection.target = Some(Target::Software);
        self.open_software(&mut selection, params).await?;
        Ok(selection)
    }
}
