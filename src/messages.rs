//! Message inbox, telemetry outbox and the control-side engine handle.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use basedrop::{Collector, Handle, Owned};
use crossbeam_queue::ArrayQueue;

use crate::{
    buffer::SourceBuffer,
    loudness::LoudnessMap,
    params::{CursorParamValues, ParamField, ParameterPlane},
    Error, CURSOR_COUNT,
};

// -------------------------------------------------------------------------------------------------

/// Messages sent from the control thread into the engine.
///
/// Messages are drained once per process call, at the block boundary, so a single block never
/// observes half-applied state. Heap-owning payloads travel as [`basedrop::Owned`] values:
/// when the audio thread replaces a buffer, dropping the retired one only queues it for the
/// control-side collector instead of freeing memory on the audio thread.
pub enum EngineMessage {
    /// Swap the source buffer on the next block.
    SetBuffer {
        buffer: Owned<SourceBuffer>,
        generation: u64,
    },
    /// Replace the loudness map used for grain gain compensation.
    SetLoudnessMap { map: Owned<LoudnessMap> },
    /// Refresh the whole parameter plane.
    SetParamsAll { params: [CursorParamValues; CURSOR_COUNT] },
    /// Refresh one cursor's parameter record.
    SetParamsFor {
        cursor: usize,
        params: CursorParamValues,
    },
    /// Overwrite cursor playhead positions. `None` entries are left untouched.
    SetPositions { positions: [Option<f32>; CURSOR_COUNT] },
    /// Toggle global auto-play.
    SetPlaying(bool),
    /// Add a held note to one cursor.
    NoteOn { cursor: usize, semitones: i32 },
    /// Release one held note of one cursor.
    NoteOff { cursor: usize, semitones: i32 },
    /// Add a held note to all cursors.
    NoteOnAll { semitones: i32 },
    /// Release one held note on all cursors.
    NoteOffAll { semitones: i32 },
    /// Drop one cursor's held-note set.
    ClearNotes { cursor: usize },
    /// Soft-kill all grains of one cursor, or of all cursors when `None`.
    KillGrains { cursor: Option<usize> },
    /// Request a `Ready` reply on the outbox.
    Ping,
}

// -------------------------------------------------------------------------------------------------

/// Telemetry events emitted by the engine, rate-limited to roughly 30 Hz.
///
/// The outbox is bounded; when the control thread falls behind, the oldest pending event is
/// dropped in favor of the new one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// Current cursor playhead positions, each in `[0, 1)`.
    Positions { positions: [f32; CURSOR_COUNT] },
    /// Limiter true-peak/gain-reduction figures and the number of spawns dropped on a
    /// full grain pool since the last report.
    Telemetry {
        tp_db: f32,
        gr_db: f32,
        dropped_spawns: u32,
    },
    /// A `SetBuffer` swap was applied; the producer may retire the old buffer.
    BufferSwapped { generation: u64 },
    /// Reply to a `Ping`.
    Ready,
}

// -------------------------------------------------------------------------------------------------

pub(crate) const INBOX_CAPACITY: usize = 256;
pub(crate) const OUTBOX_CAPACITY: usize = 64;

// -------------------------------------------------------------------------------------------------

/// Control-side handle to a running [`GranularEngine`](crate::GranularEngine).
///
/// The controller owns the producer side of the message inbox, the parameter plane writer,
/// the telemetry outbox consumer and the collector that reclaims buffers the audio thread
/// retired. It is `Send` but deliberately not `Sync`: the engine expects a single logical
/// producer.
pub struct EngineController {
    inbox: Arc<ArrayQueue<EngineMessage>>,
    outbox: Arc<ArrayQueue<EngineEvent>>,
    plane: Arc<ParameterPlane>,
    collector: Collector,
    collector_handle: Handle,
    buffer_generation: AtomicU64,
}

impl EngineController {
    pub(crate) fn new(
        inbox: Arc<ArrayQueue<EngineMessage>>,
        outbox: Arc<ArrayQueue<EngineEvent>>,
        plane: Arc<ParameterPlane>,
    ) -> Self {
        let collector = Collector::new();
        let collector_handle = collector.handle();
        Self {
            inbox,
            outbox,
            plane,
            collector,
            collector_handle,
            buffer_generation: AtomicU64::new(0),
        }
    }

    fn push(&self, message: EngineMessage) -> Result<(), Error> {
        self.inbox.push(message).map_err(|_| Error::SendError)
    }

    fn check_cursor(cursor: usize) -> Result<(), Error> {
        if cursor >= CURSOR_COUNT {
            return Err(Error::ParameterError(format!(
                "Cursor index must be < {CURSOR_COUNT}, got {cursor}"
            )));
        }
        Ok(())
    }

    /// Write a single parameter field for one cursor into the shared plane.
    ///
    /// The value takes effect at the next block boundary. Non-finite values are accepted
    /// here but rejected by the engine's snapshot validation, which keeps the last good value.
    pub fn set_param(&self, cursor: usize, field: ParamField, value: f32) -> Result<(), Error> {
        Self::check_cursor(cursor)?;
        self.plane.set(cursor, field, value);
        Ok(())
    }

    /// Read back a parameter field as currently stored in the plane.
    pub fn param(&self, cursor: usize, field: ParamField) -> Result<f32, Error> {
        Self::check_cursor(cursor)?;
        Ok(self.plane.get(cursor, field))
    }

    /// Refresh all cursors' parameters wholesale.
    pub fn set_params_all(&self, params: [CursorParamValues; CURSOR_COUNT]) -> Result<(), Error> {
        self.push(EngineMessage::SetParamsAll { params })
    }

    /// Refresh one cursor's parameters wholesale.
    pub fn set_params_for(&self, cursor: usize, params: CursorParamValues) -> Result<(), Error> {
        Self::check_cursor(cursor)?;
        self.push(EngineMessage::SetParamsFor { cursor, params })
    }

    /// Swap the engine's source buffer at the next block boundary.
    ///
    /// Returns the swap generation; the engine acknowledges the applied swap with a
    /// [`EngineEvent::BufferSwapped`] event carrying the same generation.
    pub fn set_buffer(&self, buffer: SourceBuffer) -> Result<u64, Error> {
        let generation = self.buffer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let buffer = Owned::new(&self.collector_handle, buffer);
        self.push(EngineMessage::SetBuffer { buffer, generation })?;
        Ok(generation)
    }

    /// Replace the loudness map used for grain gain compensation.
    pub fn set_loudness_map(&self, map: LoudnessMap) -> Result<(), Error> {
        let map = Owned::new(&self.collector_handle, map);
        self.push(EngineMessage::SetLoudnessMap { map })
    }

    /// Overwrite cursor positions with the provided values, each in `[0, 1]`.
    /// Entries beyond the cursor count are ignored.
    pub fn set_positions(&self, positions: &[f32]) -> Result<(), Error> {
        let mut message_positions = [None; CURSOR_COUNT];
        for (slot, value) in message_positions.iter_mut().zip(positions.iter()) {
            if !value.is_finite() || !(0.0..=1.0).contains(value) {
                return Err(Error::ParameterError(format!(
                    "Cursor positions must be finite and in [0, 1], got {value}"
                )));
            }
            *slot = Some(*value);
        }
        self.push(EngineMessage::SetPositions {
            positions: message_positions,
        })
    }

    /// Toggle global auto-play.
    pub fn set_playing(&self, playing: bool) -> Result<(), Error> {
        self.push(EngineMessage::SetPlaying(playing))
    }

    pub fn note_on(&self, cursor: usize, semitones: i32) -> Result<(), Error> {
        Self::check_cursor(cursor)?;
        self.push(EngineMessage::NoteOn { cursor, semitones })
    }

    pub fn note_off(&self, cursor: usize, semitones: i32) -> Result<(), Error> {
        Self::check_cursor(cursor)?;
        self.push(EngineMessage::NoteOff { cursor, semitones })
    }

    pub fn note_on_all(&self, semitones: i32) -> Result<(), Error> {
        self.push(EngineMessage::NoteOnAll { semitones })
    }

    pub fn note_off_all(&self, semitones: i32) -> Result<(), Error> {
        self.push(EngineMessage::NoteOffAll { semitones })
    }

    /// Drop one cursor's held-note set.
    pub fn clear_notes(&self, cursor: usize) -> Result<(), Error> {
        Self::check_cursor(cursor)?;
        self.push(EngineMessage::ClearNotes { cursor })
    }

    /// Soft-kill all grains of one cursor, or of every cursor when `cursor` is `None`.
    /// Audible output of the affected cursors decays within the configured kill tail.
    pub fn kill_grains(&self, cursor: Option<usize>) -> Result<(), Error> {
        if let Some(cursor) = cursor {
            Self::check_cursor(cursor)?;
        }
        self.push(EngineMessage::KillGrains { cursor })
    }

    /// Request a [`EngineEvent::Ready`] handshake reply.
    pub fn ping(&self) -> Result<(), Error> {
        self.push(EngineMessage::Ping)
    }

    /// Poll the next pending telemetry event, if any.
    pub fn poll_event(&self) -> Option<EngineEvent> {
        self.outbox.pop()
    }

    /// Reclaim buffers the audio thread has retired. Call this periodically from the
    /// control thread, e.g. together with event polling.
    pub fn collect(&mut self) {
        self.collector.collect();
    }
}

// -------------------------------------------------------------------------------------------------
