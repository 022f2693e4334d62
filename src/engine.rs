//! The realtime render core: block orchestration of cursors, grains, filters and limiter.

use std::sync::Arc;

use basedrop::Owned;
use crossbeam_queue::ArrayQueue;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    buffer::SourceBuffer,
    config::EngineConfig,
    dsp::{biquad::FilterChannel, limiter::Limiter},
    envelope::HannWindow,
    grain::{resolve_gain_comp, resolve_start_phase, GrainPool, GrainSpawn},
    loudness::LoudnessMap,
    messages::{EngineController, EngineEvent, EngineMessage, INBOX_CAPACITY, OUTBOX_CAPACITY},
    notes::HeldNotes,
    params::{CursorParamValues, CursorParams, ParameterPlane},
    scheduler::GrainScheduler,
    utils::panning_factors,
    Error, CURSOR_COUNT,
};

// -------------------------------------------------------------------------------------------------

/// Derived activity of a cursor, deciding whether its scheduler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CursorActivity {
    /// Not playing, no held notes, nothing to drain.
    Idle,
    /// Global auto-play drives the cursor.
    AutoPlaying,
    /// At least one held note drives the cursor.
    NoteHeld,
    /// A soft-kill is draining the cursor's grains; no new grains spawn until it is done.
    SoftKilling,
}

impl CursorActivity {
    fn is_scheduling(self) -> bool {
        matches!(self, Self::AutoPlaying | Self::NoteHeld)
    }
}

// -------------------------------------------------------------------------------------------------

/// Per-cursor realtime state. Owned exclusively by the audio context.
struct CursorState {
    /// Normalized playhead position in `[0, 1)`.
    position: f64,
    /// Cutoff LFO phase in radians, wrapped to `[0, 2π)`.
    lfo_phase: f32,
    /// One-pole smoothed output gain.
    gain_smooth: f32,
    /// Held notes feeding round-robin pitch offsets to new grains.
    held_notes: HeldNotes,
    /// Soft-kill requested and not yet fully drained.
    kill_pending: bool,
    /// Frames of filter tail left before the cursor's filter path is bypassed.
    filter_tail: u32,
    /// Last good value per parameter field, for snapshot validation fallback.
    shadow: CursorParamValues,
    scheduler: GrainScheduler,
    filter: FilterChannel,
}

impl CursorState {
    fn new(sample_rate: u32, filter_tau: f32) -> Self {
        Self {
            position: 0.0,
            lfo_phase: 0.0,
            gain_smooth: 0.0,
            held_notes: HeldNotes::new(),
            kill_pending: false,
            filter_tail: 0,
            shadow: CursorParamValues::default(),
            scheduler: GrainScheduler::new(),
            filter: FilterChannel::new(sample_rate, filter_tau),
        }
    }

    fn activity(&self, playing: bool) -> CursorActivity {
        if self.kill_pending {
            CursorActivity::SoftKilling
        } else if !self.held_notes.is_empty() {
            CursorActivity::NoteHeld
        } else if playing {
            CursorActivity::AutoPlaying
        } else {
            CursorActivity::Idle
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// The realtime granular synthesis engine.
///
/// Three independent playhead cursors continuously resynthesize a shared source buffer by
/// emitting short, overlapping Hann-windowed grains. Each cursor owns its grain parameters,
/// its polyphonic held-note set and a lowpass filter with LFO-modulated cutoff; the summed
/// output passes through a look-ahead true-peak limiter.
///
/// [`process`](Self::process) is meant to be called from a realtime audio callback with two
/// planar stereo output buffers of arbitrary equal length. Everything it needs is allocated
/// at construction; control input arrives through the [`EngineController`] returned alongside
/// the engine, via the wait-free parameter plane and the message inbox drained at block
/// boundaries.
pub struct GranularEngine {
    sample_rate: u32,
    spawn_cap: usize,
    kill_tail_frames: u32,
    gain_tau: f32,
    playing: bool,
    window: HannWindow,
    source: Option<Owned<SourceBuffer>>,
    loudness: Option<Owned<LoudnessMap>>,
    pool: GrainPool,
    cursors: [CursorState; CURSOR_COUNT],
    limiter: Limiter,
    inbox: Arc<ArrayQueue<EngineMessage>>,
    outbox: Arc<ArrayQueue<EngineEvent>>,
    plane: Arc<ParameterPlane>,
    // block-sized scratch, fixed at construction
    buses: Vec<(Vec<f32>, Vec<f32>)>,
    spawn_offsets: Vec<u32>,
    jitter_rng: SmallRng,
    dropped_spawns: u32,
    frames_since_telemetry: u32,
}

impl GranularEngine {
    /// Largest block processed in one piece; larger host blocks are chunked internally.
    pub const MAX_BLOCK_FRAMES: usize = 8192;
    /// Telemetry emission rate in Hz.
    const TELEMETRY_RATE: u32 = 30;

    /// Create an engine and its control-side handle.
    ///
    /// Fails with [`Error::ConfigError`] when the config cannot produce a safely running
    /// engine (zero sample rate, empty grain pool, degenerate envelope table).
    pub fn new(config: EngineConfig) -> Result<(Self, EngineController), Error> {
        config.validate()?;

        let sample_rate = config.sample_rate;
        let filter_tau = config.filter_tau_ms / 1000.0;
        let inbox = Arc::new(ArrayQueue::new(INBOX_CAPACITY));
        let outbox = Arc::new(ArrayQueue::new(OUTBOX_CAPACITY));
        let plane = Arc::new(ParameterPlane::new());
        let controller =
            EngineController::new(inbox.clone(), outbox.clone(), plane.clone());

        let engine = Self {
            sample_rate,
            spawn_cap: config.spawn_cap(),
            kill_tail_frames: (config.kill_tail_ms / 1000.0 * sample_rate as f32).round() as u32,
            gain_tau: config.gain_tau_ms / 1000.0,
            playing: false,
            window: HannWindow::new(config.env_table_size),
            source: None,
            loudness: None,
            pool: GrainPool::new(config.max_grains),
            cursors: std::array::from_fn(|_| CursorState::new(sample_rate, filter_tau)),
            limiter: Limiter::new(sample_rate, &config.limiter, Self::MAX_BLOCK_FRAMES),
            inbox,
            outbox,
            plane,
            buses: vec![
                (
                    vec![0.0; Self::MAX_BLOCK_FRAMES],
                    vec![0.0; Self::MAX_BLOCK_FRAMES]
                );
                CURSOR_COUNT
            ],
            spawn_offsets: Vec::with_capacity(config.spawn_cap()),
            jitter_rng: SmallRng::from_os_rng(),
            dropped_spawns: 0,
            frames_since_telemetry: 0,
        };
        Ok((engine, controller))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of currently live grains, across all cursors.
    pub fn active_grains(&self) -> usize {
        self.pool.active()
    }

    /// The current activity state of a cursor.
    pub fn cursor_activity(&self, cursor: usize) -> CursorActivity {
        self.cursors[cursor].activity(self.playing)
    }

    /// Render one callback's worth of audio into two planar stereo buffers.
    ///
    /// Accepts arbitrary buffer lengths; both buffers must be equally long. Pending messages
    /// are applied once, at the start of the call, so no block straddles a buffer swap.
    pub fn process(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        debug_assert_eq!(out_l.len(), out_r.len());
        let frames = out_l.len().min(out_r.len());

        crate::assert_no_alloc(|| {
            self.drain_inbox();

            let mut done = 0;
            while done < frames {
                let chunk = (frames - done).min(Self::MAX_BLOCK_FRAMES);
                self.process_block(
                    &mut out_l[done..done + chunk],
                    &mut out_r[done..done + chunk],
                );
                done += chunk;
            }
        });
    }

    // ---------------------------------------------------------------------------------------------

    /// Apply all pending control messages. Runs once per process call, at the block boundary.
    fn drain_inbox(&mut self) {
        while let Some(message) = self.inbox.pop() {
            match message {
                EngineMessage::SetBuffer { buffer, generation } => {
                    // the retired buffer is collected by the control thread, not freed here
                    self.source = Some(buffer);
                    self.emit(EngineEvent::BufferSwapped { generation });
                }
                EngineMessage::SetLoudnessMap { map } => {
                    self.loudness = Some(map);
                }
                EngineMessage::SetParamsAll { params } => {
                    for (cursor, record) in params.iter().enumerate() {
                        self.plane.set_all(cursor, record);
                        self.cursors[cursor].shadow = *record;
                    }
                }
                EngineMessage::SetParamsFor { cursor, params } => {
                    if cursor < CURSOR_COUNT {
                        self.plane.set_all(cursor, &params);
                        self.cursors[cursor].shadow = params;
                    }
                }
                EngineMessage::SetPositions { positions } => {
                    for (state, position) in self.cursors.iter_mut().zip(positions) {
                        if let Some(position) = position {
                            state.position = (position as f64).rem_euclid(1.0);
                        }
                    }
                }
                EngineMessage::SetPlaying(playing) => {
                    self.playing = playing;
                }
                EngineMessage::NoteOn { cursor, semitones } => {
                    if cursor < CURSOR_COUNT {
                        self.cursors[cursor].held_notes.add(semitones);
                    }
                }
                EngineMessage::NoteOff { cursor, semitones } => {
                    if cursor < CURSOR_COUNT {
                        self.cursors[cursor].held_notes.remove(semitones);
                    }
                }
                EngineMessage::NoteOnAll { semitones } => {
                    for state in &mut self.cursors {
                        state.held_notes.add(semitones);
                    }
                }
                EngineMessage::NoteOffAll { semitones } => {
                    for state in &mut self.cursors {
                        state.held_notes.remove(semitones);
                    }
                }
                EngineMessage::ClearNotes { cursor } => {
                    if cursor < CURSOR_COUNT {
                        self.cursors[cursor].held_notes.clear();
                    }
                }
                EngineMessage::KillGrains { cursor } => match cursor {
                    Some(cursor) if cursor < CURSOR_COUNT => self.kill_cursor(cursor),
                    Some(_) => {}
                    None => {
                        for cursor in 0..CURSOR_COUNT {
                            self.kill_cursor(cursor);
                        }
                    }
                },
                EngineMessage::Ping => {
                    self.emit(EngineEvent::Ready);
                }
            }
        }
    }

    fn kill_cursor(&mut self, cursor: usize) {
        if self.pool.active_for_cursor(cursor) > 0 {
            self.pool.soft_kill(cursor, self.kill_tail_frames);
            self.cursors[cursor].kill_pending = true;
        }
    }

    /// Push a telemetry event, displacing the oldest pending one when the outbox is full.
    fn emit(&self, event: EngineEvent) {
        let _ = self.outbox.force_push(event);
    }

    // ---------------------------------------------------------------------------------------------

    fn process_block(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        let frames = out_l.len();
        if frames == 0 {
            return;
        }
        let block_seconds = frames as f32 / self.sample_rate as f32;
        let gain_k = 1.0 - (-block_seconds / self.gain_tau).exp();

        for (bus_l, bus_r) in &mut self.buses {
            bus_l[..frames].fill(0.0);
            bus_r[..frames].fill(0.0);
        }

        // per-cursor parameter snapshots, once per block
        let params: [CursorParams; CURSOR_COUNT] = std::array::from_fn(|cursor| {
            CursorParams::snapshot(&self.plane, cursor, &mut self.cursors[cursor].shadow)
        });

        // advance smoothed gains first: grain rendering reads them blockwise
        let mut cursor_gains = [0.0f32; CURSOR_COUNT];
        for (cursor, state) in self.cursors.iter_mut().enumerate() {
            state.gain_smooth += (params[cursor].gain - state.gain_smooth) * gain_k;
            cursor_gains[cursor] = state.gain_smooth;
        }

        // render grains that were already live at block start
        let had_grains: [bool; CURSOR_COUNT] =
            std::array::from_fn(|cursor| self.pool.active_for_cursor(cursor) > 0);
        if let Some(source) = &self.source {
            self.pool.render(
                source,
                &self.window,
                &cursor_gains,
                &mut self.buses,
                0,
                frames,
            );
        }

        // schedule and spawn this block's new grains, cursor by cursor in generation order
        let has_source = self.source.as_ref().is_some_and(|source| !source.is_empty());
        for cursor in 0..CURSOR_COUNT {
            let activity = self.cursors[cursor].activity(self.playing);
            let scheduling = activity.is_scheduling() && has_source;
            let mut spawned = 0;
            if scheduling {
                let state = &mut self.cursors[cursor];
                state.position = (state.position
                    + params[cursor].scan_speed as f64 * block_seconds as f64)
                    .rem_euclid(1.0);
                state.scheduler.schedule(
                    frames,
                    self.sample_rate,
                    params[cursor].density,
                    self.pool.active(),
                    self.pool.capacity(),
                    self.spawn_cap,
                    &mut self.spawn_offsets,
                );
                for index in 0..self.spawn_offsets.len() {
                    let offset = self.spawn_offsets[index] as usize;
                    if self.spawn_grain(cursor, &params[cursor], &cursor_gains, offset, frames) {
                        spawned += 1;
                    }
                }
            }

            // LFO runs whether or not the cursor schedules, so modulation stays continuous
            let state = &mut self.cursors[cursor];
            let lfo_phase = state.lfo_phase;
            state.lfo_phase = (lfo_phase
                + std::f32::consts::TAU * params[cursor].lfo_freq * block_seconds)
                .rem_euclid(std::f32::consts::TAU);

            // a drained soft-kill re-enables scheduling on the next block
            if state.kill_pending && self.pool.active_for_cursor(cursor) == 0 {
                state.kill_pending = false;
            }

            // bypass the filter once the bus has been silent long enough for its tail to die
            // out, so idle cursors contribute exact zeros
            if had_grains[cursor] || spawned > 0 {
                state.filter_tail = self.sample_rate;
            } else {
                state.filter_tail = state.filter_tail.saturating_sub(frames as u32);
                if state.filter_tail == 0 {
                    state.filter.reset();
                    continue;
                }
            }

            // per-cursor filter path with LFO-modulated cutoff
            let base_cutoff = params[cursor].cutoff_hz(self.sample_rate);
            let modulated = base_cutoff * (1.0 + params[cursor].lfo_depth * lfo_phase.sin());
            let cutoff = modulated.clamp(20.0, 0.45 * self.sample_rate as f32);
            let (bus_l, bus_r) = &mut self.buses[cursor];
            self.cursors[cursor].filter.process(
                &mut bus_l[..frames],
                &mut bus_r[..frames],
                cutoff,
                params[cursor].q_mapped(),
                params[cursor].drive_mapped(),
                params[cursor].slope,
            );
        }

        // sum the filtered cursor buses into the master bus
        for frame in 0..frames {
            let mut left = 0.0;
            let mut right = 0.0;
            for (bus_l, bus_r) in &self.buses {
                left += bus_l[frame];
                right += bus_r[frame];
            }
            out_l[frame] = left;
            out_r[frame] = right;
        }

        let telemetry = self.limiter.process(out_l, out_r);

        // throttled telemetry emission
        self.frames_since_telemetry += frames as u32;
        if self.frames_since_telemetry >= self.sample_rate / Self::TELEMETRY_RATE {
            self.frames_since_telemetry = 0;
            let positions = std::array::from_fn(|cursor| self.cursors[cursor].position as f32);
            self.emit(EngineEvent::Positions { positions });
            self.emit(EngineEvent::Telemetry {
                tp_db: telemetry.tp_db,
                gr_db: telemetry.gr_db,
                dropped_spawns: self.dropped_spawns,
            });
            self.dropped_spawns = 0;
        }
    }

    /// Spawn one grain for `cursor` at frame `offset` and render its share of this block.
    /// Returns true when a grain actually entered the pool.
    fn spawn_grain(
        &mut self,
        cursor: usize,
        params: &CursorParams,
        cursor_gains: &[f32; CURSOR_COUNT],
        offset: usize,
        block_frames: usize,
    ) -> bool {
        let Some(source) = &self.source else {
            return false;
        };
        let duration = params.grain_duration() as f64;
        let jitter = if params.spread > 0.0 {
            (self.jitter_rng.random::<f64>() * 2.0 - 1.0) * params.spread as f64
        } else {
            0.0
        };
        let Some(source_phase) =
            resolve_start_phase(source, self.cursors[cursor].position, jitter, duration)
        else {
            return false;
        };

        let semitones = self.cursors[cursor].held_notes.next_semitones();
        let rate_ratio = source.sample_rate() as f32 / self.sample_rate as f32;
        let increment = params.pitch * (semitones as f32 / 12.0).exp2() * rate_ratio;
        let (pan_l, pan_r) = panning_factors(params.pan);
        let spawn = GrainSpawn {
            cursor_id: cursor as u8,
            source_phase,
            increment,
            env_frames: (duration * self.sample_rate as f64).round() as u32,
            pan_l,
            pan_r,
            gain_comp: resolve_gain_comp(self.loudness.as_deref(), source, source_phase),
        };
        if self.pool.spawn(spawn) {
            self.pool.render_newest(
                source,
                &self.window,
                cursor_gains,
                &mut self.buses,
                offset,
                block_frames,
            );
            true
        } else {
            self.dropped_spawns = self.dropped_spawns.saturating_add(1);
            false
        }
    }

    /// Deterministic RNG seeding for tests.
    #[cfg(test)]
    fn seed_rngs(&mut self, seed: u64) {
        self.jitter_rng = SmallRng::seed_from_u64(seed);
        for (index, state) in self.cursors.iter_mut().enumerate() {
            state.scheduler = GrainScheduler::with_seed(seed ^ (index as u64 + 1));
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParamField;

    const SR: u32 = 48000;

    fn engine() -> (GranularEngine, EngineController) {
        let (mut engine, controller) = GranularEngine::new(EngineConfig::new(SR)).unwrap();
        engine.seed_rngs(0x5EED);
        (engine, controller)
    }

    fn render(engine: &mut GranularEngine, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        for (l, r) in left.chunks_mut(128).zip(right.chunks_mut(128)) {
            engine.process(l, r);
        }
        (left, right)
    }

    /// Let the per-cursor gain smoothers settle at their targets before measuring.
    fn warm_up(engine: &mut GranularEngine) {
        render(engine, SR as usize);
    }

    fn constant_source() -> SourceBuffer {
        SourceBuffer::from_stereo(vec![1.0; SR as usize], vec![1.0; SR as usize], SR).unwrap()
    }

    fn silence_others(controller: &EngineController) {
        for cursor in 1..CURSOR_COUNT {
            controller.set_param(cursor, ParamField::Density, 0.0).unwrap();
        }
    }

    fn drain_events(controller: &EngineController) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(event) = controller.poll_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn invalid_configs_refuse_to_start() {
        assert!(GranularEngine::new(EngineConfig::new(0)).is_err());
        let mut config = EngineConfig::new(SR);
        config.max_grains = 0;
        assert!(GranularEngine::new(config).is_err());
    }

    #[test]
    fn silence_with_no_buffer() {
        let (mut engine, controller) = engine();
        controller.set_playing(true).unwrap();
        let (left, right) = render(&mut engine, 10 * 128);
        assert!(left.iter().all(|s| *s == 0.0));
        assert!(right.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn empty_and_single_frame_sources_render_silence() {
        let (mut engine, controller) = engine();
        controller.set_playing(true).unwrap();
        controller
            .set_buffer(SourceBuffer::from_mono(vec![], SR).unwrap())
            .unwrap();
        let (left, _) = render(&mut engine, 1024);
        assert!(left.iter().all(|s| *s == 0.0));

        controller
            .set_buffer(SourceBuffer::from_mono(vec![1.0], SR).unwrap())
            .unwrap();
        let (left, _) = render(&mut engine, 1024);
        assert!(left.iter().all(|s| *s == 0.0));
        assert_eq!(engine.active_grains(), 0);
    }

    #[test]
    fn grains_render_with_expected_level() {
        let (mut engine, controller) = engine();
        silence_others(&controller);
        controller.set_param(0, ParamField::Density, 5.0).unwrap();
        controller.set_param(0, ParamField::Q, 0.0).unwrap();
        // headroom so overlapping grains never engage the limiter
        controller.set_param(0, ParamField::Gain, 0.3).unwrap();
        warm_up(&mut engine);

        controller.set_buffer(constant_source()).unwrap();
        controller.set_playing(true).unwrap();
        let seconds = 5;
        let (left, right) = render(&mut engine, seconds * SR as usize);

        let energy: f64 = left
            .iter()
            .zip(right.iter())
            .map(|(l, r)| (*l as f64) * (*l as f64) + (*r as f64) * (*r as f64))
            .sum();
        assert!(energy > 0.0);

        // expected per-grain energy: the windowed copy of a constant source through the
        // equal-power pan and the limiter's master trim
        let window = HannWindow::new(1024);
        let env_frames = (0.1 * SR as f32).round() as u32;
        let single: f64 = (0..env_frames)
            .map(|pos| {
                let value = (window.value_at(pos, env_frames) * 0.3 * 0.8) as f64;
                value * value
            })
            .sum();
        let expected = 5.0 * seconds as f64 * single;
        assert!(
            energy > expected * 0.5 && energy < expected * 2.0,
            "energy {energy} vs expected around {expected}"
        );

        // centered pan renders identical channels
        for (l, r) in left.iter().zip(right.iter()) {
            assert!((l - r).abs() < 1e-6);
        }

        // nothing here should have engaged the limiter
        for event in drain_events(&controller) {
            if let EngineEvent::Telemetry { gr_db, .. } = event {
                assert_eq!(gr_db, 0.0);
            }
        }
    }

    #[test]
    fn pitch_doubles_the_rendered_frequency() {
        let sine: Vec<f32> = (0..SR as usize)
            .map(|i| (std::f32::consts::TAU * 1000.0 * i as f32 / SR as f32).sin())
            .collect();
        let (mut engine, controller) = engine();
        silence_others(&controller);
        controller.set_param(0, ParamField::Pitch, 2.0).unwrap();
        controller.set_param(0, ParamField::Density, 20.0).unwrap();
        controller.set_param(0, ParamField::GrainSize, 2.0).unwrap();
        controller.set_param(0, ParamField::Q, 0.0).unwrap();
        controller.set_positions(&[0.25]).unwrap();
        warm_up(&mut engine);

        controller
            .set_buffer(SourceBuffer::from_mono(sine, SR).unwrap())
            .unwrap();
        controller.set_playing(true).unwrap();
        let (left, _) = render(&mut engine, 2 * SR as usize);

        // median distance between rising zero crossings in active regions
        let mut crossings = Vec::new();
        for i in 1..left.len() {
            if left[i - 1] < 0.0 && left[i] >= 0.0 && left[i - 1].abs() > 1e-4 {
                crossings.push(i);
            }
        }
        assert!(crossings.len() > 1000, "too little output to measure");
        let mut periods: Vec<usize> = crossings.windows(2).map(|w| w[1] - w[0]).collect();
        periods.sort_unstable();
        let median = periods[periods.len() / 2];
        // 2 kHz at 48 kHz is a 24 frame period
        assert!(
            (22..=26).contains(&median),
            "median period {median}, expected 24"
        );
    }

    #[test]
    fn buffer_swaps_are_acknowledged() {
        let (mut engine, controller) = engine();
        let first = controller.set_buffer(constant_source()).unwrap();
        render(&mut engine, 128);
        let second = controller.set_buffer(constant_source()).unwrap();
        render(&mut engine, 128);
        let acks: Vec<u64> = drain_events(&controller)
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::BufferSwapped { generation } => Some(generation),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![first, second]);
    }

    #[test]
    fn ping_answers_ready() {
        let (mut engine, controller) = engine();
        controller.ping().unwrap();
        render(&mut engine, 128);
        assert!(drain_events(&controller)
            .iter()
            .any(|event| matches!(event, EngineEvent::Ready)));
    }

    #[test]
    fn soft_kill_drains_within_the_tail() {
        let (mut engine, controller) = engine();
        silence_others(&controller);
        controller.set_param(0, ParamField::Attack, 0.25).unwrap();
        controller.set_param(0, ParamField::Release, 0.25).unwrap();
        controller.set_param(0, ParamField::Density, 100.0).unwrap();
        controller.set_buffer(constant_source()).unwrap();
        controller.set_playing(true).unwrap();
        render(&mut engine, SR as usize / 2);
        assert!(engine.active_grains() > 0);

        // stop feeding new grains so only the kill tail remains observable
        controller.set_param(0, ParamField::Density, 0.0).unwrap();
        controller.kill_grains(Some(0)).unwrap();
        // 28 ms tail, rounded up to whole blocks
        let deadline = (0.028f32 * SR as f32).ceil() as usize + 128;
        render(&mut engine, deadline.next_multiple_of(128));
        assert_eq!(engine.active_grains(), 0);
        // the drained cursor resumes scheduling afterwards
        assert_eq!(engine.cursor_activity(0), CursorActivity::AutoPlaying);
        controller.set_param(0, ParamField::Density, 100.0).unwrap();
        render(&mut engine, SR as usize / 2);
        assert!(engine.active_grains() > 0);
    }

    #[test]
    fn cursor_state_machine() {
        let (mut engine, controller) = engine();
        assert_eq!(engine.cursor_activity(0), CursorActivity::Idle);

        controller.set_playing(true).unwrap();
        render(&mut engine, 128);
        assert_eq!(engine.cursor_activity(0), CursorActivity::AutoPlaying);

        controller.note_on(0, 7).unwrap();
        render(&mut engine, 128);
        assert_eq!(engine.cursor_activity(0), CursorActivity::NoteHeld);

        controller.note_off(0, 7).unwrap();
        controller.set_playing(false).unwrap();
        render(&mut engine, 128);
        assert_eq!(engine.cursor_activity(0), CursorActivity::Idle);

        // a soft-kill with no grains alive is a no-op, not a stuck state
        controller.kill_grains(Some(0)).unwrap();
        render(&mut engine, 128);
        assert_eq!(engine.cursor_activity(0), CursorActivity::Idle);
    }

    #[test]
    fn round_robin_spawns_share_held_notes_evenly() {
        let (mut engine, controller) = engine();
        silence_others(&controller);
        // grains far longer than the test, so every spawn stays observable in the pool
        controller.set_param(0, ParamField::Attack, 5.0).unwrap();
        controller.set_param(0, ParamField::Release, 5.0).unwrap();
        controller.set_param(0, ParamField::Density, 30.0).unwrap();
        controller.set_buffer(
            SourceBuffer::from_mono(vec![0.1; 20 * SR as usize], SR).unwrap(), //
        ).unwrap();
        for semitones in [0, 7, 12] {
            controller.note_on(0, semitones).unwrap();
        }
        render(&mut engine, 2 * SR as usize);

        let mut counts = [0usize; 3];
        for index in 0..engine.pool.active() {
            let increment = engine.pool.increment_of(index);
            let expected = [1.0f32, (7.0f32 / 12.0).exp2(), 2.0];
            let note = expected
                .iter()
                .position(|e| (increment - e).abs() < 1e-3)
                .expect("unexpected grain increment");
            counts[note] += 1;
        }
        let total: usize = counts.iter().sum();
        assert!(total > 10, "too few grains spawned: {total}");
        let min = counts.iter().min().unwrap();
        let max = counts.iter().max().unwrap();
        assert!(max - min <= 1, "unbalanced round robin: {counts:?}");
    }

    #[test]
    fn runaway_density_asymptotes_below_capacity() {
        let mut config = EngineConfig::new(SR);
        config.max_grains = 256;
        let (mut engine, controller) = GranularEngine::new(config).unwrap();
        engine.seed_rngs(0x5EED);
        silence_others(&controller);
        controller.set_param(0, ParamField::Attack, 5.0).unwrap();
        controller.set_param(0, ParamField::Release, 5.0).unwrap();
        controller.set_param(0, ParamField::Density, 10_000.0).unwrap();
        controller.set_buffer(
            SourceBuffer::from_mono(vec![0.1; 20 * SR as usize], SR).unwrap(), //
        ).unwrap();
        controller.set_playing(true).unwrap();
        render(&mut engine, SR as usize);

        let capacity = 256.0;
        let active = engine.active_grains() as f32;
        assert!(
            active >= 0.94 * capacity && active <= 0.95 * capacity + 33.0,
            "active grains {active} should sit at the backpressure cutoff"
        );
    }

    #[test]
    fn hot_signal_is_limited() {
        let (mut engine, controller) = engine();
        for cursor in 0..CURSOR_COUNT {
            controller.set_param(cursor, ParamField::Density, 50.0).unwrap();
            controller.set_param(cursor, ParamField::Gain, 16.0).unwrap();
        }
        warm_up(&mut engine);
        controller.set_buffer(constant_source()).unwrap();
        controller.set_playing(true).unwrap();
        drain_events(&controller);

        let (left, right) = render(&mut engine, SR as usize);
        for sample in left.iter().chain(right.iter()) {
            assert!(sample.is_finite());
            assert!(sample.abs() <= 0.98 + 1e-3);
        }
        let saw_reduction = drain_events(&controller).iter().any(|event| {
            matches!(event, EngineEvent::Telemetry { gr_db, .. } if *gr_db < 0.0)
        });
        assert!(saw_reduction);
    }

    #[test]
    fn non_finite_parameters_never_reach_the_output() {
        let (mut engine, controller) = engine();
        controller.set_buffer(constant_source()).unwrap();
        controller.set_playing(true).unwrap();
        render(&mut engine, SR as usize / 4);

        for cursor in 0..CURSOR_COUNT {
            for field in <ParamField as strum::IntoEnumIterator>::iter() {
                controller.set_param(cursor, field, f32::NAN).unwrap();
            }
        }
        let (left, right) = render(&mut engine, SR as usize / 4);
        for sample in left.iter().chain(right.iter()) {
            assert!(sample.is_finite());
        }
        // engine keeps running on the last good values
        assert!(engine.active_grains() > 0 || left.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn loudness_map_boosts_quiet_material() {
        let quiet_source = || SourceBuffer::from_mono(vec![0.01; SR as usize], SR).unwrap();
        let render_peak = |with_map: bool| {
            let (mut engine, controller) = engine();
            silence_others(&controller);
            controller.set_param(0, ParamField::Density, 10.0).unwrap();
            warm_up(&mut engine);
            controller.set_buffer(quiet_source()).unwrap();
            if with_map {
                let map = LoudnessMap::analyze(&quiet_source(), 2048).unwrap();
                controller.set_loudness_map(map).unwrap();
            }
            controller.set_playing(true).unwrap();
            let (left, _) = render(&mut engine, SR as usize);
            left.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
        };

        let plain = render_peak(false);
        let compensated = render_peak(true);
        assert!(plain > 0.0);
        // RMS of 0.01 sits far below the compensation target, so mapped grains come out hotter
        assert!(
            compensated > 2.0 * plain,
            "compensated {compensated} vs plain {plain}"
        );
    }

    #[test]
    fn positions_update_and_report() {
        let (mut engine, controller) = engine();
        controller.set_positions(&[0.25, 0.5, 0.75]).unwrap();
        controller.set_buffer(constant_source()).unwrap();
        controller.set_playing(true).unwrap();
        // scan speed moves cursor A forward
        controller.set_param(0, ParamField::ScanSpeed, 0.5).unwrap();
        render(&mut engine, 2 * SR as usize);

        let positions = drain_events(&controller)
            .into_iter()
            .rev()
            .find_map(|event| match event {
                EngineEvent::Positions { positions } => Some(positions),
                _ => None,
            })
            .expect("no position telemetry emitted");
        // wrapped back into [0, 1): 0.25 + ~2 s * 0.5/s lands near 0.25 again, with the
        // last telemetry emission up to one report interval before the end of the render
        assert!((positions[0] - 0.25).abs() < 0.05);
        assert!((positions[1] - 0.5).abs() < 1e-6);
        assert!((positions[2] - 0.75).abs() < 1e-6);
    }
}
