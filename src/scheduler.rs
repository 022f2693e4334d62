//! Poisson-distributed grain spawn scheduling with pool backpressure.

use rand::{rngs::SmallRng, Rng, SeedableRng};

// -------------------------------------------------------------------------------------------------

/// Backpressure factor for the given active grain count against the pool capacity.
///
/// Scales the effective spawn density down in steps as the pool fills up, so runaway densities
/// asymptote below capacity instead of hammering the pool with doomed spawn attempts.
pub fn backpressure_factor(active_grains: usize, capacity: usize) -> f32 {
    debug_assert!(capacity > 0);
    let fill = active_grains as f32 / capacity as f32;
    if fill < 0.5 {
        1.0
    } else if fill < 0.7 {
        0.65
    } else if fill < 0.85 {
        0.4
    } else if fill < 0.95 {
        0.2
    } else {
        0.0
    }
}

// -------------------------------------------------------------------------------------------------

/// Per-cursor spawn scheduler drawing exponential inter-arrival times.
///
/// Grain onsets form a Poisson process: the countdown to the next spawn is drawn from an
/// exponential distribution with the cursor's effective density as its rate, which makes the
/// spawn pattern memoryless and free of periodic artifacts. The scheduler runs once per block,
/// emitting the frame offsets of all spawns that land inside the block.
#[derive(Debug, Clone)]
pub struct GrainScheduler {
    /// Frames remaining until the next spawn is due.
    countdown: f64,
    rng: SmallRng,
}

impl GrainScheduler {
    pub fn new() -> Self {
        Self {
            countdown: 0.0,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Deterministic construction for tests.
    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            countdown: 0.0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Schedule spawns for a block of `block_frames` frames.
    ///
    /// `density` is the cursor's raw density in grains/s; backpressure from the current pool
    /// fill is applied here. Spawn offsets (in frames from block start, ascending) are pushed
    /// into `spawns`, which is cleared first and never grown beyond `spawn_cap` entries, so a
    /// caller that reserved that capacity up front stays allocation-free.
    pub fn schedule(
        &mut self,
        block_frames: usize,
        sample_rate: u32,
        density: f32,
        active_grains: usize,
        capacity: usize,
        spawn_cap: usize,
        spawns: &mut Vec<u32>,
    ) {
        spawns.clear();

        let effective_density = density * backpressure_factor(active_grains, capacity);
        if effective_density <= 0.0 {
            // keep counting down, but spawn nothing this block
            self.countdown = (self.countdown - block_frames as f64).max(0.0);
            return;
        }

        let mean_interval_frames = sample_rate as f64 / effective_density.max(0.1) as f64;
        if self.countdown <= 0.0 {
            self.countdown = self.draw_interval(mean_interval_frames);
        }
        while self.countdown <= block_frames as f64 && spawns.len() < spawn_cap {
            // countdown > 0 here, so the offset lands inside [0, block_frames)
            let offset = (self.countdown.ceil() as u32 - 1).min(block_frames as u32 - 1);
            spawns.push(offset);
            self.countdown += self.draw_interval(mean_interval_frames);
        }
        self.countdown -= block_frames as f64;
    }

    /// A fresh exponential inter-arrival draw, rounded up to at least one frame.
    fn draw_interval(&mut self, mean_frames: f64) -> f64 {
        let uniform: f64 = self.rng.random();
        (-(1.0 - uniform).ln() * mean_frames).max(1.0)
    }
}

impl Default for GrainScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48000;
    const CAP: usize = 1024;
    const SPAWN_CAP: usize = 32;

    fn run_blocks(scheduler: &mut GrainScheduler, density: f32, blocks: usize) -> usize {
        let mut spawns = Vec::with_capacity(SPAWN_CAP);
        let mut total = 0;
        for _ in 0..blocks {
            scheduler.schedule(128, SR, density, 0, CAP, SPAWN_CAP, &mut spawns);
            total += spawns.len();
        }
        total
    }

    #[test]
    fn backpressure_steps() {
        assert_eq!(backpressure_factor(0, 1024), 1.0);
        assert_eq!(backpressure_factor(511, 1024), 1.0);
        assert_eq!(backpressure_factor(512, 1024), 0.65);
        assert_eq!(backpressure_factor(717, 1024), 0.4);
        assert_eq!(backpressure_factor(871, 1024), 0.2);
        assert_eq!(backpressure_factor(973, 1024), 0.0);
        assert_eq!(backpressure_factor(1024, 1024), 0.0);
    }

    #[test]
    fn spawn_rate_matches_density() {
        // 10 simulated seconds at 20 grains/s: expect 200 +- 3 sigma of Poisson(200)
        let mut scheduler = GrainScheduler::with_seed(0x5EED);
        let density = 20.0;
        let seconds = 10;
        let blocks = seconds * SR as usize / 128;
        let total = run_blocks(&mut scheduler, density, blocks) as f64;
        let expected = density as f64 * seconds as f64;
        let tolerance = 3.0 * expected.sqrt();
        assert!(
            (total - expected).abs() < tolerance,
            "spawned {total}, expected {expected} +- {tolerance}"
        );
    }

    #[test]
    fn zero_density_spawns_nothing() {
        let mut scheduler = GrainScheduler::with_seed(1);
        assert_eq!(run_blocks(&mut scheduler, 0.0, 1000), 0);
    }

    #[test]
    fn full_pool_suppresses_spawning() {
        let mut scheduler = GrainScheduler::with_seed(2);
        let mut spawns = Vec::with_capacity(SPAWN_CAP);
        for _ in 0..1000 {
            scheduler.schedule(128, SR, 100.0, CAP, CAP, SPAWN_CAP, &mut spawns);
            assert!(spawns.is_empty());
        }
    }

    #[test]
    fn spawn_cap_bounds_block_work() {
        let mut scheduler = GrainScheduler::with_seed(3);
        let mut spawns = Vec::with_capacity(SPAWN_CAP);
        // absurd density: every block must still stay under the cap
        for _ in 0..100 {
            scheduler.schedule(128, SR, 1e6, 0, CAP, SPAWN_CAP, &mut spawns);
            assert!(spawns.len() <= SPAWN_CAP);
        }
    }

    #[test]
    fn offsets_are_ascending_and_in_range() {
        let mut scheduler = GrainScheduler::with_seed(4);
        let mut spawns = Vec::with_capacity(SPAWN_CAP);
        for _ in 0..500 {
            scheduler.schedule(128, SR, 500.0, 0, CAP, SPAWN_CAP, &mut spawns);
            let mut previous = 0;
            for &offset in &spawns {
                assert!(offset < 128);
                assert!(offset >= previous);
                previous = offset;
            }
        }
    }

    #[test]
    fn inter_arrival_is_memoryless_across_blocks() {
        // the same seed must produce the same spawn sequence regardless of block partitioning
        let mut coarse = GrainScheduler::with_seed(7);
        let mut fine = GrainScheduler::with_seed(7);
        let mut spawns = Vec::with_capacity(SPAWN_CAP);

        let mut coarse_total = 0;
        for _ in 0..100 {
            coarse.schedule(256, SR, 50.0, 0, CAP, SPAWN_CAP, &mut spawns);
            coarse_total += spawns.len();
        }
        let mut fine_total = 0;
        for _ in 0..200 {
            fine.schedule(128, SR, 50.0, 0, CAP, SPAWN_CAP, &mut spawns);
            fine_total += spawns.len();
        }
        assert_eq!(coarse_total, fine_total);
    }
}
