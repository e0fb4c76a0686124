//! Free-running simulation sharing memory with a render consumer.
//!
//! One producer thread steps every entity each tick and publishes a new
//! generation; one consumer thread polls the frame signal on its own cadence
//! and hands the newest complete generation to a registered callback.
//!
//! # Architecture
//!
//! ```text
//! producer ──step──► SimulationBuffer[next] ──publish(gen)──► FrameState
//!                                                               │ dirty?
//! consumer ◄──FrameView(SimulationBuffer[gen & 1])◄──────────────┘
//! ```
//!
//! `stop` and `start` only affect the two threads; the buffer and the
//! consumer's position survive, so a restarted simulation resumes where it
//! left off.

pub mod buffer;
pub mod frame;

#[cfg(test)]
mod tests;

pub use buffer::{
    integrate, integrate_parallel, integrate_record, Bounds, EntityRecord, FrameView, Layout,
    SimulationBuffer, MIN_STRIDE, POS_X, POS_Y, VEL_X, VEL_Y,
};
pub use frame::{FrameState, FrameStats, FrameSynchronizer};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Callback invoked once per newly observed generation.
pub type FrameCallback = Box<dyn FnMut(FrameView<'_>) + Send>;

/// Simulation configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Number of simulated entities.
    pub entity_count: usize,
    /// Reflection bounds.
    pub bounds: Bounds,
    /// Floats per record; at least [`MIN_STRIDE`].
    pub stride: usize,
    /// Fixed seed for the initial state. `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Initial velocity components are drawn from `[-max_speed, max_speed]`.
    pub max_speed: f32,
    /// Pause between producer steps. Zero runs flat out.
    pub tick_interval: Duration,
    /// Consumer polling cadence.
    pub frame_interval: Duration,
    /// Entity count from which steps run on the rayon pool.
    pub parallel_threshold: usize,
}

impl SimulationConfig {
    /// Defaults for `entity_count` entities inside `bounds`.
    pub fn new(
        entity_count: usize,
        bounds: Bounds,
    ) -> Self {
        Self {
            entity_count,
            bounds,
            ..Self::default()
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            entity_count: 100,
            bounds: Bounds::new(100.0, 100.0),
            stride: MIN_STRIDE,
            seed: None,
            max_speed: 1.0,
            tick_interval: Duration::from_millis(16),
            frame_interval: Duration::from_millis(16),
            parallel_threshold: 10_000,
        }
    }
}

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("entity count must be at least 1")]
    ZeroEntities,

    #[error("bounds must be finite and positive, got {width} x {height}")]
    InvalidBounds { width: f32, height: f32 },

    #[error("stride {stride} is smaller than the minimum of {min}", min = MIN_STRIDE)]
    StrideTooSmall { stride: usize },

    #[error("max speed must be finite and non-negative, got {0}")]
    InvalidSpeed(f32),

    #[error("cannot step manually while the simulation is running")]
    Running,

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl SimulationConfig {
    /// Check every field that `init` relies on.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.entity_count == 0 {
            return Err(SimulationError::ZeroEntities);
        }
        if !self.bounds.is_valid() {
            return Err(SimulationError::InvalidBounds {
                width: self.bounds.width,
                height: self.bounds.height,
            });
        }
        if self.stride < MIN_STRIDE {
            return Err(SimulationError::StrideTooSmall {
                stride: self.stride,
            });
        }
        if !self.max_speed.is_finite() || self.max_speed < 0.0 {
            return Err(SimulationError::InvalidSpeed(self.max_speed));
        }
        Ok(())
    }
}

/// Everything the producer and consumers share.
#[derive(Debug)]
pub struct SharedRegion {
    buffer: SimulationBuffer,
    frame: FrameState,
    stats: FrameStats,
    /// Held for the duration of each step: the single-writer role.
    producer: Mutex<()>,
    bounds: Bounds,
    parallel: bool,
}

impl SharedRegion {
    fn step(&self) -> u64 {
        let _role = self.producer.lock();
        let stride = self.buffer.layout().stride;
        let bounds = self.bounds;
        let current = self.frame.generation();

        let next = self.buffer.advance(current, |src, dst| {
            if self.parallel {
                integrate_parallel(src, dst, stride, bounds);
            } else {
                integrate(src, dst, stride, bounds);
            }
        });

        self.frame.publish(next);
        self.stats.record_step();
        next
    }
}

/// Fill a region with uniformly random positions inside `bounds` and
/// velocities in `[-max_speed, max_speed]`. Extra fields start at zero.
pub fn initial_state(
    config: &SimulationConfig,
    rng: &mut impl Rng,
) -> Vec<f32> {
    let mut data = vec![0.0f32; config.entity_count * config.stride];
    let speed = config.max_speed;
    for record in data.chunks_exact_mut(config.stride) {
        record[POS_X] = rng.random_range(0.0..=config.bounds.width);
        record[POS_Y] = rng.random_range(0.0..=config.bounds.height);
        record[VEL_X] = rng.random_range(-speed..=speed);
        record[VEL_Y] = rng.random_range(-speed..=speed);
    }
    data
}

/// Handle to one simulation and its producer/consumer threads.
pub struct Simulation {
    config: SimulationConfig,
    region: Arc<SharedRegion>,
    consumer: Arc<Mutex<FrameSynchronizer>>,
    on_frame: Arc<Mutex<Option<FrameCallback>>>,
    running: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("generation", &self.generation())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Simulation {
    /// Allocate the shared region and write the initial state. Nothing runs
    /// until [`start`](Simulation::start).
    pub fn init(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let layout = Layout {
            entity_count: config.entity_count,
            stride: config.stride,
        };
        let buffer = SimulationBuffer::new(layout, initial_state(&config, &mut rng));

        let region = Arc::new(SharedRegion {
            buffer,
            frame: FrameState::new(),
            stats: FrameStats::default(),
            producer: Mutex::new(()),
            bounds: config.bounds,
            parallel: config.entity_count >= config.parallel_threshold,
        });

        debug!(
            "simulation initialised: {} entities, stride {}, bounds {}x{}",
            layout.entity_count, layout.stride, config.bounds.width, config.bounds.height
        );

        Ok(Self {
            consumer: Arc::new(Mutex::new(FrameSynchronizer::new(region.clone()))),
            config,
            region,
            on_frame: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        })
    }

    /// Register the consumer callback, replacing any previous one.
    ///
    /// The view passed to the callback borrows the stable half and cannot
    /// outlive the call. The callback may register a replacement for itself,
    /// but must not call [`poll_frame`](Simulation::poll_frame): the consumer
    /// position is locked while it runs.
    pub fn on_frame<F>(
        &self,
        callback: F,
    ) where
        F: FnMut(FrameView<'_>) + Send + 'static,
    {
        *self.on_frame.lock() = Some(Box::new(callback));
    }

    /// Start the producer and consumer threads. No-op while running.
    pub fn start(&mut self) -> Result<(), SimulationError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let producer = {
            let region = self.region.clone();
            let running = self.running.clone();
            let tick = self.config.tick_interval;
            spawn_named("sim-producer", move || {
                while running.load(Ordering::SeqCst) {
                    region.step();
                    pace(tick);
                }
            })
        };
        let producer = match producer {
            Ok(handle) => handle,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.threads.push(producer);

        let consumer = {
            let synchronizer = self.consumer.clone();
            let on_frame = self.on_frame.clone();
            let running = self.running.clone();
            let cadence = self.config.frame_interval;
            spawn_named("sim-consumer", move || {
                while running.load(Ordering::SeqCst) {
                    synchronizer.lock().poll(|view| deliver(&on_frame, view));
                    pace(cadence);
                }
            })
        };
        match consumer {
            Ok(handle) => self.threads.push(handle),
            Err(err) => {
                self.stop();
                return Err(err);
            }
        }

        info!("simulation started at generation {}", self.generation());
        Ok(())
    }

    /// Stop both threads after their current iteration. Idempotent; the
    /// shared region is kept for a later `start`.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let was_running = !self.threads.is_empty();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("simulation thread exited by panic");
            }
        }
        if was_running {
            info!("simulation stopped at generation {}", self.generation());
        }
    }

    /// Advance exactly one generation on the calling thread.
    pub fn step_once(&self) -> Result<u64, SimulationError> {
        if self.is_running() {
            return Err(SimulationError::Running);
        }
        Ok(self.region.step())
    }

    /// Run the consumer protocol once on the calling thread.
    ///
    /// Shares its position with the consumer thread, so a generation is
    /// delivered to at most one of the two.
    pub fn poll_frame<F>(
        &self,
        on_frame: F,
    ) -> bool
    where
        F: FnOnce(FrameView<'_>),
    {
        self.consumer.lock().poll(on_frame)
    }

    /// Latest published generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.region.frame.generation()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn stats(&self) -> &FrameStats {
        &self.region.stats
    }

    #[inline]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.region.buffer.layout()
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the registered callback with its slot unlocked. A callback registered
/// meanwhile takes precedence over the one that just ran.
fn deliver(
    slot: &Mutex<Option<FrameCallback>>,
    view: FrameView<'_>,
) {
    let Some(mut callback) = slot.lock().take() else {
        return;
    };
    callback(view);

    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(callback);
    }
}

fn spawn_named<F>(
    name: &str,
    body: F,
) -> Result<thread::JoinHandle<()>, SimulationError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| SimulationError::Spawn {
            name: name.to_string(),
            source,
        })
}

fn pace(interval: Duration) {
    if interval.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(interval);
    }
}
