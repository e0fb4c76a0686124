//! The consumer always sees exactly one complete generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use taskframe::runtime::simulation::{initial_state, integrate};
use taskframe::{Bounds, Simulation, SimulationConfig};

/// Reference states regenerated on the consumer side, one step at a time.
struct Replay {
    config: SimulationConfig,
    generation: u64,
    state: Vec<f32>,
    scratch: Vec<f32>,
}

impl Replay {
    fn new(config: &SimulationConfig) -> Self {
        let seed = config.seed.unwrap();
        let state = initial_state(config, &mut StdRng::seed_from_u64(seed));
        Self {
            config: config.clone(),
            generation: 0,
            scratch: vec![0.0; state.len()],
            state,
        }
    }

    fn advance_to(
        &mut self,
        generation: u64,
    ) -> &[f32] {
        while self.generation < generation {
            integrate(
                &self.state,
                &mut self.scratch,
                self.config.stride,
                self.config.bounds,
            );
            std::mem::swap(&mut self.state, &mut self.scratch);
            self.generation += 1;
        }
        &self.state
    }
}

#[test]
fn test_frames_never_tear() {
    let config = SimulationConfig {
        seed: Some(2024),
        stride: 5,
        tick_interval: Duration::ZERO,
        frame_interval: Duration::from_micros(200),
        ..SimulationConfig::new(256, Bounds::new(64.0, 48.0))
    };
    let mut sim = Simulation::init(config.clone()).unwrap();

    let mut replay = Replay::new(&config);
    let frames = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let frames = frames.clone();
        let failures = failures.clone();
        sim.on_frame(move |view| {
            let generation = view.generation();
            if generation < replay.generation {
                failures
                    .lock()
                    .push(format!("went back to {generation} from {}", replay.generation));
                return;
            }
            if view.as_slice() != replay.advance_to(generation) {
                failures.lock().push(format!("generation {generation} is torn"));
            }
            frames.fetch_add(1, Ordering::SeqCst);
        });
    }

    sim.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    sim.stop();

    assert!(failures.lock().is_empty(), "{:?}", failures.lock());
    assert!(frames.load(Ordering::SeqCst) > 0);
    assert!(sim.generation() > 0);
}

#[test]
fn test_manual_stepping_matches_replay() {
    let config = SimulationConfig {
        seed: Some(77),
        ..SimulationConfig::new(100, Bounds::new(100.0, 100.0))
    };
    let sim = Simulation::init(config.clone()).unwrap();
    let mut replay = Replay::new(&config);

    for expected in 1..=25 {
        assert_eq!(sim.step_once().unwrap(), expected);
    }
    let mut seen = None;
    assert!(sim.poll_frame(|view| {
        seen = Some(view.generation());
        assert_eq!(view.as_slice(), replay.advance_to(25));
    }));
    assert_eq!(seen, Some(25));
    assert!(!sim.poll_frame(|_| unreachable!()));
}
