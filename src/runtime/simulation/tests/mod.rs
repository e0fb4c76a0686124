//! Simulation unit tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use super::*;

fn seeded(
    entity_count: usize,
    seed: u64,
) -> SimulationConfig {
    SimulationConfig {
        seed: Some(seed),
        tick_interval: Duration::from_millis(1),
        frame_interval: Duration::from_millis(1),
        ..SimulationConfig::new(entity_count, Bounds::new(100.0, 100.0))
    }
}

/// Copy out the next unseen generation, if any.
fn snapshot(sim: &Simulation) -> Option<(u64, Vec<f32>)> {
    let mut out = None;
    sim.poll_frame(|view| out = Some((view.generation(), view.as_slice().to_vec())));
    out
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stride, MIN_STRIDE);
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let bounds = Bounds::new(100.0, 100.0);
        assert!(matches!(
            Simulation::init(SimulationConfig::new(0, bounds)),
            Err(SimulationError::ZeroEntities)
        ));
        assert!(matches!(
            Simulation::init(SimulationConfig::new(10, Bounds::new(0.0, 5.0))),
            Err(SimulationError::InvalidBounds { .. })
        ));
        assert!(matches!(
            Simulation::init(SimulationConfig::new(10, Bounds::new(f32::NAN, 5.0))),
            Err(SimulationError::InvalidBounds { .. })
        ));

        let mut config = SimulationConfig::new(10, bounds);
        config.stride = 3;
        assert!(matches!(
            Simulation::init(config),
            Err(SimulationError::StrideTooSmall { stride: 3 })
        ));

        let mut config = SimulationConfig::new(10, bounds);
        config.max_speed = -1.0;
        assert!(matches!(
            Simulation::init(config),
            Err(SimulationError::InvalidSpeed(_))
        ));
    }

    #[test]
    fn test_initial_state_within_bounds() {
        let sim = Simulation::init(seeded(500, 3)).unwrap();
        let (generation, data) = snapshot(&sim).unwrap();
        assert_eq!(generation, 0);
        assert_eq!(data.len(), 500 * MIN_STRIDE);
        for record in data.chunks_exact(MIN_STRIDE) {
            assert!((0.0..=100.0).contains(&record[POS_X]));
            assert!((0.0..=100.0).contains(&record[POS_Y]));
            assert!(record[VEL_X].abs() <= 1.0);
            assert!(record[VEL_Y].abs() <= 1.0);
        }
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = Simulation::init(seeded(64, 42)).unwrap();
        let b = Simulation::init(seeded(64, 42)).unwrap();
        let c = Simulation::init(seeded(64, 43)).unwrap();
        let a = snapshot(&a).unwrap().1;
        assert_eq!(a, snapshot(&b).unwrap().1);
        assert_ne!(a, snapshot(&c).unwrap().1);
    }
}

mod step_tests {
    use super::*;

    #[test]
    fn test_step_integrates_and_reflects() {
        let sim = Simulation::init(seeded(100, 11)).unwrap();
        let (_, before) = snapshot(&sim).unwrap();

        assert_eq!(sim.step_once().unwrap(), 1);
        assert_eq!(sim.generation(), 1);

        let (generation, after) = snapshot(&sim).unwrap();
        assert_eq!(generation, 1);
        for (old, new) in before.chunks_exact(MIN_STRIDE).zip(after.chunks_exact(MIN_STRIDE)) {
            let x = old[POS_X] + old[VEL_X];
            let y = old[POS_Y] + old[VEL_Y];
            assert_eq!(new[POS_X], x);
            assert_eq!(new[POS_Y], y);

            let flip_x = !(0.0..=100.0).contains(&x);
            let flip_y = !(0.0..=100.0).contains(&y);
            assert_eq!(new[VEL_X], if flip_x { -old[VEL_X] } else { old[VEL_X] });
            assert_eq!(new[VEL_Y], if flip_y { -old[VEL_Y] } else { old[VEL_Y] });
        }
    }

    #[test]
    fn test_record_reflects_without_clamping() {
        let bounds = Bounds::new(10.0, 10.0);
        let src = [9.5f32, 0.25, 1.0, -0.5];
        let mut dst = [0.0f32; 4];
        integrate_record(&src, &mut dst, bounds);
        assert_eq!(dst, [10.5f32, -0.25, -1.0, 0.5]);
    }

    #[test]
    fn test_extra_fields_carried_forward() {
        let bounds = Bounds::new(10.0, 10.0);
        let src = [1.0f32, 1.0, 1.0, 1.0, 7.0, -3.5];
        let mut dst = [0.0f32; 6];
        integrate_record(&src, &mut dst, bounds);
        assert_eq!(dst, [2.0f32, 2.0, 1.0, 1.0, 7.0, -3.5]);

        let mut config = seeded(8, 5);
        config.stride = 6;
        let sim = Simulation::init(config).unwrap();
        sim.step_once().unwrap();
        sim.step_once().unwrap();
        sim.poll_frame(|view| {
            assert_eq!(view.stride(), 6);
            assert_eq!(view.len(), 8);
            for index in 0..view.len() {
                let fields = view.fields(index).unwrap();
                assert_eq!(&fields[MIN_STRIDE..], &[0.0f32; 2]);
            }
            assert!(view.fields(8).is_none());
        });
    }

    #[test]
    fn test_parallel_matches_serial() {
        let config = seeded(4096, 9);
        let data = initial_state(&config, &mut StdRng::seed_from_u64(9));
        let mut serial = vec![0.0f32; data.len()];
        let mut parallel = vec![0.0f32; data.len()];
        integrate(&data, &mut serial, config.stride, config.bounds);
        integrate_parallel(&data, &mut parallel, config.stride, config.bounds);
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_parallel_threshold_path() {
        let mut config = seeded(32, 2);
        config.parallel_threshold = 1;
        let parallel = Simulation::init(config.clone()).unwrap();
        config.parallel_threshold = usize::MAX;
        let serial = Simulation::init(config).unwrap();

        for _ in 0..10 {
            parallel.step_once().unwrap();
            serial.step_once().unwrap();
        }
        assert_eq!(snapshot(&parallel), snapshot(&serial));
    }
}

mod frame_tests {
    use super::*;

    #[test]
    fn test_frame_state_settle() {
        let frame = FrameState::new();
        assert!(frame.is_dirty());
        assert!(frame.settle(0));
        assert!(!frame.is_dirty());

        frame.publish(1);
        frame.publish(2);
        assert!(!frame.settle(1));
        assert!(frame.is_dirty());
        assert!(frame.settle(2));
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_poll_without_step_is_idle() {
        let sim = Simulation::init(seeded(10, 1)).unwrap();
        assert!(snapshot(&sim).is_some());

        let consumed = sim.stats().consumed.load(Ordering::SeqCst);
        assert!(!sim.poll_frame(|_| panic!("nothing new to render")));
        assert!(!sim.poll_frame(|_| panic!("nothing new to render")));
        assert_eq!(sim.stats().consumed.load(Ordering::SeqCst), consumed);
        assert_eq!(sim.stats().idle_polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_consumer_jumps_to_latest() {
        let sim = Simulation::init(seeded(10, 1)).unwrap();
        assert_eq!(snapshot(&sim).unwrap().0, 0);

        for _ in 0..3 {
            sim.step_once().unwrap();
        }
        assert_eq!(snapshot(&sim).unwrap().0, 3);

        let stats = sim.stats();
        assert_eq!(stats.steps.load(Ordering::SeqCst), 3);
        assert_eq!(stats.consumed.load(Ordering::SeqCst), 2);
        assert_eq!(stats.dropped.load(Ordering::SeqCst), 2);
        assert!(snapshot(&sim).is_none());
    }

    #[test]
    fn test_view_records() {
        let sim = Simulation::init(seeded(4, 8)).unwrap();
        sim.poll_frame(|view| {
            let records: Vec<_> = view.records().collect();
            assert_eq!(records.len(), 4);
            assert_eq!(view.record(2), Some(records[2]));
            assert_eq!(records[0].position_x, view.as_slice()[POS_X]);
            assert!(view.record(4).is_none());
        });
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_callback_can_replace_itself() {
        let sim = Simulation::init(seeded(4, 1)).unwrap();
        let slot = sim.on_frame.clone();
        let registry = slot.clone();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();

        sim.on_frame(move |_| {
            let counter = counter.clone();
            let next: FrameCallback = Box::new(move |_: FrameView<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            *registry.lock() = Some(next);
        });

        assert!(sim.poll_frame(|view| deliver(&slot, view)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sim.step_once().unwrap();
        assert!(sim.poll_frame(|view| deliver(&slot, view)));
        sim.step_once().unwrap();
        assert!(sim.poll_frame(|view| deliver(&slot, view)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_consumer_thread_survives_reregistration() {
        let mut sim = Simulation::init(seeded(16, 2)).unwrap();
        let registry = sim.on_frame.clone();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();

        sim.on_frame(move |_| {
            let counter = counter.clone();
            let next: FrameCallback = Box::new(move |_: FrameView<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            *registry.lock() = Some(next);
        });

        sim.start().unwrap();
        wait_until(|| hits.load(Ordering::SeqCst) >= 3);
        sim.stop();
    }

    #[test]
    fn test_start_stop_resume() {
        let mut sim = Simulation::init(seeded(50, 4)).unwrap();
        let frames = Arc::new(AtomicU64::new(0));
        let counter = frames.clone();
        sim.on_frame(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sim.start().unwrap();
        sim.start().unwrap();
        assert!(sim.is_running());
        assert!(matches!(sim.step_once(), Err(SimulationError::Running)));
        wait_until(|| sim.generation() >= 5 && frames.load(Ordering::SeqCst) > 0);

        sim.stop();
        sim.stop();
        assert!(!sim.is_running());
        let paused = sim.generation();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(sim.generation(), paused);

        assert_eq!(sim.step_once().unwrap(), paused + 1);

        sim.start().unwrap();
        wait_until(|| sim.generation() > paused + 5);
        sim.stop();
        assert_eq!(sim.stats().steps.load(Ordering::SeqCst), sim.generation());
    }

    #[test]
    fn test_consumer_never_goes_backwards() {
        let mut sim = Simulation::init(seeded(200, 6)).unwrap();
        let last = Arc::new(AtomicU64::new(0));
        let seen = last.clone();
        sim.on_frame(move |view| {
            let previous = seen.swap(view.generation(), Ordering::SeqCst);
            assert!(view.generation() >= previous);
        });
        sim.start().unwrap();
        wait_until(|| sim.stats().consumed.load(Ordering::SeqCst) >= 5);
        sim.stop();

        let stats = sim.stats();
        let consumed = stats.consumed.load(Ordering::SeqCst);
        let dropped = stats.dropped.load(Ordering::SeqCst);
        assert_eq!(consumed + dropped, last.load(Ordering::SeqCst) + 1);
    }
}

proptest! {
    #[test]
    fn prop_record_reflects(
        px in 0.0f32..=50.0,
        py in 0.0f32..=50.0,
        vx in -5.0f32..=5.0,
        vy in -5.0f32..=5.0,
    ) {
        let bounds = Bounds::new(50.0, 50.0);
        let src = [px, py, vx, vy];
        let mut dst = [0.0f32; 4];
        integrate_record(&src, &mut dst, bounds);

        let x = px + vx;
        let y = py + vy;
        prop_assert_eq!(dst[POS_X], x);
        prop_assert_eq!(dst[POS_Y], y);
        prop_assert_eq!(dst[VEL_X].abs(), vx.abs());
        prop_assert_eq!(dst[VEL_Y].abs(), vy.abs());
        if (0.0..=50.0).contains(&x) {
            prop_assert_eq!(dst[VEL_X], vx);
        } else {
            prop_assert_eq!(dst[VEL_X], -vx);
        }
        if (0.0..=50.0).contains(&y) {
            prop_assert_eq!(dst[VEL_Y], vy);
        } else {
            prop_assert_eq!(dst[VEL_Y], -vy);
        }
    }
}
