// End-to-end pipeline behaviour driven by the scripted source and engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use argus::inference::ViewKind;
use argus::pipeline::SlotState;
use argus::sim::{ScriptedEngine, ScriptedSource};
use argus::{
    CameraConfig, CameraId, Config, FrameSource, IngressPolicy, Pipeline, PipelineConfig,
    PipelineError, PipelineState, PixelFormat, PoolPolicy, PullOutcome, SyncOutcome,
};

const A: CameraId = CameraId(0);
const B: CameraId = CameraId(1);

fn camera(device: &str, buffers: u32) -> CameraConfig {
    CameraConfig {
        device: device.into(),
        width: 16,
        height: 8,
        format: PixelFormat::Gray8,
        buffer_count: buffers,
        ..Default::default()
    }
}

fn config(cameras: usize, buffers: u32, pipeline: PipelineConfig) -> Config {
    Config {
        cameras: (0..cameras)
            .map(|i| camera(&format!("sim{i}"), buffers))
            .collect(),
        pipeline,
        ..Default::default()
    }
}

fn boxed(source: ScriptedSource) -> Box<dyn FrameSource> {
    Box::new(source)
}

fn stamps(ms: &[u64]) -> ScriptedSource {
    ScriptedSource::from_timestamps(ms.iter().map(|&m| Duration::from_millis(m)))
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

fn pull_ids(pipeline: &Pipeline, camera: CameraId, count: usize) -> Vec<u64> {
    (0..count)
        .map_while(|_| {
            pipeline
                .pull_next_result(camera, Duration::from_secs(5))
                .ok()
                .and_then(PullOutcome::ready)
                .map(|r| r.frame_id)
        })
        .collect()
}

fn running(config: Config, engine: ScriptedEngine, sources: Vec<Box<dyn FrameSource>>) -> Pipeline {
    let pipeline = Pipeline::new(config, Arc::new(engine));
    pipeline.initialize(sources).unwrap();
    pipeline.start().unwrap();
    pipeline
}

// ===== Lifecycle =====

#[test]
fn lifecycle_transitions() {
    let pipeline = Pipeline::new(config(1, 4, PipelineConfig::default()), Arc::new(ScriptedEngine::new()));
    assert_eq!(pipeline.state(), PipelineState::Created);
    assert!(matches!(
        pipeline.start(),
        Err(PipelineError::InvalidState { required: PipelineState::Initialized, .. })
    ));

    let (source, _gate) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    pipeline.initialize(vec![boxed(source)]).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Initialized);
    assert!(pipeline.initialize(Vec::new()).is_err());

    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(pipeline.start().is_err());
}

#[test]
fn initialize_rejects_invalid_config() {
    let mut cfg = config(1, 4, PipelineConfig::default());
    cfg.cameras.clear();
    let pipeline = Pipeline::new(cfg, Arc::new(ScriptedEngine::new()));
    assert!(matches!(
        pipeline.initialize(Vec::new()),
        Err(PipelineError::ConfigInvalid(_))
    ));
    assert_eq!(pipeline.state(), PipelineState::Created);
}

#[test]
fn initialize_rejects_source_count_mismatch() {
    let pipeline = Pipeline::new(config(2, 4, PipelineConfig::default()), Arc::new(ScriptedEngine::new()));
    let result = pipeline.initialize(vec![boxed(stamps(&[0]))]);
    assert!(matches!(result, Err(PipelineError::ConfigInvalid(_))));
    assert!(pipeline.stats(A).is_none());
}

#[test]
fn initialize_reports_unavailable_source() {
    let pipeline = Pipeline::new(config(2, 4, PipelineConfig::default()), Arc::new(ScriptedEngine::new()));
    let sources = vec![
        boxed(stamps(&[0])),
        boxed(stamps(&[0]).failing_open()),
    ];
    match pipeline.initialize(sources) {
        Err(PipelineError::SourceUnavailable { camera, .. }) => assert_eq!(camera, B),
        other => panic!("expected SourceUnavailable, got {other:?}"),
    }
    assert_eq!(pipeline.state(), PipelineState::Created);
}

#[test]
fn queries_before_initialize_are_inert() {
    let pipeline = Pipeline::new(config(1, 4, PipelineConfig::default()), Arc::new(ScriptedEngine::new()));
    assert!(pipeline.pull_next_result(A, Duration::ZERO).is_err());
    assert!(pipeline.register_callback(|_| {}).is_err());
    assert!(pipeline.frame_rate(A).is_none());
    assert!(pipeline.last_error(A).is_none());
    assert_eq!(pipeline.in_flight(), 0);
    assert!(pipeline.ingress_stats().is_none());
    assert!(!pipeline.is_zero_copy_supported(A));
}

#[test]
fn stop_unblocks_pullers() {
    let (source, _gate) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let pipeline = Arc::new(running(
        config(1, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(source)],
    ));

    let puller = {
        let pipeline = pipeline.clone();
        thread::spawn(move || pipeline.pull_next_result(A, Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(30));
    pipeline.stop();

    assert!(matches!(puller.join().unwrap(), Ok(PullOutcome::Stopped)));
    assert!(matches!(
        pipeline.pull_synchronized(Duration::ZERO, Duration::from_secs(1)),
        Ok(SyncOutcome::Stopped)
    ));
}

#[test]
fn extraction_finishing_during_stop_is_not_delivered() {
    let (source, gate) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let pipeline = running(
        config(1, 4, PipelineConfig {
            worker_count: 1,
            ..Default::default()
        }),
        ScriptedEngine::new().with_latency(Duration::from_millis(200)),
        vec![boxed(source)],
    );

    gate.release(1);
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.pool_snapshot(A).unwrap()[0].state == SlotState::Leased
    }));
    pipeline.stop();

    assert!(matches!(
        pipeline.pull_next_result(A, Duration::from_millis(50)),
        Ok(PullOutcome::Stopped)
    ));
    let stats = pipeline.stats(A).unwrap();
    assert_eq!(stats.extracted, 0);
    assert_eq!(stats.dropped_shutdown, 1);
    assert_eq!(pipeline.outstanding_slots(), 0);
}

#[test]
fn unknown_camera_is_rejected() {
    let pipeline = running(
        config(1, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(stamps(&[]))],
    );
    assert!(matches!(
        pipeline.pull_next_result(CameraId(7), Duration::ZERO),
        Err(PipelineError::UnknownCamera(CameraId(7)))
    ));
    assert!(pipeline.stats(CameraId(7)).is_none());
}

// ===== Ordering =====

#[test]
fn single_worker_preserves_capture_order() {
    let pipeline_cfg = PipelineConfig {
        worker_count: 1,
        ingress_capacity: 16,
        ..Default::default()
    };
    let source = ScriptedSource::periodic(Duration::from_millis(33)).with_limit(10);
    let pipeline = running(
        config(1, 12, pipeline_cfg),
        ScriptedEngine::new().with_latency(Duration::from_millis(5)),
        vec![boxed(source)],
    );

    assert_eq!(pull_ids(&pipeline, A, 10), (0..10).collect::<Vec<_>>());
    let stats = pipeline.stats(A).unwrap();
    assert_eq!(stats.extracted, 10);
    assert_eq!(stats.dropped(), 0);
}

#[test]
fn many_workers_deliver_each_frame_once() {
    let pipeline_cfg = PipelineConfig {
        worker_count: 4,
        ingress_capacity: 32,
        result_queue_depth: 32,
        ..Default::default()
    };
    let source = ScriptedSource::periodic(Duration::from_millis(33)).with_limit(20);
    let engine =
        ScriptedEngine::new().with_latency_fn(|call| Duration::from_millis((call * 7) % 5 + 1));
    let pipeline = running(config(1, 24, pipeline_cfg), engine, vec![boxed(source)]);

    let mut ids = pull_ids(&pipeline, A, 20);
    assert_eq!(ids.len(), 20);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
    assert!(matches!(
        pipeline.pull_next_result(A, Duration::from_millis(20)),
        Ok(PullOutcome::TimedOut)
    ));
}

// ===== Backpressure =====

#[test]
fn overproduction_drops_oldest_without_leaking() {
    const QUEUE: usize = 2;
    const WORKERS: usize = 1;
    const FRAMES: u64 = 150;

    let pipeline_cfg = PipelineConfig {
        worker_count: WORKERS,
        ingress_capacity: QUEUE,
        ingress_policy: IngressPolicy::DropOldest,
        ..Default::default()
    };
    let source = ScriptedSource::periodic(Duration::from_millis(1))
        .with_pacing(Duration::from_millis(1))
        .with_limit(FRAMES);
    let pipeline = running(
        config(1, 8, pipeline_cfg),
        ScriptedEngine::new().with_latency(Duration::from_millis(5)),
        vec![boxed(source)],
    );

    let mut last_dropped = 0;
    let settled = wait_until(Duration::from_secs(20), || {
        assert!(pipeline.in_flight() <= QUEUE + WORKERS);
        let stats = pipeline.stats(A).unwrap();
        assert!(stats.dropped() >= last_dropped);
        last_dropped = stats.dropped();
        stats.captured == FRAMES
            && stats.extracted + stats.failed + stats.dropped() == stats.captured
    });
    assert!(settled);

    pipeline.stop();
    let stats = pipeline.stats(A).unwrap();
    assert!(stats.dropped_ingress > 0);
    assert_eq!(pipeline.outstanding_slots(), 0);
    assert!(pipeline
        .pool_snapshot(A)
        .unwrap()
        .iter()
        .all(|slot| slot.state == SlotState::Free && slot.lease_count == 0));
}

#[test]
fn evicted_frame_is_charged_to_its_own_camera() {
    let pipeline_cfg = PipelineConfig {
        worker_count: 1,
        ingress_capacity: 1,
        ingress_policy: IngressPolicy::DropOldest,
        ..Default::default()
    };
    let (source_a, gate_a) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let (source_b, gate_b) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let pipeline = running(
        config(2, 4, pipeline_cfg),
        ScriptedEngine::new().with_latency(Duration::from_millis(300)),
        vec![boxed(source_a), boxed(source_b)],
    );

    // A0 goes to the worker, A1 waits in the queue.
    gate_a.release(1);
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats(A).unwrap().captured == 1 && pipeline.ingress_stats().unwrap().popped == 1
    }));
    gate_a.release(1);
    assert!(wait_until(Duration::from_secs(5), || pipeline.ingress_stats().unwrap().pushed == 2));

    // B0 pushes A1 out.
    gate_b.release(1);
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats(A).unwrap().dropped_ingress == 1
    }));
    assert_eq!(pipeline.ingress_stats().unwrap().evicted, 1);
    assert_eq!(pipeline.stats(B).unwrap().dropped_ingress, 0);

    pipeline.stop();
    for camera in [A, B] {
        let stats = pipeline.stats(camera).unwrap();
        assert_eq!(stats.extracted + stats.failed + stats.dropped(), stats.captured);
    }
    assert_eq!(pipeline.outstanding_slots(), 0);
}

#[test]
fn single_buffer_block_policy_stalls_until_release() {
    let pipeline_cfg = PipelineConfig {
        worker_count: 1,
        pool_policy: PoolPolicy::Block,
        ..Default::default()
    };
    let (source, gate) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let pipeline = running(
        config(1, 1, pipeline_cfg),
        ScriptedEngine::new().with_latency(Duration::from_millis(150)),
        vec![boxed(source)],
    );

    gate.release(1);
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.pool_snapshot(A).unwrap()[0].state == SlotState::Leased
    }));
    gate.release(1);
    thread::sleep(Duration::from_millis(30));

    // Second capture is waiting for the only slot; the lease is untouched.
    let slot = pipeline.pool_snapshot(A).unwrap()[0];
    assert_eq!(slot.state, SlotState::Leased);
    assert_eq!(slot.frame_id, Some(0));
    assert_eq!(pipeline.stats(A).unwrap().captured, 2);

    assert_eq!(pull_ids(&pipeline, A, 2), vec![0, 1]);
    assert_eq!(pipeline.stats(A).unwrap().dropped(), 0);
    pipeline.stop();
    assert_eq!(pipeline.outstanding_slots(), 0);
}

#[test]
fn single_buffer_drop_policy_keeps_original_lease() {
    let pipeline_cfg = PipelineConfig {
        worker_count: 1,
        pool_policy: PoolPolicy::DropOldestUnconsumed,
        ..Default::default()
    };
    let (source, gate) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let pipeline = running(
        config(1, 1, pipeline_cfg),
        ScriptedEngine::new().with_latency(Duration::from_millis(150)),
        vec![boxed(source)],
    );

    gate.release(1);
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.pool_snapshot(A).unwrap()[0].state == SlotState::Leased
    }));
    gate.release(1);
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats(A).unwrap().dropped_pool == 1
    }));

    let result = pipeline
        .pull_next_result(A, Duration::from_secs(5))
        .unwrap()
        .ready()
        .unwrap();
    assert_eq!(result.frame_id, 0);
    assert!(result.is_success());
    assert!(matches!(
        pipeline.pull_next_result(A, Duration::from_millis(50)),
        Ok(PullOutcome::TimedOut)
    ));

    pipeline.stop();
    assert_eq!(pipeline.outstanding_slots(), 0);
}

// ===== Failures and delivery =====

#[test]
fn inference_failure_is_recorded_and_pipeline_continues() {
    let pipeline_cfg = PipelineConfig {
        worker_count: 1,
        ..Default::default()
    };
    let source = ScriptedSource::periodic(Duration::from_millis(33)).with_limit(5);
    let pipeline = running(
        config(1, 8, pipeline_cfg),
        ScriptedEngine::new().failing_when(|call| call == 2),
        vec![boxed(source)],
    );

    let results: Vec<_> = (0..5)
        .filter_map(|_| {
            pipeline
                .pull_next_result(A, Duration::from_secs(5))
                .ok()
                .and_then(PullOutcome::ready)
        })
        .collect();
    assert_eq!(results.len(), 5);

    let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].frame_id, 2);
    assert_eq!(failed[0].error_code(), Some(3));

    let stats = pipeline.stats(A).unwrap();
    assert_eq!((stats.extracted, stats.failed), (4, 1));
    assert!(pipeline
        .last_error(A)
        .is_some_and(|e| e.contains("frame 2") && e.contains("npu timeout")));
}

#[test]
fn capture_errors_surface_as_last_error() {
    let source = ScriptedSource::periodic(Duration::from_millis(33))
        .with_read_errors(2)
        .with_limit(1);
    let pipeline = running(
        config(1, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(source)],
    );

    assert_eq!(pull_ids(&pipeline, A, 1), vec![0]);
    assert!(pipeline
        .last_error(A)
        .is_some_and(|e| e.contains("scripted read failure")));
}

#[test]
fn callbacks_and_pulls_see_the_same_results() {
    let (source, gate) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let pipeline = Pipeline::new(config(1, 8, PipelineConfig::default()), Arc::new(ScriptedEngine::new()));
    pipeline.initialize(vec![boxed(source)]).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let id = pipeline
        .register_callback(move |result| {
            assert!(result.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    pipeline.start().unwrap();

    gate.release(6);
    let mut ids = pull_ids(&pipeline, A, 6);
    ids.sort_unstable();
    assert_eq!(ids, (0..6).collect::<Vec<_>>());
    assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 6));

    assert!(pipeline.unregister_callback(id));
    gate.release(1);
    assert_eq!(pull_ids(&pipeline, A, 1), vec![6]);
    assert_eq!(seen.load(Ordering::SeqCst), 6);
}

#[test]
fn frame_rate_reported_while_running() {
    let source = ScriptedSource::periodic(Duration::from_millis(10))
        .with_pacing(Duration::from_millis(10));
    let pipeline = running(
        config(1, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(source)],
    );

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats(A).unwrap().extracted >= 10
    }));
    let rate = pipeline.frame_rate(A).unwrap();
    assert!(rate > 10.0 && rate < 500.0, "rate {rate}");
}

// ===== Zero-copy =====

#[test]
fn zero_copy_follows_capability_and_toggle() {
    let mut cfg = config(2, 4, PipelineConfig::default());
    cfg.cameras[0].zero_copy = true;
    cfg.cameras[1].zero_copy = true;

    let (dma_source, gate) = ScriptedSource::periodic(Duration::from_millis(33))
        .with_dma_export()
        .gated();
    let (plain_source, _plain_gate) = ScriptedSource::periodic(Duration::from_millis(33)).gated();
    let pipeline = running(
        cfg,
        ScriptedEngine::new().with_dma_support(),
        vec![boxed(dma_source), boxed(plain_source)],
    );

    assert!(pipeline.is_zero_copy_supported(A));
    assert!(!pipeline.is_zero_copy_supported(B));

    gate.release(1);
    let first = pipeline.pull_next_result(A, Duration::from_secs(5)).unwrap().ready().unwrap();
    assert_eq!(first.path, ViewKind::Dma);

    pipeline.enable_zero_copy(false);
    gate.release(1);
    let second = pipeline.pull_next_result(A, Duration::from_secs(5)).unwrap().ready().unwrap();
    assert_eq!(second.path, ViewKind::Mapped);

    let stats = pipeline.stats(A).unwrap();
    assert_eq!((stats.zero_copy_frames, stats.mapped_frames), (1, 1));
}

#[test]
fn padded_rows_fall_back_to_one_copy() {
    let source = ScriptedSource::periodic(Duration::from_millis(33))
        .with_row_padding(16)
        .with_limit(2);
    let pipeline = running(
        config(1, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(source)],
    );

    assert_eq!(pull_ids(&pipeline, A, 2).len(), 2);
    assert_eq!(pipeline.stats(A).unwrap().fallback_copies, 2);
}

// ===== Synchronization =====

#[test]
fn two_cameras_synchronize_within_tolerance() {
    let pipeline_cfg = PipelineConfig {
        worker_count: 3,
        ..Default::default()
    };
    let pipeline = running(
        config(2, 4, pipeline_cfg),
        ScriptedEngine::new().with_latency_fn(|call| Duration::from_millis(call % 3)),
        vec![boxed(stamps(&[0, 33, 66])), boxed(stamps(&[5, 38, 71]))],
    );

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats(A).unwrap().extracted == 3 && pipeline.stats(B).unwrap().extracted == 3
    }));

    let tolerance = Duration::from_millis(10);
    let sets: Vec<Vec<u64>> = std::iter::from_fn(|| pipeline.try_synchronized(tolerance).unwrap())
        .map(|set| {
            set.results
                .iter()
                .map(|r| r.timestamp.as_millis() as u64)
                .collect()
        })
        .collect();
    assert_eq!(sets, vec![vec![0, 5], vec![33, 38], vec![66, 71]]);
}

#[test]
fn consumer_polling_during_capture_keeps_every_pair() {
    const FRAMES: usize = 20;
    let pipeline_cfg = PipelineConfig {
        worker_count: 4,
        ingress_capacity: 64,
        sync_buffer_depth: 64,
        ..Default::default()
    };
    let a: Vec<u64> = (0..FRAMES as u64).map(|f| f * 33).collect();
    let b: Vec<u64> = a.iter().map(|ms| ms + 5).collect();
    let pipeline = running(
        config(2, 48, pipeline_cfg),
        ScriptedEngine::new().with_latency_fn(|call| Duration::from_millis((call * 7) % 11)),
        vec![boxed(stamps(&a)), boxed(stamps(&b))],
    );

    let tolerance = Duration::from_millis(10);
    let mut pairs = Vec::new();
    while pairs.len() < FRAMES {
        match pipeline.pull_synchronized(tolerance, Duration::from_secs(5)).unwrap() {
            SyncOutcome::Complete(set) => {
                pairs.push((set.results[0].frame_id, set.results[1].frame_id))
            }
            other => panic!("expected a complete set, got {other:?}"),
        }
    }
    assert!(pairs.iter().all(|(a, b)| a == b));
    assert_eq!(pipeline.sync_discards(), 0);
}

#[test]
fn zero_tolerance_matches_exact_timestamps_only() {
    let pipeline = running(
        config(2, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(stamps(&[0, 10])), boxed(stamps(&[5, 10]))],
    );
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats(A).unwrap().extracted == 2 && pipeline.stats(B).unwrap().extracted == 2
    }));

    match pipeline.pull_synchronized(Duration::ZERO, Duration::from_millis(100)).unwrap() {
        SyncOutcome::Complete(set) => {
            assert_eq!(set.reference, Duration::from_millis(10));
            assert_eq!(set.spread(), Duration::ZERO);
        }
        other => panic!("expected a complete set, got {other:?}"),
    }
    assert!(pipeline.try_synchronized(Duration::ZERO).unwrap().is_none());
}

#[test]
fn missing_camera_yields_partial_set() {
    let pipeline = running(
        config(2, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(stamps(&[40])), boxed(stamps(&[]))],
    );
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.stats(A).unwrap().extracted == 1
    }));

    match pipeline
        .pull_synchronized(Duration::from_millis(5), Duration::from_millis(30))
        .unwrap()
    {
        SyncOutcome::Partial(partial) => {
            assert_eq!(partial.reference, Duration::from_millis(40));
            assert_eq!(partial.missing(), vec![B]);
        }
        other => panic!("expected a partial set, got {other:?}"),
    }
}

#[tokio::test]
async fn async_pull_receives_results() {
    let pipeline = running(
        config(1, 4, PipelineConfig::default()),
        ScriptedEngine::new(),
        vec![boxed(stamps(&[0, 33]))],
    );

    let first = pipeline
        .next_result_async(A, Duration::from_secs(5))
        .await
        .unwrap()
        .ready()
        .unwrap();
    assert_eq!(first.frame_id, 0);
}
