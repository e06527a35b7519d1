// Integration tests for plugin nodes: graph binding, worker rebuilds and settings

use crossbeam::channel::{self, Receiver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtfx::worker::Deferred;
use rtfx::{
    AudioGraph, EffectKind, FilterState, GraphError, GraphOptions, HostConfig, KernelManager,
    LocalGraph, PipelineType, Plugin, PluginConfig, PluginContext, PluginError, PluginEvent,
    ProcessCycle, Worker,
};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    worker: Worker,
    graph: Arc<LocalGraph>,
    ctx: PluginContext,
    events: Receiver<PluginEvent>,
}

fn fixture_with(options: GraphOptions, config: HostConfig, rate: u32) -> Fixture {
    let dir = TempDir::new().unwrap();
    let worker = Worker::spawn(config.worker_queue).unwrap();
    let graph = Arc::new(LocalGraph::with_options(options).unwrap());
    let kernels = Arc::new(KernelManager::new(dir.path(), Vec::new()));
    let (tx, events) = channel::bounded(256);
    let shared: Arc<dyn AudioGraph> = graph.clone();
    let ctx = PluginContext::new(
        shared,
        worker.handle(),
        kernels,
        PipelineType::Output,
        &config,
    )
    .with_events(tx)
    .with_rate(rate);
    Fixture {
        _dir: dir,
        worker,
        graph,
        ctx,
        events,
    }
}

fn fixture() -> Fixture {
    fixture_with(GraphOptions::default(), HostConfig::default(), 48000)
}

fn create(fx: &Fixture, kind: EffectKind, parameters: serde_json::Value) -> Arc<dyn Plugin> {
    let config = PluginConfig::new(kind.as_str(), parameters);
    kind.instantiate(&config, &fx.ctx).unwrap()
}

/// One silent period to fix the format, then wait for the rebuild
fn make_ready(fx: &Fixture, plugin: &dyn Plugin, period: usize) {
    let silence = vec![0.0; period];
    let mut out_l = vec![0.0; period];
    let mut out_r = vec![0.0; period];
    plugin.process(Some(&silence), Some(&silence), Some(&mut out_l), Some(&mut out_r));
    fx.worker.handle().wait_idle();
    assert!(plugin.is_ready(), "{} not ready", plugin.tag());
}

fn run(plugin: &dyn Plugin, left: &[f32], right: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let mut out_l = vec![0.0; left.len()];
    let mut out_r = vec![0.0; right.len()];
    plugin.process(Some(left), Some(right), Some(&mut out_l), Some(&mut out_r));
    (out_l, out_r)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

fn noise(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-0.5..0.5)).collect()
}

fn energy(x: &[f32]) -> f32 {
    x.iter().map(|v| v * v).sum()
}

// ============================================================================
// Realtime path
// ============================================================================

#[test]
fn test_gain_plugin_after_first_period() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Gain, json!({ "gain_db": -6.0 }));

    // not ready yet: the first period passes through
    let input = vec![1.0; 256];
    let (out_l, _) = run(&*plugin, &input, &input);
    assert_eq!(out_l, input);

    fx.worker.handle().wait_idle();
    assert!(plugin.is_ready());
    let (out_l, out_r) = run(&*plugin, &input, &input);
    for s in out_l.iter().chain(&out_r) {
        assert!((s - 0.501).abs() < 0.001, "sample {}", s);
    }

    let events: Vec<PluginEvent> = fx.events.try_iter().collect();
    assert!(events.contains(&PluginEvent::Ready {
        tag: "gain".to_string()
    }));
}

#[test]
fn test_missing_left_input_matches_silent_left_input() {
    let fx = fixture();
    let params = json!({ "mode": "lowpass", "frequency": 2000.0 });
    let with_none = create(&fx, EffectKind::Filter, params.clone());
    let with_zeros = create(&fx, EffectKind::Filter, params);
    make_ready(&fx, &*with_none, 256);
    make_ready(&fx, &*with_zeros, 256);

    let mut rng = StdRng::seed_from_u64(7);
    let zeros = vec![0.0; 256];
    for _ in 0..8 {
        let right = noise(&mut rng, 256);

        let mut a_l = vec![1.0; 256];
        let mut a_r = vec![1.0; 256];
        with_none.process(None, Some(&right), Some(&mut a_l), Some(&mut a_r));

        let (b_l, b_r) = run(&*with_zeros, &zeros, &right);
        assert_eq!(a_l, b_l);
        assert_eq!(a_r, b_r);
    }
}

#[test]
fn test_missing_outputs_do_not_disturb_later_periods() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Gain, json!({ "gain_db": 0.0 }));
    make_ready(&fx, &*plugin, 128);

    let input = vec![0.25; 128];
    plugin.process(Some(&input), Some(&input), None, None);
    let (out_l, out_r) = run(&*plugin, &input, &input);
    assert_eq!(out_l, input);
    assert_eq!(out_r, input);
}

#[test]
fn test_echo_canceller_uses_probe() {
    let fx = fixture_with(GraphOptions::default(), HostConfig::default(), 16000);
    let plugin = create(&fx, EffectKind::EchoCanceller, json!({}));
    assert!(plugin.has_probe());
    make_ready(&fx, &*plugin, 160);

    let mut rng = StdRng::seed_from_u64(11);
    let mut first = 0.0;
    let mut last = 0.0;
    for period in 0..300 {
        let far = noise(&mut rng, 160);
        let echo: Vec<f32> = far.iter().map(|v| 0.5 * v).collect();
        let mut out_l = vec![0.0; 160];
        let mut out_r = vec![0.0; 160];
        plugin.process_with_probe(
            Some(&echo),
            Some(&echo),
            Some(&mut out_l),
            Some(&mut out_r),
            Some(&far),
            Some(&far),
        );
        if period == 0 {
            first = energy(&out_l);
        }
        if period >= 290 {
            last += energy(&out_l) / 10.0;
        }
    }
    assert!(last < 0.05 * first, "residual {} vs {}", last, first);
}

#[test]
fn test_echo_canceller_without_probe_passes_near_end() {
    let fx = fixture_with(GraphOptions::default(), HostConfig::default(), 16000);
    let plugin = create(&fx, EffectKind::EchoCanceller, json!({}));
    make_ready(&fx, &*plugin, 160);

    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..4 {
        let near = noise(&mut rng, 160);
        let (out_l, out_r) = run(&*plugin, &near, &near);
        assert_eq!(out_l, near);
        assert_eq!(out_r, near);
    }
}

// ============================================================================
// Settings
// ============================================================================

#[test]
fn test_bypass_parameters_and_reset() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Gain, json!({ "gain_db": -6.0 }));
    make_ready(&fx, &*plugin, 64);
    let input = vec![1.0; 64];

    plugin
        .set_parameters(&json!({ "gain_db": -6.0, "bypass": true }))
        .unwrap();
    assert!(plugin.is_bypassed());
    assert_eq!(run(&*plugin, &input, &input).0, input);
    assert_eq!(plugin.parameters()["bypass"], json!(true));

    plugin
        .set_parameters(&json!({ "gain_db": -20.0, "output_gain_db": 20.0 }))
        .unwrap();
    assert!(!plugin.is_bypassed());
    let (out_l, _) = run(&*plugin, &input, &input);
    assert!(out_l.iter().all(|s| (s - 1.0).abs() < 1e-4));

    plugin.reset();
    assert_eq!(plugin.parameters()["gain_db"], json!(0.0));
    assert_eq!(run(&*plugin, &input, &input).0, input);
}

#[test]
fn test_bad_parameters_keep_current_settings() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Gain, json!({ "gain_db": -6.0 }));
    let result = plugin.set_parameters(&json!({ "gain_db": "loud" }));
    assert!(matches!(result, Err(PluginError::Parameters { .. })));
    assert_eq!(plugin.parameters()["gain_db"], json!(-6.0));
}

#[test]
fn test_filter_setting_change_rebuilds_and_stays_ready() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Filter, json!({ "mode": "lowpass" }));
    make_ready(&fx, &*plugin, 256);
    while fx.events.try_recv().is_ok() {}

    plugin
        .set_parameters(&json!({ "mode": "highpass", "frequency": 500.0 }))
        .unwrap();
    assert!(plugin.is_ready());
    fx.worker.handle().wait_idle();
    assert!(plugin.is_ready());
    let events: Vec<PluginEvent> = fx.events.try_iter().collect();
    assert!(events.contains(&PluginEvent::Ready {
        tag: "filter".to_string()
    }));
}

// ============================================================================
// Graph binding
// ============================================================================

#[test]
fn test_connect_activate_disconnect() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Gain, json!({}));
    assert_eq!(plugin.state(), FilterState::Unconnected);
    assert!(plugin.node_id().is_none());

    plugin.connect().unwrap();
    assert!(plugin.node_id().is_some());
    assert!(wait_for(|| plugin.state() == FilterState::Paused));
    let handle = plugin.filter_handle().unwrap();
    assert_eq!(fx.graph.visible_ports(handle), 4);

    // connecting again is a no-op
    plugin.connect().unwrap();
    assert_eq!(plugin.filter_handle(), Some(handle));

    plugin.set_active(true).unwrap();
    assert_eq!(plugin.state(), FilterState::Streaming);

    plugin.disconnect().unwrap();
    assert_eq!(plugin.state(), FilterState::Unconnected);
    assert!(plugin.filter_handle().is_none());
    assert_eq!(fx.graph.filter_count(), 0);
    assert!(matches!(
        plugin.disconnect(),
        Err(GraphError::NotConnected(_))
    ));
}

#[test]
fn test_probe_plugin_registers_six_ports() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::EchoCanceller, json!({}));
    plugin.connect().unwrap();
    let handle = plugin.filter_handle().unwrap();
    assert_eq!(fx.graph.visible_ports(handle), 6);
}

#[test]
fn test_connect_times_out_without_node_id() {
    let options = GraphOptions {
        assign_node_ids: false,
        ..Default::default()
    };
    let config = HostConfig {
        connect_retries: 5,
        connect_retry_interval_ms: 1,
        ..Default::default()
    };
    let fx = fixture_with(options, config, 48000);
    let plugin = create(&fx, EffectKind::Gain, json!({}));

    match plugin.connect() {
        Err(GraphError::ConnectTimeout {
            name,
            ports,
            attempts,
        }) => {
            assert_eq!(name, "gain");
            assert_eq!(ports, 4);
            assert_eq!(attempts, 5);
        }
        other => panic!("expected a connect timeout, got {:?}", other),
    }
    assert!(plugin.filter_handle().is_none());
}

#[test]
fn test_graph_dispatch_only_when_active() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Gain, json!({ "gain_db": -6.0 }));
    plugin.connect().unwrap();
    let handle = plugin.filter_handle().unwrap();

    let input = vec![1.0; 128];
    let mut out_l = vec![0.0; 128];
    let mut out_r = vec![0.0; 128];
    let mut cycle = ProcessCycle::new(48000, &input, &input, &mut out_l, &mut out_r);
    assert!(!fx.graph.dispatch(handle, &mut cycle));

    plugin.set_active(true).unwrap();
    assert!(fx.graph.dispatch(handle, &mut cycle));
    fx.worker.handle().wait_idle();
    assert!(fx.graph.dispatch(handle, &mut cycle));
    drop(cycle);
    assert!(out_l.iter().all(|s| (s - 0.501).abs() < 0.001));
}

#[test]
fn test_latency_is_pushed_to_graph() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::EchoCanceller, json!({}));
    plugin.connect().unwrap();
    plugin.set_active(true).unwrap();
    let handle = plugin.filter_handle().unwrap();
    make_ready(&fx, &*plugin, 256);
    assert!(fx.graph.latency_ns(handle).is_none());

    // 10 ms frames at 48 kHz in 256-sample periods: 480 - gcd(256, 480)
    let input = vec![0.1; 256];
    run(&*plugin, &input, &input);
    fx.worker.handle().wait_idle();

    let expected_ns = 448.0 / 48000.0 * 1e9;
    let ns = fx.graph.latency_ns(handle).unwrap() as f64;
    assert!((ns - expected_ns).abs() < 1000.0, "latency {} ns", ns);
    assert!((plugin.latency_seconds() - 448.0 / 48000.0).abs() < 1e-6);

    let events: Vec<PluginEvent> = fx.events.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        PluginEvent::LatencyChanged { tag, seconds }
            if tag == "echo_canceller" && (seconds - 448.0 / 48000.0).abs() < 1e-6
    )));

    // steady periods announce nothing new
    for _ in 0..10 {
        run(&*plugin, &input, &input);
    }
    fx.worker.handle().wait_idle();
    assert_eq!(fx.graph.params(handle).len(), 1);
}

// ============================================================================
// Worker
// ============================================================================

/// Holds the worker until released
struct Gate {
    open: Receiver<()>,
}

impl Deferred for Gate {
    fn run_deferred(&self) {
        let _ = self.open.recv_timeout(Duration::from_secs(5));
    }
}

struct Idle;

impl Deferred for Idle {
    fn run_deferred(&self) {}
}

#[test]
fn test_worker_skips_destroyed_plugin() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Filter, json!({}));

    let (release, open) = channel::bounded(1);
    let gate = Arc::new(Gate { open });
    let target = Arc::downgrade(&gate) as Weak<dyn Deferred>;
    assert!(fx.worker.handle().submit(target));

    // queues a rebuild behind the gate
    let input = vec![0.0; 256];
    run(&*plugin, &input, &input);
    plugin.shutdown();

    release.send(()).unwrap();
    fx.worker.handle().wait_idle();

    assert!(!plugin.is_ready());
    let events: Vec<PluginEvent> = fx.events.try_iter().collect();
    assert!(
        !events.iter().any(|e| matches!(e, PluginEvent::Ready { .. })),
        "{:?}",
        events
    );
}

#[test]
fn test_dropped_plugin_is_skipped() {
    let fx = fixture();
    let plugin = create(&fx, EffectKind::Gain, json!({}));

    let (release, open) = channel::bounded(1);
    let gate = Arc::new(Gate { open });
    let target = Arc::downgrade(&gate) as Weak<dyn Deferred>;
    assert!(fx.worker.handle().submit(target));

    let input = vec![0.0; 64];
    run(&*plugin, &input, &input);
    drop(plugin);

    release.send(()).unwrap();
    fx.worker.handle().wait_idle();
    assert!(fx.events.try_iter().all(|e| !matches!(e, PluginEvent::Ready { .. })));
}

#[test]
fn test_rebuild_dropped_on_full_queue_is_retried() {
    let config = HostConfig {
        worker_queue: 1,
        ..HostConfig::default()
    };
    let fx = fixture_with(GraphOptions::default(), config, 48000);
    let plugin = create(&fx, EffectKind::Gain, json!({ "gain_db": -6.0 }));

    let (release, open) = channel::bounded(1);
    let gate = Arc::new(Gate { open });
    assert!(fx.worker.handle().submit(Arc::downgrade(&gate) as Weak<dyn Deferred>));
    // succeeds once the gate is running, leaving the queue full
    let idle = Arc::new(Idle);
    assert!(wait_for(|| fx
        .worker
        .handle()
        .submit(Arc::downgrade(&idle) as Weak<dyn Deferred>)));

    let input = vec![1.0; 128];
    let (out_l, _) = run(&*plugin, &input, &input);
    assert_eq!(out_l, input);

    release.send(()).unwrap();
    fx.worker.handle().wait_idle();
    assert!(!plugin.is_ready());

    // the next period posts the rebuild again
    let (out_l, _) = run(&*plugin, &input, &input);
    assert_eq!(out_l, input);
    fx.worker.handle().wait_idle();
    assert!(plugin.is_ready());

    let (out_l, out_r) = run(&*plugin, &input, &input);
    for s in out_l.iter().chain(&out_r) {
        assert!((s - 0.501).abs() < 0.001, "sample {}", s);
    }
}
