mod support;

use probekit::container::Container;
use probekit::ebpf::attach::AttachTarget;
use probekit::ebpf::collection::{ConstValue, ProgramSpec};
use probekit::ebpf::maps::MapKind;
use probekit::ebpf::{Event, RingBufferPolicy};
use probekit::{ProbekitError, RunContext, Tracer, TracerConfig};
use probekit_common::reserved;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::*;
use tokio::sync::mpsc;

fn config(ring_buffer: RingBufferPolicy) -> TracerConfig {
    TracerConfig {
        ring_buffer,
        ..TracerConfig::default()
    }
}

async fn tracer(harness: &Harness, metadata: &str, config: TracerConfig) -> Tracer {
    Tracer::new(&StaticProvider::new(metadata), harness.environment(), config)
        .await
        .unwrap()
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("handler alive")
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_stream_over_perf_fallback() {
    let harness = Harness::new(streaming_spec(true));
    let mut tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Unavailable)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    tracer.set_event_handler(move |event| {
        let _ = tx.send(event);
    });
    let tracer = Arc::new(tracer);

    harness.kernel.reader.push(record(4026531840, 1), 0);
    harness.kernel.reader.push(record(4026531841, 2), 0);

    let ctx = RunContext::new();
    let run = {
        let tracer = tracer.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { tracer.run(&ctx).await })
    };

    let first = next_event(&mut rx).await;
    let second = next_event(&mut rx).await;
    assert_eq!(first.mntns_id, 4026531840);
    assert_eq!(first.field("state"), Some("OPEN"));
    assert_eq!(second.field("state"), Some("CLOSED"));

    ctx.cancel.cancel();
    run.await.unwrap().unwrap();
    tracer.close();

    let load = harness.kernel.last_load();
    let events = &load.spec.maps["events"];
    assert_eq!(events.kind, MapKind::PerfEventArray);
    assert_eq!((events.key_size, events.value_size), (4, 4));
    let heap = &load.spec.maps[reserved::HEAP_MAP];
    assert_eq!(heap.kind, MapKind::PerCpuArray);
    assert_eq!(heap.value_size, RECORD_SIZE as u32);

    assert_eq!(tracer.metrics().events(probekit::metrics::DeliveryMode::Stream), 2);
}

#[tokio::test]
async fn test_ring_buffer_shrinks_heap_and_skips_lost_samples() {
    let harness = Harness::new(streaming_spec(true));
    let mut tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Available)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    tracer.set_event_handler(move |event| {
        let _ = tx.send(event);
    });
    let tracer = Arc::new(tracer);

    harness.kernel.reader.push(Vec::new(), 3);
    harness.kernel.reader.push(record(7, 1), 0);

    let ctx = RunContext::new();
    let run = {
        let tracer = tracer.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { tracer.run(&ctx).await })
    };

    assert_eq!(next_event(&mut rx).await.mntns_id, 7);
    assert_eq!(tracer.metrics().lost_samples(), 3);

    ctx.cancel.cancel();
    run.await.unwrap().unwrap();
    tracer.close();

    let load = harness.kernel.last_load();
    assert_eq!(load.spec.maps["events"].kind, MapKind::RingBuf);
    let heap = &load.spec.maps[reserved::HEAP_MAP];
    assert_eq!(heap.kind, MapKind::Hash);
    assert_eq!(heap.value_size, 4);
}

#[tokio::test]
async fn test_unmarked_map_is_left_alone() {
    let harness = Harness::new(streaming_spec(false));
    let tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Unavailable)).await;

    let ctx = RunContext::new().with_timeout(Duration::from_millis(10));
    tracer.run(&ctx).await.unwrap();
    tracer.close();

    let load = harness.kernel.last_load();
    assert_eq!(load.spec.maps["events"].kind, MapKind::RingBuf);
    assert_eq!(load.spec.maps[reserved::HEAP_MAP].kind, MapKind::PerCpuArray);
}

#[tokio::test]
async fn test_missing_tracer_map() {
    let mut spec = streaming_spec(true);
    spec.maps.remove("events");
    let harness = Harness::new(spec);
    let tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Available)).await;

    let err = tracer.run(&RunContext::new()).await.unwrap_err();
    assert!(matches!(err, ProbekitError::MapNotFound(_)));
    assert!(harness.kernel.loads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_programs_attach_in_name_order() {
    let harness = Harness::new(streaming_spec(true));
    let tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Available)).await;

    tracer
        .run(&RunContext::new().with_timeout(Duration::from_millis(10)))
        .await
        .unwrap();

    let attached = harness.kernel.attached.lock().unwrap().clone();
    assert_eq!(
        attached,
        vec![
            (
                "trace_close".to_string(),
                AttachTarget::Tracepoint {
                    category: "sock".to_string(),
                    name: "inet_sock_set_state".to_string(),
                }
            ),
            (
                "trace_connect".to_string(),
                AttachTarget::Kprobe {
                    symbol: "tcp_connect".to_string(),
                }
            ),
        ]
    );
    assert!(tracer.plan().is_some());
}

#[tokio::test]
async fn test_only_set_params_are_rewritten() {
    let mut spec = streaming_spec(true);
    add_constant(&mut spec, "targ_pid", 4);
    add_constant(&mut spec, "targ_uid", 4);
    let harness = Harness::new(spec);

    let metadata = tracer_metadata(&[("targ_pid", "pid"), ("targ_uid", "uid")]);
    let mut config = config(RingBufferPolicy::Available);
    config.params.insert("pid".to_string(), "1234".to_string());
    let tracer = tracer(&harness, &metadata, config).await;

    tracer
        .run(&RunContext::new().with_timeout(Duration::from_millis(10)))
        .await
        .unwrap();

    let constants = harness.kernel.last_load().spec.constants;
    assert_eq!(constants["targ_pid"].value, Some(ConstValue::U32(1234)));
    assert_eq!(constants["targ_uid"].value, None);
}

#[tokio::test]
async fn test_param_without_constant_fails_install() {
    let harness = Harness::new(streaming_spec(true));
    let metadata = tracer_metadata(&[("targ_pid", "pid")]);
    let mut config = config(RingBufferPolicy::Available);
    config.params.insert("pid".to_string(), "1234".to_string());
    let tracer = tracer(&harness, &metadata, config).await;

    let err = tracer.run(&RunContext::new()).await.unwrap_err();
    assert!(err.to_string().contains("targ_pid"), "{}", err);
}

#[tokio::test]
async fn test_special_maps_are_replaced() {
    let mut spec = streaming_spec(true);
    spec.add_map(probekit::ebpf::maps::MapSpec::new(reserved::SOCKETS_MAP, MapKind::Hash));
    spec.add_map(probekit::ebpf::maps::MapSpec::new(
        reserved::MNTNS_FILTER_MAP,
        MapKind::Hash,
    ));
    add_constant(&mut spec, reserved::FILTER_BY_MNTNS, 1);
    let harness = Harness::new(spec);

    let mut tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Available)).await;
    tracer.set_mntns_map(Arc::new(FixedMap {
        name: "mntns",
        fd: 7,
    }));
    tracer
        .run(&RunContext::new().with_timeout(Duration::from_millis(10)))
        .await
        .unwrap();
    tracer.close();

    let load = harness.kernel.last_load();
    assert_eq!(
        load.replacements,
        vec![reserved::MNTNS_FILTER_MAP.to_string(), reserved::SOCKETS_MAP.to_string()]
    );
    assert_eq!(
        load.spec.constants[reserved::FILTER_BY_MNTNS].value,
        Some(ConstValue::Bool(true))
    );
    assert!(harness.log.closes().contains(&"close enricher".to_string()));
}

#[tokio::test]
async fn test_enricher_failure_aborts_install() {
    let mut spec = streaming_spec(true);
    spec.add_map(probekit::ebpf::maps::MapSpec::new(reserved::SOCKETS_MAP, MapKind::Hash));
    let harness = Harness::new(spec);

    let tracer = Tracer::new(
        &StaticProvider::new(&tracer_metadata(&[])),
        harness.environment_with_enricher(true),
        config(RingBufferPolicy::Available),
    )
    .await
    .unwrap();

    let err = tracer.run(&RunContext::new()).await.unwrap_err();
    assert!(matches!(err, ProbekitError::SocketEnricherFailed(_)));
    assert!(harness.kernel.loads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_tracepoint_tears_down() {
    let mut spec = streaming_spec(true);
    spec.add_program(ProgramSpec::from_section("trace_bad", "tracepoint/sock"));
    let harness = Harness::new(spec);
    let tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Available)).await;

    let err = tracer.run(&RunContext::new()).await.unwrap_err();
    assert!(matches!(err, ProbekitError::MalformedTracepoint(_)));

    // trace_bad sorts before trace_close, so nothing got attached
    assert_eq!(
        harness.log.closes(),
        vec!["close collection".to_string(), "close reader".to_string()]
    );

    let again = tracer.run(&RunContext::new()).await.unwrap_err();
    assert!(matches!(again, ProbekitError::ConfigError(_)));
}

#[tokio::test]
async fn test_close_while_streaming() {
    let mut spec = streaming_spec(true);
    spec.add_program(ProgramSpec::from_section("filter_dns", "socket1"));
    spec.add_map(probekit::ebpf::maps::MapSpec::new(reserved::SOCKETS_MAP, MapKind::Hash));
    let harness = Harness::new(spec);
    let tracer = Arc::new(
        tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Available)).await,
    );

    let ctx = RunContext::new();
    let run = {
        let tracer = tracer.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { tracer.run(&ctx).await })
    };
    let reader = harness.kernel.reader.clone();
    wait_until(|| reader.reading()).await;

    tracer.close();
    wait_until(|| reader.stopped()).await;

    ctx.cancel.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(
        harness.log.closes(),
        vec![
            "close collection".to_string(),
            "close link trace_close".to_string(),
            "close link trace_connect".to_string(),
            "close reader".to_string(),
            "close enricher".to_string(),
            "close network tracer filter_dns".to_string(),
        ]
    );

    tracer.close();
    assert_eq!(harness.log.closes().len(), 6);
}

#[tokio::test]
async fn test_containers_reach_network_tracers() {
    let mut spec = streaming_spec(true);
    spec.add_program(ProgramSpec::from_section("filter_dns", "socket1"));
    let harness = Harness::new(spec);
    let tracer = tracer(&harness, &tracer_metadata(&[]), config(RingBufferPolicy::Available)).await;

    let container = Container::new("c1", 100, 1);
    tracer.attach_container(container.clone()).unwrap();
    tracer
        .run(&RunContext::new().with_timeout(Duration::from_millis(10)))
        .await
        .unwrap();
    tracer.detach_container(&container).unwrap();

    let created = harness.network_tracers.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(*created[0].programs.lock().unwrap(), vec!["filter_dns".to_string()]);
    assert_eq!(
        *created[0].pids.lock().unwrap(),
        vec![("attach".to_string(), 100), ("detach".to_string(), 100)]
    );
}

fn snapshot_spec() -> probekit::ebpf::CollectionSpec {
    let mut spec = probekit::ebpf::CollectionSpec::new(bytes::Bytes::from_static(b"\x7fELF"));
    spec.add_program(ProgramSpec::from_section("dump_tasks", "iter/task"));
    spec.add_program(ProgramSpec::from_section("dump_tcp", "iter/tcp"));
    spec
}

fn snapshot_harness(gone: &[u32]) -> Harness {
    let mut tcp = record(1, 1);
    tcp.extend(record(2, 1));
    tcp.extend([0u8; 5]);
    let iter_output = BTreeMap::from([
        ("dump_tasks".to_string(), record(9, 2)),
        ("dump_tcp".to_string(), tcp),
    ]);
    let netns = FakeNetns {
        gone: gone.iter().copied().collect(),
        ..FakeNetns::default()
    };
    Harness::with(snapshot_spec(), iter_output, netns)
}

async fn snapshot(harness: &Harness, containers: &[Container]) -> Vec<Event> {
    let mut tracer = tracer(harness, SNAPSHOT_METADATA, config(RingBufferPolicy::Available)).await;
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    tracer.set_event_array_handler(move |events| sink.lock().unwrap().extend(events));

    for container in containers {
        tracer.attach_container(container.clone()).unwrap();
    }
    tracer.run(&RunContext::new()).await.unwrap();
    assert_eq!(tracer.metrics().snapshot_runs(), 1);
    tracer.close();

    let events = delivered.lock().unwrap().clone();
    events
}

#[tokio::test]
async fn test_snapshot_reads_each_netns_once() {
    let harness = snapshot_harness(&[]);
    let containers = [
        Container::new("a", 10, 1),
        Container::new("b", 20, 1),
        Container::new("c", 30, 2),
    ];

    let events = snapshot(&harness, &containers).await;

    assert_eq!(*harness.netns.entered.lock().unwrap(), vec![10, 30]);
    let tags: Vec<_> = events.iter().map(|e| (e.mntns_id, e.netns_id)).collect();
    assert_eq!(
        tags,
        vec![(9, None), (1, Some(1)), (2, Some(1)), (1, Some(2)), (2, Some(2))]
    );
}

#[tokio::test]
async fn test_snapshot_skips_exited_processes() {
    let harness = snapshot_harness(&[10, 30]);
    let containers = [
        Container::new("a", 10, 1),
        Container::new("b", 20, 1),
        Container::new("c", 30, 2),
    ];

    let events = snapshot(&harness, &containers).await;

    assert_eq!(*harness.netns.entered.lock().unwrap(), vec![10, 20, 30]);
    let netns: Vec<_> = events.iter().map(|e| e.netns_id).collect();
    assert_eq!(netns, vec![None, Some(1), Some(1)]);
}

#[tokio::test]
async fn test_snapshot_without_containers() {
    let harness = snapshot_harness(&[]);
    let events = snapshot(&harness, &[]).await;

    assert_eq!(events.len(), 1);
    assert!(harness.netns.entered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_and_snapshot_together() {
    let mut spec = streaming_spec(true);
    spec.add_program(ProgramSpec::from_section("dump_tasks", "iter/task"));
    let iter_output = BTreeMap::from([("dump_tasks".to_string(), record(9, 2))]);
    let harness = Harness::with(spec, iter_output, FakeNetns::default());

    let metadata = format!(
        "{}snapshotters:\n  tasks:\n    structName: event\n",
        tracer_metadata(&[])
    );
    let mut tracer = tracer(&harness, &metadata, config(RingBufferPolicy::Available)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    tracer.set_event_handler(move |event| {
        let _ = tx.send(event);
    });
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    tracer.set_event_array_handler(move |events| sink.lock().unwrap().push(events));

    harness.kernel.reader.push(record(7, 1), 0);
    tracer.run(&RunContext::new()).await.unwrap();

    let streamed = next_event(&mut rx).await;
    assert_eq!(streamed.mntns_id, 7);
    assert_eq!(streamed.field("state"), Some("OPEN"));

    let batches = batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].mntns_id, 9);
    assert_eq!(batches[0][0].field("state"), Some("CLOSED"));

    assert_eq!(harness.kernel.attached.lock().unwrap().len(), 2);

    tracer.close();
    wait_until(|| harness.kernel.reader.stopped()).await;
}
