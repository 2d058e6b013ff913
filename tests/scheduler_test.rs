//! Integration tests for ModelScheduler lifecycle and failure handling.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use common::*;
use nano_batch::{
    Completion, EchoBackend, Error, InferenceRequest, ModelConfig, ModelScheduler,
    ParameterValue, RequestError, SequenceFlags,
};

#[test]
fn test_invalid_config_is_rejected() {
    init_tracing();
    let config = ModelConfig {
        instance_count: 0,
        ..Default::default()
    };
    let result = ModelScheduler::start(config, Arc::new(EchoBackend));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_ready_until_shutdown() {
    init_tracing();
    let scheduler = ModelScheduler::start(dynamic_config(4, &[], 0), Arc::new(EchoBackend)).unwrap();
    assert!(scheduler.is_ready());
    assert_eq!(scheduler.num_pending(), 0);

    scheduler.shutdown();
    assert!(!scheduler.is_ready());
    // A second call is a no-op.
    scheduler.shutdown();
}

#[test]
fn test_shutdown_fails_queued_requests() {
    init_tracing();
    let gate = Gate::new();
    let backend = Arc::new(RecordingBackend::new().holding(gate.clone(), &[0]));
    let scheduler = ModelScheduler::start(dynamic_config(1, &[], 0), backend.clone()).unwrap();

    let (r0, rx0) = request(0);
    scheduler.submit(r0).unwrap();
    gate.wait_entered(1);
    let (r1, rx1) = request(1);
    let (r2, rx2) = request(2);
    scheduler.submit(r1).unwrap();
    scheduler.submit(r2).unwrap();

    thread::scope(|scope| {
        let stopper = scope.spawn(|| scheduler.shutdown());

        // Queued requests fail while the in-flight batch is still held.
        assert!(matches!(recv(&rx1), Err(RequestError::Unavailable(_))));
        assert!(matches!(recv(&rx2), Err(RequestError::Unavailable(_))));

        let (late, rx_late) = request(3);
        assert!(matches!(
            scheduler.submit(late),
            Err(RequestError::Unavailable(_))
        ));
        assert!(matches!(recv(&rx_late), Err(RequestError::Unavailable(_))));

        gate.open();
        stopper.join().unwrap();
    });

    // The batch already inside the backend finishes normally.
    assert!(recv(&rx0).is_ok());
    assert_eq!(backend.executed_ids(), vec![0]);
    assert_eq!(
        scheduler
            .statistics()
            .failures_for(&RequestError::Unavailable(String::new())),
        3
    );
}

#[test]
fn test_backend_panic_halts_instance() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().panicking_on(1));
    let scheduler = ModelScheduler::start(dynamic_config(1, &[], 0), backend).unwrap();

    let (req, rx) = request(1);
    scheduler.submit(req).unwrap();
    match recv(&rx) {
        Err(RequestError::BackendExecution(message)) => {
            assert!(message.contains("backend panicked"));
            assert!(message.contains("backend crashed on request 1"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    assert!(eventually(|| !scheduler.is_ready()));
    let (next, rx_next) = request(2);
    assert!(matches!(
        scheduler.submit(next),
        Err(RequestError::Unavailable(_))
    ));
    assert!(matches!(recv(&rx_next), Err(RequestError::Unavailable(_))));
}

#[test]
fn test_panic_on_one_instance_leaves_others_serving() {
    init_tracing();
    let mut config = dynamic_config(1, &[], 0);
    config.instance_count = 2;
    let backend = Arc::new(RecordingBackend::new().panicking_on(1));
    let scheduler = ModelScheduler::start(config, backend).unwrap();

    let (bad, rx_bad) = request(1);
    scheduler.submit(bad).unwrap();
    assert!(matches!(recv(&rx_bad), Err(RequestError::BackendExecution(_))));

    assert!(scheduler.is_ready());
    let (good, rx_good) = request(2);
    scheduler.submit(good).unwrap();
    assert!(recv(&rx_good).is_ok());
}

#[test]
fn test_second_instance_runs_while_first_is_busy() {
    init_tracing();
    let mut config = dynamic_config(1, &[], 0);
    config.instance_count = 2;
    let gate = Gate::new();
    let backend = Arc::new(RecordingBackend::new().holding(gate.clone(), &[0]));
    let scheduler = ModelScheduler::start(config, backend.clone()).unwrap();

    let (r0, rx0) = request(0);
    scheduler.submit(r0).unwrap();
    gate.wait_entered(1);

    let (r1, rx1) = request(1);
    scheduler.submit(r1).unwrap();
    assert!(recv(&rx1).is_ok());

    gate.open();
    assert!(recv(&rx0).is_ok());
    let batches = backend.batches();
    assert_eq!(batches.len(), 2);
    assert_ne!(batches[0].instance, batches[1].instance);
}

#[test]
fn test_every_request_completes_exactly_once() {
    init_tracing();
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 50;
    let mut config = dynamic_config(4, &[], 100);
    config.instance_count = 2;
    let scheduler = ModelScheduler::start(config, Arc::new(EchoBackend)).unwrap();
    let counts: Arc<Mutex<HashMap<u64, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let scheduler = &scheduler;
            let counts = &counts;
            scope.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let id = producer * PER_PRODUCER + i;
                    let counts = Arc::clone(counts);
                    let completion = Completion::from_fn(move |result| {
                        assert!(result.is_ok());
                        *counts.lock().entry(id).or_default() += 1;
                    });
                    let input = vector(4, id as f32);
                    scheduler
                        .submit(InferenceRequest::new(id, completion).with_input("INPUT0", input))
                        .unwrap();
                }
            });
        }
    });

    let total = (PRODUCERS * PER_PRODUCER) as usize;
    assert!(eventually(|| counts.lock().len() == total));
    scheduler.shutdown();

    let counts = counts.lock();
    assert_eq!(counts.len(), total);
    assert!(counts.values().all(|&count| count == 1));
    let stats = scheduler.statistics();
    assert_eq!(stats.success_count, total as u64);
    assert_eq!(stats.execution_count, total as u64);
    assert!(stats.batch_sizes.keys().all(|&size| (1..=4).contains(&size)));
}

#[test]
fn test_requested_outputs_are_filtered() {
    init_tracing();
    let scheduler = ModelScheduler::start(dynamic_config(4, &[], 0), Arc::new(EchoBackend)).unwrap();

    let (req, rx) = request(1);
    let req = req
        .with_input("a", vector(2, 1.0))
        .with_input("b", vector(2, 2.0))
        .with_requested_output("b");
    scheduler.submit(req).unwrap();

    let response = recv(&rx).unwrap();
    assert_eq!(response.request_id, 1);
    assert_eq!(response.outputs.len(), 1);
    assert!(response.output("a").is_none());
    let b = response.output("b").unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(b, vec![2.0, 2.0]);
}

#[test]
fn test_sequence_from_parameters() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new());
    let scheduler = ModelScheduler::start(sequence_config(2, true), backend.clone()).unwrap();

    let parameters = HashMap::from([
        ("sequence_id".to_string(), ParameterValue::Int(9)),
        ("sequence_start".to_string(), ParameterValue::Bool(true)),
        ("sequence_end".to_string(), ParameterValue::Int(1)),
    ]);
    let (completion, rx) = Completion::channel();
    let req = InferenceRequest::from_parameters(5, parameters, completion);
    assert_eq!(req.flags(), SequenceFlags::START_END);
    scheduler.submit(req).unwrap();
    assert!(recv(&rx).is_ok());

    let controls = &backend.batches()[0].controls;
    assert_eq!(controls[0].correlation_id, Some(9));
    assert!(controls[0].start && controls[0].end);
}

#[test]
fn test_statistics_track_batches() {
    init_tracing();
    let scheduler = ModelScheduler::start(dynamic_config(4, &[4], 10_000_000), Arc::new(EchoBackend)).unwrap();

    let receivers: Vec<_> = (0..8)
        .map(|id| {
            let (req, rx) = request(id);
            scheduler.submit(req).unwrap();
            rx
        })
        .collect();
    for rx in &receivers {
        assert!(recv(rx).is_ok());
    }

    let stats = scheduler.statistics();
    assert_eq!(stats.success_count, 8);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.batch_count, 2);
    assert_eq!(stats.batch_sizes.get(&4), Some(&2));
    assert!((stats.average_batch_size() - 4.0).abs() < f64::EPSILON);
    assert_eq!(stats.completed(), 8);
}

#[test]
fn test_panicking_callback_keeps_instance_serving() {
    init_tracing();
    let scheduler = ModelScheduler::start(dynamic_config(1, &[], 0), Arc::new(EchoBackend)).unwrap();

    let completion = Completion::from_fn(|_| panic!("client callback failed"));
    scheduler.submit(InferenceRequest::new(1, completion)).unwrap();

    // The single worker survives and serves the next request.
    let (next, rx) = request(2);
    scheduler.submit(next).unwrap();
    assert!(recv(&rx).is_ok());
    assert!(scheduler.is_ready());
    assert_eq!(scheduler.statistics().success_count, 2);
}
