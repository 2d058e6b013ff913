//! Integration tests for sequence batching through ModelScheduler.

mod common;

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use common::*;
use nano_batch::{
    Backend, BackendError, Batch, BatchKind, EchoBackend, InputConfig, ModelScheduler, Outcome,
    RequestError, SequenceFlags,
};

#[test]
fn test_sequence_order_and_slot_release() {
    init_tracing();
    let gate = Gate::new();
    let backend = Arc::new(RecordingBackend::new().holding(gate.clone(), &[3]));
    let scheduler = ModelScheduler::start(sequence_config(1, false), backend.clone()).unwrap();

    let mut receivers = Vec::new();
    for (id, flags) in [
        (1, SequenceFlags::START),
        (2, SequenceFlags::NONE),
        (3, SequenceFlags::END),
    ] {
        let (req, rx) = seq_request(id, 500, flags);
        scheduler.submit(req).unwrap();
        receivers.push(rx);
    }
    assert!(recv(&receivers[0]).is_ok());
    assert!(recv(&receivers[1]).is_ok());
    gate.wait_entered(1);

    // END is still executing, so the only slot is not free yet.
    let (other, rx_other) = seq_request(10, 600, SequenceFlags::START);
    assert_eq!(scheduler.submit(other), Err(RequestError::NoAvailableSlot));
    assert_eq!(recv(&rx_other).unwrap_err(), RequestError::NoAvailableSlot);

    gate.open();
    assert!(recv(&receivers[2]).is_ok());
    assert_eq!(backend.executed_ids(), vec![1, 2, 3]);

    let (next, rx_next) = seq_request(11, 600, SequenceFlags::START_END);
    scheduler.submit(next).unwrap();
    assert!(recv(&rx_next).is_ok());
}

#[test]
fn test_interleaved_sequences_keep_their_order() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new());
    let scheduler = ModelScheduler::start(sequence_config(2, true), backend.clone()).unwrap();

    let mut receivers = Vec::new();
    for step in 0..4u64 {
        for corr in [100u64, 200] {
            let flags = SequenceFlags {
                start: step == 0,
                end: step == 3,
            };
            let (req, rx) = seq_request(corr + step, corr, flags);
            scheduler.submit(req).unwrap();
            receivers.push(rx);
        }
    }
    for rx in &receivers {
        assert!(recv(rx).is_ok());
    }

    let executed = backend.executed_ids();
    for corr in [100u64, 200] {
        let mine: Vec<_> = executed
            .iter()
            .copied()
            .filter(|id| (corr..corr + 4).contains(id))
            .collect();
        assert_eq!(mine, vec![corr, corr + 1, corr + 2, corr + 3]);
    }
    assert!(backend.batches().iter().all(|b| b.len == 2));
}

#[test]
fn test_continuation_without_start_is_not_found() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new());
    let scheduler = ModelScheduler::start(sequence_config(1, false), backend.clone()).unwrap();

    let (req, rx) = seq_request(1, 42, SequenceFlags::NONE);
    assert_eq!(
        scheduler.submit(req),
        Err(RequestError::SequenceNotFound(42))
    );
    assert_eq!(recv(&rx).unwrap_err().code(), "SEQUENCE_NOT_FOUND");

    // No slot was allocated: the single slot is still available.
    let (start, rx_start) = seq_request(2, 43, SequenceFlags::START_END);
    scheduler.submit(start).unwrap();
    assert!(recv(&rx_start).is_ok());
    assert_eq!(backend.executed_ids(), vec![2]);
}

#[test]
fn test_control_signals_per_slot() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new());
    let scheduler = ModelScheduler::start(sequence_config(2, true), backend.clone()).unwrap();

    let (req, rx) = seq_request(1, 7, SequenceFlags::START_END);
    scheduler.submit(req).unwrap();
    assert!(recv(&rx).is_ok());

    let batches = backend.batches();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.kind, BatchKind::Sequence);
    assert_eq!(batch.len, 2);
    assert_eq!(batch.controls.len(), 2);
    let slot0 = batch.controls[0];
    assert!(slot0.start && slot0.end && slot0.ready);
    assert_eq!(slot0.correlation_id, Some(7));
    let slot1 = batch.controls[1];
    assert!(!slot1.ready && !slot1.start && !slot1.end);
    assert_eq!(slot1.correlation_id, None);
}

#[test]
fn test_blocking_start_waits_for_slot() {
    init_tracing();
    let gate = Gate::new();
    let backend = Arc::new(RecordingBackend::new().holding(gate.clone(), &[1]));
    let scheduler = ModelScheduler::start(sequence_config(1, true), backend.clone()).unwrap();

    let (first, rx_first) = seq_request(1, 1, SequenceFlags::START_END);
    scheduler.submit(first).unwrap();
    gate.wait_entered(1);

    let (second, rx_second) = seq_request(2, 2, SequenceFlags::START);
    let (second_end, rx_second_end) = seq_request(3, 2, SequenceFlags::END);
    scheduler.submit(second).unwrap();
    scheduler.submit(second_end).unwrap();
    assert_eq!(scheduler.num_pending(), 2);

    gate.open();
    assert!(recv(&rx_first).is_ok());
    assert!(recv(&rx_second).is_ok());
    assert!(recv(&rx_second_end).is_ok());
    assert_eq!(backend.executed_ids(), vec![1, 2, 3]);
}

#[test]
fn test_stateless_request_rejected_by_sequence_model() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new());
    let scheduler = ModelScheduler::start(sequence_config(1, true), backend).unwrap();

    let (req, rx) = request(1);
    assert!(matches!(
        scheduler.submit(req),
        Err(RequestError::InvalidRequest(_))
    ));
    assert!(matches!(recv(&rx), Err(RequestError::InvalidRequest(_))));
}

#[test]
fn test_backend_error_does_not_leak_slot() {
    init_tracing();
    let backend = Arc::new(RecordingBackend::new().failing("bad step"));
    let scheduler = ModelScheduler::start(sequence_config(1, false), backend).unwrap();

    for corr in [1u64, 2] {
        let (req, rx) = seq_request(corr, corr, SequenceFlags::START_END);
        scheduler.submit(req).unwrap();
        assert_eq!(
            recv(&rx).unwrap_err(),
            RequestError::BackendExecution("bad step".into())
        );
    }
}

#[test]
fn test_invalid_input_fails_without_taking_a_slot() {
    init_tracing();
    let mut config = sequence_config(1, false);
    config.inputs = vec![InputConfig {
        name: "x".into(),
        dims: vec![3],
    }];
    let stacked = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&stacked);
    let backend = move |_instance: usize, batch: &Batch| -> Result<Vec<Outcome>, BackendError> {
        seen.lock().push(batch.stacked_input("x")?.dims().to_vec());
        EchoBackend.execute(0, batch)
    };
    let scheduler = ModelScheduler::start(config, Arc::new(backend)).unwrap();

    let (bad, rx_bad) = seq_request(1, 20, SequenceFlags::START_END);
    assert!(matches!(
        scheduler.submit(bad.with_input("x", vector(4, 1.0))),
        Err(RequestError::InvalidRequest(_))
    ));
    assert!(matches!(recv(&rx_bad), Err(RequestError::InvalidRequest(_))));

    // The only slot is still free for a well-formed sequence.
    let (start, rx_start) = seq_request(2, 10, SequenceFlags::START);
    scheduler.submit(start.with_input("x", vector(3, 1.0))).unwrap();
    assert!(recv(&rx_start).is_ok());

    let (missing, rx_missing) = seq_request(3, 10, SequenceFlags::NONE);
    assert!(matches!(
        scheduler.submit(missing),
        Err(RequestError::InvalidRequest(_))
    ));
    assert!(matches!(recv(&rx_missing), Err(RequestError::InvalidRequest(_))));

    let (end, rx_end) = seq_request(4, 10, SequenceFlags::END);
    scheduler.submit(end.with_input("x", vector(3, 2.0))).unwrap();
    assert!(recv(&rx_end).is_ok());
    assert_eq!(*stacked.lock(), vec![vec![1, 3], vec![1, 3]]);
}

#[test]
fn test_sequences_spread_across_instances() {
    init_tracing();
    let mut config = sequence_config(1, true);
    config.instance_count = 2;
    let gate = Gate::new();
    let backend = Arc::new(RecordingBackend::new().holding(gate.clone(), &[1]));
    let scheduler = ModelScheduler::start(config, backend.clone()).unwrap();

    let (first, rx_first) = seq_request(1, 100, SequenceFlags::START_END);
    scheduler.submit(first).unwrap();
    gate.wait_entered(1);

    let (second, rx_second) = seq_request(2, 200, SequenceFlags::START);
    scheduler.submit(second).unwrap();
    assert!(recv(&rx_second).is_ok());

    // Both instances hold a sequence, so the next one waits.
    let (third, rx_third) = seq_request(3, 300, SequenceFlags::START_END);
    scheduler.submit(third).unwrap();
    assert_eq!(scheduler.num_pending(), 1);

    gate.open();
    assert!(recv(&rx_first).is_ok());
    assert!(recv(&rx_third).is_ok());

    let batches = backend.batches();
    let instance_of = |id: u64| {
        batches
            .iter()
            .find(|batch| batch.request_ids.contains(&id))
            .map(|batch| batch.instance)
    };
    assert_eq!(instance_of(1), Some(0));
    assert_eq!(instance_of(2), Some(1));
    assert_eq!(instance_of(3), Some(0));
}

#[test]
fn test_producer_threads_keep_sequence_order() {
    init_tracing();
    let gate = Gate::new();
    let backend = Arc::new(RecordingBackend::new().holding(gate.clone(), &[1]));
    let scheduler = ModelScheduler::start(sequence_config(1, true), backend.clone()).unwrap();

    // Each step comes from its own thread, one after another.
    let receivers: Vec<_> = thread::scope(|scope| {
        [
            (1, SequenceFlags::START),
            (2, SequenceFlags::NONE),
            (3, SequenceFlags::END),
        ]
        .into_iter()
        .map(|(id, flags)| {
            let scheduler = &scheduler;
            scope
                .spawn(move || {
                    let (req, rx) = seq_request(id, 77, flags);
                    scheduler.submit(req).map(|()| rx)
                })
                .join()
                .unwrap()
                .unwrap()
        })
        .collect()
    });

    gate.wait_entered(1);
    gate.open();
    for rx in &receivers {
        assert!(recv(rx).is_ok());
    }
    assert_eq!(backend.executed_ids(), vec![1, 2, 3]);
}

#[test]
fn test_timeout_while_previous_request_runs() {
    init_tracing();
    let mut config = sequence_config(1, true);
    config.instance_count = 2;
    if let Some(sb) = config.sequence_batching.as_mut() {
        sb.queue_policy.timeout_micros = 20_000;
    }
    let gate = Gate::new();
    let backend = Arc::new(RecordingBackend::new().holding(gate.clone(), &[1]));
    let scheduler = ModelScheduler::start(config, backend.clone()).unwrap();

    let (first, rx_first) = seq_request(1, 7, SequenceFlags::START);
    scheduler.submit(first).unwrap();
    gate.wait_entered(1);

    // Fails at its deadline while request 1 still occupies the slot.
    let (second, rx_second) = seq_request(2, 7, SequenceFlags::NONE);
    scheduler.submit(second).unwrap();
    assert_eq!(recv(&rx_second).unwrap_err(), RequestError::SequenceTimeout(7));

    let (third, rx_third) = seq_request(3, 7, SequenceFlags::END);
    assert_eq!(scheduler.submit(third), Err(RequestError::SequenceTimeout(7)));
    assert_eq!(recv(&rx_third).unwrap_err(), RequestError::SequenceTimeout(7));

    // The in-flight request still gets its own result.
    gate.open();
    assert!(recv(&rx_first).is_ok());

    let (restart, rx_restart) = seq_request(4, 7, SequenceFlags::START_END);
    scheduler.submit(restart).unwrap();
    assert!(recv(&rx_restart).is_ok());
    assert_eq!(backend.executed_ids(), vec![1, 4]);
}
