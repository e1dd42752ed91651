//! End-to-end tests of the light pool through the dispatch engine

use docdispatch::prelude::*;
use docdispatch::{CancellationReason, JobState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type ConvertResult = std::result::Result<ConvertedDocument, ConverterError>;

fn config(workers: usize, queue_depth: usize) -> EngineConfig {
    EngineConfig::default()
        .with_light_workers(workers)
        .with_light_queue_depth(queue_depth)
        .with_heavy_workers(1)
        .with_poll_interval(Duration::from_millis(10))
        .with_shutdown_grace(Duration::from_secs(5))
}

fn echo(input: &ConversionInput<'_>, _: &CancellationToken) -> ConvertResult {
    let text = std::str::from_utf8(input.bytes)
        .map_err(|e| ConverterError::corrupt_input(e.to_string()))?;
    Ok(ConvertedDocument::new(text))
}

/// Sleeps `millis`, returning early if cancelled
fn sleeper(millis: u64) -> Arc<dyn Converter> {
    Arc::new(move |_: &ConversionInput<'_>, token: &CancellationToken| -> ConvertResult {
        let deadline = Instant::now() + Duration::from_millis(millis);
        while Instant::now() < deadline {
            token.check()?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(ConvertedDocument::new("done"))
    })
}

/// Returns only once its token is cancelled
fn stuck(input: &ConversionInput<'_>, token: &CancellationToken) -> ConvertResult {
    while !token.is_cancelled() {
        thread::sleep(Duration::from_millis(5));
    }
    Err(ConverterError::other(format!("{} gave up", input.filename)))
}

#[test]
fn test_small_text_document_echoed_on_light_pool() {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = DispatchEngine::new(config(2, 4), Arc::new(echo)).unwrap();

    let text: String = "lorem ipsum dolor sit amet\n".repeat(10 * 1024 / 27 + 1);
    let payload = text.as_bytes()[..10 * 1024].to_vec();
    let expected = String::from_utf8(payload.clone()).unwrap();

    let result = engine.dispatch(payload, "a.txt", None).unwrap();
    assert_eq!(result.text, expected);
    assert_eq!(result.class, ExecutionClass::Light);
    assert!(result.elapsed < Duration::from_secs(5));

    engine.shutdown().unwrap();
}

#[test]
fn test_overload_fails_fast_and_accepted_jobs_finish() {
    let engine = Arc::new(DispatchEngine::new(config(2, 2), sleeper(200)).unwrap());
    let (c, q) = (2, 2);

    let tickets: Vec<_> = (0..10)
        .map(|i| engine.submit(b"x".to_vec(), format!("{i}.txt")))
        .collect();

    let start = Instant::now();
    let overloaded = tickets
        .iter()
        .filter(|t| matches!(t, Err(ConversionError::Overloaded { .. })))
        .count();
    assert_eq!(overloaded, 10 - (c + q));
    // Rejection is immediate, not after waiting for a slot
    assert!(start.elapsed() < Duration::from_millis(100));

    for ticket in tickets.into_iter().flatten() {
        let result = ticket.wait(Duration::from_secs(10));
        assert!(result.is_ok());
    }

    settle(&engine);
    let stats = engine.stats();
    assert_eq!(stats.light.rejected, 6);
    assert_eq!(stats.light.completed, 4);
}

#[test]
fn test_concurrent_dispatch_under_overload() {
    let engine = Arc::new(DispatchEngine::new(config(2, 1), sleeper(100)).unwrap());

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.dispatch(b"x".to_vec(), format!("{i}.txt"), None))
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let overloaded = outcomes
        .iter()
        .filter(|o| matches!(o, Err(ConversionError::Overloaded { .. })))
        .count();
    let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
    assert!(overloaded >= 1);
    assert_eq!(overloaded + succeeded, 12);
}

#[test]
fn test_never_returning_converter_times_out_at_deadline() {
    let engine = DispatchEngine::new(config(1, 1), Arc::new(stuck)).unwrap();
    let timeout = Duration::from_millis(300);

    let start = Instant::now();
    let err = engine
        .dispatch(b"x".to_vec(), "stuck.txt", Some(timeout))
        .unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(
        err,
        ConversionError::Timeout {
            class: ExecutionClass::Light,
            timeout_ms: 300
        }
    ));
    assert!(waited >= timeout, "timed out early after {waited:?}");
    assert!(waited < Duration::from_secs(3));
    assert_eq!(err.http_status(), 504);
}

#[test]
fn test_default_timeout_applies() {
    let engine = DispatchEngine::new(
        config(1, 0).with_default_timeout(Duration::from_millis(150)),
        Arc::new(stuck),
    )
    .unwrap();

    let start = Instant::now();
    let err = engine.dispatch(b"x".to_vec(), "a.txt", None).unwrap_err();
    assert!(matches!(err, ConversionError::Timeout { timeout_ms: 150, .. }));
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[test]
fn test_uncooperative_converter_keeps_slot_until_it_returns() {
    let converter = |_: &ConversionInput<'_>, _: &CancellationToken| -> ConvertResult {
        thread::sleep(Duration::from_millis(400));
        Ok(ConvertedDocument::new("late"))
    };
    let engine = DispatchEngine::new(config(1, 0), Arc::new(converter)).unwrap();

    let err = engine
        .dispatch(b"x".to_vec(), "a.txt", Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, ConversionError::Timeout { .. }));

    // Still converting: the only slot is taken
    let err = engine
        .dispatch(b"x".to_vec(), "b.txt", Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, ConversionError::Overloaded { .. }));

    thread::sleep(Duration::from_millis(600));
    let result = engine
        .dispatch(b"x".to_vec(), "c.txt", Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(result.text, "late");
    assert_eq!(engine.stats().light.timed_out, 1);
}

#[test]
fn test_queued_jobs_that_time_out_free_their_slots() {
    let converter = |_: &ConversionInput<'_>, _: &CancellationToken| -> ConvertResult {
        thread::sleep(Duration::from_millis(800));
        Ok(ConvertedDocument::new("slow"))
    };
    let engine = DispatchEngine::new(config(1, 2), Arc::new(converter)).unwrap();

    let running = engine.submit(b"a".to_vec(), "a.txt").unwrap();
    thread::sleep(Duration::from_millis(50));
    for name in ["b.txt", "c.txt"] {
        let err = engine
            .dispatch(b"x".to_vec(), name, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, ConversionError::Timeout { .. }));
    }

    // The worker is still busy, yet both queue places are usable again
    assert_eq!(engine.stats().light.occupied, 1);
    let d = engine.submit(b"d".to_vec(), "d.txt").unwrap();
    let e = engine.submit(b"e".to_vec(), "e.txt").unwrap();
    assert!(matches!(
        engine.submit(b"f".to_vec(), "f.txt"),
        Err(ConversionError::Overloaded { occupied: 3, capacity: 3, .. })
    ));

    assert_eq!(running.wait(Duration::from_secs(5)).unwrap().text, "slow");
    for ticket in [d, e] {
        assert!(ticket.wait(Duration::from_secs(5)).is_ok());
    }
    settle(&engine);
    assert_eq!(engine.stats().light.timed_out, 2);
}

#[test]
fn test_jobs_start_in_fifo_order() {
    let started = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&started);
    let converter = move |input: &ConversionInput<'_>, _: &CancellationToken| -> ConvertResult {
        record.lock().push(input.filename.to_string());
        thread::sleep(Duration::from_millis(20));
        Ok(ConvertedDocument::new(input.filename))
    };
    let engine = DispatchEngine::new(config(1, 8), Arc::new(converter)).unwrap();

    let names = ["A.txt", "B.txt", "C.txt", "D.txt", "E.txt"];
    let tickets: Vec<_> = names
        .iter()
        .map(|name| engine.submit(b"x".to_vec(), *name).unwrap())
        .collect();
    for ticket in tickets {
        ticket.wait(Duration::from_secs(5)).unwrap();
    }

    assert_eq!(*started.lock(), names);
}

#[test]
fn test_caller_cancellation_is_timeout_equivalent() {
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_cancel);
    let converter = move |_: &ConversionInput<'_>, token: &CancellationToken| -> ConvertResult {
        while !token.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        flag.store(true, Ordering::SeqCst);
        Err(ConverterError::other("cancelled"))
    };
    let engine = DispatchEngine::new(config(1, 0), Arc::new(converter)).unwrap();

    let client = CancellationToken::new();
    let disconnect = client.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        disconnect.cancel_with_reason(CancellationReason::CallerCancelled);
    });

    let start = Instant::now();
    let err = engine
        .dispatch_with_token(b"x".to_vec(), "a.txt", Some(Duration::from_secs(30)), &client)
        .unwrap_err();
    assert!(matches!(err, ConversionError::Timeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(5));
    canceller.join().unwrap();

    // The converter observes the abandonment and returns, freeing the slot
    settle(&engine);
    assert!(saw_cancel.load(Ordering::SeqCst));
}

#[test]
fn test_panic_is_isolated_to_its_job() {
    let converter = |input: &ConversionInput<'_>, token: &CancellationToken| -> ConvertResult {
        if input.filename == "boom.txt" {
            panic!("converter exploded");
        }
        echo(input, token)
    };
    let engine = Arc::new(DispatchEngine::new(config(2, 4), Arc::new(converter)).unwrap());

    let sibling = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.dispatch(b"fine".to_vec(), "ok.txt", None))
    };
    let err = engine.dispatch(b"".to_vec(), "boom.txt", None).unwrap_err();

    match err {
        ConversionError::ConverterFailure { message } => {
            assert!(message.contains("converter exploded"))
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(sibling.join().unwrap().unwrap().text, "fine");
    settle(&engine);

    // The pool keeps serving after the panic
    assert_eq!(
        engine.dispatch(b"again".to_vec(), "x.txt", None).unwrap().text,
        "again"
    );
    assert_eq!(engine.stats().light.panicked, 1);
}

#[test]
fn test_converter_categories_are_mapped() {
    let engine =
        DispatchEngine::new(config(1, 2), Arc::new(PlainTextConverter::new())).unwrap();

    let err = engine
        .dispatch(vec![0xff, 0xfe, 0xfd], "broken.txt", None)
        .unwrap_err();
    assert!(matches!(err, ConversionError::CorruptInput { .. }));
    assert_eq!(err.http_status(), 400);

    let err = engine.dispatch(b"PK".to_vec(), "sheet.xlsx", None).unwrap_err();
    assert!(matches!(err, ConversionError::UnsupportedFormat { .. }));
    assert_eq!(err.http_status(), 415);

    let converter = |_: &ConversionInput<'_>, _: &CancellationToken| -> ConvertResult {
        Err(ConverterError::other("library error"))
    };
    let engine = DispatchEngine::new(config(1, 2), Arc::new(converter)).unwrap();
    let err = engine.dispatch(b"x".to_vec(), "a.txt", None).unwrap_err();
    assert!(matches!(err, ConversionError::ConverterFailure { .. }));
    assert_eq!(err.http_status(), 500);
}

#[test]
fn test_shutdown_drains_in_flight_jobs() {
    let engine = DispatchEngine::new(config(1, 4), sleeper(50)).unwrap();
    let tickets: Vec<_> = (0..5)
        .map(|i| engine.submit(b"x".to_vec(), format!("{i}.txt")).unwrap())
        .collect();

    engine.shutdown().unwrap();

    for ticket in tickets {
        assert_eq!(ticket.wait(Duration::from_secs(1)).unwrap().text, "done");
    }
    assert_eq!(engine.stats().light.completed, 5);
    assert!(matches!(
        engine.dispatch(b"x".to_vec(), "late.txt", None),
        Err(ConversionError::Overloaded { .. })
    ));
}

#[test]
fn test_shutdown_cancels_jobs_after_grace() {
    let engine = DispatchEngine::new(
        config(1, 1).with_shutdown_grace(Duration::from_millis(100)),
        Arc::new(stuck),
    )
    .unwrap();
    let ticket = engine.submit(b"x".to_vec(), "a.txt").unwrap();

    let start = Instant::now();
    engine.shutdown().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));

    assert_eq!(ticket.state(), JobState::TimedOut);
    let err = ticket.wait(Duration::from_secs(10)).unwrap_err();
    assert!(matches!(err, ConversionError::Timeout { .. }));
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn test_every_accepted_job_reaches_a_terminal_state() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let converter = move |input: &ConversionInput<'_>, token: &CancellationToken| -> ConvertResult {
        match counter.fetch_add(1, Ordering::SeqCst) % 3 {
            0 => echo(input, token),
            1 => Err(ConverterError::corrupt_input("bad")),
            _ => {
                thread::sleep(Duration::from_millis(30));
                echo(input, token)
            }
        }
    };
    let engine = DispatchEngine::new(config(3, 3), Arc::new(converter)).unwrap();

    let tickets: Vec<_> = (0..20)
        .filter_map(|i| engine.submit(b"x".to_vec(), format!("{i}.txt")).ok())
        .collect();
    assert_eq!(tickets.len(), 6);

    for ticket in tickets {
        match ticket.wait(Duration::from_secs(5)) {
            Ok(result) => assert_eq!(result.text, "x"),
            Err(e) => assert!(matches!(e, ConversionError::CorruptInput { .. }), "{e:?}"),
        }
    }

    settle(&engine);
    let stats = engine.stats();
    assert_eq!(stats.light.completed + stats.light.failed, 6);
    assert_eq!(stats.light.running, 0);
}

/// Waits for finished jobs to leave the registry and release their slots
fn settle(engine: &DispatchEngine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let stats = engine.stats();
        if engine.in_flight() == 0 && stats.light.occupied == 0 && stats.heavy.occupied == 0 {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("engine did not settle: {} jobs in flight", engine.in_flight());
}

#[cfg(feature = "async")]
#[test]
fn test_dispatch_async() {
    let engine = DispatchEngine::new(config(2, 2), Arc::new(echo)).unwrap();

    let result = tokio_test::block_on(engine.dispatch_async(b"async".to_vec(), "a.txt", None));
    assert_eq!(result.unwrap().text, "async");
}

#[cfg(feature = "async")]
#[test]
fn test_dropped_async_dispatch_abandons_job() {
    let engine = DispatchEngine::new(config(1, 0), Arc::new(stuck)).unwrap();

    let outcome = tokio_test::block_on(tokio::time::timeout(
        Duration::from_millis(100),
        engine.dispatch_async(b"x".to_vec(), "a.txt", Some(Duration::from_secs(30))),
    ));
    assert!(outcome.is_err(), "dispatch should still be pending");

    // The dropped future cancelled the job, so the stuck converter returns
    settle(&engine);
    assert_eq!(engine.stats().light.timed_out, 1);
}
