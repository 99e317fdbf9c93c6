//! Lifecycle of `BatchCursorStream` against the counting fake.

mod common;

use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use common::{FakeSource, FakeState, wait_until};
use eventia_core::ReadMode;
use eventia_sqlite::{BatchCursorStream, Statement, StorageError};
use futures::StreamExt;
use proptest::prelude::*;

fn stream(state: FakeState, batch_size: usize) -> (FakeSource, BatchCursorStream<FakeSource>) {
    let source = FakeSource::new(state);
    let stream = BatchCursorStream::new(
        source.clone(),
        Statement::new("SELECT * FROM Events WHERE 1=1 ORDER BY position ASC"),
        batch_size,
        ReadMode::Historical,
    )
    .unwrap();
    (source, stream)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn yields_all_rows_then_cleans_up(batch_size in 1_usize..9, rows in 0_i64..40) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (source, mut stream) = stream(FakeState::with_rows(rows), batch_size);
            let mut seen = Vec::new();
            while let Some(row) = stream.next_row().await {
                seen.push(row.unwrap());
            }

            assert_eq!(seen, (1..=rows).collect::<Vec<_>>());
            assert_eq!(source.state.closed(), 1);
            assert_eq!(source.state.released(), 1);
            // Every full batch triggers one more read; the short one ends it.
            let full_batches = usize::try_from(rows).unwrap() / batch_size;
            assert_eq!(source.state.reads(), full_batches + 1);
            assert!(source.state.max_reads_in_flight.load(Ordering::SeqCst) <= 1);
        });
    }
}

#[tokio::test]
async fn exact_multiple_needs_one_empty_read() {
    let (source, mut stream) = stream(FakeState::with_rows(6), 3);
    let mut count = 0;
    while let Some(row) = stream.next_row().await {
        let _ = row.unwrap();
        count += 1;
    }
    assert_eq!(count, 6);
    assert_eq!(source.state.reads(), 3);
    assert_eq!(source.state.closed(), 1);
}

#[tokio::test]
async fn nothing_acquired_before_first_pull() {
    let (source, mut stream) = stream(FakeState::with_rows(3), 2);
    assert_eq!(source.state.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(stream.next_row().await.unwrap().unwrap(), 1);
    assert_eq!(source.state.acquired.load(Ordering::SeqCst), 1);
    stream.close().await.unwrap();
}

#[tokio::test]
async fn prefetch_stays_one_batch_ahead() {
    let (source, mut stream) = stream(FakeState::with_rows(100), 5);
    for expected in 1..=5 {
        assert_eq!(stream.next_row().await.unwrap().unwrap(), expected);
    }
    assert!(source.state.reads() <= 2);
    stream.close().await.unwrap();
}

#[tokio::test]
async fn early_drop_tears_down_once() {
    let (source, mut stream) = stream(FakeState::with_rows(20), 4);
    for _ in 0..3 {
        let _ = stream.next_row().await.unwrap().unwrap();
    }
    drop(stream);

    let state = source.state.clone();
    wait_until(|| state.released() == 1).await;
    assert_eq!(source.state.closed(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(source.state.released(), 1);
    assert_eq!(source.state.closed(), 1);
}

#[tokio::test]
async fn dropping_boxed_stream_tears_down() {
    let (source, stream) = stream(FakeState::with_rows(50), 10);
    let first: Vec<_> = stream.into_stream().take(12).collect().await;
    assert_eq!(first.len(), 12);

    let state = source.state.clone();
    wait_until(|| state.released() == 1).await;
    assert_eq!(source.state.closed(), 1);
}

#[test]
fn runtime_shutdown_releases_held_stream_once() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let source = FakeSource::new(FakeState::with_rows(100));
    let (pulled, first_row) = tokio::sync::oneshot::channel();

    let held = source.clone();
    let _ = runtime.spawn(async move {
        let mut stream = BatchCursorStream::new(
            held,
            Statement::new("SELECT * FROM Events WHERE 1=1 ORDER BY position ASC"),
            5,
            ReadMode::Historical,
        )
        .unwrap();
        let _ = stream.next_row().await.unwrap().unwrap();
        let _ = pulled.send(());
        std::future::pending::<()>().await;
    });
    runtime.block_on(first_row).unwrap();
    drop(runtime);

    assert_eq!(source.state.released(), 1);
}

#[tokio::test]
async fn explicit_close_is_idempotent() {
    let (source, mut stream) = stream(FakeState::with_rows(20), 4);
    let _ = stream.next_row().await.unwrap().unwrap();
    stream.close().await.unwrap();
    stream.close().await.unwrap();
    assert!(stream.next_row().await.is_none());
    assert_eq!(source.state.closed(), 1);
    assert_eq!(source.state.released(), 1);
}

#[tokio::test]
async fn close_before_first_pull_touches_nothing() {
    let (source, mut stream) = stream(FakeState::with_rows(5), 2);
    stream.close().await.unwrap();
    assert!(stream.next_row().await.is_none());
    assert_eq!(source.state.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(source.state.released(), 0);
}

#[tokio::test]
async fn prefetch_error_reaches_consumer_after_cleanup() {
    let state = FakeState {
        fail_read_on: Some(2),
        ..FakeState::with_rows(10)
    };
    let (source, mut stream) = stream(state, 3);

    for expected in 1..=3 {
        assert_eq!(stream.next_row().await.unwrap().unwrap(), expected);
    }
    let err = stream.next_row().await.unwrap().unwrap_err();
    assert!(err.is_database_error());
    assert!(stream.next_row().await.is_none());
    assert_eq!(source.state.closed(), 1);
    assert_eq!(source.state.released(), 1);
}

#[tokio::test]
async fn first_read_error_is_returned() {
    let state = FakeState {
        fail_read_on: Some(1),
        ..FakeState::with_rows(10)
    };
    let (source, mut stream) = stream(state, 3);
    assert!(stream.next_row().await.unwrap().is_err());
    assert!(stream.next_row().await.is_none());
    assert_eq!(source.state.closed(), 1);
    assert_eq!(source.state.released(), 1);
}

#[tokio::test]
async fn read_error_wins_over_close_error() {
    let state = FakeState {
        fail_read_on: Some(1),
        fail_close: true,
        ..FakeState::with_rows(10)
    };
    let (source, mut stream) = stream(state, 3);
    let err = stream.next_row().await.unwrap().unwrap_err();
    assert!(err.to_string().contains("injected read failure"));
    assert_eq!(source.state.released(), 1);
}

#[tokio::test]
async fn close_error_surfaces_after_last_rows() {
    let state = FakeState {
        fail_close: true,
        ..FakeState::with_rows(2)
    };
    let (source, mut stream) = stream(state, 5);
    assert_eq!(stream.next_row().await.unwrap().unwrap(), 1);
    assert_eq!(stream.next_row().await.unwrap().unwrap(), 2);
    let err = stream.next_row().await.unwrap().unwrap_err();
    assert!(err.to_string().contains("injected close failure"));
    assert!(stream.next_row().await.is_none());
    assert_eq!(source.state.released(), 1);
}

#[test]
fn live_mode_rejected_without_io() {
    let source = FakeSource::new(FakeState::with_rows(1));
    let err = BatchCursorStream::new(
        source.clone(),
        Statement::new("SELECT 1"),
        10,
        ReadMode::Live,
    )
    .err()
    .unwrap();
    assert_matches!(err, StorageError::UnsupportedMode(_));
    assert_eq!(source.state.acquired.load(Ordering::SeqCst), 0);
}
