//! Behavior of the data source constructors and combinators: per-request
//! fan-out, batch-size capping, and source union.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use gather::{
    cache::Cache,
    error::Fault,
    query::Query,
    request::{CompletedRequestMap, Request},
    source::{combine, make, make_batched, DataSource, DataSourceExt, EitherRequest, EitherValue},
};
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GetName(u32);

impl Request for GetName {
    type Value = String;
    type Error = String;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GetSquare(u32);

impl Request for GetSquare {
    type Value = u64;
    type Error = String;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GetCube(u32);

impl Request for GetCube {
    type Value = u64;
    type Error = String;
}

#[tokio::test]
async fn batch_n_splits_oversized_batches_sequentially() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let source = Arc::new(
        make_batched("NameDataSource", {
            let sizes = Arc::clone(&sizes);
            move |requests: Vec<GetName>| {
                let sizes = Arc::clone(&sizes);
                async move {
                    sizes.lock().push(requests.len());
                    let mut completed = CompletedRequestMap::new();
                    for request in requests {
                        let name = request.0.to_string();
                        completed.insert(request, Ok(name));
                    }
                    Ok(completed)
                }
            }
        })
        .batch_n(10),
    );
    assert_eq!(source.name(), "NameDataSource.batchN(10)");

    let names = Query::for_each_par(1..=26, |id| {
        Query::from_request(GetName(id), Arc::clone(&source))
    })
    .run()
    .await
    .unwrap();

    assert_eq!(names.len(), 26);
    assert_eq!(names[25], "26");
    assert_eq!(*sizes.lock(), vec![10, 10, 6]);
}

#[tokio::test]
async fn batch_n_passes_small_batches_through() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let source = Arc::new(
        make_batched("NameDataSource", {
            let sizes = Arc::clone(&sizes);
            move |requests: Vec<GetName>| {
                let sizes = Arc::clone(&sizes);
                async move {
                    sizes.lock().push(requests.len());
                    let mut completed = CompletedRequestMap::new();
                    for request in requests {
                        let name = request.0.to_string();
                        completed.insert(request, Ok(name));
                    }
                    Ok(completed)
                }
            }
        })
        .batch_n(10),
    );

    let names = Query::for_each_par(1..=3, |id| {
        Query::from_request(GetName(id), Arc::clone(&source))
    })
    .run()
    .await
    .unwrap();

    assert_eq!(names, vec!["1", "2", "3"]);
    assert_eq!(*sizes.lock(), vec![3]);
}

#[tokio::test]
async fn make_fans_a_batch_out_per_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(make("ParityDataSource", {
        let calls = Arc::clone(&calls);
        move |request: GetName| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Simulate a slow per-request backend; concurrent fan-out
                // keeps the batch wall time at one request's latency.
                tokio::time::sleep(Duration::from_millis(1)).await;
                if request.0 % 2 == 0 {
                    Ok(request.0.to_string())
                } else {
                    Err("odd".to_string())
                }
            }
        }
    }));

    let even = Query::from_request(GetName(2), Arc::clone(&source))
        .run()
        .await
        .unwrap();
    assert_eq!(even, "2");

    // A per-request failure fails only its own request.
    let odd = Query::from_request(GetName(3), Arc::clone(&source))
        .zip_par(Query::from_request(GetName(4), Arc::clone(&source)))
        .run()
        .await
        .unwrap_err();
    assert_eq!(odd, Fault::Error("odd".to_string()));

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn whole_batch_failure_fails_and_caches_every_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(make_batched("DownDataSource", {
        let calls = Arc::clone(&calls);
        move |_requests: Vec<GetName>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("backend down".to_string())
            }
        }
    }));
    let cache = Cache::new();

    let faults = Query::for_each_par(vec![1, 2], |id| {
        Query::from_request(GetName(id), Arc::clone(&source))
    })
    .run_with(&cache)
    .await
    .unwrap_err();
    assert_eq!(faults, Fault::Error("backend down".to_string()));

    // The failure is cached: a later run never reaches the source.
    let again = Query::from_request(GetName(1), Arc::clone(&source))
        .run_with(&cache)
        .await
        .unwrap_err();
    assert_eq!(again, Fault::Error("backend down".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn combine_partitions_batches_between_sources() {
    let square_calls = Arc::new(AtomicUsize::new(0));
    let cube_calls = Arc::new(AtomicUsize::new(0));

    let squares = make_batched("SquareDataSource", {
        let calls = Arc::clone(&square_calls);
        move |requests: Vec<GetSquare>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut completed = CompletedRequestMap::new();
                for request in requests {
                    let value = u64::from(request.0) * u64::from(request.0);
                    completed.insert(request, Ok(value));
                }
                Ok(completed)
            }
        }
    });
    let cubes = make_batched("CubeDataSource", {
        let calls = Arc::clone(&cube_calls);
        move |requests: Vec<GetCube>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut completed = CompletedRequestMap::new();
                for request in requests {
                    let value = u64::from(request.0) * u64::from(request.0) * u64::from(request.0);
                    completed.insert(request, Ok(value));
                }
                Ok(completed)
            }
        }
    });

    let source = Arc::new(combine(squares, cubes));
    assert_eq!(source.name(), "SquareDataSource+CubeDataSource");

    let values = Query::collect_all_par([
        Query::from_request(EitherRequest::Left(GetSquare(3)), Arc::clone(&source)),
        Query::from_request(EitherRequest::Right(GetCube(2)), Arc::clone(&source)),
        Query::from_request(EitherRequest::Left(GetSquare(4)), Arc::clone(&source)),
    ])
    .run()
    .await
    .unwrap();

    assert_eq!(
        values,
        vec![
            EitherValue::Left(9),
            EitherValue::Right(8),
            EitherValue::Left(16),
        ]
    );
    // One combined batch, partitioned into one call per side.
    assert_eq!(square_calls.load(Ordering::SeqCst), 1);
    assert_eq!(cube_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn combine_with_one_empty_side_skips_the_idle_source() {
    let cube_calls = Arc::new(AtomicUsize::new(0));

    let squares = make_batched("SquareDataSource", |requests: Vec<GetSquare>| async move {
        let mut completed = CompletedRequestMap::new();
        for request in requests {
            let value = u64::from(request.0) * u64::from(request.0);
            completed.insert(request, Ok(value));
        }
        Ok(completed)
    });
    let cubes = make_batched("CubeDataSource", {
        let calls = Arc::clone(&cube_calls);
        move |requests: Vec<GetCube>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut completed = CompletedRequestMap::new();
                for request in requests {
                    completed.insert(request, Ok(0));
                }
                Ok(completed)
            }
        }
    });

    let source = Arc::new(combine(squares, cubes));
    let value = Query::from_request(EitherRequest::Left(GetSquare(5)), Arc::clone(&source))
        .run()
        .await
        .unwrap();

    assert_eq!(value, EitherValue::Left(25));
    assert_eq!(cube_calls.load(Ordering::SeqCst), 0);
}
