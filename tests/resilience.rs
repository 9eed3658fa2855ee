//! Unary resilience through the fully composed client: bounded retries,
//! the eligibility gate, header idempotence and the cumulative deadline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tower::service_fn;
use tower_cache::{
    CacheClient, ClientConfig, ClientError, ConfigBuilder, ErrorKind, EventStream, Operation,
    StreamTransport, SubscribeRequest, UnaryRequest, UnaryResponse,
};

struct NoStreams;

#[async_trait]
impl StreamTransport for NoStreams {
    async fn open_stream(&self, _request: &SubscribeRequest) -> Result<EventStream, Status> {
        Err(Status::unimplemented("unary only"))
    }
}

/// Transport that fails with `fail_with` for the first `failures` calls and
/// records the metadata of every call it sees.
#[derive(Clone)]
struct FlakyTransport {
    calls: Arc<AtomicU32>,
    headers: Arc<Mutex<Vec<MetadataMap>>>,
}

impl FlakyTransport {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            headers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn client(&self, config: ClientConfig, failures: u32, fail_with: Code) -> CacheClient {
        let calls = self.calls.clone();
        let headers = self.headers.clone();
        let transport = service_fn(move |req: UnaryRequest| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            headers.lock().unwrap().push(req.options.headers.clone());
            async move {
                if n <= failures {
                    Err(ClientError::from(Status::new(fail_with, format!("attempt {n}"))))
                } else {
                    Ok(UnaryResponse::new(req.payload))
                }
            }
        });
        CacheClient::builder(config)
            .build(transport, Arc::new(NoStreams))
            .unwrap()
    }
}

fn config(max_attempts: u32) -> ClientConfig {
    ConfigBuilder::new()
        .max_attempts(max_attempts)
        .retry_delay(Duration::from_millis(1))
        .build()
        .unwrap()
}

#[tokio::test]
async fn persistent_transient_failure_is_attempted_exactly_max_times() {
    for max in [1, 2, 5] {
        let transport = FlakyTransport::new();
        let client = transport.client(config(max), u32::MAX, Code::Unavailable);
        let err = client
            .execute(UnaryRequest::new("cache", Operation::Get, "k"))
            .await
            .unwrap_err();

        assert_eq!(transport.calls(), max);
        // the surfaced failure is the last attempt's, not the first
        let status = err.status().unwrap();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), format!("attempt {max}"));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}

#[tokio::test]
async fn transient_failure_recovers_within_budget() {
    let transport = FlakyTransport::new();
    let client = transport.client(config(3), 2, Code::Internal);
    let resp = client
        .execute(UnaryRequest::new("cache", Operation::Set, "value"))
        .await
        .unwrap();
    assert_eq!(&resp.payload[..], b"value");
    assert_eq!(transport.calls(), 3);
}

fn slow_retry_config() -> ClientConfig {
    ConfigBuilder::new()
        .max_attempts(5)
        .retry_delay(Duration::from_secs(1))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn non_idempotent_operation_is_never_replayed() {
    for op in [Operation::Increment, Operation::SetIfNotExists, Operation::ListPushBack] {
        let transport = FlakyTransport::new();
        let client = transport.client(slow_retry_config(), u32::MAX, Code::Unavailable);
        let started = tokio::time::Instant::now();
        let err = client
            .execute(UnaryRequest::new("cache", op, "k"))
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 1, "{op} was replayed");
        assert_eq!(err.status().unwrap().code(), Code::Unavailable);
        // no backoff delay was slept
        assert_eq!(started.elapsed(), Duration::ZERO, "{op} waited before giving up");
    }
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_never_replayed() {
    for code in [
        Code::NotFound,
        Code::InvalidArgument,
        Code::PermissionDenied,
        Code::AlreadyExists,
        Code::Cancelled,
        Code::DeadlineExceeded,
    ] {
        let transport = FlakyTransport::new();
        let client = transport.client(slow_retry_config(), u32::MAX, code);
        let started = tokio::time::Instant::now();
        let err = client
            .execute(UnaryRequest::new("cache", Operation::Get, "k"))
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 1, "{code:?} was replayed");
        assert_eq!(err.status().unwrap().code(), code);
        assert_eq!(started.elapsed(), Duration::ZERO, "{code:?} waited before giving up");
    }
}

#[tokio::test]
async fn send_once_headers_ride_only_the_first_attempt() {
    let transport = FlakyTransport::new();
    let client = transport.client(config(4), 2, Code::Unavailable);

    client
        .execute(UnaryRequest::new("orders", Operation::Get, "k"))
        .await
        .unwrap();
    client
        .execute(UnaryRequest::new("orders", Operation::Get, "k"))
        .await
        .unwrap();

    let seen = transport.headers.lock().unwrap();
    // three attempts for the first call, one for the second
    assert_eq!(seen.len(), 4);

    let with_agent = seen.iter().filter(|h| h.get("agent").is_some()).count();
    let with_runtime = seen.iter().filter(|h| h.get("runtime-version").is_some()).count();
    assert_eq!(with_agent, 1);
    assert_eq!(with_runtime, 1);
    assert!(seen[0].get("agent").is_some());

    for headers in seen.iter() {
        assert_eq!(headers.get("cache").unwrap(), "orders");
    }
    assert!(client.sent_connection_headers());
}

#[tokio::test]
async fn clones_share_the_connection_headers() {
    let transport = FlakyTransport::new();
    let client = transport.client(config(1), 0, Code::Ok);
    let other = client.clone();

    client
        .execute(UnaryRequest::new("c", Operation::Get, "k"))
        .await
        .unwrap();
    other
        .execute(UnaryRequest::new("c", Operation::Get, "k"))
        .await
        .unwrap();

    let seen = transport.headers.lock().unwrap();
    assert!(seen[0].get("agent").is_some());
    assert!(seen[1].get("agent").is_none());
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_the_sum_of_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    // every attempt takes 40ms and fails transiently
    let transport = service_fn(move |_req: UnaryRequest| {
        seen.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Err::<UnaryResponse, ClientError>(Status::unavailable("node draining").into())
        }
    });
    let config = ConfigBuilder::new()
        .max_attempts(100)
        .retry_delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let client = CacheClient::builder(config)
        .build(transport, Arc::new(NoStreams))
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = client
        .execute(UnaryRequest::new("cache", Operation::Get, "k").with_timeout(Duration::from_millis(120)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    // attempts start at 0, 50 and 100ms; the third is cut off at 120ms
    assert!(matches!(err, ClientError::DeadlineExceeded { attempts: 3, .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::ClientLocal);
    // the failure of the attempt before the cut-off is kept
    let last = err.status().expect("last failure attached");
    assert_eq!(last.code(), Code::Unavailable);
    assert_eq!(last.message(), "node draining");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(elapsed <= Duration::from_millis(121), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn deadline_covers_waiting_for_admission() {
    let transport = service_fn(|_req: UnaryRequest| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, ClientError>(UnaryResponse::default())
    });
    let config = ConfigBuilder::new()
        .max_concurrent_requests(1)
        .default_deadline(None)
        .build()
        .unwrap();
    let client = CacheClient::builder(config)
        .build(transport, Arc::new(NoStreams))
        .unwrap();

    // occupies the only ticket
    let hog = tokio::spawn(client.execute(UnaryRequest::new("cache", Operation::Get, "k")));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(client.limiter().outstanding(), 1);

    let err = client
        .execute(UnaryRequest::new("cache", Operation::Get, "k").with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::DeadlineExceeded {
            attempts: 0,
            last_status: None
        }
    ));

    hog.abort();
    let _ = hog.await;
    assert_eq!(client.limiter().outstanding(), 0);
}
