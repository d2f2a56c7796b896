//! Fire-and-forget HTTP requests on the task pool
//!
//! A caller keeps one `Option<TaskId>` per logical request. Issuing a new
//! request on a handle abandons whatever the handle pointed at before, and
//! [`AsyncHttp::poll`] can be called as often as needed until the result is
//! cleared.

use crate::http::{self, HttpRequest, HttpResponse};
use crate::image::ImageDecoder;
use crate::net::ConnectContext;
use crate::pool::{TaskId, TaskPool, TaskPoll};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs on the task thread after a response arrives; may rewrite it
pub type ResponseHook = dyn Fn(&HttpRequest, &mut HttpResponse) -> Result<()> + Send + Sync;

/// Result of [`AsyncHttp::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncPoll {
    /// No request behind the handle
    Done,
    /// Still running
    Continue,
    /// Finished with a response (any status code)
    Ok(HttpResponse),
    /// Finished without a response
    Error(String),
}

/// Counts live request states so leaks are observable
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owned copy of a request plus its eventual outcome
struct RequestState {
    request: HttpRequest,
    timeout: Duration,
    decode_image: bool,
    outcome: Option<std::result::Result<HttpResponse, String>>,
    _live: LiveGuard,
}

impl RequestState {
    fn run(&mut self, ctx: &ConnectContext, decoder: Option<&dyn ImageDecoder>, hook: Option<&ResponseHook>) {
        let result = http::request(ctx, &self.request, self.timeout).and_then(|mut response| {
            if self.decode_image && response.is_success() && !response.body.is_empty() {
                let decoder = decoder.ok_or_else(|| Error::Config("no image decoder configured".to_string()))?;
                let image = decoder.decode(&response.body)?;
                response.image = Some(image.size());
                response.body = Bytes::from(image.pixels);
            }
            if let Some(hook) = hook {
                hook(&self.request, &mut response)?;
            }
            Ok(response)
        });

        if let Err(e) = &result {
            debug!("Async request to {}{} failed: {}", self.request.host(), self.request.path(), e);
        }
        self.outcome = Some(result.map_err(|e| e.to_string()));
    }
}

/// Async HTTP façade over a lazily created [`TaskPool`]
pub struct AsyncHttp {
    ctx: ConnectContext,
    decoder: Option<Arc<dyn ImageDecoder>>,
    hook: Option<Arc<ResponseHook>>,
    pool: RwLock<Option<TaskPool<RequestState>>>,
    live: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AsyncHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHttp")
            .field("created", &self.is_created())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl AsyncHttp {
    pub fn new(ctx: ConnectContext) -> Self {
        Self {
            ctx,
            decoder: None,
            hook: None,
            pool: RwLock::new(None),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_hook(mut self, hook: Arc<ResponseHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Create the pool with `max_threads` slots unless it already exists
    pub fn create(&self, max_threads: u32) {
        let mut pool = self.pool.write();
        if pool.is_none() {
            info!("Starting async HTTP pool with {} threads", max_threads);
            *pool = Some(TaskPool::new(max_threads).with_metrics(self.ctx.metrics.clone()));
        }
    }

    /// Tear the pool down, waiting for running requests to finish
    pub fn destroy(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            info!("Stopping async HTTP pool");
            pool.shutdown_with(drop);
        }
    }

    pub fn is_created(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Request states not yet freed, running or finished
    pub fn outstanding(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Start `request` in the background and store its id in `handle`
    ///
    /// Any request `handle` already refers to is detached first. Fails with
    /// [`Error::Capacity`] when every slot is busy, leaving `handle` empty.
    pub fn request(
        &self,
        handle: &mut Option<TaskId>,
        request: HttpRequest,
        timeout: Duration,
        decode_image: bool,
    ) -> Result<()> {
        let guard = self.pool.read();
        let pool = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("async HTTP pool not created".to_string()))?;

        if let Some(previous) = handle.take() {
            pool.detach(previous);
        }

        let target = format!("{}{}", request.host(), request.path());
        let state = RequestState {
            request,
            timeout,
            decode_image,
            outcome: None,
            _live: LiveGuard::new(&self.live),
        };

        let ctx = self.ctx.clone();
        let decoder = self.decoder.clone();
        let hook = self.hook.clone();
        let dispatched = pool.dispatch(state, move |state| {
            state.run(&ctx, decoder.as_deref(), hook.as_deref());
        });

        match dispatched {
            Some(id) => {
                *handle = Some(id);
                Ok(())
            }
            None => {
                warn!("Failed to start {}", target);
                Err(Error::Capacity)
            }
        }
    }

    /// Check on the request behind `handle`
    pub fn poll(&self, handle: Option<TaskId>) -> AsyncPoll {
        let guard = self.pool.read();
        let Some(pool) = guard.as_ref() else {
            return AsyncPoll::Error("async HTTP pool not created".to_string());
        };
        let Some(id) = handle else {
            return AsyncPoll::Done;
        };

        match pool.poll(id, |state| state.outcome.clone()) {
            TaskPoll::Running => AsyncPoll::Continue,
            TaskPoll::Completed(Some(Ok(response))) => AsyncPoll::Ok(response),
            TaskPoll::Completed(Some(Err(message))) => AsyncPoll::Error(message),
            TaskPoll::Completed(None) => AsyncPoll::Error("request produced no outcome".to_string()),
            TaskPoll::Idle => AsyncPoll::Done,
        }
    }

    /// Release the request behind `handle` and empty it
    pub fn clear(&self, handle: &mut Option<TaskId>) {
        if let Some(id) = handle.take() {
            if let Some(pool) = self.pool.read().as_ref() {
                pool.detach(id);
            }
        }
    }
}

impl Drop for AsyncHttp {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::http::{build_response_header, read_header, HeaderLines};
    use crate::image::DecodedImage;
    use crate::transport::{TcpTransport, Transport};
    use std::net::TcpListener;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Serve `count` requests, each answered with `body` after `delay`
    fn server(count: usize, body: &'static [u8], delay: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for _ in 0..count {
                let (stream, _) = listener.accept().unwrap();
                std::thread::spawn(move || {
                    let mut tcp = TcpTransport::from_stream(stream).unwrap();
                    if read_header(&mut tcp, 4096, TIMEOUT).is_err() {
                        return;
                    }
                    std::thread::sleep(delay);
                    let mut lines = HeaderLines::new();
                    lines.set_int("Content-Length", body.len() as i64);
                    let _ = tcp.write_all(build_response_header(200, "OK", Some(lines.as_str())).as_bytes());
                    let _ = tcp.write_all(body);
                });
            }
        });
        port
    }

    fn facade() -> AsyncHttp {
        AsyncHttp::new(ConnectContext::new(NetConfig::default()).unwrap())
    }

    fn wait(http: &AsyncHttp, handle: Option<TaskId>) -> AsyncPoll {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match http.poll(handle) {
                AsyncPoll::Continue if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
    }

    fn wait_for_outstanding(http: &AsyncHttp, expected: usize) {
        let deadline = Instant::now() + TIMEOUT;
        while http.outstanding() != expected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(http.outstanding(), expected);
    }

    #[test]
    fn test_request_without_pool() {
        let http = facade();
        let mut handle = None;
        let result = http.request(&mut handle, HttpRequest::new("GET", "127.0.0.1", "/"), TIMEOUT, false);
        assert!(matches!(result, Err(Error::Internal(_))));
        assert!(matches!(http.poll(None), AsyncPoll::Error(_)));
    }

    #[test]
    fn test_request_and_poll() {
        let port = server(1, b"pong", Duration::ZERO);
        let http = facade();
        http.create(2);
        http.create(8);
        assert!(http.is_created());

        let mut handle = None;
        let req = HttpRequest::new("GET", "127.0.0.1", "/ping").with_port(port);
        http.request(&mut handle, req, TIMEOUT, false).unwrap();
        assert!(handle.is_some());

        match wait(&http, handle) {
            AsyncPoll::Ok(response) => {
                assert_eq!(response.status, 200);
                assert_eq!(&response.body[..], b"pong");
            }
            other => panic!("unexpected {:?}", other),
        }

        // Results stay until cleared
        assert!(matches!(http.poll(handle), AsyncPoll::Ok(_)));
        http.clear(&mut handle);
        assert!(handle.is_none());
        assert_eq!(http.poll(handle), AsyncPoll::Done);
        wait_for_outstanding(&http, 0);
    }

    #[test]
    fn test_reissue_frees_previous_state() {
        let port = server(2, b"late", Duration::from_millis(200));
        let http = facade();
        http.create(4);

        let mut handle = None;
        let req = HttpRequest::new("GET", "127.0.0.1", "/").with_port(port);
        http.request(&mut handle, req.clone(), TIMEOUT, false).unwrap();
        let first = handle;
        http.request(&mut handle, req, TIMEOUT, false).unwrap();
        assert_ne!(first, handle);
        assert_eq!(http.poll(first), AsyncPoll::Done);

        assert!(matches!(wait(&http, handle), AsyncPoll::Ok(_)));
        http.clear(&mut handle);
        wait_for_outstanding(&http, 0);
    }

    #[test]
    fn test_capacity_exhausted() {
        let port = server(1, b"", Duration::from_millis(300));
        let http = facade();
        http.create(1);

        let req = HttpRequest::new("GET", "127.0.0.1", "/").with_port(port);
        let mut busy = None;
        http.request(&mut busy, req.clone(), TIMEOUT, false).unwrap();

        let mut rejected = None;
        let result = http.request(&mut rejected, req, TIMEOUT, false);
        assert!(matches!(result, Err(Error::Capacity)));
        assert!(rejected.is_none());
        assert_eq!(http.outstanding(), 1);

        assert!(matches!(wait(&http, busy), AsyncPoll::Ok(_)));
        http.destroy();
        assert!(!http.is_created());
        assert_eq!(http.outstanding(), 0);
    }

    #[test]
    fn test_connection_error_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let http = facade();
        http.create(1);
        let mut handle = None;
        let req = HttpRequest::new("GET", "127.0.0.1", "/").with_port(port);
        http.request(&mut handle, req, Duration::from_secs(1), false).unwrap();
        assert!(matches!(wait(&http, handle), AsyncPoll::Error(_)));
    }

    #[test]
    fn test_image_decode_and_hook() {
        let port = server(1, b"\x01\x02\x03\x04\x05\x06", Duration::ZERO);
        let decoder = |data: &[u8]| -> Result<DecodedImage> {
            Ok(DecodedImage {
                pixels: data.iter().rev().copied().collect(),
                width: 3,
                height: 2,
            })
        };
        let hook: Arc<ResponseHook> = Arc::new(|req: &HttpRequest, response: &mut HttpResponse| {
            assert_eq!(req.path(), "/img");
            response.status = 299;
            Ok(())
        });

        let http = facade().with_decoder(Arc::new(decoder)).with_hook(hook);
        http.create(1);
        let mut handle = None;
        let req = HttpRequest::new("GET", "127.0.0.1", "/img").with_port(port);
        http.request(&mut handle, req, TIMEOUT, true).unwrap();

        match wait(&http, handle) {
            AsyncPoll::Ok(response) => {
                assert_eq!(response.status, 299);
                assert_eq!(&response.body[..], b"\x06\x05\x04\x03\x02\x01");
                assert_eq!(response.packed_size(), 3 | (2 << 16));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
