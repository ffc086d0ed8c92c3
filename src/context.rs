//! Per-request side data threaded through the pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::request::Request;

/// Side data visible to every interceptor and middleware for one `send`.
///
/// A context may be read from multiple tasks at once (HTTP/2 continuations
/// land on the read loop's task); all mutation happens under an internal lock
/// and reads return owned snapshots.
pub struct RequestContext {
    start: Instant,
    inner: Mutex<Inner>,
}

struct Inner {
    request: Arc<Request>,
    timeline: Vec<(String, Instant)>,
    state: HashMap<String, String>,
}

impl RequestContext {
    pub(crate) fn new(request: Arc<Request>) -> Arc<RequestContext> {
        Arc::new(RequestContext {
            start: Instant::now(),
            inner: Mutex::new(Inner {
                request,
                timeline: Vec::new(),
                state: HashMap::new(),
            }),
        })
    }

    /// The request currently flowing through the pipeline. Interceptors with
    /// the mutate capability may have replaced the original.
    pub fn request(&self) -> Arc<Request> {
        self.inner.lock().unwrap().request.clone()
    }

    pub(crate) fn set_request(&self, request: Arc<Request>) {
        self.inner.lock().unwrap().request = request;
    }

    /// Monotonic wall clock since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Appends a named event to the timeline.
    pub fn mark<S: Into<String>>(&self, name: S) {
        self.inner
            .lock()
            .unwrap()
            .timeline
            .push((name.into(), Instant::now()));
    }

    /// A snapshot of the ordered timeline, as offsets from context start.
    pub fn timeline(&self) -> Vec<(String, Duration)> {
        let inner = self.inner.lock().unwrap();
        inner
            .timeline
            .iter()
            .map(|(name, at)| (name.clone(), at.duration_since(self.start)))
            .collect()
    }

    /// Reads one scratch value.
    pub fn state(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().state.get(key).cloned()
    }

    /// Writes one scratch value, returning the previous one.
    pub fn set_state<K: Into<String>, V: Into<String>>(&self, key: K, value: V) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .state
            .insert(key.into(), value.into())
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    fn request() -> Arc<Request> {
        Arc::new(
            Request::builder(Method::GET, Uri::from_static("http://example.com/"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn timeline_is_ordered() {
        let ctx = RequestContext::new(request());
        ctx.mark("one");
        ctx.mark("two");
        let timeline = ctx.timeline();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].0, "one");
        assert_eq!(timeline[1].0, "two");
        assert!(timeline[0].1 <= timeline[1].1);
    }

    #[test]
    fn state_round_trips() {
        let ctx = RequestContext::new(request());
        assert_eq!(ctx.set_state("attempt", "1"), None);
        assert_eq!(ctx.set_state("attempt", "2"), Some("1".to_owned()));
        assert_eq!(ctx.state("attempt"), Some("2".to_owned()));
    }
}
