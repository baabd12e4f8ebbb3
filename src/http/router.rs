//! Path-based routing.
//!
//! Routes are matched on the path part of the request target, in
//! registration order; the first match wins. A pattern segment written as
//! `:name` matches any single segment and binds it as a parameter. Lookups
//! never fail: unmatched paths resolve to the fallback handler, which
//! answers 404 unless replaced.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::http::queue::ResponseHandle;
use crate::http::request::{Request, split_target};
use crate::http::response::Response;

/// Everything a handler gets to know about the request it serves.
#[derive(Debug)]
pub struct RequestContext {
    pub request: Request,
    pub params: Params,
    pub conn_id: u64,
    pub peer: SocketAddr,
}

/// Request handler.
///
/// Called synchronously from the connection task and must not block. A
/// handler that needs to wait for something clones the handle into a
/// spawned task and writes from there.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext, response: ResponseHandle);
}

impl<F> Handler for F
where
    F: Fn(RequestContext, ResponseHandle) + Send + Sync + 'static,
{
    fn call(&self, ctx: RequestContext, response: ResponseHandle) {
        self(ctx, response)
    }
}

/// Path parameters bound by a route pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
enum Segment {
    Static(String),
    Param(String),
}

struct Route {
    pattern: String,
    segments: Vec<Segment>,
    handler: Arc<dyn Handler>,
}

impl Route {
    fn matches(&self, path: &str) -> Option<Params> {
        let mut parts = path_segments(path);
        let mut params = Vec::new();

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Static(s) if s == part => {}
                Segment::Static(_) => return None,
                Segment::Param(name) => params.push((name.clone(), part.to_string())),
            }
        }

        if parts.next().is_some() {
            return None;
        }
        Some(Params(params))
    }
}

pub struct Router {
    routes: Vec<Route>,
    fallback: Arc<dyn Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            fallback: Arc::new(not_found),
        }
    }

    /// Registers `handler` for `pattern`, e.g. `/users/:id`.
    pub fn route(mut self, pattern: &str, handler: impl Handler) -> Self {
        let segments = path_segments(pattern)
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Static(s.to_string()),
            })
            .collect();

        self.routes.push(Route {
            pattern: pattern.to_string(),
            segments,
            handler: Arc::new(handler),
        });
        self
    }

    /// Replaces the handler used for unmatched paths.
    pub fn fallback(mut self, handler: impl Handler) -> Self {
        self.fallback = Arc::new(handler);
        self
    }

    /// Finds the handler for a request target. The query string is ignored.
    pub fn resolve(&self, target: &str) -> (Arc<dyn Handler>, Params) {
        let (path, _) = split_target(target);
        for route in &self.routes {
            if let Some(params) = route.matches(path) {
                tracing::trace!(pattern = %route.pattern, path, "Route matched");
                return (Arc::clone(&route.handler), params);
            }
        }
        (Arc::clone(&self.fallback), Params::default())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field(
                "routes",
                &self.routes.iter().map(|r| &r.pattern).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn not_found(_ctx: RequestContext, response: ResponseHandle) {
    response.send(Response::not_found());
}
