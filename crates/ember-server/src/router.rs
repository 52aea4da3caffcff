use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use ember_http::{
    handshake_rejection, handshake_response, is_upgrade_request, validate_upgrade, HttpMethod,
    HttpRequest, HttpResponse, HttpStatus,
};
use ember_limit::RateLimiter;

use crate::config::ServerConfig;
use crate::static_files;
use crate::websocket::WsHandlers;

pub type Handler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareFlow {
    Continue,
    Stop,
}

/// Request plus connection-scoped facts the codec type does not carry.
pub struct RequestContext<'a> {
    pub request: &'a HttpRequest,
    pub peer_ip: &'a str,
}

pub type Middleware =
    Arc<dyn Fn(&RequestContext<'_>, &mut HttpResponse) -> MiddlewareFlow + Send + Sync>;

struct Route {
    path: String,
    method: HttpMethod,
    handler: Handler,
}

pub(crate) enum Dispatch {
    Response(HttpResponse),
    WebSocketUpgrade {
        response: HttpResponse,
        handlers: Arc<WsHandlers>,
    },
}

#[derive(Default)]
pub struct Router {
    middleware: Vec<Middleware>,
    routes: Vec<Route>,
    websocket_routes: Vec<(String, Arc<WsHandlers>)>,
}

impl Router {
    pub fn add_route(
        &mut self,
        path: &str,
        method: HttpMethod,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.routes.push(Route {
            path: path.to_string(),
            method,
            handler: Arc::new(handler),
        });
    }

    pub fn get(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.add_route(path, HttpMethod::Get, handler);
    }

    pub fn post(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.add_route(path, HttpMethod::Post, handler);
    }

    pub fn put(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.add_route(path, HttpMethod::Put, handler);
    }

    pub fn delete(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.add_route(path, HttpMethod::Delete, handler);
    }

    pub fn patch(
        &mut self,
        path: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) {
        self.add_route(path, HttpMethod::Patch, handler);
    }

    pub fn add_middleware(
        &mut self,
        middleware: impl Fn(&RequestContext<'_>, &mut HttpResponse) -> MiddlewareFlow
            + Send
            + Sync
            + 'static,
    ) {
        self.middleware.push(Arc::new(middleware));
    }

    pub fn add_middleware_arc(&mut self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    // Config-driven limiters run ahead of user-registered middleware.
    pub(crate) fn prepend_middleware(&mut self, middleware: Middleware) {
        self.middleware.insert(0, middleware);
    }

    pub fn add_websocket_route(&mut self, path: &str, handlers: WsHandlers) {
        self.websocket_routes
            .push((path.to_string(), Arc::new(handlers)));
    }

    pub(crate) async fn dispatch(
        &self,
        request: &HttpRequest,
        peer_ip: &str,
        config: &ServerConfig,
    ) -> Dispatch {
        let context = RequestContext { request, peer_ip };
        let mut carried = HttpResponse::default();
        for middleware in &self.middleware {
            if middleware(&context, &mut carried) == MiddlewareFlow::Stop {
                return Dispatch::Response(carried);
            }
        }

        if is_upgrade_request(request) {
            return self.dispatch_upgrade(request);
        }

        let mut response = self.dispatch_handler(request, config).await;
        merge_carried_headers(&mut response, &carried);
        Dispatch::Response(response)
    }

    fn dispatch_upgrade(&self, request: &HttpRequest) -> Dispatch {
        let Some(handlers) = self.match_websocket_route(&request.path) else {
            return Dispatch::Response(handshake_rejection(&format!(
                "No WebSocket route found for path: {}",
                request.path
            )));
        };
        match validate_upgrade(request) {
            Ok(key) => Dispatch::WebSocketUpgrade {
                response: handshake_response(key),
                handlers,
            },
            Err(error) => Dispatch::Response(handshake_rejection(error.reason())),
        }
    }

    async fn dispatch_handler(&self, request: &HttpRequest, config: &ServerConfig) -> HttpResponse {
        // Exact match first, then patterns in registration order.
        if let Some(route) = self
            .routes
            .iter()
            .find(|route| route.method == request.method && route.path == request.path)
        {
            return invoke_handler(&route.handler, request);
        }

        if let Some(route) = self.routes.iter().find(|route| {
            route.method == request.method && path_matches(&route.path, &request.path)
        }) {
            return invoke_handler(&route.handler, request);
        }

        if config.serve_static_files && request.method == HttpMethod::Get {
            return static_files::serve(request, config).await;
        }

        error_response(HttpStatus::NotFound, "Resource not found")
    }

    fn match_websocket_route(&self, path: &str) -> Option<Arc<WsHandlers>> {
        self.websocket_routes
            .iter()
            .find(|(pattern, _)| path_matches(pattern, path))
            .map(|(_, handlers)| Arc::clone(handlers))
    }
}

/// Rate-limit middleware adapter. On deny it sets the `X-RateLimit-*`
/// headers and either the configured response or a 429 JSON body, then stops
/// the pipeline; on allow it records the remaining budget and continues.
pub fn rate_limit_middleware(
    limiter: Arc<RateLimiter>,
    custom_response: Option<Arc<dyn Fn() -> HttpResponse + Send + Sync>>,
) -> Middleware {
    Arc::new(move |context, response| {
        let result = limiter.check_request(context.request, context.peer_ip);
        let limit = limiter.config().max_requests;

        if !result.allowed {
            response.set_header("X-RateLimit-Limit", limit.to_string());
            response.set_header("X-RateLimit-Remaining", result.remaining.to_string());
            response.set_header("X-RateLimit-Reset", result.reset_after.as_secs().to_string());
            response.set_header("X-RateLimit-Type", result.limit_type);
            match &custom_response {
                Some(build) => {
                    let custom = build();
                    let headers: Vec<(String, String)> = custom
                        .headers()
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                        .collect();
                    response.set_status(custom.status());
                    response.set_body(custom.body().to_vec());
                    for (name, value) in headers {
                        response.set_header(&name, value);
                    }
                }
                None => {
                    response.set_status(HttpStatus::TooManyRequests);
                    response.set_json(&format!(
                        "{{\"error\": \"Rate limit exceeded\", \"reason\": \"{}\"}}",
                        result.reason
                    ));
                }
            }
            return MiddlewareFlow::Stop;
        }

        if result.limit_type != "disabled" {
            response.set_header("X-RateLimit-Limit", limit.to_string());
            response.set_header("X-RateLimit-Remaining", result.remaining.to_string());
        }
        MiddlewareFlow::Continue
    })
}

/// Literal match, or a trailing-'*' pattern whose prefix must match (the
/// asterisk covers any suffix, including the empty one).
fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => false,
    }
}

// A panicking handler becomes a 500 carrying the panic message; the
// connection stays usable if that 500 writes cleanly.
fn invoke_handler(handler: &Handler, request: &HttpRequest) -> HttpResponse {
    match catch_unwind(AssertUnwindSafe(|| handler(request))) {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(&*panic);
            tracing::warn!(path = %request.path, detail = %detail, "handler panicked");
            error_response(
                HttpStatus::InternalServerError,
                &format!("Internal server error: {detail}"),
            )
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn error_response(status: HttpStatus, message: &str) -> HttpResponse {
    let mut response = HttpResponse::new(status);
    let code = status.code();
    let reason = status.reason();
    response.set_html(&format!(
        "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
         <body><h1>{code} {reason}</h1>\n<p>{message}</p>\n\
         <hr><p>ember-http-server/1.0</p></body></html>\n"
    ));
    response
}

// Headers accumulated by pass-through middleware survive onto the handler's
// response; anything the handler set itself wins.
fn merge_carried_headers(response: &mut HttpResponse, carried: &HttpResponse) {
    let missing: Vec<(String, String)> = carried
        .headers()
        .filter(|(name, _)| !response.has_header(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    for (name, value) in missing {
        response.set_header(&name, value);
    }
}
