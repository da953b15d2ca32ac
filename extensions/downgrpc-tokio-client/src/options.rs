use tonic::transport::Endpoint;

/// Options accepted by [`connect_via_proxy`](crate::connect_via_proxy) and
/// [`connect_via_ws_proxy`](crate::connect_via_ws_proxy).
#[derive(Default)]
pub struct ConnectOptions {
    pub(crate) force_http2: bool,
    pub(crate) extra_h2_alpns: Vec<String>,
    pub(crate) configure_endpoint: Option<Box<dyn FnOnce(Endpoint) -> Endpoint + Send>>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an HTTP/2-only outbound transport. Required when the server
    /// speaks only HTTP/2 but ALPN is unavailable (e.g. plaintext h2c);
    /// breaks servers that expect HTTP/1.1.
    pub fn force_http2(mut self) -> Self {
        self.force_http2 = true;
        self
    }

    /// Treat the given ALPN protocol names as equivalent to `h2` when the
    /// outbound TLS handshake negotiates one of them.
    pub fn extra_h2_alpns(mut self, alpns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_h2_alpns
            .extend(alpns.into_iter().map(Into::into));
        self
    }

    /// Applies extra settings (timeouts, user agent, concurrency limits) to
    /// the tonic endpoint backing the returned channel.
    pub fn configure_endpoint(
        mut self,
        configure: impl FnOnce(Endpoint) -> Endpoint + Send + 'static,
    ) -> Self {
        self.configure_endpoint = Some(Box::new(configure));
        self
    }

    pub(crate) fn apply_endpoint(&mut self, endpoint: Endpoint) -> Endpoint {
        match self.configure_endpoint.take() {
            Some(configure) => configure(endpoint),
            None => endpoint,
        }
    }
}
