use crate::http::transport::Transport;
use crate::trace::io::TracedIo;
use crate::trace::sink::{ClientTrace, ConnInfo, RunState, TraceContext};
use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, ACCEPT, CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::task::AbortOnDropHandle;
use tracing::Instrument;

/// Issues a single traced GET request against a fixed target.
#[derive(Debug)]
pub struct RequestRunner {
    transport: Transport,
    uri: Uri,
    host: String,
    port: u16,
    https: bool,
}

impl RequestRunner {
    pub fn new(transport: Transport, url: &str) -> Result<Self, anyhow::Error> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("Failed to parse URL: {url}"))?;
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(anyhow!("Can not find a supported scheme in the uri:{}.", uri)),
        };
        // IPv6 literals keep their brackets in the authority.
        let host = uri
            .host()
            .ok_or(anyhow!("uri has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        Ok(Self {
            transport,
            uri,
            host,
            port,
            https,
        })
    }

    fn build_request(&self) -> Result<Request<Full<Bytes>>, anyhow::Error> {
        let path = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let authority = self.uri.host().ok_or(anyhow!("uri has no host"))?;
        let host_header = match self.uri.port_u16() {
            Some(port) => format!("{authority}:{port}"),
            None => authority.to_string(),
        };

        let mut request_builder = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, HeaderValue::from_str(&host_header)?)
            .header(
                USER_AGENT,
                HeaderValue::from_static(concat!("phasetrace/", env!("CARGO_PKG_VERSION"))),
            )
            .header(ACCEPT, HeaderValue::from_static("*/*"));
        if !self.transport.config().keep_alive {
            request_builder = request_builder.header(CONNECTION, HeaderValue::from_static("close"));
        }

        let request = request_builder.body(Full::new(Bytes::new()))?;

        debug!(
            "> {} {} {:?}",
            request.method(),
            request.uri(),
            request.version()
        );
        for (key, value) in request.headers().iter() {
            debug!("> {}: {}", key, value.to_str()?);
        }
        Ok(request)
    }

    /// Runs the request, recording every phase into `ctx`.
    ///
    /// The context ends in [`RunState::Completed`] or [`RunState::Failed`];
    /// whatever was recorded before a failure stays in the tracer.
    pub async fn trace<T: ClientTrace>(
        &self,
        ctx: &mut TraceContext<T>,
    ) -> Result<StatusCode, anyhow::Error> {
        let result = match self.transport.config().timeout {
            Some(limit) => timeout(limit, self.execute(ctx))
                .await
                .map_err(|_| anyhow!("Request timed out after {} seconds", limit.as_secs_f64()))
                .and_then(|res| res),
            None => self.execute(ctx).await,
        };
        ctx.transition(if result.is_ok() {
            RunState::Completed
        } else {
            RunState::Failed
        });
        result
    }

    async fn execute<T: ClientTrace>(
        &self,
        ctx: &mut TraceContext<T>,
    ) -> Result<StatusCode, anyhow::Error> {
        let request = self.build_request().context("Failed to build request")?;
        ctx.transition(RunState::RequestBuilt);
        ctx.transition(RunState::Tracing);

        let addrs = match self.host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, self.port)],
            Err(_) => {
                self.transport
                    .resolve(&self.host, self.port, &mut ctx.tracer)
                    .await?
            }
        };
        let stream = self.transport.dial(&addrs, &mut ctx.tracer).await?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        if self.https {
            let tls_stream = self.transport.handshake_tls(&self.host, stream).await?;
            let tls_version = tls_stream
                .get_ref()
                .1
                .protocol_version()
                .map(|v| format!("{v:?}"));
            let info = ConnInfo {
                reused: false,
                local_addr,
                remote_addr,
                tls_version,
            };
            self.exchange(tls_stream, request, info, ctx).await
        } else {
            let info = ConnInfo {
                reused: false,
                local_addr,
                remote_addr,
                tls_version: None,
            };
            self.exchange(stream, request, info, ctx).await
        }
    }

    async fn exchange<S, T>(
        &self,
        stream: S,
        request: Request<Full<Bytes>>,
        info: ConnInfo,
        ctx: &mut TraceContext<T>,
    ) -> Result<StatusCode, anyhow::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: ClientTrace,
    {
        let body_len = request.body().size_hint().exact().unwrap_or(0);
        let (io, mut events) = TracedIo::new(stream, body_len);

        let (mut sender, conn) = http1::handshake(TokioIo::new(io))
            .instrument(info_span!("Http Handshake"))
            .await
            .context("HTTP handshake failed")?;
        ctx.tracer.got_conn(Utc::now(), &info);

        let _conn_task = AbortOnDropHandle::new(tokio::spawn(
            async move {
                if let Err(err) = conn.await {
                    debug!("Connection closed: {:?}", err);
                }
            }
            .instrument(info_span!(
                "addr",
                localAddr = %info.local_addr,
                remoteAddr = %info.remote_addr,
            )),
        ));

        let response = {
            let response_future = sender.send_request(request);
            tokio::pin!(response_future);
            loop {
                tokio::select! {
                    biased;
                    Some(event) = events.recv() => event.apply(&mut ctx.tracer),
                    res = &mut response_future => break res.context("Failed to execute request")?,
                }
            }
        };
        while let Ok(event) = events.try_recv() {
            event.apply(&mut ctx.tracer);
        }

        debug!("< {:?} {}", response.version(), response.status());
        for (key, value) in response.headers().iter() {
            debug!("< {}: {}", key, value.to_str().unwrap_or("<opaque>"));
        }
        Ok(response.status())
    }
}
