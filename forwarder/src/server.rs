//! The proxy listener: accept loop, per-connection serving, shutdown.

use crate::{
    admin,
    config::Config,
    io::{InFlight, TimeoutIo},
    metrics::Metrics,
    proxy::Proxy,
};
use anyhow::Context;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::{
    net::SocketAddr,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[derive(Copy, Clone)]
struct ConnTimeouts {
    read: Duration,
    write: Duration,
    idle: Duration,
    read_header: Duration,
}

pub struct Server {
    listener: TcpListener,
    metrics_listener: TcpListener,
    proxy: Arc<Proxy>,
    metrics: Metrics,
    timeouts: ConnTimeouts,
}

impl Server {
    /// Binds both listeners and builds the proxy. Failures here are fatal
    /// to startup.
    pub async fn bind(cfg: Config) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.proxy_port))
            .await
            .with_context(|| format!("failed to bind proxy listener on port {}", cfg.proxy_port))?;
        let metrics_listener = TcpListener::bind(("0.0.0.0", cfg.metrics_port))
            .await
            .with_context(|| {
                format!("failed to bind metrics listener on port {}", cfg.metrics_port)
            })?;

        let timeouts = ConnTimeouts {
            read: cfg.read_timeout,
            write: cfg.write_timeout,
            idle: cfg.idle_timeout,
            read_header: cfg.read_header_timeout,
        };

        info!(
            addr = %listener.local_addr().context("listener has no local address")?,
            target = %cfg.target_authority,
            rules = cfg.rules.len(),
            "proxy listening",
        );

        let metrics = Metrics::new();
        let proxy = Arc::new(Proxy::new(cfg, metrics.clone()));

        Ok(Self {
            listener,
            metrics_listener,
            proxy,
            metrics,
            timeouts,
        })
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener must have an address")
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_listener
            .local_addr()
            .expect("bound listener must have an address")
    }

    /// Spawns the accept loops. The returned signal drains in-flight
    /// connections when awaited.
    pub fn spawn(self) -> drain::Signal {
        let (signal, watch) = drain::channel();

        tokio::spawn(accept_loop(
            self.listener,
            self.proxy,
            self.timeouts,
            watch.clone(),
        ));
        tokio::spawn(admin::serve(self.metrics_listener, self.metrics, watch));

        signal
    }
}

async fn accept_loop(
    listener: TcpListener,
    proxy: Arc<Proxy>,
    timeouts: ConnTimeouts,
    shutdown: drain::Watch,
) {
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                }
            },
            _ = shutdown.clone().signaled() => break,
        };

        tokio::spawn(serve_connection(
            stream,
            peer,
            proxy.clone(),
            timeouts,
            shutdown.clone(),
        ));
    }
    debug!("proxy listener shut down");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    proxy: Arc<Proxy>,
    timeouts: ConnTimeouts,
    shutdown: drain::Watch,
) {
    let _ = stream.set_nodelay(true);
    debug!(%peer, "accepted connection");

    // Shared with the IO wrapper so it can tell an idle keep-alive
    // connection from one mid-request.
    let in_flight = Arc::new(AtomicUsize::new(0));
    let io = TimeoutIo::new(
        stream,
        timeouts.read,
        timeouts.write,
        timeouts.idle,
        in_flight.clone(),
    );

    let svc = service_fn(move |req| {
        let guard = InFlight::start(&in_flight);
        let proxy = proxy.clone();
        async move {
            let rsp = proxy.handle(req).await;
            drop(guard);
            rsp
        }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read_header)
        .serve_connection(TokioIo::new(io), svc)
        .with_upgrades();
    tokio::pin!(conn);

    let drained = shutdown.signaled();
    tokio::select! {
        res = conn.as_mut() => {
            if let Err(error) = res {
                debug!(%peer, %error, "connection closed");
            }
        }
        release = drained => {
            conn.as_mut().graceful_shutdown();
            if let Err(error) = conn.as_mut().await {
                debug!(%peer, %error, "connection closed during drain");
            }
            drop(release);
        }
    }
}
