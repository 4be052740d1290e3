#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use ctxforge_policy_controller::{inject, Admission};
use ctxforge_policy_controller_k8s_api::{HeaderPropagationPolicy, Pod};
use ctxforge_policy_controller_k8s_status as status;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "policy", about = "ctxforge admission injector and policy controller")]
struct Args {
    #[clap(
        long,
        default_value = "ctxforge=info,warn",
        env = "CTXFORGE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Image used for injected forwarder containers.
    #[clap(long, env = "PROXY_IMAGE", default_value = inject::DEFAULT_PROXY_IMAGE)]
    proxy_image: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        admin,
        client,
        log_level,
        log_format,
        server,
        admission_controller_disabled,
        proxy_image,
    } = Args::parse();

    let server = if admission_controller_disabled {
        None
    } else {
        Some(server)
    };

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .with_optional_server(server)
        .build()
        .await?;

    // Policy and pod events feed the status controller's work queue.
    let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
    let index = status::Index::shared(reconcile_tx.clone());

    let policies = runtime.watch_all::<HeaderPropagationPolicy>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(index.clone(), policies).instrument(info_span!("policies")),
    );

    let pods = runtime.watch_all::<Pod>(watcher::Config::default());
    tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

    let controller = status::Controller::new(runtime.client(), reconcile_tx, reconcile_rx);
    tokio::spawn(controller.run().instrument(info_span!("status")));

    let runtime = runtime.spawn_server(|| Admission::new(proxy_image));

    // Block the main thread on the shutdown signal. Once it fires, wait
    // for the background tasks to complete before exiting.
    if runtime.run().await.is_err() {
        bail!("aborted");
    }

    Ok(())
}
