#![forbid(unsafe_code)]

mod config;
mod error;
mod server;
mod store;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use huddle_domain::RoomName;
use huddle_protocol::{ServerFrame, WS_PATH};
use huddle_util::endpoint::BindEndpoint;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::console::spawn_console;
use crate::server::context::AppContext;
use crate::server::health::HealthState;
use crate::server::http::router;
use crate::store::hasher::Argon2Hasher;
use crate::store::{DataLayout, init_data_dir};

const SHUTDOWN_NOTICE: &str = "Server is shutting down.";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: huddle_server [init] [--bind ws://host:port] [--config path]\n\
\n\
Commands:\n\
\tinit      Create the data directory skeleton and exit\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default from config: ws://localhost:8999)\n\
\t         Format: ws://host:port\n\
\t--config  Config file (default: ~/.huddle/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<BindEndpoint>,
	config: Option<PathBuf>,
	init: bool,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		config: None,
		init: false,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"init" => args.init = true,
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let bind = BindEndpoint::parse(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				args.bind = Some(bind);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,huddle_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("huddle_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Resolves on Ctrl-C or when the console requests a stop.
async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "could not listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};
	// A closed console (stdin EOF) must not stop the server.
	let console = async {
		if stop.wait_for(|stop| *stop).await.is_err() {
			std::future::pending::<()>().await;
		}
	};

	tokio::select! {
		_ = ctrl_c => info!("ctrl-c received"),
		_ = console => info!("stop requested from console"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		server_cfg.server.host = bind.host;
		server_cfg.server.port = bind.port;
	}

	if args.init {
		let layout = DataLayout::new(&server_cfg.storage.data_dir);
		let created = init_data_dir(&layout, server_cfg.moderation.admin_password.as_ref())
			.await
			.context("initialise data directory")?;
		if created.is_empty() {
			println!("{} is already initialised", layout.root.display());
		}
		for path in created {
			println!("created {}", path.display());
		}
		return Ok(());
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health = HealthState::new();
	let ctx = Arc::new(AppContext::load(&server_cfg, Arc::new(Argon2Hasher::new())).await?);

	let endpoint = BindEndpoint::new(server_cfg.server.host.clone(), server_cfg.server.port);
	let listener = TcpListener::bind(endpoint.hostport())
		.await
		.with_context(|| format!("bind {}", endpoint.hostport()))?;
	info!(url = %endpoint.url(), path = WS_PATH, "huddle_server: listening");
	health.mark_ready();

	let (stop_tx, stop_rx) = watch::channel(false);
	spawn_console(Arc::clone(&ctx), stop_tx);

	let shutdown_ctx = Arc::clone(&ctx);
	let shutdown_health = health.clone();
	axum::serve(listener, router(Arc::clone(&ctx), health))
		.with_graceful_shutdown(async move {
			wait_for_stop(stop_rx).await;
			shutdown_health.mark_not_ready();
			let notice = ServerFrame::system(SHUTDOWN_NOTICE, RoomName::general()).encode().ok();
			let closed = shutdown_ctx.hub.shutdown(notice).await;
			info!(sessions = closed, "shutdown: live sessions closed");
		})
		.await
		.context("http server")?;

	ctx.flush().await.context("flush data on shutdown")?;
	info!("huddle_server: stopped");

	Ok(())
}
