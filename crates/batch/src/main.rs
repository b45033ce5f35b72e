//! `avagen-batch` -- batch avatar image generation against ComfyUI.
//!
//! Builds one job per avatar variant from the avatar table, submits
//! them all, then polls every few seconds until each image has been
//! copied into the output directory.
//!
//! # Environment variables
//!
//! All variables are optional.
//!
//! | Variable               | Default                 | Description                         |
//! |------------------------|-------------------------|-------------------------------------|
//! | `COMFYUI_API_URL`      | `http://127.0.0.1:8188` | ComfyUI HTTP endpoint               |
//! | `AVATAR_TABLE`         | `config/avatars.json`   | Avatar table (JSON)                 |
//! | `OUTPUT_DIR`           | `public/avatars`        | Local root for generated images     |
//! | `WORKFLOW_TEMPLATE`    | built-in Flux graph     | API-format workflow JSON            |
//! | `LABEL_NAMESPACE`      | `regen`                 | Filename prefix namespace           |
//! | `POLL_INTERVAL_SECS`   | `10`                    | Seconds between poll sweeps         |
//! | `MAX_POLL_ATTEMPTS`    | --                      | Abandon a job after this many polls |
//! | `REQUEST_TIMEOUT_SECS` | `30`                    | Limit on each ComfyUI HTTP request  |
//! | `COPY_TIMEOUT_SECS`    | `120`                   | Limit on each `scp` copy            |
//! | `FETCH_MODE`           | `scp`                   | `scp` or `http`                     |
//! | `REMOTE_HOST`          | API URL host            | SSH host for `scp`                  |
//! | `REMOTE_OUTPUT_DIR`    | `/opt/ComfyUI/output`   | ComfyUI output dir on the remote    |

use avagen_batch::backend::ComfyUIBackend;
use avagen_batch::config::{BatchConfig, FetchMode};
use avagen_batch::orchestrator::Orchestrator;
use avagen_comfyui::api::ComfyUIApi;
use avagen_comfyui::transfer::{Fetcher, HttpFetcher, ScpFetcher};
use avagen_core::job_table::{build_job_requests, AvatarTable};
use avagen_core::workflow::JobGraphTemplate;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avagen_batch=info,avagen_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BatchConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let table = AvatarTable::load(&config.avatar_table).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to load avatar table");
        std::process::exit(1);
    });

    let template = match &config.workflow_template {
        Some(path) => JobGraphTemplate::load(path).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to load workflow template");
            std::process::exit(1);
        }),
        None => JobGraphTemplate::flux_pixar(),
    };

    let requests = build_job_requests(&table, &config.output_dir, &config.label_namespace);

    let api = ComfyUIApi::with_timeout(config.api_url.clone(), config.request_timeout)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build HTTP client");
            std::process::exit(1);
        });
    let backend = ComfyUIBackend::new(api.clone());
    let fetcher = match config.fetch_mode {
        FetchMode::Scp => Fetcher::Scp(
            ScpFetcher::new(config.remote_host.clone(), config.remote_output_dir.clone())
                .with_timeout(config.copy_timeout),
        ),
        FetchMode::Http => Fetcher::Http(HttpFetcher::new(api)),
    };

    tracing::info!(
        api_url = %config.api_url,
        client_id = backend.client_id(),
        avatars = table.avatars.len(),
        jobs = requests.len(),
        output_dir = %config.output_dir.display(),
        fetch_mode = ?config.fetch_mode,
        poll_interval_secs = config.poll_interval.as_secs(),
        "Starting avagen-batch",
    );

    let summary = Orchestrator::new(&backend, &fetcher, &template)
        .with_poll_interval(config.poll_interval)
        .with_max_poll_attempts(config.max_poll_attempts)
        .run(&requests)
        .await;

    if !summary.failed_to_queue.is_empty() {
        tracing::warn!(
            labels = ?summary.failed_to_queue,
            "{} jobs were never queued",
            summary.failed_to_queue.len(),
        );
    }
    if !summary.abandoned.is_empty() {
        tracing::warn!(
            labels = ?summary.abandoned,
            "{} jobs were abandoned",
            summary.abandoned.len(),
        );
    }
}
