use std::env;
use std::process;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vu_loadtest::config::{usage, Config, SummaryFormat};
use vu_loadtest::engine::{exit_code, Engine};
use vu_loadtest::metrics::{gather_metrics_string, register_metrics};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let json = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_config_help() {
    eprintln!("{}", usage());
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = register_metrics() {
        error!(error = %e, "Failed to register metrics");
        process::exit(3);
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}\n", e);
            print_config_help();
            process::exit(e.exit_code());
        }
    };

    let threshold = config.failure_threshold;
    let format = config.summary_format;
    let print_metrics = config.print_metrics;

    let engine = Engine::new(config);

    let abort = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping virtual users");
            abort.cancel();
        }
    });

    let summary = match engine.run().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Run aborted");
            process::exit(e.exit_code());
        }
    };

    match format {
        SummaryFormat::Text => println!("{}", summary.format_text()),
        SummaryFormat::Json => match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!(error = %e, "Failed to serialize summary");
                process::exit(3);
            }
        },
    }

    if print_metrics {
        println!("{}", gather_metrics_string());
    }

    let code = exit_code(&summary, threshold);
    if code != 0 {
        warn!(
            failure_rate = summary.failure_rate,
            threshold = ?threshold,
            "Failure threshold exceeded"
        );
    } else {
        info!("Run completed");
    }
    process::exit(code);
}
