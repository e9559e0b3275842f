//! `narrator-run`: drive the simulation kernel from an on-disk configuration.
//!
//! Exit codes: 0 success, 2 configuration error, 3 default provider
//! unavailable at startup, 4 fatal rule-engine or interrupt error, 1 anything
//! else.

mod bootstrap;
mod config_file;
mod persistence;

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use contracts::{ErrorCode, KernelConfig, KernelError};
use kernel_core::event_log::{last_logged_tick, JsonlEventSink};
use kernel_core::{Narrator, SeedManager};
use kernel_llm::{AnthropicProvider, OllamaProvider, OpenAiProvider, ProviderRouter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bootstrap::{
    generated_cast, GrainUpkeepRule, ScarcityWatch, SeasonalDriftRule, DEFAULT_CAST_SIZE,
};
use config_file::{load_config, load_whitelist};
use persistence::{CompositeSink, SqliteEventStore};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_PROVIDER: i32 = 3;
const EXIT_RULES: i32 = 4;

fn print_usage() {
    println!("narrator-run --config <path> [--ticks N] [--resume-from <tick>]");
    println!("options:");
    println!("  --config <path>        kernel configuration (yaml)");
    println!("  --ticks <n>            number of ticks to run (default 1)");
    println!("  --resume-from <tick>   restart the clock at the given tick");
}

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    config: PathBuf,
    ticks: u64,
    resume_from: Option<u64>,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut config = None;
    let mut ticks = 1_u64;
    let mut resume_from = None;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--config" => {
                let value = iter.next().ok_or("missing value for --config")?;
                config = Some(PathBuf::from(value));
            }
            "--ticks" => {
                let value = iter.next().ok_or("missing value for --ticks")?;
                ticks = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid tick count: {value}"))?;
            }
            "--resume-from" => {
                let value = iter.next().ok_or("missing value for --resume-from")?;
                resume_from = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid resume tick: {value}"))?,
                );
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(CliArgs {
        config: config.ok_or("missing required --config <path>")?,
        ticks,
        resume_from,
    })
}

fn exit_code_for(err: &KernelError) -> i32 {
    match err.code {
        ErrorCode::InvalidConfig | ErrorCode::InvalidArgument => EXIT_CONFIG,
        ErrorCode::RuleError | ErrorCode::InterruptError => EXIT_RULES,
        ErrorCode::ProviderUnavailable => EXIT_PROVIDER,
        _ => EXIT_FAILURE,
    }
}

fn build_router(config: &KernelConfig) -> Result<Arc<ProviderRouter>, KernelError> {
    let router = ProviderRouter::new(&config.llm.default_provider);
    for (id, provider) in &config.llm.providers {
        let api_key = match &provider.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                KernelError::invalid_config(format!("missing environment variable: {var}"))
            })?),
            None => None,
        };
        match provider.kind {
            contracts::ProviderKind::Openai => {
                let key = api_key.ok_or_else(|| {
                    KernelError::invalid_config(format!("llm.providers.{id} requires api_key_env"))
                })?;
                let built =
                    OpenAiProvider::new(id, key, provider.endpoint.clone(), provider.timeout_ms)
                        .map_err(|err| {
                            KernelError::new(err.error_code(), err.to_string())
                        })?;
                router.register(Arc::new(built));
            }
            contracts::ProviderKind::Anthropic => {
                let key = api_key.ok_or_else(|| {
                    KernelError::invalid_config(format!("llm.providers.{id} requires api_key_env"))
                })?;
                let built =
                    AnthropicProvider::new(id, key, provider.endpoint.clone(), provider.timeout_ms)
                        .map_err(|err| {
                            KernelError::new(err.error_code(), err.to_string())
                        })?;
                router.register(Arc::new(built));
            }
            contracts::ProviderKind::Ollama => {
                let built = OllamaProvider::new(id, provider.endpoint.clone(), provider.timeout_ms)
                    .map_err(|err| KernelError::new(err.error_code(), err.to_string()))?;
                router.register(Arc::new(built));
            }
        }
    }
    Ok(Arc::new(router))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("error: {message}");
            print_usage();
            std::process::exit(EXIT_CONFIG);
        }
    };

    std::process::exit(run(cli).await);
}

async fn run(cli: CliArgs) -> i32 {
    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return EXIT_CONFIG;
        }
    };
    let whitelist = match load_whitelist(Path::new(&config.whitelist)) {
        Ok(whitelist) => whitelist,
        Err(err) => {
            eprintln!("error: {err}");
            return EXIT_CONFIG;
        }
    };

    if let Some(resume_tick) = cli.resume_from {
        match last_logged_tick(&config.event_log.path) {
            Ok(Some(last)) if last > resume_tick => {
                eprintln!(
                    "error: event log {} already reaches tick {last}, cannot resume from {resume_tick}",
                    config.event_log.path
                );
                return EXIT_CONFIG;
            }
            Ok(_) => {}
            Err(err) => {
                eprintln!("error: {err}");
                return exit_code_for(&err);
            }
        }
        config.clock.start_tick = match i64::try_from(resume_tick) {
            Ok(tick) => tick,
            Err(_) => {
                eprintln!("error: resume tick {resume_tick} out of range");
                return EXIT_CONFIG;
            }
        };
    }

    let router = match build_router(&config) {
        Ok(router) => router,
        Err(err) => {
            eprintln!("error: {err}");
            return exit_code_for(&err);
        }
    };

    let health = router.health_check_all().await;
    match health.get(&config.llm.default_provider) {
        Some(status) if status.healthy => {
            tracing::info!(
                provider = config.llm.default_provider.as_str(),
                "default provider healthy"
            );
        }
        Some(status) => {
            eprintln!(
                "error: provider {} unavailable at startup: {}",
                config.llm.default_provider, status.message
            );
            return EXIT_PROVIDER;
        }
        None => {
            eprintln!(
                "error: provider {} not registered",
                config.llm.default_provider
            );
            return EXIT_PROVIDER;
        }
    }
    for (provider_id, status) in &health {
        if !status.healthy {
            tracing::warn!(
                provider = provider_id.as_str(),
                message = status.message.as_str(),
                "provider unhealthy"
            );
        }
    }

    let jsonl = match JsonlEventSink::open(&config.event_log.path) {
        Ok(sink) => sink,
        Err(err) => {
            eprintln!("error: {err}");
            return exit_code_for(&err);
        }
    };
    let sqlite = match &config.event_log.sqlite_path {
        Some(path) => match SqliteEventStore::open(path) {
            Ok(mut store) => {
                if let Err(err) = store.record_run(&config) {
                    eprintln!("error: {err}");
                    return EXIT_FAILURE;
                }
                Some(store)
            }
            Err(err) => {
                eprintln!("error: {err}");
                return EXIT_FAILURE;
            }
        },
        None => None,
    };
    if let (Some(resume_tick), Some(store)) = (cli.resume_from, sqlite.as_ref()) {
        match store.last_tick() {
            Ok(Some(last)) if last > resume_tick => {
                eprintln!(
                    "error: sqlite store already reaches tick {last}, cannot resume from {resume_tick}"
                );
                return EXIT_CONFIG;
            }
            Ok(_) => {}
            Err(err) => {
                eprintln!("error: {err}");
                return EXIT_FAILURE;
            }
        }
    }
    let sink = CompositeSink::new(Box::new(jsonl), sqlite);

    let seeds = SeedManager::new(config.seed);
    let cast = match generated_cast(&seeds, DEFAULT_CAST_SIZE) {
        Ok(cast) => cast,
        Err(err) => {
            eprintln!("error: {err}");
            return exit_code_for(&err);
        }
    };

    let mut narrator = match Narrator::new(&config, whitelist, router, cast, Box::new(sink)) {
        Ok(narrator) => narrator,
        Err(err) => {
            eprintln!("error: {err}");
            return exit_code_for(&err);
        }
    };
    if let Err(err) = narrator.rules_mut().register(Box::new(SeasonalDriftRule)) {
        eprintln!("error: {err}");
        return exit_code_for(&err);
    }
    if let Err(err) = narrator.rules_mut().register(Box::new(GrainUpkeepRule)) {
        eprintln!("error: {err}");
        return exit_code_for(&err);
    }
    narrator.interrupts_mut().register(Box::new(ScarcityWatch));

    // An external stop waits for the current tick to close; mid-tick state
    // never reaches the log half-written.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_flag.store(true, Ordering::SeqCst);
        }
    });

    let mut completed = 0_u64;
    for _ in 0..cli.ticks {
        if shutdown.load(Ordering::SeqCst) {
            tracing::info!("shutdown requested, stopping at tick boundary");
            break;
        }
        match narrator.step().await {
            Ok(summary) => {
                println!("{summary}");
                completed += 1;
            }
            Err(err) => {
                eprintln!("error: {err}");
                return exit_code_for(&err);
            }
        }
    }

    println!(
        "run complete: ticks={completed} last_tick={}",
        narrator.current_tick()
    );
    EXIT_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_full_argument_set() {
        let parsed = parse_args(&args(&[
            "--config",
            "config/default.yaml",
            "--ticks",
            "30",
            "--resume-from",
            "240",
        ]))
        .expect("parse");
        assert_eq!(
            parsed,
            CliArgs {
                config: PathBuf::from("config/default.yaml"),
                ticks: 30,
                resume_from: Some(240),
            }
        );
    }

    #[test]
    fn config_is_required() {
        let err = parse_args(&args(&["--ticks", "5"])).unwrap_err();
        assert!(err.contains("--config"));
    }

    #[test]
    fn rejects_unknown_arguments() {
        let err = parse_args(&args(&["--config", "x.yaml", "--verbose"])).unwrap_err();
        assert!(err.contains("unknown argument"));
    }

    #[test]
    fn rejects_non_numeric_ticks() {
        let err = parse_args(&args(&["--config", "x.yaml", "--ticks", "many"])).unwrap_err();
        assert!(err.contains("invalid tick count"));
    }

    #[test]
    fn maps_error_codes_to_exit_codes() {
        assert_eq!(
            exit_code_for(&KernelError::invalid_config("bad")),
            EXIT_CONFIG
        );
        assert_eq!(
            exit_code_for(&KernelError::new(ErrorCode::RuleError, "bad")),
            EXIT_RULES
        );
        assert_eq!(
            exit_code_for(&KernelError::new(ErrorCode::ProviderUnavailable, "down")),
            EXIT_PROVIDER
        );
        assert_eq!(exit_code_for(&KernelError::io("disk full")), EXIT_FAILURE);
    }
}
