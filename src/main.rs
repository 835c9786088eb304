use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use llm_spam_filter::cache::{self, CacheRepository, CacheSweeper};
use llm_spam_filter::classifier;
use llm_spam_filter::config::{FilterType, MilterSocket};
use llm_spam_filter::milter::Milter;
use llm_spam_filter::relay::SmtpRelay;
use llm_spam_filter::{Config, DecisionEngine, FilterEngine, MailContext, SmtpServer, WhitelistChecker};
use log::LevelFilter;
use std::io::Read;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let matches = Command::new("llm-spam-filter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SMTP content filter that classifies mail with a language model")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/llm-spam-filter/config.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Analyze one message file ('-' for stdin) and print the verdict")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("cache-cleanup")
                .long("cache-cleanup")
                .help("Remove expired entries from the configured cache and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        generate_default_config(path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/llm-spam-filter/config.yaml");

    let (config, found) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config.logging.level_filter()
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("test-config") {
        match config.validate() {
            Ok(()) => {
                println!("Configuration is valid.");
                print_summary(&config);
            }
            Err(e) => {
                println!("Configuration validation failed: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {}", e);
        process::exit(1);
    }

    let outcome = if let Some(file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, file).await
    } else if matches.get_flag("cache-cleanup") {
        cleanup_cache(&config).await
    } else {
        run_server(config).await
    };

    if let Err(e) = outcome {
        log::error!("{:#}", e);
        process::exit(1);
    }
}

/// Load the file if present; the flag says whether it was found.
fn load_config(path: &str) -> anyhow::Result<(Config, bool)> {
    let found = std::path::Path::new(path).exists();
    let mut config = if found {
        Config::from_file(path).with_context(|| format!("reading {path}"))?
    } else {
        Config::default()
    };
    config.apply_env();
    Ok((config, found))
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Set classifier.openai.api_key (or SPAM_FILTER_OPENAI_API_KEY) before starting.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn print_summary(config: &Config) {
    match config.server.filter_type {
        FilterType::Smtp => {
            println!("  Front end: smtp on {}", config.server.listen_address);
            println!(
                "  Upstream: {}:{}",
                config.server.upstream.host, config.server.upstream.port
            );
        }
        FilterType::Milter => {
            println!("  Front end: milter on {}", config.server.milter_socket);
        }
    }
    println!(
        "  Classifier: {:?} ({})",
        config.classifier.provider,
        config.classifier.selected().model_name
    );
    println!("  Threshold: {}", config.spam.threshold);
    println!("  Block spam: {}", config.server.block_spam);
    println!(
        "  Whitelisted domains: {}",
        config.spam.whitelisted_domains.len()
    );
    if config.cache.enabled {
        println!(
            "  Cache: {:?}, ttl {}s",
            config.cache.cache_type, config.cache.ttl_seconds
        );
    } else {
        println!("  Cache: disabled");
    }
}

/// Wire classifier, whitelist and (optionally) cache into a decision engine.
async fn build_engine(
    config: &Config,
) -> anyhow::Result<(Arc<DecisionEngine>, Option<Arc<dyn CacheRepository>>)> {
    let classifier = classifier::build(&config.classifier)?;
    let whitelist = WhitelistChecker::new(&config.spam.whitelisted_domains);
    let mut engine = DecisionEngine::new(classifier, whitelist, config.spam.threshold)
        .with_classifier_timeout(config.classifier.timeout());

    let cache = if config.cache.enabled {
        let cache = cache::open(&config.cache)
            .await
            .context("opening result cache")?;
        engine = engine.with_cache(cache.clone(), config.cache.ttl());
        Some(cache)
    } else {
        None
    };

    Ok((Arc::new(engine), cache))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let (engine, cache) = build_engine(&config).await?;
    let filter = Arc::new(FilterEngine::new(engine, &config.server));

    let sweeper = cache
        .as_ref()
        .map(|c| CacheSweeper::spawn(c.clone(), config.cache.cleanup_interval()));

    let shutdown = CancellationToken::new();
    let mut server_task = match config.server.filter_type {
        FilterType::Smtp => {
            let relay = Arc::new(SmtpRelay::new(
                &config.server.upstream,
                &config.server.hostname,
            ));
            let server = Arc::new(SmtpServer::new(
                filter,
                relay,
                config.server.hostname.clone(),
                config.server.max_message_bytes,
            ));
            let listener = TcpListener::bind(&config.server.listen_address)
                .await
                .with_context(|| format!("binding {}", config.server.listen_address))?;
            tokio::spawn(server.run(listener, shutdown.clone()))
        }
        FilterType::Milter => {
            let socket: MilterSocket = config
                .server
                .milter_socket
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let milter = Milter::new(filter, config.server.max_message_bytes);
            let token = shutdown.clone();
            tokio::spawn(async move { milter.run(&socket, token).await })
        }
    };

    // a front end that stops on its own ends the process too
    let finished = tokio::select! {
        _ = wait_for_signal() => {
            log::info!("Shutdown requested");
            None
        }
        joined = &mut server_task => Some(joined),
    };
    shutdown.cancel();

    let joined = match finished {
        Some(joined) => joined,
        None => server_task.await,
    };
    let outcome = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("server task failed: {}", e)));

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    if let Some(cache) = cache {
        cache.close().await;
    }
    log::info!("Shutdown complete");
    outcome
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cleanup_cache(config: &Config) -> anyhow::Result<()> {
    if !config.cache.enabled {
        println!("Cache is disabled, nothing to clean.");
        return Ok(());
    }
    let cache = cache::open(&config.cache).await.context("opening result cache")?;
    let removed = cache.cleanup().await?;
    cache.close().await;
    println!("Removed {} expired cache entries", removed);
    Ok(())
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

async fn test_email_file(config: &Config, email_file: &str) -> anyhow::Result<()> {
    let raw = if email_file == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading message from stdin")?;
        buf
    } else {
        std::fs::read(email_file).with_context(|| format!("reading {email_file}"))?
    };

    let (engine, cache) = build_engine(config).await?;
    let filter = FilterEngine::new(engine, &config.server);
    let email = filter
        .extract(&MailContext::default(), &raw)
        .context("parsing message")?;

    println!("Testing email file: {}", email_file);
    println!("  From: {}", email.from);
    println!("  To: {}", email.to.join(", "));
    println!("  Subject: {}", email.subject);
    println!("  Body length: {} bytes", email.body.len());
    println!("  Body preview: {}", truncate_string(email.body.trim(), 100));
    println!();

    let decision = filter.decide(&email).await;
    let result = &decision.result;
    println!("Result:");
    println!("  Is spam: {}", result.is_spam);
    println!("  Score: {:.4}", result.score);
    println!("  Confidence: {:.4}", result.confidence);
    println!("  Explanation: {}", result.explanation);
    println!("  Model: {}", result.model_used);
    if let Some(error) = &decision.error {
        println!("  Error: {}", error);
    }
    println!("  Processing time: {:?}", decision.elapsed);

    if let Some(cache) = cache {
        cache.close().await;
    }
    Ok(())
}
