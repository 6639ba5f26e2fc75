//! pgalertd - PostgreSQL log and health alerting daemon.
//!
//! Follows the server log for errors, runs periodic host and database
//! checks, and mails batched alerts for a fixed number of minutes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use clap::Parser;
use postgres::Client;
use tracing::{Level, debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pgalert_core::classifier::{LineClassifier, SqlStateRule};
use pgalert_core::config::{CliOverrides, Config, FileConfigSource};
use pgalert_core::health::{DbHealth, HealthSuite, HostHealth};
use pgalert_core::history::{self, HISTORY_PREFIX};
use pgalert_core::lock::{LockError, RunLock};
use pgalert_core::monitor::{
    Clock, EXIT_ALREADY_RUNNING, EXIT_ERROR, Monitor, MonitorParts, SystemClock,
};
use pgalert_core::notify::{self, Notifier};
use pgalert_core::pg::{self, ServerSettings};
use pgalert_core::procfs::{FileSystem, RealFs, count_cpus};
use pgalert_core::source::{LineSource, LogSourceTracker, resolver_from_config};
use pgalert_core::PROCESS_NAME;

/// PostgreSQL alerting daemon.
#[derive(Parser)]
#[command(name = "pgalertd", about = "PostgreSQL log and health alerting daemon", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: PathBuf,

    /// Minutes to run before exiting. Overrides run.minutes.
    #[arg(short, long)]
    minutes: Option<u64>,

    /// Database name. Overrides database.dbname.
    #[arg(short = 'd', long)]
    dbname: Option<String>,

    /// Database user. Overrides database.user.
    #[arg(short = 'u', long)]
    dbuser: Option<String>,

    /// Database host. Overrides database.host.
    #[arg(short = 's', long)]
    dbhost: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            minutes: self.minutes,
            dbname: self.dbname.clone(),
            dbuser: self.dbuser.clone(),
            dbhost: self.dbhost.clone(),
            verbose: self.verbose > 0,
        }
    }
}

fn log_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Initializes console logging plus the daily alert history file in
/// `history_dir`. The returned guard flushes the file on drop.
fn init_logging(level: Level, history_dir: Option<&Path>) -> Option<WorkerGuard> {
    let mut filter = EnvFilter::from_default_env();
    for target in ["pgalertd", "pgalert_core"] {
        match format!("{target}={level}").parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("pgalertd: bad log directive for {target}: {e}"),
        }
    }

    let (history, guard) = match history_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, HISTORY_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(history)
        .init();
    guard
}

/// Connects and reads the settings the log source and checks derive from.
/// Runs without them when the server cannot be reached.
fn discover_server(config: &Config) -> (Option<Client>, Option<ServerSettings>) {
    let mut client = match pg::connect(&config.database) {
        Ok(client) => client,
        Err(e) => {
            warn!(
                host = %config.database.host,
                dbname = %config.database.dbname,
                error = %e,
                "database unavailable, database checks disabled for this run"
            );
            return (None, None);
        }
    };
    match ServerSettings::discover(&mut client) {
        Ok(settings) => {
            info!(
                data_directory = %settings.data_directory.display(),
                log_directory = %settings.log_directory,
                version = settings.server_version_num,
                "connected to {}:{}",
                config.database.host,
                config.database.port
            );
            (Some(client), Some(settings))
        }
        Err(e) => {
            warn!(error = %pg::format_postgres_error(&e), "could not read server settings");
            (Some(client), None)
        }
    }
}

fn sqlstate_rule(settings: Option<&ServerSettings>) -> Option<SqlStateRule> {
    let settings = settings?;
    match SqlStateRule::from_log_line_prefix(&settings.log_line_prefix) {
        Ok(rule) => {
            debug!(prefix = rule.prefix(), postfix = rule.postfix(), "sqlstate checks enabled");
            Some(rule)
        }
        Err(e) => {
            warn!(
                log_line_prefix = %settings.log_line_prefix,
                error = %e,
                "sqlstate checks disabled"
            );
            None
        }
    }
}

fn health_suite(config: &Config, client: Option<Client>, settings: Option<&ServerSettings>) -> HealthSuite {
    let fs = RealFs::new();
    let cpus = fs
        .read_to_string(Path::new("/proc/cpuinfo"))
        .map(|text| count_cpus(&text))
        .unwrap_or(1);

    let mut host = HostHealth::new(fs, "/proc");
    if let Some(settings) = settings {
        host = host.with_directories(settings.data_directory.clone(), settings.wal_directory());
    }

    let mut suite = HealthSuite::new();
    suite.push(Box::new(host));
    if let Some(client) = client {
        suite.push(Box::new(DbHealth::new(config.database.clone(), Some(client), cpus)));
    }
    suite
}

fn notify_startup_failure(notifier: &mut dyn Notifier, config: &Config, clock: &dyn Clock, reason: &str) {
    let body = format!(
        "{}  {} cannot start: {reason}",
        clock.wall().format("%Y-%m-%d %H:%M:%S"),
        config.subject()
    );
    if let Err(e) = notifier.deliver(&config.subject(), &body) {
        error!(error = %e, "could not deliver startup failure notice");
    }
}

fn run(args: Args) -> i32 {
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pgalertd: {e}");
            return EXIT_ERROR;
        }
    };
    let overrides = args.overrides();
    overrides.apply(&mut config);

    let verbose = args.verbose.max(u8::from(config.run.verbose));
    let history_dir = config.run.alertlog_directory.clone();
    let _log_guard = init_logging(
        log_level(verbose, args.quiet),
        history_dir.is_dir().then_some(history_dir.as_path()),
    );

    if let Err(e) = config.validate() {
        error!("{e}");
        return EXIT_ERROR;
    }

    info!("pgalertd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: cluster={}, minutes={}, check_interval={}s, refresh_rate={}m, max_alerts={}",
        config.run.clusterid,
        config.run.minutes,
        config.run.check_interval,
        config.run.refresh_rate,
        config.run.max_alerts
    );
    debug!(
        database = %format!("{}@{}:{}/{}", config.database.user, config.database.host, config.database.port, config.database.dbname),
        source = ?config.source,
        filters = ?config.filters,
        thresholds = ?config.thresholds,
        "parameters"
    );

    if let Some(days) = config.run.keeplogdays {
        match history::prune(&config.run.alertlog_directory, days, SystemTime::now()) {
            Ok(0) => {}
            Ok(removed) => info!(removed, days, "pruned alert history"),
            Err(e) => warn!(error = %e, "could not prune alert history"),
        }
    }

    let lock_name = format!("{PROCESS_NAME}-{}", config.run.clusterid);
    let _lock = match RunLock::acquire(&config.run.lock_dir, &lock_name) {
        Ok(lock) => lock,
        Err(e @ LockError::Held { .. }) => {
            error!("{e}");
            return EXIT_ALREADY_RUNNING;
        }
        Err(e) => {
            error!("{e}");
            return EXIT_ERROR;
        }
    };

    let mut notifier = match notify::from_config(&config) {
        Ok(notifier) => notifier,
        Err(e) => {
            error!("cannot set up alert delivery: {e}");
            return EXIT_ERROR;
        }
    };

    // Setup graceful shutdown
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }
    let clock = SystemClock::interruptible(interrupt.clone());

    let (client, settings) = discover_server(&config);
    let rule = sqlstate_rule(settings.as_ref());

    let mut source = match resolver_from_config(&config, settings.as_ref()) {
        Ok(resolver) => LogSourceTracker::new(resolver).with_interrupt(interrupt.clone()),
        Err(e) => {
            error!("cannot set up log source: {e}");
            notify_startup_failure(notifier.as_mut(), &config, &clock, &e.to_string());
            return EXIT_ERROR;
        }
    };
    if let Err(e) = source.open(clock.wall(), config.source.initial_scan()) {
        error!("cannot open log source: {e}");
        notify_startup_failure(notifier.as_mut(), &config, &clock, &e.to_string());
        source.close();
        return EXIT_ERROR;
    }

    let classifier = match LineClassifier::new(&config.filters, rule) {
        Ok(classifier) => classifier,
        Err(e) => {
            error!("invalid filters: {e}");
            source.close();
            return EXIT_ERROR;
        }
    };

    let health = health_suite(&config, client, settings.as_ref());
    let parts = MonitorParts {
        source: Box::new(source),
        notifier,
        health,
        config_source: Box::new(FileConfigSource::new(args.config.clone(), overrides)),
        clock: Box::new(clock),
    };
    let mut monitor = Monitor::new(config, classifier, parts, interrupt);
    let outcome = monitor.run();

    info!("Shutdown complete");
    outcome.exit_code()
}

fn main() {
    let args = Args::parse();
    let code = run(args);
    std::process::exit(code);
}
