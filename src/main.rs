use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use trafmon_service::alert::thresholds::BracketUpdate;
use trafmon_service::balance::BalanceTracker;
use trafmon_service::config::{self, Config};
use trafmon_service::ignition::{self, IgnitionDetector};
use trafmon_service::ingest::directions::{DirectionsProvider, GoogleDirections};
use trafmon_service::ingest::llm::AnthropicGenerator;
use trafmon_service::logging::{self, Component};
use trafmon_service::management::RouteManager;
use trafmon_service::maps::MapCache;
use trafmon_service::model::{RoutePriority, seconds_to_minutes};
use trafmon_service::monitor::{self, DispatchReport, Dispatcher, Monitor, PassReport};
use trafmon_service::notify::chat::{ChatChannel, DiscordWebhook};
use trafmon_service::notify::push::Pushover;
use trafmon_service::store::memory::MemoryRouteStore;
use trafmon_service::store::postgres::PgRouteStore;
use trafmon_service::store::{ConfigStore, RouteStore, load_thresholds, save_thresholds};
use trafmon_service::summary::SummaryComposer;

type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "trafmon")]
#[command(about = "Ignition-triggered route traffic monitor", long_about = None)]
struct Cli {
    /// TOML config file (missing file means defaults)
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for ignition signals (NDJSON on stdin) and check traffic on each
    Run,

    /// Check traffic once, right now
    Check {
        /// Only this route (id or name)
        #[arg(short, long)]
        route: Option<String>,

        /// Evaluate against a snapshot; nothing is saved or sent
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage monitored routes
    Routes {
        #[command(subcommand)]
        action: RouteAction,
    },

    /// Show or edit the distance-bracket thresholds
    Thresholds {
        #[command(subcommand)]
        action: ThresholdAction,
    },

    /// LLM spend tracking
    Balance {
        #[command(subcommand)]
        action: BalanceAction,
    },
}

#[derive(Subcommand)]
enum RouteAction {
    /// Add a route from DMS or decimal coordinates
    Add {
        name: String,

        /// Start point, e.g. "33°55'12\"S 18°25'26\"E" or "-33.92, 18.42"
        #[arg(short, long)]
        start: String,

        /// End point, same formats as --start
        #[arg(short, long)]
        end: String,

        /// High or Normal
        #[arg(short, long, default_value = "Normal", value_parser = parse_priority)]
        priority: RoutePriority,
    },

    /// List routes with their last state
    List,

    /// Change a route's priority
    Priority {
        /// Route id or name
        route: String,

        #[arg(value_parser = parse_priority)]
        priority: RoutePriority,
    },

    /// Delete a route and its cached map
    Delete {
        /// Route id or name
        route: String,
    },
}

#[derive(Subcommand)]
enum ThresholdAction {
    /// Print the bracket table
    Show,

    /// Edit one bracket; omitted values are kept
    Set {
        /// Bracket index, as printed by `thresholds show`
        index: usize,

        #[arg(long)]
        route_factor: Option<f64>,

        #[arg(long)]
        segment_factor: Option<f64>,

        /// Seconds
        #[arg(long)]
        route_delay: Option<f64>,

        /// Seconds
        #[arg(long)]
        segment_delay: Option<f64>,
    },

    /// Restore the built-in brackets
    Reset,
}

#[derive(Subcommand)]
enum BalanceAction {
    /// Print balance and spend
    Show,

    /// Record the account balance after a console top-up
    Topup {
        /// New balance in dollars, e.g. 20.00
        amount: Decimal,
    },
}

fn parse_priority(s: &str) -> Result<RoutePriority, String> {
    RoutePriority::parse(s).ok_or_else(|| format!("'{}' is not High or Normal", s))
}

fn main() -> CliResult<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    logging::init_logger(config.log_level(), config.logging.file.as_deref(), config.logging.timestamps);

    match cli.command {
        Commands::Run => run(&config),
        Commands::Check { route, dry_run } => check(&config, route.as_deref(), dry_run),
        Commands::Routes { action } => routes(&config, action),
        Commands::Thresholds { action } => thresholds(&config, action),
        Commands::Balance { action } => balance(&config, action),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// The Postgres store behind both trait objects.
fn open_store(config: &Config) -> CliResult<(Arc<dyn RouteStore>, Arc<dyn ConfigStore>)> {
    let url = config
        .secrets
        .database_url
        .as_deref()
        .ok_or("DATABASE_URL is not set")?;
    let store = Arc::new(PgRouteStore::connect(url)?);
    logging::info(Component::Store, None, "Connected to database");
    let routes: Arc<dyn RouteStore> = store.clone();
    let ledger: Arc<dyn ConfigStore> = store;
    Ok((routes, ledger))
}

fn open_directions(config: &Config) -> CliResult<Arc<dyn DirectionsProvider>> {
    let key = config.secrets.google_maps_api_key.as_deref().unwrap_or_default();
    Ok(Arc::new(GoogleDirections::new(key, config.http_timeout())?))
}

fn build_composer(
    config: &Config,
    ledger: Arc<dyn ConfigStore>,
    chat: Option<Arc<dyn ChatChannel>>,
) -> CliResult<SummaryComposer> {
    let Some(key) = config.secrets.anthropic_api_key.as_deref() else {
        logging::info(Component::Llm, None, "ANTHROPIC_API_KEY not set; push summaries use plain sentences");
        return Ok(SummaryComposer::deterministic());
    };
    let generator = AnthropicGenerator::new(key, &config.summary.model, config.summary_timeout())?;
    let mut balance = BalanceTracker::load(config.balance.policy(), ledger)?;
    if let Some(chat) = chat {
        balance = balance.with_alerts(chat);
    }
    Ok(
        SummaryComposer::new(Arc::new(generator), &config.summary.style, config.summary_timeout())
            .with_balance(Arc::new(balance)),
    )
}

fn build_dispatcher(config: &Config, ledger: Arc<dyn ConfigStore>) -> CliResult<Dispatcher> {
    let chat: Option<Arc<dyn ChatChannel>> = match config.secrets.discord_webhook_url.as_deref() {
        Some(url) => Some(Arc::new(DiscordWebhook::new(url, config.http_timeout())?)),
        None => {
            logging::warn(Component::Notify, None, "DISCORD_WEBHOOK_URL not set; chat alerts disabled");
            None
        }
    };

    let mut dispatcher = Dispatcher::new(build_composer(config, ledger, chat.clone())?, &config.push.title);
    if let Some(chat) = chat {
        dispatcher = dispatcher.with_chat(chat);
    }

    match (
        config.secrets.pushover_token.as_deref(),
        config.secrets.pushover_user.as_deref(),
    ) {
        (Some(token), Some(user)) => {
            dispatcher = dispatcher.with_push(Arc::new(Pushover::new(token, user, config.http_timeout())?))
        }
        _ => logging::warn(
            Component::Notify,
            None,
            "PUSHOVER_TOKEN/PUSHOVER_USER not set; push notifications disabled",
        ),
    }

    Ok(dispatcher)
}

fn build_manager(config: &Config, store: Arc<dyn RouteStore>) -> CliResult<RouteManager> {
    let key = config.secrets.google_maps_api_key.clone();
    let directions = open_directions(config).ok();
    let maps = MapCache::new(&config.maps.dir, key, directions, config.http_timeout())?;
    Ok(RouteManager::new(store).with_maps(maps))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run(config: &Config) -> CliResult<()> {
    let (store, ledger) = open_store(config)?;
    let monitor = Monitor::new(store, open_directions(config)?, config.monitor.workers);
    let dispatcher = build_dispatcher(config, ledger)?;
    let mut detector = IgnitionDetector::new(config.ignition.timeout_secs);

    logging::info(
        Component::System,
        None,
        &format!(
            "Listening for ignition signals on stdin (timeout {}s)",
            config.ignition.timeout_secs
        ),
    );

    ignition::run_signal_loop(
        BufReader::new(io::stdin()),
        &mut detector,
        Duration::from_secs(1),
        |_event| match monitor::run_cycle(&monitor, &dispatcher) {
            Ok((pass, dispatch)) => print_cycle(&pass, &dispatch),
            Err(e) => logging::error(Component::System, None, &format!("Traffic check failed: {}", e)),
        },
    );

    logging::info(Component::System, None, "Signal source closed, exiting");
    Ok(())
}

fn check(config: &Config, route: Option<&str>, dry_run: bool) -> CliResult<()> {
    let (store, ledger) = open_store(config)?;
    let directions = open_directions(config)?;

    let selected = match route {
        Some(key) => vec![RouteManager::new(store.clone()).resolve(key)?],
        None => store.list_routes()?,
    };

    let (pass, dispatch) = if dry_run {
        let snapshot = MemoryRouteStore::with_routes(selected.clone());
        save_thresholds(&snapshot, &load_thresholds(store.as_ref())?)?;
        let monitor = Monitor::new(Arc::new(snapshot), directions, config.monitor.workers);
        let dispatcher = Dispatcher::new(SummaryComposer::deterministic(), &config.push.title);
        let pass = monitor.run_pass_for(&selected)?;
        let dispatch = dispatcher.dispatch(&pass.verdicts);
        (pass, dispatch)
    } else {
        let monitor = Monitor::new(store, directions, config.monitor.workers);
        let dispatcher = build_dispatcher(config, ledger)?;
        let pass = monitor.run_pass_for(&selected)?;
        let dispatch = dispatcher.dispatch(&pass.verdicts);
        (pass, dispatch)
    };

    if dry_run {
        println!("(dry run: nothing saved or sent)");
    }
    print_cycle(&pass, &dispatch);
    Ok(())
}

fn routes(config: &Config, action: RouteAction) -> CliResult<()> {
    let (store, _) = open_store(config)?;
    let manager = build_manager(config, store)?;

    match action {
        RouteAction::Add { name, start, end, priority } => {
            let created = manager.create_route(&name, &start, &end, priority)?;
            println!(
                "Added route {} '{}' ({} -> {}, {})",
                created.route.id, created.route.name, created.route.start, created.route.end, created.route.priority
            );
            if let Some(path) = created.map {
                println!("Map saved to {}", path.display());
            }
        }
        RouteAction::List => {
            let listings = manager.list_routes()?;
            if listings.is_empty() {
                println!("No routes configured.");
            }
            for listing in listings {
                let route = &listing.route;
                let checked = route
                    .last_checked
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:>4}  {:<24} {:<7} {:<7} {} -> {}  {:>3} samples  checked {}  [{}]",
                    route.id,
                    route.name,
                    route.priority.as_str(),
                    route.last_state.as_str(),
                    route.start,
                    route.end,
                    route.history.len(),
                    checked,
                    listing.map
                );
            }
        }
        RouteAction::Priority { route, priority } => {
            let target = manager.resolve(&route)?;
            let updated = manager.update_priority(target.id, priority)?;
            println!("'{}' is now {} priority", updated.name, updated.priority);
        }
        RouteAction::Delete { route } => {
            let target = manager.resolve(&route)?;
            let deleted = manager.delete_route(target.id)?;
            println!("Deleted route {} '{}'", deleted.id, deleted.name);
        }
    }
    Ok(())
}

fn thresholds(config: &Config, action: ThresholdAction) -> CliResult<()> {
    let (store, _) = open_store(config)?;
    let manager = RouteManager::new(store);

    let table = match action {
        ThresholdAction::Show => manager.thresholds()?,
        ThresholdAction::Set {
            index,
            route_factor,
            segment_factor,
            route_delay,
            segment_delay,
        } => manager.update_thresholds(
            index,
            &BracketUpdate {
                route_factor,
                segment_factor,
                route_delay_threshold_sec: route_delay,
                segment_delay_threshold_sec: segment_delay,
            },
        )?,
        ThresholdAction::Reset => manager.reset_thresholds()?,
    };

    println!(
        "{:>3}  {:<14} {:>8} {:>8} {:>12} {:>12}",
        "#", "distance", "route x", "seg x", "route delay", "seg delay"
    );
    for (index, bracket) in table.brackets().iter().enumerate() {
        let range = format!("{}-{} km", bracket.min_km, bracket.max_km);
        println!(
            "{:>3}  {:<14} {:>8.2} {:>8.2} {:>10} m {:>10} m",
            index,
            range,
            bracket.route_factor,
            bracket.segment_factor,
            seconds_to_minutes(bracket.route_delay_threshold_sec),
            seconds_to_minutes(bracket.segment_delay_threshold_sec)
        );
    }
    Ok(())
}

fn balance(config: &Config, action: BalanceAction) -> CliResult<()> {
    let (_, ledger) = open_store(config)?;
    let tracker = BalanceTracker::load(config.balance.policy(), ledger)?;

    if let BalanceAction::Topup { amount } = action {
        if amount.is_sign_negative() {
            return Err("balance must not be negative".into());
        }
        tracker.top_up(amount);
        println!("Balance set to ${}", amount.round_dp(2));
    }

    let status = tracker.status();
    println!("Balance:   ${}", status.current_balance.round_dp(4));
    println!(
        "Usable:    ${} ({}% buffer)",
        status.usable_balance.round_dp(4),
        status.buffer_percent
    );
    println!("Spent:     ${} over {} request(s)", status.total_spent.round_dp(4), status.requests);
    match status.can_make_request() {
        Ok(()) if status.below_alert => println!("Status:    LOW"),
        Ok(()) => println!("Status:    OK"),
        Err(reason) => println!("Status:    DISABLED ({})", reason),
    }
    Ok(())
}

fn print_cycle(pass: &PassReport, dispatch: &DispatchReport) {
    for verdict in &pass.verdicts {
        let result = &verdict.result;
        println!(
            "{:<24} {:<6} delay {:>3} min (baseline {:>3} min){}",
            verdict.route.name,
            result.new_state().as_str(),
            seconds_to_minutes(result.current_delay_sec),
            seconds_to_minutes(result.baseline_delay_sec),
            if result.transition.is_change() { "  *changed*" } else { "" }
        );
    }
    for failure in &pass.failures {
        println!("{:<24} FAILED {}", failure.route_name, failure.error);
    }

    if !dispatch.chat_routes.is_empty() {
        println!(
            "Chat alert: {} ({})",
            dispatch.chat_routes.join(", "),
            if dispatch.chat_sent { "sent" } else { "not sent" }
        );
    }
    if let Some(message) = &dispatch.push_message {
        println!(
            "Push [{}]: {} ({})",
            message.priority,
            message.message,
            if dispatch.push_sent { "sent" } else { "not sent" }
        );
    }
}
