use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trotro_core::prelude::*;
use trotro_transit::{Itinerary, NewAccount, RouteIdentifier, Session};

#[derive(Parser, Debug)]
#[command(
    name = "trotro",
    author,
    version,
    about = "Find direct trotro routes across Accra",
    long_about = "Looks up direct trotro routes between two stops, cheapest first, \
                  and can keep the results current as routes are edited."
)]
struct Cli {
    /// Project URL of the route store
    #[arg(long, env = "TROTRO_STORE_URL", global = true)]
    store_url: Option<String>,

    /// Public (anonymous) API key for the route store
    #[arg(long, env = "TROTRO_ANON_KEY", hide_env_values = true, global = true)]
    anon_key: Option<String>,

    /// Verbose output (show debug messages)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Credentials {
    #[arg(long, env = "TROTRO_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "TROTRO_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Reuse a session token instead of signing in
    #[arg(long, env = "TROTRO_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Suggest stop names as you would while typing
    Suggest { query: String },

    /// Find direct routes between two stops
    Search {
        start: String,
        destination: String,

        /// Select this route instead of the cheapest and show its details
        #[arg(long)]
        route: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Show your profile, recent searches and the routes you created
    History {
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Search, then keep the results current until interrupted
    Watch {
        start: String,
        destination: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Create an account
    SignUp {
        #[arg(long, env = "TROTRO_EMAIL")]
        email: String,

        #[arg(long, env = "TROTRO_PASSWORD", hide_env_values = true)]
        password: String,

        #[arg(long)]
        first_name: Option<String>,

        #[arg(long)]
        last_name: Option<String>,
    },

    /// Revoke a session token
    SignOut {
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Mail a password reset link
    ResetPassword {
        #[arg(long, env = "TROTRO_EMAIL")]
        email: String,
    },
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "warn,trotro=debug" } else { "warn,trotro=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().without_time().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = PlannerConfig::load(cli.store_url, cli.anon_key)
        .context("Failed to load configuration")?;
    let store = Arc::new(RestStore::new(&config.store).context("Failed to set up route store")?);
    let planner = Arc::new(Planner::from_store(&config, store.clone()));
    let _sweeper = planner.spawn_sweeper(&config);

    match cli.command {
        Command::Suggest { query } => {
            let suggestions = planner.suggest(&query).await;
            match suggestions.source {
                SuggestionSource::Skipped => println!("Type at least two characters."),
                SuggestionSource::RateLimited => println!("Too many lookups, slow down."),
                SuggestionSource::Bundled | SuggestionSource::Remote => {
                    if suggestions.stops.is_empty() {
                        println!("No stops match {query:?}.");
                    }
                    for stop in &suggestions.stops {
                        println!("{}", stop.name);
                    }
                }
            }
        }

        Command::Search {
            start,
            destination,
            route,
            credentials,
        } => {
            sign_in(&planner, &store, &credentials).await?;
            search(&planner, &start, &destination).await?;

            if let Some(route) = route {
                if !planner.select(&RouteIdentifier::new(&route)) {
                    bail!("Route {route} is not among the results");
                }
                print_results(&planner.display().snapshot());
            }
            if planner.display().read(|state| state.selected.is_some()) {
                print_route_info(planner.show_route_info().await?);
            }
        }

        Command::History { credentials } => {
            if sign_in(&planner, &store, &credentials).await?.is_none() {
                bail!("Sign in to see your history");
            }
            let Some(snapshot) = planner.refresh_profile().await else {
                bail!("Not signed in");
            };
            print_profile(&snapshot);
        }

        Command::Watch {
            start,
            destination,
            credentials,
        } => {
            let session = sign_in(&planner, &store, &credentials).await?;
            search(&planner, &start, &destination).await?;

            let mut feed = RealtimeFeed::new(&config.store, config.sync.heartbeat)
                .context("Failed to set up change feed")?;
            if let Some(session) = &session {
                feed = feed.with_access_token(session.access_token.clone());
            }

            let sync = LiveSyncController::new(planner.clone(), Arc::new(feed), config.sync.clone());
            watch(&planner, &sync).await;
        }

        Command::SignUp {
            email,
            password,
            first_name,
            last_name,
        } => {
            let account = NewAccount {
                email,
                password,
                first_name,
                last_name,
            };
            match planner.sign_up(store.as_ref(), &account).await? {
                Some(session) => println!("Signed up and signed in as {}.", session.user_id),
                None => println!("Account created. Check {} for a confirmation link.", account.email),
            }
        }

        Command::SignOut { credentials } => {
            if sign_in(&planner, &store, &credentials).await?.is_none() {
                bail!("Nothing to sign out of: pass --access-token");
            }
            planner
                .sign_out(store.as_ref())
                .await
                .context("Failed to revoke session")?;
            println!("Signed out.");
        }

        Command::ResetPassword { email } => {
            planner
                .send_password_reset(store.as_ref(), Some(&email))
                .await
                .context("Failed to request password reset")?;
            println!("Check {email} for a password reset link.");
        }
    }

    Ok(())
}

async fn sign_in(
    planner: &Planner,
    store: &RestStore,
    credentials: &Credentials,
) -> Result<Option<Session>> {
    let session = match (&credentials.access_token, &credentials.email, &credentials.password) {
        (Some(token), _, _) => planner
            .resume_session(store, token)
            .await
            .context("Session token was rejected")?,
        (None, Some(email), Some(password)) => planner
            .sign_in(store, email, password)
            .await
            .context("Sign in failed")?,
        _ => return Ok(None),
    };
    Ok(Some(session))
}

async fn search(planner: &Planner, start: &str, destination: &str) -> Result<()> {
    match planner.search(start, destination).await {
        Ok(outcome) => {
            if !outcome.found_direct_route() {
                println!("No direct route from {start} to {destination}.");
            }
            print_results(&planner.display().snapshot());
            println!("{} searches left this minute.", outcome.remaining);
            Ok(())
        }
        Err(SearchError::AuthRequired) => {
            bail!("Sign in to search: pass --email and --password, or --access-token")
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(planner: &Planner, sync: &Arc<LiveSyncController>) {
    if let Err(e) = sync.connect().await {
        warn!(error = %e, "live updates unavailable");
    }

    let mut display = planner.display().subscribe();
    let mut connection = sync.watch_connection();
    info!("watching for route changes, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = display.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("-- routes updated --");
                print_results(&display.borrow_and_update());
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                info!(%state, "live updates");
                if state == ConnectionState::Disconnected {
                    // Reconnect now instead of waiting out the controller's retry
                    // delay. The new listener replaces the one that was waiting.
                    if let ResumeOutcome::Refreshed { reconnected: true } = sync.resume().await {
                        info!("reconnected");
                    }
                }
            }
        }
    }

    sync.teardown();
}

// ============================================================================
// Output
// ============================================================================

fn print_results(state: &DisplayState) {
    for itinerary in &state.itineraries {
        let selected = state
            .selected
            .as_ref()
            .is_some_and(|current| current.id == itinerary.id);
        print_itinerary(itinerary, selected);
    }
}

fn print_itinerary(itinerary: &Itinerary, selected: bool) {
    let marker = if selected { "*" } else { " " };
    let fare = itinerary
        .total_fare
        .map(|fare| format!("GH₵ {fare:.2}"))
        .unwrap_or_else(|| "fare unknown".to_owned());
    let distance = itinerary
        .total_distance
        .map(|km| format!("{km:.1} km"))
        .unwrap_or_default();

    println!(
        "{marker} [{}] {}  {fare}  {distance}  ({} stops between)",
        itinerary.id,
        itinerary.name,
        itinerary.intermediate_stop_count()
    );

    if !selected {
        return;
    }
    for (i, stop) in itinerary.stops.iter().enumerate() {
        let leg = match (stop.fare_to_next, stop.distance_to_next) {
            (Some(fare), Some(km)) => format!("  -> GH₵ {fare:.2}, {km:.1} km"),
            (Some(fare), None) => format!("  -> GH₵ {fare:.2}"),
            (None, Some(km)) => format!("  -> {km:.1} km"),
            (None, None) => String::new(),
        };
        println!("      {}. {}{leg}", i + 1, stop.name);
    }
}

fn print_route_info(info: Option<trotro_transit::RouteInfo>) {
    let Some(info) = info else {
        return;
    };
    if let Some(description) = &info.description {
        println!("{description}");
    }
    if let Some(hours) = &info.operating_hours {
        println!("Hours: {hours}");
    }
    if !info.landmarks.is_empty() {
        println!("Landmarks: {}", info.landmarks.join(", "));
    }
    if let Some(notes) = &info.notes {
        println!("Notes: {notes}");
    }
}

fn print_profile(snapshot: &ProfileSnapshot) {
    if let Some(profile) = &snapshot.profile {
        let name = profile.display_name().unwrap_or_else(|| profile.id.to_string());
        println!("{name}");
    }

    println!("Recent searches:");
    if snapshot.search_history.is_empty() {
        println!("  none");
    }
    for entry in &snapshot.search_history {
        println!(
            "  {}  {} -> {}",
            entry.searched_at.format("%Y-%m-%d %H:%M"),
            entry.start_point,
            entry.destination
        );
    }

    println!("Routes you created:");
    if snapshot.created_routes.is_empty() {
        println!("  none");
    }
    for route in &snapshot.created_routes {
        println!(
            "  {}  {} -> {}",
            route.name.as_deref().unwrap_or("(unnamed)"),
            route.start_point.as_deref().unwrap_or("?"),
            route.destination.as_deref().unwrap_or("?")
        );
    }
}
