use anyhow::{anyhow, Context as _, Result};
use campsite::analytics::{AnalyticsCache, DashboardService};
use campsite::auth::{GoTrueProvider, TokenService};
use campsite::booking::{BookingError, BookingStore, PaymentStatus};
use campsite::clock::{Clock, SystemClock};
use campsite::config::Config;
use campsite::error::{ApiError, AuthError};
use campsite::http::{ApiClient, UreqTransport};
use campsite::journal::Journal;
use campsite::marketplace::{MarketplaceApi, SpotFilter};
use campsite::navigation::{ConsoleNavigator, Navigator, RedirectGuard};
use campsite::redirect::RedirectLoopBreaker;
use campsite::session::SessionStore;
use campsite::storage::{FileStore, KeyValueStore};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Sign in with email and password
    Login {
        email: String,
        #[arg(long, env = "CAMPSITE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account
    Register {
        email: String,
        full_name: String,
        #[arg(long, env = "CAMPSITE_PASSWORD", hide_env_values = true)]
        password: String,
        /// Register as a spot owner
        #[arg(long)]
        owner: bool,
    },
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Print a valid access token
    Token {
        #[arg(long)]
        force: bool,
    },
    /// Search camping spots
    Spots {
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        guests: Option<u32>,
    },
    /// Show one spot
    Spot { id: String },
    /// List my bookings
    Bookings,
    /// Start a booking draft
    Book {
        spot: String,
        start: NaiveDate,
        end: NaiveDate,
        guests: u32,
    },
    /// Show the booking draft
    Draft,
    /// Discard the booking draft
    Cancel,
    /// Create the booking and open the payment page
    Checkout,
    /// Check the payment for the booking in progress
    Confirm,
    /// Owner analytics
    Dashboard {
        #[arg(long)]
        force: bool,
    },
    /// Clear redirect-loop counters
    ResetRedirects {
        /// Only reset when this URL carries the loop-broken marker
        #[arg(long)]
        url: Option<String>,
    },
    /// Interactive shell
    Shell,
}

/// One line typed into the shell
#[derive(Parser, Debug)]
#[command(name = "campsite", no_binary_name = true, disable_help_flag = true)]
struct ShellLine {
    #[command(subcommand)]
    command: Command,
}

pub struct Context {
    pub config: Config,
    pub storage_dir: PathBuf,
    pub journal: Arc<Journal>,
    pub navigator: Arc<dyn Navigator>,
    pub api: Arc<ApiClient>,
    pub sessions: SessionStore,
    pub market: MarketplaceApi,
    pub bookings: BookingStore,
    pub dashboard: DashboardService,
}

impl Context {
    /// Wire every service over file-backed storage in `storage_dir`
    pub fn build(config: Config, storage_dir: PathBuf, session_id: &str) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(&storage_dir.join("storage.json")).context("Opening storage")?,
        );
        let session_store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(&storage_dir.join("session.json")).context("Opening session storage")?,
        );
        let journal_path = storage_dir
            .join("journal")
            .join(format!("{}.jsonl", session_id));
        let journal = Arc::new(Journal::new(&journal_path, session_id)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let navigator: Arc<dyn Navigator> = Arc::new(ConsoleNavigator);

        let provider = Arc::new(GoTrueProvider::new(
            &config.auth.url,
            config.auth.resolve_anon_key(),
            config.api.auth_timeout(),
            store.clone(),
            clock.clone(),
        ));
        let tokens = Arc::new(TokenService::new(
            provider,
            store.clone(),
            clock.clone(),
            journal.clone(),
            config.auth.refresh_margin_secs,
        ));
        let breaker = Arc::new(RedirectLoopBreaker::new(
            session_store,
            clock.clone(),
            config.redirect.clone(),
        ));
        let redirects = Arc::new(RedirectGuard::new(
            breaker,
            navigator.clone(),
            journal.clone(),
            &config.redirect.login_route,
        ));
        let api = Arc::new(ApiClient::new(
            &config,
            Arc::new(UreqTransport::new()),
            tokens.clone(),
            redirects,
            store.clone(),
            clock.clone(),
            journal.clone(),
        ));

        let sessions = SessionStore::new(
            tokens,
            api.clone(),
            store.clone(),
            navigator.clone(),
            journal.clone(),
            config.auth.max_init_attempts,
        );
        let market = MarketplaceApi::new(api.clone());
        let bookings = BookingStore::new(config.booking.clone(), store.clone(), clock.clone());
        let dashboard = DashboardService::new(
            api.clone(),
            AnalyticsCache::new(config.dashboard.ttl_secs, store, clock.clone()),
            clock,
            journal.clone(),
        );

        Ok(Self {
            config,
            storage_dir,
            journal,
            navigator,
            api,
            sessions,
            market,
            bookings,
            dashboard,
        })
    }
}

fn api_error(e: ApiError) -> anyhow::Error {
    tracing::debug!(error = %e, "api call failed");
    anyhow!(e.user_message())
}

fn auth_error(e: AuthError) -> anyhow::Error {
    anyhow!(e.user_message())
}

fn booking_error(e: BookingError) -> anyhow::Error {
    match e {
        BookingError::Api(e) => api_error(e),
        other => anyhow!(other.to_string()),
    }
}

/// Run one command
pub fn dispatch(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let profile = ctx.sessions.login(&email, &password).map_err(auth_error)?;
            println!("Welcome back, {}", profile.full_name);
        }
        Command::Register {
            email,
            full_name,
            password,
            owner,
        } => {
            let profile = ctx
                .sessions
                .register(&email, &password, &full_name, owner)
                .map_err(auth_error)?;
            println!("Account created for {}", profile.full_name);
        }
        Command::Logout => {
            ctx.sessions.logout();
            println!("Signed out");
        }
        Command::Whoami => match ctx.sessions.current_profile() {
            Some(p) => {
                println!("{} <{}>", p.full_name, p.email.as_deref().unwrap_or("-"));
                println!("  id:    {}", p.id);
                println!("  owner: {}", if ctx.sessions.is_seller() { "yes" } else { "no" });
            }
            None => println!("Not signed in"),
        },
        Command::Token { force } => match ctx.sessions.get_auth_token(force).map_err(auth_error)? {
            Some(token) => println!("{}", token),
            None => println!("No session"),
        },
        Command::Spots { location, guests } => {
            let filter = SpotFilter {
                location,
                guests,
                ..Default::default()
            };
            let spots = ctx.market.list_spots(&filter).map_err(api_error)?;
            if spots.is_empty() {
                println!("No spots found");
            }
            for s in spots {
                println!(
                    "{:<16} {:<32} {:>8.2}/night  up to {} guests  {}",
                    s.id, s.title, s.nightly_rate, s.capacity, s.location
                );
            }
        }
        Command::Spot { id } => {
            let s = ctx.market.get_spot(&id).map_err(api_error)?;
            println!("{} ({})", s.title, s.id);
            println!("  Location:  {}", s.location);
            println!("  Price:     {:.2}/night", s.nightly_rate);
            println!("  Capacity:  {}", s.capacity);
            if !s.amenities.is_empty() {
                println!("  Amenities: {}", s.amenities.join(", "));
            }
            if let Some(rating) = s.rating {
                println!("  Rating:    {:.1}", rating);
            }
        }
        Command::Bookings => {
            let bookings = ctx.market.my_bookings().map_err(api_error)?;
            if bookings.is_empty() {
                println!("No bookings yet");
            }
            for b in bookings {
                println!(
                    "{:<12} {:<16} {} -> {}  {} guests  {:>8.2}  {}",
                    b.id, b.spot_id, b.start_date, b.end_date, b.guest_count, b.total, b.status
                );
            }
        }
        Command::Book {
            spot,
            start,
            end,
            guests,
        } => {
            let spot = ctx.market.get_spot(&spot).map_err(api_error)?;
            let draft = ctx
                .bookings
                .select_dates(&spot, start, end, guests)
                .map_err(booking_error)?;
            print_draft(&draft);
        }
        Command::Draft => match ctx.bookings.draft() {
            Some(draft) => print_draft(&draft),
            None => println!("No booking in progress"),
        },
        Command::Cancel => {
            ctx.bookings.cancel();
            println!("Booking draft discarded");
        }
        Command::Checkout => {
            let session = ctx
                .bookings
                .begin_checkout(&ctx.api, ctx.navigator.as_ref())
                .map_err(booking_error)?;
            println!("Booking {} created. Run `confirm` after paying.", session.booking_id);
        }
        Command::Confirm => match ctx.bookings.complete_checkout(&ctx.api).map_err(booking_error)? {
            PaymentStatus::Paid => println!("Payment received. Enjoy your stay!"),
            PaymentStatus::Pending => println!("Payment still pending"),
            status => println!("Payment status: {:?}", status),
        },
        Command::Dashboard { force } => {
            let a = ctx.dashboard.fetch_analytics(force).map_err(api_error)?;
            println!("Revenue:           {:.2}", a.revenue);
            println!("Bookings:          {}", a.bookings);
            println!("Occupancy:         {:.1}%", a.occupancy);
            println!("Average rating:    {:.1}", a.average_rating);
            println!("Active spots:      {}", a.active_spots);
            println!("Upcoming bookings: {}", a.upcoming_bookings);
            println!("As of:             {}", a.fetched_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        Command::ResetRedirects { url } => {
            let breaker = ctx.api.redirects().breaker();
            match url {
                Some(url) => {
                    if breaker.reset_if_marked(&url) {
                        println!("Loop marker found, redirect counters cleared");
                    } else {
                        println!("No loop marker in URL");
                    }
                }
                None => {
                    breaker.reset();
                    println!("Redirect counters cleared");
                }
            }
        }
        Command::Shell => println!("Already in the shell"),
    }
    Ok(())
}

fn print_draft(draft: &campsite::booking::BookingDraft) {
    let p = &draft.price;
    println!("{} ({})", draft.spot_title, draft.spot_id);
    println!("  {} -> {}, {} guests", draft.start_date, draft.end_date, draft.guest_count);
    println!("  {} nights x {:.2} = {:.2}", p.nights, p.nightly_rate, p.subtotal);
    println!("  Service fee: {:.2}", p.service_fee);
    println!("  Total:       {:.2}", p.total);
    if let Some(id) = &draft.booking_id {
        println!("  Booking id:  {}", id);
    }
}

fn print_help() {
    println!("Commands:");
    println!("  login <email> --password <pw>          - sign in");
    println!("  register <email> <name> --password <pw> [--owner]");
    println!("  logout | whoami | token [--force]");
    println!("  spots [--location L] [--guests N]      - search spots");
    println!("  spot <id> | bookings");
    println!("  book <spot> <start> <end> <guests>     - start a booking draft");
    println!("  draft | cancel | checkout | confirm");
    println!("  dashboard [--force]                    - owner analytics");
    println!("  reset-redirects [--url URL]");
    println!("  session                                - show session info");
    println!("  help | exit");
}

/// What a shell line asks for
#[derive(Debug)]
enum ShellInput {
    /// Nothing to do; `# ...` lines split to no words at all
    Blank,
    Exit,
    Help,
    Session,
    Run(Command),
    Invalid(String),
}

fn parse_input(line: &str) -> ShellInput {
    let words = match shell_words::split(line) {
        Ok(words) => words,
        Err(e) => return ShellInput::Invalid(format!("Parse error: {}", e)),
    };
    let Some(first) = words.first() else {
        return ShellInput::Blank;
    };
    match first.as_str() {
        "exit" | "quit" => ShellInput::Exit,
        "help" => ShellInput::Help,
        "session" => ShellInput::Session,
        _ => match ShellLine::try_parse_from(&words) {
            Ok(parsed) => ShellInput::Run(parsed.command),
            Err(e) => ShellInput::Invalid(e.to_string()),
        },
    }
}

pub fn run_repl(ctx: Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let history = ctx.storage_dir.join("history.txt");
    let _ = rl.load_history(&history);

    match ctx.sessions.current_profile() {
        Some(p) => println!("campsite - signed in as {}. Type help for commands.", p.full_name),
        None => println!("campsite - not signed in. Type help for commands."),
    }

    loop {
        match rl.readline("campsite> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                match parse_input(line) {
                    ShellInput::Blank => {}
                    ShellInput::Exit => break,
                    ShellInput::Help => print_help(),
                    ShellInput::Session => {
                        println!("Session: {}", ctx.journal.session_id());
                        println!("Journal: {:?}", ctx.journal.path);
                        println!("API:     {}", ctx.config.api.base_url);
                    }
                    ShellInput::Run(Command::Shell) => println!("Already in the shell"),
                    ShellInput::Run(command) => {
                        if let Err(e) = dispatch(&ctx, command) {
                            eprintln!("Error: {}", e);
                        }
                    }
                    ShellInput::Invalid(message) => eprintln!("{}", message),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(&history) {
        tracing::debug!(error = %e, "could not save shell history");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_line_parses_booking() {
        let words = shell_words::split("book lakeside 2026-08-01 2026-08-03 2").unwrap();
        let parsed = ShellLine::try_parse_from(&words).unwrap();
        match parsed.command {
            Command::Book { spot, start, guests, .. } => {
                assert_eq!(spot, "lakeside");
                assert_eq!(start, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
                assert_eq!(guests, 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_shell_line_quoted_args() {
        let words = shell_words::split(r#"spots --location "Big Sur" --guests 3"#).unwrap();
        let parsed = ShellLine::try_parse_from(&words).unwrap();
        match parsed.command {
            Command::Spots { location, guests } => {
                assert_eq!(location.as_deref(), Some("Big Sur"));
                assert_eq!(guests, Some(3));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_shell_line_rejects_bad_date() {
        let words = shell_words::split("book lakeside tomorrow 2026-08-03 2").unwrap();
        assert!(ShellLine::try_parse_from(&words).is_err());
    }

    #[test]
    fn test_comment_line_is_blank() {
        assert!(matches!(parse_input("# note"), ShellInput::Blank));
        assert!(matches!(parse_input("   "), ShellInput::Blank));
    }

    #[test]
    fn test_parse_input_builtins_and_errors() {
        assert!(matches!(parse_input("quit"), ShellInput::Exit));
        assert!(matches!(parse_input("help"), ShellInput::Help));
        assert!(matches!(parse_input("session"), ShellInput::Session));
        assert!(matches!(parse_input("spots \"unclosed"), ShellInput::Invalid(_)));
        assert!(matches!(parse_input("teleport"), ShellInput::Invalid(_)));
        assert!(matches!(
            parse_input("checkout"),
            ShellInput::Run(Command::Checkout)
        ));
    }
}
