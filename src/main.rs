//! webview-bridge - Main Entry Point
//!
//! Replays engine events from an authority script through the decision
//! bridge and prints what the engine was told for each one.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use webview_bridge::{
    bridge::{BridgeCollaborators, HostBlockList, InMemoryCredentialStore, UnsupportedKeyLoader, WebViewBridge},
    channel::{AuthorityProcessor, IpcChannel, MessageChannel},
    config::{BridgeSettings, CliArgs},
    replay::{
        AuthorityScript, LoggingCookieFlusher, LoggingLauncher, RecordingScriptHost, ReplayRecord, Replayer,
        ScriptedAuthority,
    },
    NAME, VERSION,
};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const BLUE: &str = "\x1b[34m";
}

const DEFAULT_DECISION_TIMEOUT_MS: u64 = 5000;

fn print_banner() {
    println!(
        "{cyan}{bold}webview-bridge{reset} {dim}v{version}{reset}",
        cyan = colors::CYAN,
        bold = colors::BOLD,
        reset = colors::RESET,
        dim = colors::DIM,
        version = VERSION
    );
    println!();
}

fn on_off(enabled: bool) -> String {
    if enabled {
        format!("{green}yes{reset}", green = colors::GREEN, reset = colors::RESET)
    } else {
        format!("{yellow}no{reset}", yellow = colors::YELLOW, reset = colors::RESET)
    }
}

fn print_config_summary(settings: &BridgeSettings) {
    println!(
        "{bold}{blue}Configuration:{reset}",
        bold = colors::BOLD,
        blue = colors::BLUE,
        reset = colors::RESET
    );
    println!(
        "  {dim}Delegate navigation:{reset}  {}",
        on_off(settings.use_should_override_url_loading),
        dim = colors::DIM,
        reset = colors::RESET
    );
    println!(
        "  {dim}Resource observer:{reset}    {}",
        on_off(settings.use_on_load_resource),
        dim = colors::DIM,
        reset = colors::RESET
    );
    println!(
        "  {dim}Custom schemes:{reset}       {}",
        if settings.resource_custom_schemes.is_empty() {
            "-".to_string()
        } else {
            settings.resource_custom_schemes.join(", ")
        },
        dim = colors::DIM,
        reset = colors::RESET
    );
    println!(
        "  {dim}Scheme timeout:{reset}       {}",
        match settings.custom_scheme_timeout() {
            Some(timeout) => format!("{}ms", timeout.as_millis()),
            None => "until interrupted".to_string(),
        },
        dim = colors::DIM,
        reset = colors::RESET
    );
    println!(
        "  {dim}Blocked hosts:{reset}        {}",
        settings.blocked_hosts.len(),
        dim = colors::DIM,
        reset = colors::RESET
    );
    println!();
}

/// Build the CLI command parser
fn build_cli() -> Command {
    Command::new(NAME)
        .version(VERSION)
        .about("Replays web engine decisions against a scripted decision authority")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file (TOML or JSON)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("authority")
                .short('a')
                .long("authority")
                .value_name("FILE")
                .help("Authority script with canned responses and events (TOML or JSON)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("override-url-loading")
                .long("override-url-loading")
                .help("Delegate every navigation to the authority")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-override-url-loading")
                .long("no-override-url-loading")
                .help("Decide navigations locally")
                .action(ArgAction::SetTrue)
                .conflicts_with("override-url-loading"),
        )
        .arg(
            Arg::new("on-load-resource")
                .long("on-load-resource")
                .help("Inject the resource observer script")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("custom-scheme")
                .long("custom-scheme")
                .value_name("SCHEME")
                .help("Scheme served by the authority (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("block-host")
                .long("block-host")
                .value_name("HOST")
                .help("Host whose resources are blocked (repeatable)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("include-session-id")
                .long("include-session-id")
                .help("Tag payloads with the session id")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-secure-storage")
                .long("no-secure-storage")
                .help("Never persist credentials")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scheme-timeout")
                .long("scheme-timeout")
                .value_name("MS")
                .help("Custom scheme wait bound in milliseconds (0 = unbounded)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("buffer-size")
                .long("buffer-size")
                .value_name("COUNT")
                .help("Outbound channel capacity")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-sessions")
                .long("max-sessions")
                .value_name("COUNT")
                .help("Maximum number of live sessions (0 = unlimited)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("decision-timeout")
                .long("decision-timeout")
                .value_name("MS")
                .help("How long to wait for each asynchronous decision")
                .value_parser(clap::value_parser!(u64))
                .default_value("5000"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print decisions as JSON lines")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress output except errors")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose"),
        )
}

/// Parse CLI arguments into CliArgs struct
fn parse_cli_args(matches: &clap::ArgMatches) -> CliArgs {
    let mut args = CliArgs::default();

    args.config_file = matches.get_one::<PathBuf>("config").cloned();
    args.custom_scheme_timeout_ms = matches.get_one::<u64>("scheme-timeout").copied();
    args.channel_buffer_size = matches.get_one::<usize>("buffer-size").copied();
    args.max_sessions = matches.get_one::<usize>("max-sessions").copied();

    if matches.get_flag("override-url-loading") {
        args.use_should_override_url_loading = Some(true);
    } else if matches.get_flag("no-override-url-loading") {
        args.use_should_override_url_loading = Some(false);
    }

    if matches.get_flag("on-load-resource") {
        args.use_on_load_resource = Some(true);
    }
    if matches.get_flag("include-session-id") {
        args.include_session_id = Some(true);
    }
    if matches.get_flag("no-secure-storage") {
        args.secure_storage_supported = Some(false);
    }

    if let Some(schemes) = matches.get_many::<String>("custom-scheme") {
        args.resource_custom_schemes = Some(schemes.cloned().collect());
    }
    if let Some(hosts) = matches.get_many::<String>("block-host") {
        args.blocked_hosts = Some(hosts.cloned().collect());
    }

    args
}

/// Initialize the tracing/logging subsystem
fn init_tracing(verbosity: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn print_record(record: &ReplayRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(record)?);
    } else {
        println!("{}", record);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let verbosity = matches.get_count("verbose");
    let quiet = matches.get_flag("quiet");
    let json = matches.get_flag("json");

    init_tracing(verbosity, quiet);

    let cli_args = parse_cli_args(&matches);
    let settings = cli_args
        .load_settings()
        .context("Failed to load configuration")?;

    let script = match matches.get_one::<PathBuf>("authority") {
        Some(path) => AuthorityScript::from_file(path)
            .with_context(|| format!("Failed to load authority script {}", path.display()))?,
        None => {
            warn!("No authority script given, every decision falls back to its safe action");
            AuthorityScript::default()
        }
    };

    if !quiet && !json {
        print_banner();
        print_config_summary(&settings);
    }

    let ipc = Arc::new(IpcChannel::with_buffer_size(Handle::current(), settings.channel_buffer_size));
    let mut processor = AuthorityProcessor::new(&ipc).context("Authority receiver already taken")?;

    let authority = ScriptedAuthority::new(&script);
    let authority_task = tokio::spawn(async move {
        processor
            .process(move |method, payload| {
                let authority = authority.clone();
                async move { authority.answer(&method, payload) }
            })
            .await;
    });

    let channel: Arc<dyn MessageChannel> = ipc;
    let collaborators = BridgeCollaborators {
        launcher: Arc::new(LoggingLauncher::default()),
        credentials: Arc::new(InMemoryCredentialStore::new()),
        key_loader: Arc::new(UnsupportedKeyLoader),
        rules: Arc::new(HostBlockList::new(&settings.blocked_hosts)),
        cookies: Arc::new(LoggingCookieFlusher),
    };
    let bridge = Arc::new(WebViewBridge::new(&settings, channel, collaborators));

    let decision_timeout = Duration::from_millis(
        matches
            .get_one::<u64>("decision-timeout")
            .copied()
            .unwrap_or(DEFAULT_DECISION_TIMEOUT_MS),
    );
    let replayer = Replayer::new(bridge, Arc::new(RecordingScriptHost::new(true)), decision_timeout)?;
    info!("Replaying {} event(s) in session {}", script.events.len(), replayer.session().id());

    let events = script.events;
    let records = tokio::task::spawn_blocking(move || replayer.run(&events))
        .await
        .context("Replay task failed")?;

    for record in &records {
        print_record(record, json)?;
    }

    // The replayer owned the last bridge handle, so the request sender is
    // gone and the authority loop ends once in-flight calls drain.
    authority_task.await.context("Authority task failed")?;

    if !quiet && !json {
        println!();
        println!(
            "{green}Replayed {} event(s).{reset}",
            records.len(),
            green = colors::GREEN,
            reset = colors::RESET
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let matches = build_cli()
            .try_get_matches_from([
                "webview-bridge",
                "--authority",
                "script.toml",
                "--custom-scheme",
                "myapp",
                "--custom-scheme",
                "other",
                "--override-url-loading",
            ])
            .unwrap();

        let args = parse_cli_args(&matches);
        assert_eq!(
            args.resource_custom_schemes,
            Some(vec!["myapp".to_string(), "other".to_string()])
        );
        assert_eq!(args.use_should_override_url_loading, Some(true));
        assert_eq!(
            matches.get_one::<PathBuf>("authority"),
            Some(&PathBuf::from("script.toml"))
        );
    }

    #[test]
    fn test_cli_conflicts() {
        let result = build_cli().try_get_matches_from([
            "webview-bridge",
            "--override-url-loading",
            "--no-override-url-loading",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unset_flags_leave_settings_alone() {
        let matches = build_cli().try_get_matches_from(["webview-bridge"]).unwrap();
        let args = parse_cli_args(&matches);
        assert!(args.use_should_override_url_loading.is_none());
        assert!(args.resource_custom_schemes.is_none());
        assert!(args.secure_storage_supported.is_none());
        assert_eq!(matches.get_one::<u64>("decision-timeout"), Some(&5000));
    }
}
