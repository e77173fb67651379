mod logging;

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, warn};
use magicfx_contracts::effects::{EffectDescriptor, EffectRegistry, STYLE_PRESETS};
use magicfx_contracts::events::EventWriter;
use magicfx_contracts::runs::history::{HistoryEntry, HistoryStore};
use magicfx_contracts::settings::Settings;
use magicfx_contracts::studio::{parse_intent, STUDIO_HELP_COMMANDS};
use magicfx_engine::editor::default_save_name;
use magicfx_engine::{
    transport_for, EditorView, GenerationResult, RunError, SessionManager, SessionSnapshot,
    SessionState, StatusSchedule,
};
use reqwest::blocking::Client as HttpClient;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "magicfx", version, about = "Run hosted creative-AI effects from the terminal")]
struct Cli {
    /// More console logging (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Also write a debug log to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the effect catalog.
    Effects(EffectsArgs),
    /// List style presets.
    Styles,
    /// Connect to a model and print its published endpoints.
    Inspect(InspectArgs),
    /// Run one effect and print the result.
    Run(RunArgs),
    /// Show recent generations.
    History(HistoryArgs),
    /// Interactive effect studio.
    Studio(StudioArgs),
}

#[derive(Debug, Parser)]
struct EffectsArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct InspectArgs {
    #[arg(long)]
    target: String,
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    effect: String,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    file: Option<PathBuf>,
    /// Style preset appended to the prompt; repeatable.
    #[arg(long)]
    style: Vec<String>,
    /// Download the result to this file or directory.
    #[arg(long)]
    save: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct StudioArgs {
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("magicfx error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::initialize(
        logging::level_for_verbosity(cli.verbose),
        cli.log_file.as_deref(),
    );
    let settings = Settings::from_env();
    debug!("settings: {settings:?}");
    match cli.command {
        Command::Effects(args) => run_effects(args),
        Command::Styles => run_styles(),
        Command::Inspect(args) => run_inspect(args, &settings),
        Command::Run(args) => run_effect(args, &settings),
        Command::History(args) => run_history(args, &settings),
        Command::Studio(args) => {
            run_studio(args, &settings)?;
            Ok(0)
        }
    }
}

fn run_effects(args: EffectsArgs) -> Result<i32> {
    let registry = EffectRegistry::default();
    let effects: Vec<&EffectDescriptor> = match args.category.as_deref() {
        Some(category) => registry.in_category(category),
        None => registry.list().collect(),
    };
    if effects.is_empty() {
        bail!(
            "no effects in category '{}' (categories: {})",
            args.category.unwrap_or_default(),
            registry.categories().join(", ")
        );
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&effects)?);
        return Ok(0);
    }
    for category in registry.categories() {
        let rows: Vec<&&EffectDescriptor> = effects
            .iter()
            .filter(|effect| effect.category == category)
            .collect();
        if rows.is_empty() {
            continue;
        }
        println!("{category}");
        for effect in rows {
            println!("  {}", format_effect_row(effect));
        }
    }
    Ok(0)
}

fn run_styles() -> Result<i32> {
    for preset in STYLE_PRESETS {
        println!("{:<14} {}", preset.name, preset.prompt);
    }
    Ok(0)
}

fn run_inspect(args: InspectArgs, settings: &Settings) -> Result<i32> {
    let transport = transport_for(settings, args.dryrun)?;
    let mut session = SessionManager::new(transport, StatusSchedule::default());
    session.open(&args.target);
    let snapshot = watch_session(
        &session,
        Duration::from_secs(args.connect_timeout),
        &mut io::stderr(),
    )?;
    ensure_ready(&snapshot)?;
    let description = session.describe()?;
    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(0)
}

fn run_effect(args: RunArgs, settings: &Settings) -> Result<i32> {
    let transport = transport_for(settings, args.dryrun)?;
    let mut editor = EditorView::new(transport, StatusSchedule::default())
        .with_history(history_store(settings));
    if let Some(events) = open_event_writer(args.events.as_deref()) {
        editor = editor.with_events(events);
    }

    editor.select(&args.effect)?;
    if let Some(prompt) = args.prompt.as_deref() {
        editor.set_prompt(prompt);
    }
    for style in &args.style {
        editor.apply_style(style)?;
    }
    if let Some(file) = args.file.as_deref() {
        editor.attach_file(file)?;
    }

    let snapshot = watch_session(
        editor.session(),
        Duration::from_secs(args.connect_timeout),
        &mut io::stderr(),
    )?;
    ensure_ready(&snapshot)?;

    let result = match editor.run() {
        Ok(result) => result.clone(),
        Err(err) => {
            print_attempts(&err);
            return Err(err.into());
        }
    };
    if let Some(seed) = result.seed {
        eprintln!("seed: {seed}");
    }
    println!("{}", result.display_text());

    if let Some(dest) = args.save.as_deref() {
        let saved = save_result(&download_client(settings)?, &result, dest)?;
        eprintln!("saved {}", saved.display());
    }
    Ok(0)
}

fn run_history(args: HistoryArgs, settings: &Settings) -> Result<i32> {
    let Some(store) = history_store(settings) else {
        bail!("history is disabled (MAGICFX_ENABLE_HISTORY)");
    };
    let entries = store.recent(args.limit);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }
    if entries.is_empty() {
        println!("No history yet ({}).", store.path().display());
    }
    for entry in &entries {
        println!("{}", format_history_row(entry));
    }
    Ok(0)
}

fn run_studio(args: StudioArgs, settings: &Settings) -> Result<()> {
    let transport = transport_for(settings, args.dryrun)?;
    let mut editor = EditorView::new(transport, StatusSchedule::default())
        .with_history(history_store(settings));
    if let Some(events) = open_event_writer(args.events.as_deref()) {
        editor = editor.with_events(events);
    }
    let connect_timeout = Duration::from_secs(args.connect_timeout);
    let http = download_client(settings)?;

    let stdin = io::stdin();
    let mut line = String::new();
    let mut seen_revision = 0u64;

    println!("magicfx studio. Type /help for commands, or /effects to browse.");

    loop {
        let snapshot = editor.snapshot();
        if snapshot.revision != seen_revision {
            if let Some(message) = snapshot.message.as_deref() {
                println!("[{}] {message}", snapshot.state);
            } else if snapshot.state == SessionState::Ready {
                println!("[ready] {}", snapshot.target.as_deref().unwrap_or_default());
            }
            seen_revision = snapshot.revision;
        }

        let label = editor
            .effect()
            .map(|effect| effect.id.clone())
            .unwrap_or_default();
        print!("{label}> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => {}
            "help" => {
                println!("Commands: {}", STUDIO_HELP_COMMANDS.join(" "));
                println!("Bare text sets the prompt and runs the selected effect.");
            }
            "list_effects" => {
                let registry = editor.registry();
                let effects = match intent.arg("category") {
                    Some(category) => registry.in_category(category),
                    None => registry.list().collect(),
                };
                if effects.is_empty() {
                    println!("Categories: {}", registry.categories().join(", "));
                }
                for effect in effects {
                    println!("{}", format_effect_row(effect));
                }
            }
            "select_effect" => match intent.arg("effect") {
                Some(effect_id) => match editor.select(effect_id) {
                    Ok(effect) => {
                        println!("{}: {}", effect.name, effect.description);
                        if !effect.input_kind.takes_file() {
                            println!("Type a prompt to generate.");
                        } else {
                            println!("Attach a {} with /file <path>.", effect.input_kind);
                        }
                    }
                    Err(err) => println!("{err:#}"),
                },
                None => println!("/effect requires an effect id"),
            },
            "list_styles" => {
                for preset in STYLE_PRESETS {
                    println!("{:<14} {}", preset.name, preset.prompt);
                }
            }
            "apply_style" => match intent.arg("style") {
                Some(style) => match editor.apply_style(style) {
                    Ok(_) => println!("Prompt: {}", editor.prompt()),
                    Err(err) => println!("{err:#}"),
                },
                None => println!("/style requires a name (see /styles)"),
            },
            "set_prompt" => {
                editor.set_prompt(intent.arg("prompt").unwrap_or_default());
                println!("Prompt: {}", editor.prompt());
            }
            "attach_file" => match intent.arg("path") {
                Some(path) => match editor.attach_file(path) {
                    Ok(()) => println!("Attached {path}"),
                    Err(err) => println!("{err:#}"),
                },
                None => println!("/file requires a path"),
            },
            "generate" => {
                if editor.effect().is_none() {
                    println!("Select an effect first (/effects, /effect <id>).");
                    continue;
                }
                editor.set_prompt(intent.prompt.as_deref().unwrap_or_default());
                studio_run(&mut editor, connect_timeout)?;
            }
            "run" => studio_run(&mut editor, connect_timeout)?,
            "status" => print_studio_status(&editor),
            "save_result" => match (editor.result(), intent.arg("path")) {
                (Some(result), Some(path)) => match save_result(&http, result, Path::new(path)) {
                    Ok(saved) => println!("Saved {}", saved.display()),
                    Err(err) => println!("Save failed: {err:#}"),
                },
                (None, _) => println!("Nothing to save yet."),
                (_, None) => println!("/save requires a path"),
            },
            "history" => {
                let limit = intent
                    .arg("limit")
                    .and_then(|value| value.parse::<usize>().ok())
                    .unwrap_or(DEFAULT_HISTORY_LIMIT);
                match history_store(settings) {
                    Some(store) => {
                        for entry in store.recent(limit) {
                            println!("{}", format_history_row(&entry));
                        }
                    }
                    None => println!("History is disabled."),
                }
            }
            "back" => {
                editor.back();
                seen_revision = 0;
                println!("Back to the catalog.");
            }
            "quit" => break,
            _ => {
                let command = intent.arg("command").unwrap_or_default();
                println!("Unknown command /{command}. Type /help.");
            }
        }
    }
    Ok(())
}

fn studio_run(editor: &mut EditorView, connect_timeout: Duration) -> Result<()> {
    if editor.effect().is_some() && editor.snapshot().state == SessionState::Connecting {
        watch_session(editor.session(), connect_timeout, &mut io::stdout())?;
    }
    match editor.run() {
        Ok(result) => {
            let text = result.display_text();
            match result.seed {
                Some(seed) => println!("Result (seed {seed}): {text}"),
                None => println!("Result: {text}"),
            }
        }
        Err(err) => print_run_failure(&err),
    }
    Ok(())
}

fn print_studio_status(editor: &EditorView) {
    let snapshot = editor.snapshot();
    match editor.effect() {
        Some(effect) => println!("Effect: {} ({})", effect.name, effect.model_id),
        None => println!("Effect: none"),
    }
    println!("Session: {}", describe_snapshot(&snapshot));
    println!("Prompt: {}", editor.prompt());
    if let Some(file) = editor.input().file.as_deref() {
        println!("File: {}", file.display());
    }
    if let Some(result) = editor.result() {
        println!("Result: {}", result.display_text());
    }
    if let Some(error) = editor.error() {
        println!("Error: {error}");
    }
    if let Some(blocker) = editor.run_gate() {
        println!("Run disabled: {blocker}");
    }
}

fn print_run_failure(err: &RunError) {
    eprintln!("{err}");
    print_attempts(err);
}

fn print_attempts(err: &RunError) {
    if let RunError::Dispatch(dispatch) = err {
        for attempt in dispatch.attempts() {
            eprintln!("  {}: {}", attempt.endpoint, attempt.error);
        }
    }
}

/// Waits for the session to resolve, writing each progress message to `out`.
fn watch_session(
    session: &SessionManager,
    timeout: Duration,
    out: &mut impl Write,
) -> Result<SessionSnapshot> {
    let deadline = Instant::now() + timeout;
    let mut snapshot = session.snapshot();
    let mut last_message: Option<String> = None;
    loop {
        if snapshot.message != last_message {
            if let Some(message) = snapshot.message.as_deref() {
                writeln!(out, "{message}")?;
            }
            last_message = snapshot.message.clone();
        }
        if snapshot.state != SessionState::Connecting {
            return Ok(snapshot);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(snapshot);
        }
        snapshot = session.wait_for_change(snapshot.revision, deadline - now);
    }
}

fn ensure_ready(snapshot: &SessionSnapshot) -> Result<()> {
    let target = snapshot.target.as_deref().unwrap_or_default();
    match snapshot.state {
        SessionState::Ready => Ok(()),
        SessionState::Failed => bail!(
            "{} ({target}: {})",
            snapshot.message.as_deref().unwrap_or("Connection failed."),
            snapshot.error.as_deref().unwrap_or("unknown error")
        ),
        SessionState::Connecting => bail!("timed out waiting for {target} to start"),
        SessionState::Idle => bail!("no session was opened"),
    }
}

fn describe_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut text = snapshot.state.to_string();
    if let Some(target) = snapshot.target.as_deref() {
        text.push_str(&format!(" ({target})"));
    }
    if let Some(message) = snapshot.message.as_deref() {
        text.push_str(&format!(": {message}"));
    }
    if let Some(error) = snapshot.error.as_deref() {
        text.push_str(&format!(" [{error}]"));
    }
    text
}

fn format_effect_row(effect: &EffectDescriptor) -> String {
    format!(
        "{:<16} {:<20} {:<6} {}",
        effect.id, effect.name, effect.input_kind, effect.model_id
    )
}

fn format_history_row(entry: &HistoryEntry) -> String {
    let result = match entry.result_text() {
        Some(text) => text.to_string(),
        None => entry.result.to_string(),
    };
    let seed = entry
        .seed
        .map(|seed| format!(" seed={seed}"))
        .unwrap_or_default();
    format!(
        "{} {} {}{} {}",
        entry.ts, entry.effect_id, entry.endpoint, seed, result
    )
}

fn history_store(settings: &Settings) -> Option<HistoryStore> {
    settings.history_file().map(HistoryStore::new)
}

fn open_event_writer(path: Option<&Path>) -> Option<EventWriter> {
    let path = path?;
    let session_id = uuid::Uuid::new_v4().to_string();
    Some(EventWriter::new(path, session_id))
}

fn download_client(settings: &Settings) -> Result<HttpClient> {
    let mut builder = HttpClient::builder().user_agent(concat!("magicfx/", env!("CARGO_PKG_VERSION")));
    if !settings.use_proxy {
        builder = builder.no_proxy();
    }
    builder.build().context("failed building download client")
}

fn resolve_save_path(dest: &Path, result: &GenerationResult) -> PathBuf {
    let names_directory = dest.is_dir() || dest.to_string_lossy().ends_with(['/', '\\']);
    if names_directory {
        dest.join(default_save_name(result))
    } else {
        dest.to_path_buf()
    }
}

fn save_result(http: &HttpClient, result: &GenerationResult, dest: &Path) -> Result<PathBuf> {
    let Some(url) = result.media_url() else {
        bail!("result has no URL: {}", result.media);
    };
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("result {url} is not downloadable");
    }
    let path = resolve_save_path(dest, result);
    let mut response = http
        .get(url)
        .send()
        .with_context(|| format!("download request failed ({url})"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("download failed ({}) for {url}", status.as_u16());
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file =
        fs::File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    let written = response
        .copy_to(&mut file)
        .with_context(|| format!("failed writing {}", path.display()))?;
    if written == 0 {
        warn!("downloaded an empty file from {url}");
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use magicfx_contracts::effects::{EffectRegistry, EndpointRef};
    use magicfx_contracts::runs::history::HistoryEntry;
    use magicfx_engine::{
        DryrunTransport, GenerationResult, SessionManager, SessionSnapshot, SessionState,
        StatusSchedule,
    };
    use serde_json::json;

    use super::{
        describe_snapshot, ensure_ready, format_effect_row, format_history_row,
        resolve_save_path, watch_session,
    };

    #[test]
    fn effect_rows_are_aligned() {
        let registry = EffectRegistry::default();
        let row = format_effect_row(registry.get("remove-bg").unwrap());
        assert_eq!(
            row,
            "remove-bg        Remove Background    image  briaai/RMBG-1.4"
        );
    }

    #[test]
    fn history_rows_show_seed_and_result() {
        let mut entry = HistoryEntry::new(
            "text-to-image",
            "black-forest-labs/FLUX.1-schnell",
            "/infer",
            json!("https://cdn.test/a.png"),
        );
        entry.ts = "2026-01-02T03:04:05Z".to_string();
        entry.seed = Some(12);
        assert_eq!(
            format_history_row(&entry),
            "2026-01-02T03:04:05Z text-to-image /infer seed=12 https://cdn.test/a.png"
        );
    }

    #[test]
    fn save_path_joins_directories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let result = GenerationResult {
            effect_id: "upscale".to_string(),
            endpoint: EndpointRef::Index(0),
            seed: None,
            media: json!("https://cdn.test/files/sharp.png"),
        };
        assert_eq!(
            resolve_save_path(temp.path(), &result),
            temp.path().join("sharp.png")
        );
        let explicit = temp.path().join("out.png");
        assert_eq!(resolve_save_path(&explicit, &result), explicit);
        Ok(())
    }

    #[test]
    fn watch_session_prints_messages_until_resolved() -> anyhow::Result<()> {
        let mut session =
            SessionManager::new(Arc::new(DryrunTransport::new()), StatusSchedule::silent());
        session.open("fail/offline");
        let mut out = Vec::new();
        let snapshot = watch_session(&session, Duration::from_secs(5), &mut out)?;
        assert_eq!(snapshot.state, SessionState::Failed);
        let printed = String::from_utf8(out)?;
        assert!(printed.ends_with("Connection failed. This tool might be temporarily offline.\n"));

        let err = ensure_ready(&snapshot).unwrap_err();
        assert!(format!("{err:#}").contains("fail/offline"));
        assert!(describe_snapshot(&snapshot).starts_with("failed (fail/offline)"));
        Ok(())
    }

    #[test]
    fn idle_snapshot_is_not_ready() {
        let idle = SessionSnapshot {
            target: None,
            state: SessionState::Idle,
            message: None,
            error: None,
            revision: 0,
        };
        assert!(ensure_ready(&idle).is_err());
        assert_eq!(describe_snapshot(&idle), "idle");
    }
}
