use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Args, Parser, Subcommand};
use notecal::config::{self, Settings, WorkspaceFilter};
use notecal::core::Event;
use notecal::resolve;
use notecal::vault::FsVault;
use notecal::{FilterCriteria, Synchronizer};

#[derive(Debug, Parser)]
#[command(
    name = "notecal",
    about = "Calendar-event index over a vault of Markdown notes",
    version
)]
struct Cli {
    /// Vault root directory.
    #[arg(long, global = true, default_value = ".")]
    vault: PathBuf,
    /// Settings file (JSON). Defaults to <vault>/.notecal.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the index from every tracked document and list the events.
    Scan(ScanArgs),

    /// Apply a workspace filter (saved or ad-hoc) to the indexed events.
    Filter(FilterArgs),

    /// Rewrite an event's time tokens in its source line.
    Edit(EditArgs),

    /// Resolve an event id to its owning document and line.
    Show(ShowArgs),

    /// Insert a new event line into a daily note.
    Add(AddArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// Saved workspace filter (by name or id). Without it, ad-hoc flags apply;
    /// without those, the configured default filter is used.
    #[arg(long)]
    name: Option<String>,
    /// Restrict to these event types (default, TASK-TODO, TASK-DONE).
    #[arg(long = "type")]
    event_types: Vec<String>,
    /// Regular expression matched against event content.
    #[arg(long)]
    regex: Option<String>,
    /// Case-insensitive free-text match against event content.
    #[arg(long)]
    text: Option<String>,
    /// Client-side folder visibility override (repeatable).
    #[arg(long = "folder")]
    folders: Vec<String>,
    /// Persist the ad-hoc criteria as a new workspace filter with this name.
    #[arg(long)]
    save: Option<String>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct EditArgs {
    /// The event id to rewrite.
    id: String,
    /// New start (YYYY-MM-DD, YYYY-MM-DDTHH:MM, or "YYYY-MM-DD HH:MM").
    #[arg(long)]
    start: String,
    /// New end; omitted or equal to the start collapses the range.
    #[arg(long)]
    end: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// The event id to locate.
    id: String,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Event text, inserted below the configured heading.
    content: String,
    /// Target date for the daily note. Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Start time (HH:MM). Omitted makes an all-day entry.
    #[arg(long)]
    start: Option<String>,
    /// End time (HH:MM).
    #[arg(long)]
    end: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.vault.join(".notecal.json"));
    let settings = load_settings(&config_path)?;
    let mut sync = Synchronizer::new(FsVault::new(&cli.vault), settings);

    match cli.command {
        Commands::Scan(args) => handle_scan(&mut sync, args),
        Commands::Filter(args) => handle_filter(&mut sync, &config_path, args),
        Commands::Edit(args) => handle_edit(&mut sync, args),
        Commands::Show(args) => handle_show(&mut sync, args),
        Commands::Add(args) => handle_add(&mut sync, args),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.is_file() {
        return Ok(Settings::default());
    }
    let loaded = config::load(path).with_context(|| format!("loading settings {path:?}"))?;
    if loaded.needs_save() {
        // legacy shapes are upgraded in place, once
        config::save(path, &loaded.settings)
            .with_context(|| format!("rewriting migrated settings {path:?}"))?;
        tracing::info!(path = %path.display(), "persisted migrated settings");
    }
    Ok(loaded.settings)
}

fn handle_scan(sync: &mut Synchronizer<FsVault>, args: ScanArgs) -> Result<()> {
    let events = sync.fetch_all()?;
    print_events(&events, args.json)
}

fn handle_filter(
    sync: &mut Synchronizer<FsVault>,
    config_path: &Path,
    args: FilterArgs,
) -> Result<()> {
    let FilterArgs {
        name,
        event_types,
        regex,
        text,
        folders,
        save,
        json,
    } = args;

    let ad_hoc = !event_types.is_empty() || regex.is_some() || text.is_some();
    let criteria = if let Some(wanted) = &name {
        let filter = sync
            .settings()
            .workspace_filters
            .iter()
            .find(|filter| filter.id == *wanted || filter.name == *wanted)
            .with_context(|| format!("no workspace filter named {wanted:?}"))?;
        FilterCriteria::from(filter)
    } else if ad_hoc {
        FilterCriteria {
            event_types,
            content_regex: regex,
            content_text: text,
            ..FilterCriteria::default()
        }
    } else {
        sync.settings()
            .default_filter()
            .map(FilterCriteria::from)
            .unwrap_or_default()
    };

    if let Some(save_name) = save {
        let mut filter = WorkspaceFilter::new(save_name);
        filter.event_types = criteria.event_types.clone();
        filter.content_regex = criteria.content_regex.clone().unwrap_or_default();
        filter.folder_paths = folders.clone();
        let mut settings = sync.settings().clone();
        settings.workspace_filters.push(filter);
        config::save(config_path, &settings)
            .with_context(|| format!("saving settings {config_path:?}"))?;
        sync.update_settings(settings)?;
    }

    // Metadata-affecting entry point: refetch, then filter.
    let mut events = sync.refetch_and_filter(&criteria)?;
    if !folders.is_empty() {
        // Folder chips narrow client-side, without another fetch.
        let narrowed = criteria.with_folder_override(folders);
        events = sync.filter_events(&narrowed);
    }
    events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    print_events(&events, json)
}

fn handle_edit(sync: &mut Synchronizer<FsVault>, args: EditArgs) -> Result<()> {
    let EditArgs { id, start, end } = args;
    let new_start = parse_datetime(&start)?;
    let new_end = end.as_deref().map(parse_datetime).transpose()?;

    sync.full_rescan()?;
    let event = sync
        .store()
        .get(&id)
        .cloned()
        .with_context(|| format!("no indexed event with id {id}"))?;
    let updated = sync.edit_event(&event, new_start, new_end)?;
    println!("{} -> {} {}", event.id, updated.id, format_when(&updated));
    Ok(())
}

fn handle_show(sync: &mut Synchronizer<FsVault>, args: ShowArgs) -> Result<()> {
    sync.full_rescan()?;
    let known = sync
        .store()
        .get(&args.id)
        .map(|event| event.path.clone());
    let location = resolve::resolve(&args.id, known.as_deref(), sync.vault(), sync.settings())?;
    println!("{}:{}", location.path, location.line);
    Ok(())
}

fn handle_add(sync: &mut Synchronizer<FsVault>, args: AddArgs) -> Result<()> {
    let AddArgs {
        content,
        date,
        start,
        end,
    } = args;
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let start = start.as_deref().map(parse_time_arg).transpose()?;
    let end = end.as_deref().map(parse_time_arg).transpose()?;

    sync.full_rescan()?;
    let event = sync.create_event(date, start, end, &content)?;
    println!("created {} {}", event.id, format_when(&event));
    Ok(())
}

fn format_when(event: &Event) -> String {
    if event.all_day {
        return format!("{} (all day)", event.start.format("%Y-%m-%d"));
    }
    match event.end {
        Some(end) => format!(
            "{} {}-{}",
            event.start.format("%Y-%m-%d"),
            event.start.format("%H:%M"),
            end.format("%H:%M")
        ),
        None => format!(
            "{} {}",
            event.start.format("%Y-%m-%d"),
            event.start.format("%H:%M")
        ),
    }
}

fn print_events(events: &[Event], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(events)?);
        return Ok(());
    }
    if events.is_empty() {
        eprintln!("No events found.");
        return Ok(());
    }
    for event in events {
        println!(
            "{:<22} {:<9} {}  [{}]",
            format_when(event),
            event.event_type.as_str(),
            event.title,
            event.path
        );
    }
    Ok(())
}

fn parse_datetime(input: &str) -> Result<NaiveDateTime> {
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    anyhow::bail!("unrecognized date/time {input:?}; expected YYYY-MM-DD[THH:MM]")
}

fn parse_time_arg(input: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(input, "%H:%M")
        .with_context(|| format!("unrecognized time {input:?}; expected HH:MM"))
}
