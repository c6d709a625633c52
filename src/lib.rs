//! Calendar-event extraction and indexing over a vault of Markdown notes.
//! The index is derived state, never the system of record: it is rebuilt from
//! document text on load, kept in sync by targeted re-parses, and edits are
//! written back into the owning source line before the index learns of them.

pub use crate::filter::FilterCriteria;
pub use crate::sync::{DocChange, Synchronizer};

pub mod core {
    //! Shared data model and the domain error taxonomy.

    use chrono::NaiveDateTime;
    use serde::{Deserialize, Serialize};

    /* -------------------------------- Events -------------------------------- */

    /// The kind of line an event was derived from; filters match on the label.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum EventType {
        #[serde(rename = "default")]
        Default,
        #[serde(rename = "TASK-TODO")]
        TaskTodo,
        #[serde(rename = "TASK-DONE")]
        TaskDone,
    }

    impl EventType {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Default => "default",
                Self::TaskTodo => "TASK-TODO",
                Self::TaskDone => "TASK-DONE",
            }
        }
    }

    /// One indexed calendar event, derived from a single document line.
    ///
    /// The id doubles as a reverse pointer into the source document (see
    /// [`crate::locid`]) and is only meaningful until the owning document's
    /// next re-parse. Events are replaced wholesale with their document, never
    /// mutated field by field.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Event {
        pub id: String,
        /// Display text with date/time sub-patterns stripped.
        pub title: String,
        /// The line's content after the bullet prefix, untouched.
        pub content: String,
        pub start: NaiveDateTime,
        pub end: Option<NaiveDateTime>,
        pub all_day: bool,
        pub event_type: EventType,
        /// Owning document; preferred over date-based lookup when resolving.
        pub path: String,
    }

    /* -------------------------------- Errors -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum IdError {
        #[error("malformed event id {0:?}: expected 14 timestamp digits followed by a line number")]
        MalformedId(String),
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ResolveError {
        #[error(transparent)]
        MalformedId(#[from] IdError),
        #[error("no document resolves event {0}")]
        EventNotFound(String),
    }

    #[derive(Debug, thiserror::Error)]
    pub enum EditError {
        #[error(transparent)]
        MalformedId(#[from] IdError),
        #[error("the document or line for event {0} no longer exists")]
        LocationNotFound(String),
        #[error("no recognizable time token to rewrite in {0:?}")]
        NoRecognizableTimeToken(String),
        #[error("vault I/O failed: {0}")]
        Vault(String),
    }

    impl From<anyhow::Error> for EditError {
        fn from(err: anyhow::Error) -> Self {
            Self::Vault(format!("{err:#}"))
        }
    }

    impl From<ResolveError> for EditError {
        fn from(err: ResolveError) -> Self {
            match err {
                ResolveError::MalformedId(inner) => Self::MalformedId(inner),
                ResolveError::EventNotFound(id) => Self::LocationNotFound(id),
            }
        }
    }
}

pub mod locid {
    //! The location codec: an event id is its nominal timestamp, zero-padded to
    //! 14 digits (`YYYYMMDDHHmmss`), immediately followed by the 0-based source
    //! line number in decimal, with no separator. This codec is the only
    //! component allowed to interpret the line segment.
    //!
    //! Line numbers are positional, so inserting or deleting lines above an
    //! event invalidates every id below the edit point until the next re-parse;
    //! any successful re-parse supersedes all of that document's prior ids.

    use crate::core::IdError;
    use chrono::NaiveDateTime;

    pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
    const TIMESTAMP_DIGITS: usize = 14;

    pub fn encode(timestamp: NaiveDateTime, line: usize) -> String {
        format!("{}{line}", timestamp.format(TIMESTAMP_FORMAT))
    }

    /// Invert [`encode`]. Requires at least 14 leading digits and a non-empty
    /// decimal line segment.
    pub fn decode(id: &str) -> Result<(NaiveDateTime, usize), IdError> {
        let malformed = || IdError::MalformedId(id.to_string());
        if id.len() <= TIMESTAMP_DIGITS || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let (stamp, line) = id.split_at(TIMESTAMP_DIGITS);
        let timestamp =
            NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|_| malformed())?;
        let line = line.parse::<usize>().map_err(|_| malformed())?;
        Ok((timestamp, line))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, 0)
                .unwrap()
        }

        #[test]
        fn encodes_without_separator_or_line_padding() {
            assert_eq!(encode(at(2024, 1, 5, 9, 0), 7), "202401050900007");
            assert_eq!(encode(at(2024, 1, 5, 9, 0), 120), "20240105090000120");
        }

        #[test]
        fn decode_inverts_encode() {
            let stamp = at(2024, 1, 5, 9, 0);
            assert_eq!(decode(&encode(stamp, 7)).unwrap(), (stamp, 7));
            assert_eq!(decode(&encode(stamp, 120)).unwrap(), (stamp, 120));
        }

        #[test]
        fn rejects_ids_without_a_line_segment() {
            assert!(matches!(
                decode("20240105090000"),
                Err(IdError::MalformedId(_))
            ));
        }

        #[test]
        fn rejects_non_digit_ids() {
            assert!(decode("2024-01-05T09:00").is_err());
            assert!(decode("garbage").is_err());
            assert!(decode("").is_err());
        }

        #[test]
        fn rejects_impossible_timestamps() {
            // month 99
            assert!(decode("202499050900007").is_err());
        }
    }
}

pub mod config {
    //! Persisted configuration: calendar options, extra folders, workspace
    //! filters, and the delayed-commit apply timer. Field names on the wire keep
    //! the shapes the settings file has always used, including the legacy
    //! bare-path form of `ExtraFolders`, which is upgraded in place on load.

    use anyhow::{Context, Result};
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize};
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    pub const DEFAULT_FOLDER_COLOR: &str = "#80d0ff";

    /// Default delay before scheduled settings are committed.
    pub const DEFAULT_APPLY_DELAY: Duration = Duration::from_millis(100);

    /* ----------------------------- Extra folders ----------------------------- */

    /// An additional tracked folder; the color is presentation-only.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExtraFolder {
        pub path: String,
        #[serde(default = "default_folder_color")]
        pub color: String,
    }

    fn default_folder_color() -> String {
        DEFAULT_FOLDER_COLOR.to_string()
    }

    fn extra_folders_compat<'de, D>(deserializer: D) -> Result<Vec<ExtraFolder>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Compat {
            Legacy(String),
            Current(ExtraFolder),
        }

        let entries = Vec::<Compat>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| match entry {
                Compat::Legacy(path) => ExtraFolder {
                    path,
                    color: default_folder_color(),
                },
                Compat::Current(folder) => folder,
            })
            .collect())
    }

    /* --------------------------- Workspace filters --------------------------- */

    /// A named predicate bundle narrowing which events are presented.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WorkspaceFilter {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub event_types: Vec<String>,
        #[serde(default)]
        pub content_regex: String,
        #[serde(default)]
        pub folder_paths: Vec<String>,
        #[serde(default)]
        pub metadata_keys: Vec<String>,
        #[serde(default)]
        pub metadata_values: IndexMap<String, String>,
        #[serde(default = "default_true")]
        pub is_enabled: bool,
    }

    fn default_true() -> bool {
        true
    }

    impl WorkspaceFilter {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                id: format!("filter-{}", Uuid::new_v4()),
                name: name.into(),
                event_types: Vec::new(),
                content_regex: String::new(),
                folder_paths: Vec::new(),
                metadata_keys: Vec::new(),
                metadata_values: IndexMap::new(),
                is_enabled: true,
            }
        }

        /// The built-in filter every settings file starts out with.
        pub fn fallback_default() -> Self {
            Self {
                id: "default".to_string(),
                name: "Default".to_string(),
                event_types: Vec::new(),
                content_regex: String::new(),
                folder_paths: Vec::new(),
                metadata_keys: Vec::new(),
                metadata_values: IndexMap::new(),
                is_enabled: true,
            }
        }
    }

    /* -------------------------------- Settings -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase", default)]
    pub struct Settings {
        /// First day of the week shown by the presentation layer.
        pub start_date: String,
        pub day_start_hour: u8,
        pub day_end_hour: u8,
        /// Heading new event lines are inserted under.
        pub insert_after: String,
        /// When non-empty, daily-note lines are only processed below the first
        /// line starting with this marker; a daily note without the marker
        /// yields no events.
        pub process_entries_below: String,
        /// Template for composed event lines (`{TIME}`, `{CONTENT}`).
        pub default_event_composition: String,
        /// Folder containing `YYYY-MM-DD.md` daily notes.
        pub daily_notes_folder: String,
        #[serde(deserialize_with = "extra_folders_compat")]
        pub extra_folders: Vec<ExtraFolder>,
        pub workspace_filters: Vec<WorkspaceFilter>,
        pub default_filter_id: String,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                start_date: "Sunday".to_string(),
                day_start_hour: 0,
                day_end_hour: 24,
                insert_after: "# Journal".to_string(),
                process_entries_below: String::new(),
                default_event_composition: "{TIME} {CONTENT}".to_string(),
                daily_notes_folder: "Daily".to_string(),
                extra_folders: Vec::new(),
                workspace_filters: vec![WorkspaceFilter::fallback_default()],
                default_filter_id: "default".to_string(),
            }
        }
    }

    impl Settings {
        /// Repair invariants: at least one filter exists and the default id
        /// points at one of them. Returns true when something was fixed.
        pub fn normalize(&mut self) -> bool {
            let mut changed = false;
            if self.workspace_filters.is_empty() {
                self.workspace_filters.push(WorkspaceFilter::fallback_default());
                changed = true;
            }
            if !self
                .workspace_filters
                .iter()
                .any(|filter| filter.id == self.default_filter_id)
            {
                self.default_filter_id = self.workspace_filters[0].id.clone();
                changed = true;
            }
            changed
        }

        pub fn default_filter(&self) -> Option<&WorkspaceFilter> {
            self.workspace_filters
                .iter()
                .find(|filter| filter.id == self.default_filter_id)
                .or_else(|| self.workspace_filters.first())
        }
    }

    /* ------------------------------ Load / save ------------------------------ */

    /// Settings as loaded from disk, with flags describing upgrades that should
    /// be persisted once.
    #[derive(Debug, Clone)]
    pub struct LoadedSettings {
        pub settings: Settings,
        /// Legacy bare-path ExtraFolders were upgraded to `{path, color}`.
        pub migrated_folders: bool,
        /// The default-filter invariant had to be repaired.
        pub repaired: bool,
    }

    impl LoadedSettings {
        pub fn needs_save(&self) -> bool {
            self.migrated_folders || self.repaired
        }
    }

    pub fn load(path: &Path) -> Result<LoadedSettings> {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading settings {path:?}"))?;
        parse(&text)
    }

    pub fn parse(text: &str) -> Result<LoadedSettings> {
        let raw: serde_json::Value =
            serde_json::from_str(text).context("settings file is not valid JSON")?;
        let migrated_folders = raw
            .get("ExtraFolders")
            .and_then(|folders| folders.as_array())
            .is_some_and(|folders| folders.iter().any(|entry| entry.is_string()));
        let mut settings: Settings =
            serde_json::from_value(raw).context("settings file has an unexpected shape")?;
        let repaired = settings.normalize();
        Ok(LoadedSettings {
            settings,
            migrated_folders,
            repaired,
        })
    }

    pub fn save(path: &Path, settings: &Settings) -> Result<()> {
        let text = serde_json::to_string_pretty(settings).context("serializing settings")?;
        fs::write(path, format!("{text}\n")).with_context(|| format!("writing settings {path:?}"))
    }

    /* ---------------------------- Delayed commits ---------------------------- */

    /// Delayed-commit timer for settings writes: rapid consecutive changes
    /// collapse into one persist. Cooperative and cancellable; the host drives
    /// it by calling [`ApplyDebouncer::poll`] from its tick.
    #[derive(Debug)]
    pub struct ApplyDebouncer {
        delay: Duration,
        pending: Option<(Instant, Settings)>,
    }

    impl ApplyDebouncer {
        pub fn new(delay: Duration) -> Self {
            Self { delay, pending: None }
        }

        /// Replace any pending commit and restart the clock.
        pub fn schedule(&mut self, settings: Settings, now: Instant) {
            self.pending = Some((now + self.delay, settings));
        }

        pub fn cancel(&mut self) {
            self.pending = None;
        }

        pub fn is_armed(&self) -> bool {
            self.pending.is_some()
        }

        /// Take the settings once their commit deadline has passed.
        pub fn poll(&mut self, now: Instant) -> Option<Settings> {
            match &self.pending {
                Some((due, _)) if *due <= now => self.pending.take().map(|(_, settings)| settings),
                _ => None,
            }
        }
    }

    impl Default for ApplyDebouncer {
        fn default() -> Self {
            Self::new(DEFAULT_APPLY_DELAY)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults_match_the_documented_settings() {
            let settings = Settings::default();
            assert_eq!(settings.start_date, "Sunday");
            assert_eq!(settings.day_start_hour, 0);
            assert_eq!(settings.day_end_hour, 24);
            assert_eq!(settings.default_event_composition, "{TIME} {CONTENT}");
            assert_eq!(settings.default_filter_id, "default");
            assert!(settings.extra_folders.is_empty());
            assert_eq!(settings.workspace_filters.len(), 1);
        }

        #[test]
        fn legacy_extra_folders_migrate_in_place() {
            let loaded = parse(
                r##"{"ExtraFolders": ["projects", {"path": "clients", "color": "#ff0000"}]}"##,
            )
            .unwrap();
            assert!(loaded.migrated_folders);
            assert!(loaded.needs_save());
            assert_eq!(
                loaded.settings.extra_folders[0],
                ExtraFolder {
                    path: "projects".into(),
                    color: DEFAULT_FOLDER_COLOR.into()
                }
            );
            assert_eq!(loaded.settings.extra_folders[1].color, "#ff0000");
        }

        #[test]
        fn missing_color_defaults_without_flagging_migration() {
            let loaded = parse(r#"{"ExtraFolders": [{"path": "projects"}]}"#).unwrap();
            assert!(!loaded.migrated_folders);
            assert!(!loaded.needs_save());
            assert_eq!(loaded.settings.extra_folders[0].color, DEFAULT_FOLDER_COLOR);
        }

        #[test]
        fn dangling_default_filter_id_is_repaired() {
            let loaded = parse(
                r#"{"DefaultFilterId": "nope", "WorkspaceFilters": [{"id": "work", "name": "Work"}]}"#,
            )
            .unwrap();
            assert!(loaded.repaired);
            assert!(loaded.needs_save());
            assert_eq!(loaded.settings.default_filter_id, "work");
            assert_eq!(loaded.settings.default_filter().unwrap().id, "work");
        }

        #[test]
        fn round_trips_through_save_and_load() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("settings.json");
            let mut settings = Settings::default();
            settings.extra_folders.push(ExtraFolder {
                path: "projects".into(),
                color: "#123456".into(),
            });
            save(&path, &settings).unwrap();
            let loaded = load(&path).unwrap();
            assert!(!loaded.needs_save());
            assert_eq!(loaded.settings, settings);
        }

        #[test]
        fn debouncer_commits_after_the_delay() {
            let mut debouncer = ApplyDebouncer::new(Duration::from_millis(100));
            let t0 = Instant::now();
            debouncer.schedule(Settings::default(), t0);
            assert!(debouncer.poll(t0 + Duration::from_millis(50)).is_none());
            assert!(debouncer.is_armed());
            assert!(debouncer.poll(t0 + Duration::from_millis(150)).is_some());
            assert!(!debouncer.is_armed());
        }

        #[test]
        fn debouncer_restarts_and_cancels() {
            let mut debouncer = ApplyDebouncer::new(Duration::from_millis(100));
            let t0 = Instant::now();
            debouncer.schedule(Settings::default(), t0);
            debouncer.schedule(Settings::default(), t0 + Duration::from_millis(90));
            assert!(debouncer.poll(t0 + Duration::from_millis(120)).is_none());
            debouncer.cancel();
            assert!(debouncer.poll(t0 + Duration::from_millis(500)).is_none());
        }
    }
}

pub mod vault {
    //! The host/document-storage boundary: path classification, daily-note
    //! naming, and a small repository trait with a filesystem implementation.
    //! Paths are vault-relative and '/'-separated regardless of platform.

    use crate::config::Settings;
    use anyhow::{Context, Result, anyhow};
    use chrono::NaiveDate;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    /* ----------------------------- Classification ----------------------------- */

    /// How a vault path relates to the engine's tracked set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DocumentKind {
        /// A date-named daily note.
        Daily(NaiveDate),
        /// A note under one of the configured extra folders.
        Extra,
        Untracked,
    }

    impl DocumentKind {
        pub fn is_tracked(self) -> bool {
            !matches!(self, Self::Untracked)
        }

        pub fn daily_date(self) -> Option<NaiveDate> {
            match self {
                Self::Daily(date) => Some(date),
                _ => None,
            }
        }
    }

    /// Classify a path. Daily classification wins when a daily note also sits
    /// under an extra folder. Untracked documents are invisible to the engine.
    pub fn classify(path: &str, settings: &Settings) -> DocumentKind {
        if let Some(date) = daily_date_of(path, settings) {
            return DocumentKind::Daily(date);
        }
        if path.ends_with(".md")
            && settings
                .extra_folders
                .iter()
                .any(|folder| in_folder(path, &folder.path))
        {
            return DocumentKind::Extra;
        }
        DocumentKind::Untracked
    }

    /// Whether `path` lives under `folder` (prefix match on whole segments).
    pub fn in_folder(path: &str, folder: &str) -> bool {
        let folder = folder.trim_end_matches('/');
        !folder.is_empty()
            && path
                .strip_prefix(folder)
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|rest| !rest.is_empty())
    }

    fn daily_date_of(path: &str, settings: &Settings) -> Option<NaiveDate> {
        let name = if settings.daily_notes_folder.is_empty() {
            path
        } else {
            path.strip_prefix(&settings.daily_notes_folder)?
                .strip_prefix('/')?
        };
        if name.contains('/') {
            return None;
        }
        let stem = name.strip_suffix(".md")?;
        NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
    }

    /// The vault-relative path of the daily note for `date`.
    pub fn daily_note_path(date: NaiveDate, settings: &Settings) -> String {
        let name = format!("{}.md", date.format("%Y-%m-%d"));
        if settings.daily_notes_folder.is_empty() {
            name
        } else {
            format!("{}/{name}", settings.daily_notes_folder)
        }
    }

    /* ------------------------------- Repository ------------------------------- */

    /// Document storage as the engine sees it.
    pub trait Vault {
        /// Every Markdown document in the vault.
        fn list_documents(&self) -> Result<Vec<String>>;
        fn read(&self, path: &str) -> Result<String>;
        fn write(&self, path: &str, text: &str) -> Result<()>;
        fn exists(&self, path: &str) -> bool;
    }

    /* ------------------------------- Filesystem ------------------------------- */

    /// Filesystem-backed vault rooted at a directory.
    #[derive(Debug)]
    pub struct FsVault {
        root: PathBuf,
    }

    impl FsVault {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        fn abs(&self, rel: &str) -> PathBuf {
            let mut out = self.root.clone();
            for segment in rel.split('/') {
                out.push(segment);
            }
            out
        }
    }

    impl Vault for FsVault {
        fn list_documents(&self) -> Result<Vec<String>> {
            fn visit(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
                for entry in
                    fs::read_dir(dir).with_context(|| format!("reading directory {dir:?}"))?
                {
                    let entry = entry?;
                    let file_type = entry.file_type()?;
                    if file_type.is_symlink() {
                        continue;
                    }
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if name.starts_with('.') {
                        continue;
                    }
                    let child = if rel.is_empty() {
                        name.to_string()
                    } else {
                        format!("{rel}/{name}")
                    };
                    if file_type.is_dir() {
                        visit(&entry.path(), &child, out)?;
                    } else if name.ends_with(".md") {
                        out.push(child);
                    }
                }
                Ok(())
            }

            let mut out = Vec::new();
            visit(&self.root, "", &mut out)?;
            out.sort();
            Ok(out)
        }

        fn read(&self, path: &str) -> Result<String> {
            let abs = self.abs(path);
            fs::read_to_string(&abs).with_context(|| format!("reading {abs:?}"))
        }

        fn write(&self, path: &str, text: &str) -> Result<()> {
            let abs = self.abs(path);
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
            }
            fs::write(&abs, text).with_context(|| format!("writing {abs:?}"))
        }

        fn exists(&self, path: &str) -> bool {
            self.abs(path).is_file()
        }
    }

    /* -------------------------------- In-memory -------------------------------- */

    /// In-memory vault for hosts that own document storage themselves, and for
    /// tests.
    #[derive(Debug, Default)]
    pub struct MemVault {
        docs: RefCell<BTreeMap<String, String>>,
    }

    impl MemVault {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, path: impl Into<String>, text: impl Into<String>) {
            self.docs.borrow_mut().insert(path.into(), text.into());
        }

        pub fn remove(&self, path: &str) {
            self.docs.borrow_mut().remove(path);
        }
    }

    impl Vault for MemVault {
        fn list_documents(&self) -> Result<Vec<String>> {
            Ok(self.docs.borrow().keys().cloned().collect())
        }

        fn read(&self, path: &str) -> Result<String> {
            self.docs
                .borrow()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("no document at {path}"))
        }

        fn write(&self, path: &str, text: &str) -> Result<()> {
            self.docs
                .borrow_mut()
                .insert(path.to_string(), text.to_string());
            Ok(())
        }

        fn exists(&self, path: &str) -> bool {
            self.docs.borrow().contains_key(path)
        }
    }

}

pub mod parser {
    //! Line-oriented event extraction built on `nom`.
    //!
    //! Tokens (time ranges, single times, `⏲` end tags, `📅` date tags) are
    //! scanned with small combinators and a char-by-char fallback walk, keeping
    //! byte spans so the same machinery can strip tokens from titles and
    //! rewrite them in place. Malformed lines are skipped, never fatal.

    use crate::config::Settings;
    use crate::core::{Event, EventType};
    use crate::locid;
    use crate::vault::DocumentKind;
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while},
        character::complete::{char, space0},
        combinator::{map, map_res},
        error::{VerboseError, VerboseErrorKind},
        sequence::{preceded, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* --------------------------- Parsed documents --------------------------- */

    /// One document's contribution to the index.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ParsedDocument {
        pub events: Vec<Event>,
        /// Frontmatter key/value pairs, consumed by metadata filters.
        pub metadata: IndexMap<String, String>,
    }

    /// Derive a document's events and metadata from its text.
    pub fn parse_document(
        path: &str,
        kind: DocumentKind,
        text: &str,
        settings: &Settings,
    ) -> ParsedDocument {
        let lines: Vec<&str> = text.lines().collect();
        let (metadata, body_start) = parse_frontmatter(&lines);
        let file_date = kind.daily_date();

        // Daily notes may be gated: only lines below the marker are processed,
        // and a note without the marker contributes nothing.
        let first_line = if file_date.is_some() && !settings.process_entries_below.is_empty() {
            lines
                .iter()
                .position(|line| line.trim_start().starts_with(&settings.process_entries_below))
                .map(|marker| marker + 1)
        } else {
            Some(body_start)
        };

        let mut events = Vec::new();
        if let Some(first_line) = first_line {
            for (index, line) in lines.iter().enumerate().skip(first_line.max(body_start)) {
                if let Some(event) = parse_line(path, file_date, index, line) {
                    events.push(event);
                }
            }
        }
        ParsedDocument { events, metadata }
    }

    fn parse_line(
        path: &str,
        file_date: Option<NaiveDate>,
        index: usize,
        line: &str,
    ) -> Option<Event> {
        let (event_type, content) = split_entry(line)?;
        let tokens = scan_tokens(content);

        let mut date_tag = None;
        let mut range = None;
        let mut single = None;
        let mut end_tag = None;
        for token in &tokens {
            match token.kind {
                TokenKind::DateTag(date) if date_tag.is_none() => date_tag = Some(date),
                TokenKind::Range { start, end } if range.is_none() => range = Some((start, end)),
                TokenKind::Time(time) if single.is_none() => single = Some(time),
                TokenKind::EndTag(time) if end_tag.is_none() => end_tag = Some(time),
                _ => {}
            }
        }

        // Extra-folder lines have no file date to fall back on.
        let date = date_tag.or(file_date)?;
        let (start_time, end_time) = match (range, single) {
            (Some((start, end)), _) => (Some(start), Some(end)),
            (None, Some(start)) => (Some(start), end_tag),
            (None, None) => (None, None),
        };
        let all_day = start_time.is_none();
        let start = date.and_time(start_time.unwrap_or(NaiveTime::MIN));
        let end = end_time.map(|time| date.and_time(time));

        let stripped = strip_tokens(content, &tokens);
        let title = if stripped.is_empty() {
            content.trim().to_string()
        } else {
            stripped
        };

        Some(Event {
            id: locid::encode(start, index),
            title,
            content: content.to_string(),
            start,
            end,
            all_day,
            event_type,
            path: path.to_string(),
        })
    }

    /// A line is an event candidate iff it is a bullet or checkbox entry.
    fn split_entry(line: &str) -> Option<(EventType, &str)> {
        let rest = line.trim_start().strip_prefix("- ")?;
        let bytes = rest.as_bytes();
        if bytes.len() >= 4 && bytes[0] == b'[' && bytes[2] == b']' && bytes[3] == b' ' {
            let kind = if bytes[1] == b'x' || bytes[1] == b'X' {
                EventType::TaskDone
            } else {
                EventType::TaskTodo
            };
            return Some((kind, &rest[4..]));
        }
        Some((EventType::Default, rest))
    }

    fn parse_frontmatter(lines: &[&str]) -> (IndexMap<String, String>, usize) {
        if lines.first().map(|line| line.trim_end()) != Some("---") {
            return (IndexMap::new(), 0);
        }
        let mut metadata = IndexMap::new();
        for (index, line) in lines.iter().enumerate().skip(1) {
            let trimmed = line.trim();
            if trimmed == "---" {
                return (metadata, index + 1);
            }
            if let Some((key, value)) = trimmed.split_once(':') {
                if !key.trim().is_empty() {
                    metadata.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        // Unterminated fence: not frontmatter after all.
        (IndexMap::new(), 0)
    }

    /* -------------------------------- Tokens -------------------------------- */

    /// Byte range of a token inside its line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Span {
        pub start: usize,
        pub end: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum TokenKind {
        Range { start: NaiveTime, end: NaiveTime },
        Time(NaiveTime),
        /// `⏲ HH:MM`
        EndTag(NaiveTime),
        /// `📅 YYYY-MM-DD`
        DateTag(NaiveDate),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Token {
        pub kind: TokenKind,
        pub span: Span,
    }

    /// Walk the line, trying token parsers at each position with a one-char
    /// fallback, and record byte spans via remaining-length arithmetic.
    pub(crate) fn scan_tokens(content: &str) -> Vec<Token> {
        let base = content.len();
        let mut out = Vec::new();
        let mut rest = content;
        let mut prev: Option<char> = None;
        while !rest.is_empty() {
            // A time must not start inside a longer digit run (`111:11`).
            let mid_digits = prev.is_some_and(|c| c.is_ascii_digit());
            if !mid_digits {
                if let Ok((after, kind)) = token_atom(rest) {
                    out.push(Token {
                        kind,
                        span: Span {
                            start: base - rest.len(),
                            end: base - after.len(),
                        },
                    });
                    prev = rest[..rest.len() - after.len()].chars().last();
                    rest = after;
                    continue;
                }
            }
            let mut chars = rest.chars();
            prev = chars.next();
            rest = chars.as_str();
        }
        out
    }

    fn strip_tokens(content: &str, tokens: &[Token]) -> String {
        let mut kept = String::with_capacity(content.len());
        let mut pos = 0;
        for token in tokens {
            kept.push_str(&content[pos..token.span.start]);
            pos = token.span.end;
        }
        kept.push_str(&content[pos..]);
        kept.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn token_atom(i: &str) -> PResult<'_, TokenKind> {
        alt((
            parse_date_tag,
            parse_end_tag,
            parse_time_range,
            parse_time_single,
        ))(i)
    }

    fn parse_date_tag(i: &str) -> PResult<'_, TokenKind> {
        map(
            preceded(tag("📅"), preceded(space0, parse_date)),
            TokenKind::DateTag,
        )(i)
    }

    fn parse_end_tag(i: &str) -> PResult<'_, TokenKind> {
        map(
            preceded(tag("⏲"), preceded(space0, parse_time)),
            TokenKind::EndTag,
        )(i)
    }

    fn parse_time_range(i: &str) -> PResult<'_, TokenKind> {
        map(
            tuple((parse_time, space0, char('-'), space0, parse_time)),
            |(start, _, _, _, end)| TokenKind::Range { start, end },
        )(i)
    }

    fn parse_time_single(i: &str) -> PResult<'_, TokenKind> {
        map(parse_time, TokenKind::Time)(i)
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (rest, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((rest, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDateTime;

        fn daily(y: i32, m: u32, d: u32) -> DocumentKind {
            DocumentKind::Daily(NaiveDate::from_ymd_opt(y, m, d).unwrap())
        }

        fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, 0)
                .unwrap()
        }

        const STANDUP_DOC: &str = "# 2024-01-05\n\n# Journal\n\nSome prose, not an entry.\n- [ ] 14:00 Review PRs\n\n- 09:00-10:00 Standup\n";

        #[test]
        fn derives_the_standup_scenario() {
            let parsed = parse_document(
                "Daily/2024-01-05.md",
                daily(2024, 1, 5),
                STANDUP_DOC,
                &Settings::default(),
            );
            assert_eq!(parsed.events.len(), 2);

            let standup = &parsed.events[1];
            assert_eq!(standup.id, "202401050900007");
            assert_eq!(standup.title, "Standup");
            assert_eq!(standup.start, at(2024, 1, 5, 9, 0));
            assert_eq!(standup.end, Some(at(2024, 1, 5, 10, 0)));
            assert!(!standup.all_day);
            assert_eq!(standup.event_type, EventType::Default);
            assert_eq!(standup.path, "Daily/2024-01-05.md");
            assert_eq!(
                locid::decode(&standup.id).unwrap(),
                (at(2024, 1, 5, 9, 0), 7)
            );

            let review = &parsed.events[0];
            assert_eq!(review.event_type, EventType::TaskTodo);
            assert_eq!(review.end, None);
            assert_eq!(review.title, "Review PRs");
        }

        #[test]
        fn decoded_line_indices_point_back_at_time_tokens() {
            let parsed = parse_document(
                "Daily/2024-01-05.md",
                daily(2024, 1, 5),
                STANDUP_DOC,
                &Settings::default(),
            );
            let lines: Vec<&str> = STANDUP_DOC.lines().collect();
            for event in &parsed.events {
                let (stamp, line) = locid::decode(&event.id).unwrap();
                assert_eq!(stamp, event.start);
                assert!(lines[line].contains(&event.start.format("%H:%M").to_string()));
            }
        }

        #[test]
        fn reparsing_an_unchanged_document_is_idempotent() {
            let settings = Settings::default();
            let first =
                parse_document("Daily/2024-01-05.md", daily(2024, 1, 5), STANDUP_DOC, &settings);
            let second =
                parse_document("Daily/2024-01-05.md", daily(2024, 1, 5), STANDUP_DOC, &settings);
            assert_eq!(first, second);
        }

        #[test]
        fn marker_gates_daily_notes() {
            let mut settings = Settings::default();
            settings.process_entries_below = "# Journal".to_string();
            let text = "- 08:00 Too early\n# Journal\n- 09:00 Standup\n";
            let parsed = parse_document("Daily/2024-01-05.md", daily(2024, 1, 5), text, &settings);
            assert_eq!(parsed.events.len(), 1);
            assert_eq!(parsed.events[0].title, "Standup");

            // A daily note without the marker yields nothing.
            let unmarked = parse_document(
                "Daily/2024-01-06.md",
                daily(2024, 1, 6),
                "- 09:00 Hidden\n",
                &settings,
            );
            assert!(unmarked.events.is_empty());
        }

        #[test]
        fn extra_documents_need_a_date_tag() {
            let text = "---\nclient: acme\npriority: high\n---\n- [ ] 📅 2024-02-01 10:00-11:30 Kickoff with Acme\n- Groceries\n- 📅 2024-02-02 Ship draft\n";
            let parsed = parse_document(
                "projects/plan.md",
                DocumentKind::Extra,
                text,
                &Settings::default(),
            );
            assert_eq!(parsed.events.len(), 2);

            let kickoff = &parsed.events[0];
            assert_eq!(kickoff.start, at(2024, 2, 1, 10, 0));
            assert_eq!(kickoff.end, Some(at(2024, 2, 1, 11, 30)));
            assert_eq!(kickoff.event_type, EventType::TaskTodo);
            assert_eq!(kickoff.title, "Kickoff with Acme");
            assert_eq!(locid::decode(&kickoff.id).unwrap().1, 4);

            let draft = &parsed.events[1];
            assert!(draft.all_day);
            assert_eq!(draft.start, at(2024, 2, 2, 0, 0));
            assert_eq!(draft.end, None);
            assert_eq!(draft.title, "Ship draft");

            assert_eq!(
                parsed.metadata.get("client").map(String::as_str),
                Some("acme")
            );
            assert_eq!(
                parsed.metadata.get("priority").map(String::as_str),
                Some("high")
            );
        }

        #[test]
        fn daily_lines_without_times_become_all_day_events() {
            let parsed = parse_document(
                "Daily/2024-01-05.md",
                daily(2024, 1, 5),
                "- Errands\n",
                &Settings::default(),
            );
            assert_eq!(parsed.events.len(), 1);
            assert!(parsed.events[0].all_day);
            assert_eq!(parsed.events[0].start, at(2024, 1, 5, 0, 0));
            assert_eq!(parsed.events[0].id, "202401050000000");
        }

        #[test]
        fn end_tag_supplies_the_end_time() {
            let parsed = parse_document(
                "Daily/2024-01-05.md",
                daily(2024, 1, 5),
                "- 09:30 Sprint demo ⏲ 10:15\n",
                &Settings::default(),
            );
            let event = &parsed.events[0];
            assert_eq!(event.start, at(2024, 1, 5, 9, 30));
            assert_eq!(event.end, Some(at(2024, 1, 5, 10, 15)));
            assert_eq!(event.title, "Sprint demo");
        }

        #[test]
        fn ranges_tolerate_spaces_around_the_dash() {
            let line = "09:00 - 10:30 Planning";
            let tokens = scan_tokens(line);
            assert!(matches!(tokens[0].kind, TokenKind::Range { .. }));
            assert_eq!(&line[tokens[0].span.start..tokens[0].span.end], "09:00 - 10:30");
        }

        #[test]
        fn times_inside_longer_digit_runs_are_not_tokens() {
            assert!(scan_tokens("build 111:11 finished").is_empty());
            assert!(scan_tokens("x111:11").is_empty());
        }

        #[test]
        fn invalid_times_are_skipped_not_fatal() {
            let parsed = parse_document(
                "Daily/2024-01-05.md",
                daily(2024, 1, 5),
                "- 25:99 Impossible\n- 09:00 Fine\n",
                &Settings::default(),
            );
            // the impossible time parses as an all-day entry, the valid one as timed
            assert_eq!(parsed.events.len(), 2);
            assert!(parsed.events[0].all_day);
            assert!(!parsed.events[1].all_day);
        }

        #[test]
        fn title_falls_back_to_content_when_stripping_empties_it() {
            let parsed = parse_document(
                "Daily/2024-01-05.md",
                daily(2024, 1, 5),
                "- 10:00\n",
                &Settings::default(),
            );
            assert_eq!(parsed.events[0].title, "10:00");
        }

        #[test]
        fn non_entry_lines_are_ignored() {
            let parsed = parse_document(
                "Daily/2024-01-05.md",
                daily(2024, 1, 5),
                "plain prose 09:00\n# heading 10:00\n* star bullet 11:00\n",
                &Settings::default(),
            );
            assert!(parsed.events.is_empty());
        }
    }
}

pub mod store {
    //! The in-memory derived index: id → event plus per-document bookkeeping.
    //! Documents are only ever replaced wholesale, which keeps replacement
    //! atomic from a reader's perspective.

    use crate::core::Event;
    use crate::parser::ParsedDocument;
    use indexmap::IndexMap;
    use std::collections::BTreeMap;
    use tracing::warn;

    #[derive(Debug, Default)]
    pub struct EventStore {
        events: IndexMap<String, Event>,
        ids_by_path: BTreeMap<String, Vec<String>>,
        metadata_by_path: BTreeMap<String, IndexMap<String, String>>,
    }

    impl EventStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Swap a document's entire contribution. Prior ids for the path are
        /// removed first; an id already owned by another document is dropped
        /// rather than stolen.
        pub fn replace_document(&mut self, path: &str, parsed: ParsedDocument) {
            self.remove(path);
            let mut ids = Vec::with_capacity(parsed.events.len());
            for event in parsed.events {
                if let Some(owner) = self.events.get(&event.id) {
                    warn!(
                        id = %event.id,
                        path,
                        owner = %owner.path,
                        "dropping event with an id already owned by another document"
                    );
                    continue;
                }
                ids.push(event.id.clone());
                self.events.insert(event.id.clone(), event);
            }
            self.ids_by_path.insert(path.to_string(), ids);
            if parsed.metadata.is_empty() {
                self.metadata_by_path.remove(path);
            } else {
                self.metadata_by_path
                    .insert(path.to_string(), parsed.metadata);
            }
        }

        /// Clear a document's contribution entirely (used on deletion).
        pub fn remove(&mut self, path: &str) {
            if let Some(ids) = self.ids_by_path.remove(path) {
                for id in ids {
                    self.events.shift_remove(&id);
                }
            }
            self.metadata_by_path.remove(path);
        }

        pub fn get(&self, id: &str) -> Option<&Event> {
            self.events.get(id)
        }

        pub fn all(&self) -> impl Iterator<Item = &Event> {
            self.events.values()
        }

        pub fn by_path(&self, path: &str) -> Vec<&Event> {
            self.ids_by_path
                .get(path)
                .map(|ids| ids.iter().filter_map(|id| self.events.get(id)).collect())
                .unwrap_or_default()
        }

        pub fn metadata(&self, path: &str) -> Option<&IndexMap<String, String>> {
            self.metadata_by_path.get(path)
        }

        pub fn len(&self) -> usize {
            self.events.len()
        }

        pub fn is_empty(&self) -> bool {
            self.events.is_empty()
        }
    }

}

pub mod filter {
    //! Pure predicate evaluation over a store snapshot. Nothing here mutates
    //! the store; client-side toggles narrow only the folder allow-list while
    //! every other predicate field stays intact.

    use crate::config::WorkspaceFilter;
    use crate::core::Event;
    use crate::store::EventStore;
    use crate::vault;
    use indexmap::IndexMap;
    use regex::Regex;
    use tracing::warn;

    /// Runtime filter criteria: a workspace filter, possibly narrowed by the
    /// caller's folder-visibility override or free-text query.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct FilterCriteria {
        pub event_types: Vec<String>,
        pub content_regex: Option<String>,
        pub content_text: Option<String>,
        pub folder_paths: Vec<String>,
        pub metadata_keys: Vec<String>,
        pub metadata_values: IndexMap<String, String>,
    }

    impl FilterCriteria {
        /// Replace only which folders are visible; other predicates keep.
        pub fn with_folder_override(mut self, folder_paths: Vec<String>) -> Self {
            self.folder_paths = folder_paths;
            self
        }

        pub fn is_empty(&self) -> bool {
            self.event_types.is_empty()
                && self.content_regex.is_none()
                && self.content_text.is_none()
                && self.folder_paths.is_empty()
                && self.metadata_keys.is_empty()
                && self.metadata_values.is_empty()
        }
    }

    impl From<&WorkspaceFilter> for FilterCriteria {
        fn from(filter: &WorkspaceFilter) -> Self {
            Self {
                event_types: filter.event_types.clone(),
                content_regex: (!filter.content_regex.is_empty())
                    .then(|| filter.content_regex.clone()),
                content_text: None,
                folder_paths: filter.folder_paths.clone(),
                metadata_keys: filter.metadata_keys.clone(),
                metadata_values: filter.metadata_values.clone(),
            }
        }
    }

    /// An event passes iff every configured (non-empty) predicate holds.
    /// Empty criteria return the full store.
    pub fn apply(criteria: &FilterCriteria, store: &EventStore) -> Vec<Event> {
        let regex = criteria
            .content_regex
            .as_deref()
            .and_then(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(pattern, %err, "ignoring unparsable content regex");
                    None
                }
            });
        let needle = criteria
            .content_text
            .as_deref()
            .map(str::to_lowercase)
            .filter(|text| !text.is_empty());

        store
            .all()
            .filter(|event| matches(criteria, regex.as_ref(), needle.as_deref(), event, store))
            .cloned()
            .collect()
    }

    fn matches(
        criteria: &FilterCriteria,
        regex: Option<&Regex>,
        needle: Option<&str>,
        event: &Event,
        store: &EventStore,
    ) -> bool {
        if !criteria.event_types.is_empty()
            && !criteria
                .event_types
                .iter()
                .any(|wanted| wanted == event.event_type.as_str())
        {
            return false;
        }
        if let Some(regex) = regex {
            if !regex.is_match(&event.title) && !regex.is_match(&event.content) {
                return false;
            }
        }
        if let Some(needle) = needle {
            if !event.title.to_lowercase().contains(needle)
                && !event.content.to_lowercase().contains(needle)
            {
                return false;
            }
        }
        if !criteria.folder_paths.is_empty()
            && !criteria
                .folder_paths
                .iter()
                .any(|folder| vault::in_folder(&event.path, folder))
        {
            return false;
        }
        if !criteria.metadata_keys.is_empty() || !criteria.metadata_values.is_empty() {
            let metadata = store.metadata(&event.path);
            for key in &criteria.metadata_keys {
                if !metadata.is_some_and(|meta| meta.contains_key(key)) {
                    return false;
                }
            }
            for (key, value) in &criteria.metadata_values {
                if metadata.and_then(|meta| meta.get(key)) != Some(value) {
                    return false;
                }
            }
        }
        true
    }

}

pub mod resolve {
    //! Turning ids back into document positions.
    //!
    //! Daily notes are synonymous with dates, so they can be relocated from the
    //! id's timestamp alone even after a rename; extra-folder documents have no
    //! date identity and must be path-pinned.

    use crate::config::Settings;
    use crate::core::ResolveError;
    use crate::locid;
    use crate::vault::{self, Vault};

    /// A resolved location: owning document and 0-based line index.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Location {
        pub path: String,
        pub line: usize,
    }

    /// Prefer the event's known path; fall back to the daily note for the id's
    /// date.
    pub fn resolve(
        id: &str,
        known_path: Option<&str>,
        vault: &impl Vault,
        settings: &Settings,
    ) -> Result<Location, ResolveError> {
        let (timestamp, line) = locid::decode(id)?;
        if let Some(path) = known_path {
            if vault.exists(path) {
                return Ok(Location {
                    path: path.to_string(),
                    line,
                });
            }
        }
        let daily = vault::daily_note_path(timestamp.date(), settings);
        if vault.exists(&daily) {
            return Ok(Location { path: daily, line });
        }
        Err(ResolveError::EventNotFound(id.to_string()))
    }

}

pub mod sync {
    //! Applies document lifecycle notifications to the event store.
    //!
    //! The host dispatches serialized created/modified/deleted notifications;
    //! the synchronizer re-parses exactly the affected document. Full rebuilds
    //! stage into a fresh store and swap, so readers never observe a half-built
    //! index, and a generation counter lets a rescan that was overtaken by a
    //! newer one discard its staged state instead of clobbering fresher data.

    use crate::config::Settings;
    use crate::core::{EditError, Event};
    use crate::edit;
    use crate::filter::{self, FilterCriteria};
    use crate::parser::{self, ParsedDocument};
    use crate::store::EventStore;
    use crate::vault::{self, DocumentKind, Vault};
    use anyhow::Result;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use tracing::{debug, warn};

    /* ---------------------------- Notifications ---------------------------- */

    /// A document lifecycle notification from the host.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum DocChange {
        Created(String),
        Modified(String),
        Deleted(String),
    }

    impl DocChange {
        pub fn path(&self) -> &str {
            match self {
                Self::Created(path) | Self::Modified(path) | Self::Deleted(path) => path,
            }
        }
    }

    /* ----------------------------- Synchronizer ----------------------------- */

    pub struct Synchronizer<V: Vault> {
        vault: V,
        settings: Settings,
        store: EventStore,
        tracked: Vec<String>,
        generation: u64,
        open_generation: Option<u64>,
        pending: IndexMap<String, DocChange>,
    }

    impl<V: Vault> Synchronizer<V> {
        pub fn new(vault: V, settings: Settings) -> Self {
            Self {
                vault,
                settings,
                store: EventStore::new(),
                tracked: Vec::new(),
                generation: 0,
                open_generation: None,
                pending: IndexMap::new(),
            }
        }

        pub fn store(&self) -> &EventStore {
            &self.store
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn vault(&self) -> &V {
            &self.vault
        }

        pub fn tracked_documents(&self) -> &[String] {
            &self.tracked
        }

        /// Swap in new settings; folder membership or parse-gate changes force
        /// a full rescan because they may reveal or hide whole documents.
        pub fn update_settings(&mut self, settings: Settings) -> Result<()> {
            let rescan = settings.daily_notes_folder != self.settings.daily_notes_folder
                || settings.extra_folders != self.settings.extra_folders
                || settings.process_entries_below != self.settings.process_entries_below;
            self.settings = settings;
            if rescan {
                self.full_rescan()?;
            }
            Ok(())
        }

        /* ------------------------------ Rescans ------------------------------ */

        pub fn full_rescan(&mut self) -> Result<()> {
            let mut job = self.begin_rescan()?;
            while job.step(self) {}
            job.finish(self)?;
            Ok(())
        }

        /// Start a staged rescan. Drive it with [`RescanJob::step`] — one
        /// document per call, so a cooperative host can yield in between — and
        /// commit with [`RescanJob::finish`].
        pub fn begin_rescan(&mut self) -> Result<RescanJob> {
            self.refresh_tracked()?;
            self.generation += 1;
            self.open_generation = Some(self.generation);
            Ok(RescanJob {
                docs: self.tracked.clone(),
                next: 0,
                staged: EventStore::new(),
                generation: self.generation,
            })
        }

        fn refresh_tracked(&mut self) -> Result<()> {
            let mut tracked: Vec<String> = self
                .vault
                .list_documents()?
                .into_iter()
                .filter(|path| vault::classify(path, &self.settings).is_tracked())
                .collect();
            tracked.sort();
            self.tracked = tracked;
            Ok(())
        }

        fn parse_one(&self, path: &str) -> Result<Option<ParsedDocument>> {
            let kind = vault::classify(path, &self.settings);
            if !kind.is_tracked() {
                return Ok(None);
            }
            let text = self.vault.read(path)?;
            Ok(Some(parser::parse_document(
                path,
                kind,
                &text,
                &self.settings,
            )))
        }

        /* ---------------------------- Notifications ---------------------------- */

        pub fn notify(&mut self, change: DocChange) -> Result<()> {
            if self.open_generation.is_some() {
                debug!(path = change.path(), "queueing notification behind open rescan");
                let merged = match self.pending.shift_remove(change.path()) {
                    Some(DocChange::Created(path)) if matches!(change, DocChange::Modified(_)) => {
                        DocChange::Created(path)
                    }
                    _ => change,
                };
                self.pending.insert(merged.path().to_string(), merged);
                return Ok(());
            }
            self.apply_change(change)
        }

        fn apply_change(&mut self, change: DocChange) -> Result<()> {
            let kind = vault::classify(change.path(), &self.settings);
            if !kind.is_tracked() {
                debug!(path = change.path(), "ignoring notification for untracked document");
                return Ok(());
            }
            match change {
                DocChange::Created(path) => {
                    if matches!(kind, DocumentKind::Daily(_)) {
                        // A new daily document changes what "all documents" means.
                        self.refresh_tracked()?;
                    }
                    self.reparse_into_store(&path, kind);
                }
                DocChange::Modified(path) => self.reparse_into_store(&path, kind),
                DocChange::Deleted(path) => {
                    self.store.remove(&path);
                    if matches!(kind, DocumentKind::Daily(_)) {
                        self.refresh_tracked()?;
                    }
                }
            }
            Ok(())
        }

        fn reparse_into_store(&mut self, path: &str, kind: DocumentKind) {
            match self.vault.read(path) {
                Ok(text) => {
                    let parsed = parser::parse_document(path, kind, &text, &self.settings);
                    self.store.replace_document(path, parsed);
                }
                Err(err) => {
                    warn!(path, error = %format!("{err:#}"), "dropping events for unreadable document");
                    self.store.remove(path);
                }
            }
        }

        /* ---------------------------- Outbound verbs ---------------------------- */

        /// Full refresh, then a snapshot of every indexed event sorted by start.
        pub fn fetch_all(&mut self) -> Result<Vec<Event>> {
            self.full_rescan()?;
            Ok(self.snapshot())
        }

        pub fn snapshot(&self) -> Vec<Event> {
            let mut events: Vec<Event> = self.store.all().cloned().collect();
            events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
            events
        }

        /// Client-side filtering over the already-loaded store.
        pub fn filter_events(&self, criteria: &FilterCriteria) -> Vec<Event> {
            filter::apply(criteria, &self.store)
        }

        /// Metadata-affecting filtering: such changes may reveal or hide whole
        /// documents, so refetch before filtering.
        pub fn refetch_and_filter(&mut self, criteria: &FilterCriteria) -> Result<Vec<Event>> {
            self.full_rescan()?;
            Ok(self.filter_events(criteria))
        }

        pub fn clear_events_for_path(&mut self, path: &str) {
            self.store.remove(path);
        }

        pub fn edit_event(
            &mut self,
            event: &Event,
            new_start: NaiveDateTime,
            new_end: Option<NaiveDateTime>,
        ) -> Result<Event, EditError> {
            edit::edit_event(self, event, new_start, new_end)
        }

        pub fn create_event(
            &mut self,
            date: NaiveDate,
            start: Option<NaiveTime>,
            end: Option<NaiveTime>,
            content: &str,
        ) -> Result<Event, EditError> {
            edit::create_event(self, date, start, end, content)
        }
    }

    /* ------------------------------ Rescan job ------------------------------ */

    /// An in-flight staged rescan.
    #[derive(Debug)]
    pub struct RescanJob {
        docs: Vec<String>,
        next: usize,
        staged: EventStore,
        generation: u64,
    }

    impl RescanJob {
        /// Parse the next tracked document into the staged store. Returns false
        /// once every document has been visited.
        pub fn step<V: Vault>(&mut self, sync: &Synchronizer<V>) -> bool {
            let Some(path) = self.docs.get(self.next).cloned() else {
                return false;
            };
            self.next += 1;
            match sync.parse_one(&path) {
                Ok(Some(parsed)) => self.staged.replace_document(&path, parsed),
                Ok(None) => {}
                Err(err) => warn!(
                    path = %path,
                    error = %format!("{err:#}"),
                    "skipping unreadable document during rescan"
                ),
            }
            true
        }

        pub fn remaining(&self) -> usize {
            self.docs.len().saturating_sub(self.next)
        }

        /// Commit the staged store. Returns false (and changes nothing) when a
        /// newer rescan superseded this job while it was running. Notifications
        /// queued behind the job are replayed after the swap.
        pub fn finish<V: Vault>(self, sync: &mut Synchronizer<V>) -> Result<bool> {
            if sync.open_generation != Some(self.generation) {
                warn!(generation = self.generation, "discarding stale rescan");
                return Ok(false);
            }
            sync.store = self.staged;
            sync.open_generation = None;
            let pending = std::mem::take(&mut sync.pending);
            for (_, change) in pending {
                sync.apply_change(change)?;
            }
            Ok(true)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::{DEFAULT_FOLDER_COLOR, ExtraFolder};
        use crate::core::ResolveError;
        use crate::resolve;
        use crate::vault::MemVault;

        fn settings_with_projects() -> Settings {
            let mut settings = Settings::default();
            settings.extra_folders.push(ExtraFolder {
                path: "projects".into(),
                color: DEFAULT_FOLDER_COLOR.into(),
            });
            settings
        }

        #[test]
        fn startup_rescan_indexes_exactly_the_tracked_documents() {
            let vault = MemVault::new();
            vault.insert("Daily/2024-01-05.md", "- 09:00-10:00 Standup\n");
            vault.insert("projects/plan.md", "- 📅 2024-02-01 10:00 Kickoff\n");
            vault.insert("elsewhere/todo.md", "- 09:00 Invisible\n");
            let mut sync = Synchronizer::new(vault, settings_with_projects());

            sync.full_rescan().unwrap();
            assert_eq!(sync.store().len(), 2);
            assert_eq!(sync.store().by_path("Daily/2024-01-05.md").len(), 1);
            assert_eq!(sync.store().by_path("projects/plan.md").len(), 1);
            assert!(sync.store().by_path("elsewhere/todo.md").is_empty());
            assert_eq!(sync.tracked_documents().len(), 2);
        }

        #[test]
        fn untracked_notifications_are_ignored() {
            let vault = MemVault::new();
            vault.insert("elsewhere/todo.md", "- 09:00 Invisible\n");
            // date-named, but outside the daily folder
            vault.insert("2024-01-05.md", "- 09:00 Also invisible\n");
            let mut sync = Synchronizer::new(vault, Settings::default());
            sync.full_rescan().unwrap();

            sync.notify(DocChange::Modified("elsewhere/todo.md".into()))
                .unwrap();
            sync.notify(DocChange::Created("2024-01-05.md".into()))
                .unwrap();
            assert!(sync.store().is_empty());
        }

        #[test]
        fn creating_a_daily_note_refreshes_the_tracked_set() {
            let vault = MemVault::new();
            let mut sync = Synchronizer::new(vault, Settings::default());
            sync.full_rescan().unwrap();
            assert!(sync.tracked_documents().is_empty());

            sync.vault().insert("Daily/2024-01-06.md", "- 08:00 Gym\n");
            sync.notify(DocChange::Created("Daily/2024-01-06.md".into()))
                .unwrap();
            assert_eq!(
                sync.tracked_documents(),
                ["Daily/2024-01-06.md".to_string()].as_slice()
            );
            assert_eq!(sync.store().by_path("Daily/2024-01-06.md").len(), 1);
        }

        #[test]
        fn deleting_a_daily_note_clears_its_events_and_breaks_resolution() {
            let vault = MemVault::new();
            vault.insert("Daily/2024-01-05.md", "- 09:00-10:00 Standup\n");
            let mut sync = Synchronizer::new(vault, Settings::default());
            sync.full_rescan().unwrap();
            let event = sync.store().by_path("Daily/2024-01-05.md")[0].clone();

            sync.vault().remove("Daily/2024-01-05.md");
            sync.notify(DocChange::Deleted("Daily/2024-01-05.md".into()))
                .unwrap();

            assert!(sync.store().by_path("Daily/2024-01-05.md").is_empty());
            assert!(sync.store().get(&event.id).is_none());
            assert!(sync.tracked_documents().is_empty());
            let err = resolve::resolve(&event.id, Some(&event.path), sync.vault(), sync.settings())
                .unwrap_err();
            assert!(matches!(err, ResolveError::EventNotFound(_)));
        }

        #[test]
        fn modifications_replace_a_document_wholesale() {
            let vault = MemVault::new();
            vault.insert("Daily/2024-01-05.md", "- 09:00 Standup\n");
            let mut sync = Synchronizer::new(vault, Settings::default());
            sync.full_rescan().unwrap();
            assert!(sync.store().get("202401050900000").is_some());

            sync.vault()
                .insert("Daily/2024-01-05.md", "- 10:00 Standup\n- 15:00 Retro\n");
            sync.notify(DocChange::Modified("Daily/2024-01-05.md".into()))
                .unwrap();
            assert!(sync.store().get("202401050900000").is_none());
            assert!(sync.store().get("202401051000000").is_some());
            assert!(sync.store().get("202401051500001").is_some());
        }

        #[test]
        fn notifications_queue_behind_an_open_rescan_and_replay_after_the_swap() {
            let vault = MemVault::new();
            vault.insert("Daily/2024-01-05.md", "- 09:00 Standup\n");
            let mut sync = Synchronizer::new(vault, Settings::default());

            let mut job = sync.begin_rescan().unwrap();
            while job.step(&sync) {}

            // arrives while the rescan is still open
            sync.vault().insert("Daily/2024-01-05.md", "- 10:00 Standup\n");
            sync.notify(DocChange::Modified("Daily/2024-01-05.md".into()))
                .unwrap();
            assert!(sync.store().is_empty());

            assert!(job.finish(&mut sync).unwrap());
            assert!(sync.store().get("202401051000000").is_some());
            assert!(sync.store().get("202401050900000").is_none());
        }

        #[test]
        fn a_stale_rescan_is_discarded_instead_of_overwriting_newer_data() {
            let vault = MemVault::new();
            vault.insert("Daily/2024-01-05.md", "- 09:00 Standup\n");
            let mut sync = Synchronizer::new(vault, Settings::default());

            let mut stale = sync.begin_rescan().unwrap();
            while stale.step(&sync) {}

            let mut fresh = sync.begin_rescan().unwrap();
            assert!(!stale.finish(&mut sync).unwrap());
            assert!(sync.store().is_empty());

            while fresh.step(&sync) {}
            assert!(fresh.finish(&mut sync).unwrap());
            assert_eq!(sync.store().len(), 1);
        }

        #[test]
        fn folder_configuration_changes_trigger_a_rescan() {
            let vault = MemVault::new();
            vault.insert("projects/plan.md", "- 📅 2024-02-01 10:00 Kickoff\n");
            let mut sync = Synchronizer::new(vault, Settings::default());
            sync.full_rescan().unwrap();
            assert!(sync.store().is_empty());

            sync.update_settings(settings_with_projects()).unwrap();
            assert_eq!(sync.store().by_path("projects/plan.md").len(), 1);
        }

        #[test]
        fn clear_events_for_path_empties_only_that_document() {
            let vault = MemVault::new();
            vault.insert("Daily/2024-01-05.md", "- 09:00 Standup\n");
            vault.insert("Daily/2024-01-06.md", "- 09:00 Standup\n");
            let mut sync = Synchronizer::new(vault, Settings::default());
            sync.full_rescan().unwrap();

            sync.clear_events_for_path("Daily/2024-01-05.md");
            assert!(sync.store().by_path("Daily/2024-01-05.md").is_empty());
            assert_eq!(sync.store().by_path("Daily/2024-01-06.md").len(), 1);
        }

        #[test]
        fn fetch_all_returns_a_sorted_snapshot() {
            let vault = MemVault::new();
            vault.insert("Daily/2024-01-06.md", "- 09:00 Later\n");
            vault.insert("Daily/2024-01-05.md", "- 09:00 Earlier\n");
            let mut sync = Synchronizer::new(vault, Settings::default());
            let events = sync.fetch_all().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].title, "Earlier");
            assert_eq!(events[1].title, "Later");
        }
    }
}

pub mod edit {
    //! Write-back: user-driven time changes are applied to the source line, and
    //! the authoritative updated event is re-derived from the rewritten text,
    //! so the store and the document never diverge.

    use crate::core::{EditError, Event};
    use crate::locid;
    use crate::parser::{self, ParsedDocument, Span, TokenKind};
    use crate::resolve;
    use crate::sync::{DocChange, Synchronizer};
    use crate::vault::{self, Vault};
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    pub(crate) fn edit_event<V: Vault>(
        sync: &mut Synchronizer<V>,
        event: &Event,
        new_start: NaiveDateTime,
        new_end: Option<NaiveDateTime>,
    ) -> Result<Event, EditError> {
        let known_path = (!event.path.is_empty()).then_some(event.path.as_str());
        let location = resolve::resolve(&event.id, known_path, sync.vault(), sync.settings())?;

        let text = sync.vault().read(&location.path).map_err(EditError::from)?;
        let mut lines: Vec<&str> = text.lines().collect();
        let Some(&line) = lines.get(location.line) else {
            return Err(EditError::LocationNotFound(event.id.clone()));
        };

        let rewritten = rewrite_line(line, event.start.date(), new_start, new_end)?;
        lines[location.line] = rewritten.as_str();
        let mut updated = lines.join("\n");
        if text.ends_with('\n') {
            updated.push('\n');
        }
        sync.vault()
            .write(&location.path, &updated)
            .map_err(EditError::from)?;
        sync.notify(DocChange::Modified(location.path.clone()))
            .map_err(EditError::from)?;

        // The caller gets the event freshly derived from the rewritten text.
        let kind = vault::classify(&location.path, sync.settings());
        let parsed = parser::parse_document(&location.path, kind, &updated, sync.settings());
        event_at_line(parsed, location.line)
            .ok_or_else(|| EditError::LocationNotFound(event.id.clone()))
    }

    /// Compose and insert a new event line into the daily note for `date`,
    /// after the configured heading, creating note and heading on demand.
    pub(crate) fn create_event<V: Vault>(
        sync: &mut Synchronizer<V>,
        date: NaiveDate,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
        content: &str,
    ) -> Result<Event, EditError> {
        let path = vault::daily_note_path(date, sync.settings());
        let time_text = match (start, end) {
            (Some(start), Some(end)) if end != start => {
                format!("{}-{}", start.format("%H:%M"), end.format("%H:%M"))
            }
            (Some(start), _) => start.format("%H:%M").to_string(),
            (None, _) => String::new(),
        };
        let composed = sync
            .settings()
            .default_event_composition
            .replace("{TIME}", &time_text)
            .replace("{CONTENT}", content);
        let entry = format!(
            "- {}",
            composed.split_whitespace().collect::<Vec<_>>().join(" ")
        );

        let (existing, created) = if sync.vault().exists(&path) {
            (sync.vault().read(&path).map_err(EditError::from)?, false)
        } else {
            (String::new(), true)
        };
        let (updated, line) = insert_entry(&existing, &entry, &sync.settings().insert_after);
        sync.vault()
            .write(&path, &updated)
            .map_err(EditError::from)?;
        let change = if created {
            DocChange::Created(path.clone())
        } else {
            DocChange::Modified(path.clone())
        };
        sync.notify(change).map_err(EditError::from)?;

        let kind = vault::classify(&path, sync.settings());
        let parsed = parser::parse_document(&path, kind, &updated, sync.settings());
        event_at_line(parsed, line).ok_or(EditError::LocationNotFound(path))
    }

    fn event_at_line(parsed: ParsedDocument, line: usize) -> Option<Event> {
        parsed
            .events
            .into_iter()
            .find(|event| locid::decode(&event.id).is_ok_and(|(_, at)| at == line))
    }

    /// Rewrite the recognized tokens of `line` for the new times, preserving
    /// every other byte. `line_date` is the date the line currently resolves
    /// to.
    pub(crate) fn rewrite_line(
        line: &str,
        line_date: NaiveDate,
        new_start: NaiveDateTime,
        new_end: Option<NaiveDateTime>,
    ) -> Result<String, EditError> {
        let tokens = parser::scan_tokens(line);
        // an end equal to the start collapses to a single time
        let new_end = new_end.filter(|end| *end != new_start);

        let mut date_tag: Option<Span> = None;
        let mut range: Option<Span> = None;
        let mut single: Option<Span> = None;
        let mut end_tag: Option<Span> = None;
        for token in &tokens {
            match token.kind {
                TokenKind::DateTag(_) if date_tag.is_none() => date_tag = Some(token.span),
                TokenKind::Range { .. } if range.is_none() => range = Some(token.span),
                TokenKind::Time(_) if single.is_none() => single = Some(token.span),
                TokenKind::EndTag(_) if end_tag.is_none() => end_tag = Some(token.span),
                _ => {}
            }
        }

        let no_token = || EditError::NoRecognizableTimeToken(line.to_string());

        // A move to another date can only be written through a date tag.
        if new_start.date() != line_date && date_tag.is_none() {
            return Err(no_token());
        }
        // A time-of-day needs a time token to carry it.
        let wants_time = new_start.time() != NaiveTime::MIN || new_end.is_some();
        if wants_time && range.is_none() && single.is_none() {
            return Err(no_token());
        }

        let start_text = new_start.format("%H:%M").to_string();
        let end_text = new_end.unwrap_or(new_start).format("%H:%M").to_string();
        let mut replacements: Vec<(Span, String)> = Vec::new();
        if let Some(span) = date_tag {
            replacements.push((span, format!("📅 {}", new_start.format("%Y-%m-%d"))));
        }
        if let Some(span) = range {
            let text = match new_end {
                Some(_) => format!("{start_text}-{end_text}"),
                None => start_text.clone(),
            };
            replacements.push((span, text));
        } else if let Some(span) = single {
            if end_tag.is_some() {
                replacements.push((span, start_text.clone()));
            } else {
                let text = match new_end {
                    Some(_) => format!("{start_text}-{end_text}"),
                    None => start_text.clone(),
                };
                replacements.push((span, text));
            }
        }
        if let Some(span) = end_tag {
            if range.is_some() || single.is_some() {
                replacements.push((span, format!("⏲ {end_text}")));
            }
        }

        replacements.sort_by_key(|(span, _)| span.start);
        let mut out = String::with_capacity(line.len());
        let mut pos = 0;
        for (span, text) in replacements {
            out.push_str(&line[pos..span.start]);
            out.push_str(&text);
            pos = span.end;
        }
        out.push_str(&line[pos..]);
        Ok(out)
    }

    /// Insert `entry` after the first line starting with `insert_after`,
    /// appending the heading when it is missing. Returns the new text and the
    /// 0-based line index of the inserted entry.
    pub(crate) fn insert_entry(text: &str, entry: &str, insert_after: &str) -> (String, usize) {
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        let line = if insert_after.trim().is_empty() {
            lines.push(entry.to_string());
            lines.len() - 1
        } else if let Some(heading) = lines
            .iter()
            .position(|line| line.trim_start().starts_with(insert_after))
        {
            lines.insert(heading + 1, entry.to_string());
            heading + 1
        } else {
            if !lines.is_empty() && !lines.last().is_some_and(|last| last.is_empty()) {
                lines.push(String::new());
            }
            lines.push(insert_after.to_string());
            lines.push(entry.to_string());
            lines.len() - 1
        };
        let mut out = lines.join("\n");
        out.push('\n');
        (out, line)
    }

}
