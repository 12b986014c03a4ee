//! User to VO resolution from the OSG user-vo-map file
//!
//! The mapfile associates local accounts with a Virtual Organization:
//!
//! ```text
//! # User-VO map
//! #voi cdf fermilab atlas cms
//! #VOc CDF Fermilab ATLAS CMS
//!
//! cdf cdf
//! usatlas1 atlas
//! uscms01 cms
//! ```
//!
//! The `#voi` line lists short (lower-case) VO names and the `#VOc` line the
//! proper-case display names; the i'th entries of both lines form a pair.
//! Every other `#` line is a comment, and remaining lines are
//! `<account> <voi>` pairs.
//!
//! The file is read lazily, on the first lookup, and at most once per
//! [`VoResolver`]. A read failure is sticky: the resolver answers every
//! later lookup from empty tables without touching the file again.

use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::{LazyLock, OnceLock};
use tracing::{debug, warn};

#[allow(clippy::unwrap_used)]
static MAGIC_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*#(voi|VOc)\s").unwrap());

#[allow(clippy::unwrap_used)]
static COMMENT_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*#").unwrap());

/// VO identity of a local account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoInfo {
    /// Short-form (`voi`) VO name
    pub vo_name: String,
    /// Proper-case (`VOc`) VO name, when the short name is in the `#voi`/`#VOc` table
    pub reportable_vo_name: Option<String>,
}

/// Parsed contents of a user-vo-map file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoTables {
    /// voi -> VOc
    pub display_names: HashMap<String, String>,
    /// account -> VO identity
    pub users: HashMap<String, VoInfo>,
}

/// Where the mapfile contents come from
pub trait MapFileSource: Send + Sync {
    /// Human-readable origin used in diagnostics
    fn describe(&self) -> String;

    /// Open the mapfile for reading
    fn open(&self) -> io::Result<Box<dyn BufRead + '_>>;
}

/// A user-vo-map file on disk
#[derive(Debug, Clone)]
pub struct MapFile {
    path: PathBuf,
}

impl MapFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MapFileSource for MapFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }
}

/// Lifecycle of the lookup tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    /// No lookup has happened yet
    Uninitialized,
    /// Tables were built from the mapfile
    Ready,
    /// No mapfile configured or it could not be read; lookups answer from empty tables
    Failed,
}

enum Tables {
    Ready(VoTables),
    Failed,
}

/// Lazily initialized, failure-sticky user-vo-map lookups
///
/// Construct one per process and share it by reference. Initialization
/// runs at most once even under concurrent first use.
pub struct VoResolver {
    source: Option<Box<dyn MapFileSource>>,
    tables: OnceLock<Tables>,
}

impl VoResolver {
    /// Resolver backed by the mapfile at `path`, or by nothing when `None`
    pub fn new(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => Self::with_source(MapFile::new(path)),
            None => Self::unconfigured(),
        }
    }

    /// Resolver backed by an arbitrary mapfile source
    pub fn with_source(source: impl MapFileSource + 'static) -> Self {
        Self {
            source: Some(Box::new(source)),
            tables: OnceLock::new(),
        }
    }

    /// Resolver with no mapfile; every lookup misses
    pub fn unconfigured() -> Self {
        Self {
            source: None,
            tables: OnceLock::new(),
        }
    }

    pub fn state(&self) -> ResolverState {
        match self.tables.get() {
            None => ResolverState::Uninitialized,
            Some(Tables::Ready(_)) => ResolverState::Ready,
            Some(Tables::Failed) => ResolverState::Failed,
        }
    }

    /// Map a short-form VO name to its display form, or return it unchanged
    pub fn resolve_display_name<'a>(&'a self, voi: &'a str) -> &'a str {
        self.loaded()
            .and_then(|t| t.display_names.get(voi))
            .map(String::as_str)
            .unwrap_or(voi)
    }

    /// VO identity for a local account, `None` when the account is unknown
    pub fn resolve_user_vo(&self, user: &str) -> Option<&VoInfo> {
        self.loaded().and_then(|t| t.users.get(user))
    }

    /// Number of voi -> VOc pairs known
    pub fn display_name_count(&self) -> usize {
        self.loaded().map_or(0, |t| t.display_names.len())
    }

    fn loaded(&self) -> Option<&VoTables> {
        match self.tables.get_or_init(|| self.initialize()) {
            Tables::Ready(tables) => Some(tables),
            Tables::Failed => None,
        }
    }

    fn initialize(&self) -> Tables {
        let Some(source) = self.source.as_ref() else {
            warn!("No user-vo-map file specified; not using VO mapping");
            return Tables::Failed;
        };

        let origin = source.describe();
        debug!(mapfile = %origin, "Initializing (voi, VOc) lookup table");

        match source.open().and_then(|reader| parse_mapfile(reader, &origin)) {
            Ok(tables) => {
                debug!(
                    mapfile = %origin,
                    vo_pairs = tables.display_names.len(),
                    users = tables.users.len(),
                    "Loaded user-vo-map"
                );
                Tables::Ready(tables)
            },
            Err(e) => {
                warn!(
                    mapfile = %origin,
                    error = %e,
                    error_debug = ?e,
                    "IO error initializing user-vo-map; VO lookups disabled for this run"
                );
                Tables::Failed
            },
        }
    }
}

impl std::fmt::Debug for VoResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoResolver")
            .field("source", &self.source.as_ref().map(|s| s.describe()))
            .field("state", &self.state())
            .finish()
    }
}

/// Parse a complete user-vo-map
///
/// The voi -> VOc table is built the first time both magic lines have been
/// seen and is never rebuilt afterwards, so the first `#voi`/`#VOc` pair in
/// the file wins. User lines read before the table exists get no
/// reportable name.
pub fn parse_mapfile<R: BufRead>(reader: R, origin: &str) -> io::Result<VoTables> {
    let mut tables = VoTables::default();
    let mut voi: Vec<String> = Vec::new();
    let mut voc: Vec<String> = Vec::new();

    for line in reader.lines() {
        let line = line?;

        if let Some(caps) = MAGIC_LINE.captures(&line) {
            let rest = caps.get(0).map_or("", |m| &line[m.end()..]);
            let tokens = rest.split_whitespace().map(str::to_string).collect();
            if &caps[1] == "voi" {
                voi = tokens;
            } else {
                voc = tokens;
            }
        }

        if tables.display_names.is_empty() && !voi.is_empty() && !voc.is_empty() {
            tables.display_names = pair_vo_names(&voi, &voc, origin);
        }

        if COMMENT_LINE.is_match(&line) {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(user), Some(vo)) = (fields.next(), fields.next()) else {
            if !line.trim().is_empty() {
                debug!(mapfile = %origin, line = %line, "Skipping user-vo-map line without two columns");
            }
            continue;
        };

        let reportable = tables.display_names.get(vo).cloned();
        if reportable.is_none() {
            warn!(
                mapfile = %origin,
                voi = %vo,
                user = %user,
                "voi listed for user not found in (voi, VOc) table"
            );
        }

        tables.users.insert(
            user.to_string(),
            VoInfo {
                vo_name: vo.to_string(),
                reportable_vo_name: reportable,
            },
        );
    }

    Ok(tables)
}

/// Pair short names with display names by position
///
/// Extra short names beyond the display list are dropped, as are positions
/// whose display token is empty.
pub fn pair_vo_names(voi: &[String], voc: &[String], origin: &str) -> HashMap<String, String> {
    let entries = voi.len().min(voc.len());
    if entries != voi.len() {
        warn!(
            mapfile = %origin,
            voi_entries = voi.len(),
            voc_entries = voc.len(),
            "VOc line does not have at least as many entries as voi line: truncating"
        );
    }

    let mut pairs = HashMap::with_capacity(entries);
    for (short, display) in voi.iter().zip(voc.iter()) {
        if display.is_empty() {
            warn!(mapfile = %origin, voi = %short, "No VOc match for voi: not entering in (voi, VOc) table");
            continue;
        }
        pairs.insert(short.clone(), display.clone());
    }
    pairs
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SAMPLE: &str = "\
# User-VO map
# Generated by generate-vo-map
#voi cdf fermilab mis atlas cms
#VOc CDF FERMILAB MIS ATLAS CMS

cdf cdf
usatlas1 atlas
usatlas3 atlas extra-column
uscms01 cms
stranger unknownvo
";

    struct StaticSource {
        body: &'static str,
        opens: Arc<AtomicUsize>,
    }

    impl MapFileSource for StaticSource {
        fn describe(&self) -> String {
            "static".to_string()
        }

        fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(self.body)))
        }
    }

    struct BrokenSource {
        opens: Arc<AtomicUsize>,
    }

    impl MapFileSource for BrokenSource {
        fn describe(&self) -> String {
            "broken".to_string()
        }

        fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        }
    }

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_parse_sample_mapfile() {
        let tables = parse_mapfile(Cursor::new(SAMPLE), "sample").unwrap();

        assert_eq!(tables.display_names.len(), 5);
        assert_eq!(tables.display_names["atlas"], "ATLAS");
        assert_eq!(
            tables.users["usatlas3"],
            VoInfo {
                vo_name: "atlas".to_string(),
                reportable_vo_name: Some("ATLAS".to_string()),
            }
        );
        assert_eq!(tables.users["stranger"].vo_name, "unknownvo");
        assert_eq!(tables.users["stranger"].reportable_vo_name, None);
        assert_eq!(tables.users.len(), 5);
    }

    #[test]
    fn test_pairing_truncates_to_shorter_display_list() {
        let pairs = pair_vo_names(&strings(&["a", "b", "c"]), &strings(&["A", "B"]), "t");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["a"], "A");
        assert_eq!(pairs["b"], "B");
        assert!(!pairs.contains_key("c"));
    }

    #[test]
    fn test_pairing_skips_empty_display_token() {
        let pairs = pair_vo_names(&strings(&["a", "b"]), &strings(&["A", ""]), "t");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs["a"], "A");
    }

    #[test]
    fn test_first_magic_pair_wins() {
        let body = "#voi a b\n#VOc A B\n#voi x\n#VOc X\nuser x\n";
        let tables = parse_mapfile(Cursor::new(body), "t").unwrap();

        assert_eq!(tables.display_names.len(), 2);
        assert!(!tables.display_names.contains_key("x"));
        assert_eq!(tables.users["user"].reportable_vo_name, None);
    }

    #[test]
    fn test_indented_magic_and_comment_lines() {
        let body = "   #voi cms\n\t#VOc CMS\n  # just a comment\nuscms01\tcms\n";
        let tables = parse_mapfile(Cursor::new(body), "t").unwrap();

        assert_eq!(tables.display_names["cms"], "CMS");
        assert_eq!(tables.users.len(), 1);
        assert_eq!(tables.users["uscms01"].reportable_vo_name.as_deref(), Some("CMS"));
    }

    #[test]
    fn test_resolver_lookups() {
        let opens = Arc::new(AtomicUsize::new(0));
        let resolver = VoResolver::with_source(StaticSource {
            body: SAMPLE,
            opens: opens.clone(),
        });
        assert_eq!(resolver.state(), ResolverState::Uninitialized);

        assert_eq!(resolver.resolve_display_name("cms"), "CMS");
        assert_eq!(resolver.resolve_display_name("nosuchvo"), "nosuchvo");
        assert_eq!(resolver.resolve_user_vo("uscms01").unwrap().vo_name, "cms");
        assert!(resolver.resolve_user_vo("nobody").is_none());

        assert_eq!(resolver.state(), ResolverState::Ready);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_failure_is_sticky() {
        let opens = Arc::new(AtomicUsize::new(0));
        let resolver = VoResolver::with_source(BrokenSource {
            opens: opens.clone(),
        });

        for _ in 0..5 {
            assert!(resolver.resolve_user_vo("cdf").is_none());
            assert_eq!(resolver.resolve_display_name("cdf"), "cdf");
        }

        assert_eq!(resolver.state(), ResolverState::Failed);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unconfigured_resolver() {
        let resolver = VoResolver::new(None);
        assert!(resolver.resolve_user_vo("cdf").is_none());
        assert_eq!(resolver.display_name_count(), 0);
        assert_eq!(resolver.state(), ResolverState::Failed);
    }

    #[test]
    fn test_missing_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = VoResolver::new(Some(dir.path().join("user-vo-map")));

        assert!(resolver.resolve_user_vo("cdf").is_none());
        assert_eq!(resolver.state(), ResolverState::Failed);

        // Creating the file afterwards must not revive the resolver
        std::fs::write(dir.path().join("user-vo-map"), SAMPLE).unwrap();
        assert!(resolver.resolve_user_vo("cdf").is_none());
    }
}
