//! Filesystem legality rules and valid-name generation.
//!
//! The rule tables follow the strictest filesystem each platform ships with.
//! Names are counted in characters, not bytes.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use twinsync_common::{Error, Result, SyncPath};

/// Maximum name length, identical on every supported platform.
pub const MAX_NAME_LENGTH: usize = 255;

/// Length of the random part of generated suffixes.
pub const DEFAULT_SUFFIX_RANDOM_LEN: usize = 10;

/// Upper bound on the random part, so a suffix always fits in a name.
pub const MAX_SUFFIX_RANDOM_LEN: usize = 64;

const FORBIDDEN_CHARS_WINDOWS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const FORBIDDEN_CHARS_MACOS: &[char] = &['/', ':'];
const FORBIDDEN_CHARS_LINUX: &[char] = &['/', '\0'];

const RESERVED_NAMES_WINDOWS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Application folders kept at the root of the synchronized folder.
const SPECIAL_FOLDER_NAMES: &[&str] = &[".twinsync", ".twinsync_trash"];

/// Attempts made to find a name no sibling already uses.
const MAX_UNIQUE_NAME_ATTEMPTS: usize = 16;

/// Platform whose filesystem rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    #[serde(rename = "macos")]
    MacOs,
    Linux,
}

impl Platform {
    /// Platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    fn forbidden_chars(self) -> &'static [char] {
        match self {
            Platform::Windows => FORBIDDEN_CHARS_WINDOWS,
            Platform::MacOs => FORBIDDEN_CHARS_MACOS,
            Platform::Linux => FORBIDDEN_CHARS_LINUX,
        }
    }

    /// Maximum absolute path length.
    pub fn max_path_length(self) -> usize {
        match self {
            Platform::Windows => 32_767,
            Platform::MacOs => 1_023,
            Platform::Linux => 4_095,
        }
    }

    /// True if `name` holds a character this platform cannot store.
    pub fn name_has_forbidden_chars(self, name: &str) -> bool {
        let forbidden = self.forbidden_chars();
        name.chars().any(|c| {
            forbidden.contains(&c) || (self == Platform::Windows && (c as u32) < 0x20)
        })
    }

    /// True if `name` ends with a character the platform silently strips.
    pub fn name_end_with_forbidden_space(self, name: &str) -> bool {
        match self {
            Platform::Windows => name.ends_with(' ') || name.ends_with('.'),
            Platform::MacOs | Platform::Linux => false,
        }
    }

    /// True if `name` is a reserved device name.
    ///
    /// Windows reserves the device names with any extension ("nul.txt").
    pub fn check_reserved_names(self, name: &str) -> bool {
        if name == "." || name == ".." {
            return true;
        }
        match self {
            Platform::Windows => {
                let stem = name.split('.').next().unwrap_or(name).trim_end();
                RESERVED_NAMES_WINDOWS
                    .iter()
                    .any(|reserved| reserved.eq_ignore_ascii_case(stem))
            }
            Platform::MacOs | Platform::Linux => false,
        }
    }

    /// True if an absolute path of `size` characters is too long.
    pub fn is_path_too_long(self, size: usize) -> bool {
        size > self.max_path_length()
    }

    /// First rule `name` breaks, checked in a fixed order.
    pub fn check_name(self, name: &str) -> Option<InconsistencyKind> {
        if self.name_has_forbidden_chars(name) {
            Some(InconsistencyKind::ForbiddenChar)
        } else if is_name_only_spaces(name) {
            Some(InconsistencyKind::ForbiddenCharOnlySpaces)
        } else if self.name_end_with_forbidden_space(name) {
            Some(InconsistencyKind::ForbiddenCharEndWithSpace)
        } else if self.check_reserved_names(name) {
            Some(InconsistencyKind::ReservedName)
        } else if is_name_too_long(name) {
            Some(InconsistencyKind::NameLength)
        } else {
            None
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

/// True if `name` is made of spaces only.
pub fn is_name_only_spaces(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c == ' ')
}

/// True if `name` exceeds [`MAX_NAME_LENGTH`] characters.
pub fn is_name_too_long(name: &str) -> bool {
    name.chars().count() > MAX_NAME_LENGTH
}

/// True if `name` is one of the application's own folders.
pub fn is_special_folder(name: &str) -> bool {
    SPECIAL_FOLDER_NAMES.contains(&name)
}

/// Why a node cannot be synchronized as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    ForbiddenChar,
    ForbiddenCharOnlySpaces,
    ForbiddenCharEndWithSpace,
    ReservedName,
    NameLength,
    PathLength,
    /// Two siblings differ only by case.
    NameClash,
}

impl fmt::Display for InconsistencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InconsistencyKind::ForbiddenChar => "name contains a forbidden character",
            InconsistencyKind::ForbiddenCharOnlySpaces => "name contains only spaces",
            InconsistencyKind::ForbiddenCharEndWithSpace => "name ends with a space or a dot",
            InconsistencyKind::ReservedName => "name is reserved",
            InconsistencyKind::NameLength => "name is too long",
            InconsistencyKind::PathLength => "path is too long",
            InconsistencyKind::NameClash => "name clashes with a sibling",
        };
        f.write_str(text)
    }
}

/// Tag appended to generated names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuffixType {
    Conflict,
    Orphan,
    Blacklisted,
}

impl SuffixType {
    fn tag(self) -> &'static str {
        match self {
            SuffixType::Conflict => "conflict",
            SuffixType::Orphan => "orphan",
            SuffixType::Blacklisted => "blacklisted",
        }
    }
}

/// Source of the timestamp embedded in generated names.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Generator of valid replacement names.
///
/// Output is a pure function of the clock reading and the random stream, so a
/// fixed clock and seed reproduce the same names.
pub struct NameGenerator {
    clock: Box<dyn Clock>,
    rng: StdRng,
    random_len: usize,
}

impl NameGenerator {
    /// Create a generator; `seed = None` draws the seed from the OS.
    pub fn new(clock: Box<dyn Clock>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            clock,
            rng,
            random_len: DEFAULT_SUFFIX_RANDOM_LEN,
        }
    }

    /// Generator on the wall clock with an OS seed.
    pub fn system() -> Self {
        Self::new(Box::new(SystemClock), None)
    }

    /// Set the length of the random part of the suffix, clamped to
    /// `1..=MAX_SUFFIX_RANDOM_LEN`.
    pub fn with_random_len(mut self, len: usize) -> Self {
        self.random_len = len.clamp(1, MAX_SUFFIX_RANDOM_LEN);
        self
    }

    fn suffix(&mut self, suffix_type: SuffixType) -> String {
        let timestamp = self.clock.now().format("%Y%m%d_%H%M%S");
        let random: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(self.random_len)
            .map(char::from)
            .collect();
        format!("_{}_{}_{}", suffix_type.tag(), timestamp, random)
    }

    /// Corrected name for the last component of `path`.
    ///
    /// The stem is sanitized and truncated so that stem, suffix and extension
    /// fit in [`MAX_NAME_LENGTH`]; the result never ends with a space or a dot.
    pub fn generate_new_valid_name(&mut self, path: &SyncPath, suffix_type: SuffixType) -> String {
        let name = path.name().unwrap_or("item");
        let suffix = self.suffix(suffix_type);
        let (stem, ext) = split_extension(name);

        let stem = sanitize(stem);
        let mut ext = ext.map(sanitize).unwrap_or_default();
        let ext_trimmed_len = ext.trim_end_matches([' ', '.']).chars().count();
        if ext_trimmed_len <= 1 || ext.chars().count() + suffix.chars().count() >= MAX_NAME_LENGTH {
            // Only the dot would be left, or the extension cannot fit.
            ext.clear();
        } else {
            ext = ext.trim_end_matches([' ', '.']).to_string();
        }

        let budget = MAX_NAME_LENGTH
            .saturating_sub(suffix.chars().count())
            .saturating_sub(ext.chars().count());
        let stem: String = stem.chars().take(budget).collect();

        format!("{stem}{suffix}{ext}")
    }

    /// Like [`NameGenerator::generate_new_valid_name`], retried until `taken`
    /// rejects the candidate.
    pub fn generate_unique_name(
        &mut self,
        path: &SyncPath,
        suffix_type: SuffixType,
        taken: impl Fn(&str) -> bool,
    ) -> String {
        let mut candidate = self.generate_new_valid_name(path, suffix_type);
        for _ in 1..MAX_UNIQUE_NAME_ATTEMPTS {
            if !taken(&candidate) {
                return candidate;
            }
            candidate = self.generate_new_valid_name(path, suffix_type);
        }
        warn!("Could not find a free name for {} after {} attempts", path, MAX_UNIQUE_NAME_ATTEMPTS);
        candidate
    }

    /// Rename a local item to a generated valid name.
    ///
    /// # Preconditions
    /// - `path` names an existing local file or directory
    ///
    /// # Postconditions
    /// - The item is renamed in place and the new absolute path is returned
    ///
    /// # Errors
    /// - `InvalidInput` if the last component is missing or not UTF-8
    /// - `Io` if the filesystem rename fails
    pub fn rename_local_file(&mut self, path: &Path, suffix_type: SuffixType) -> Result<PathBuf> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidInput(format!("No usable name in {}", path.display())))?;
        let relative = SyncPath::root().join(name)?;
        let new_name = self.generate_new_valid_name(&relative, suffix_type);
        let new_path = path.with_file_name(&new_name);

        std::fs::rename(path, &new_path)?;
        debug!("Renamed {} to {}", path.display(), new_path.display());
        Ok(new_path)
    }
}

/// Split "stem.ext" into ("stem", Some(".ext")); dotfiles have no extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => (&name[..pos], Some(&name[pos..])),
        _ => (name, None),
    }
}

/// Replace characters forbidden on any platform with '_'.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if FORBIDDEN_CHARS_WINDOWS.contains(&c) || (c as u32) < 0x20 {
                '_'
            } else {
                c
            }
        })
        .collect()
}
