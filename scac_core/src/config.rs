use crate::error::{Result, ScacError};
use crate::evaluator::DEFAULT_CONCURRENCY;
use crate::input::InputMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Printable ASCII with the surrounding whitespace stripped: digits, letters,
/// then punctuation.
pub const DEFAULT_ALPHABET: &str = concat!(
    "0123456789",
    "abcdefghijklmnopqrstuvwxyz",
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~",
);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Perf,
    Pin,
    Qemu,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    BruteLength,
    BruteForward,
    BruteBackward,
    BruteAll,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InputSettings {
    /// No default: the caller has to say how the target reads its input.
    pub mode: Option<InputMode>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    pub mode: Option<SearchMode>,
    #[serde(default = "default_alphabet")]
    pub alphabet: String,
    #[serde(default = "default_filler")]
    pub filler: char,
    #[serde(default = "default_length")]
    pub length: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

pub fn default_alphabet() -> String {
    DEFAULT_ALPHABET.to_string()
}
pub fn default_filler() -> char {
    'A'
}
pub fn default_length() -> usize {
    32
}
pub fn default_workers() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            mode: None,
            alphabet: default_alphabet(),
            filler: default_filler(),
            length: default_length(),
            workers: default_workers(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_perf_binary")]
    pub perf_binary: PathBuf,
    /// Pin installation directory (the folder holding the `pin` launcher).
    #[serde(default = "default_pin_root")]
    pub pin_root: PathBuf,
    /// Usually `intel64` or `ia32`.
    #[serde(default = "default_pin_arch")]
    pub pin_arch: String,
    #[serde(default = "default_qemu_binary")]
    pub qemu_binary: PathBuf,
    #[serde(default = "default_qemu_plugin")]
    pub qemu_plugin: PathBuf,
    /// Kill an instrumented run after this long. Unset means wait forever.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_perf_binary() -> PathBuf {
    PathBuf::from("perf")
}
fn default_pin_root() -> PathBuf {
    PathBuf::from("./pin")
}
fn default_pin_arch() -> String {
    "intel64".to_string()
}
fn default_qemu_binary() -> PathBuf {
    PathBuf::from("qemu-x86_64")
}
fn default_qemu_plugin() -> PathBuf {
    PathBuf::from("./libinsn.so")
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            perf_binary: default_perf_binary(),
            pin_root: default_pin_root(),
            pin_arch: default_pin_arch(),
            qemu_binary: default_qemu_binary(),
            qemu_plugin: default_qemu_plugin(),
            timeout_ms: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ScacConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub input: InputSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub backend: BackendSettings,
}

impl ScacConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScacError::ConfigFile(format!("failed to read config file at {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ScacError::ConfigFile(msg) => ScacError::ConfigFile(format!("{path:?}: {msg}")),
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ScacError::ConfigFile(format!("failed to parse TOML: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ScacConfig::from_toml_str("").unwrap();
        assert_eq!(config.input.mode, None);
        assert_eq!(config.search.mode, None);
        assert_eq!(config.search.filler, 'A');
        assert_eq!(config.search.length, 32);
        assert_eq!(config.search.workers, 15);
        assert_eq!(config.search.alphabet, DEFAULT_ALPHABET);
        assert_eq!(config.backend.kind, BackendKind::Perf);
        assert_eq!(config.backend.pin_arch, "intel64");
        assert!(config.backend.timeout_ms.is_none());
    }

    #[test]
    fn default_alphabet_has_no_whitespace_or_duplicates() {
        assert_eq!(DEFAULT_ALPHABET.chars().count(), 94);
        assert!(!DEFAULT_ALPHABET.chars().any(char::is_whitespace));
        let mut seen = std::collections::HashSet::new();
        assert!(DEFAULT_ALPHABET.chars().all(|c| seen.insert(c)));
    }

    #[test]
    fn parses_full_document() {
        let doc = r#"
            [target]
            path = "./check"
            args = ["--key", "@@"]

            [input]
            mode = "arg"
            prefix = "user\n"

            [search]
            mode = "brute-all"
            alphabet = "abc"
            filler = "_"
            length = 8
            workers = 4

            [backend]
            kind = "qemu"
            qemu-binary = "qemu-aarch64"
            qemu-plugin = "/opt/libinsn.so"
            timeout-ms = 2500
        "#;
        let config = ScacConfig::from_toml_str(doc).unwrap();
        assert_eq!(config.target.path, Some(PathBuf::from("./check")));
        assert_eq!(config.target.args, vec!["--key", "@@"]);
        assert_eq!(config.input.mode, Some(InputMode::Arg));
        assert_eq!(config.input.prefix, "user\n");
        assert_eq!(config.search.mode, Some(SearchMode::BruteAll));
        assert_eq!(config.search.filler, '_');
        assert_eq!(config.search.length, 8);
        assert_eq!(config.backend.kind, BackendKind::Qemu);
        assert_eq!(config.backend.qemu_binary, PathBuf::from("qemu-aarch64"));
        assert_eq!(config.backend.timeout_ms, Some(2500));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = ScacConfig::from_toml_str("[search]\nthreads = 3\n").unwrap_err();
        assert!(matches!(err, ScacError::ConfigFile(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[search]\nmode = \"brute-forward\"\nlength = 3").unwrap();
        let config = ScacConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.search.mode, Some(SearchMode::BruteForward));
        assert_eq!(config.search.length, 3);
    }

    #[test]
    fn missing_file_is_a_config_file_error() {
        let err = ScacConfig::load_from_file(Path::new("/nonexistent/scac.toml")).unwrap_err();
        match err {
            ScacError::ConfigFile(msg) => assert!(msg.contains("failed to read")),
            other => panic!("Expected ConfigFile error, got {other:?}"),
        }
    }
}
