//! Instruction-count oracles.
//!
//! An oracle turns one invocation of the target into a single dynamic
//! instruction count. Every call is a fresh, independent process; nothing is
//! retried and nothing is cached.
//!
//! The search strategies built on top assume the count rises as a guess gets
//! more correct (a monotonic prefix or membership signal). Oracles do not and
//! cannot check this. If the target does not leak that way the search still
//! converges, just to the wrong answer.

use crate::config::{BackendKind, BackendSettings};
use crate::error::{Result, ScacError};
use crate::executor::{CancellationToken, CommandSpec, ProcessOutput, ProcessRunner};
use crate::input::Candidate;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

static RE_PERF_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+),,instructions:u").expect("valid perf count regex"));
static RE_QEMU_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"insns: (\d+)\n").expect("valid qemu count regex"));

/// File the pin `inscount1` tool writes into its working directory.
pub const PIN_OUTPUT_FILE: &str = "inscount.out";
/// `inscount.out` starts with `Count ` before the number.
const PIN_COUNT_OFFSET: usize = 6;
const PIN_TOOL_TEMPLATE: &str = "source/tools/ManualExamples/obj-{arch}/inscount1.so";

/// Measures the instruction count of one target invocation.
pub trait InstructionOracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs `candidate` once under instrumentation.
    ///
    /// Implementations that spawn processes must stop and return
    /// `ScacError::Cancelled` once `cancel` is tripped.
    fn count(&self, candidate: &Candidate, cancel: &CancellationToken) -> Result<u64>;
}

impl<T: InstructionOracle + ?Sized> InstructionOracle for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn count(&self, candidate: &Candidate, cancel: &CancellationToken) -> Result<u64> {
        (**self).count(candidate, cancel)
    }
}

impl<T: InstructionOracle + ?Sized> InstructionOracle for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn count(&self, candidate: &Candidate, cancel: &CancellationToken) -> Result<u64> {
        (**self).count(candidate, cancel)
    }
}

fn capture_first_integer(re: &Regex, haystack: &[u8]) -> Option<u64> {
    let caps = re.captures(haystack)?;
    let digits = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
    digits.parse().ok()
}

/// Extracts `<count>` from a `perf stat -x,` line of the form `<count>,,instructions:u`.
pub fn parse_perf_count(stderr: &[u8]) -> Option<u64> {
    capture_first_integer(&RE_PERF_COUNT, stderr)
}

/// Extracts `<count>` from the qemu plugin's `insns: <count>` line.
pub fn parse_qemu_count(stderr: &[u8]) -> Option<u64> {
    capture_first_integer(&RE_QEMU_COUNT, stderr)
}

/// Reads the number starting at byte offset 6 of pin's `inscount.out`.
pub fn parse_pin_count(contents: &[u8]) -> Option<u64> {
    let tail = contents.get(PIN_COUNT_OFFSET..)?;
    std::str::from_utf8(tail).ok()?.trim().parse().ok()
}

fn combined_output(output: &ProcessOutput) -> String {
    format!(
        "[stdout]\n{}\n[stderr]\n{}",
        output.stdout_lossy(),
        output.stderr_lossy()
    )
}

fn require_file(path: &Path, what: &str) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(ScacError::resource(format!(
            "{what} does not exist or is not a file: {}",
            path.display()
        )));
    }
    path.canonicalize()
        .map_err(|e| ScacError::resource(format!("cannot resolve {what} {}: {e}", path.display())))
}

/// Resolves an instrumentation tool given either as a path or as a bare name
/// looked up on `PATH`.
fn require_program(program: &Path, what: &str) -> Result<PathBuf> {
    which::which(program).map_err(|e| {
        ScacError::resource(format!("{what} not found: {} ({e})", program.display()))
    })
}

/// Counts user-space instructions with `perf stat -einstructions:u -x,`.
#[derive(Debug, Clone)]
pub struct PerfOracle {
    perf_binary: PathBuf,
    target: PathBuf,
    runner: ProcessRunner,
}

impl PerfOracle {
    pub fn new(perf_binary: impl AsRef<Path>, target: &Path, runner: ProcessRunner) -> Result<Self> {
        Ok(Self {
            perf_binary: require_program(perf_binary.as_ref(), "perf binary")?,
            target: require_file(target, "target program")?,
            runner,
        })
    }
}

impl InstructionOracle for PerfOracle {
    fn name(&self) -> &'static str {
        "perf"
    }

    fn count(&self, candidate: &Candidate, cancel: &CancellationToken) -> Result<u64> {
        let spec = CommandSpec::new(&self.perf_binary)
            .args(["stat", "-einstructions:u", "-x,"])
            .arg(&self.target)
            .args(candidate.argv());
        let output = self.runner.run(&spec, candidate.stdin(), cancel)?;
        parse_perf_count(&output.stderr).ok_or_else(|| {
            ScacError::oracle(
                format!(
                    "no '<count>,,instructions:u' line in perf output (perf {})",
                    output.describe_exit()
                ),
                combined_output(&output),
            )
        })
    }
}

/// Counts instructions with pin's `inscount1` tool.
///
/// Each run gets its own scratch directory, since the tool always writes
/// `inscount.out` into the working directory.
#[derive(Debug, Clone)]
pub struct PinOracle {
    pin_binary: PathBuf,
    inscount_tool: PathBuf,
    target: PathBuf,
    runner: ProcessRunner,
}

impl PinOracle {
    pub fn new(pin_root: &Path, arch: &str, target: &Path, runner: ProcessRunner) -> Result<Self> {
        let pin_binary = require_file(&pin_root.join("pin"), "pin binary")?;
        let tool_rel = PIN_TOOL_TEMPLATE.replace("{arch}", arch);
        let inscount_tool = require_file(&pin_root.join(tool_rel), "pin inscount1 tool")?;
        Ok(Self {
            pin_binary,
            inscount_tool,
            target: require_file(target, "target program")?,
            runner,
        })
    }
}

impl InstructionOracle for PinOracle {
    fn name(&self) -> &'static str {
        "pin"
    }

    fn count(&self, candidate: &Candidate, cancel: &CancellationToken) -> Result<u64> {
        let scratch = tempfile::tempdir()?;
        let spec = CommandSpec::new(&self.pin_binary)
            .arg("-t")
            .arg(&self.inscount_tool)
            .arg("--")
            .arg(&self.target)
            .args(candidate.argv())
            .current_dir(scratch.path());
        let output = self.runner.run(&spec, candidate.stdin(), cancel)?;

        let out_path = scratch.path().join(PIN_OUTPUT_FILE);
        let contents = std::fs::read(&out_path).map_err(|e| {
            ScacError::oracle(
                format!(
                    "pin did not produce {PIN_OUTPUT_FILE}: {e} (pin {})",
                    output.describe_exit()
                ),
                combined_output(&output),
            )
        })?;
        parse_pin_count(&contents).ok_or_else(|| {
            ScacError::oracle(
                format!("unparseable {PIN_OUTPUT_FILE}"),
                String::from_utf8_lossy(&contents).into_owned(),
            )
        })
    }
}

/// Counts instructions with a qemu user-mode TCG plugin (`libinsn.so`).
#[derive(Debug, Clone)]
pub struct QemuOracle {
    qemu_binary: PathBuf,
    plugin: PathBuf,
    target: PathBuf,
    runner: ProcessRunner,
}

impl QemuOracle {
    pub fn new(
        qemu_binary: impl AsRef<Path>,
        plugin: &Path,
        target: &Path,
        runner: ProcessRunner,
    ) -> Result<Self> {
        Ok(Self {
            qemu_binary: require_program(qemu_binary.as_ref(), "qemu binary")?,
            plugin: require_file(plugin, "qemu plugin")?,
            target: require_file(target, "target program")?,
            runner,
        })
    }
}

impl InstructionOracle for QemuOracle {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn count(&self, candidate: &Candidate, cancel: &CancellationToken) -> Result<u64> {
        let mut plugin_arg = self.plugin.clone().into_os_string();
        plugin_arg.push(",inline=true");
        let spec = CommandSpec::new(&self.qemu_binary)
            .arg("-plugin")
            .arg(plugin_arg)
            .args(["-d", "plugin"])
            .arg(&self.target)
            .args(candidate.argv());
        let output = self.runner.run(&spec, candidate.stdin(), cancel)?;
        parse_qemu_count(&output.stderr).ok_or_else(|| {
            ScacError::oracle(
                format!(
                    "no 'insns: <count>' line in qemu output (qemu {})",
                    output.describe_exit()
                ),
                combined_output(&output),
            )
        })
    }
}

/// Builds the configured backend for `target`, checking its prerequisites.
pub fn build_oracle(settings: &BackendSettings, target: &Path) -> Result<Box<dyn InstructionOracle>> {
    let runner = ProcessRunner::new(settings.timeout_ms.map(Duration::from_millis));
    let oracle: Box<dyn InstructionOracle> = match settings.kind {
        BackendKind::Perf => Box::new(PerfOracle::new(&settings.perf_binary, target, runner)?),
        BackendKind::Pin => Box::new(PinOracle::new(
            &settings.pin_root,
            &settings.pin_arch,
            target,
            runner,
        )?),
        BackendKind::Qemu => Box::new(QemuOracle::new(
            &settings.qemu_binary,
            &settings.qemu_plugin,
            target,
            runner,
        )?),
    };
    info!(backend = oracle.name(), target = %target.display(), "oracle ready");
    debug!(?settings, "backend settings");
    Ok(oracle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputTemplate;

    fn test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn stdin_candidate(payload: &str) -> Candidate {
        InputTemplate::stdin_only().candidate(payload)
    }

    #[test]
    fn perf_count_parses_csv_line() {
        let stderr = b"  1234567,,instructions:u,1000200,100.00,,\n";
        assert_eq!(parse_perf_count(stderr), Some(1_234_567));
        assert_eq!(parse_perf_count(b"<not counted>,,instructions:u,0,100.00,,\n"), None);
        assert_eq!(parse_perf_count(b""), None);
    }

    #[test]
    fn qemu_count_parses_insns_line() {
        assert_eq!(parse_qemu_count(b"some noise\ninsns: 98765\n"), Some(98_765));
        assert_eq!(parse_qemu_count(b"insns: 98765"), None);
        assert_eq!(parse_qemu_count(b"bb: 12\n"), None);
    }

    #[test]
    fn pin_count_skips_label() {
        assert_eq!(parse_pin_count(b"Count 424242\n"), Some(424_242));
        assert_eq!(parse_pin_count(b"Count"), None);
        assert_eq!(parse_pin_count(b"Count abc\n"), None);
    }

    #[test]
    fn perf_oracle_reads_count_from_fake_perf() {
        let fake_perf = test_target_path("fake_perf.sh");
        let target = test_target_path("dummy_target.sh");
        let oracle = PerfOracle::new(&fake_perf, &target, ProcessRunner::default()).unwrap();
        let token = CancellationToken::new();
        // fake_perf.sh reports 1000 + stdin length.
        assert_eq!(oracle.count(&stdin_candidate(""), &token).unwrap(), 1000);
        assert_eq!(oracle.count(&stdin_candidate("abcd"), &token).unwrap(), 1004);
    }

    #[test]
    fn qemu_oracle_reads_count_from_fake_qemu() {
        let fake_qemu = test_target_path("fake_qemu.sh");
        let plugin = test_target_path("fake_libinsn.so");
        let target = test_target_path("dummy_target.sh");
        let oracle = QemuOracle::new(&fake_qemu, &plugin, &target, ProcessRunner::default()).unwrap();
        let count = oracle
            .count(&stdin_candidate("xyz"), &CancellationToken::new())
            .unwrap();
        assert_eq!(count, 2003);
    }

    #[test]
    fn pin_oracle_reads_count_from_scratch_file() {
        let pin_root = test_target_path("fake_pin");
        let target = test_target_path("dummy_target.sh");
        let oracle = PinOracle::new(&pin_root, "intel64", &target, ProcessRunner::default()).unwrap();
        let count = oracle
            .count(&stdin_candidate("hello"), &CancellationToken::new())
            .unwrap();
        assert_eq!(count, 3005);
    }

    #[test]
    fn unparseable_output_is_oracle_error_with_raw_text() {
        let broken = test_target_path("broken_tool.sh");
        let target = test_target_path("dummy_target.sh");
        let oracle = PerfOracle::new(&broken, &target, ProcessRunner::default()).unwrap();
        match oracle.count(&stdin_candidate("x"), &CancellationToken::new()) {
            Err(ScacError::Oracle { message, raw_output }) => {
                assert!(message.contains("instructions:u"), "got: {message}");
                assert!(raw_output.contains("segmentation fault in tool"), "got: {raw_output}");
            }
            other => panic!("Expected Oracle error, got {other:?}"),
        }
    }

    #[test]
    fn missing_prerequisites_are_resource_errors() {
        let target = test_target_path("dummy_target.sh");
        let missing = test_target_path("no_such_dir");
        assert!(matches!(
            PinOracle::new(&missing, "intel64", &target, ProcessRunner::default()),
            Err(ScacError::Resource(_))
        ));
        assert!(matches!(
            PinOracle::new(&test_target_path("fake_pin"), "ia32", &target, ProcessRunner::default()),
            Err(ScacError::Resource(_))
        ));
        assert!(matches!(
            QemuOracle::new("qemu-x86_64", &missing, &target, ProcessRunner::default()),
            Err(ScacError::Resource(_))
        ));
        assert!(matches!(
            PerfOracle::new("perf", &missing, ProcessRunner::default()),
            Err(ScacError::Resource(_))
        ));
    }

    #[test]
    fn missing_tool_binaries_fail_at_construction() {
        let target = test_target_path("dummy_target.sh");
        let plugin = test_target_path("fake_libinsn.so");
        match PerfOracle::new("/no/such/perf", &target, ProcessRunner::default()) {
            Err(ScacError::Resource(msg)) => assert!(msg.contains("perf binary"), "got: {msg}"),
            other => panic!("Expected Resource error, got {other:?}"),
        }
        assert!(matches!(
            PerfOracle::new("scac-no-such-perf-on-path", &target, ProcessRunner::default()),
            Err(ScacError::Resource(_))
        ));
        match QemuOracle::new("/no/such/qemu-x86_64", &plugin, &target, ProcessRunner::default()) {
            Err(ScacError::Resource(msg)) => assert!(msg.contains("qemu binary"), "got: {msg}"),
            other => panic!("Expected Resource error, got {other:?}"),
        }
        // Bare names resolve through PATH.
        assert!(PerfOracle::new("sh", &target, ProcessRunner::default()).is_ok());
    }

    #[test]
    fn build_oracle_selects_backend() {
        let settings = BackendSettings {
            kind: BackendKind::Perf,
            perf_binary: test_target_path("fake_perf.sh"),
            ..BackendSettings::default()
        };
        let oracle = build_oracle(&settings, &test_target_path("dummy_target.sh")).unwrap();
        assert_eq!(oracle.name(), "perf");

        let settings = BackendSettings {
            kind: BackendKind::Pin,
            pin_root: test_target_path("fake_pin"),
            ..BackendSettings::default()
        };
        let oracle = build_oracle(&settings, &test_target_path("dummy_target.sh")).unwrap();
        assert_eq!(oracle.name(), "pin");
    }
}
