use scac_core::config::{BackendKind, ScacConfig, SearchMode};
use scac_core::evaluator::ParallelEvaluator;
use scac_core::input::{InputMode, InputTemplate, unescape_newlines};
use scac_core::logging;
use scac_core::observer::TracingObserver;
use scac_core::oracle::build_oracle;
use scac_core::strategy::{
    Alphabet, SearchContext, SearchOutcome, SearchParams, SearchResult, build_strategy,
};
use scac_core::ScacError;

use anyhow::anyhow;
use clap::{ArgGroup, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "scac.toml";

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Recover secret input from instruction-count side channels",
    long_about = "Recover secret input from instruction-count side channels.\n\n\
        If bruting via a program argument, mark the input position with @@. \
        If bruting via stdin the guess is placed between the prefix and suffix.\n\n\
        Place the target program and its arguments after all options, following \"--\":\n\n    \
        scac --arg --brute-length -- ./check @@"
)]
#[clap(group(ArgGroup::new("input_mode").args(["stdin", "arg"])))]
#[clap(group(
    ArgGroup::new("search_mode")
        .args(["brute_length", "brute_forward", "brute_backward", "brute_all"])
))]
struct Cli {
    /// TOML configuration file; flags override its values
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// Send input via stdin. One of --stdin/--arg is required unless the config file sets it
    #[clap(long)]
    stdin: bool,
    /// Send input via a program argument, marked by @@
    #[clap(long)]
    arg: bool,

    /// Find the best length of input
    #[clap(long)]
    brute_length: bool,
    /// Brute input from the start of the string
    #[clap(long)]
    brute_forward: bool,
    /// Brute input from the end of the string
    #[clap(long)]
    brute_backward: bool,
    /// Brute one character at a time at all possible positions
    #[clap(long)]
    brute_all: bool,

    /// Instruction-counting backend. Pin is more exact, perf is much faster, qemu is in between
    #[clap(short, long, value_enum)]
    backend: Option<BackendArg>,
    /// Pin architecture, usually intel64 or ia32
    #[clap(long)]
    arch: Option<String>,
    /// Path to the pin folder (not the binary)
    #[clap(long)]
    pin: Option<PathBuf>,
    /// Name or path of the perf binary
    #[clap(long)]
    perf_binary: Option<PathBuf>,
    /// Name or path of the qemu user-mode binary
    #[clap(long)]
    qemu_binary: Option<PathBuf>,
    /// Path to libinsn.so
    #[clap(long)]
    qemu_plugin: Option<PathBuf>,
    /// Kill an instrumented run after this many milliseconds
    #[clap(long)]
    timeout_ms: Option<u64>,

    /// Prefix for stdin input (\n is unescaped)
    #[clap(short, long)]
    prefix: Option<String>,
    /// Suffix for stdin input (\n is unescaped)
    #[clap(short, long)]
    suffix: Option<String>,
    /// Possible input characters
    #[clap(short, long = "alph")]
    alphabet: Option<String>,
    /// Character used to fill out the rest of the input
    #[clap(short = 't', long = "tmpchar")]
    filler: Option<char>,
    /// Length of input to try, or maximum length in length mode
    #[clap(short, long)]
    length: Option<usize>,
    /// Number of instrumented runs in flight at once
    #[clap(long)]
    procs: Option<usize>,

    /// Print the outcome as JSON
    #[clap(long)]
    json: bool,
    /// Emit logs as JSON lines
    #[clap(long)]
    log_json: bool,

    /// Target program followed by its arguments
    #[clap(last = true)]
    command: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum BackendArg {
    Perf,
    Pin,
    Qemu,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Perf => BackendKind::Perf,
            BackendArg::Pin => BackendKind::Pin,
            BackendArg::Qemu => BackendKind::Qemu,
        }
    }
}

impl Cli {
    fn input_mode(&self) -> Option<InputMode> {
        if self.stdin {
            Some(InputMode::Stdin)
        } else if self.arg {
            Some(InputMode::Arg)
        } else {
            None
        }
    }

    fn search_mode(&self) -> Option<SearchMode> {
        if self.brute_length {
            Some(SearchMode::BruteLength)
        } else if self.brute_forward {
            Some(SearchMode::BruteForward)
        } else if self.brute_backward {
            Some(SearchMode::BruteBackward)
        } else if self.brute_all {
            Some(SearchMode::BruteAll)
        } else {
            None
        }
    }
}

fn load_config(cli: &Cli) -> Result<ScacConfig, anyhow::Error> {
    let config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            ScacConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("No config file specified, loading default {default_config_path:?}");
                ScacConfig::load_from_file(&default_config_path)?
            } else {
                ScacConfig::default()
            }
        }
    };
    Ok(config)
}

fn apply_overrides(config: &mut ScacConfig, cli: &Cli) {
    if let Some((target, args)) = cli.command.split_first() {
        config.target.path = Some(PathBuf::from(target));
        config.target.args = args.to_vec();
    }

    if let Some(mode) = cli.input_mode() {
        config.input.mode = Some(mode);
    }
    if let Some(prefix) = &cli.prefix {
        config.input.prefix = unescape_newlines(prefix);
    }
    if let Some(suffix) = &cli.suffix {
        config.input.suffix = unescape_newlines(suffix);
    }

    if let Some(mode) = cli.search_mode() {
        config.search.mode = Some(mode);
    }
    if let Some(alphabet) = &cli.alphabet {
        config.search.alphabet = alphabet.clone();
    }
    if let Some(filler) = cli.filler {
        config.search.filler = filler;
    }
    if let Some(length) = cli.length {
        config.search.length = length;
    }
    if let Some(procs) = cli.procs {
        config.search.workers = procs;
    }

    let backend = &mut config.backend;
    if let Some(kind) = cli.backend {
        backend.kind = kind.into();
    }
    if let Some(arch) = &cli.arch {
        backend.pin_arch = arch.clone();
    }
    if let Some(pin) = &cli.pin {
        backend.pin_root = pin.clone();
    }
    if let Some(perf) = &cli.perf_binary {
        backend.perf_binary = perf.clone();
    }
    if let Some(qemu) = &cli.qemu_binary {
        backend.qemu_binary = qemu.clone();
    }
    if let Some(plugin) = &cli.qemu_plugin {
        backend.qemu_plugin = plugin.clone();
    }
    if cli.timeout_ms.is_some() {
        backend.timeout_ms = cli.timeout_ms;
    }
}

fn run_search(config: &ScacConfig) -> Result<SearchOutcome, anyhow::Error> {
    let target = config
        .target
        .path
        .as_ref()
        .ok_or_else(|| anyhow!("No target program given; place it after \"--\""))?;
    if !target.is_file() {
        return Err(ScacError::resource(format!(
            "target program does not exist: {}",
            target.display()
        ))
        .into());
    }
    let mode = config.search.mode.ok_or_else(|| {
        anyhow!("No search mode given; use --brute-length, --brute-forward, --brute-backward or --brute-all")
    })?;

    let input_mode = config
        .input
        .mode
        .ok_or_else(|| anyhow!("No input mode given; use --stdin or --arg"))?;

    let template = InputTemplate::new(
        input_mode,
        config.target.args.clone(),
        config.input.prefix.clone(),
        config.input.suffix.clone(),
    )?;
    let oracle = build_oracle(&config.backend, target)?;
    let evaluator = ParallelEvaluator::new(oracle, config.search.workers)?;
    let params = SearchParams::new(
        Alphabet::new(&config.search.alphabet),
        config.search.filler,
        config.search.length,
    );
    let strategy = build_strategy(mode, params);

    info!(
        strategy = strategy.name(),
        input_mode = ?input_mode,
        workers = config.search.workers,
        "Starting search"
    );
    let start_time = Instant::now();
    let mut observer = TracingObserver;
    let mut ctx = SearchContext::new(&evaluator, &template, &mut observer);
    let outcome = strategy.search(&mut ctx)?;
    info!(
        rounds = outcome.rounds,
        oracle_calls = outcome.oracle_calls,
        "Search finished in {:.2?}",
        start_time.elapsed()
    );
    Ok(outcome)
}

fn render_outcome(outcome: &SearchOutcome, json: bool) -> Result<String, anyhow::Error> {
    if json {
        return Ok(serde_json::to_string_pretty(outcome)?);
    }
    let summary = match &outcome.result {
        SearchResult::Length {
            best_length,
            max_count: Some(count),
        } => format!("best length {best_length} ({count} instructions)"),
        SearchResult::Length {
            best_length,
            max_count: None,
        } => format!("best length {best_length} (nothing probed)"),
        SearchResult::Secret { value } => format!("found input {value:?}"),
    };
    Ok(format!(
        "{summary}\n{} rounds, {} oracle calls",
        outcome.rounds, outcome.oracle_calls
    ))
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    if cli.log_json {
        logging::init_tracing_json("info");
    } else {
        logging::init_tracing("info");
    }

    let mut config = load_config(&cli)?;
    apply_overrides(&mut config, &cli);
    let outcome = run_search(&config)?;
    println!("{}", render_outcome(&outcome, cli.json)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_target_path(name: &str) -> String {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir
            .join("../test_targets")
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    fn config_from(args: &[&str]) -> ScacConfig {
        let cli = Cli::try_parse_from(args).expect("valid command line");
        let mut config = ScacConfig::default();
        apply_overrides(&mut config, &cli);
        config
    }

    #[test]
    fn parses_flags_into_config() {
        let config = config_from(&[
            "scac", "--arg", "--brute-all", "-b", "qemu", "-p", "a\\nb", "-s", "\\n", "-a",
            "xyz", "-t", "_", "-l", "7", "--procs", "3", "--", "./check", "--key", "@@",
        ]);
        assert_eq!(config.target.path, Some(PathBuf::from("./check")));
        assert_eq!(config.target.args, vec!["--key", "@@"]);
        assert_eq!(config.input.mode, Some(InputMode::Arg));
        assert_eq!(config.input.prefix, "a\nb");
        assert_eq!(config.input.suffix, "\n");
        assert_eq!(config.search.mode, Some(SearchMode::BruteAll));
        assert_eq!(config.search.alphabet, "xyz");
        assert_eq!(config.search.filler, '_');
        assert_eq!(config.search.length, 7);
        assert_eq!(config.search.workers, 3);
        assert_eq!(config.backend.kind, BackendKind::Qemu);
    }

    #[test]
    fn input_and_search_modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["scac", "--stdin", "--arg", "--brute-all"]).is_err());
        assert!(
            Cli::try_parse_from(["scac", "--stdin", "--brute-all", "--brute-forward"]).is_err()
        );
    }

    #[test]
    fn flags_left_out_keep_config_values() {
        let mut config = ScacConfig::from_toml_str(
            "[input]\nmode = \"arg\"\n[search]\nmode = \"brute-backward\"\nlength = 9\n[backend]\nkind = \"pin\"\n",
        )
        .unwrap();
        let cli = Cli::try_parse_from(["scac", "-l", "4"]).unwrap();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.input.mode, Some(InputMode::Arg));
        assert_eq!(config.search.mode, Some(SearchMode::BruteBackward));
        assert_eq!(config.search.length, 4);
        assert_eq!(config.backend.kind, BackendKind::Pin);
    }

    #[test]
    fn input_mode_must_come_from_flags_or_config() {
        let perf = test_target_path("fake_perf.sh");
        let target = test_target_path("dummy_target.sh");
        let config = config_from(&[
            "scac", "--brute-length", "--perf-binary", &perf, "-l", "2", "--", &target,
        ]);
        assert_eq!(config.input.mode, None);
        let err = run_search(&config).unwrap_err();
        assert!(err.to_string().contains("--stdin or --arg"), "got: {err}");

        let mut config = config;
        config.input.mode = Some(InputMode::Stdin);
        assert!(run_search(&config).is_ok());
    }

    #[test]
    fn missing_target_fails_fast_with_resource_error() {
        let config = config_from(&["scac", "--stdin", "--brute-length", "--", "/no/such/target"]);
        let err = run_search(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScacError>(),
            Some(ScacError::Resource(_))
        ));
    }

    #[test]
    fn malformed_pin_installation_fails_fast() {
        let target = test_target_path("dummy_target.sh");
        let config = config_from(&[
            "scac", "--stdin", "--brute-length", "-b", "pin", "--pin", "/no/such/pin", "--",
            &target,
        ]);
        let err = run_search(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScacError>(),
            Some(ScacError::Resource(_))
        ));
    }

    #[test]
    fn length_search_end_to_end_with_fake_perf() {
        let perf = test_target_path("fake_perf.sh");
        let target = test_target_path("dummy_target.sh");
        let config = config_from(&[
            "scac", "--stdin", "--brute-length", "--perf-binary", &perf, "-l", "5", "--procs",
            "2", "--", &target,
        ]);
        let outcome = run_search(&config).unwrap();
        assert_eq!(
            outcome.result,
            SearchResult::Length {
                best_length: 5,
                max_count: Some(1005),
            }
        );
        assert_eq!(outcome.oracle_calls, 6);
    }

    #[test]
    fn forward_search_end_to_end_with_leaky_fake_perf() {
        let perf = test_target_path("fake_perf_leaky.sh");
        let target = test_target_path("dummy_target.sh");
        let config = config_from(&[
            "scac", "--stdin", "--brute-forward", "--perf-binary", &perf, "-a", "ABCEKY", "-l",
            "3", "--procs", "4", "--", &target,
        ]);
        let outcome = run_search(&config).unwrap();
        assert_eq!(
            outcome.result,
            SearchResult::Secret {
                value: "KEY".to_string()
            }
        );
        assert_eq!(outcome.oracle_calls, 3 * 6);

        let rendered = render_outcome(&outcome, false).unwrap();
        assert!(rendered.contains("found input \"KEY\""));
        let json: serde_json::Value =
            serde_json::from_str(&render_outcome(&outcome, true).unwrap()).unwrap();
        assert_eq!(json["result"]["value"], "KEY");
    }

    #[test]
    fn arg_mode_without_placeholder_is_a_config_error() {
        let perf = test_target_path("fake_perf.sh");
        let target = test_target_path("dummy_target.sh");
        let config = config_from(&[
            "scac", "--arg", "--brute-forward", "--perf-binary", &perf, "--", &target, "plain",
        ]);
        let err = run_search(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScacError>(),
            Some(ScacError::Config(_))
        ));
    }
}
