use crate::error::{Result, ScacError};
use serde::{Deserialize, Serialize};

/// Placeholder in the target's argument list replaced by the guess in `Arg` mode.
pub const ARG_PLACEHOLDER: &str = "@@";

/// One full invocation of the target: argument vector plus standard-input bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Candidate {
    argv: Vec<String>,
    stdin: Vec<u8>,
}

impl Candidate {
    pub fn new(argv: Vec<String>, stdin: impl Into<Vec<u8>>) -> Self {
        Self {
            argv,
            stdin: stdin.into(),
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn stdin(&self) -> &[u8] {
        &self.stdin
    }
}

/// Candidates submitted together. Index position is the key that aligns each
/// candidate with its instruction count.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    candidates: Vec<Candidate>,
}

impl Batch {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    /// Zips separate argument-vector and stdin lists into a batch.
    ///
    /// A missing list defaults to empty entries of the other list's length.
    /// Mismatched lengths, or neither list given, is a `ScacError::Config`.
    pub fn from_parts(
        argvs: Option<Vec<Vec<String>>>,
        stdins: Option<Vec<Vec<u8>>>,
    ) -> Result<Self> {
        let (argvs, stdins) = match (argvs, stdins) {
            (None, None) => {
                return Err(ScacError::config(
                    "provide at least one of argument vectors and stdin payloads",
                ));
            }
            (Some(argvs), None) => {
                let stdins = vec![Vec::new(); argvs.len()];
                (argvs, stdins)
            }
            (None, Some(stdins)) => {
                let argvs = vec![Vec::new(); stdins.len()];
                (argvs, stdins)
            }
            (Some(argvs), Some(stdins)) => {
                if argvs.len() != stdins.len() {
                    return Err(ScacError::config(format!(
                        "length mismatch between argument vectors ({}) and stdin payloads ({})",
                        argvs.len(),
                        stdins.len()
                    )));
                }
                (argvs, stdins)
            }
        };

        if argvs.is_empty() {
            return Err(ScacError::config("batch has neither argv nor stdin entries"));
        }

        let candidates = argvs
            .into_iter()
            .zip(stdins)
            .map(|(argv, stdin)| Candidate::new(argv, stdin))
            .collect();
        Ok(Self { candidates })
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// How a guessed string reaches the target.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InputMode {
    /// Guess is written to standard input between prefix and suffix.
    #[default]
    Stdin,
    /// Guess replaces the single `@@` argument; stdin carries prefix + suffix.
    Arg,
}

/// Turns guesses into candidates for a fixed target invocation.
#[derive(Debug, Clone)]
pub struct InputTemplate {
    mode: InputMode,
    args: Vec<String>,
    prefix: String,
    suffix: String,
}

impl InputTemplate {
    pub fn new(
        mode: InputMode,
        args: Vec<String>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Result<Self> {
        if mode == InputMode::Arg {
            let placeholders = args.iter().filter(|a| *a == ARG_PLACEHOLDER).count();
            if placeholders != 1 {
                return Err(ScacError::config(format!(
                    "argument mode needs exactly one '{ARG_PLACEHOLDER}' in the target arguments, found {placeholders}"
                )));
            }
        }
        Ok(Self {
            mode,
            args,
            prefix: prefix.into(),
            suffix: suffix.into(),
        })
    }

    /// Plain stdin delivery with no arguments, prefix or suffix.
    pub fn stdin_only() -> Self {
        Self {
            mode: InputMode::Stdin,
            args: Vec::new(),
            prefix: String::new(),
            suffix: String::new(),
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn candidate(&self, guess: &str) -> Candidate {
        match self.mode {
            InputMode::Stdin => {
                let stdin = format!("{}{}{}", self.prefix, guess, self.suffix);
                Candidate::new(self.args.clone(), stdin.into_bytes())
            }
            InputMode::Arg => {
                let argv = self
                    .args
                    .iter()
                    .map(|a| {
                        if a == ARG_PLACEHOLDER {
                            guess.to_string()
                        } else {
                            a.clone()
                        }
                    })
                    .collect();
                let stdin = format!("{}{}", self.prefix, self.suffix);
                Candidate::new(argv, stdin.into_bytes())
            }
        }
    }

    pub fn batch<S: AsRef<str>>(&self, guesses: &[S]) -> Batch {
        Batch::new(guesses.iter().map(|g| self.candidate(g.as_ref())).collect())
    }
}

/// Replaces literal `\n` sequences with newlines, as typed on a shell.
pub fn unescape_newlines(raw: &str) -> String {
    raw.replace("\\n", "\n")
}
