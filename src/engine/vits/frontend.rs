use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::EngineError;

/// `tokens.txt`: one `<symbol> <id>` pair per line. The symbol may itself be
/// a space, so the id is whatever follows the last space.
pub(super) struct TokenTable {
    ids: HashMap<String, i64>,
}

impl TokenTable {
    pub(super) fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.is_file() {
            return Err(EngineError::MissingFile(path.to_path_buf()));
        }
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub(super) fn parse(content: &str) -> Self {
        let mut ids = HashMap::new();
        for line in content.lines() {
            let Some((symbol, id)) = line.rsplit_once(' ') else {
                continue;
            };
            if let Ok(id) = id.trim().parse::<i64>() {
                let symbol = if symbol.is_empty() { " " } else { symbol };
                ids.insert(symbol.to_string(), id);
            }
        }
        Self { ids }
    }

    pub(super) fn get(&self, symbol: &str) -> Option<i64> {
        self.ids.get(symbol).copied()
    }

    pub(super) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Ids for `symbols`, skipping any the model does not know.
    pub(super) fn encode<'a>(&self, symbols: impl IntoIterator<Item = &'a str>) -> Vec<i64> {
        let mut skipped = 0usize;
        let ids: Vec<i64> = symbols
            .into_iter()
            .filter_map(|s| {
                let id = self.get(s);
                if id.is_none() {
                    skipped += 1;
                }
                id
            })
            .collect();
        if skipped > 0 {
            debug!(skipped, "Dropped symbols missing from tokens.txt");
        }
        ids
    }
}

/// Turns text into the symbol sequence a model's tokens.txt is keyed by.
pub(super) enum Frontend {
    /// IPA from the `espeak-ng` binary, one symbol per char.
    Espeak {
        voice: String,
        data_path: Option<PathBuf>,
    },
    /// Word to phone lookup from `lexicon.txt`, longest match first.
    Lexicon {
        words: HashMap<String, Vec<String>>,
        longest: usize,
    },
}

impl Frontend {
    /// Pick a frontend from what the model directory ships.
    pub(super) fn for_model_dir(model_dir: &Path, voice: Option<String>) -> Result<Self, EngineError> {
        let lexicon = model_dir.join("lexicon.txt");
        if lexicon.is_file() {
            return Self::lexicon(&std::fs::read_to_string(lexicon)?);
        }
        let data_path = model_dir
            .join("espeak-ng-data")
            .is_dir()
            .then(|| model_dir.to_path_buf());
        Ok(Frontend::Espeak {
            voice: voice.unwrap_or_else(|| "en-us".to_string()),
            data_path,
        })
    }

    pub(super) fn lexicon(content: &str) -> Result<Self, EngineError> {
        let mut words = HashMap::new();
        let mut longest = 1;
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let Some(word) = fields.next() else {
                continue;
            };
            let phones: Vec<String> = fields.map(str::to_string).collect();
            if phones.is_empty() {
                continue;
            }
            longest = longest.max(word.chars().count());
            words.entry(word.to_lowercase()).or_insert(phones);
        }
        if words.is_empty() {
            return Err(EngineError::Phonemizer("lexicon.txt has no entries".into()));
        }
        Ok(Frontend::Lexicon { words, longest })
    }

    pub(super) fn symbols(&self, text: &str) -> Result<Vec<String>, EngineError> {
        match self {
            Frontend::Espeak { voice, data_path } => {
                let ipa = run_espeak(text, voice, data_path.as_deref())?;
                Ok(ipa.chars().map(String::from).collect())
            }
            Frontend::Lexicon { words, longest } => Ok(lookup(words, *longest, text)),
        }
    }
}

fn lookup(words: &HashMap<String, Vec<String>>, longest: usize, text: &str) -> Vec<String> {
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        let max = longest.min(chars.len() - i);
        let hit = (1..=max).rev().find_map(|n| {
            let word: String = chars[i..i + n].iter().collect();
            words.get(&word).map(|phones| (n, phones))
        });
        match hit {
            Some((n, phones)) => {
                out.extend(phones.iter().cloned());
                i += n;
            }
            None => {
                // Punctuation passes through; tokens.txt decides whether it is kept.
                out.push(chars[i].to_string());
                i += 1;
            }
        }
    }
    out
}

fn run_espeak(text: &str, voice: &str, data_path: Option<&Path>) -> Result<String, EngineError> {
    let mut cmd = Command::new("espeak-ng");
    cmd.args(["--ipa", "-q", "--stdin", "-v", voice]);
    if let Some(path) = data_path {
        cmd.arg("--path").arg(path);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::Phonemizer("espeak-ng not found on PATH".into()),
            _ => EngineError::Io(e),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let mut payload = text.replace(['\r', '\n'], " ");
        payload.push('\n');
        stdin.write_all(payload.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(EngineError::Phonemizer(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    let ipa = String::from_utf8_lossy(&output.stdout);
    Ok(ipa.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_include_space_symbol() {
        let table = TokenTable::parse("_ 0\n^ 1\n$ 2\n  3\nə 59\nbad line\n");
        assert_eq!(table.get("_"), Some(0));
        assert_eq!(table.get(" "), Some(3));
        assert_eq!(table.get("ə"), Some(59));
        assert_eq!(table.len(), 5);
        assert_eq!(table.encode(["^", "x", "ə"]), vec![1, 59]);
    }

    #[test]
    fn lexicon_prefers_longest_word() {
        let frontend = Frontend::lexicon("你 n i3\n你好 n i2 h ao3\n好 h ao3\n").unwrap();
        let symbols = frontend.symbols("你好，好").unwrap();
        assert_eq!(symbols, vec!["n", "i2", "h", "ao3", "，", "h", "ao3"]);
    }

    #[test]
    fn empty_lexicon_is_rejected() {
        assert!(Frontend::lexicon("\n\n").is_err());
    }
}
