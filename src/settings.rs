//! Flat `key=value` settings files.
//!
//! One assignment per line, `#` comments, blank lines ignored. Values may be
//! quoted, and list values may carry shell-style surrounding parentheses
//! (`ALL_LANGS=(AR CA SW)`), which are stripped. A repeated key overrides the
//! earlier assignment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PipelineError, PtResult};

#[derive(Clone, Debug)]
pub struct Settings {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl Settings {
    pub fn load(path: &Path) -> PtResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("read settings {}: {e}", path.display()))
        })?;
        Ok(Self::parse(path, &text))
    }

    pub fn parse(path: &Path, text: &str) -> Self {
        let mut values = HashMap::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                continue;
            }
            values.insert(key.to_string(), unquote(value.trim()).to_string());
        }
        Self {
            path: path.to_path_buf(),
            values,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> PtResult<&str> {
        self.get(key).ok_or_else(|| {
            PipelineError::config(format!(
                "missing required setting {key} in {}",
                self.path.display()
            ))
        })
    }

    /// Space-separated list value; surrounding parentheses tolerated.
    pub fn list(&self, key: &str) -> Vec<String> {
        let Some(value) = self.get(key) else {
            return Vec::new();
        };
        let value = value
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim();
        value.split_whitespace().map(str::to_string).collect()
    }

    pub fn require_list(&self, key: &str) -> PtResult<Vec<String>> {
        self.require(key)?;
        let items = self.list(key);
        if items.is_empty() {
            return Err(PipelineError::config(format!(
                "setting {key} in {} must be a non-empty list",
                self.path.display()
            )));
        }
        Ok(items)
    }

    pub fn parsed<T: FromStr>(&self, key: &str, default: T) -> PtResult<T> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                PipelineError::config(format!(
                    "setting {key}={raw} in {} is not a valid {}",
                    self.path.display(),
                    std::any::type_name::<T>()
                ))
            }),
        }
    }

    /// Space-separated numeric list, falling back to `default` when unset.
    pub fn parsed_list<T: FromStr>(&self, key: &str, default: T) -> PtResult<Vec<T>> {
        if self.get(key).is_none() {
            return Ok(vec![default]);
        }
        let items = self.require_list(key)?;
        items
            .iter()
            .map(|raw| {
                raw.parse().map_err(|_| {
                    PipelineError::config(format!(
                        "setting {key} in {} contains invalid entry {raw}",
                        self.path.display()
                    ))
                })
            })
            .collect()
    }

    /// Boolean flag with an explicit default; absence never means anything
    /// other than the documented default.
    pub fn flag(&self, key: &str, default: bool) -> PtResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                other => Err(PipelineError::config(format!(
                    "setting {key}={other} in {} is not a boolean",
                    self.path.display()
                ))),
            },
        }
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use crate::error::PipelineError;
    use std::path::Path;

    fn parse(text: &str) -> Settings {
        Settings::parse(Path::new("test.settings"), text)
    }

    #[test]
    fn parses_assignments_comments_and_quotes() {
        let s = parse(
            "# a comment\nLANG_NAME=swahili\nexport EXP=\"/tmp/exp\"\n\nTESTTYPE='dev'\n",
        );
        assert_eq!(s.get("LANG_NAME"), Some("swahili"));
        assert_eq!(s.get("EXP"), Some("/tmp/exp"));
        assert_eq!(s.get("TESTTYPE"), Some("dev"));
        assert_eq!(s.get("MISSING"), None);
    }

    #[test]
    fn later_assignment_overrides_earlier() {
        let s = parse("TOPN=5\nTOPN=10\n");
        assert_eq!(s.get("TOPN"), Some("10"));
    }

    #[test]
    fn lists_accept_parentheses() {
        let s = parse("ALL_LANGS=(AR CA DT HG MD SW UR TK)\nTRAIN_LANG=AR CA\n");
        assert_eq!(s.list("ALL_LANGS").len(), 8);
        assert_eq!(s.list("TRAIN_LANG"), vec!["AR", "CA"]);
        assert!(s.list("DEV_LANG").is_empty());
    }

    #[test]
    fn require_names_the_key_and_file() {
        let s = parse("");
        let err = s.require("DATA").unwrap_err();
        match err {
            PipelineError::Config(msg) => {
                assert!(msg.contains("DATA"));
                assert!(msg.contains("test.settings"));
            }
            other => panic!("expected Config, got {other:?}"),
        }
    }

    #[test]
    fn parsed_list_defaults_when_unset() {
        let s = parse("Pscale=0.5 1.0 1.5\n");
        assert_eq!(s.parsed_list("Pscale", 1.0f64).unwrap(), vec![0.5, 1.0, 1.5]);
        assert_eq!(s.parsed_list("Gscale", 1.0f64).unwrap(), vec![1.0]);
    }

    #[test]
    fn flags_have_explicit_defaults_and_reject_garbage() {
        let s = parse("makeTPLM=true\ndebug=0\nbroken=maybe\n");
        assert!(s.flag("makeTPLM", false).unwrap());
        assert!(!s.flag("debug", true).unwrap());
        assert!(s.flag("decode_adapt", false).is_ok());
        assert!(!s.flag("decode_adapt", false).unwrap());
        assert!(s.flag("broken", false).is_err());
    }
}
