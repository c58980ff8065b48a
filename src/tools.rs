//! External-tool resolution and invocation.
//!
//! Tool executables are looked up in a persisted `key=value` cache file
//! (`EXP/tools.cache`). A miss consults an injected [`PromptSource`] and the
//! answer is appended to the cache; an entry already cached is never
//! overwritten. Invocation captures stdout/stderr, and a non-zero exit
//! becomes a [`PipelineError::Tool`] carrying the captured stderr.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{PipelineError, PtResult};

/// How a tool path missing from the cache is obtained. Interactive by
/// default; tests and automated contexts inject a non-interactive source.
pub trait PromptSource {
    fn prompt(&self, tool: &str) -> PtResult<String>;
}

/// Asks on stderr and reads one line from stdin.
pub struct StdinPrompt;

impl PromptSource for StdinPrompt {
    fn prompt(&self, tool: &str) -> PtResult<String> {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "path to `{tool}` executable: ");
        let _ = stderr.flush();
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim();
        if answer.is_empty() {
            return Err(PipelineError::config(format!(
                "no path given for tool {tool}"
            )));
        }
        Ok(answer.to_string())
    }
}

/// Refuses to prompt; used when running non-interactively.
pub struct NoPrompt;

impl PromptSource for NoPrompt {
    fn prompt(&self, tool: &str) -> PtResult<String> {
        Err(PipelineError::config(format!(
            "tool {tool} is not in the tool cache and prompting is disabled"
        )))
    }
}

/// Persisted `tool=path` map. Loads leniently (a missing file is an empty
/// cache); inserts append to the file and never replace an existing entry.
pub struct ToolCache {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl ToolCache {
    pub fn load(path: &Path) -> PtResult<Self> {
        let mut entries = HashMap::new();
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((tool, exe)) = line.split_once('=') {
                    entries
                        .entry(tool.trim().to_string())
                        .or_insert_with(|| exe.trim().to_string());
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn get(&self, tool: &str) -> Option<&str> {
        self.entries.get(tool).map(String::as_str)
    }

    pub fn insert(&mut self, tool: &str, exe: &str) -> PtResult<()> {
        if self.entries.contains_key(tool) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{tool}={exe}")?;
        self.entries.insert(tool.to_string(), exe.to_string());
        Ok(())
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

pub struct ToolAdapter {
    cache: RefCell<ToolCache>,
    prompt: Box<dyn PromptSource>,
}

impl ToolAdapter {
    pub fn new(cache_path: &Path, prompt: Box<dyn PromptSource>) -> PtResult<Self> {
        Ok(Self {
            cache: RefCell::new(ToolCache::load(cache_path)?),
            prompt,
        })
    }

    /// Two-phase resolution: cache, then prompt-and-persist.
    pub fn resolve(&self, tool: &str) -> PtResult<PathBuf> {
        if let Some(exe) = self.cache.borrow().get(tool) {
            return Ok(PathBuf::from(exe));
        }
        let exe = self.prompt.prompt(tool)?;
        self.cache.borrow_mut().insert(tool, &exe)?;
        Ok(PathBuf::from(exe))
    }

    pub fn invoke<I, S>(&self, tool: &str, args: I) -> PtResult<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let exe = self.resolve(tool)?;
        let output = Command::new(&exe).args(args).output().map_err(|e| {
            PipelineError::Tool {
                tool: tool.to_string(),
                status: "spawn failed".to_string(),
                stderr: format!("{}: {e}", exe.display()),
            }
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(PipelineError::Tool {
                tool: tool.to_string(),
                status: output
                    .status
                    .code()
                    .map(|c| format!("exit {c}"))
                    .unwrap_or_else(|| "killed".to_string()),
                stderr: stderr.trim_end().to_string(),
            });
        }
        Ok(ToolOutput { stdout, stderr })
    }

    /// Invoke and verify every declared output exists afterwards.
    pub fn invoke_expecting<I, S>(
        &self,
        tool: &str,
        args: I,
        outputs: &[&Path],
    ) -> PtResult<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let out = self.invoke(tool, args)?;
        for path in outputs {
            if !path.exists() {
                return Err(PipelineError::tool_output(
                    tool,
                    format!("declared output not produced: {}", path.display()),
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{NoPrompt, PromptSource, ToolAdapter, ToolCache};
    use crate::error::{PipelineError, PtResult};
    use std::collections::HashMap;

    struct MapPrompt(HashMap<String, String>);

    impl PromptSource for MapPrompt {
        fn prompt(&self, tool: &str) -> PtResult<String> {
            self.0
                .get(tool)
                .cloned()
                .ok_or_else(|| PipelineError::config(format!("unknown tool {tool}")))
        }
    }

    #[test]
    fn cache_roundtrip_is_additive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tools.cache");
        let mut cache = ToolCache::load(&path).unwrap();
        assert_eq!(cache.get("fstcompile"), None);
        cache.insert("fstcompile", "/opt/fst/fstcompile").unwrap();
        cache.insert("fstcompile", "/elsewhere/fstcompile").unwrap();

        let reloaded = ToolCache::load(&path).unwrap();
        assert_eq!(reloaded.get("fstcompile"), Some("/opt/fst/fstcompile"));
    }

    #[test]
    fn resolve_prompts_once_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tools.cache");
        let mut map = HashMap::new();
        map.insert("score-wer".to_string(), "/usr/bin/true".to_string());
        let adapter = ToolAdapter::new(&path, Box::new(MapPrompt(map))).unwrap();
        assert_eq!(
            adapter.resolve("score-wer").unwrap(),
            std::path::PathBuf::from("/usr/bin/true")
        );

        // A fresh adapter with a refusing prompt still resolves from the cache.
        let adapter = ToolAdapter::new(&path, Box::new(NoPrompt)).unwrap();
        assert!(adapter.resolve("score-wer").is_ok());
        assert!(matches!(
            adapter.resolve("fstcompose"),
            Err(PipelineError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn invoke_captures_stderr_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tools.cache");
        let mut cache = ToolCache::load(&path).unwrap();
        cache.insert("sh", "/bin/sh").unwrap();
        let adapter = ToolAdapter::new(&path, Box::new(NoPrompt)).unwrap();

        let ok = adapter.invoke("sh", ["-c", "echo out"]).unwrap();
        assert_eq!(ok.stdout.trim(), "out");

        match adapter.invoke("sh", ["-c", "echo broken >&2; exit 3"]) {
            Err(PipelineError::Tool { tool, status, stderr }) => {
                assert_eq!(tool, "sh");
                assert_eq!(status, "exit 3");
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected Tool error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn missing_declared_output_is_a_tool_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tools.cache");
        ToolCache::load(&path)
            .unwrap()
            .insert("sh", "/bin/sh")
            .unwrap();
        let adapter = ToolAdapter::new(&path, Box::new(NoPrompt)).unwrap();

        let expected = tmp.path().join("never-written.fst");
        let err = adapter
            .invoke_expecting("sh", ["-c", "true"], &[expected.as_path()])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Tool { .. }));
    }
}
