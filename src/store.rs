//! Artifact store: the persisted-state surface of a run.
//!
//! Every stage output lives at `EXP/<run>/<stage-name>/<lang>/<artifact-name>`
//! (run-scoped artifacts omit the language component). The mapping is
//! deterministic, so a resumed run locates prior outputs without any paths
//! being threaded through stage calls, and two runs that differ only in the
//! run name occupy disjoint subtrees. There is no garbage collection; a
//! re-run overwrites same-named artifacts in place.

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PtResult};

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(exp: &Path, run_name: &str) -> Self {
        Self {
            root: exp.join(sanitize_component(run_name)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, lang: &str, stage: &str, name: &str) -> PathBuf {
        self.root
            .join(sanitize_component(stage))
            .join(sanitize_component(lang))
            .join(sanitize_component(name))
    }

    pub fn run_path(&self, stage: &str, name: &str) -> PathBuf {
        self.root
            .join(sanitize_component(stage))
            .join(sanitize_component(name))
    }

    pub fn write(&self, lang: &str, stage: &str, name: &str, contents: &str) -> PtResult<PathBuf> {
        let path = self.path(lang, stage, name);
        write_at(&path, contents)?;
        Ok(path)
    }

    pub fn write_run(&self, stage: &str, name: &str, contents: &str) -> PtResult<PathBuf> {
        let path = self.run_path(stage, name);
        write_at(&path, contents)?;
        Ok(path)
    }

    pub fn read(&self, lang: &str, stage: &str, name: &str) -> PtResult<String> {
        let path = self.path(lang, stage, name);
        if !path.exists() {
            return Err(PipelineError::ArtifactMissing { path });
        }
        Ok(std::fs::read_to_string(&path)?)
    }

    pub fn exists(&self, lang: &str, stage: &str, name: &str) -> bool {
        self.path(lang, stage, name).exists()
    }

    /// Directory artifact: created on first use, located thereafter.
    pub fn dir(&self, lang: &str, stage: &str, name: &str) -> PtResult<PathBuf> {
        let path = self.path(lang, stage, name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

fn write_at(path: &Path, contents: &str) -> PtResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

fn sanitize_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::ArtifactStore;
    use crate::error::PipelineError;

    #[test]
    fn path_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), "swahili");
        let a = store.path("SW", "build-grammar", "G.txt");
        let b = store.path("SW", "build-grammar", "G.txt");
        assert_eq!(a, b);
        assert!(a.starts_with(tmp.path().join("swahili")));
    }

    #[test]
    fn write_read_exists_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), "swahili");
        assert!(!store.exists("SW", "split-sets", "decode.lst"));
        store.write("SW", "split-sets", "decode.lst", "utt1\nutt2\n").unwrap();
        assert!(store.exists("SW", "split-sets", "decode.lst"));
        assert_eq!(
            store.read("SW", "split-sets", "decode.lst").unwrap(),
            "utt1\nutt2\n"
        );
    }

    #[test]
    fn missing_artifact_is_typed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), "swahili");
        match store.read("SW", "split-sets", "decode.lst") {
            Err(PipelineError::ArtifactMissing { path }) => {
                assert!(path.ends_with("decode.lst"));
            }
            other => panic!("expected ArtifactMissing, got {other:?}"),
        }
    }

    #[test]
    fn run_names_never_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let a = ArtifactStore::new(tmp.path(), "swahili");
        let b = ArtifactStore::new(tmp.path(), "dinka");
        a.write("SW", "build-grammar", "G.txt", "a").unwrap();
        b.write("SW", "build-grammar", "G.txt", "b").unwrap();
        assert_eq!(a.read("SW", "build-grammar", "G.txt").unwrap(), "a");
        assert_eq!(b.read("SW", "build-grammar", "G.txt").unwrap(), "b");
        assert_ne!(
            a.path("SW", "build-grammar", "G.txt"),
            b.path("SW", "build-grammar", "G.txt")
        );
    }
}
