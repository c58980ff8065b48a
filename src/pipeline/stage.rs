//! Stage descriptors and the sequential orchestrator.
//!
//! A stage is a pure function of (run configuration, artifact store): its
//! declared inputs must exist when it begins, its declared outputs must
//! exist when it returns, and re-running it with unchanged inputs rewrites
//! the same artifacts. The orchestrator executes the configured inclusive
//! ordinal range in ascending order, never overlaps stages, and halts on
//! the first failure with the stage identified; artifacts already written
//! stay in place so the operator can resume with `startstage`.

use std::path::PathBuf;

use crate::error::{PipelineError, PtResult};
use crate::pipeline::config::RunConfig;
use crate::progress::ConsoleProgress;
use crate::store::ArtifactStore;
use crate::tools::ToolAdapter;

/// Which language set an artifact is produced for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactScope {
    /// One artifact per training language.
    Train,
    /// One artifact per decode-target language of the current mode.
    Target,
    /// A single run-level artifact.
    Run,
}

#[derive(Clone, Copy, Debug)]
pub struct ArtifactRef {
    /// Name of the producing stage.
    pub stage: &'static str,
    pub name: &'static str,
    pub scope: ArtifactScope,
}

pub type StageFn = fn(&StageContext) -> PtResult<()>;

pub struct StageSpec {
    pub ordinal: u32,
    pub name: &'static str,
    pub inputs: Vec<ArtifactRef>,
    pub outputs: Vec<ArtifactRef>,
    pub run: StageFn,
}

pub struct StageContext<'a> {
    pub cfg: &'a RunConfig,
    pub store: &'a ArtifactStore,
    pub tools: &'a ToolAdapter,
    pub progress: &'a ConsoleProgress,
}

pub struct Orchestrator {
    stages: Vec<StageSpec>,
}

impl Orchestrator {
    /// Validates the stage list statically: ordinals strictly ascending,
    /// and every declared input produced by an earlier stage under the
    /// same (stage, artifact, scope) key.
    pub fn new(stages: Vec<StageSpec>) -> PtResult<Self> {
        for pair in stages.windows(2) {
            if pair[1].ordinal <= pair[0].ordinal {
                return Err(PipelineError::config(format!(
                    "stage ordinals out of order: {} after {}",
                    pair[1].ordinal, pair[0].ordinal
                )));
            }
        }
        for (k, stage) in stages.iter().enumerate() {
            for input in &stage.inputs {
                let produced = stages[..k].iter().any(|earlier| {
                    earlier.name == input.stage
                        && earlier
                            .outputs
                            .iter()
                            .any(|out| out.name == input.name && out.scope == input.scope)
                });
                if !produced {
                    return Err(PipelineError::config(format!(
                        "stage {} ({}) declares input {}/{} that no earlier stage produces",
                        stage.ordinal, stage.name, input.stage, input.name
                    )));
                }
            }
        }
        Ok(Self { stages })
    }

    pub fn run(&self, ctx: &StageContext) -> PtResult<()> {
        let total = self.stages.len();
        for stage in &self.stages {
            if stage.ordinal < ctx.cfg.startstage || stage.ordinal > ctx.cfg.endstage {
                continue;
            }
            ctx.progress
                .info(format!("stage {}/{total}: {}", stage.ordinal, stage.name));
            self.run_stage(stage, ctx).map_err(|e| PipelineError::Stage {
                ordinal: stage.ordinal,
                name: stage.name,
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    fn run_stage(&self, stage: &StageSpec, ctx: &StageContext) -> PtResult<()> {
        for path in expand_refs(ctx, &stage.inputs) {
            if !path.exists() {
                return Err(PipelineError::ArtifactMissing { path });
            }
        }
        (stage.run)(ctx)?;
        for path in expand_refs(ctx, &stage.outputs) {
            if !path.exists() {
                return Err(PipelineError::ArtifactMissing { path });
            }
        }
        Ok(())
    }
}

fn expand_refs(ctx: &StageContext, refs: &[ArtifactRef]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for r in refs {
        match r.scope {
            ArtifactScope::Train => {
                for lang in &ctx.cfg.train_langs {
                    out.push(ctx.store.path(lang.as_str(), r.stage, r.name));
                }
            }
            ArtifactScope::Target => {
                for lang in ctx.cfg.target_langs() {
                    out.push(ctx.store.path(lang.as_str(), r.stage, r.name));
                }
            }
            ArtifactScope::Run => out.push(ctx.store.run_path(r.stage, r.name)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{ArtifactRef, ArtifactScope, Orchestrator, StageContext, StageSpec};
    use crate::error::{PipelineError, PtResult};
    use crate::pipeline::config::RunConfig;
    use crate::progress::ConsoleProgress;
    use crate::settings::Settings;
    use crate::store::ArtifactStore;
    use crate::tools::{NoPrompt, ToolAdapter};
    use std::path::Path;

    fn test_cfg(dir: &Path, startstage: u32, endstage: u32) -> RunConfig {
        let text = format!(
            "ALL_LANGS=SW\nTRAIN_LANG=SW\nDEV_LANG=SW\nEVAL_LANG=SW\nTEST_LANG=SW\n\
             LANG_NAME=run\nTESTTYPE=dev\nDATA={}\nEXP={}\n\
             startstage={startstage}\nendstage={endstage}\n",
            dir.display(),
            dir.join("exp").display()
        );
        RunConfig::from_settings(&Settings::parse(Path::new("t.settings"), &text)).unwrap()
    }

    fn first(ctx: &StageContext) -> PtResult<()> {
        ctx.store.write_run("first", "a.txt", "a")?;
        Ok(())
    }

    fn second(ctx: &StageContext) -> PtResult<()> {
        let a = std::fs::read_to_string(ctx.store.run_path("first", "a.txt"))?;
        ctx.store.write_run("second", "b.txt", &format!("{a}b"))?;
        Ok(())
    }

    fn failing(_ctx: &StageContext) -> PtResult<()> {
        Err(PipelineError::config("boom"))
    }

    fn out(stage: &'static str, name: &'static str) -> ArtifactRef {
        ArtifactRef {
            stage,
            name,
            scope: ArtifactScope::Run,
        }
    }

    fn two_stage_list(second_fn: super::StageFn) -> Vec<StageSpec> {
        vec![
            StageSpec {
                ordinal: 1,
                name: "first",
                inputs: vec![],
                outputs: vec![out("first", "a.txt")],
                run: first,
            },
            StageSpec {
                ordinal: 2,
                name: "second",
                inputs: vec![out("first", "a.txt")],
                outputs: vec![out("second", "b.txt")],
                run: second_fn,
            },
        ]
    }

    #[test]
    fn rejects_inputs_nothing_produces() {
        let list = vec![StageSpec {
            ordinal: 1,
            name: "first",
            inputs: vec![out("ghost", "x.txt")],
            outputs: vec![],
            run: first,
        }];
        assert!(matches!(
            Orchestrator::new(list),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn runs_stages_in_range_and_threads_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path(), 1, 15);
        let store = ArtifactStore::new(&cfg.exp, &cfg.lang_name);
        let tools = ToolAdapter::new(&cfg.exp.join("tools.cache"), Box::new(NoPrompt)).unwrap();
        let progress = ConsoleProgress::new(false);
        let ctx = StageContext {
            cfg: &cfg,
            store: &store,
            tools: &tools,
            progress: &progress,
        };

        Orchestrator::new(two_stage_list(second))
            .unwrap()
            .run(&ctx)
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(store.run_path("second", "b.txt")).unwrap(),
            "ab"
        );
    }

    #[test]
    fn resuming_past_a_completed_stage_reuses_its_artifact() {
        let tmp = tempfile::tempdir().unwrap();

        // First invocation runs stage 1 only.
        let cfg = test_cfg(tmp.path(), 1, 1);
        let store = ArtifactStore::new(&cfg.exp, &cfg.lang_name);
        let tools = ToolAdapter::new(&cfg.exp.join("tools.cache"), Box::new(NoPrompt)).unwrap();
        let progress = ConsoleProgress::new(false);
        let ctx = StageContext {
            cfg: &cfg,
            store: &store,
            tools: &tools,
            progress: &progress,
        };
        Orchestrator::new(two_stage_list(second))
            .unwrap()
            .run(&ctx)
            .unwrap();
        assert!(!store.run_path("second", "b.txt").exists());

        // Re-invocation with startstage=2 picks up stage 1's output.
        let cfg = test_cfg(tmp.path(), 2, 2);
        let ctx = StageContext {
            cfg: &cfg,
            store: &store,
            tools: &tools,
            progress: &progress,
        };
        Orchestrator::new(two_stage_list(second))
            .unwrap()
            .run(&ctx)
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(store.run_path("second", "b.txt")).unwrap(),
            "ab"
        );
    }

    #[test]
    fn failure_halts_and_names_the_stage_keeping_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_cfg(tmp.path(), 1, 15);
        let store = ArtifactStore::new(&cfg.exp, &cfg.lang_name);
        let tools = ToolAdapter::new(&cfg.exp.join("tools.cache"), Box::new(NoPrompt)).unwrap();
        let progress = ConsoleProgress::new(false);
        let ctx = StageContext {
            cfg: &cfg,
            store: &store,
            tools: &tools,
            progress: &progress,
        };

        let err = Orchestrator::new(two_stage_list(failing))
            .unwrap()
            .run(&ctx)
            .unwrap_err();
        match err {
            PipelineError::Stage { ordinal, name, .. } => {
                assert_eq!(ordinal, 2);
                assert_eq!(name, "second");
            }
            other => panic!("expected Stage, got {other:?}"),
        }
        // stage 1's artifact survives the failure
        assert!(store.run_path("first", "a.txt").exists());
    }

    #[test]
    fn missing_input_at_stage_entry_is_typed() {
        let tmp = tempfile::tempdir().unwrap();
        // startstage=2 without ever running stage 1
        let cfg = test_cfg(tmp.path(), 2, 2);
        let store = ArtifactStore::new(&cfg.exp, &cfg.lang_name);
        let tools = ToolAdapter::new(&cfg.exp.join("tools.cache"), Box::new(NoPrompt)).unwrap();
        let progress = ConsoleProgress::new(false);
        let ctx = StageContext {
            cfg: &cfg,
            store: &store,
            tools: &tools,
            progress: &progress,
        };

        let err = Orchestrator::new(two_stage_list(second))
            .unwrap()
            .run(&ctx)
            .unwrap_err();
        match err {
            PipelineError::Stage { ordinal, source, .. } => {
                assert_eq!(ordinal, 2);
                assert!(matches!(*source, PipelineError::ArtifactMissing { .. }));
            }
            other => panic!("expected Stage, got {other:?}"),
        }
    }
}
