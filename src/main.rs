use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use pt_pipeline::pipeline::{build_stages, Orchestrator, RunConfig, StageContext};
use pt_pipeline::progress::ConsoleProgress;
use pt_pipeline::settings::Settings;
use pt_pipeline::store::ArtifactStore;
use pt_pipeline::tools::{NoPrompt, PromptSource, StdinPrompt, ToolAdapter};

#[derive(Parser, Debug)]
#[command(name = "pt-pipeline")]
#[command(about = "Probabilistic-transcription pipeline over a settings file", long_about = None)]
struct Args {
    /// Settings file (flat key=value)
    #[arg(value_name = "SETTINGS")]
    settings: PathBuf,

    /// Override the settings file's startstage
    #[arg(long)]
    startstage: Option<u32>,

    /// Override the settings file's endstage
    #[arg(long)]
    endstage: Option<u32>,

    /// Never prompt for missing tool paths (fail instead)
    #[arg(long)]
    no_prompt: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = Settings::load(&args.settings)?;
    let cfg = RunConfig::from_settings(&settings)
        .and_then(|cfg| cfg.with_stage_range(args.startstage, args.endstage))
        .with_context(|| format!("resolve {}", args.settings.display()))?;

    let progress = ConsoleProgress::new(cfg.debug);
    for warning in cfg.warnings() {
        progress.warn(warning);
    }

    let store = ArtifactStore::new(&cfg.exp, &cfg.lang_name);
    let prompt: Box<dyn PromptSource> = if args.no_prompt {
        Box::new(NoPrompt)
    } else {
        Box::new(StdinPrompt)
    };
    let tools = ToolAdapter::new(&cfg.exp.join("tools.cache"), prompt)?;

    let orchestrator = Orchestrator::new(build_stages())?;
    let ctx = StageContext {
        cfg: &cfg,
        store: &store,
        tools: &tools,
        progress: &progress,
    };
    orchestrator.run(&ctx)?;
    progress.info("done");
    Ok(())
}
