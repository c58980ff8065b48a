//! Scale-factor selection (stage 15).
//!
//! Development mode scans every candidate scale setting, scores each decode
//! against the gold transcriptions, and persists the winner; evaluation mode
//! consumes the persisted winner verbatim and performs one decode+score
//! pass. Running evaluation before any development run is a configuration
//! error, never a silent fallback to defaults.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PtResult};
use crate::pipeline::cascade::CascadeComposer;
use crate::pipeline::config::{Lang, ScaleSetting, TestType};
use crate::pipeline::stage::StageContext;
use crate::pipeline::stages::{names, read_gold};
use crate::score::{parse_score_output, select_best, ScoreRecord};

/// The artifact carried from a development run into evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectedSetting {
    pub setting: ScaleSetting,
    pub score: ScoreRecord,
}

pub fn run_decode_stage(ctx: &StageContext) -> PtResult<()> {
    for lang in ctx.cfg.target_langs() {
        match ctx.cfg.test_type {
            TestType::Dev => scan(ctx, lang)?,
            TestType::Eval => apply(ctx, lang)?,
        }
    }
    Ok(())
}

fn scan(ctx: &StageContext, lang: &Lang) -> PtResult<()> {
    let candidates = ctx.cfg.scale_candidates();
    let mut records = Vec::with_capacity(candidates.len());
    let mut hyps = Vec::with_capacity(candidates.len());
    let mut report = String::new();

    for (i, setting) in candidates.iter().enumerate() {
        ctx.progress.info(format!(
            "decode {lang} [{}/{}] {}",
            i + 1,
            candidates.len(),
            setting
        ));
        let (record, hyp) = decode_and_score(ctx, lang, setting)?;
        ctx.progress
            .info(format!("  {} -> {}", setting, record.summary_line()));
        let _ = writeln!(report, "{}\t{}", setting, record.summary_line());
        records.push(record);
        hyps.push(hyp);
    }

    let best = select_best(&records)
        .ok_or_else(|| PipelineError::config("no scale-factor candidates to try"))?;
    let selected = SelectedSetting {
        setting: candidates[best],
        score: records[best].clone(),
    };
    let _ = writeln!(report, "selected\t{}", selected.setting);

    ctx.store.write(
        lang.as_str(),
        names::DECODE,
        "selected.json",
        &serde_json::to_string_pretty(&selected)?,
    )?;
    ctx.store.write(
        lang.as_str(),
        names::DECODE,
        "score.json",
        &serde_json::to_string_pretty(&records[best])?,
    )?;
    ctx.store
        .write(lang.as_str(), names::DECODE, "hyp.txt", &hyps[best])?;
    ctx.store
        .write(lang.as_str(), names::DECODE, "report.txt", &report)?;
    ctx.progress.info(format!(
        "best setting for {lang}: {}\n{}",
        selected.setting,
        selected.score.summary()
    ));
    Ok(())
}

fn apply(ctx: &StageContext, lang: &Lang) -> PtResult<()> {
    let selected = load_selected(ctx, lang)?;
    ctx.progress.info(format!(
        "evaluate {lang} with selected setting {}",
        selected.setting
    ));
    let (record, hyp) = decode_and_score(ctx, lang, &selected.setting)?;

    ctx.store.write(
        lang.as_str(),
        names::DECODE,
        "score.json",
        &serde_json::to_string_pretty(&record)?,
    )?;
    ctx.store
        .write(lang.as_str(), names::DECODE, "hyp.txt", &hyp)?;
    ctx.store.write(
        lang.as_str(),
        names::DECODE,
        "report.txt",
        &format!("{}\n{}\n", selected.setting, record.summary()),
    )?;
    ctx.progress.info(record.summary());
    Ok(())
}

/// The winner is read from the development language's namespace; its
/// absence means no development run has happened yet.
fn load_selected(ctx: &StageContext, lang: &Lang) -> PtResult<SelectedSetting> {
    let dev_lang = ctx
        .cfg
        .dev_langs
        .first()
        .ok_or_else(|| PipelineError::config("DEV_LANG is empty"))?;
    let raw = ctx
        .store
        .read(dev_lang.as_str(), names::DECODE, "selected.json")
        .map_err(|e| match e {
            PipelineError::ArtifactMissing { .. } => PipelineError::config(format!(
                "evaluation for {lang} requires a development run to have selected \
                 scale factors first (no selected.json for {dev_lang})"
            )),
            other => other,
        })?;
    Ok(serde_json::from_str(&raw)?)
}

fn decode_and_score(
    ctx: &StageContext,
    lang: &Lang,
    setting: &ScaleSetting,
) -> PtResult<(ScoreRecord, String)> {
    let composer = CascadeComposer::new(ctx, lang)?;
    let cascade_dir = composer.build(setting)?;

    let ids: Vec<String> = ctx
        .store
        .read(lang.as_str(), names::SPLIT_SETS, "decode.lst")?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let gold: HashMap<String, Vec<String>> = read_gold(ctx.cfg, lang)?.into_iter().collect();
    let lattices = ctx
        .store
        .path(lang.as_str(), names::UTTERANCES, "lattices");

    let pt_dir = if ctx.cfg.decode_adapt {
        Some(ctx.store.dir(lang.as_str(), names::DECODE, "pt-lattices")?)
    } else {
        None
    };

    let mut hyp = String::new();
    let mut reference = String::new();
    let total = ids.len();
    for (i, id) in ids.iter().enumerate() {
        ctx.progress.progress("decode", i + 1, total);
        let lattice_path = lattices.join(format!("{id}.txt"));
        if !lattice_path.exists() {
            ctx.progress.warn(format!("no lattice for {id}, skipping"));
            continue;
        }
        let Some(gold_phones) = gold.get(id) else {
            ctx.progress
                .warn(format!("no gold transcription for {id}, skipping"));
            continue;
        };
        let lattice_text = std::fs::read_to_string(&lattice_path)?;
        let result = composer.decode_utterance(
            &cascade_dir,
            id,
            &lattice_text,
            ctx.cfg.prunewt,
            pt_dir.is_some(),
        )?;
        let _ = writeln!(hyp, "{id}\t{}", result.phones.join(" "));
        let _ = writeln!(reference, "{id}\t{}", gold_phones.join(" "));
        if let (Some(dir), Some(lattice)) = (&pt_dir, result.lattice) {
            std::fs::write(dir.join(format!("{id}.txt")), lattice)?;
        }
    }

    let hyp_path = cascade_dir.join("hyp.txt");
    let ref_path = cascade_dir.join("ref.txt");
    std::fs::write(&hyp_path, &hyp)?;
    std::fs::write(&ref_path, &reference)?;

    let out = ctx
        .tools
        .invoke("score-wer", [ref_path.as_path(), hyp_path.as_path()])?;
    let record = parse_score_output("score-wer", &out.stdout)?;
    Ok((record, hyp))
}
