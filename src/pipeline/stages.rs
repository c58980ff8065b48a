//! The 15 pipeline stages.
//!
//! Each stage reads earlier artifacts (or configured data files), writes its
//! declared outputs through the artifact store, and nothing else. Stage
//! bodies are deterministic given identical inputs, which is what makes an
//! interrupted run resumable by ordinal.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PtResult};
use crate::fstext;
use crate::pipeline::config::{Lang, RunConfig, TestType};
use crate::pipeline::selector;
use crate::pipeline::stage::{ArtifactRef, ArtifactScope, StageContext, StageSpec};

pub mod names {
    pub const FETCH_DATA: &str = "fetch-data";
    pub const NORMALIZE: &str = "normalize-transcripts";
    pub const SPLIT_SETS: &str = "split-sets";
    pub const MERGE: &str = "merge-transcribers";
    pub const INIT_CHANNEL: &str = "init-channel";
    pub const TRAIN_CHANNEL: &str = "train-channel";
    pub const SELECT_RESTART: &str = "select-restart";
    pub const MERGE_CHANNEL: &str = "merge-channel";
    pub const CHANNEL_FST: &str = "build-channel-fst";
    pub const GRAMMAR: &str = "build-grammar";
    pub const LETTER_LM: &str = "build-letter-lm";
    pub const NOISE: &str = "build-noise";
    pub const UTTERANCES: &str = "prepare-utterances";
    pub const MISMATCH: &str = "build-mismatch";
    pub const DECODE: &str = "decode-score";
}

use names::*;

pub fn build_stages() -> Vec<StageSpec> {
    let train = |stage, name| ArtifactRef {
        stage,
        name,
        scope: ArtifactScope::Train,
    };
    let target = |stage, name| ArtifactRef {
        stage,
        name,
        scope: ArtifactScope::Target,
    };
    let run = |stage, name| ArtifactRef {
        stage,
        name,
        scope: ArtifactScope::Run,
    };

    vec![
        StageSpec {
            ordinal: 1,
            name: FETCH_DATA,
            inputs: vec![],
            outputs: vec![run(FETCH_DATA, "data.ok")],
            run: stage_fetch_data,
        },
        StageSpec {
            ordinal: 2,
            name: NORMALIZE,
            inputs: vec![run(FETCH_DATA, "data.ok")],
            outputs: vec![
                train(NORMALIZE, "transcripts.txt"),
                target(NORMALIZE, "transcripts.txt"),
            ],
            run: stage_normalize,
        },
        StageSpec {
            ordinal: 3,
            name: SPLIT_SETS,
            inputs: vec![run(FETCH_DATA, "data.ok")],
            outputs: vec![train(SPLIT_SETS, "train.lst"), target(SPLIT_SETS, "decode.lst")],
            run: stage_split_sets,
        },
        StageSpec {
            ordinal: 4,
            name: MERGE,
            inputs: vec![
                train(NORMALIZE, "transcripts.txt"),
                target(NORMALIZE, "transcripts.txt"),
            ],
            outputs: vec![train(MERGE, "merged.txt"), target(MERGE, "merged.txt")],
            run: stage_merge_transcribers,
        },
        StageSpec {
            ordinal: 5,
            name: INIT_CHANNEL,
            inputs: vec![run(FETCH_DATA, "data.ok")],
            outputs: vec![train(INIT_CHANNEL, "channel.init")],
            run: stage_init_channel,
        },
        StageSpec {
            ordinal: 6,
            name: TRAIN_CHANNEL,
            inputs: vec![train(MERGE, "merged.txt"), train(INIT_CHANNEL, "channel.init")],
            outputs: vec![train(TRAIN_CHANNEL, "pairs.txt"), train(TRAIN_CHANNEL, "restarts")],
            run: stage_train_channel,
        },
        StageSpec {
            ordinal: 7,
            name: SELECT_RESTART,
            inputs: vec![train(TRAIN_CHANNEL, "restarts")],
            outputs: vec![train(SELECT_RESTART, "channel.model")],
            run: stage_select_restart,
        },
        StageSpec {
            ordinal: 8,
            name: MERGE_CHANNEL,
            inputs: vec![train(SELECT_RESTART, "channel.model")],
            outputs: vec![target(MERGE_CHANNEL, "channel.model")],
            run: stage_merge_channel,
        },
        StageSpec {
            ordinal: 9,
            name: CHANNEL_FST,
            inputs: vec![target(MERGE_CHANNEL, "channel.model")],
            outputs: vec![
                target(CHANNEL_FST, "P.txt"),
                target(CHANNEL_FST, "letters.syms"),
                target(CHANNEL_FST, "phones.syms"),
            ],
            run: stage_channel_fst,
        },
        StageSpec {
            ordinal: 10,
            name: GRAMMAR,
            inputs: vec![run(FETCH_DATA, "data.ok")],
            outputs: vec![target(GRAMMAR, "G.txt")],
            run: stage_grammar,
        },
        StageSpec {
            ordinal: 11,
            name: LETTER_LM,
            inputs: vec![target(MERGE, "merged.txt")],
            outputs: vec![target(LETTER_LM, "L.txt")],
            run: stage_letter_lm,
        },
        StageSpec {
            ordinal: 12,
            name: NOISE,
            inputs: vec![run(FETCH_DATA, "data.ok")],
            outputs: vec![target(NOISE, "noise")],
            run: stage_noise,
        },
        StageSpec {
            ordinal: 13,
            name: UTTERANCES,
            inputs: vec![target(MERGE, "merged.txt"), target(SPLIT_SETS, "decode.lst")],
            outputs: vec![target(UTTERANCES, "lattices")],
            run: stage_utterances,
        },
        StageSpec {
            ordinal: 14,
            name: MISMATCH,
            inputs: vec![run(FETCH_DATA, "data.ok")],
            outputs: vec![target(MISMATCH, "M.txt")],
            run: stage_mismatch,
        },
        StageSpec {
            ordinal: 15,
            name: DECODE,
            inputs: vec![
                target(CHANNEL_FST, "P.txt"),
                target(CHANNEL_FST, "letters.syms"),
                target(CHANNEL_FST, "phones.syms"),
                target(GRAMMAR, "G.txt"),
                target(LETTER_LM, "L.txt"),
                target(NOISE, "noise"),
                target(MISMATCH, "M.txt"),
                target(UTTERANCES, "lattices"),
                target(SPLIT_SETS, "decode.lst"),
            ],
            outputs: vec![target(DECODE, "score.json")],
            run: stage_decode,
        },
    ]
}

// ---- stage bodies ----

fn stage_fetch_data(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    if !cfg.data.is_dir() {
        let url = cfg.data_url.as_deref().ok_or_else(|| {
            PipelineError::config(format!(
                "data root {} does not exist and DATA_URL is unset",
                cfg.data.display()
            ))
        })?;
        let archive = ctx.store.run_path(FETCH_DATA, "data.tar.gz");
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)?;
        }
        ctx.progress.info(format!("fetch {url}"));
        ctx.tools.invoke_expecting(
            "fetch",
            [url.to_string(), archive.display().to_string()],
            &[&archive],
        )?;
        if let Some(expected) = &cfg.data_sha256 {
            verify_sha256(&archive, expected)?;
        }
        let unpack_root = cfg.data.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(unpack_root)?;
        ctx.tools.invoke(
            "tar",
            [
                "-xzf".to_string(),
                archive.display().to_string(),
                "-C".to_string(),
                unpack_root.display().to_string(),
            ],
        )?;
        if !cfg.data.is_dir() {
            return Err(PipelineError::tool_output(
                "tar",
                format!("data root {} still missing after unpack", cfg.data.display()),
            ));
        }
    }
    ctx.store
        .write_run(FETCH_DATA, "data.ok", &format!("{}\n", cfg.data.display()))?;
    Ok(())
}

fn stage_normalize(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    let lexicon = match &cfg.lexicon {
        Some(path) => Some(load_word_set(path)?),
        None => None,
    };
    for lang in cfg.active_langs() {
        let lines = read_crowd_lines(cfg, &lang)?;
        let mut kept: Vec<(String, String, String)> = Vec::new();
        let mut dropped = 0usize;
        for (uttid, transcriber, text) in lines {
            if let Some(words) = &lexicon {
                if !any_word_known(&text, words) {
                    dropped += 1;
                    continue;
                }
            }
            let tokens = normalize_letters(&text, &cfg.delim_sym);
            if tokens.is_empty() {
                dropped += 1;
                continue;
            }
            kept.push((uttid, transcriber, tokens.join(" ")));
        }
        kept.sort();
        if dropped > 0 {
            ctx.progress
                .debug(format!("{lang}: dropped {dropped} crowd lines"));
        }
        let mut out = String::new();
        for (uttid, transcriber, tokens) in &kept {
            let _ = writeln!(out, "{uttid}\t{transcriber}\t{tokens}");
        }
        ctx.store
            .write(lang.as_str(), NORMALIZE, "transcripts.txt", &out)?;
        ctx.progress
            .info(format!("{lang}: {} crowd lines", kept.len()));
    }
    Ok(())
}

fn stage_split_sets(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    for lang in &cfg.train_langs {
        let mut out = String::new();
        for (uttid, _) in read_gold(cfg, lang)? {
            let _ = writeln!(out, "{uttid}");
        }
        ctx.store.write(lang.as_str(), SPLIT_SETS, "train.lst", &out)?;
    }
    let list_name = match cfg.test_type {
        TestType::Dev => "dev.txt",
        TestType::Eval => "eval.txt",
    };
    for lang in cfg.target_langs() {
        let path = cfg.data.join(lang.as_str()).join("lists").join(list_name);
        if !path.is_file() {
            return Err(PipelineError::config(format!(
                "utterance list {} does not exist",
                path.display()
            )));
        }
        let ids: Vec<String> = std::fs::read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Err(PipelineError::config(format!(
                "utterance list {} is empty",
                path.display()
            )));
        }
        ctx.store.write(
            lang.as_str(),
            SPLIT_SETS,
            "decode.lst",
            &format!("{}\n", ids.join("\n")),
        )?;
    }
    Ok(())
}

fn stage_merge_transcribers(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    for lang in cfg.active_langs() {
        let transcripts = ctx
            .store
            .read(lang.as_str(), NORMALIZE, "transcripts.txt")?;
        let mut by_utt: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in transcripts.lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(uttid), Some(_transcriber), Some(tokens)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            by_utt
                .entry(uttid.to_string())
                .or_default()
                .push(tokens.to_string());
        }
        let mut out = String::new();
        for (uttid, seqs) in &by_utt {
            for seq in top_alternatives(seqs, cfg.top_n) {
                let _ = writeln!(out, "{uttid}\t{seq}");
            }
        }
        ctx.store.write(lang.as_str(), MERGE, "merged.txt", &out)?;
    }
    Ok(())
}

fn stage_init_channel(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    let letters = letters_with_delim(cfg)?;
    for lang in &cfg.train_langs {
        let phones = read_phone_inventory(cfg, lang)?;
        let events =
            (phones.len() + 1) * (letters.len() + 1) - 1;
        let prob = 1.0 / events as f64;
        let mut out = String::new();
        let mut phone_rows: Vec<&str> = phones.iter().map(String::as_str).collect();
        phone_rows.push(cfg.gap_sym.as_str());
        let mut letter_cols: Vec<&str> = letters.iter().map(String::as_str).collect();
        letter_cols.push(cfg.gap_sym.as_str());
        for phone in &phone_rows {
            for letter in &letter_cols {
                if *phone == cfg.gap_sym && *letter == cfg.gap_sym {
                    continue;
                }
                let _ = writeln!(out, "{phone}\t{letter}\t{prob:.8}");
            }
        }
        ctx.store
            .write(lang.as_str(), INIT_CHANNEL, "channel.init", &out)?;
    }
    Ok(())
}

fn stage_train_channel(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    for lang in &cfg.train_langs {
        let merged = ctx.store.read(lang.as_str(), MERGE, "merged.txt")?;
        let gold: HashMap<String, Vec<String>> = read_gold(cfg, lang)?.into_iter().collect();

        let mut pairs = String::new();
        for line in merged.lines() {
            let Some((uttid, letters)) = line.split_once('\t') else {
                continue;
            };
            if let Some(phones) = gold.get(uttid) {
                let _ = writeln!(pairs, "{}\t{letters}", phones.join(" "));
            }
        }
        let pairs_path = ctx
            .store
            .write(lang.as_str(), TRAIN_CHANNEL, "pairs.txt", &pairs)?;

        let init_path = ctx.store.path(lang.as_str(), INIT_CHANNEL, "channel.init");
        let restarts = ctx.store.dir(lang.as_str(), TRAIN_CHANNEL, "restarts")?;
        for r in 0..cfg.num_restarts {
            let model = restarts.join(format!("restart-{r}.model"));
            let out = ctx.tools.invoke_expecting(
                "align-trainer",
                [
                    "--init".to_string(),
                    init_path.display().to_string(),
                    "--pairs".to_string(),
                    pairs_path.display().to_string(),
                    "--seed".to_string(),
                    r.to_string(),
                    "--out".to_string(),
                    model.display().to_string(),
                ],
                &[&model],
            )?;
            std::fs::write(
                restarts.join(format!("restart-{r}.log")),
                format!("{}{}", out.stdout, out.stderr),
            )?;
            ctx.progress.progress(
                &format!("train-channel {lang}"),
                (r + 1) as usize,
                cfg.num_restarts as usize,
            );
        }
    }
    Ok(())
}

fn stage_select_restart(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    for lang in &cfg.train_langs {
        let restarts = ctx.store.path(lang.as_str(), TRAIN_CHANNEL, "restarts");
        let mut best: Option<(f64, u32)> = None;
        for r in 0..cfg.num_restarts {
            let log_path = restarts.join(format!("restart-{r}.log"));
            let log = read_artifact_file(&log_path)?;
            let ll = parse_loglik(&log).ok_or_else(|| {
                PipelineError::tool_output(
                    "align-trainer",
                    format!("no log-likelihood in {}", log_path.display()),
                )
            })?;
            if best.map(|(b, _)| ll > b).unwrap_or(true) {
                best = Some((ll, r));
            }
        }
        let (ll, r) = best.expect("at least one restart");
        let model = read_artifact_file(&restarts.join(format!("restart-{r}.model")))?;
        ctx.store
            .write(lang.as_str(), SELECT_RESTART, "channel.model", &model)?;
        ctx.progress.info(format!(
            "{lang}: selected restart {r} (log-likelihood {ll})"
        ));
    }
    Ok(())
}

fn stage_merge_channel(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    let mut models = Vec::new();
    for lang in &cfg.train_langs {
        models.push(ctx.store.read(lang.as_str(), SELECT_RESTART, "channel.model")?);
    }
    let merged = fstext::merge_channel_models(&models)?;
    for lang in cfg.target_langs() {
        ctx.store
            .write(lang.as_str(), MERGE_CHANNEL, "channel.model", &merged)?;
    }
    Ok(())
}

fn stage_channel_fst(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    let letters = letters_with_delim(cfg)?;
    let phones = train_phone_union(cfg)?;
    for lang in cfg.target_langs() {
        let model = ctx
            .store
            .read(lang.as_str(), MERGE_CHANNEL, "channel.model")?;
        let fst = fstext::channel_to_fst(&model, &cfg.gap_sym)?;
        ctx.store.write(lang.as_str(), CHANNEL_FST, "P.txt", &fst)?;
        ctx.store.write(
            lang.as_str(),
            CHANNEL_FST,
            "letters.syms",
            &fstext::write_symtab(&letters),
        )?;
        ctx.store.write(
            lang.as_str(),
            CHANNEL_FST,
            "phones.syms",
            &fstext::write_symtab(&phones),
        )?;
    }
    Ok(())
}

fn stage_grammar(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    for lang in cfg.target_langs() {
        if cfg.make_tplm {
            let mut corpus = String::new();
            for train in &cfg.train_langs {
                for (_, phones) in read_gold(cfg, train)? {
                    let _ = writeln!(corpus, "{}", phones.join(" "));
                }
            }
            let corpus_path = ctx
                .store
                .write(lang.as_str(), GRAMMAR, "corpus.txt", &corpus)?;
            let g_path = ctx.store.path(lang.as_str(), GRAMMAR, "G.txt");
            ctx.tools.invoke_expecting(
                "lm-train",
                [
                    "--order".to_string(),
                    "2".to_string(),
                    "--text".to_string(),
                    corpus_path.display().to_string(),
                    "--out".to_string(),
                    g_path.display().to_string(),
                ],
                &[&g_path],
            )?;
        } else if let Some(phonelm) = &cfg.phonelm {
            let text = read_config_file(phonelm)?;
            ctx.store.write(lang.as_str(), GRAMMAR, "G.txt", &text)?;
        } else {
            // untrained fallback: decode still works with only this variant
            let phones = train_phone_union(cfg)?;
            ctx.store.write(
                lang.as_str(),
                GRAMMAR,
                "G.txt",
                &fstext::build_unigram_grammar(&phones),
            )?;
        }
    }
    Ok(())
}

fn stage_letter_lm(ctx: &StageContext) -> PtResult<()> {
    for lang in ctx.cfg.target_langs() {
        let merged = ctx.store.read(lang.as_str(), MERGE, "merged.txt")?;
        let seqs: Vec<Vec<String>> = merged
            .lines()
            .filter_map(|l| l.split_once('\t'))
            .map(|(_, toks)| toks.split_whitespace().map(str::to_string).collect())
            .collect();
        ctx.store.write(
            lang.as_str(),
            LETTER_LM,
            "L.txt",
            &fstext::build_bigram_acceptor(&seqs),
        )?;
    }
    Ok(())
}

fn stage_noise(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    let letters = letters_with_delim(cfg)?;
    let mut pairs: BTreeSet<(u32, u32)> = BTreeSet::new();
    for &i in &cfg.tnumins {
        for &d in &cfg.tnumdel {
            pairs.insert((i, d));
        }
    }
    for lang in cfg.target_langs() {
        let dir = ctx.store.dir(lang.as_str(), NOISE, "noise")?;
        for &(i, d) in &pairs {
            std::fs::write(
                dir.join(format!("T-{i}-{d}.txt")),
                fstext::build_insdel(&letters, i, d, 1.0),
            )?;
        }
    }
    Ok(())
}

fn stage_utterances(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    for lang in cfg.target_langs() {
        let merged = ctx.store.read(lang.as_str(), MERGE, "merged.txt")?;
        let mut by_utt: BTreeMap<&str, Vec<Vec<String>>> = BTreeMap::new();
        for line in merged.lines() {
            let Some((uttid, toks)) = line.split_once('\t') else {
                continue;
            };
            by_utt
                .entry(uttid)
                .or_default()
                .push(toks.split_whitespace().map(str::to_string).collect());
        }
        let ids = ctx.store.read(lang.as_str(), SPLIT_SETS, "decode.lst")?;
        let dir = ctx.store.dir(lang.as_str(), UTTERANCES, "lattices")?;
        let mut built = 0usize;
        for id in ids.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some(alternatives) = by_utt.get(id) else {
                ctx.progress
                    .warn(format!("{lang}: no crowd transcription for {id}"));
                continue;
            };
            std::fs::write(
                dir.join(format!("{id}.txt")),
                fstext::build_lattice(alternatives),
            )?;
            built += 1;
        }
        ctx.progress
            .info(format!("{lang}: {built} utterance lattices"));
    }
    Ok(())
}

fn stage_mismatch(ctx: &StageContext) -> PtResult<()> {
    let cfg = ctx.cfg;
    let letters = letters_with_delim(cfg)?;
    for lang in cfg.target_langs() {
        ctx.store.write(
            lang.as_str(),
            MISMATCH,
            "M.txt",
            &fstext::build_mismatch(&letters, cfg.switch_penalty),
        )?;
    }
    Ok(())
}

fn stage_decode(ctx: &StageContext) -> PtResult<()> {
    selector::run_decode_stage(ctx)
}

// ---- shared data access ----

static LOGLIK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)log-?likelihood[ :=]+(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)")
        .expect("loglik regex")
});

/// Final reported log-likelihood in a trainer log (the last one printed).
pub(crate) fn parse_loglik(log: &str) -> Option<f64> {
    LOGLIK_RE
        .captures_iter(log)
        .last()
        .and_then(|c| c[1].parse().ok())
}

/// Gold phone transcriptions: `uttid<TAB>phone phone ...` per line.
pub(crate) fn read_gold(cfg: &RunConfig, lang: &Lang) -> PtResult<Vec<(String, Vec<String>)>> {
    let path = cfg.data.join(lang.as_str()).join("gold.txt");
    let text = read_config_file(&path)?;
    let mut out = Vec::new();
    for line in text.lines() {
        let Some((uttid, phones)) = line.split_once('\t') else {
            continue;
        };
        let phones: Vec<String> = phones.split_whitespace().map(str::to_string).collect();
        if !phones.is_empty() {
            out.push((uttid.trim().to_string(), phones));
        }
    }
    Ok(out)
}

fn read_phone_inventory(cfg: &RunConfig, lang: &Lang) -> PtResult<Vec<String>> {
    let path = cfg.data.join(lang.as_str()).join("phones.txt");
    let text = read_config_file(&path)?;
    let phones: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();
    if phones.is_empty() {
        return Err(PipelineError::config(format!(
            "phone inventory {} is empty",
            path.display()
        )));
    }
    Ok(phones)
}

fn train_phone_union(cfg: &RunConfig) -> PtResult<Vec<String>> {
    let mut union: BTreeSet<String> = BTreeSet::new();
    for lang in &cfg.train_langs {
        union.extend(read_phone_inventory(cfg, lang)?);
    }
    Ok(union.into_iter().collect())
}

/// The transcriber alphabet plus the word-delimiter symbol: the letter-side
/// label set of every model in the cascade.
fn letters_with_delim(cfg: &RunConfig) -> PtResult<Vec<String>> {
    let text = read_config_file(&cfg.alphabet)?;
    let mut letters: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();
    if letters.is_empty() {
        return Err(PipelineError::config(format!(
            "alphabet {} is empty",
            cfg.alphabet.display()
        )));
    }
    if !letters.contains(&cfg.delim_sym) {
        letters.push(cfg.delim_sym.clone());
    }
    Ok(letters)
}

fn read_crowd_lines(cfg: &RunConfig, lang: &Lang) -> PtResult<Vec<(String, String, String)>> {
    let dir = cfg.data.join(lang.as_str()).join(&cfg.transdir);
    if !dir.is_dir() {
        return Err(PipelineError::config(format!(
            "transcription directory {} does not exist",
            dir.display()
        )));
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "txt").unwrap_or(false))
        .collect();
    files.sort();
    let mut out = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file)?;
        for line in text.lines() {
            let mut fields = line.splitn(3, '\t');
            let (Some(uttid), Some(transcriber), Some(body)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            out.push((
                uttid.trim().to_string(),
                transcriber.trim().to_string(),
                body.trim().to_string(),
            ));
        }
    }
    Ok(out)
}

/// Lowercase, strip non-letter characters, split into single-letter tokens,
/// and mark word boundaries with the delimiter symbol.
pub(crate) fn normalize_letters(text: &str, delim: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split_whitespace() {
        let letters: Vec<String> = word
            .chars()
            .flat_map(char::to_lowercase)
            .filter(|c| c.is_alphabetic() || *c == '\'')
            .map(String::from)
            .collect();
        if letters.is_empty() {
            continue;
        }
        if !tokens.is_empty() {
            tokens.push(delim.to_string());
        }
        tokens.extend(letters);
    }
    tokens
}

/// Distinct alternatives ranked by frequency, then first appearance.
pub(crate) fn top_alternatives(seqs: &[String], top_n: usize) -> Vec<String> {
    let mut stats: Vec<(String, usize, usize)> = Vec::new();
    for (idx, seq) in seqs.iter().enumerate() {
        match stats.iter_mut().find(|(s, _, _)| s == seq) {
            Some((_, count, _)) => *count += 1,
            None => stats.push((seq.clone(), 1, idx)),
        }
    }
    stats.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    stats.into_iter().take(top_n).map(|(s, _, _)| s).collect()
}

fn any_word_known(text: &str, words: &HashSet<String>) -> bool {
    text.split_whitespace().any(|w| {
        let w: String = w
            .chars()
            .flat_map(char::to_lowercase)
            .filter(|c| c.is_alphabetic() || *c == '\'')
            .collect();
        !w.is_empty() && words.contains(&w)
    })
}

fn load_word_set(path: &Path) -> PtResult<HashSet<String>> {
    let text = read_config_file(path)?;
    Ok(text
        .lines()
        .map(|l| l.split_whitespace().next().unwrap_or("").to_lowercase())
        .filter(|w| !w.is_empty())
        .collect())
}

/// A file named by the configuration; absence is a configuration problem.
fn read_config_file(path: &Path) -> PtResult<String> {
    if !path.is_file() {
        return Err(PipelineError::config(format!(
            "required data file {} does not exist",
            path.display()
        )));
    }
    Ok(std::fs::read_to_string(path)?)
}

/// A file inside an earlier stage's directory artifact.
fn read_artifact_file(path: &Path) -> PtResult<String> {
    if !path.is_file() {
        return Err(PipelineError::ArtifactMissing {
            path: path.to_path_buf(),
        });
    }
    Ok(std::fs::read_to_string(path)?)
}

fn verify_sha256(path: &Path, expected: &str) -> PtResult<()> {
    let bytes = std::fs::read(path)?;
    let digest = hex::encode(Sha256::digest(&bytes));
    if !digest.eq_ignore_ascii_case(expected.trim()) {
        return Err(PipelineError::tool_output(
            "fetch",
            format!(
                "checksum mismatch for {}: got {digest}, expected {expected}",
                path.display()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::Orchestrator;
    use crate::progress::ConsoleProgress;
    use crate::settings::Settings;
    use crate::store::ArtifactStore;
    use crate::tools::{NoPrompt, ToolAdapter};

    #[test]
    fn stage_list_passes_static_validation() {
        assert!(Orchestrator::new(build_stages()).is_ok());
    }

    #[test]
    fn normalization_folds_case_strips_marks_and_delimits_words() {
        let toks = normalize_letters("Habari, Yako!", "#");
        assert_eq!(
            toks,
            vec!["h", "a", "b", "a", "r", "i", "#", "y", "a", "k", "o"]
        );
        assert!(normalize_letters("12 34 --", "#").is_empty());
    }

    #[test]
    fn top_alternatives_rank_by_frequency_then_first_seen() {
        let seqs: Vec<String> = ["a b", "c d", "a b", "e f", "c d", "a b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let top = top_alternatives(&seqs, 2);
        assert_eq!(top, vec!["a b", "c d"]);
        // ties keep input order
        let seqs: Vec<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        assert_eq!(top_alternatives(&seqs, 5), vec!["x", "y"]);
    }

    #[test]
    fn loglik_takes_the_last_report() {
        let log = "iter 1 log-likelihood: -1234.5\niter 2 log-likelihood: -1100.25\n";
        assert_eq!(parse_loglik(log), Some(-1100.25));
        assert_eq!(parse_loglik("no numbers here"), None);
    }

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    struct Fixture {
        cfg: RunConfig,
        store: ArtifactStore,
        tools: ToolAdapter,
        progress: ConsoleProgress,
    }

    impl Fixture {
        fn new(tmp: &Path) -> Self {
            let data = tmp.join("data");
            // two training languages, one target
            for lang in ["AR", "CA"] {
                write(
                    &data.join(lang).join("gold.txt"),
                    "utt1\tp a\nutt2\tb p\n",
                );
                write(&data.join(lang).join("phones.txt"), "p\na\nb\n");
                write(
                    &data.join(lang).join("transcripts").join("batch1.txt"),
                    "utt1\tt1\tPa!\nutt1\tt2\tpa\nutt2\tt1\tba\n",
                );
            }
            write(
                &data.join("SW").join("transcripts").join("batch1.txt"),
                "swa1\tt1\tpab\nswa1\tt2\tpab\nswa1\tt3\tpb\nswa2\tt1\tab\n",
            );
            write(&data.join("SW").join("gold.txt"), "swa1\tp a b\nswa2\ta b\n");
            write(&data.join("SW").join("lists").join("dev.txt"), "swa1\nswa2\n");
            write(&data.join("alphabet.txt"), "p\na\nb\n");

            let text = format!(
                "ALL_LANGS=(AR CA SW)\nTRAIN_LANG=(AR CA)\nDEV_LANG=SW\nEVAL_LANG=SW\n\
                 TEST_LANG=SW\nLANG_NAME=swahili\nTESTTYPE=dev\nDATA={}\nEXP={}\nTOPN=2\n",
                data.display(),
                tmp.join("exp").display()
            );
            let cfg =
                RunConfig::from_settings(&Settings::parse(Path::new("t.settings"), &text))
                    .unwrap();
            let store = ArtifactStore::new(&cfg.exp, &cfg.lang_name);
            let tools =
                ToolAdapter::new(&cfg.exp.join("tools.cache"), Box::new(NoPrompt)).unwrap();
            Self {
                cfg,
                store,
                tools,
                progress: ConsoleProgress::new(false),
            }
        }

        fn ctx(&self) -> StageContext<'_> {
            StageContext {
                cfg: &self.cfg,
                store: &self.store,
                tools: &self.tools,
                progress: &self.progress,
            }
        }
    }

    #[test]
    fn data_preparation_stages_produce_expected_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let fx = Fixture::new(tmp.path());
        let ctx = fx.ctx();

        stage_fetch_data(&ctx).unwrap();
        stage_normalize(&ctx).unwrap();
        stage_split_sets(&ctx).unwrap();
        stage_merge_transcribers(&ctx).unwrap();

        let transcripts = fx.store.read("AR", NORMALIZE, "transcripts.txt").unwrap();
        // "Pa!" normalizes to the same letters as "pa"
        assert!(transcripts.contains("utt1\tt1\tp a"));
        assert!(transcripts.contains("utt1\tt2\tp a"));

        let decode = fx.store.read("SW", SPLIT_SETS, "decode.lst").unwrap();
        assert_eq!(decode, "swa1\nswa2\n");

        // TOPN=2 keeps the two distinct swa1 alternatives, majority first
        let merged = fx.store.read("SW", MERGE, "merged.txt").unwrap();
        let swa1: Vec<&str> = merged.lines().filter(|l| l.starts_with("swa1")).collect();
        assert_eq!(swa1, vec!["swa1\tp a b", "swa1\tp b"]);
    }

    #[test]
    fn channel_init_is_uniform_over_events_including_gaps() {
        let tmp = tempfile::tempdir().unwrap();
        let fx = Fixture::new(tmp.path());
        let ctx = fx.ctx();
        stage_fetch_data(&ctx).unwrap();
        stage_init_channel(&ctx).unwrap();

        let init = fx.store.read("AR", INIT_CHANNEL, "channel.init").unwrap();
        // 3 phones + gap, 4 letters (alphabet + delimiter) + gap, minus gap/gap
        let lines: Vec<&str> = init.lines().collect();
        assert_eq!(lines.len(), 4 * 5 - 1);
        assert!(init.contains(&format!("p\t-\t{:.8}", 1.0 / 19.0)));
    }

    #[test]
    fn grammar_falls_back_to_untrained_unigram() {
        let tmp = tempfile::tempdir().unwrap();
        let fx = Fixture::new(tmp.path());
        let ctx = fx.ctx();
        stage_fetch_data(&ctx).unwrap();
        stage_grammar(&ctx).unwrap();

        let g = fx.store.read("SW", GRAMMAR, "G.txt").unwrap();
        // uniform over the 3-phone training union
        assert_eq!(g.matches(&format!("{:.6}", 3f64.ln())).count(), 3);
    }

    #[test]
    fn model_building_stages_cover_the_grid_and_decode_list() {
        let tmp = tempfile::tempdir().unwrap();
        let fx = Fixture::new(tmp.path());
        let ctx = fx.ctx();
        stage_fetch_data(&ctx).unwrap();
        stage_normalize(&ctx).unwrap();
        stage_split_sets(&ctx).unwrap();
        stage_merge_transcribers(&ctx).unwrap();
        stage_letter_lm(&ctx).unwrap();
        stage_noise(&ctx).unwrap();
        stage_utterances(&ctx).unwrap();
        stage_mismatch(&ctx).unwrap();

        assert!(fx.store.exists("SW", LETTER_LM, "L.txt"));
        assert!(fx
            .store
            .path("SW", NOISE, "noise")
            .join("T-2-2.txt")
            .is_file());
        assert!(fx
            .store
            .path("SW", UTTERANCES, "lattices")
            .join("swa1.txt")
            .is_file());
        assert!(fx.store.exists("SW", MISMATCH, "M.txt"));
    }

    #[test]
    fn selected_channel_model_feeds_the_target_fst() {
        let tmp = tempfile::tempdir().unwrap();
        let fx = Fixture::new(tmp.path());
        let ctx = fx.ctx();
        stage_fetch_data(&ctx).unwrap();

        // restart logs and models as the trainer would have left them
        for lang in ["AR", "CA"] {
            let dir = fx.store.dir(lang, TRAIN_CHANNEL, "restarts").unwrap();
            std::fs::write(dir.join("restart-0.model"), "p\ta\t0.5\n").unwrap();
            std::fs::write(dir.join("restart-0.log"), "log-likelihood: -10.0\n").unwrap();
        }
        stage_select_restart(&ctx).unwrap();
        stage_merge_channel(&ctx).unwrap();
        stage_channel_fst(&ctx).unwrap();

        let p = fx.store.read("SW", CHANNEL_FST, "P.txt").unwrap();
        assert!(p.contains("0\t0\ta\tp\t"));
        let syms = fx.store.read("SW", CHANNEL_FST, "letters.syms").unwrap();
        assert!(syms.starts_with("<eps>\t0\n"));
    }
}
