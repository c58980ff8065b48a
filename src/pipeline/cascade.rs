//! Model cascade composition and weighted decode.
//!
//! For one candidate scale setting, the five model texts are scaled (once
//! each), compiled, and composed in the fixed order L, T, M, P, G; each
//! utterance lattice is then composed against the cascade, beam-pruned at
//! `prunewt`, and decoded by shortest path. All FST algebra runs in the
//! external toolkit.

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PtResult};
use crate::fstext;
use crate::pipeline::config::{Lang, ScaleSetting};
use crate::pipeline::stage::StageContext;
use crate::pipeline::stages::names;

pub struct DecodeResult {
    pub phones: Vec<String>,
    /// Printed form of the pruned decode graph, kept when the run emits
    /// probabilistic-transcription lattices for adaptation.
    pub lattice: Option<String>,
}

pub struct CascadeComposer<'a> {
    ctx: &'a StageContext<'a>,
    lang: &'a Lang,
    letters_syms: PathBuf,
    phones_syms: PathBuf,
    work: PathBuf,
}

impl<'a> CascadeComposer<'a> {
    pub fn new(ctx: &'a StageContext<'a>, lang: &'a Lang) -> PtResult<Self> {
        let letters_syms = ctx
            .store
            .path(lang.as_str(), names::CHANNEL_FST, "letters.syms");
        let phones_syms = ctx
            .store
            .path(lang.as_str(), names::CHANNEL_FST, "phones.syms");
        for path in [&letters_syms, &phones_syms] {
            if !path.exists() {
                return Err(PipelineError::ArtifactMissing { path: path.clone() });
            }
        }
        let work = ctx.store.dir(lang.as_str(), names::DECODE, "work")?;
        Ok(Self {
            ctx,
            lang,
            letters_syms,
            phones_syms,
            work,
        })
    }

    /// Scale, compile, and compose the five models for one setting.
    /// Returns the directory holding the compiled cascade.
    pub fn build(&self, setting: &ScaleSetting) -> PtResult<PathBuf> {
        let dir = self.work.join(setting.label());
        std::fs::create_dir_all(&dir)?;

        let noise_name = format!("T-{}-{}.txt", setting.tnumins, setting.tnumdel);
        let noise_path = self
            .ctx
            .store
            .path(self.lang.as_str(), names::NOISE, "noise")
            .join(&noise_name);
        let models: [(&str, PathBuf, f64, &Path, &Path); 5] = [
            (
                "L",
                self.ctx
                    .store
                    .path(self.lang.as_str(), names::LETTER_LM, "L.txt"),
                setting.lscale,
                &self.letters_syms,
                &self.letters_syms,
            ),
            // T carries fixed unit edit costs; its knobs are the bounds.
            ("T", noise_path, 1.0, &self.letters_syms, &self.letters_syms),
            (
                "M",
                self.ctx
                    .store
                    .path(self.lang.as_str(), names::MISMATCH, "M.txt"),
                setting.mscale,
                &self.letters_syms,
                &self.letters_syms,
            ),
            (
                "P",
                self.ctx
                    .store
                    .path(self.lang.as_str(), names::CHANNEL_FST, "P.txt"),
                setting.pscale,
                &self.letters_syms,
                &self.phones_syms,
            ),
            (
                "G",
                self.ctx
                    .store
                    .path(self.lang.as_str(), names::GRAMMAR, "G.txt"),
                setting.gscale,
                &self.phones_syms,
                &self.phones_syms,
            ),
        ];

        let mut compiled = Vec::new();
        for (name, text_path, scale, isyms, osyms) in &models {
            if !text_path.exists() {
                return Err(PipelineError::ArtifactMissing {
                    path: text_path.clone(),
                });
            }
            let text = std::fs::read_to_string(text_path)?;
            let scaled = fstext::scale_weights(&text, *scale)?;
            let scaled_path = dir.join(format!("{name}.txt"));
            std::fs::write(&scaled_path, scaled)?;
            let fst_path = dir.join(format!("{name}.fst"));
            self.compile(&scaled_path, &fst_path, *isyms, *osyms)?;
            compiled.push(fst_path);
        }

        let mut chain = compiled[0].clone();
        for (i, next) in compiled[1..].iter().enumerate() {
            let out = dir.join(format!("cascade-{}.fst", i + 1));
            self.ctx.tools.invoke_expecting(
                "fstcompose",
                [chain.as_path(), next.as_path(), out.as_path()],
                &[&out],
            )?;
            chain = out;
        }
        std::fs::rename(&chain, dir.join("cascade.fst"))?;
        Ok(dir)
    }

    pub fn decode_utterance(
        &self,
        cascade_dir: &Path,
        uttid: &str,
        lattice_text: &str,
        prunewt: f64,
        want_lattice: bool,
    ) -> PtResult<DecodeResult> {
        let utt_txt = cascade_dir.join(format!("{uttid}.utt.txt"));
        std::fs::write(&utt_txt, lattice_text)?;
        let utt_fst = cascade_dir.join(format!("{uttid}.utt.fst"));
        self.compile(&utt_txt, &utt_fst, &self.letters_syms, &self.letters_syms)?;

        let cascade_fst = cascade_dir.join("cascade.fst");
        let full = cascade_dir.join(format!("{uttid}.full.fst"));
        self.ctx.tools.invoke_expecting(
            "fstcompose",
            [utt_fst.as_path(), cascade_fst.as_path(), full.as_path()],
            &[&full],
        )?;

        let pruned = cascade_dir.join(format!("{uttid}.pruned.fst"));
        self.ctx.tools.invoke_expecting(
            "fstprune",
            [
                format!("--weight={prunewt}"),
                full.display().to_string(),
                pruned.display().to_string(),
            ],
            &[&pruned],
        )?;

        let best = cascade_dir.join(format!("{uttid}.best.fst"));
        self.ctx.tools.invoke_expecting(
            "fstshortestpath",
            [pruned.as_path(), best.as_path()],
            &[&best],
        )?;

        let printed = self.print(&best)?;
        let phones = fstext::parse_path_olabels(&printed);
        let lattice = if want_lattice {
            Some(self.print(&pruned)?)
        } else {
            None
        };

        // per-utterance scratch is large; the decode result is what persists
        for scratch in [utt_txt, utt_fst, full, pruned, best] {
            let _ = std::fs::remove_file(scratch);
        }
        Ok(DecodeResult { phones, lattice })
    }

    fn compile(&self, text: &Path, fst: &Path, isyms: &Path, osyms: &Path) -> PtResult<()> {
        self.ctx.tools.invoke_expecting(
            "fstcompile",
            [
                format!("--isymbols={}", isyms.display()),
                format!("--osymbols={}", osyms.display()),
                text.display().to_string(),
                fst.display().to_string(),
            ],
            &[fst],
        )?;
        Ok(())
    }

    fn print(&self, fst: &Path) -> PtResult<String> {
        let out = self.ctx.tools.invoke(
            "fstprint",
            [
                format!("--isymbols={}", self.letters_syms.display()),
                format!("--osymbols={}", self.phones_syms.display()),
                fst.display().to_string(),
            ],
        )?;
        Ok(out.stdout)
    }
}
