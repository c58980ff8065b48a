use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PtResult};
use crate::settings::Settings;

pub const FIRST_STAGE: u32 = 1;
pub const LAST_STAGE: u32 = 15;

/// A language code (e.g. `SW`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lang(pub String);

impl Lang {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestType {
    Dev,
    Eval,
}

impl TestType {
    fn parse(raw: &str) -> PtResult<Self> {
        match raw.trim() {
            "dev" => Ok(Self::Dev),
            "eval" => Ok(Self::Eval),
            other => Err(PipelineError::config(format!(
                "TESTTYPE must be dev or eval, got {other}"
            ))),
        }
    }
}

/// One candidate point in the scale-factor search space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleSetting {
    pub pscale: f64,
    pub gscale: f64,
    pub lscale: f64,
    pub mscale: f64,
    pub tnumins: u32,
    pub tnumdel: u32,
}

impl ScaleSetting {
    /// Stable identifier used in artifact names and reports.
    pub fn label(&self) -> String {
        format!(
            "P{}-G{}-L{}-M{}-I{}-D{}",
            self.pscale, self.gscale, self.lscale, self.mscale, self.tnumins, self.tnumdel
        )
    }
}

impl fmt::Display for ScaleSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Immutable snapshot of one run's settings. Constructed once at startup,
/// passed by reference to every stage; nothing reads ambient state.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub lang_name: String,
    pub all_langs: Vec<Lang>,
    pub train_langs: Vec<Lang>,
    pub dev_langs: Vec<Lang>,
    pub eval_langs: Vec<Lang>,
    pub test_langs: Vec<Lang>,

    pub data: PathBuf,
    pub data_url: Option<String>,
    pub data_sha256: Option<String>,
    pub exp: PathBuf,
    pub test_type: TestType,

    pub transdir: String,
    pub alphabet: PathBuf,
    pub lexicon: Option<PathBuf>,
    pub phonelm: Option<PathBuf>,

    pub gap_sym: String,
    pub delim_sym: String,
    pub num_restarts: u32,
    pub top_n: usize,
    pub switch_penalty: f64,

    pub pscale: Vec<f64>,
    pub gscale: Vec<f64>,
    pub lscale: Vec<f64>,
    pub mscale: Vec<f64>,
    pub tnumins: Vec<u32>,
    pub tnumdel: Vec<u32>,
    pub prunewt: f64,

    pub make_tplm: bool,
    pub make_gtplm: bool,
    pub decode_adapt: bool,
    pub debug: bool,

    pub startstage: u32,
    pub endstage: u32,
}

impl RunConfig {
    pub fn from_settings(settings: &Settings) -> PtResult<Self> {
        let langs = |key: &str| -> PtResult<Vec<Lang>> {
            Ok(settings.require_list(key)?.into_iter().map(Lang).collect())
        };

        let all_langs = langs("ALL_LANGS")?;
        let train_langs = langs("TRAIN_LANG")?;
        for lang in &train_langs {
            if !all_langs.contains(lang) {
                return Err(PipelineError::config(format!(
                    "TRAIN_LANG entry {lang} is not in ALL_LANGS"
                )));
            }
        }

        let data = PathBuf::from(settings.require("DATA")?);
        let data_url = settings.get("DATA_URL").map(str::to_string);
        if !data.is_dir() && data_url.is_none() {
            return Err(PipelineError::config(format!(
                "data root {} does not exist and DATA_URL is unset",
                data.display()
            )));
        }

        let alphabet = settings
            .get("ALPHABET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data.join("alphabet.txt"));

        let make_tplm = settings.flag("makeTPLM", false)?;
        let make_gtplm = settings.flag("makeGTPLM", true)?;
        let phonelm = settings.get("PHONELM").map(PathBuf::from);
        if !make_tplm && !make_gtplm && phonelm.is_none() {
            return Err(PipelineError::config(
                "no grammar variant enabled: set makeTPLM, makeGTPLM, or PHONELM",
            ));
        }

        let cfg = Self {
            lang_name: settings.require("LANG_NAME")?.to_string(),
            all_langs,
            train_langs,
            dev_langs: langs("DEV_LANG")?,
            eval_langs: langs("EVAL_LANG")?,
            test_langs: langs("TEST_LANG")?,
            data,
            data_url,
            data_sha256: settings.get("DATA_SHA256").map(str::to_string),
            exp: PathBuf::from(settings.require("EXP")?),
            test_type: TestType::parse(settings.require("TESTTYPE")?)?,
            transdir: settings
                .get("TRANSDIR")
                .unwrap_or("transcripts")
                .to_string(),
            alphabet,
            lexicon: settings.get("LEXICON").map(PathBuf::from),
            phonelm,
            gap_sym: settings.get("GAPSYM").unwrap_or("-").to_string(),
            delim_sym: settings.get("DELIMSYM").unwrap_or("#").to_string(),
            num_restarts: settings.parsed("NUMRESTARTS", 1u32)?.max(1),
            top_n: settings.parsed("TOPN", 10usize)?.max(1),
            switch_penalty: settings.parsed("SWITCHPENALTY", 1.0f64)?,
            pscale: settings.parsed_list("Pscale", 1.0f64)?,
            gscale: settings.parsed_list("Gscale", 1.0f64)?,
            lscale: settings.parsed_list("Lscale", 1.0f64)?,
            mscale: settings.parsed_list("Mscale", 1.0f64)?,
            tnumins: settings.parsed_list("Tnumins", 2u32)?,
            tnumdel: settings.parsed_list("Tnumdel", 2u32)?,
            prunewt: settings.parsed("prunewt", 10.0f64)?,
            make_tplm,
            make_gtplm,
            decode_adapt: settings.flag("decode_adapt", false)?,
            debug: settings.flag("debug", false)?,
            startstage: settings.parsed("startstage", FIRST_STAGE)?,
            endstage: settings.parsed("endstage", LAST_STAGE)?,
        };
        cfg.check_stage_range()?;
        Ok(cfg)
    }

    /// Command-line stage-range overrides, applied before the snapshot is
    /// handed to the orchestrator.
    pub fn with_stage_range(mut self, start: Option<u32>, end: Option<u32>) -> PtResult<Self> {
        if let Some(s) = start {
            self.startstage = s;
        }
        if let Some(e) = end {
            self.endstage = e;
        }
        self.check_stage_range()?;
        Ok(self)
    }

    fn check_stage_range(&self) -> PtResult<()> {
        if self.startstage < FIRST_STAGE
            || self.endstage > LAST_STAGE
            || self.startstage > self.endstage
        {
            return Err(PipelineError::config(format!(
                "stage range {}..{} is not within {FIRST_STAGE}..{LAST_STAGE}",
                self.startstage, self.endstage
            )));
        }
        Ok(())
    }

    /// The decode set for this run's mode.
    pub fn target_langs(&self) -> &[Lang] {
        match self.test_type {
            TestType::Dev => &self.dev_langs,
            TestType::Eval => &self.eval_langs,
        }
    }

    /// Languages any stage touches: training languages then decode targets,
    /// deduplicated in order.
    pub fn active_langs(&self) -> Vec<Lang> {
        let mut out = self.train_langs.clone();
        for lang in self.target_langs() {
            if !out.contains(lang) {
                out.push(lang.clone());
            }
        }
        out
    }

    /// Cartesian product of the per-factor candidate lists, in settings
    /// order with the last axis varying fastest. Deterministic, so the
    /// earliest-tried tie-break is reproducible.
    pub fn scale_candidates(&self) -> Vec<ScaleSetting> {
        let mut out = Vec::new();
        for &pscale in &self.pscale {
            for &gscale in &self.gscale {
                for &lscale in &self.lscale {
                    for &mscale in &self.mscale {
                        for &tnumins in &self.tnumins {
                            for &tnumdel in &self.tnumdel {
                                out.push(ScaleSetting {
                                    pscale,
                                    gscale,
                                    lscale,
                                    mscale,
                                    tnumins,
                                    tnumdel,
                                });
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// A development/evaluation/test language also present in the training
    /// set is reported, not rejected.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (role, langs) in [
            ("DEV_LANG", &self.dev_langs),
            ("EVAL_LANG", &self.eval_langs),
            ("TEST_LANG", &self.test_langs),
        ] {
            for lang in langs.iter() {
                if self.train_langs.contains(lang) {
                    out.push(format!("{role} {lang} also appears in TRAIN_LANG"));
                }
            }
        }
        out
    }
}
