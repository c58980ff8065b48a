//! Score records and scorer-output parsing.
//!
//! The external scorer prints a human-readable summary per invocation:
//!
//! ```text
//! WER 92.78% [ 7105 / 7658, 1043 ins, 2388 del, 3674 sub ]
//! SER 96.10% [ 812 / 845 ]
//! ```
//!
//! Parsing validates that the error counts sum to the reported numerator and
//! that the percentage matches the counts within rounding; anything else is
//! treated as the tool failing to produce its declared output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PtResult};

static WER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"WER\s+([0-9.]+)%\s*\[\s*(\d+)\s*/\s*(\d+)\s*,\s*(\d+)\s+ins,\s*(\d+)\s+del,\s*(\d+)\s+sub\s*\]",
    )
    .expect("wer regex")
});

static SER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SER\s+([0-9.]+)%\s*\[\s*(\d+)\s*/\s*(\d+)\s*\]").expect("ser regex"));

/// One (language, scale setting) scoring outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub ins: u64,
    pub del: u64,
    pub sub: u64,
    /// Reference word count (the denominator).
    pub words: u64,
    pub sent_err: Option<u64>,
    pub sents: Option<u64>,
}

impl ScoreRecord {
    pub fn errors(&self) -> u64 {
        self.ins + self.del + self.sub
    }

    pub fn wer(&self) -> f64 {
        if self.words == 0 {
            return 0.0;
        }
        100.0 * self.errors() as f64 / self.words as f64
    }

    pub fn ser(&self) -> Option<f64> {
        match (self.sent_err, self.sents) {
            (Some(e), Some(n)) if n > 0 => Some(100.0 * e as f64 / n as f64),
            _ => None,
        }
    }

    /// The WER line alone, in the scorer's own format.
    pub fn summary_line(&self) -> String {
        format!(
            "WER {:.2}% [ {} / {}, {} ins, {} del, {} sub ]",
            self.wer(),
            self.errors(),
            self.words,
            self.ins,
            self.del,
            self.sub
        )
    }

    pub fn summary(&self) -> String {
        let mut line = self.summary_line();
        if let (Some(e), Some(n), Some(ser)) = (self.sent_err, self.sents, self.ser()) {
            line.push_str(&format!("\nSER {ser:.2}% [ {e} / {n} ]"));
        }
        line
    }
}

pub fn parse_score_output(tool: &str, text: &str) -> PtResult<ScoreRecord> {
    let caps = WER_RE.captures(text).ok_or_else(|| {
        PipelineError::tool_output(tool, format!("no WER summary in output: {}", text.trim()))
    })?;
    let pct: f64 = caps[1].parse().unwrap_or(f64::NAN);
    let num: u64 = parse_count(tool, &caps[2])?;
    let words: u64 = parse_count(tool, &caps[3])?;
    let ins: u64 = parse_count(tool, &caps[4])?;
    let del: u64 = parse_count(tool, &caps[5])?;
    let sub: u64 = parse_count(tool, &caps[6])?;

    if ins + del + sub != num {
        return Err(PipelineError::tool_output(
            tool,
            format!("error counts {ins}+{del}+{sub} do not sum to {num}"),
        ));
    }
    let mut record = ScoreRecord {
        ins,
        del,
        sub,
        words,
        sent_err: None,
        sents: None,
    };
    if (record.wer() - pct).abs() > 0.05 {
        return Err(PipelineError::tool_output(
            tool,
            format!("reported WER {pct}% does not match counts ({:.2}%)", record.wer()),
        ));
    }
    if let Some(caps) = SER_RE.captures(text) {
        record.sent_err = Some(parse_count(tool, &caps[2])?);
        record.sents = Some(parse_count(tool, &caps[3])?);
    }
    Ok(record)
}

/// Index of the best record: lowest WER, ties broken by lowest total error
/// count, then by earliest position. NaN-free by construction (counts).
pub fn select_best(records: &[ScoreRecord]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, rec) in records.iter().enumerate() {
        let better = match best {
            None => true,
            Some(j) => {
                let cur = &records[j];
                rec.wer() < cur.wer()
                    || (rec.wer() == cur.wer() && rec.errors() < cur.errors())
            }
        };
        if better {
            best = Some(i);
        }
    }
    best
}

fn parse_count(tool: &str, raw: &str) -> PtResult<u64> {
    raw.parse()
        .map_err(|_| PipelineError::tool_output(tool, format!("bad count {raw}")))
}
