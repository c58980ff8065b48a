//! AT&T text-format FST construction and weight scaling.
//!
//! The pipeline never implements FST algebra (composition, pruning,
//! shortest-path belong to the external toolkit); what lives here is the
//! construction of model *text* in the toolkit's exchange format, and the
//! per-model weight scaling applied exactly once before compilation.
//!
//! Conventions: weights are tropical (negative log probability); arcs are
//! always written in transducer form `src dst ilabel olabel weight`; final
//! states as `state weight`. Symbol id 0 is reserved for `<eps>`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::error::{PipelineError, PtResult};

pub const EPS: &str = "<eps>";

/// Symbol table text: `<eps>` at id 0, the given symbols from 1.
pub fn write_symtab(symbols: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{EPS}\t0");
    for (i, sym) in symbols.iter().enumerate() {
        let _ = writeln!(out, "{sym}\t{}", i + 1);
    }
    out
}

/// Multiply every weight by `scale` (log-domain scaling). Applied once per
/// model before compilation; the composed graph is never rescaled.
pub fn scale_weights(text: &str, scale: f64) -> PtResult<String> {
    let mut out = String::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.len() {
            0 | 1 | 4 => {
                let _ = writeln!(out, "{line}");
            }
            2 => {
                let w = parse_weight(fields[1], line)?;
                let _ = writeln!(out, "{}\t{}", fields[0], fmt_weight(w * scale));
            }
            5 => {
                let w = parse_weight(fields[4], line)?;
                let _ = writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}",
                    fields[0],
                    fields[1],
                    fields[2],
                    fields[3],
                    fmt_weight(w * scale)
                );
            }
            _ => {
                return Err(PipelineError::config(format!(
                    "malformed fst text line: {line}"
                )))
            }
        }
    }
    Ok(out)
}

/// Convert a trained channel model (`phone letter prob` lines) into the
/// decode-direction transducer: input letters, output phones. A gap on the
/// letter side becomes a phone emitted from nothing; a gap on the phone side
/// consumes a letter silently.
pub fn channel_to_fst(model: &str, gap: &str) -> PtResult<String> {
    let mut out = String::new();
    for line in model.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(PipelineError::config(format!(
                "malformed channel model line: {line}"
            )));
        }
        let (phone, letter) = (fields[0], fields[1]);
        let prob: f64 = fields[2].parse().map_err(|_| {
            PipelineError::config(format!("bad channel probability in line: {line}"))
        })?;
        if prob <= 0.0 {
            continue;
        }
        let ilabel = if letter == gap { EPS } else { letter };
        let olabel = if phone == gap { EPS } else { phone };
        if ilabel == EPS && olabel == EPS {
            continue;
        }
        let _ = writeln!(out, "0\t0\t{ilabel}\t{olabel}\t{}", fmt_weight(-prob.ln()));
    }
    out.push_str("0\t0.000000\n");
    Ok(out)
}

/// Uniform mixture of channel models in `phone letter prob` form: each
/// (phone, letter) event's probability is averaged over all models, with
/// absence counting as zero.
pub fn merge_channel_models(models: &[String]) -> PtResult<String> {
    let mut sums: BTreeMap<(String, String), f64> = BTreeMap::new();
    for model in models {
        for line in model.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(PipelineError::config(format!(
                    "malformed channel model line: {line}"
                )));
            }
            let prob: f64 = fields[2].parse().map_err(|_| {
                PipelineError::config(format!("bad channel probability in line: {line}"))
            })?;
            *sums
                .entry((fields[0].to_string(), fields[1].to_string()))
                .or_insert(0.0) += prob;
        }
    }
    let n = models.len().max(1) as f64;
    let mut out = String::new();
    for ((phone, letter), sum) in sums {
        let _ = writeln!(out, "{phone}\t{letter}\t{}", fmt_weight(sum / n));
    }
    Ok(out)
}

/// Untrained unigram grammar over the phone inventory: every phone equally
/// likely from a single state.
pub fn build_unigram_grammar(phones: &[String]) -> String {
    let w = fmt_weight((phones.len().max(1) as f64).ln());
    let mut out = String::new();
    for p in phones {
        let _ = writeln!(out, "0\t0\t{p}\t{p}\t{w}");
    }
    out.push_str("0\t0.000000\n");
    out
}

/// Bigram acceptor estimated from token sequences with add-one smoothing
/// over the observed vocabulary plus an end-of-sequence event.
pub fn build_bigram_acceptor(seqs: &[Vec<String>]) -> String {
    let mut vocab: BTreeSet<&str> = BTreeSet::new();
    for seq in seqs {
        for tok in seq {
            vocab.insert(tok.as_str());
        }
    }
    let vocab: Vec<&str> = vocab.into_iter().collect();
    let state_of = |tok: &str| -> usize {
        1 + vocab.binary_search(&tok).expect("token in vocab")
    };

    // counts[from][to]: from 0 = start state; to None = end of sequence.
    let mut counts: BTreeMap<usize, BTreeMap<Option<usize>, u64>> = BTreeMap::new();
    for seq in seqs {
        let mut from = 0usize;
        for tok in seq {
            let to = state_of(tok);
            *counts.entry(from).or_default().entry(Some(to)).or_insert(0) += 1;
            from = to;
        }
        *counts.entry(from).or_default().entry(None).or_insert(0) += 1;
    }

    let events = vocab.len() as f64 + 1.0;
    let mut out = String::new();
    for from in 0..=vocab.len() {
        let observed = counts.get(&from);
        let total: u64 = observed
            .map(|m| m.values().sum())
            .unwrap_or(0);
        let denom = total as f64 + events;
        for (i, tok) in vocab.iter().enumerate() {
            let to = i + 1;
            let c = observed
                .and_then(|m| m.get(&Some(to)))
                .copied()
                .unwrap_or(0);
            let w = -(((c + 1) as f64) / denom).ln();
            let _ = writeln!(out, "{from}\t{to}\t{tok}\t{tok}\t{}", fmt_weight(w));
        }
        let c_end = observed.and_then(|m| m.get(&None)).copied().unwrap_or(0);
        let w_end = -(((c_end + 1) as f64) / denom).ln();
        let _ = writeln!(out, "{from}\t{}", fmt_weight(w_end));
    }
    out
}

/// Bounded insertion/deletion noise transducer. Input is the crowd letter
/// stream, output the canonical letters: an arc `l:<eps>` absorbs a spurious
/// letter (insertion by the transcriber), `<eps>:l` supplies a missed one
/// (deletion). State (i, d) tracks edits used so far; every state is final.
pub fn build_insdel(letters: &[String], numins: u32, numdel: u32, edit_cost: f64) -> String {
    let state = |i: u32, d: u32| -> u32 { i * (numdel + 1) + d };
    let mut out = String::new();
    for i in 0..=numins {
        for d in 0..=numdel {
            let s = state(i, d);
            for l in letters {
                let _ = writeln!(out, "{s}\t{s}\t{l}\t{l}\t0.000000");
            }
            if i < numins {
                let t = state(i + 1, d);
                for l in letters {
                    let _ = writeln!(out, "{s}\t{t}\t{l}\t{EPS}\t{}", fmt_weight(edit_cost));
                }
            }
            if d < numdel {
                let t = state(i, d + 1);
                for l in letters {
                    let _ = writeln!(out, "{s}\t{t}\t{EPS}\t{l}\t{}", fmt_weight(edit_cost));
                }
            }
            let _ = writeln!(out, "{s}\t0.000000");
        }
    }
    out
}

/// Decode-time mismatch model: identity at no cost, any single-letter
/// substitution at the switch penalty.
pub fn build_mismatch(letters: &[String], switch_penalty: f64) -> String {
    let mut out = String::new();
    for a in letters {
        let _ = writeln!(out, "0\t0\t{a}\t{a}\t0.000000");
        for b in letters {
            if a != b {
                let _ = writeln!(out, "0\t0\t{a}\t{b}\t{}", fmt_weight(switch_penalty));
            }
        }
    }
    out.push_str("0\t0.000000\n");
    out
}

/// Union of linear chains over a shared start (0) and final (1) state: one
/// path per transcriber alternative.
pub fn build_lattice(alternatives: &[Vec<String>]) -> String {
    let mut out = String::new();
    let mut next = 2u32;
    for alt in alternatives {
        match alt.len() {
            0 => {
                let _ = writeln!(out, "0\t1\t{EPS}\t{EPS}\t0.000000");
            }
            1 => {
                let _ = writeln!(out, "0\t1\t{}\t{}\t0.000000", alt[0], alt[0]);
            }
            n => {
                let mut from = 0u32;
                for (i, tok) in alt.iter().enumerate() {
                    let to = if i == n - 1 { 1 } else { next };
                    let _ = writeln!(out, "{from}\t{to}\t{tok}\t{tok}\t0.000000");
                    if i != n - 1 {
                        from = next;
                        next += 1;
                    }
                }
            }
        }
    }
    out.push_str("1\t0.000000\n");
    out
}

/// Output labels along a printed single-path FST (`fstprint` of a
/// shortest-path result), epsilons skipped.
pub fn parse_path_olabels(printed: &str) -> Vec<String> {
    let mut arcs: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut start: Option<String> = None;
    for line in printed.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 {
            if start.is_none() {
                start = Some(fields[0].to_string());
            }
            arcs.insert(
                fields[0].to_string(),
                (fields[1].to_string(), fields[3].to_string()),
            );
        }
    }
    let mut out = Vec::new();
    let mut cur = match start {
        Some(s) => s,
        None => return out,
    };
    while let Some((dst, olabel)) = arcs.remove(&cur) {
        if olabel != EPS {
            out.push(olabel);
        }
        cur = dst;
    }
    out
}

fn fmt_weight(w: f64) -> String {
    format!("{w:.6}")
}

fn parse_weight(raw: &str, line: &str) -> PtResult<f64> {
    raw.parse()
        .map_err(|_| PipelineError::config(format!("bad weight in fst text line: {line}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn scaling_is_multiplicative_on_every_weight() {
        let text = "0\t1\ta\tb\t2.000000\n1\t0.500000\n";
        let scaled = scale_weights(text, 0.5).unwrap();
        assert_eq!(scaled, "0\t1\ta\tb\t1.000000\n1\t0.250000\n");
        // Scaling by 1.0 is the identity (modulo normalized formatting).
        assert_eq!(scale_weights(text, 1.0).unwrap(), text);
    }

    #[test]
    fn channel_fst_is_decode_oriented() {
        let model = "p1\ta\t0.5\np1\t-\t0.25\n-\tb\t0.25\n";
        let fst = channel_to_fst(model, "-").unwrap();
        // phone from letter
        assert!(fst.contains("0\t0\ta\tp1\t"));
        // phone with no letter evidence: epsilon input
        assert!(fst.contains("0\t0\t<eps>\tp1\t"));
        // letter with no phone: epsilon output
        assert!(fst.contains("0\t0\tb\t<eps>\t"));
        assert!(fst.ends_with("0\t0.000000\n"));
    }

    #[test]
    fn merging_averages_probabilities() {
        let a = "p\tx\t0.8\n".to_string();
        let b = "p\tx\t0.4\np\ty\t0.6\n".to_string();
        let merged = merge_channel_models(&[a, b]).unwrap();
        assert!(merged.contains("p\tx\t0.600000"));
        // absent from one model counts as zero
        assert!(merged.contains("p\ty\t0.300000"));
    }

    #[test]
    fn unigram_grammar_is_uniform() {
        let g = build_unigram_grammar(&toks("p1 p2 p3 p4"));
        let w = format!("{:.6}", 4.0f64.ln());
        assert_eq!(g.matches(&w).count(), 4);
    }

    #[test]
    fn bigram_probabilities_sum_to_one_per_state() {
        let seqs = vec![toks("a b"), toks("a b b"), toks("b")];
        let text = build_bigram_acceptor(&seqs);
        let mut mass: std::collections::BTreeMap<String, f64> = Default::default();
        for line in text.lines() {
            let f: Vec<&str> = line.split_whitespace().collect();
            let (state, w) = match f.len() {
                5 => (f[0], f[4]),
                2 => (f[0], f[1]),
                _ => continue,
            };
            *mass.entry(state.to_string()).or_insert(0.0) += (-w.parse::<f64>().unwrap()).exp();
        }
        for (_, m) in mass {
            assert!((m - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn insdel_is_bounded() {
        let t = build_insdel(&toks("a b"), 2, 1, 1.0);
        let states: std::collections::BTreeSet<&str> = t
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        // (numins + 1) * (numdel + 1) states, no more
        assert_eq!(states.len(), 6);
        // no insertion arc leaves the fully-spent row
        let spent_ins: Vec<&str> = t
            .lines()
            .filter(|l| {
                let f: Vec<&str> = l.split_whitespace().collect();
                f.len() == 5 && f[3] == EPS && f[0] == "4"
            })
            .collect();
        assert!(spent_ins.is_empty());
    }

    #[test]
    fn mismatch_has_free_identity_and_penalized_swaps() {
        let m = build_mismatch(&toks("a b c"), 2.5);
        assert!(m.contains("0\t0\ta\ta\t0.000000"));
        assert!(m.contains("0\t0\ta\tb\t2.500000"));
        assert_eq!(m.matches("2.500000").count(), 6);
    }

    #[test]
    fn lattice_unions_alternatives() {
        let lat = build_lattice(&[toks("a b"), toks("c")]);
        assert!(lat.contains("0\t2\ta\ta\t0.000000"));
        assert!(lat.contains("2\t1\tb\tb\t0.000000"));
        assert!(lat.contains("0\t1\tc\tc\t0.000000"));
        assert!(lat.ends_with("1\t0.000000\n"));
    }

    #[test]
    fn path_olabels_follow_arcs_and_skip_eps() {
        let printed = "0\t1\ta\tp1\t0.5\n1\t2\tb\t<eps>\t0.1\n2\t3\tc\tp2\t0.2\n3\n";
        assert_eq!(parse_path_olabels(printed), vec!["p1", "p2"]);
    }
}
