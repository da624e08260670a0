// core/src/prob.rs
//
// Log-domain probability arithmetic (base 10), fast log-probability parsing,
// integer-log scaling for grammar weights and an 8-bit codebook used to
// compress probabilities for storage.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

use crate::error::Result;
use crate::file::LineReader;

/// Base-10 log probability.
pub type LogP = f64;
/// Linear-domain probability.
pub type Prob = f64;

pub const LOGP_ZERO: LogP = f64::NEG_INFINITY;
pub const LOGP_ONE: LogP = 0.0;
pub const LOGP_INF: LogP = f64::INFINITY;
/// Finite stand-in for zero used by text formats.
pub const LOGP_PSEUDO_ZERO: LogP = -99.0;

pub const PROB_EPSILON: Prob = 3e-6;

const LN10: f64 = std::f64::consts::LN_10;

pub fn log_of(prob: Prob) -> LogP {
    if prob <= 0.0 {
        LOGP_ZERO
    } else {
        prob.log10()
    }
}

pub fn prob_of(logp: LogP) -> Prob {
    if logp == LOGP_ZERO {
        0.0
    } else {
        10f64.powf(logp)
    }
}

/// `log10(10^x + 10^y)` without leaving the log domain.
pub fn add_logp(x: LogP, y: LogP) -> LogP {
    let (hi, lo) = if x >= y { (x, y) } else { (y, x) };
    if lo == LOGP_ZERO {
        return hi;
    }
    if hi == LOGP_INF {
        return LOGP_INF;
    }
    hi + ((lo - hi) * LN10).exp().ln_1p() / LN10
}

/// `log10(10^x - 10^y)`. Panics when `x < y`: the difference of
/// probabilities would be negative.
pub fn sub_logp(x: LogP, y: LogP) -> LogP {
    assert!(x >= y, "sub_logp: x ({}) < y ({})", x, y);
    if x == y {
        return LOGP_ZERO;
    }
    if y == LOGP_ZERO {
        return x;
    }
    x + (-((y - x) * LN10).exp()).ln_1p() / LN10
}

/// `log10(w1 * 10^x + w2 * 10^y)` for log weights `w1`, `w2`.
pub fn weighted_add_logp(w1: LogP, x: LogP, w2: LogP, y: LogP) -> LogP {
    add_logp(w1 + x, w2 + y)
}

/// Linear interpolation `lambda * 10^a + (1-lambda) * 10^b`, in the log domain.
pub fn mix_logp(lambda: Prob, a: LogP, b: LogP) -> LogP {
    if lambda >= 1.0 {
        return a;
    }
    if lambda <= 0.0 {
        return b;
    }
    add_logp(a + lambda.log10(), b + (1.0 - lambda).log10())
}

/// Parses a log-probability token. Plain `[-]ddd[.ddd]` tokens take an exact
/// integer fast path; anything else (exponents, `inf`) goes through the
/// general float parser.
pub fn parse_logp(token: &str) -> Option<LogP> {
    let bytes = token.as_bytes();
    let (negative, digits) = match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        Some(b'+') => (false, &bytes[1..]),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return None;
    }

    let mut mantissa: u64 = 0;
    let mut ndigits = 0usize;
    let mut frac_digits = 0i32;
    let mut seen_point = false;
    for &b in digits {
        match b {
            b'0'..=b'9' => {
                mantissa = mantissa * 10 + u64::from(b - b'0');
                ndigits += 1;
                if seen_point {
                    frac_digits += 1;
                }
                if ndigits > 15 {
                    return parse_general(token);
                }
            }
            b'.' if !seen_point => seen_point = true,
            _ => return parse_general(token),
        }
    }
    if ndigits == 0 {
        return None;
    }
    // mantissa < 2^53 and 10^k exact, so the division is correctly rounded
    let value = mantissa as f64 / 10f64.powi(frac_digits);
    Some(if negative { -value } else { value })
}

fn parse_general(token: &str) -> Option<LogP> {
    match token {
        "-inf" | "-Inf" | "-INF" => Some(LOGP_ZERO),
        "inf" | "Inf" | "INF" => Some(LOGP_INF),
        _ => token.parse::<f64>().ok(),
    }
}

/// Log base of the integer-log scale used by PFSG weights.
const INTLOG_BASE: f64 = 1.0001;

pub fn logp_to_intlog(logp: LogP) -> i64 {
    if logp == LOGP_ZERO {
        return logp_to_intlog(LOGP_PSEUDO_ZERO);
    }
    (logp * LN10 / INTLOG_BASE.ln()).round() as i64
}

pub fn intlog_to_logp(intlog: i64) -> LogP {
    intlog as f64 * INTLOG_BASE.ln() / LN10
}

const BYTELOG_SHIFT: u32 = 10;

/// Coarse 1/1024 scaling of the integer-log scale.
pub fn logp_to_bytelog(logp: LogP) -> i64 {
    (logp_to_intlog(logp) + (1 << (BYTELOG_SHIFT - 1))) >> BYTELOG_SHIFT
}

pub fn bytelog_to_logp(bytelog: i64) -> LogP {
    intlog_to_logp(bytelog << BYTELOG_SHIFT)
}

/// 8-bit codebook for log probabilities.
///
/// Code 0 is reserved for zero probability. The remaining 255 codes are
/// equal-population bins over the sample the codebook was built from; a
/// code decodes to the mean of the values that fell into its bin. When the
/// sample has at most 255 distinct values the codebook is lossless for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPQuantizer {
    centers: Vec<LogP>,
    /// Upper decision boundary between bin `i` and bin `i + 1`.
    bounds: Vec<LogP>,
}

impl LogPQuantizer {
    pub const MAX_BINS: usize = 255;

    pub fn build(samples: &[LogP]) -> Self {
        let mut values: Vec<LogP> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        if values.is_empty() {
            return Self {
                centers: vec![LOGP_ONE],
                bounds: Vec::new(),
            };
        }

        let mut distinct: Vec<(LogP, usize)> = Vec::new();
        for v in values.iter().copied() {
            match distinct.last_mut() {
                Some((last, n)) if *last == v => *n += 1,
                _ => distinct.push((v, 1)),
            }
        }

        // (sum, count, first value, last value) per bin
        let mut bins: Vec<(f64, usize, LogP, LogP)> = Vec::new();
        if distinct.len() <= Self::MAX_BINS {
            for (v, n) in distinct {
                bins.push((v * n as f64, n, v, v));
            }
        } else {
            let target = values.len().div_ceil(Self::MAX_BINS);
            let mut remaining_values = distinct.len();
            for (v, n) in distinct {
                let bins_left = Self::MAX_BINS - bins.len();
                let close = match bins.last() {
                    Some(&(_, count, _, _)) => count >= target && bins_left > 0,
                    None => true,
                };
                if close || remaining_values <= bins_left {
                    bins.push((v * n as f64, n, v, v));
                } else if let Some(bin) = bins.last_mut() {
                    bin.0 += v * n as f64;
                    bin.1 += n;
                    bin.3 = v;
                }
                remaining_values -= 1;
            }
        }

        let centers = bins.iter().map(|&(sum, n, _, _)| sum / n as f64).collect();
        let bounds = bins
            .windows(2)
            .map(|w| (w[0].3 + w[1].2) / 2.0)
            .collect();
        Self { centers, bounds }
    }

    pub fn num_bins(&self) -> usize {
        self.centers.len()
    }

    pub fn encode(&self, logp: LogP) -> u8 {
        if logp == LOGP_ZERO {
            return 0;
        }
        let bin = self.bounds.partition_point(|&b| b < logp);
        (bin + 1) as u8
    }

    pub fn decode(&self, code: u8) -> LogP {
        if code == 0 {
            return LOGP_ZERO;
        }
        let i = (code as usize - 1).min(self.centers.len() - 1);
        self.centers[i]
    }

    /// Text codebook: a `bins N` header followed by one `code center` line per bin.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "bins {}", self.centers.len())?;
        for (i, c) in self.centers.iter().enumerate() {
            writeln!(out, "{} {}", i + 1, c)?;
        }
        Ok(())
    }

    pub fn read<R: BufRead>(input: &mut LineReader<R>) -> Result<Self> {
        let header = input
            .next_nonblank()?
            .ok_or_else(|| input.error("missing codebook header"))?;
        let n = match header.split_whitespace().collect::<Vec<_>>()[..] {
            ["bins", n] => n.parse::<usize>().map_err(|_| input.error("bad bin count"))?,
            _ => return Err(input.error("expected 'bins N'")),
        };
        if n == 0 || n > Self::MAX_BINS {
            return Err(input.error(format!("bin count {} out of range", n)));
        }
        let mut centers = Vec::with_capacity(n);
        for expected in 1..=n {
            let line = input
                .next_nonblank()?
                .ok_or_else(|| input.error("truncated codebook"))?;
            let mut fields = line.split_whitespace();
            let code = fields.next().and_then(|f| f.parse::<usize>().ok());
            let center = fields.next().and_then(parse_logp);
            match (code, center) {
                (Some(c), Some(v)) if c == expected => centers.push(v),
                _ => return Err(input.error(format!("bad codebook entry for bin {}", expected))),
            }
        }
        let bounds = centers.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
        Ok(Self { centers, bounds })
    }
}

impl Default for LogPQuantizer {
    fn default() -> Self {
        Self::build(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn weighted_sum_in_log_domain() {
        let p = weighted_add_logp(log_of(0.25), log_of(0.2), log_of(0.75), log_of(0.6));
        assert!((prob_of(p) - (0.05 + 0.45)).abs() < 1e-12);
        assert_eq!(weighted_add_logp(LOGP_ZERO, -1.0, 0.0, -2.0), -2.0);
    }

    #[test]
    fn add_logp_matches_linear_sum() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a: f64 = -rng.random::<f64>() * 8.0;
            let b: f64 = -rng.random::<f64>() * 8.0;
            let sum = prob_of(add_logp(a, b));
            let expected = prob_of(a) + prob_of(b);
            assert!((sum - expected).abs() <= 1e-12 * expected.max(1e-300) + 1e-15);
        }
    }

    #[test]
    fn zero_identities() {
        assert_eq!(add_logp(-1.5, LOGP_ZERO), -1.5);
        assert_eq!(add_logp(LOGP_ZERO, -0.25), -0.25);
        assert_eq!(sub_logp(-2.0, -2.0), LOGP_ZERO);
        assert_eq!(sub_logp(-2.0, LOGP_ZERO), -2.0);
        assert_eq!(prob_of(LOGP_ZERO), 0.0);
        assert_eq!(log_of(0.0), LOGP_ZERO);
        assert_eq!(prob_of(LOGP_ONE), 1.0);
    }

    #[test]
    fn sub_logp_inverts_add() {
        let s = add_logp(-0.7, -1.3);
        assert!((sub_logp(s, -1.3) - (-0.7)).abs() < 1e-12);
    }

    #[test]
    #[should_panic]
    fn sub_logp_rejects_negative_difference() {
        sub_logp(-3.0, -1.0);
    }

    #[test]
    fn parse_logp_fast_path_agrees_with_std() {
        for tok in ["-1.2345678", "0", "-0.5", "12", "-99", "-3.000001", "+0.25"] {
            let expected: f64 = tok.parse().unwrap();
            assert_eq!(parse_logp(tok), Some(expected), "token {}", tok);
        }
        assert_eq!(parse_logp("-1e-3"), Some(-0.001));
        assert_eq!(parse_logp("-inf"), Some(LOGP_ZERO));
        assert_eq!(parse_logp("-"), None);
        assert_eq!(parse_logp("abc"), None);
        assert_eq!(parse_logp("1.2.3"), None);
    }

    #[test]
    fn intlog_scale_round_trips_closely() {
        for lp in [-0.1, -1.0, -4.25] {
            let back = intlog_to_logp(logp_to_intlog(lp));
            assert!((back - lp).abs() < 1e-4);
        }
        assert!((bytelog_to_logp(logp_to_bytelog(-2.0)) + 2.0).abs() < 0.05);
    }

    #[test]
    fn quantizer_is_exact_for_small_alphabets() {
        let samples = [-1.0, -2.0, -2.0, -0.5, LOGP_ZERO];
        let q = LogPQuantizer::build(&samples);
        assert_eq!(q.num_bins(), 3);
        for v in [-1.0, -2.0, -0.5] {
            assert_eq!(q.decode(q.encode(v)), v);
        }
        assert_eq!(q.encode(LOGP_ZERO), 0);
        assert_eq!(q.decode(0), LOGP_ZERO);
    }

    #[test]
    fn quantizer_bins_large_samples() {
        let samples: Vec<f64> = (0..5000).map(|i| -(i as f64) / 1000.0).collect();
        let q = LogPQuantizer::build(&samples);
        assert!(q.num_bins() <= LogPQuantizer::MAX_BINS);
        for v in samples.iter().step_by(97) {
            let err = (q.decode(q.encode(*v)) - v).abs();
            assert!(err < 0.05, "value {} error {}", v, err);
        }
    }

    #[test]
    fn codebook_text_round_trip() {
        let q = LogPQuantizer::build(&[-1.0, -2.5, -0.25]);
        let mut buf = Vec::new();
        q.write(&mut buf).unwrap();
        let mut reader = LineReader::new(&buf[..], "codebook");
        let back = LogPQuantizer::read(&mut reader).unwrap();
        assert_eq!(back.num_bins(), 3);
        assert_eq!(back.decode(q.encode(-2.5)), -2.5);
    }
}
