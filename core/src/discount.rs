// core/src/discount.rs
//
// Count discounting strategies used by backoff estimation. A strategy maps a
// raw count (in the context of its context total and the number of distinct
// observed followers) to the fraction of that count kept as probability
// mass; what is taken away is redistributed through the lower order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, Write};

use crate::counts::{Count, NgramCounts};
use crate::error::{LmError, Result};
use crate::file::LineReader;

pub trait Discount: fmt::Debug + Send + Sync {
    /// Retained fraction of `count`; 0 drops the event, 1 keeps it whole.
    fn discount(&self, count: Count, total: Count, observed: usize) -> f64;

    /// Weight given to the lower-order distribution when interpolating.
    /// `min2`/`min3` are the numbers of followers seen at least 2 and 3 times.
    fn lower_order_weight(&self, _total: Count, _observed: usize, _min2: usize, _min3: usize) -> f64 {
        0.0
    }

    /// True when the strategy leaves every count unchanged.
    fn nodiscount(&self) -> bool {
        false
    }

    fn min_count(&self) -> Count {
        1
    }

    fn interpolate(&self) -> bool {
        false
    }

    fn set_interpolate(&mut self, _on: bool) {}

    /// Fit the strategy's parameters to the `order`-grams of `counts`.
    fn estimate(&mut self, counts: &NgramCounts, order: usize) -> Result<()>;

    /// Rewrite counts before estimation, if the strategy needs different
    /// statistics than raw counts.
    fn prepare_counts(&self, _counts: &mut NgramCounts, _order: usize) {}

    fn write(&self, out: &mut dyn Write) -> Result<()>;

    fn read(&mut self, input: &mut dyn BufRead, name: &str) -> Result<()>;
}

/// Collects `key value...` parameter lines from a discount file.
fn read_params(input: &mut dyn BufRead, name: &str) -> Result<Vec<(usize, String, Vec<String>)>> {
    let mut reader = LineReader::new(input, name);
    let mut params = Vec::new();
    while let Some(line) = reader.next_line()? {
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else { continue };
        params.push((
            reader.line_no(),
            key.to_string(),
            fields.map(str::to_string).collect(),
        ));
    }
    Ok(params)
}

fn param<T: std::str::FromStr>(name: &str, line: usize, key: &str, values: &[String], i: usize) -> Result<T> {
    values
        .get(i)
        .and_then(|v| v.parse::<T>().ok())
        .ok_or_else(|| LmError::format(name, line, format!("bad value for '{}'", key)))
}

fn unknown_key(name: &str, line: usize, key: &str) -> LmError {
    LmError::format(name, line, format!("unknown discount parameter '{}'", key))
}

/// Good-Turing discounting from the count-of-counts histogram.
#[derive(Debug, Clone)]
pub struct GoodTuring {
    min_count: Count,
    max_count: Count,
    /// `coeffs[c]` for `c` in `0..=max_count`.
    coeffs: Vec<f64>,
}

impl GoodTuring {
    pub fn new(min_count: Count, max_count: Count) -> Self {
        Self {
            min_count,
            max_count,
            coeffs: vec![1.0; max_count as usize + 1],
        }
    }

    pub fn max_count(&self) -> Count {
        self.max_count
    }

    pub fn coefficient(&self, count: Count) -> f64 {
        self.coeffs.get(count as usize).copied().unwrap_or(1.0)
    }
}

impl Discount for GoodTuring {
    fn discount(&self, count: Count, _total: Count, _observed: usize) -> f64 {
        if count == 0 {
            1.0
        } else if count < self.min_count {
            0.0
        } else if count > self.max_count {
            1.0
        } else {
            self.coefficient(count)
        }
    }

    fn nodiscount(&self) -> bool {
        self.min_count <= 1 && self.max_count == 0
    }

    fn min_count(&self) -> Count {
        self.min_count
    }

    fn estimate(&mut self, counts: &NgramCounts, order: usize) -> Result<()> {
        let hist = counts.count_of_counts(order, self.max_count as usize + 1);
        let n = |c: Count| hist[c as usize] as f64;

        if hist.get(1).copied().unwrap_or(0) == 0 {
            tracing::warn!(order, "no singleton counts, Good-Turing discounting disabled");
            self.max_count = 0;
            self.coeffs = vec![1.0];
            return Ok(());
        }
        while self.max_count > 0 && hist[self.max_count as usize + 1] == 0 {
            tracing::warn!(
                order,
                count = self.max_count + 1,
                "count of counts is zero, lowering Good-Turing maxcount"
            );
            self.max_count -= 1;
        }
        self.coeffs = vec![1.0; self.max_count as usize + 1];
        if self.max_count == 0 {
            tracing::warn!(order, "Good-Turing discounting disabled");
            return Ok(());
        }

        let k = self.max_count;
        let common = (k + 1) as f64 * n(k + 1) / n(1);
        for c in 1..=k {
            let coeff = if hist[c as usize] == 0 {
                tracing::warn!(order, count = c, "count of counts is zero");
                1.0
            } else {
                let coeff0 = (c + 1) as f64 * n(c + 1) / (c as f64 * n(c));
                let coeff = (coeff0 - common) / (1.0 - common);
                if !coeff.is_finite() || coeff0 <= common || coeff0 > 1.0 {
                    tracing::warn!(order, count = c, coeff0, "discount coefficient out of range, using 1");
                    1.0
                } else {
                    coeff
                }
            };
            self.coeffs[c as usize] = coeff;
        }
        tracing::debug!(order, coeffs = ?self.coeffs, "Good-Turing coefficients");
        Ok(())
    }

    fn write(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "mincount {}", self.min_count)?;
        writeln!(out, "maxcount {}", self.max_count)?;
        for c in 1..=self.max_count {
            writeln!(out, "discount {} {}", c, self.coefficient(c))?;
        }
        Ok(())
    }

    fn read(&mut self, input: &mut dyn BufRead, name: &str) -> Result<()> {
        let (mut min_count, mut max_count) = (self.min_count, self.max_count);
        let mut coeffs = vec![1.0; max_count as usize + 1];
        for (line, key, values) in read_params(input, name)? {
            match key.as_str() {
                "mincount" => min_count = param(name, line, &key, &values, 0)?,
                "maxcount" => {
                    max_count = param(name, line, &key, &values, 0)?;
                    coeffs.resize(max_count as usize + 1, 1.0);
                }
                "discount" => {
                    let c: usize = param(name, line, &key, &values, 0)?;
                    let d: f64 = param(name, line, &key, &values, 1)?;
                    if c == 0 || c >= coeffs.len() || !(0.0..=1.0).contains(&d) {
                        return Err(LmError::format(name, line, format!("discount {} {} out of range", c, d)));
                    }
                    coeffs[c] = d;
                }
                _ => return Err(unknown_key(name, line, &key)),
            }
        }
        self.min_count = min_count;
        self.max_count = max_count;
        self.coeffs = coeffs;
        Ok(())
    }
}

/// Absolute discounting: a fixed amount is subtracted from every count.
#[derive(Debug, Clone)]
pub struct ConstDiscount {
    amount: f64,
    min_count: Count,
    interpolate: bool,
}

impl ConstDiscount {
    pub fn new(amount: f64, min_count: Count) -> Self {
        Self {
            amount: amount.clamp(0.0, 1.0),
            min_count,
            interpolate: false,
        }
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }
}

impl Discount for ConstDiscount {
    fn discount(&self, count: Count, _total: Count, _observed: usize) -> f64 {
        if count == 0 {
            1.0
        } else if count < self.min_count {
            0.0
        } else {
            (count as f64 - self.amount) / count as f64
        }
    }

    fn lower_order_weight(&self, total: Count, observed: usize, _min2: usize, _min3: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        self.amount * observed as f64 / total as f64
    }

    fn nodiscount(&self) -> bool {
        self.min_count <= 1 && self.amount <= 0.0
    }

    fn min_count(&self) -> Count {
        self.min_count
    }

    fn interpolate(&self) -> bool {
        self.interpolate
    }

    fn set_interpolate(&mut self, on: bool) {
        self.interpolate = on;
    }

    fn estimate(&mut self, _counts: &NgramCounts, _order: usize) -> Result<()> {
        Ok(())
    }

    fn write(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "mincount {}", self.min_count)?;
        writeln!(out, "discount {}", self.amount)?;
        Ok(())
    }

    fn read(&mut self, input: &mut dyn BufRead, name: &str) -> Result<()> {
        for (line, key, values) in read_params(input, name)? {
            match key.as_str() {
                "mincount" => self.min_count = param(name, line, &key, &values, 0)?,
                "discount" => {
                    let d: f64 = param(name, line, &key, &values, 0)?;
                    if !(0.0..=1.0).contains(&d) {
                        return Err(LmError::format(name, line, format!("constant discount {} out of range", d)));
                    }
                    self.amount = d;
                }
                _ => return Err(unknown_key(name, line, &key)),
            }
        }
        Ok(())
    }
}

/// Ristad's natural law of succession.
#[derive(Debug, Clone)]
pub struct NaturalDiscount {
    min_count: Count,
    vocab_size: usize,
}

impl NaturalDiscount {
    pub fn new(min_count: Count) -> Self {
        Self {
            min_count,
            vocab_size: 0,
        }
    }
}

impl Discount for NaturalDiscount {
    fn discount(&self, count: Count, total: Count, observed: usize) -> f64 {
        let n = total as f64;
        let q = observed as f64;
        if count == 0 {
            1.0
        } else if count < self.min_count {
            0.0
        } else if observed >= self.vocab_size {
            1.0
        } else {
            (n * (n + 1.0) + q * (1.0 - q)) / (n * (n + 1.0) + 2.0 * q)
        }
    }

    fn min_count(&self) -> Count {
        self.min_count
    }

    fn estimate(&mut self, counts: &NgramCounts, _order: usize) -> Result<()> {
        self.vocab_size = counts.vocab().event_indices().len();
        Ok(())
    }

    fn write(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "mincount {}", self.min_count)?;
        writeln!(out, "vocabsize {}", self.vocab_size)?;
        Ok(())
    }

    fn read(&mut self, input: &mut dyn BufRead, name: &str) -> Result<()> {
        for (line, key, values) in read_params(input, name)? {
            match key.as_str() {
                "mincount" => self.min_count = param(name, line, &key, &values, 0)?,
                "vocabsize" => self.vocab_size = param(name, line, &key, &values, 0)?,
                _ => return Err(unknown_key(name, line, &key)),
            }
        }
        Ok(())
    }
}

/// Witten-Bell: mass for unseen events grows with the number of distinct
/// followers observed.
#[derive(Debug, Clone)]
pub struct WittenBell {
    min_count: Count,
    interpolate: bool,
}

impl WittenBell {
    pub fn new(min_count: Count) -> Self {
        Self {
            min_count,
            interpolate: false,
        }
    }
}

impl Discount for WittenBell {
    fn discount(&self, count: Count, total: Count, observed: usize) -> f64 {
        if count == 0 || total == 0 {
            1.0
        } else if count < self.min_count {
            0.0
        } else {
            total as f64 / (total as f64 + observed as f64)
        }
    }

    fn lower_order_weight(&self, total: Count, observed: usize, _min2: usize, _min3: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        observed as f64 / (total as f64 + observed as f64)
    }

    fn min_count(&self) -> Count {
        self.min_count
    }

    fn interpolate(&self) -> bool {
        self.interpolate
    }

    fn set_interpolate(&mut self, on: bool) {
        self.interpolate = on;
    }

    fn estimate(&mut self, _counts: &NgramCounts, _order: usize) -> Result<()> {
        Ok(())
    }

    fn write(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "mincount {}", self.min_count)?;
        Ok(())
    }

    fn read(&mut self, input: &mut dyn BufRead, name: &str) -> Result<()> {
        for (line, key, values) in read_params(input, name)? {
            match key.as_str() {
                "mincount" => self.min_count = param(name, line, &key, &values, 0)?,
                _ => return Err(unknown_key(name, line, &key)),
            }
        }
        Ok(())
    }
}

/// Kneser-Ney absolute discounting over continuation counts. The modified
/// variant uses separate discounts for counts of 1, 2 and 3 or more.
#[derive(Debug, Clone)]
pub struct KneserNey {
    min_count: Count,
    modified: bool,
    interpolate: bool,
    discounts: [f64; 3],
}

impl KneserNey {
    pub fn new(min_count: Count, modified: bool) -> Self {
        Self {
            min_count,
            modified,
            interpolate: false,
            discounts: [0.0; 3],
        }
    }

    fn amount(&self, count: Count) -> f64 {
        if !self.modified {
            return self.discounts[0];
        }
        match count {
            0 => 0.0,
            1 => self.discounts[0],
            2 => self.discounts[1],
            _ => self.discounts[2],
        }
    }

    pub fn discounts(&self) -> [f64; 3] {
        self.discounts
    }
}

impl Discount for KneserNey {
    fn discount(&self, count: Count, _total: Count, _observed: usize) -> f64 {
        if count == 0 {
            1.0
        } else if count < self.min_count {
            0.0
        } else {
            ((count as f64 - self.amount(count)) / count as f64).max(0.0)
        }
    }

    fn lower_order_weight(&self, total: Count, observed: usize, min2: usize, min3: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let mass = if self.modified {
            self.discounts[0] * observed.saturating_sub(min2) as f64
                + self.discounts[1] * min2.saturating_sub(min3) as f64
                + self.discounts[2] * min3 as f64
        } else {
            self.discounts[0] * observed as f64
        };
        mass / total as f64
    }

    fn min_count(&self) -> Count {
        self.min_count
    }

    fn interpolate(&self) -> bool {
        self.interpolate
    }

    fn set_interpolate(&mut self, on: bool) {
        self.interpolate = on;
    }

    fn estimate(&mut self, counts: &NgramCounts, order: usize) -> Result<()> {
        let hist = counts.count_of_counts(order, 4);
        let n: Vec<f64> = hist.iter().map(|&c| c as f64).collect();
        if n[1] == 0.0 || n[2] == 0.0 || (self.modified && (n[3] == 0.0 || n[4] == 0.0)) {
            return Err(LmError::Estimation(format!(
                "order {}: a count of counts needed for Kneser-Ney is zero",
                order
            )));
        }
        let y = n[1] / (n[1] + 2.0 * n[2]);
        self.discounts = if self.modified {
            [
                1.0 - 2.0 * y * n[2] / n[1],
                2.0 - 3.0 * y * n[3] / n[2],
                3.0 - 4.0 * y * n[4] / n[3],
            ]
        } else {
            [y, y, y]
        };
        if self.discounts.iter().any(|&d| d < 0.0) {
            return Err(LmError::Estimation(format!(
                "order {}: negative Kneser-Ney discount {:?}",
                order, self.discounts
            )));
        }
        tracing::debug!(order, discounts = ?self.discounts, "Kneser-Ney discounts");
        Ok(())
    }

    fn prepare_counts(&self, counts: &mut NgramCounts, order: usize) {
        counts.make_continuation_counts(order);
    }

    fn write(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "mincount {}", self.min_count)?;
        if self.modified {
            writeln!(out, "discount1 {}", self.discounts[0])?;
            writeln!(out, "discount2 {}", self.discounts[1])?;
            writeln!(out, "discount3+ {}", self.discounts[2])?;
        } else {
            writeln!(out, "discount {}", self.discounts[0])?;
        }
        Ok(())
    }

    fn read(&mut self, input: &mut dyn BufRead, name: &str) -> Result<()> {
        let mut next = self.clone();
        for (line, key, values) in read_params(input, name)? {
            let d = || param::<f64>(name, line, &key, &values, 0);
            match key.as_str() {
                "mincount" => next.min_count = param(name, line, &key, &values, 0)?,
                "discount" => {
                    next.modified = false;
                    next.discounts = [d()?; 3];
                }
                "discount1" => {
                    next.modified = true;
                    next.discounts[0] = d()?;
                }
                "discount2" => next.discounts[1] = d()?,
                "discount3+" => next.discounts[2] = d()?,
                _ => return Err(unknown_key(name, line, &key)),
            }
        }
        *self = next;
        Ok(())
    }
}

/// Per-order discounting choice as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum DiscountConfig {
    GoodTuring { min_count: Count, max_count: Count },
    Constant { discount: f64, min_count: Count },
    Natural { min_count: Count },
    WittenBell { min_count: Count },
    KneserNey { min_count: Count, modified: bool },
    /// Maximum likelihood: no discounting at this order.
    None,
}

impl DiscountConfig {
    /// Good-Turing with maxcount 1 for unigrams and 7 above, mincount 1 for
    /// the two lowest orders and 2 above.
    pub fn default_for_order(order: usize) -> Self {
        DiscountConfig::GoodTuring {
            min_count: if order <= 2 { 1 } else { 2 },
            max_count: if order == 1 { 1 } else { 7 },
        }
    }

    pub fn build(&self, interpolate: bool) -> Option<Box<dyn Discount>> {
        let mut d: Box<dyn Discount> = match *self {
            DiscountConfig::GoodTuring { min_count, max_count } => Box::new(GoodTuring::new(min_count, max_count)),
            DiscountConfig::Constant { discount, min_count } => Box::new(ConstDiscount::new(discount, min_count)),
            DiscountConfig::Natural { min_count } => Box::new(NaturalDiscount::new(min_count)),
            DiscountConfig::WittenBell { min_count } => Box::new(WittenBell::new(min_count)),
            DiscountConfig::KneserNey { min_count, modified } => Box::new(KneserNey::new(min_count, modified)),
            DiscountConfig::None => return None,
        };
        d.set_interpolate(interpolate);
        Some(d)
    }
}

/// Fit each order's strategy to `counts`, letting it rewrite the counts it
/// is estimated from first. `discounts[n - 1]` belongs to order `n`.
pub fn estimate_discounts(counts: &mut NgramCounts, discounts: &mut [Option<Box<dyn Discount>>]) -> Result<()> {
    for (i, slot) in discounts.iter_mut().enumerate() {
        let Some(d) = slot else { continue };
        let n = i + 1;
        d.prepare_counts(counts, n);
        d.estimate(counts, n)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::Vocab;

    /// Unigram counts with the given count-of-counts histogram (`hist[c-1]`
    /// words seen `c` times).
    fn counts_with_histogram(hist: &[u64]) -> NgramCounts {
        let mut counts = NgramCounts::new(Vocab::new(), 1);
        let vocab = counts.vocab().clone();
        let mut id = 0;
        for (i, &n) in hist.iter().enumerate() {
            for _ in 0..n {
                let w = vocab.add_word(&format!("w{}", id));
                counts.set(&[w], i as Count + 1);
                id += 1;
            }
        }
        counts
    }

    #[test]
    fn good_turing_is_monotone_on_zipf_counts() {
        let counts = counts_with_histogram(&[500, 167, 83, 50, 33, 24]);
        let mut gt = GoodTuring::new(1, 5);
        gt.estimate(&counts, 1).unwrap();
        assert_eq!(gt.discount(0, 100, 10), 1.0);
        let coeffs: Vec<f64> = (1..=5).map(|c| gt.discount(c, 0, 0)).collect();
        for w in coeffs.windows(2) {
            assert!(w[0] <= w[1], "coefficients not monotone: {:?}", coeffs);
        }
        assert!(coeffs.iter().all(|&d| d > 0.0 && d < 1.0));
        assert!((coeffs[0] - 0.5337).abs() < 1e-3);
        assert_eq!(gt.discount(6, 0, 0), 1.0);
    }

    #[test]
    fn good_turing_clamps_out_of_range_coefficients() {
        // 2 * n2 / n1 = 2 > 1
        let counts = counts_with_histogram(&[10, 10]);
        let mut gt = GoodTuring::new(1, 1);
        gt.estimate(&counts, 1).unwrap();
        assert_eq!(gt.discount(1, 0, 0), 1.0);
    }

    #[test]
    fn good_turing_degrades_max_count() {
        // no words seen 4 times: maxcount 3 -> 2
        let counts = counts_with_histogram(&[40, 20, 10, 0]);
        let mut gt = GoodTuring::new(1, 3);
        gt.estimate(&counts, 1).unwrap();
        assert_eq!(gt.max_count(), 2);

        let counts = counts_with_histogram(&[0, 5, 5]);
        let mut gt = GoodTuring::new(1, 2);
        gt.estimate(&counts, 1).unwrap();
        assert!(gt.nodiscount());
        assert_eq!(gt.discount(2, 0, 0), 1.0);
    }

    #[test]
    fn good_turing_parameter_file_round_trip() {
        let counts = counts_with_histogram(&[500, 167, 83, 50, 33, 24]);
        let mut gt = GoodTuring::new(1, 5);
        gt.estimate(&counts, 1).unwrap();
        let mut buf = Vec::new();
        gt.write(&mut buf).unwrap();

        let mut back = GoodTuring::new(1, 1);
        back.read(&mut &buf[..], "gt1").unwrap();
        assert_eq!(back.max_count(), 5);
        for c in 0..=6 {
            assert_eq!(back.discount(c, 0, 0), gt.discount(c, 0, 0));
        }
    }

    #[test]
    fn malformed_parameter_file_is_a_format_error() {
        let mut gt = GoodTuring::new(1, 1);
        let err = gt.read(&mut "maxcount 3\ndiscount 2 abc\n".as_bytes(), "gt.params").unwrap_err();
        match err {
            LmError::Format { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        let mut wb = WittenBell::new(1);
        assert!(wb.read(&mut "bogus 1\n".as_bytes(), "wb").is_err());
    }

    #[test]
    fn good_turing_rejects_discount_past_max_count() {
        let mut gt = GoodTuring::new(2, 1);
        let err = gt.read(&mut "discount 2 0.5\n".as_bytes(), "gt.params").unwrap_err();
        match err {
            LmError::Format { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected {:?}", other),
        }

        let err = gt
            .read(&mut "mincount 3\nmaxcount 4\ndiscount 5 0.5\n".as_bytes(), "gt.params")
            .unwrap_err();
        assert!(matches!(err, LmError::Format { line: 3, .. }));
        assert_eq!(gt.min_count(), 2);
        assert_eq!(gt.max_count(), 1);
    }

    #[test]
    fn good_turing_reads_discounts_without_max_count_line() {
        let mut gt = GoodTuring::new(1, 5);
        gt.read(&mut "discount 2 0.5\n".as_bytes(), "gt.params").unwrap();
        assert_eq!(gt.max_count(), 5);
        assert_eq!(gt.discount(2, 0, 0), 0.5);
        assert_eq!(gt.discount(3, 0, 0), 1.0);
    }

    #[test]
    fn constant_discount_drops_rare_events() {
        let d = ConstDiscount::new(0.5, 2);
        assert_eq!(d.discount(1, 10, 3), 0.0);
        assert!((d.discount(4, 10, 3) - 0.875).abs() < 1e-12);
        assert!((d.lower_order_weight(10, 3, 0, 0) - 0.15).abs() < 1e-12);
    }

    #[test]
    fn witten_bell_ignores_individual_count() {
        let d = WittenBell::new(1);
        assert_eq!(d.discount(1, 8, 2), d.discount(5, 8, 2));
        assert!((d.discount(1, 8, 2) - 0.8).abs() < 1e-12);
        assert!((d.discount(1, 8, 2) + d.lower_order_weight(8, 2, 0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn natural_discount_is_off_when_vocabulary_is_covered() {
        let counts = counts_with_histogram(&[3]);
        let mut d = NaturalDiscount::new(1);
        d.estimate(&counts, 1).unwrap();
        let vocab_size = counts.vocab().event_indices().len();
        assert_eq!(d.discount(1, 10, vocab_size), 1.0);
        let partial = d.discount(1, 10, 2);
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn kneser_ney_estimates_three_discounts() {
        let counts = counts_with_histogram(&[100, 40, 20, 10]);
        let mut kn = KneserNey::new(1, true);
        kn.estimate(&counts, 1).unwrap();
        let [d1, d2, d3] = kn.discounts();
        assert!(d1 > 0.0 && d1 < 1.0);
        assert!(d2 > d1 && d3 > d2);
        assert!((kn.discount(1, 0, 0) - (1.0 - d1)).abs() < 1e-12);
    }

    #[test]
    fn config_builds_strategies() {
        assert!(DiscountConfig::None.build(false).is_none());
        let d = DiscountConfig::WittenBell { min_count: 1 }.build(true).unwrap();
        assert!(d.interpolate());
        assert_eq!(
            DiscountConfig::default_for_order(3),
            DiscountConfig::GoodTuring { min_count: 2, max_count: 7 }
        );
    }
}
