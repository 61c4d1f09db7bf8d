//! Maximum-likelihood estimation of error-model parameters from paired
//! measurements: either two replicate count tables for the same families,
//! or an observed table paired with a trusted one. The misclassification
//! parameters are fit by repeated Nelder-Mead searches from random starts,
//! maximizing a pairwise multinomial log-likelihood over discordant pairs.

use anyhow::{bail, Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::{BufRead, Write};
use std::path::Path;

use crate::error_model::ErrorModel;
use crate::family::GeneFamily;
use crate::io::estimates::ErrorEstimateFile;
use crate::io::open_reader;
use crate::matrix::SquareMatrix;
use crate::opt::{nelder_mead, Objective, SimplexOptions};
use crate::progress;

#[derive(Debug, Clone)]
pub struct ErrorFitOptions {
    /// Error probability depends only on |offset| when true.
    pub symmetric: bool,
    /// Largest modeled size offset.
    pub max_diff: usize,
    /// Require probabilities to fall monotonically away from offset zero.
    pub peak_zero: bool,
    /// Floor for the largest family size; raised by what the files hold.
    pub max_family_size: usize,
    pub max_runs: usize,
    pub tol: f64,
    pub seed: u64,
    pub progress: bool,
}

impl Default for ErrorFitOptions {
    fn default() -> Self {
        Self {
            symmetric: true,
            max_diff: 2,
            peak_zero: true,
            max_family_size: 0,
            max_runs: 100,
            tol: 1e-9,
            seed: 0,
            progress: false,
        }
    }
}

/// Everything the pairwise objective needs, plus the fit result. Lives
/// only for the duration of an estimation.
#[derive(Debug, Clone)]
pub struct ErrorMeasure {
    pub size_dist: Vec<f64>,
    pub max_family_size: usize,
    /// Discordant pair counts; upper triangular for replicate input,
    /// observed x true for paired-true input.
    pub pairs: Vec<Vec<u64>>,
    pub symmetric: bool,
    pub peak_zero: bool,
    pub param_diff: usize,
    pub param_count: usize,
    /// Winning parameter vector after the multi-start search.
    pub estimates: Vec<f64>,
    /// Winning minimized score (negative log-likelihood).
    pub score: f64,
}

impl ErrorMeasure {
    pub fn new(
        size_dist: Vec<f64>,
        max_family_size: usize,
        pairs: Vec<Vec<u64>>,
        options: &ErrorFitOptions,
    ) -> Self {
        let param_count = if options.symmetric {
            options.max_diff + 1
        } else {
            2 * options.max_diff + 1
        };
        Self {
            size_dist,
            max_family_size,
            pairs,
            symmetric: options.symmetric,
            peak_zero: options.peak_zero,
            param_diff: options.max_diff,
            param_count,
            estimates: vec![0.0; param_count],
            score: f64::INFINITY,
        }
    }

    fn param_for(&self, params: &[f64], offset: i64) -> f64 {
        if self.symmetric {
            params[offset.unsigned_abs() as usize]
        } else {
            params[(self.param_diff as i64 + offset) as usize]
        }
    }

    /// Probability mass left for each unmodeled offset once the explicit
    /// parameters are spent; negative when the parameters oversubscribe
    /// the simplex.
    pub fn marginal_epsilon(&self, params: &[f64]) -> f64 {
        let spent: f64 = if self.symmetric {
            params[0] + 2.0 * params[1..].iter().sum::<f64>()
        } else {
            params.iter().sum()
        };
        let unmodeled =
            (self.max_family_size + 1) as f64 - (2 * self.param_diff + 1) as f64;
        if unmodeled <= 0.0 {
            return -1.0;
        }
        (1.0 - spent) / unmodeled
    }

    /// Materialize a parameter vector as a full error model. Offset mass
    /// that would land outside [0, maxcnt] folds onto the nearest valid
    /// observed size, and each column is normalized so it closes exactly.
    pub fn error_model_from(&self, params: &[f64]) -> ErrorModel {
        let max = self.max_family_size;
        let d = self.param_diff as i64;
        let eps = self.marginal_epsilon(params).max(0.0);
        let mut matrix = SquareMatrix::zeros(max + 1);
        for true_size in 0..=max {
            for observed in 0..=max {
                let offset = observed as i64 - true_size as i64;
                let p = if offset.abs() <= d {
                    self.param_for(params, offset)
                } else {
                    eps
                };
                matrix.set(observed, true_size, p);
            }
            for offset in -d..=d {
                let observed = true_size as i64 + offset;
                if observed < 0 {
                    let p = matrix.get(0, true_size) + self.param_for(params, offset);
                    matrix.set(0, true_size, p);
                } else if observed > max as i64 {
                    let p = matrix.get(max, true_size) + self.param_for(params, offset);
                    matrix.set(max, true_size, p);
                }
            }
            let sum: f64 = (0..=max).map(|i| matrix.get(i, true_size)).sum();
            if sum > 0.0 {
                for observed in 0..=max {
                    matrix.set(observed, true_size, matrix.get(observed, true_size) / sum);
                }
            }
        }
        ErrorModel::new(max, -d, d, matrix)
    }

    /// The fitted model, from the winning parameter vector.
    pub fn to_error_model(&self) -> ErrorModel {
        self.error_model_from(&self.estimates)
    }
}

impl From<&ErrorMeasure> for ErrorEstimateFile {
    fn from(measure: &ErrorMeasure) -> Self {
        Self {
            symmetric: measure.symmetric,
            max_diff: measure.param_diff,
            peak_zero: measure.peak_zero,
            max_family_size: measure.max_family_size,
            score: measure.score,
            parameters: measure.estimates.clone(),
        }
    }
}

/// Fit an error model from two replicate measurements of the same family
/// set, logging every evaluation and run to `log`.
pub fn estimate_error_double_measure(
    log: &mut impl Write,
    path1: &Path,
    path2: &Path,
    options: &ErrorFitOptions,
) -> Result<ErrorMeasure> {
    let mut size_freq = Vec::new();
    let mut max_family_size = options.max_family_size;
    {
        let mut r1 = open_reader(path1)?;
        let mut r2 = open_reader(path2)?;
        read_freq_from_measures(
            r1.as_mut(),
            Some(r2.as_mut()),
            &mut size_freq,
            &mut max_family_size,
        )?;
    }
    let size_dist = size_probability_distribution(&size_freq, max_family_size);

    let mut r1 = open_reader(path1)?;
    let mut r2 = open_reader(path2)?;
    let pairs = count_discordant_pairs(r1.as_mut(), r2.as_mut(), max_family_size)?;

    let mut measure = ErrorMeasure::new(size_dist, max_family_size, pairs, options);
    run_multi_start(&mut measure, log, options, false)?;
    Ok(measure)
}

/// Fit an error model from an observed measurement paired with a trusted
/// ("true") one.
pub fn estimate_error_true_measure(
    log: &mut impl Write,
    observed_path: &Path,
    true_path: &Path,
    options: &ErrorFitOptions,
) -> Result<ErrorMeasure> {
    let mut size_freq = Vec::new();
    let mut max_family_size = options.max_family_size;
    {
        let mut r1 = open_reader(true_path)?;
        let mut r2 = open_reader(observed_path)?;
        read_freq_from_measures(
            r1.as_mut(),
            Some(r2.as_mut()),
            &mut size_freq,
            &mut max_family_size,
        )?;
    }
    let size_dist = size_probability_distribution(&size_freq, max_family_size);

    let mut observed = open_reader(observed_path)?;
    let mut truth = open_reader(true_path)?;
    let pairs = count_true_observed_pairs(observed.as_mut(), truth.as_mut(), max_family_size)?;

    let mut measure = ErrorMeasure::new(size_dist, max_family_size, pairs, options);
    run_multi_start(&mut measure, log, options, true)?;
    Ok(measure)
}

/// Accumulate family-size frequencies across one or two measurement files
/// (header rows skipped), raising `max_family_size` to the largest size
/// seen. The two files must agree on column and line counts.
pub fn read_freq_from_measures(
    reader1: &mut dyn BufRead,
    reader2: Option<&mut dyn BufRead>,
    size_freq: &mut Vec<u64>,
    max_family_size: &mut usize,
) -> Result<()> {
    let mut columns = None;
    let lines1 = count_measure_lines(reader1, size_freq, max_family_size, &mut columns, 1)?;
    if let Some(reader2) = reader2 {
        let mut columns2 = columns;
        let lines2 = count_measure_lines(reader2, size_freq, max_family_size, &mut columns2, 2)?;
        if lines1 != lines2 {
            bail!("the number of lines does not match between the two measure files");
        }
    }
    Ok(())
}

fn count_measure_lines(
    reader: &mut dyn BufRead,
    size_freq: &mut Vec<u64>,
    max_family_size: &mut usize,
    columns: &mut Option<usize>,
    file_no: usize,
) -> Result<usize> {
    let mut lines = reader.lines();
    if lines.next().is_none() {
        bail!("measure file {file_no} is empty");
    }
    let mut n_rows = 0;
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let family = GeneFamily::parse_line(&line)
            .with_context(|| format!("invalid row in measure file {file_no}"))?;
        match columns {
            Some(expected) if *expected != family.counts.len() => {
                bail!("the number of columns does not match between the two measure files");
            }
            Some(_) => {}
            None => *columns = Some(family.counts.len()),
        }
        for &count in &family.counts {
            let count = count as usize;
            if count >= size_freq.len() {
                size_freq.resize(count + 1, 0);
            }
            size_freq[count] += 1;
            *max_family_size = (*max_family_size).max(count);
        }
        n_rows += 1;
    }
    Ok(n_rows)
}

/// Add-one smoothed size distribution over 0 ..= max_family_size.
pub fn size_probability_distribution(size_freq: &[u64], max_family_size: usize) -> Vec<f64> {
    let mut total = 0.0;
    for size in 0..=max_family_size {
        total += (size_freq.get(size).copied().unwrap_or(0) + 1) as f64;
    }
    (0..=max_family_size)
        .map(|size| (size_freq.get(size).copied().unwrap_or(0) + 1) as f64 / total)
        .collect()
}

/// Count replicate pairs line by line (ids must match), then fold the
/// lower triangle into the upper:
/// pairs[j][i] += pairs[i][j]; pairs[i][j] = 0 for j < i.
pub fn count_discordant_pairs(
    reader1: &mut dyn BufRead,
    reader2: &mut dyn BufRead,
    max_family_size: usize,
) -> Result<Vec<Vec<u64>>> {
    let mut pairs = count_pairs(reader1, reader2, max_family_size)?;
    fold_pairs_upper(&mut pairs);
    Ok(pairs)
}

/// Count observed-vs-true pairs, indexed [observed][true]; no fold, the
/// asymmetry is the signal.
pub fn count_true_observed_pairs(
    observed: &mut dyn BufRead,
    truth: &mut dyn BufRead,
    max_family_size: usize,
) -> Result<Vec<Vec<u64>>> {
    count_pairs(observed, truth, max_family_size)
}

fn count_pairs(
    reader1: &mut dyn BufRead,
    reader2: &mut dyn BufRead,
    max_family_size: usize,
) -> Result<Vec<Vec<u64>>> {
    let mut lines1 = reader1.lines();
    let mut lines2 = reader2.lines();
    if lines1.next().is_none() {
        bail!("measure file 1 is empty");
    }
    if lines2.next().is_none() {
        bail!("measure file 2 is empty");
    }

    let mut pairs = vec![vec![0u64; max_family_size + 1]; max_family_size + 1];
    loop {
        let line1 = match lines1.next() {
            Some(line) => line?,
            None => break,
        };
        let line2 = match lines2.next() {
            Some(line) => line?,
            None => break,
        };
        if line1.trim().is_empty() && line2.trim().is_empty() {
            continue;
        }
        let family1 = GeneFamily::parse_line(&line1)?;
        let family2 = GeneFamily::parse_line(&line2)?;
        if family1.id != family2.id {
            bail!(
                "family ids do not match between the two measure files: '{}' vs '{}'",
                family1.id,
                family2.id
            );
        }
        for (&v1, &v2) in family1.counts.iter().zip(family2.counts.iter()) {
            let (v1, v2) = (v1 as usize, v2 as usize);
            if v1 > max_family_size || v2 > max_family_size {
                bail!("family count exceeds the maximum family size {max_family_size}");
            }
            pairs[v1][v2] += 1;
        }
    }
    Ok(pairs)
}

/// Merge (i, j) and (j, i) counts into the upper triangle.
pub fn fold_pairs_upper(pairs: &mut [Vec<u64>]) {
    for i in 0..pairs.len() {
        for j in 0..i {
            pairs[j][i] += pairs[i][j];
            pairs[i][j] = 0;
        }
    }
}

struct PairObjective<'a, W: Write> {
    measure: &'a ErrorMeasure,
    log: &'a mut W,
    paired_true: bool,
}

impl<W: Write> Objective for PairObjective<'_, W> {
    fn evaluate(&mut self, params: &[f64]) -> f64 {
        let score = pair_log_likelihood(self.measure, params, self.paired_true, &mut *self.log);
        -score
    }
}

/// Pairwise multinomial log-likelihood of a candidate parameter vector;
/// -inf for vectors outside the admissible region, so the simplex search
/// self-corrects instead of erroring.
fn pair_log_likelihood(
    measure: &ErrorMeasure,
    params: &[f64],
    paired_true: bool,
    log: &mut impl Write,
) -> f64 {
    let epsilon = measure.marginal_epsilon(params);
    let mut score = 0.0;
    let mut rejected = params
        .iter()
        .any(|&p| p < 0.0 || epsilon < 0.0 || epsilon > p);
    if !rejected && measure.peak_zero {
        rejected = violates_peak_zero(measure, params);
    }

    if rejected {
        score = 0f64.ln();
    } else {
        let model = measure.error_model_from(params);
        let max = measure.max_family_size;
        if paired_true {
            'rows: for observed in 0..=max {
                for true_size in 0..=max {
                    if measure.pairs[observed][true_size] == 0 {
                        continue;
                    }
                    let joint =
                        measure.size_dist[true_size] * model.probability(observed, true_size);
                    score += measure.pairs[observed][true_size] as f64 * joint.ln();
                    if !score.is_finite() {
                        let _ = writeln!(log, "score: {score}");
                        break 'rows;
                    }
                }
            }
            let prob00 = measure.size_dist[0] * model.probability(0, 0);
            score -= (1.0 - prob00).ln();
        } else {
            'pairs: for i in 0..=max {
                for j in i..=max {
                    if measure.pairs[i][j] == 0 {
                        continue;
                    }
                    let mut discord = 0.0;
                    for k in 0..=max {
                        let weight = if i == j { 1.0 } else { 2.0 };
                        discord += weight
                            * measure.size_dist[k]
                            * model.probability(i, k)
                            * model.probability(j, k);
                    }
                    score += measure.pairs[i][j] as f64 * discord.ln();
                    if !score.is_finite() {
                        let _ = writeln!(log, "score: {score}");
                        break 'pairs;
                    }
                }
            }
            let mut prob00 = 0.0;
            for k in 0..=max {
                let p0k = model.probability(0, k);
                prob00 += measure.size_dist[k] * p0k * p0k;
            }
            score -= (1.0 - prob00).ln();
        }
    }

    let joined = params
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(log, "\tparameters: {joined} & score: {score}");
    score
}

fn violates_peak_zero(measure: &ErrorMeasure, params: &[f64]) -> bool {
    if measure.symmetric {
        params.windows(2).any(|w| w[0] < w[1])
    } else {
        let d = measure.param_diff;
        let mut previous = params[d];
        for i in 1..=d {
            if previous < params[d - i] {
                return true;
            }
            previous = params[d - i];
        }
        previous = params[d];
        for i in 1..=d {
            if previous < params[d + i] {
                return true;
            }
            previous = params[d + i];
        }
        false
    }
}

/// Up to `max_runs` Nelder-Mead searches from random starts; converged
/// when two consecutive completed runs land within `tol` of each other.
/// The first completed run only seeds the best score.
fn run_multi_start(
    measure: &mut ErrorMeasure,
    log: &mut impl Write,
    options: &ErrorFitOptions,
    paired_true: bool,
) -> Result<()> {
    let n = measure.param_count;
    let mut rng = SmallRng::seed_from_u64(options.seed);
    let simplex = SimplexOptions {
        tolx: options.tol,
        tolf: options.tol,
        max_iters: None,
    };
    let bar = options
        .progress
        .then(|| progress::bar(options.max_runs as u64, "errest", "fitting"));

    let mut minscore = f64::INFINITY;
    let mut best = vec![0.0; n];
    let mut runs = 0usize;
    let mut converged = false;
    for _ in 0..options.max_runs {
        let start = initial_parameters(&mut rng, measure);
        let result = {
            let mut objective = PairObjective {
                measure,
                log: &mut *log,
                paired_true,
            };
            nelder_mead(&mut objective, &start, &simplex)
        };
        writeln!(log)?;
        writeln!(
            log,
            "misclassification matrix search result: ({} iterations)",
            result.iters
        )?;
        writeln!(log, "score: {}", result.fval)?;

        if runs > 0
            && result.converged
            && result.fval.is_finite()
            && (minscore - result.fval).abs() < options.tol
        {
            converged = true;
        }
        if result.converged {
            if result.fval < minscore {
                minscore = result.fval;
                best.copy_from_slice(&result.x);
            }
            runs += 1;
        }
        if let Some(bar) = &bar {
            bar.inc(1);
        }
        if converged {
            break;
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    if converged {
        writeln!(log, "score converged in {runs} runs.")?;
    } else {
        writeln!(log, "score failed to converge in {} runs.", options.max_runs)?;
        writeln!(log, "best score: {minscore}")?;
    }
    measure.estimates = best;
    measure.score = minscore;
    Ok(())
}

/// Sorted uniform randoms arranged largest-first from offset zero: strictly
/// descending for symmetric fits, alternating down the two arms otherwise.
fn initial_parameters(rng: &mut SmallRng, measure: &ErrorMeasure) -> Vec<f64> {
    let n = measure.param_count;
    let mut sorted: Vec<f64> = (0..n).map(|_| rng.gen::<f64>() / n as f64).collect();
    sorted.sort_by(f64::total_cmp);

    let mut params = vec![0.0; n];
    if measure.symmetric {
        for (slot, &value) in params.iter_mut().zip(sorted.iter().rev()) {
            *slot = value;
        }
    } else {
        let d = measure.param_diff;
        let mut next = n;
        next -= 1;
        params[d] = sorted[next];
        for i in 1..=d {
            next -= 1;
            params[d - i] = sorted[next];
            next -= 1;
            params[d + i] = sorted[next];
        }
    }
    params
}
