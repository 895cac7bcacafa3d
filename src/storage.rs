//! Text output files, one per chain, plus the verbosity-gated
//! diagnostic logs.
//!
//! Each chain appends one tab-separated row per retained iteration to
//! its own file, preceded by a header block with the run metadata. The
//! final row of a file is everything a resumed run needs: the iteration
//! index and the varying parameter columns.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::chain::ChainState;
use crate::model::Detector;
use crate::params::ParameterVector;

/// Run metadata echoed into every chain's header block.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub n_iter: u64,
    pub seed: u64,
    pub n_temps: usize,
    pub null_likelihood: f64,
    pub detectors: Vec<Detector>,
    pub output_snrs: bool,
    pub record_timestamps: bool,
}

impl RunInfo {
    fn network_snr(&self) -> f64 {
        self.detectors
            .iter()
            .map(|d| d.snr * d.snr)
            .sum::<f64>()
            .sqrt()
    }
}

/// Output file of chain `chain_id` for a run seeded with `seed`.
pub fn chain_output_path(dir: &Path, seed: u64, chain_id: usize) -> PathBuf {
    dir.join(format!("ptmcmc.output.{seed}.{chain_id:02}"))
}

/// Adaptation-diagnostics file of one chain.
pub fn stat_path(dir: &Path, seed: u64, chain_id: usize) -> PathBuf {
    dir.join(format!("ptmcmc.statistics.{seed}.{chain_id:02}"))
}

/// Swap-diagnostics file of one rank.
pub fn swap_path(dir: &Path, seed: u64, rank: usize) -> PathBuf {
    dir.join(format!("ptmcmc.tempswaps.{seed}.{rank:02}"))
}

/// Append-only writer for one chain's sample record.
pub struct ChainWriter {
    writer: BufWriter<File>,
    detector_nulls: Vec<f64>,
    output_snrs: bool,
    record_timestamps: bool,
}

impl ChainWriter {
    /// Create the file, write the header block and the starting state.
    pub fn create(path: &Path, run: &RunInfo, chain: &ChainState) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating chain output file {}", path.display()))?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            detector_nulls: run.detectors.iter().map(|d| d.null_log_likelihood).collect(),
            output_snrs: run.output_snrs,
            record_timestamps: run.record_timestamps,
        };
        writer.write_header(run, chain)?;
        writer.record(chain, 0, run.record_timestamps.then_some(0.0))?;
        Ok(writer)
    }

    /// Reopen an existing file for appending after a resume.
    pub fn append(path: &Path, run: &RunInfo) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("reopening chain output file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            detector_nulls: run.detectors.iter().map(|d| d.null_log_likelihood).collect(),
            output_snrs: run.output_snrs,
            record_timestamps: run.record_timestamps,
        })
    }

    fn write_header(&mut self, run: &RunInfo, chain: &ChainState) -> Result<()> {
        let out = &mut self.writer;
        writeln!(out, "ptmcmc-rs version:{}", env!("CARGO_PKG_VERSION"))?;

        writeln!(
            out,
            "{:>10}  {:>6}  {:>20}  {:>6}  {:>6}  {:>10}  {:>12}  {:>8}",
            "nIter", "seed", "null_likelihood", "Ndet", "nTemps", "Tchain", "NetworkSNR", "Npar"
        )?;
        writeln!(
            out,
            "{:>10}  {:>6}  {:>20.10}  {:>6}  {:>6}  {:>10.1}  {:>12.6}  {:>8}",
            run.n_iter,
            run.seed,
            run.null_likelihood,
            run.detectors.len(),
            run.n_temps,
            chain.temperature,
            run.network_snr(),
            chain.params.schema().varying_count(),
        )?;

        writeln!(
            out,
            "\n{:>16}  {:>16}  {:>10}  {:>10}  {:>20}  {:>15}  {:>12}",
            "Detector", "SNR", "f_low", "f_high", "Sample_start", "Sample_length", "Sample_rate"
        )?;
        for det in &run.detectors {
            writeln!(
                out,
                "{:>16}  {:>16.8}  {:>10.2}  {:>10.2}  {:>20.8}  {:>15.7}  {:>12.1}",
                det.name,
                det.snr,
                det.f_low,
                det.f_high,
                det.sample_start,
                det.sample_length,
                det.sample_rate
            )?;
        }

        write!(out, "\ncycle\tlogpost\tlogprior\t")?;
        for name in chain.params.schema().varying_names() {
            write!(out, "{name}\t")?;
        }
        write!(out, "logl\tdeltalogl\t")?;
        for det in &run.detectors {
            write!(out, "logl{}\t", det.name)?;
        }
        if self.output_snrs {
            for det in &run.detectors {
                write!(out, "SNR{}\t", det.name)?;
            }
            write!(out, "SNR\t")?;
        }
        if self.record_timestamps {
            write!(out, "timestamp\t")?;
        }
        writeln!(out)?;
        Ok(())
    }

    /// Append one sample row and flush, so the file always ends in a
    /// complete row a resume can parse.
    pub fn record(&mut self, chain: &ChainState, cycle: u64, timestamp: Option<f64>) -> Result<()> {
        let out = &mut self.writer;
        let delta = chain.log_likelihood - chain.null_likelihood;
        write!(out, "{cycle}\t{:.6}\t{:.6}\t", delta + chain.log_prior, chain.log_prior)?;
        for value in chain.params.varying() {
            write!(out, "{value:.6}\t")?;
        }
        write!(out, "{:.6}\t{delta:.6}\t", chain.log_likelihood)?;
        for (index, null) in self.detector_nulls.iter().enumerate() {
            let logl = chain
                .detector_log_likelihoods
                .get(index)
                .copied()
                .unwrap_or(f64::NAN);
            write!(out, "{:.6}\t", logl - null)?;
        }
        if self.output_snrs {
            for index in 0..self.detector_nulls.len() {
                let snr = chain.detector_snrs.get(index).copied().unwrap_or(f64::NAN);
                write!(out, "{snr:.6}\t")?;
            }
            write!(out, "{:.6}\t", chain.network_snr)?;
        }
        if let Some(timestamp) = timestamp {
            write!(out, "{timestamp:.6}\t")?;
        }
        writeln!(out)?;
        out.flush().context("flushing chain output")?;
        Ok(())
    }
}

/// Read the final complete row of a chain output file, restore the
/// varying parameters into `params`, and return the iteration index.
pub fn resume_read(path: &Path, params: &mut ParameterVector) -> Result<u64> {
    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .with_context(|| format!("reading resume file {}", path.display()))?;

    let last_line = contents
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .context("resume file holds no rows")?;

    let fields: Vec<&str> = last_line.split_whitespace().collect();
    let n_varying = params.schema().varying_count();
    if fields.len() < 3 + n_varying + 2 {
        bail!(
            "final row of {} has {} columns, expected at least {}",
            path.display(),
            fields.len(),
            3 + n_varying + 2
        );
    }

    let cycle: u64 = fields[0]
        .parse()
        .with_context(|| format!("parsing iteration index from {:?}", fields[0]))?;
    let mut varying = Vec::with_capacity(n_varying);
    for field in &fields[3..3 + n_varying] {
        varying.push(
            field
                .parse::<f64>()
                .with_context(|| format!("parsing parameter column {field:?}"))?,
        );
    }
    params.set_varying(&varying);
    Ok(cycle)
}

/// Adaptation diagnostics: proposal scale and per-dimension acceptance
/// ratios, one row per retained iteration while adapting.
pub struct StatWriter {
    writer: BufWriter<File>,
}

impl StatWriter {
    pub fn create(path: &Path, chain: &ChainState) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating statistics file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        write!(writer, "cycle\ts_gamma")?;
        for name in chain.params.schema().varying_names() {
            write!(writer, "\tsigma_{name}")?;
        }
        for name in chain.params.schema().varying_names() {
            write!(writer, "\tpaccept_{name}")?;
        }
        writeln!(writer)?;
        Ok(Self { writer })
    }

    pub fn record(&mut self, cycle: u64, chain: &ChainState) -> Result<()> {
        let out = &mut self.writer;
        write!(out, "{cycle}\t{:.6}", chain.proposal.s_gamma.unwrap_or(0.0))?;
        for sigma in &chain.proposal.sigma {
            write!(out, "\t{sigma:.6}")?;
        }
        for dim in 0..chain.proposal.sigma.len() {
            write!(out, "\t{:.6}", chain.proposal.acceptance_ratio(dim))?;
        }
        writeln!(out)?;
        out.flush().context("flushing statistics output")?;
        Ok(())
    }
}

/// Swap diagnostics: one row per swap attempt decided on this rank.
pub struct SwapWriter {
    writer: BufWriter<File>,
}

impl SwapWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating swap file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "cycle\tlow_temp\thigh_temp\tlog_swap\tlow_temp_likelihood\thigh_temp_likelihood\tswap_accepted"
        )?;
        Ok(Self { writer })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        cycle: u64,
        cold_temp: f64,
        hot_temp: f64,
        log_swap: f64,
        cold_ll: f64,
        hot_ll: f64,
        accepted: bool,
    ) -> Result<()> {
        writeln!(
            self.writer,
            "{cycle}\t{cold_temp:.6}\t{hot_temp:.6}\t{log_swap:.6}\t{cold_ll:.6}\t{hot_ll:.6}\t{}",
            accepted as u8
        )?;
        self.writer.flush().context("flushing swap output")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::params::{ParameterSchema, ParameterVector, VaryType};
    use approx::assert_relative_eq;

    fn run_info() -> RunInfo {
        RunInfo {
            n_iter: 1000,
            seed: 7,
            n_temps: 4,
            null_likelihood: -12.5,
            detectors: vec![Detector {
                name: "H1".into(),
                snr: 8.0,
                null_log_likelihood: -6.0,
                f_low: 20.0,
                f_high: 2048.0,
                sample_start: 0.0,
                sample_length: 8.0,
                sample_rate: 4096.0,
            }],
            output_snrs: false,
            record_timestamps: false,
        }
    }

    fn chain() -> ChainState {
        let schema = Arc::new(
            ParameterSchema::new()
                .with("mass", VaryType::Varying)
                .with("f_ref", VaryType::Fixed)
                .with("distance", VaryType::Varying),
        );
        let params = ParameterVector::from_values(schema, &[1.25, 100.0, 400.0]);
        let mut chain = ChainState::new(0, 1.0, params, 1);
        chain.log_likelihood = -10.0;
        chain.log_prior = -1.0;
        chain.null_likelihood = -12.5;
        chain.detector_log_likelihoods = vec![-5.5];
        chain
    }

    #[test]
    fn header_lists_varying_columns_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = chain_output_path(dir.path(), 7, 0);
        let state = chain();
        ChainWriter::create(&path, &run_info(), &state).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let header = contents
            .lines()
            .find(|line| line.starts_with("cycle"))
            .unwrap();
        assert_eq!(
            header.trim_end(),
            "cycle\tlogpost\tlogprior\tmass\tdistance\tlogl\tdeltalogl\tloglH1"
        );
        // The starting state is the first data row.
        let first_row = contents.lines().last().unwrap();
        assert!(first_row.starts_with("0\t"));
    }

    #[test]
    fn rows_resume_to_the_last_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = chain_output_path(dir.path(), 7, 0);
        let mut state = chain();
        let mut writer = ChainWriter::create(&path, &run_info(), &state).unwrap();

        state.params.set(0, 2.5);
        state.params.set(2, 350.0);
        state.log_likelihood = -9.0;
        writer.record(&state, 100, None).unwrap();
        state.params.set(0, 3.75);
        writer.record(&state, 200, None).unwrap();
        drop(writer);

        let mut restored = ParameterVector::zeros(state.params.schema().clone());
        let cycle = resume_read(&path, &mut restored).unwrap();
        assert_eq!(cycle, 200);
        assert_relative_eq!(restored.get(0), 3.75);
        assert_relative_eq!(restored.get(2), 350.0);
        // Fixed dimensions are not part of the record.
        assert_relative_eq!(restored.get(1), 0.0);
    }

    #[test]
    fn optional_columns_follow_the_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = chain_output_path(dir.path(), 8, 1);
        let mut info = run_info();
        info.output_snrs = true;
        info.record_timestamps = true;

        let mut state = chain();
        state.detector_snrs = vec![7.5];
        state.network_snr = 7.5;
        let mut writer = ChainWriter::create(&path, &info, &state).unwrap();
        writer.record(&state, 100, Some(12.25)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let header = contents
            .lines()
            .find(|line| line.starts_with("cycle"))
            .unwrap();
        assert!(header.contains("SNRH1\tSNR\ttimestamp"));
        let row = contents.lines().last().unwrap();
        assert!(row.ends_with("12.250000\t"));
    }

    #[test]
    fn swap_rows_are_tab_separated() {
        let dir = tempfile::tempdir().unwrap();
        let path = swap_path(dir.path(), 7, 0);
        let mut writer = SwapWriter::create(&path).unwrap();
        writer.record(10, 1.0, 2.0, 2.5, -10.0, -5.0, true).unwrap();
        drop(writer);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("cycle\t"));
        assert_eq!(
            lines.next().unwrap(),
            "10\t1.000000\t2.000000\t2.500000\t-10.000000\t-5.000000\t1"
        );
    }

    #[test]
    fn stat_rows_track_the_proposal_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = stat_path(dir.path(), 7, 0);
        let mut state = chain();
        state.proposal.s_gamma = Some(0.5);
        state.proposal.sigma = vec![0.2, 0.4];
        state.proposal.proposed = vec![10, 4];
        state.proposal.accepted = vec![5, 1];

        let mut writer = StatWriter::create(&path, &state).unwrap();
        writer.record(50, &state).unwrap();
        drop(writer);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "cycle\ts_gamma\tsigma_mass\tsigma_distance\tpaccept_mass\tpaccept_distance"
        );
        assert_eq!(
            lines.next().unwrap(),
            "50\t0.500000\t0.200000\t0.400000\t0.500000\t0.250000"
        );
    }
}
