use std::fmt;
use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;

use crate::sampler::{Mode, Summary};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

const DECIMAL: [&str; 8] = ["k", "M", "G", "T", "P", "E", "Z", "Y"];
const BINARY: [&str; 8] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi", "Yi"];

/// A number scaled down to an SI (or IEC, when `binary`) prefix.
///
/// Precision flags pass through to the scaled value: `{:.2}` renders
/// `12.35 M`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SiNumber {
    pub value: f64,
    pub prefix: &'static str,
}

impl SiNumber {
    pub fn new(n: f64, binary: bool) -> Self {
        let (divisor, prefixes) = if binary { (1024.0, &BINARY) } else { (1000.0, &DECIMAL) };
        let mut value = n;
        let mut prefix = "";
        for p in prefixes.iter() {
            if value < divisor {
                break;
            }
            value /= divisor;
            prefix = p;
        }
        Self { value, prefix }
    }

    pub fn decimal(n: f64) -> Self {
        Self::new(n, false)
    }

    pub fn binary(n: f64) -> Self {
        Self::new(n, true)
    }
}

impl fmt::Display for SiNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match f.precision() {
            Some(p) => write!(f, "{:.*} {}", p, self.value, self.prefix),
            None => write!(f, "{} {}", self.value, self.prefix),
        }
    }
}

/// Human readable lines for one finished test.
pub fn summary_lines(summary: &Summary) -> Vec<String> {
    let (label, verb) = match summary.mode {
        Mode::Download => ("Download", "received"),
        Mode::Upload => ("Upload", "sent"),
    };
    let mut lines = vec![format!(
        "{label} speed: {:.2}b/s, {:.2}B {verb} in {:.2?} ({} samples, {} requests)",
        SiNumber::decimal(summary.rate_bps),
        SiNumber::binary(summary.bytes as f64),
        summary.duration,
        summary.samples,
        summary.requests,
    )];
    if let (Some(stdev), Some(min), Some(max)) = (summary.stdev_bps, summary.min_bps, summary.max_bps) {
        let ratio = if summary.rate_bps > 0.0 { stdev / summary.rate_bps * 100.0 } else { 0.0 };
        lines.push(format!(
            "Standard deviation: {:.2}b/s ({ratio:.1}%), lowest {:.2}b/s, highest {:.2}b/s",
            SiNumber::decimal(stdev),
            SiNumber::decimal(min),
            SiNumber::decimal(max),
        ));
    }
    lines
}

pub fn write_summaries<W: Write>(out: &mut W, summaries: &[Summary], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for summary in summaries {
                for line in summary_lines(summary) {
                    writeln!(out, "{line}")?;
                }
            }
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, summaries)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn summary(samples: usize, stdev: Option<f64>) -> Summary {
        Summary {
            mode: Mode::Download,
            rate_bps: 80_000_000.0,
            bytes: 100_000_000,
            samples,
            requests: samples as u64 + 2,
            duration: Duration::from_secs(11),
            mean_elapsed: Duration::from_secs(1),
            stdev_bps: stdev,
            min_bps: stdev.map(|_| 79_000_000.0),
            max_bps: stdev.map(|_| 81_000_000.0),
        }
    }

    #[test]
    fn si_prefixes() {
        assert_eq!(format!("{:.2}", SiNumber::decimal(999.0)), "999.00 ");
        assert_eq!(format!("{:.2}", SiNumber::decimal(80_000_000.0)), "80.00 M");
        assert_eq!(format!("{:.1}", SiNumber::decimal(1_500.0)), "1.5 k");
        assert_eq!(format!("{:.2}", SiNumber::binary(1_048_576.0)), "1.00 Mi");
        assert_eq!(format!("{:.0}", SiNumber::binary(1023.0)), "1023 ");
        assert_eq!(SiNumber::decimal(1e30).prefix, "Y");
    }

    #[test]
    fn text_summary_with_spread() {
        let lines = summary_lines(&summary(10, Some(800_000.0)));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Download speed: 80.00 Mb/s, 95.37 MiB received"), "{}", lines[0]);
        assert!(lines[1].contains("(1.0%)"), "{}", lines[1]);
        assert!(lines[1].contains("lowest 79.00 Mb/s, highest 81.00 Mb/s"));
    }

    #[test]
    fn text_summary_omits_spread_for_single_sample() {
        let lines = summary_lines(&summary(1, None));
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn json_output_is_an_array() {
        let mut out = Vec::new();
        write_summaries(&mut out, &[summary(3, Some(1.0))], OutputFormat::Json).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v[0]["mode"], "download");
        assert_eq!(v[0]["duration_secs"], 11.0);
    }
}
