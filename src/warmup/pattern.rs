//! The allocation-size histogram persisted between runs.
//!
//! File format, plain text:
//!
//! ```text
//! <ALIGN> <HASH_SIZE>
//! <f0> <f1> ... <f9>
//! <f10> ...
//! ```
//!
//! One fraction per exact-fit class with twelve decimals, ten per line.
//! A fraction is that class's share of all requested bytes, headers
//! included, so the fractions of a healthy file sum to one.

use crate::error::PatternError;
use crate::fragment::FRAG_OVERHEAD;
use crate::size_class::{ALIGN, HASH_SIZE, LINEAR_HASH_SIZE};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const PER_LINE: usize = 10;

/// How far the fraction sum may drift from one before it is reported.
const SUM_TOLERANCE: f64 = 0.01;

/// Per-class share of requested bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    fractions: Vec<f64>,
}

impl Pattern {
    /// Builds a pattern from per-class request counts.
    ///
    /// Each class is weighted by its payload plus header size. All-zero
    /// counts produce an all-zero pattern.
    pub fn from_usage(counts: &[u64]) -> Self {
        let weight = |class: usize, count: u64| count as f64 * (class * ALIGN + FRAG_OVERHEAD) as f64;
        let mut fractions = vec![0.0; LINEAR_HASH_SIZE];
        let total: f64 = counts.iter().take(LINEAR_HASH_SIZE).enumerate().map(|(c, &n)| weight(c, n)).sum();
        if total > 0.0 {
            for (class, &count) in counts.iter().take(LINEAR_HASH_SIZE).enumerate() {
                fractions[class] = weight(class, count) / total;
            }
        }
        Self { fractions }
    }

    /// Wraps explicit fractions. Requires one finite, non-negative value
    /// per exact-fit class.
    pub fn from_fractions(fractions: Vec<f64>) -> Option<Self> {
        let valid = fractions.len() == LINEAR_HASH_SIZE && fractions.iter().all(|f| f.is_finite() && *f >= 0.0);
        valid.then_some(Self { fractions })
    }

    /// One fraction per exact-fit class.
    pub fn fractions(&self) -> &[f64] {
        &self.fractions
    }

    /// Sum of all fractions.
    pub fn sum(&self) -> f64 {
        self.fractions.iter().sum()
    }

    /// Whether the fractions sum to one within tolerance.
    pub fn is_balanced(&self) -> bool {
        (self.sum() - 1.0).abs() <= SUM_TOLERANCE
    }

    /// Text form of the pattern.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(LINEAR_HASH_SIZE * 16);
        let _ = writeln!(out, "{ALIGN} {HASH_SIZE}");
        for (i, fraction) in self.fractions.iter().enumerate() {
            let _ = write!(out, "{fraction:.12} ");
            if (i + 1) % PER_LINE == 0 {
                out.push('\n');
            }
        }
        if self.fractions.len() % PER_LINE != 0 {
            out.push('\n');
        }
        out
    }

    /// Writes the pattern to `path`, replacing any previous file.
    pub fn save(&self, path: &Path) -> Result<(), PatternError> {
        fs::write(path, self.render()).map_err(|source| PatternError::Io { path: path.to_path_buf(), source })?;
        let sum = self.sum();
        if !self.is_balanced() {
            warn!(path = %path.display(), sum, "memory pattern fractions do not sum to one");
        }
        info!(path = %path.display(), sum, "updated memory pattern file");
        Ok(())
    }

    /// Parses the text form. `path` is only used in errors.
    ///
    /// A malformed or mismatched header is a [`PatternError::Format`]; any
    /// bad, negative or missing fraction after a valid header is a
    /// [`PatternError::Corruption`].
    pub fn parse(text: &str, path: &Path) -> Result<Self, PatternError> {
        let (header, body) = text.split_once('\n').unwrap_or((text, ""));
        let format = |reason: String| PatternError::Format { path: path.to_path_buf(), reason };

        let fields: Vec<&str> = header.split_whitespace().collect();
        let [align, hash_size] = fields.as_slice() else {
            return Err(format(format!("malformed header {header:?}")));
        };
        let (Ok(align), Ok(hash_size)) = (align.parse::<usize>(), hash_size.parse::<usize>()) else {
            return Err(format(format!("malformed header {header:?}")));
        };
        if align != ALIGN || hash_size != HASH_SIZE {
            return Err(format(format!(
                "written for alignment {align} and {hash_size} buckets, this build uses {ALIGN} and {HASH_SIZE}"
            )));
        }

        let mut tokens = body.split_whitespace();
        let mut fractions = Vec::with_capacity(LINEAR_HASH_SIZE);
        for index in 0..LINEAR_HASH_SIZE {
            let token = tokens.next().unwrap_or("");
            match token.parse::<f64>() {
                Ok(f) if f.is_finite() && f >= 0.0 => fractions.push(f),
                _ => {
                    return Err(PatternError::Corruption {
                        path: path.to_path_buf(),
                        index,
                        token: token.to_string(),
                    })
                }
            }
        }
        Ok(Self { fractions })
    }

    /// Reads and parses the pattern file at `path`.
    pub fn load(path: &Path) -> Result<Self, PatternError> {
        let text = fs::read_to_string(path).map_err(|source| PatternError::Io { path: path.to_path_buf(), source })?;
        let pattern = Self::parse(&text, path)?;
        if !pattern.is_balanced() {
            warn!(path = %path.display(), sum = pattern.sum(), "memory pattern fractions do not sum to one");
        }
        Ok(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn counts(pairs: &[(usize, u64)]) -> Vec<u64> {
        let mut counts = vec![0; LINEAR_HASH_SIZE];
        for &(class, n) in pairs {
            counts[class] = n;
        }
        counts
    }

    #[test]
    fn test_from_usage_weights_by_size() {
        let pattern = Pattern::from_usage(&counts(&[(2, 10), (4, 10)]));
        let w2 = 10.0 * (16 + FRAG_OVERHEAD) as f64;
        let w4 = 10.0 * (32 + FRAG_OVERHEAD) as f64;
        assert!((pattern.fractions()[2] - w2 / (w2 + w4)).abs() < 1e-12);
        assert!((pattern.fractions()[4] - w4 / (w2 + w4)).abs() < 1e-12);
        assert!(pattern.is_balanced());
    }

    #[test]
    fn test_empty_usage_is_all_zero() {
        let pattern = Pattern::from_usage(&[]);
        assert_eq!(pattern.fractions().len(), LINEAR_HASH_SIZE);
        assert_eq!(pattern.sum(), 0.0);
        assert!(!pattern.is_balanced());
    }

    #[test]
    fn test_render_layout() {
        let text = Pattern::from_usage(&counts(&[(1, 1)])).render();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(format!("{ALIGN} {HASH_SIZE}").as_str()));
        let first = lines.next().unwrap();
        assert_eq!(first.split_whitespace().count(), PER_LINE);
        assert!(first.starts_with("0.000000000000 1.000000000000 "));
        assert_eq!(text.lines().count(), 1 + LINEAR_HASH_SIZE.div_ceil(PER_LINE));
    }

    #[test]
    fn test_parse_rendered() {
        let pattern = Pattern::from_usage(&counts(&[(3, 7), (100, 2), (2047, 1)]));
        let parsed = Pattern::parse(&pattern.render(), Path::new("p")).unwrap();
        for (a, b) in pattern.fractions().iter().zip(parsed.fractions()) {
            assert!((a - b).abs() < 1e-11);
        }
    }

    #[test]
    fn test_parse_rejects_other_build() {
        let err = Pattern::parse("16 2100\n0.5 0.5\n", Path::new("p")).unwrap_err();
        assert!(matches!(err, PatternError::Format { .. }));
        let err = Pattern::parse("garbage\n", Path::new("p")).unwrap_err();
        assert!(matches!(err, PatternError::Format { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_parse_reports_corrupt_entry() {
        let mut text = Pattern::from_usage(&counts(&[(1, 1)])).render();
        text = text.replacen("1.000000000000", "1.0x", 1);
        match Pattern::parse(&text, Path::new("p")).unwrap_err() {
            PatternError::Corruption { index, token, .. } => {
                assert_eq!(index, 1);
                assert_eq!(token, "1.0x");
            }
            other => panic!("unexpected {other:?}"),
        }

        let truncated = format!("{ALIGN} {HASH_SIZE}\n0.5 0.5\n");
        match Pattern::parse(&truncated, Path::new("p")).unwrap_err() {
            PatternError::Corruption { index, token, .. } => {
                assert_eq!(index, 2);
                assert!(token.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let negative = format!("{ALIGN} {HASH_SIZE}\n-0.5\n");
        assert!(Pattern::parse(&negative, Path::new("p")).unwrap_err().is_fatal());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("pattern");
        let pattern = Pattern::from_usage(&counts(&[(8, 5)]));
        pattern.save(&path).unwrap();
        assert_eq!(Pattern::load(&path).unwrap().fractions()[8], 1.0);

        let err = Pattern::load(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, PatternError::Io { .. }));
    }

    #[test]
    fn test_from_fractions_validates() {
        assert!(Pattern::from_fractions(vec![0.0; 3]).is_none());
        let mut fractions = vec![0.0; LINEAR_HASH_SIZE];
        fractions[1] = f64::NAN;
        assert!(Pattern::from_fractions(fractions.clone()).is_none());
        fractions[1] = 1.0;
        assert!(Pattern::from_fractions(fractions).is_some());
    }
}
