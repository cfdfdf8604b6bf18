//! Calibration session description

use std::fmt;
use thiserror::Error;

/// Malformed calibration description
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("Calibration spec needs `<module> <levels> <repetitions>`, got `{0}`")]
    Shape(String),

    #[error("Failed to parse emulator numbers list: {0}")]
    Levels(String),

    #[error("Failed to parse number of repetitions: `{0}`")]
    Repetitions(String),
}

/// What a calibration session runs: `repetitions` batches of `p` parallel
/// emulators for every `p` in `levels`, each loading `module`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibSpec {
    /// Kernel module file name loaded by every run
    pub module: String,
    /// Parallelism levels, distinct and ascending
    pub levels: Vec<u32>,
    /// Successful batches required per level
    pub repetitions: u32,
}

impl CalibSpec {
    /// Parse `"<module> <levels> <repetitions>"`, e.g. `"fi.ko 1,2,5-8 3"`.
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        let &[module, levels, repetitions] = fields.as_slice() else {
            return Err(SpecError::Shape(raw.to_string()));
        };
        let repetitions = repetitions
            .parse()
            .map_err(|_| SpecError::Repetitions(repetitions.to_string()))?;
        Ok(Self {
            module: module.to_string(),
            levels: parse_levels(levels)?,
            repetitions,
        })
    }

    /// Highest parallelism level, i.e. the number of emulators needed
    pub fn max_level(&self) -> u32 {
        self.levels.last().copied().unwrap_or(0)
    }

    /// Batches needed if nothing fails
    pub fn total_batches(&self) -> u64 {
        self.levels.len() as u64 * u64::from(self.repetitions)
    }
}

impl fmt::Display for CalibSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "module={}, repeats={}, numEmus={:?}",
            self.module, self.repetitions, self.levels
        )
    }
}

/// Parse `"1,2,5-8"` into distinct ascending levels. Reversed ranges count
/// the same as forward ones.
pub fn parse_levels(raw: &str) -> Result<Vec<u32>, SpecError> {
    let number = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| SpecError::Levels(format!("invalid number `{s}`")))
    };

    let mut levels = Vec::new();
    for element in raw.split(',') {
        match element.split_once('-') {
            Some((start, end)) => {
                if end.contains('-') {
                    return Err(SpecError::Levels(format!("invalid range `{element}`")));
                }
                let (a, b) = (number(start)?, number(end)?);
                levels.extend(a.min(b)..=a.max(b));
            }
            None => levels.push(number(element)?),
        }
    }

    levels.sort_unstable();
    levels.dedup();
    if levels.first() == Some(&0) {
        return Err(SpecError::Levels("parallelism level 0".to_string()));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!(parse_levels("1,2,3,4").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(parse_levels("1-4").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(parse_levels("1-2,3-4").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(parse_levels("8-5,2,2,1").unwrap(), vec![1, 2, 5, 6, 7, 8]);
    }

    #[test]
    fn test_parse_levels_errors() {
        assert!(parse_levels("1-2-3").is_err());
        assert!(parse_levels("a").is_err());
        assert!(parse_levels("1,,2").is_err());
        assert!(parse_levels("0-2").is_err());
    }

    #[test]
    fn test_parse_spec() {
        let spec = CalibSpec::parse("fi.ko 4,1-2 3").unwrap();
        assert_eq!(spec.module, "fi.ko");
        assert_eq!(spec.levels, vec![1, 2, 4]);
        assert_eq!(spec.repetitions, 3);
        assert_eq!(spec.max_level(), 4);
        assert_eq!(spec.total_batches(), 9);
        assert_eq!(spec.to_string(), "module=fi.ko, repeats=3, numEmus=[1, 2, 4]");
    }

    #[test]
    fn test_parse_spec_errors() {
        assert!(matches!(CalibSpec::parse("fi.ko 1"), Err(SpecError::Shape(_))));
        assert!(matches!(
            CalibSpec::parse("fi.ko 1 x"),
            Err(SpecError::Repetitions(_))
        ));
    }
}
