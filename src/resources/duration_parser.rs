use regex::Regex;
use std::{num::ParseFloatError, sync::OnceLock, time::Duration};

/// Parses the duration strings used by `metav1.Duration` fields, e.g. `30s`, `1m30s`, `1.5h`, `250ms`.
///
/// ```rust
/// # use std::time::Duration;
/// # use node_readiness_controller::resources::duration_parser::DurationParser;
/// assert_eq!("1m30s".to_duration().unwrap(), Duration::from_secs(90));
/// ```
///
/// # Errors
///
/// Fails on an unknown unit, a missing unit, a negative value or trailing garbage.
pub trait DurationParser {
    fn to_duration(&self) -> Result<Duration, ParseError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    ParseFloatError(#[from] ParseFloatError),
    #[error("Invalid duration unit in {0:?}")]
    InvalidUnit(String),
    #[error("Invalid duration {0:?}")]
    InvalidDuration(String),
}

enum DurationUnits {
    Nanos,
    Micros,
    Millis,
    Seconds,
    Minutes,
    Hours,
    Invalid,
}

impl DurationUnits {
    fn new(unit: &str) -> Self {
        match unit {
            "ns" => Self::Nanos,
            "us" | "µs" | "μs" => Self::Micros,
            "ms" => Self::Millis,
            "s" => Self::Seconds,
            "m" => Self::Minutes,
            "h" => Self::Hours,
            _ => Self::Invalid,
        }
    }

    fn seconds(&self) -> Option<f64> {
        match self {
            Self::Nanos => Some(1e-9),
            Self::Micros => Some(1e-6),
            Self::Millis => Some(1e-3),
            Self::Seconds => Some(1.0),
            Self::Minutes => Some(60.0),
            Self::Hours => Some(3600.0),
            Self::Invalid => None,
        }
    }
}

impl DurationParser for str {
    fn to_duration(&self) -> Result<Duration, ParseError> {
        let input = self.trim();
        if input == "0" {
            return Ok(Duration::ZERO);
        }
        if input.is_empty() || input.starts_with('-') {
            return Err(ParseError::InvalidDuration(self.to_string()));
        }

        static REGEX: OnceLock<Regex> = OnceLock::new();
        let re = REGEX.get_or_init(|| Regex::new(r"([0-9]*\.?[0-9]+)([a-zµμ]+)").unwrap());

        let input = input.strip_prefix('+').unwrap_or(input);
        let mut consumed = 0;
        let mut total = 0f64;
        for cap in re.captures_iter(input) {
            let whole = cap.get(0).unwrap();
            if whole.start() != consumed {
                return Err(ParseError::InvalidDuration(self.to_string()));
            }
            consumed = whole.end();

            let amount = cap[1].parse::<f64>()?;
            let scale = DurationUnits::new(&cap[2])
                .seconds()
                .ok_or_else(|| ParseError::InvalidUnit(self.to_string()))?;
            total += amount * scale;
        }

        if consumed == 0 || consumed != input.len() {
            return Err(ParseError::InvalidDuration(self.to_string()));
        }

        Duration::try_from_secs_f64(total).map_err(|_| ParseError::InvalidDuration(self.to_string()))
    }
}

impl DurationParser for String {
    fn to_duration(&self) -> Result<Duration, ParseError> {
        self.as_str().to_duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_seconds() {
        assert_eq!("30s".to_duration().unwrap(), Duration::from_secs(30))
    }

    #[test]
    fn compound() {
        assert_eq!(
            "1h2m3s".to_duration().unwrap(),
            Duration::from_secs(3600 + 120 + 3)
        )
    }

    #[test]
    fn fractional() {
        assert_eq!("1.5m".to_duration().unwrap(), Duration::from_secs(90))
    }

    #[test]
    fn millis() {
        assert_eq!("250ms".to_duration().unwrap(), Duration::from_millis(250))
    }

    #[test]
    fn bare_zero() {
        assert_eq!("0".to_duration().unwrap(), Duration::ZERO)
    }

    #[test]
    fn missing_unit_fails() {
        assert!("30".to_duration().is_err())
    }

    #[test]
    fn invalid_unit_fails() {
        assert!("30d".to_duration().is_err())
    }

    #[test]
    fn negative_fails() {
        assert!("-5s".to_duration().is_err())
    }

    #[test]
    fn out_of_range_fails() {
        assert!("99999999999999999999h".to_duration().is_err());
        let digits = "9".repeat(400) + "s";
        assert!(digits.to_duration().is_err());
    }

    #[test]
    fn trailing_garbage_fails() {
        assert!("5s!".to_duration().is_err());
        assert!("x5s".to_duration().is_err());
    }
}
