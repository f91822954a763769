pub mod config;
pub mod probe;
pub mod run;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use dvc_core::config::CalculationMode;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModeArg {
    Auto,
    Cpu,
    Gpu,
}

impl From<ModeArg> for CalculationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => CalculationMode::Auto,
            ModeArg::Cpu => CalculationMode::Cpu,
            ModeArg::Gpu => CalculationMode::Gpu,
        }
    }
}

/// Parse `"n"` as `[n, n, n]` or `"a,b,c"` as `[a, b, c]`.
pub fn parse_triple<T>(text: &str) -> Result<[T; 3]>
where
    T: std::str::FromStr + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let parts = text
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value '{s}' in '{text}'"))
        })
        .collect::<Result<Vec<T>>>()?;
    match parts.as_slice() {
        [v] => Ok([*v; 3]),
        [a, b, c] => Ok([*a, *b, *c]),
        _ => bail!("Expected 1 or 3 comma-separated values, got '{text}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_triple_single_value() {
        assert_eq!(parse_triple::<usize>("16").unwrap(), [16, 16, 16]);
    }

    #[test]
    fn test_parse_triple_three_values() {
        assert_eq!(parse_triple::<isize>("2, -1,3").unwrap(), [2, -1, 3]);
    }

    #[test]
    fn test_parse_triple_rejects_two_values() {
        assert!(parse_triple::<usize>("4,4").is_err());
        assert!(parse_triple::<usize>("4,x,4").is_err());
    }
}
