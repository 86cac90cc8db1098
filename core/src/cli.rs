//! CLI command definitions.
//!
//! This binary has no daemon process and no HTTP surface (both out of this
//! engine's scope), so it only makes sense as a single-process demo
//! harness: `start` submits a task and drives it to completion in the same
//! process, optionally exercising the pause/resume/stop control protocol
//! against it on a timer.

use clap::Parser;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::MarketType;

/// Diagnostic CLI for the task execution engine.
#[derive(Parser, Debug)]
#[command(name = "taskengine", about = "Multi-agent analysis task execution engine", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true, help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)")]
    pub log_level: Option<String>,

    /// Ticker symbol
    #[arg(long)]
    pub symbol: String,

    /// Market type
    #[arg(long, value_enum, default_value = "us-stock")]
    pub market: MarketArg,

    /// Analysis date (YYYY-MM-DD), defaults to today if omitted
    #[arg(long)]
    pub date: Option<String>,

    /// Comma-separated analyst kinds, e.g. market,news,fundamentals
    #[arg(long, value_delimiter = ',', default_value = "market")]
    pub analysts: Vec<String>,

    /// Research depth, 1 (shallow) to 3 (deep debate + full risk phase)
    #[arg(long, default_value_t = 1)]
    pub depth: u8,

    /// Output format for the final task record
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Pause the task this many seconds after it starts, for demonstrating
    /// the control protocol; the task resumes after an equal delay.
    #[arg(long)]
    pub pause_after_secs: Option<u64>,

    /// Request a stop this many seconds after the task starts.
    #[arg(long)]
    pub stop_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum MarketArg {
    #[value(name = "a-share")]
    AShare,
    #[value(name = "hong-kong")]
    HongKong,
    #[value(name = "us-stock")]
    UsStock,
}

impl From<MarketArg> for MarketType {
    fn from(value: MarketArg) -> Self {
        match value {
            MarketArg::AShare => MarketType::AShare,
            MarketArg::HongKong => MarketType::HongKong,
            MarketArg::UsStock => MarketType::UsStock,
        }
    }
}

/// Output format for the final task record.
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {s}. Use: text or json")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_analysts() {
        let cli = Cli::parse_from(["taskengine", "--symbol", "AAPL", "--analysts", "market,news", "--depth", "2"]);
        assert_eq!(cli.symbol, "AAPL");
        assert_eq!(cli.analysts, vec!["market", "news"]);
        assert_eq!(cli.depth, 2);
    }

    #[test]
    fn defaults_depth_to_one_and_market_to_us_stock() {
        let cli = Cli::parse_from(["taskengine", "--symbol", "AAPL"]);
        assert_eq!(cli.depth, 1);
        assert!(matches!(cli.market, MarketArg::UsStock));
        assert_eq!(cli.analysts, vec!["market"]);
    }
}
