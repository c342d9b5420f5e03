use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "ctstream",
    version,
    about = "Stream Linux conntrack events with kernel-side sampling under load"
)]
pub struct Cli {
    /// Path to the proc filesystem used for namespace discovery
    #[arg(long, default_value = "/proc")]
    pub proc_root: String,

    /// Maximum netlink messages per second before sampling kicks in
    /// (-1 disables throttling)
    #[arg(long, default_value_t = 500, allow_hyphen_values = true, value_parser = validate_rate_limit)]
    pub rate_limit: i64,

    /// Listen for events from all network namespaces
    #[arg(long)]
    pub all_namespaces: bool,

    /// Dump the existing conntrack table for this address family before
    /// streaming
    #[arg(long)]
    pub dump: Option<DumpFamily>,

    /// Output format for event summaries and final telemetry
    #[arg(long, default_value = "summary")]
    pub format: OutputFormat,

    /// Stream for N seconds then print telemetry and exit.
    /// Without this flag, streaming runs until SIGINT/SIGTERM.
    #[arg(long, value_parser = validate_duration)]
    pub duration: Option<f64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Summary,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFamily {
    All,
    Inet,
    Inet6,
}

impl DumpFamily {
    /// The address family byte carried in the dump request.
    pub fn family(&self) -> u8 {
        match self {
            DumpFamily::All => libc::AF_UNSPEC as u8,
            DumpFamily::Inet => libc::AF_INET as u8,
            DumpFamily::Inet6 => libc::AF_INET6 as u8,
        }
    }
}

fn validate_rate_limit(s: &str) -> Result<i64, String> {
    let val: i64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == -1 || (1..=1_000_000).contains(&val) {
        Ok(val)
    } else {
        Err("rate-limit must be -1 (disabled) or between 1 and 1000000".to_string())
    }
}

fn validate_duration(s: &str) -> Result<f64, String> {
    let val: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if val < 1.0 {
        Err("duration must be at least 1.0 seconds".to_string())
    } else if val > 3600.0 {
        Err("duration must be at most 3600.0 seconds".to_string())
    } else {
        Ok(val)
    }
}
