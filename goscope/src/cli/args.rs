//! CLI argument definitions

use clap::Parser;
use goscope_common::MIRROR_TASK_ID_OFFSET;

use crate::metrics::DEFAULT_METRICS_PORT;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "goscope",
    about = "Trace goroutine creation and exit in Go programs",
    after_help = "\
EXAMPLES:
    sudo goscope --path ./server                       Every process running ./server
    sudo goscope --path ./server --pid 1234            One process only
    sudo goscope --path ./server --metrics 9100        Serve /metrics on port 9100
    sudo goscope --path ./server --task-id-offset 152  Go 1.22 layout of runtime.g"
)]
pub struct Args {
    /// Path to the Go executable to probe
    #[arg(long, value_name = "BIN")]
    pub path: PathBuf,

    /// Restrict probes to one process (default: every process running the binary)
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Byte offset of goid inside runtime.g for the traced build
    #[arg(long, value_name = "BYTES", default_value_t = MIRROR_TASK_ID_OFFSET)]
    pub task_id_offset: u64,

    /// Byte offset of the TLS base inside task_struct (default: read from kernel BTF)
    #[arg(long, value_name = "BYTES")]
    pub tls_base_offset: Option<u64>,

    /// Report goroutines alive for longer than this many seconds
    #[arg(long, value_name = "SECS", default_value = "60")]
    pub uptime_threshold: u64,

    /// Seconds between periodic reports
    #[arg(long, value_name = "SECS", default_value = "10")]
    pub report_interval: u64,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Write every lifecycle event to FILE as JSON lines
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Port of the Prometheus `/metrics` endpoint (0 = disabled)
    #[arg(long, value_name = "PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics: u16,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// PID filter for uprobe attachment; 0 means every process
    #[must_use]
    pub fn pid_filter(&self) -> Option<i32> {
        self.pid.filter(|pid| *pid > 0)
    }

    /// Port of the metrics endpoint, if enabled
    #[must_use]
    pub fn metrics_port(&self) -> Option<u16> {
        (self.metrics > 0).then_some(self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["goscope", "--path", "/usr/bin/app"]);
        assert_eq!(args.task_id_offset, 160);
        assert_eq!(args.tls_base_offset, None);
        assert_eq!(args.uptime_threshold, 60);
        assert_eq!(args.pid_filter(), None);
        assert_eq!(args.metrics_port(), Some(5500));
    }

    #[test]
    fn test_zero_metrics_port_disables_endpoint() {
        let args = Args::parse_from(["goscope", "--path", "/usr/bin/app", "--metrics", "0"]);
        assert_eq!(args.metrics_port(), None);
    }

    #[test]
    fn test_zero_pid_means_all_processes() {
        let args = Args::parse_from(["goscope", "--path", "/usr/bin/app", "--pid", "0"]);
        assert_eq!(args.pid_filter(), None);
    }

    #[test]
    fn test_path_is_required() {
        assert!(Args::try_parse_from(["goscope"]).is_err());
    }
}
