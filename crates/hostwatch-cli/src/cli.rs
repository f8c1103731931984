//! CLI definitions using clap

use clap::{Args, Parser, Subcommand};
use hostwatch_runtime::RunOptions;
use std::path::PathBuf;

/// hostwatch - run a server host plugin and restart it whenever its files change
#[derive(Parser, Debug)]
#[command(name = "hostwatch")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(after_help = "EXAMPLES:
  hostwatch ./target/debug/libmy_app.so
  hostwatch my_app --bin ./target/debug --port 8080
  hostwatch my_app --bin ./target/debug --type my_app::AppHost
  hostwatch my_app --bin ./target/debug --poll 500 --watch '\\.so$'")]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Options for supervising a plugin
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Plugin library with the server host implementation(s)
    pub plugin: Option<String>,

    /// HTTP port handed to the server host
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding the plugin and its dependencies
    #[arg(short, long = "bin", value_name = "DIR")]
    pub bin_dir: Option<PathBuf>,

    /// Server host type to use when the plugin offers several
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub type_name: Option<String>,

    /// Regex over absolute paths selecting the files that trigger a restart
    #[arg(short, long, value_name = "REGEX")]
    pub watch: Option<String>,

    /// Poll the directory every N milliseconds instead of using file notifications
    #[arg(long = "poll", value_name = "MS")]
    pub poll_ms: Option<u64>,

    /// Pause between teardown and restart, in milliseconds
    #[arg(long = "restart-delay", value_name = "MS")]
    pub restart_delay_ms: Option<u64>,

    /// Time allowed for each graceful stop of the worker, in milliseconds
    #[arg(long = "stop-timeout", value_name = "MS")]
    pub stop_timeout_ms: Option<u64>,

    /// When polling, skip checks while the directory's access time is unchanged
    #[arg(long = "trust-atime")]
    pub trust_access_time: bool,

    /// Configuration file (toml, yaml or json)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run as a background service: no console prompt, stop on SIGTERM
    #[arg(long)]
    pub service: bool,
}

impl RunArgs {
    /// Apply flags given on the command line over loaded options.
    pub fn apply(&self, mut options: RunOptions) -> RunOptions {
        if let Some(plugin) = &self.plugin {
            options.plugin = Some(plugin.clone());
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(dir) = &self.bin_dir {
            options.bin_dir = Some(dir.clone());
        }
        if let Some(type_name) = &self.type_name {
            options.type_name = Some(type_name.clone());
        }
        if let Some(watch) = &self.watch {
            options.watch = watch.clone();
        }
        if let Some(poll_ms) = self.poll_ms {
            options.poll_ms = poll_ms;
        }
        if let Some(delay) = self.restart_delay_ms {
            options.restart_delay_ms = delay;
        }
        if let Some(timeout) = self.stop_timeout_ms {
            options.stop_timeout_ms = timeout;
        }
        if self.trust_access_time {
            options.trust_access_time = true;
        }
        options
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Host a plugin for a supervisor (internal)
    #[command(hide = true)]
    Worker {
        /// Supervisor address to connect back to
        #[arg(long, value_name = "ADDR")]
        connect: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_loaded_options() {
        let cli = Cli::parse_from([
            "hostwatch", "app", "--port", "8080", "--type", "app::Host", "--poll", "250",
            "--trust-atime",
        ]);
        let options = cli.run.apply(RunOptions::default().with_watch(r"\.so$"));

        assert_eq!(options.plugin.as_deref(), Some("app"));
        assert_eq!(options.port, 8080);
        assert_eq!(options.type_name.as_deref(), Some("app::Host"));
        assert_eq!(options.poll_ms, 250);
        assert_eq!(options.watch, r"\.so$");
        assert!(options.trust_access_time);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_worker_subcommand() {
        let cli = Cli::parse_from(["hostwatch", "worker", "--connect", "127.0.0.1:4000"]);
        match cli.command {
            Some(Commands::Worker { connect }) => assert_eq!(connect, "127.0.0.1:4000"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
