use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(
        short = 'C',
        long = "directory",
        value_name = "DIR",
        global = true,
        help = "Directory to look for kiln.toml in"
    )]
    pub source_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Print debug logs")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    #[command(about = "Show recent runs")]
    Show {
        #[arg(short, long, help = "Number of entries to show")]
        count: Option<usize>,
    },

    #[command(about = "Clear run history")]
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Build a package if needed and run it")]
    Run {
        #[arg(help = "Package to run in (omit with --script)")]
        project: Option<String>,

        #[arg(long, help = "Run in the script package")]
        script: bool,

        #[arg(
            short,
            long = "file",
            value_name = "FILE",
            required = true,
            help = "Source file to submit, may be repeated"
        )]
        files: Vec<PathBuf>,

        #[arg(long, value_name = "MS", help = "Override the run timeout")]
        timeout_ms: Option<u64>,
    },

    #[command(about = "Build a package without running it")]
    Build {
        #[arg(help = "Package name")]
        project: String,
    },

    #[command(about = "Report whether a package needs rebuilding")]
    Status {
        #[arg(help = "Package name")]
        project: String,
    },

    #[command(about = "Manage run history")]
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },

    #[command(about = "Initialize a new kiln.toml configuration")]
    Init {
        #[arg(long, help = "Also create a package with this name")]
        name: Option<String>,
    },
}

impl Cli {
    pub fn source_directory(&self) -> PathBuf {
        self.source_dir.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }
}
