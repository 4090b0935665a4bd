use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Family Guard
///
/// Blocks websites and applications and enforces daily screen-time
/// limits per child profile, locking the screen when time runs out.
#[derive(Parser, Debug)]
#[command(name = "family-guard")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the platform location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to state file (overrides the configuration)
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the enforcement engine in the foreground
    Run {
        /// Start a timed session for this profile
        #[arg(long)]
        profile: Option<String>,

        /// Block the configured websites
        #[arg(long)]
        block_sites: bool,

        /// Terminate the configured applications
        #[arg(long)]
        block_apps: bool,
    },
    /// Manage blocked websites
    Site {
        #[command(subcommand)]
        command: ListCommands,
    },
    /// Manage blocked applications
    App {
        #[command(subcommand)]
        command: ListCommands,
    },
    /// Allow or cut off all internet access
    Internet {
        #[arg(value_enum)]
        access: Access,
    },
    /// Manage child profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Administrator settings
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// Show stored policy and usage
    Status,
    /// Write an example configuration file and set the admin password
    Init {
        /// Admin password to set (required on first use)
        #[arg(long)]
        admin_password: Option<String>,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ListCommands {
    /// Block an entry
    Add {
        name: String,

        /// Apply to one profile instead of everyone
        #[arg(long)]
        profile: Option<String>,
    },
    /// Unblock an entry
    Remove {
        name: String,

        #[arg(long)]
        profile: Option<String>,
    },
    /// List blocked entries
    List {
        #[arg(long)]
        profile: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Internet access allowed
    On,
    /// All outbound traffic dropped while the engine runs
    Off,
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// Create a child profile
    Add {
        name: String,

        #[arg(long)]
        age: u8,

        /// Daily allowance in minutes
        #[arg(long)]
        limit: u32,

        /// The child's password, used to unlock the screen
        #[arg(long)]
        password: String,

        #[arg(long)]
        admin_password: String,
    },
    /// Delete a profile (needs the profile's password)
    Remove {
        name: String,

        #[arg(long)]
        password: String,
    },
    /// List profiles and today's usage
    List,
    /// Reset today's usage for a profile
    Reset {
        name: String,

        #[arg(long)]
        admin_password: String,
    },
    /// Show a profile's activity log (or the machine log)
    Log {
        name: Option<String>,

        /// Number of most recent entries to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum AdminCommands {
    /// Change the admin password
    SetPassword {
        /// Current password (not needed if none is set)
        #[arg(long)]
        current: Option<String>,

        #[arg(long)]
        new: String,
    },
}
