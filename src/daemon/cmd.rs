use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "autonetd")]
#[command(about = "self-service vm provisioning daemon", long_about = None)]
pub struct Cli {
    /// Path to the config file. If not provided, the daemon will look for autonet.toml in the
    /// current working directory, then in the user config dir ($HOME/.config/autonet/config.toml)
    /// and finally in the system config dir (/etc/autonet/config.toml)
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,
}
