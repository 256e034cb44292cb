use std::path::PathBuf;

use clap::{ColorChoice, Parser};

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// The journal holding resources and changesets
    #[arg(long, global = true, default_value = "/var/db/felis/state.json")]
    pub state: PathBuf,

    /// Directory containing `rebuild_world.sh`
    #[arg(long, global = true, default_value = "/usr/local/libexec/felis")]
    pub scripts_dir: PathBuf,

    /// Directory for generated files such as `jail.conf.d/`
    #[arg(long, global = true, default_value = "/var/db/felis")]
    pub work_dir: PathBuf,

    /// Run host commands through `sudo -n` unless already root
    #[arg(long, global = true, default_value_t = false)]
    pub elevate: bool,

    #[arg(long, global = true, default_value_t = false, conflicts_with = "elevate")]
    pub no_elevate: bool,
}

impl Options {
    pub fn use_color(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::IsTerminal::is_terminal(&std::io::stderr()),
        }
    }

    pub fn elevate(&self) -> bool {
        self.elevate && !self.no_elevate
    }
}
