//! Command-line surface (spec §6 "CLI"): `run` starts the service, `builddb`
//! runs the archive builder. Neither subcommand is part of the judging core.

use clap::Parser;
use shadow_rs::shadow;

shadow!(build);

#[derive(Parser)]
#[clap(version = build::CLAP_LONG_VERSION)]
#[clap(about = "A local programming-contest judge.", long_about = None)]
pub struct Args {
    #[clap(short, long, value_parser)]
    pub config_search_path: Vec<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Starts the judging service.
    Run {
        #[clap(long)]
        port: Option<u16>,

        #[clap(long)]
        workers: Option<u32>,

        #[clap(long)]
        locale: Option<String>,

        /// Path to the encrypted contest archive (spec §6 "Archive format").
        #[clap(long)]
        contests: Option<String>,

        /// Skips authentication, using the alphabet/key in `./pass` instead.
        #[clap(long)]
        testing: bool,
    },
    /// Builds an encrypted contest archive from a source tree.
    Builddb {
        /// Directory holding `contests.yml` and one subdirectory per task.
        source: String,

        /// Path the archive is written to.
        #[clap(long, default_value = "db.zip")]
        output: String,

        /// 16-byte password; generated and printed (and written to `./pass`)
        /// when omitted.
        #[clap(long)]
        password: Option<String>,

        /// Also write the generated password to `./pass`.
        #[clap(long)]
        save_pass: bool,
    },
}
