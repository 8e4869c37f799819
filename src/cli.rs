use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "treeder", author, version, about = "Treeder - read Mastodon threads as trees and recap your timeline.", long_about = None)]
pub struct Args {
    /// Instance to talk to, e.g. mastodon.social. Remembered for next time.
    #[arg(short, long, global = true)]
    pub instance: Option<String>,

    /// Config file to use instead of the default one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep view history in memory only
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Print JSON instead of an outline
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the whole thread a post belongs to
    Thread {
        /// Link to any post in the thread, or a post id on the instance
        post: String,

        /// Do not record the posts as seen
        #[arg(long)]
        no_mark: bool,
    },
    /// Group recent timeline activity by thread
    Recap {
        /// Timeline to scan: home, local, public, tag/<name>, list/<id>
        #[arg(default_value = "home")]
        timeline: String,

        /// Stop after this many timeline posts
        #[arg(short, long)]
        limit: Option<usize>,
    },
}
