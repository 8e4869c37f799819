use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::cli::{Args, Command};
use crate::config;
use crate::data::{MastodonPostSource, MemoryViewHistory, ViewHistory};
use crate::mastodon;
use crate::recap::{self, Recap};
use crate::storage;
use crate::thread::{MaterializeOptions, PostNode, Reconstructor};
use crate::timeline::Timeline;

pub fn run(args: Args) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: args.config.clone(),
        ..config::LoadOptions::default()
    })
    .context("load config")?;

    let store = if args.ephemeral {
        None
    } else {
        let opts = storage::Options {
            path: cfg.storage.path.clone(),
        };
        Some(storage::Store::open(opts).context("open storage")?)
    };
    let memory = MemoryViewHistory::new();
    let history: &dyn ViewHistory = match &store {
        Some(store) => store as &dyn ViewHistory,
        None => &memory,
    };

    let host = match args.instance.as_deref().map(str::trim) {
        Some(host) if !host.is_empty() => {
            if let Some(store) = &store {
                store.set_default_instance(host)?;
            }
            host.to_string()
        }
        _ if !cfg.instance.host.is_empty() => cfg.instance.host.clone(),
        _ => match store.as_ref().map(|s| s.default_instance()).transpose()?.flatten() {
            Some(host) => host,
            None => {
                let config_path = args.config.clone().or_else(config::default_path);
                bail!(
                    "no instance given; pass --instance or set instance.host in {}",
                    friendly_path(config_path.as_ref())
                );
            }
        },
    };

    let client = mastodon::Client::new(mastodon::ClientConfig {
        host,
        access_token: Some(cfg.instance.access_token.clone()),
        user_agent: cfg.instance.user_agent.clone(),
        http_client: None,
    })
    .context("create mastodon client")?;
    let source = MastodonPostSource::new(Arc::new(client));
    let reconstructor = Reconstructor::new(&source, history);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.command {
        Command::Thread { post, no_mark } => {
            let options = MaterializeOptions {
                mark_viewed: !no_mark,
            };
            let tree = reconstructor.fetch_thread(&post, options)?;
            info!(root = %tree.id(), posts = tree.post_count(), "thread loaded");
            if args.json {
                serde_json::to_writer_pretty(&mut out, &tree)?;
                writeln!(out)?;
            } else {
                write_thread(&mut out, &tree)?;
            }
        }
        Command::Recap { timeline, limit } => {
            let mut options = cfg.feed.options();
            if let Some(limit) = limit {
                options.limit = limit;
            }
            let mut feed = Timeline::new(&source, timeline, options);
            let result = recap::recap(&reconstructor, feed.by_ref())?;
            if feed.retries() > 0 {
                info!(timeline = %feed.name(), retries = feed.retries(), "rate limited while scanning");
            }
            if args.json {
                serde_json::to_writer_pretty(&mut out, &result)?;
                writeln!(out)?;
            } else {
                write_recap(&mut out, &result)?;
            }
        }
    }

    Ok(())
}

/// One line per post, indented by depth; `*` marks posts the reader has not seen.
pub fn write_thread(out: &mut impl Write, tree: &PostNode) -> Result<()> {
    if !tree.ancestors.is_empty() {
        writeln!(out, "in reply to {} earlier posts", tree.ancestors.len())?;
    }
    let mut stack = vec![(tree, 0usize)];
    while let Some((node, depth)) = stack.pop() {
        writeln!(out, "{}{}", "  ".repeat(depth), post_line(node))?;
        stack.extend(node.replies.iter().rev().map(|reply| (reply, depth + 1)));
    }
    Ok(())
}

pub fn write_recap(out: &mut impl Write, recap: &Recap) -> Result<()> {
    writeln!(
        out,
        "{} posts scanned, {} threads",
        recap.timeline.len(),
        recap.threads.len()
    )?;
    for entry in &recap.threads {
        writeln!(out)?;
        writeln!(
            out,
            "{} ({} posts, {} new)",
            post_line(&entry.thread),
            entry.thread.post_count(),
            entry.thread.unviewed_count()
        )?;
        for interaction in &entry.interactions {
            let status = &interaction.status;
            writeln!(
                out,
                "  {:<12} @{} {}",
                interaction.kind.as_str(),
                status.account.acct,
                status.subject().id
            )?;
        }
    }
    Ok(())
}

fn post_line(node: &PostNode) -> String {
    let status = &node.status;
    let marker = if node.viewed { ' ' } else { '*' };
    let edited = if status.edited_at.is_some() { " (edited)" } else { "" };
    format!(
        "{marker} @{} {} {}{edited}",
        status.account.acct,
        status.id,
        status.last_modified().format("%Y-%m-%d %H:%M"),
    )
}

fn friendly_path(path: Option<&std::path::PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/treeder/config.yaml".to_string()
    }
}
