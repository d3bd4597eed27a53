use std::path::PathBuf;

mod app;
mod config;
mod db;
mod error;
mod feed;
mod models;
mod services;

use app::App;
use config::Config;
use error::{AppError, Result};
use feed::throttle::shown_ratio;

const USAGE: &str = "\
Usage:
  feed-throttle [--list]
  feed-throttle --discover <name>...
  feed-throttle --set-frequency <name> <value>
  feed-throttle --feed <file> [--page-url <url>]";

enum Command {
    List,
    Discover(Vec<String>),
    SetFrequency(String, f64),
    Feed(PathBuf, Option<String>),
}

fn parse_args(args: &[String]) -> Result<Command> {
    let usage = || AppError::Config(USAGE.to_string());

    match args.get(1).map(String::as_str) {
        None | Some("--list") => Ok(Command::List),
        Some("--discover") if args.len() >= 3 => Ok(Command::Discover(args[2..].to_vec())),
        Some("--set-frequency") if args.len() == 4 => {
            let value: f64 = args[3].parse().map_err(|_| {
                AppError::Config(format!("Invalid frequency {:?}", args[3]))
            })?;
            Ok(Command::SetFrequency(args[2].clone(), value))
        }
        Some("--feed") if args.len() == 3 => Ok(Command::Feed(PathBuf::from(&args[2]), None)),
        Some("--feed") if args.len() == 5 && args[3] == "--page-url" => Ok(Command::Feed(
            PathBuf::from(&args[2]),
            Some(args[4].clone()),
        )),
        _ => Err(usage()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = parse_args(&args)?;

    let config = Config::load()?;
    let app = App::new(&config).await?;

    match command {
        Command::List => {
            let entries = app.list().await?;
            if entries.is_empty() {
                println!("No sources yet. Run with --discover first.");
            }
            for entry in entries {
                let ratio = shown_ratio(&entry.feed.stats)
                    .map(|r| format!("{:.2}", r))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<12} freq={:.2} total={} skips={} shown={}",
                    entry.source.identity.display_name,
                    if entry.source.is_subscribed {
                        "subscribed"
                    } else {
                        "unsubscribed"
                    },
                    entry.feed.config.frequency,
                    entry.feed.stats.total,
                    entry.feed.stats.skips,
                    ratio
                );
            }
        }

        Command::Discover(names) => {
            let found = app.discover(&names).await?;
            println!("Discovered {} sources, tracking {}", found.len(), app.badge_count());
        }

        Command::SetFrequency(name, value) => match app.set_frequency(&name, value).await? {
            Some(feed) => println!("{} now shows {:.2}", name, feed.config.frequency),
            None => println!("Unknown source {}", name),
        },

        Command::Feed(path, page_url) => {
            let outcomes = app.run_feed(&path, page_url.as_deref()).await?;
            for outcome in outcomes {
                let verdict = match (&outcome.source, outcome.skipped) {
                    (None, _) => "untracked",
                    (Some(_), true) => "skipped",
                    (Some(_), false) => "shown",
                };
                println!("{:<10} {}", verdict, outcome.url);
            }
        }
    }

    Ok(())
}
