use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hot2rss::config::Config;
use hot2rss::fetch::build_client;
use hot2rss::output::{display_path, resolve_output_path, write_feed};
use hot2rss::pipeline::build_feed;

/// hot2rss - turn a mobile page's embedded hot-articles list into an RSS feed
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output file, relative to the project root (default: rss.xml)
    output: Option<PathBuf>,

    /// Page to fetch (overrides HOT2RSS_SOURCE_URL)
    #[arg(long = "source-url")]
    source_url: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hot2rss=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {:#}", e);
            eprintln!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(url) = &args.source_url {
        config = config.with_source_url(url.clone());
    }

    let root = match &config.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("Failed to determine the current directory")?,
    };
    let path = resolve_output_path(&root, args.output.as_deref());

    let client = build_client().context("Failed to build HTTP client")?;
    let xml = build_feed(&client, &config)
        .await
        .with_context(|| format!("Failed to build feed from {}", config.source_url))?;

    let bytes = write_feed(&path, &xml).await?;
    println!("Wrote {} ({} bytes)", display_path(&root, &path), bytes);
    Ok(())
}
