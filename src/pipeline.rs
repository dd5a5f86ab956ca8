use chrono::Utc;
use reqwest::Client;

use crate::config::Config;
use crate::error::Result;
use crate::extract::extract_state_expression;
use crate::feed::{locate_articles, FeedDocument};
use crate::fetch::fetch_page;
use crate::sandbox::Sandbox;

/// fetch → extract → evaluate → locate → transform → render.
///
/// The first failing stage aborts the run; nothing partial is returned.
pub async fn build_feed(client: &Client, config: &Config) -> Result<String> {
    let url = config.validated_source_url()?;

    let html = fetch_page(client, &url, &config.retry).await?;
    tracing::info!(url = %url, bytes = html.len(), "Fetched source page");

    let expr = extract_state_expression(&html)?;
    let state = Sandbox::new(config.sandbox_timeout).evaluate(&expr)?;
    drop(html);

    let articles = locate_articles(&state)?;
    tracing::info!(articles = articles.len(), "Located hot articles list");

    FeedDocument::from_articles(config.channel.clone(), articles, Utc::now()).to_xml()
}
