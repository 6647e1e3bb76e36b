//! Stage 2: pull the detail-page URL out of each card.

use std::sync::OnceLock;

use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::Url;
use tracing::info;

use super::{PipelineError, Stage, StageContext, StageSummary};
use crate::db;

const CHUNK: usize = 500;

pub fn run(ctx: &StageContext<'_>) -> Result<StageSummary, PipelineError> {
    let cards = db::fetch_pending_cards(ctx.conn)?;
    let mut summary = StageSummary {
        resumed: db::completed_count(ctx.conn, Stage::Links)?,
        ..Default::default()
    };

    let pb = ProgressBar::new(cards.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("links [{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec})")
            .map_err(anyhow::Error::from)?
            .progress_chars("=> "),
    );

    for chunk in cards.chunks(CHUNK) {
        if ctx.should_stop()? {
            summary.stopped_early = true;
            break;
        }
        let results: Vec<(String, Option<String>)> = chunk
            .iter()
            .map(|c| (c.card_id.clone(), first_link(&c.card_html, &c.page_url)))
            .collect();
        for (_, link) in &results {
            summary.attempted += 1;
            match link {
                Some(_) => summary.succeeded += 1,
                None => summary.rejected += 1,
            }
        }
        db::save_links(ctx.conn, &results)?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    info!(
        "{} card(s) with a link, {} without; {} distinct detail page(s) stored",
        summary.succeeded,
        summary.rejected,
        db::artifact_count(ctx.conn, Stage::Links)?
    );
    Ok(summary)
}

/// First navigable `href` in the card, made absolute against the page it came from.
fn first_link(card_html: &str, page_url: &str) -> Option<String> {
    static HREF: OnceLock<Regex> = OnceLock::new();
    let href = HREF.get_or_init(|| Regex::new(r#"\bhref\s*=\s*["']([^"']+)["']"#).unwrap());
    let base = Url::parse(page_url).ok()?;

    href.captures_iter(card_html)
        .map(|c| c[1].trim().replace("&amp;", "&"))
        .filter(|h| !h.starts_with('#') && !h.starts_with("javascript:"))
        .filter_map(|h| base.join(&h).ok())
        .find(|u| matches!(u.scheme(), "http" | "https"))
        .map(|mut u| {
            u.set_fragment(None);
            u.to_string()
        })
}
