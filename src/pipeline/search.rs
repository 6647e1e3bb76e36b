//! Stage 1: walk the search result pages and keep every listing card.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{info, warn};

use super::{PipelineError, Stage, StageContext, StageSummary};
use crate::config::{SearchSettings, Settings};
use crate::db::{self, CardRow};
use crate::driver::{Driver, DriverError, DriverFactory};
use crate::pool::{self, Completion, WorkItem};
use crate::retry::RetryOutcome;

/// Card markup, most specific layout first.
const CARD_CLASSES: &[&[&str]] = &[&["gallery-card"], &["result-row", "cl-static-search-result"]];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub offset: usize,
    pub url: String,
}

impl WorkItem for SearchPage {
    fn key(&self) -> String {
        self.url.clone()
    }
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageSummary, PipelineError> {
    let base = ctx.search_url.ok_or(PipelineError::MissingSearchUrl)?;
    let settings = ctx.settings;

    let total = match settings
        .retry
        .attempt("result count", |_| count_results(&*ctx.drivers, settings, base))
        .await
    {
        Ok(RetryOutcome::Succeeded { value, .. }) => value,
        Ok(RetryOutcome::Exhausted { last_error, .. }) => {
            warn!("Could not open search page to count results: {}", last_error);
            None
        }
        Err(e) => {
            return Err(PipelineError::Fatal {
                key: base.to_string(),
                source: e,
            })
        }
    };
    if ctx.should_stop()? {
        return Ok(StageSummary {
            stopped_early: true,
            ..Default::default()
        });
    }

    let pages = plan_pages(base, total, &settings.search);
    let done = db::completed_keys(ctx.conn, Stage::Search)?;
    let (finished, todo): (Vec<_>, Vec<_>) = pages.into_iter().partition(|p| done.contains(&p.url));
    info!(
        "Planning {} search page(s), {} already scraped",
        todo.len() + finished.len(),
        finished.len()
    );

    let drivers = Arc::clone(&ctx.drivers);
    let page_settings = Arc::new(settings.clone());
    let mut cards = 0usize;
    let report = pool::process_all(
        "search pages",
        todo,
        settings.workers.search,
        &settings.retry,
        &ctx.token,
        move |page: SearchPage, _| {
            let drivers = Arc::clone(&drivers);
            let settings = Arc::clone(&page_settings);
            async move { fetch_page(&*drivers, &settings, &page).await }
        },
        |c| match c {
            Completion::Done { item, value, .. } => {
                cards += value.len();
                db::save_cards(ctx.conn, &item.url, &value)
            }
            Completion::Exhausted {
                item,
                attempts,
                error,
            } => db::record_failure(ctx.conn, Stage::Search, &item.url, attempts, &error.to_string()),
        },
    )
    .await?;

    info!("Collected {} listing card(s)", cards);
    Ok(StageSummary {
        attempted: report.attempted,
        succeeded: report.succeeded,
        exhausted: report.exhausted,
        rejected: 0,
        resumed: finished.len(),
        stopped_early: report.skipped > 0,
    })
}

async fn count_results(
    drivers: &dyn DriverFactory,
    settings: &Settings,
    url: &str,
) -> Result<Option<usize>, DriverError> {
    let mut driver = drivers.session().await?;
    let result = read_counter(driver.as_mut(), settings, url).await;
    let _ = driver.close().await;
    result
}

async fn read_counter(
    driver: &mut dyn Driver,
    settings: &Settings,
    url: &str,
) -> Result<Option<usize>, DriverError> {
    driver.open(url).await?;
    driver.wait(settings.timing.page_load()).await?;
    match driver.read_text(&settings.selectors.total_count).await {
        Ok(text) => Ok(parse_total(&text)),
        Err(DriverError::ElementNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn fetch_page(
    drivers: &dyn DriverFactory,
    settings: &Settings,
    page: &SearchPage,
) -> Result<Vec<CardRow>, DriverError> {
    let mut driver = drivers.session().await?;
    let result = load_page(driver.as_mut(), settings, page).await;
    let _ = driver.close().await;
    result
}

async fn load_page(
    driver: &mut dyn Driver,
    settings: &Settings,
    page: &SearchPage,
) -> Result<Vec<CardRow>, DriverError> {
    driver.open(&page.url).await?;
    driver.wait(settings.timing.page_load()).await?;
    let html = driver.current_page_html().await?;
    if html.contains(&settings.selectors.block_marker) {
        return Err(DriverError::Blocked(page.url.clone()));
    }
    let cards = split_cards(&html, page.offset);
    if cards.is_empty() {
        info!("No listings on page with offset {}", page.offset);
    }
    Ok(cards
        .into_iter()
        .map(|(card_id, card_html)| CardRow {
            card_id,
            page_url: page.url.clone(),
            card_html,
        })
        .collect())
}

/// "1,234" or " 734 " -> count. Anything else is unreadable.
fn parse_total(text: &str) -> Option<usize> {
    let digits: String = text.chars().filter(|c| *c != ',').collect();
    digits.trim().parse().ok()
}

fn plan_pages(base: &str, total: Option<usize>, search: &SearchSettings) -> Vec<SearchPage> {
    let per_page = search.results_per_page.max(1);
    let mut count = match total {
        Some(n) => n.div_ceil(per_page),
        None => {
            warn!(
                "Result counter unreadable, assuming {} page(s)",
                search.fallback_pages
            );
            search.fallback_pages
        }
    };
    if let Some(max) = search.max_pages {
        count = count.min(max);
    }
    (0..count)
        .map(|i| {
            let offset = i * per_page;
            SearchPage {
                offset,
                url: page_url(base, offset),
            }
        })
        .collect()
}

/// Add `s=<offset>` to the query, keeping any `#fragment` at the end.
fn page_url(base: &str, offset: usize) -> String {
    let (head, fragment) = match base.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (base, None),
    };
    let sep = if head.contains('?') { '&' } else { '?' };
    match fragment {
        Some(frag) => format!("{head}{sep}s={offset}#{frag}"),
        None => format!("{head}{sep}s={offset}"),
    }
}

/// Split a result page into `(card_id, outer_html)` pairs.
fn split_cards(html: &str, offset: usize) -> Vec<(String, String)> {
    static OPEN: OnceLock<Regex> = OnceLock::new();
    static PID: OnceLock<Regex> = OnceLock::new();
    let open = OPEN.get_or_init(|| {
        Regex::new(r#"<(li|div)\b[^>]*\bclass\s*=\s*"([^"]*)"[^>]*>"#).unwrap()
    });
    let pid = PID.get_or_init(|| Regex::new(r#"\bdata-pid\s*=\s*"([^"]+)""#).unwrap());

    for classes in CARD_CLASSES {
        let mut cards = Vec::new();
        let mut pos = 0;
        while let Some(caps) = open.captures_at(html, pos) {
            let (Some(tag), Some(whole)) = (caps.get(1), caps.get(0)) else {
                break;
            };
            let is_card = caps[2]
                .split_whitespace()
                .any(|c| classes.contains(&c));
            if !is_card {
                pos = whole.end();
                continue;
            }
            let end = element_end(html, tag.as_str(), whole.end());
            let outer = &html[whole.start()..end];
            let id = pid
                .captures(whole.as_str())
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| format!("unknown-{}-{}", offset, cards.len() + 1));
            cards.push((id, outer.to_string()));
            pos = end;
        }
        if !cards.is_empty() {
            return cards;
        }
    }
    Vec::new()
}

/// Byte offset just past the tag that closes an element opened before `from`.
fn element_end(html: &str, tag: &str, from: usize) -> usize {
    static LI: OnceLock<Regex> = OnceLock::new();
    static DIV: OnceLock<Regex> = OnceLock::new();
    let re = match tag {
        "li" => LI.get_or_init(|| Regex::new(r"<(/?)li\b[^>]*>").unwrap()),
        _ => DIV.get_or_init(|| Regex::new(r"<(/?)div\b[^>]*>").unwrap()),
    };
    let mut depth = 1usize;
    for caps in re.captures_iter(&html[from..]) {
        if caps[1].is_empty() {
            depth += 1;
        } else {
            depth -= 1;
            if depth == 0 {
                return caps.get(0).map_or(html.len(), |m| from + m.end());
            }
        }
    }
    html.len()
}
