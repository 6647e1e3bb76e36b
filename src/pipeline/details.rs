//! Stage 3: visit every listing, reveal the phone number and keep the page.

use std::sync::Arc;

use tracing::{debug, info};

use super::{PipelineError, Stage, StageContext, StageSummary};
use crate::config::Settings;
use crate::db::{self, CaptureRow, LinkRow};
use crate::driver::{Driver, DriverError, DriverFactory};
use crate::pool::{self, Completion, WorkItem};

impl WorkItem for LinkRow {
    fn key(&self) -> String {
        self.source_url.clone()
    }
}

pub async fn run(ctx: &StageContext<'_>) -> Result<StageSummary, PipelineError> {
    let done = db::completed_keys(ctx.conn, Stage::Details)?;
    let (finished, todo): (Vec<_>, Vec<_>) = db::fetch_links(ctx.conn)?
        .into_iter()
        .partition(|l| done.contains(&l.source_url));
    info!(
        "{}/{} listing(s) need to be scraped",
        todo.len(),
        todo.len() + finished.len()
    );

    let drivers = Arc::clone(&ctx.drivers);
    let settings = Arc::new(ctx.settings.clone());
    let mut revealed = 0usize;
    let report = pool::process_all(
        "listings",
        todo,
        ctx.settings.workers.details,
        &ctx.settings.retry,
        &ctx.token,
        move |link: LinkRow, _| {
            let drivers = Arc::clone(&drivers);
            let settings = Arc::clone(&settings);
            async move { visit(&*drivers, &settings, &link.source_url).await }
        },
        |c| match c {
            Completion::Done { value, .. } => {
                if value.revealed_phone.is_some() {
                    revealed += 1;
                }
                db::save_capture(ctx.conn, &value)
            }
            Completion::Exhausted {
                item,
                attempts,
                error,
            } => db::record_failure(ctx.conn, Stage::Details, &item.source_url, attempts, &error.to_string()),
        },
    )
    .await?;

    info!("Phone revealed on {} of {} captured listing(s)", revealed, report.succeeded);
    Ok(StageSummary {
        attempted: report.attempted,
        succeeded: report.succeeded,
        exhausted: report.exhausted,
        rejected: 0,
        resumed: finished.len(),
        stopped_early: report.skipped > 0,
    })
}

/// One attempt at one listing, on a session of its own.
async fn visit(drivers: &dyn DriverFactory, settings: &Settings, url: &str) -> Result<CaptureRow, DriverError> {
    let mut driver = drivers.session().await?;
    let result = capture(driver.as_mut(), settings, url).await;
    if let Err(e) = driver.close().await {
        debug!("Closing session for {}: {}", url, e);
    }
    result
}

async fn capture(driver: &mut dyn Driver, settings: &Settings, url: &str) -> Result<CaptureRow, DriverError> {
    let timing = &settings.timing;
    let sel = &settings.selectors;

    driver.open(url).await?;
    driver.wait(timing.page_load()).await?;
    if driver.current_page_html().await?.contains(&sel.block_marker) {
        return Err(DriverError::Blocked(url.to_string()));
    }

    let mut revealed_phone = None;
    if optional(driver.click(&sel.reply_button).await)?.is_some() {
        driver.wait(timing.reply_reveal()).await?;
        if optional(driver.click(&sel.call_button).await)?.is_some() {
            driver.wait(timing.call_reveal()).await?;
            revealed_phone = optional(driver.read_text(&sel.phone_link).await)?
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty());
        } else {
            debug!("No call button on {}", url);
        }
    } else {
        debug!("No reply button on {}", url);
    }

    let html = driver.current_page_html().await?;
    if html.contains(&sel.block_marker) {
        return Err(DriverError::Blocked(url.to_string()));
    }
    if !timing.listing_delay().is_zero() {
        driver.wait(timing.listing_delay()).await?;
    }

    Ok(CaptureRow {
        source_url: url.to_string(),
        html,
        revealed_phone,
    })
}

/// Missing page controls are normal; only real driver failures propagate.
fn optional<T>(result: Result<T, DriverError>) -> Result<Option<T>, DriverError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(DriverError::ElementNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
