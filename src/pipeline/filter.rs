//! Stage 5: keep only records whose phone validates, in canonical form.

use std::collections::HashSet;

use tracing::{debug, info};

use super::{PipelineError, Stage, StageContext, StageSummary};
use crate::db::{self, PhoneRow};
use crate::phone;

const CHUNK: usize = 500;

pub fn run(ctx: &StageContext<'_>) -> Result<StageSummary, PipelineError> {
    let candidates = db::fetch_pending_candidates(ctx.conn)?;
    let mut summary = StageSummary {
        resumed: db::completed_count(ctx.conn, Stage::Filter)?,
        ..Default::default()
    };
    let mut seen = HashSet::new();

    for chunk in candidates.chunks(CHUNK) {
        if ctx.should_stop()? {
            summary.stopped_early = true;
            break;
        }
        let mut results = Vec::with_capacity(chunk.len());
        for c in chunk {
            if !seen.insert(c.source_url.as_str()) {
                continue;
            }
            summary.attempted += 1;
            let row = match phone::validate(&c.raw_phone_candidate) {
                Ok(canonical) => {
                    debug_assert!(phone::is_canonical(&canonical));
                    summary.succeeded += 1;
                    Some(PhoneRow {
                        source_url: c.source_url.clone(),
                        title: c.title.clone(),
                        phone: canonical,
                    })
                }
                Err(rejection) => {
                    debug!("{}: {}", c.source_url, rejection);
                    summary.rejected += 1;
                    None
                }
            };
            results.push((c.source_url.clone(), row));
        }
        db::save_phones(ctx.conn, &results)?;
    }

    info!(
        "{} record(s) with a valid phone number, {} excluded",
        summary.succeeded, summary.rejected
    );
    Ok(summary)
}
