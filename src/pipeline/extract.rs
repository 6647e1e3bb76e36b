//! Stage 4: title and phone candidate from each captured page.

use std::sync::OnceLock;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::Regex;
use tracing::info;

use super::{PipelineError, Stage, StageContext, StageSummary};
use crate::db::{self, CandidateRow, CaptureRow};
use crate::phone;

const CHUNK: usize = 500;

pub fn run(ctx: &StageContext<'_>) -> Result<StageSummary, PipelineError> {
    let captures = db::fetch_pending_captures(ctx.conn)?;
    let mut summary = StageSummary {
        resumed: db::completed_count(ctx.conn, Stage::Extract)?,
        ..Default::default()
    };

    let pb = ProgressBar::new(captures.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .map_err(anyhow::Error::from)?
            .progress_chars("#>-"),
    );

    for chunk in captures.chunks(CHUNK) {
        if ctx.should_stop()? {
            summary.stopped_early = true;
            break;
        }
        let results: Vec<(String, Option<CandidateRow>)> = chunk
            .par_iter()
            .map(|c| (c.source_url.clone(), extract(c)))
            .collect();
        for (_, row) in &results {
            summary.attempted += 1;
            match row {
                Some(_) => summary.succeeded += 1,
                None => summary.rejected += 1,
            }
        }
        db::save_candidates(ctx.conn, &results)?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    info!(
        "Extracted {} candidate(s), skipped {} page(s) without a valid phone number",
        summary.succeeded, summary.rejected
    );
    Ok(summary)
}

/// `None` when the page has no phone the validator accepts.
pub fn extract(capture: &CaptureRow) -> Option<CandidateRow> {
    let candidate = phone::find_candidate(&capture.html, capture.revealed_phone.as_deref())?;
    Some(CandidateRow {
        source_url: capture.source_url.clone(),
        title: title_of(&capture.html),
        raw_phone_candidate: candidate,
    })
}

/// `#titletextonly`, else `<title>`, else `N/A`.
fn title_of(html: &str) -> String {
    static TITLE_ONLY: OnceLock<Regex> = OnceLock::new();
    static TITLE: OnceLock<Regex> = OnceLock::new();
    let title_only = TITLE_ONLY.get_or_init(|| {
        Regex::new(r#"(?is)<[a-z]+[^>]*\bid\s*=\s*["']titletextonly["'][^>]*>(.*?)</"#).unwrap()
    });
    let title = TITLE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

    [title_only, title]
        .into_iter()
        .filter_map(|re| re.captures(html))
        .map(|c| clean_text(&c[1]))
        .find(|t| !t.is_empty())
        .unwrap_or_else(|| "N/A".to_string())
}

fn clean_text(raw: &str) -> String {
    let decoded = raw
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(html: &str, revealed: Option<&str>) -> CaptureRow {
        CaptureRow {
            source_url: "https://x.org/1.html".to_string(),
            html: html.to_string(),
            revealed_phone: revealed.map(str::to_string),
        }
    }

    #[test]
    fn title_fallbacks() {
        assert_eq!(
            title_of(r#"<title>ignored</title><span id="titletextonly">2012  Honda &amp; Co</span>"#),
            "2012 Honda & Co"
        );
        assert_eq!(title_of("<title> Civic - cars </title>"), "Civic - cars");
        assert_eq!(title_of("<p>nothing</p>"), "N/A");
    }

    #[test]
    fn revealed_number_is_kept_raw() {
        let row = extract(&page("<title>t</title>", Some("714.760.4016"))).unwrap();
        assert_eq!(row.raw_phone_candidate, "714.760.4016");
        assert_eq!(row.title, "t");
    }

    #[test]
    fn post_ids_are_not_phones() {
        assert!(extract(&page("<p>post id: 7712345678</p>", None)).is_none());
        let row = extract(&page("<p>call 714-760-4016 today</p>", None)).unwrap();
        assert_eq!(row.raw_phone_candidate, "714-760-4016");
    }

    #[test]
    fn stored_candidates_pass_the_validator() {
        let row = extract(&page("<p>(714)\n760-4016</p><p>949.555.0199</p>", None)).unwrap();
        assert_eq!(
            phone::validate(&row.raw_phone_candidate).as_deref(),
            Ok("(714) 760-4016")
        );
    }
}
