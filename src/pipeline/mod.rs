//! Stage controller.
//!
//! Runs the requested stages in order. Each stage reads only its
//! predecessor's table and skips items already listed in the completed-item
//! index, so any stage can be re-run after a crash or an interrupt.

pub mod details;
pub mod extract;
pub mod filter;
pub mod links;
pub mod search;

use std::fmt;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::db;
use crate::driver::{DriverError, DriverFactory};
use crate::interrupt::{InterruptRouter, StageToken, TokenState};

pub const SEARCH_URL_KEY: &str = "search_url";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Search = 1,
    Links = 2,
    Details = 3,
    Extract = 4,
    Filter = 5,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Search,
        Stage::Links,
        Stage::Details,
        Stage::Extract,
        Stage::Filter,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(n: u8) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.ordinal() == n)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Search => "search",
            Stage::Links => "links",
            Stage::Details => "details",
            Stage::Extract => "extract",
            Stage::Filter => "filter",
        }
    }

    /// The stage whose artifact this one consumes.
    pub fn previous(self) -> Option<Stage> {
        Stage::from_ordinal(self.ordinal() - 1)
    }

    pub fn artifact_table(self) -> &'static str {
        match self {
            Stage::Search => "stage1_cards",
            Stage::Links => "stage2_links",
            Stage::Details => "stage3_captures",
            Stage::Extract => "stage4_candidates",
            Stage::Filter => "stage5_phones",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.ordinal(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    NotStarted,
    Running,
    Completed,
    PartiallyCompleted,
    Aborted,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::NotStarted => "not_started",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::PartiallyCompleted => "partially_completed",
            StageStatus::Aborted => "aborted",
        }
    }
}

/// Per-stage counters shown to the operator and stored in `stage_runs`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub attempted: usize,
    pub succeeded: usize,
    /// Excluded after running out of retries.
    pub exhausted: usize,
    /// Excluded by validation or because there was nothing to extract.
    pub rejected: usize,
    /// Already done in an earlier run.
    pub resumed: usize,
    /// The stage honoured a stop request and left items for a later run.
    pub stopped_early: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} needs the {table} artifact from {previous}, but it is empty; run {previous} first")]
    MissingArtifact {
        stage: Stage,
        previous: Stage,
        table: &'static str,
    },
    #[error("no search URL given and none remembered from an earlier run")]
    MissingSearchUrl,
    #[error("run aborted by interrupt")]
    Aborted,
    #[error("unrecoverable error on {key}: {source}")]
    Fatal {
        key: String,
        #[source]
        source: DriverError,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Everything a stage needs while it runs.
pub struct StageContext<'a> {
    pub conn: &'a Connection,
    pub settings: &'a Settings,
    pub drivers: Arc<dyn DriverFactory>,
    pub token: StageToken,
    pub search_url: Option<&'a str>,
}

impl StageContext<'_> {
    /// Between-chunk check for the sequential stages: `Ok(true)` means stop early.
    pub fn should_stop(&self) -> Result<bool, PipelineError> {
        match self.token.state() {
            TokenState::Active => Ok(false),
            TokenState::GracefulStop => Ok(true),
            TokenState::Aborted => Err(PipelineError::Aborted),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    pub summary: StageSummary,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub outcomes: Vec<StageOutcome>,
    /// Why the run stopped early, if it did.
    pub error: Option<PipelineError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.outcomes.iter().all(|o| o.status != StageStatus::Aborted)
    }

    pub fn status_of(&self, stage: Stage) -> Option<StageStatus> {
        self.outcomes.iter().find(|o| o.stage == stage).map(|o| o.status)
    }

    /// The stage ran to the end or stopped early with its output saved.
    pub fn produced(&self, stage: Stage) -> bool {
        matches!(
            self.status_of(stage),
            Some(StageStatus::Completed | StageStatus::PartiallyCompleted)
        )
    }
}

pub struct Pipeline<'a> {
    conn: &'a Connection,
    settings: &'a Settings,
    router: Arc<InterruptRouter>,
    drivers: Arc<dyn DriverFactory>,
    search_url: Option<String>,
    run_id: String,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        conn: &'a Connection,
        settings: &'a Settings,
        router: Arc<InterruptRouter>,
        drivers: Arc<dyn DriverFactory>,
    ) -> Self {
        Pipeline {
            conn,
            settings,
            router,
            drivers,
            search_url: None,
            run_id: chrono::Local::now().format("%Y%m%d-%H%M%S").to_string(),
        }
    }

    /// Search URL for stage 1. Remembered for later runs when given.
    pub fn with_search_url(mut self, url: Option<String>) -> Self {
        self.search_url = url;
        self
    }

    pub async fn run(&self, requested: &[Stage]) -> RunReport {
        let mut stages = requested.to_vec();
        stages.sort();
        stages.dedup();

        let mut report = RunReport {
            run_id: self.run_id.clone(),
            outcomes: stages
                .iter()
                .map(|&stage| StageOutcome {
                    stage,
                    status: StageStatus::NotStarted,
                    summary: StageSummary::default(),
                })
                .collect(),
            error: None,
        };

        let search_url = match self.resolve_search_url(&stages) {
            Ok(url) => url,
            Err(e) => {
                error!("{}", e);
                if let Some(first) = report.outcomes.first_mut() {
                    first.status = StageStatus::Aborted;
                }
                report.error = Some(e);
                return report;
            }
        };
        if let Err((stage, e)) = self.check_inputs(&stages) {
            error!("{}", e);
            if let Some(o) = report.outcomes.iter_mut().find(|o| o.stage == stage) {
                o.status = StageStatus::Aborted;
            }
            report.error = Some(e);
            return report;
        }

        for outcome in report.outcomes.iter_mut() {
            if self.router.is_aborted() {
                warn!("Run aborted before {}", outcome.stage);
                report.error = Some(PipelineError::Aborted);
                break;
            }
            if let Err(e) = self.run_stage(search_url.as_deref(), outcome).await {
                outcome.status = StageStatus::Aborted;
                error!("{} aborted: {}", outcome.stage, e);
                report.error = Some(e);
                break;
            }
        }
        report
    }

    fn resolve_search_url(&self, stages: &[Stage]) -> Result<Option<String>, PipelineError> {
        if let Some(url) = &self.search_url {
            db::set_meta(self.conn, SEARCH_URL_KEY, url)?;
            return Ok(Some(url.clone()));
        }
        let remembered = db::get_meta(self.conn, SEARCH_URL_KEY)?;
        if remembered.is_none() && stages.contains(&Stage::Search) {
            return Err(PipelineError::MissingSearchUrl);
        }
        Ok(remembered)
    }

    /// Stages fed by an earlier run, not this one, must find their input
    /// before anything starts.
    fn check_inputs(&self, stages: &[Stage]) -> Result<(), (Stage, PipelineError)> {
        for &stage in stages {
            match stage.previous() {
                Some(previous) if !stages.contains(&previous) => {
                    self.require_input(stage).map_err(|e| (stage, e))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn require_input(&self, stage: Stage) -> Result<(), PipelineError> {
        if let Some(previous) = stage.previous() {
            if db::artifact_count(self.conn, previous)? == 0 {
                return Err(PipelineError::MissingArtifact {
                    stage,
                    previous,
                    table: previous.artifact_table(),
                });
            }
        }
        Ok(())
    }

    async fn run_stage(&self, search_url: Option<&str>, outcome: &mut StageOutcome) -> Result<(), PipelineError> {
        let stage = outcome.stage;
        self.require_input(stage)?;

        let run_row = db::begin_stage_run(self.conn, &self.run_id, stage)?;
        let token = self.router.begin_stage();
        outcome.status = StageStatus::Running;
        info!("Starting {}", stage);

        let ctx = StageContext {
            conn: self.conn,
            settings: self.settings,
            drivers: Arc::clone(&self.drivers),
            token: token.clone(),
            search_url,
        };
        let result = match stage {
            Stage::Search => search::run(&ctx).await,
            Stage::Links => links::run(&ctx),
            Stage::Details => details::run(&ctx).await,
            Stage::Extract => extract::run(&ctx),
            Stage::Filter => filter::run(&ctx),
        };
        let result = match result {
            Ok(_) if token.is_aborted() => Err(PipelineError::Aborted),
            other => other,
        };
        self.router.end_stage();

        let message = result.as_ref().err().map(|e| e.to_string());
        outcome.status = match &result {
            Ok(summary) if summary.stopped_early => StageStatus::PartiallyCompleted,
            Ok(_) => StageStatus::Completed,
            Err(_) => StageStatus::Aborted,
        };
        if let Ok(summary) = &result {
            outcome.summary = summary.clone();
        }
        let s = &outcome.summary;
        db::finish_stage_run(
            self.conn,
            run_row,
            &db::StageRunUpdate {
                status: outcome.status.as_str(),
                attempted: s.attempted,
                succeeded: s.succeeded,
                exhausted: s.exhausted,
                rejected: s.rejected,
                resumed: s.resumed,
                message: message.as_deref(),
            },
        )?;

        if result.is_ok() {
            info!(
                "{} {}: {} attempted, {} succeeded, {} exhausted retries, {} rejected, {} already done",
                stage,
                outcome.status.as_str().replace('_', " "),
                s.attempted,
                s.succeeded,
                s.exhausted,
                s.rejected,
                s.resumed
            );
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeFactory, FakePage, FakeSite};
    use crate::config::TimingSettings;
    use crate::retry::RetryPolicy;

    pub(crate) const SEARCH: &str = "https://city.example.org/search/cta#search=1~gallery~0";

    pub(crate) fn quick_settings() -> Settings {
        Settings {
            timing: TimingSettings::none(),
            retry: RetryPolicy::immediate(2),
            ..Default::default()
        }
    }

    fn card(pid: u32) -> String {
        format!(
            "<li class=\"cl-static-search-result\" data-pid=\"{pid}\">\
             <a href=\"/cto/d/listing-{pid}/{pid}.html\"><div class=\"title\">Car {pid}</div></a></li>"
        )
    }

    fn detail_url(pid: u32) -> String {
        format!("https://city.example.org/cto/d/listing-{pid}/{pid}.html")
    }

    /// Two result pages, five listings; listings 3 and 5 show no usable phone.
    fn fake_site() -> Arc<FakeSite> {
        let site = FakeSite::new();
        let s = Settings::default().selectors;
        let mut counter = FakePage::default();
        counter.texts.insert(s.total_count.clone(), "150".to_string());
        site.page(SEARCH, counter);
        site.page(
            "https://city.example.org/search/cta?s=0#search=1~gallery~0",
            FakePage {
                html: format!("<ol>{}{}{}</ol>", card(1), card(2), card(3)),
                ..Default::default()
            },
        );
        site.page(
            "https://city.example.org/search/cta?s=120#search=1~gallery~0",
            FakePage {
                html: format!("<ol>{}{}</ol>", card(4), card(5)),
                ..Default::default()
            },
        );
        let phones = [
            Some("(714) 760-4016"),
            Some("949.555.0199"),
            None,
            Some("+1 310 555 0123"),
            Some("555-CALL-NOW"),
        ];
        for (i, phone) in phones.into_iter().enumerate() {
            let pid = i as u32 + 1;
            let mut page = FakePage {
                html: format!(
                    "<html><head><title>Car {pid} - cars</title></head><body>\
                     <span id=\"titletextonly\">Car {pid}</span> posted {pid}00000000</body></html>"
                ),
                clickable: vec![s.reply_button.clone(), s.call_button.clone()],
                ..Default::default()
            };
            if let Some(p) = phone {
                page.texts.insert(s.phone_link.clone(), p.to_string());
            }
            site.page(&detail_url(pid), page);
        }
        site
    }

    fn pipeline<'a>(
        conn: &'a Connection,
        settings: &'a Settings,
        router: Arc<InterruptRouter>,
        site: &Arc<FakeSite>,
    ) -> Pipeline<'a> {
        Pipeline::new(conn, settings, router, Arc::new(FakeFactory(Arc::clone(site))))
    }

    #[tokio::test]
    async fn end_to_end() {
        let conn = db::open_in_memory();
        let settings = quick_settings();
        let site = fake_site();
        let report = pipeline(&conn, &settings, Arc::new(InterruptRouter::new()), &site)
            .with_search_url(Some(SEARCH.to_string()))
            .run(&Stage::ALL)
            .await;

        assert!(report.succeeded(), "{:?}", report.error);
        assert!(report.outcomes.iter().all(|o| o.status == StageStatus::Completed));
        assert_eq!(db::artifact_count(&conn, Stage::Search).unwrap(), 5);
        assert!(report.produced(Stage::Filter));
        assert_eq!(db::artifact_count(&conn, Stage::Details).unwrap(), 5);

        let phones: Vec<_> = db::fetch_phones(&conn, None)
            .unwrap()
            .into_iter()
            .map(|r| (r.title, r.phone))
            .collect();
        assert_eq!(phones.len(), 3);
        assert!(phones.contains(&("Car 1".to_string(), "(714) 760-4016".to_string())));
        assert!(phones.contains(&("Car 2".to_string(), "(949) 555-0199".to_string())));
        assert!(phones.contains(&("Car 4".to_string(), "(310) 555-0123".to_string())));

        let extract = &report.outcomes[3].summary;
        assert_eq!(extract.rejected, 2);
    }

    #[tokio::test]
    async fn rerun_skips_finished_items() {
        let conn = db::open_in_memory();
        let settings = quick_settings();
        let site = fake_site();
        let router = Arc::new(InterruptRouter::new());
        pipeline(&conn, &settings, Arc::clone(&router), &site)
            .with_search_url(Some(SEARCH.to_string()))
            .run(&Stage::ALL)
            .await;

        // The URL is remembered
        let report = pipeline(&conn, &settings, router, &site).run(&Stage::ALL).await;
        assert!(report.succeeded());
        assert_eq!(site.opens_of(&detail_url(1)), 1);
        assert_eq!(report.outcomes[2].summary.attempted, 0);
        assert_eq!(report.outcomes[2].summary.resumed, 5);
        assert_eq!(db::artifact_count(&conn, Stage::Filter).unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_predecessor_is_fatal() {
        let conn = db::open_in_memory();
        let settings = quick_settings();
        let site = fake_site();
        let report = pipeline(&conn, &settings, Arc::new(InterruptRouter::new()), &site)
            .run(&[Stage::Details, Stage::Extract])
            .await;

        assert!(!report.succeeded());
        assert_eq!(report.status_of(Stage::Details), Some(StageStatus::Aborted));
        assert_eq!(report.status_of(Stage::Extract), Some(StageStatus::NotStarted));
        let msg = report.error.unwrap().to_string();
        assert!(msg.contains("stage2_links"), "{msg}");
        assert_eq!(site.sessions.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_input_stops_run_before_any_work() {
        let conn = db::open_in_memory();
        let settings = quick_settings();
        let site = fake_site();
        let report = pipeline(&conn, &settings, Arc::new(InterruptRouter::new()), &site)
            .with_search_url(Some(SEARCH.to_string()))
            .run(&[Stage::Search, Stage::Details])
            .await;

        assert!(matches!(
            report.error,
            Some(PipelineError::MissingArtifact { stage: Stage::Details, .. })
        ));
        assert_eq!(report.status_of(Stage::Search), Some(StageStatus::NotStarted));
        assert_eq!(report.status_of(Stage::Details), Some(StageStatus::Aborted));
        assert_eq!(site.sessions.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(db::artifact_count(&conn, Stage::Search).unwrap(), 0);
    }

    #[tokio::test]
    async fn stage_one_without_url_is_fatal() {
        let conn = db::open_in_memory();
        let settings = quick_settings();
        let site = fake_site();
        let report = pipeline(&conn, &settings, Arc::new(InterruptRouter::new()), &site)
            .run(&[Stage::Search])
            .await;
        assert!(matches!(report.error, Some(PipelineError::MissingSearchUrl)));
    }

    #[tokio::test]
    async fn interrupt_skips_to_next_stage() {
        let conn = db::open_in_memory();
        let mut settings = quick_settings();
        settings.workers.details = 1;
        let site = fake_site();
        let router = Arc::new(InterruptRouter::new());
        site.interrupt_via(Arc::clone(&router));

        let p = pipeline(&conn, &settings, Arc::clone(&router), &site)
            .with_search_url(Some(SEARCH.to_string()));
        let first = p.run(&[Stage::Search, Stage::Links]).await;
        assert!(first.succeeded());

        // Opening listing 2 delivers one interrupt
        let mut page = site.pages.lock().unwrap()[&detail_url(2)].clone();
        page.interrupts = 1;
        site.page(&detail_url(2), page);

        let report = p.run(&[Stage::Details, Stage::Extract]).await;
        assert!(report.succeeded(), "{:?}", report.error);
        assert_eq!(report.status_of(Stage::Details), Some(StageStatus::PartiallyCompleted));
        assert_eq!(report.status_of(Stage::Extract), Some(StageStatus::Completed));

        let captured = db::artifact_count(&conn, Stage::Details).unwrap();
        assert!(captured >= 1 && captured < 5, "captured {captured}");
        assert_eq!(report.outcomes[0].summary.succeeded, captured);
        assert_eq!(
            db::artifact_count(&conn, Stage::Extract).unwrap() + report.outcomes[1].summary.rejected,
            captured
        );
        assert!(!router.is_aborted());
    }

    #[tokio::test]
    async fn interrupted_stage_resumes_each_item_once() {
        let conn = db::open_in_memory();
        let mut settings = quick_settings();
        settings.workers.details = 1;
        let site = fake_site();
        let router = Arc::new(InterruptRouter::new());
        site.interrupt_via(Arc::clone(&router));

        let p = pipeline(&conn, &settings, Arc::clone(&router), &site)
            .with_search_url(Some(SEARCH.to_string()));
        assert!(p.run(&[Stage::Search, Stage::Links]).await.succeeded());

        let links = db::fetch_links(&conn).unwrap();
        assert_eq!(links.len(), 5);
        let mut page = site.pages.lock().unwrap()[&links[1].source_url].clone();
        page.interrupts = 1;
        site.page(&links[1].source_url, page);

        let first = p.run(&[Stage::Details]).await;
        assert_eq!(first.status_of(Stage::Details), Some(StageStatus::PartiallyCompleted));
        let captured = db::artifact_count(&conn, Stage::Details).unwrap();
        assert!(captured < 5, "captured {captured}");

        let second = p.run(&[Stage::Details]).await;
        assert_eq!(second.status_of(Stage::Details), Some(StageStatus::Completed));
        assert_eq!(second.outcomes[0].summary.resumed, captured);
        assert_eq!(second.outcomes[0].summary.succeeded, 5 - captured);
        assert_eq!(db::artifact_count(&conn, Stage::Details).unwrap(), 5);
        for l in &links {
            assert_eq!(site.opens_of(&l.source_url), 1, "{}", l.source_url);
        }
    }

    #[tokio::test]
    async fn stop_after_last_item_still_completes() {
        let conn = db::open_in_memory();
        let mut settings = quick_settings();
        settings.workers.details = 1;
        let site = fake_site();
        let router = Arc::new(InterruptRouter::new());
        site.interrupt_via(Arc::clone(&router));

        let p = pipeline(&conn, &settings, Arc::clone(&router), &site)
            .with_search_url(Some(SEARCH.to_string()));
        p.run(&[Stage::Search, Stage::Links]).await;

        // The interrupt lands while the final listing is already in flight
        let last = db::fetch_links(&conn).unwrap().pop().unwrap().source_url;
        let mut page = site.pages.lock().unwrap()[&last].clone();
        page.interrupts = 1;
        site.page(&last, page);

        let report = p.run(&[Stage::Details]).await;
        assert_eq!(report.status_of(Stage::Details), Some(StageStatus::Completed));
        assert!(!report.outcomes[0].summary.stopped_early);
        assert_eq!(db::artifact_count(&conn, Stage::Details).unwrap(), 5);
    }

    #[tokio::test]
    async fn second_interrupt_aborts_run() {
        let conn = db::open_in_memory();
        let mut settings = quick_settings();
        settings.workers.details = 1;
        let site = fake_site();
        let router = Arc::new(InterruptRouter::new());
        site.interrupt_via(Arc::clone(&router));

        let p = pipeline(&conn, &settings, Arc::clone(&router), &site)
            .with_search_url(Some(SEARCH.to_string()));
        p.run(&[Stage::Search, Stage::Links]).await;

        let mut page = site.pages.lock().unwrap()[&detail_url(1)].clone();
        page.interrupts = 2;
        site.page(&detail_url(1), page);

        let report = p.run(&[Stage::Details, Stage::Extract, Stage::Filter]).await;
        assert!(!report.succeeded());
        assert!(router.is_aborted());
        assert_eq!(report.status_of(Stage::Details), Some(StageStatus::Aborted));
        assert_eq!(report.status_of(Stage::Extract), Some(StageStatus::NotStarted));
        assert_eq!(db::artifact_count(&conn, Stage::Extract).unwrap(), 0);
    }

    #[tokio::test]
    async fn interrupt_between_stages_aborts() {
        let conn = db::open_in_memory();
        let settings = quick_settings();
        let site = fake_site();
        let router = Arc::new(InterruptRouter::new());
        router.interrupt();
        let report = pipeline(&conn, &settings, router, &site)
            .with_search_url(Some(SEARCH.to_string()))
            .run(&Stage::ALL)
            .await;
        assert!(matches!(report.error, Some(PipelineError::Aborted)));
        assert!(report.outcomes.iter().all(|o| o.status == StageStatus::NotStarted));
        assert!(!report.succeeded());
        assert!(!report.produced(Stage::Filter));
    }

    #[test]
    fn stage_ordering() {
        assert_eq!(Stage::Search.previous(), None);
        assert_eq!(Stage::Filter.previous(), Some(Stage::Extract));
        assert_eq!(Stage::from_ordinal(3), Some(Stage::Details));
        assert_eq!(Stage::from_ordinal(6), None);
        assert_eq!(Stage::Details.to_string(), "stage 3 (details)");
    }
}
