//! The batch state machine: article -> charts -> fields, then the summary
//! page and the backlink pass.
//!
//! Every item ends in exactly one [`ItemOutcome`]. Failures are recorded on
//! the item and the loop moves on; nothing inside a batch aborts the run.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use chartdoc_clients::{ArticleSource, LanguageModel, NewDocument, Publisher, WorkbookSource};
use chartdoc_shared::{
    AppConfig, ArticleReport, BatchReport, BatchRequest, ChartDescriptor, ChartDocError,
    ChartReport, ChartStage, CollectionsConfig, DefaultsConfig, FieldStage, ItemOutcome,
    ItemStatus, LedgerSheet, LinkReport, Mode, PageMetadata, PublishedRecord, Result, RunId,
};
use chartdoc_storage::{Ledger, Storage};
use chartdoc_workbook::{Workbook, norm_key, resolve_context};

use crate::analysis::{analyze_chart, analyze_field, human_name};
use crate::formatter::{
    ChartPage, FieldLink, FieldLinks, SummaryChart, chart_html, field_html, smart_title,
    summary_html,
};
use crate::linker::{LinkRequest, RelatedLink, Section, carry_sections, link_all};
use crate::preview::content_diff;

const SUMMARY_STAGE: &str = "summary-publish";

/// The external collaborators of one batch.
#[derive(Clone)]
pub struct Services {
    pub articles: Arc<dyn ArticleSource>,
    pub workbooks: Arc<dyn WorkbookSource>,
    pub model: Arc<dyn LanguageModel>,
    pub publisher: Arc<dyn Publisher>,
    pub ledger: Arc<dyn Ledger>,
}

/// Configuration the state machine reads.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Tableau project whose workbooks are searched for views.
    pub project_id: String,
    pub defaults: DefaultsConfig,
    pub collections: CollectionsConfig,
}

impl Settings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            project_id: config.tableau.project_id.clone(),
            defaults: config.defaults.clone(),
            collections: config.help_center.collections.clone(),
        }
    }
}

/// Progress callback for reporting batch status.
pub trait BatchProgress: Send + Sync {
    fn article_started(&self, article_id: &str, current: usize, total: usize);
    fn chart_started(&self, title: &str, current: usize, total: usize);
    /// Called once per terminal chart, field, summary, or link outcome.
    fn item_finished(&self, outcome: &ItemOutcome);
    fn done(&self, report: &BatchReport);
}

/// No-op progress reporter for the webhook and tests.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn article_started(&self, _article_id: &str, _current: usize, _total: usize) {}
    fn chart_started(&self, _title: &str, _current: usize, _total: usize) {}
    fn item_finished(&self, _outcome: &ItemOutcome) {}
    fn done(&self, _report: &BatchReport) {}
}

/// An error pinned to the step it happened in.
struct Halt<S> {
    stage: S,
    error: ChartDocError,
}

trait AtStage<T> {
    fn at<S>(self, stage: S) -> std::result::Result<T, Halt<S>>;
}

impl<T> AtStage<T> for Result<T> {
    fn at<S>(self, stage: S) -> std::result::Result<T, Halt<S>> {
        self.map_err(|error| Halt { stage, error })
    }
}

/// Per-run mode and confirmation list.
struct RunMode<'a> {
    mode: Mode,
    confirm: &'a [String],
}

impl RunMode<'_> {
    fn confirmed(&self, key: &str) -> bool {
        self.mode != Mode::ConfirmSubset || self.confirm.iter().any(|c| c == key)
    }
}

/// A rendered document about to be published, updated, or previewed.
struct Rendered<'a> {
    sheet: LedgerSheet,
    key: &'a str,
    name: &'a str,
    html: String,
}

pub struct Orchestrator {
    services: Services,
    settings: Settings,
    history: Option<Arc<Storage>>,
}

impl Orchestrator {
    pub fn new(services: Services, settings: Settings) -> Self {
        Self {
            services,
            settings,
            history: None,
        }
    }

    /// Record every finished batch in the local run history.
    pub fn with_history(mut self, storage: Arc<Storage>) -> Self {
        self.history = Some(storage);
        self
    }

    /// Process every article in `request`, in order.
    #[instrument(skip_all, fields(mode = %request.mode, articles = request.article_ids.len()))]
    pub async fn run_batch(
        &self,
        request: &BatchRequest,
        progress: &dyn BatchProgress,
    ) -> BatchReport {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let run = RunMode {
            mode: request.mode,
            confirm: &request.confirm,
        };
        info!(%run_id, "batch started");

        let total = request.article_ids.len();
        let mut articles = Vec::with_capacity(total);
        for (index, article_id) in request.article_ids.iter().enumerate() {
            progress.article_started(article_id, index + 1, total);
            articles.push(self.process_article(article_id.trim(), &run, progress).await);
        }

        let report = BatchReport {
            run_id,
            mode: request.mode,
            started_at,
            finished_at: Utc::now(),
            articles,
        };

        let (charts, fields) = report.totals();
        info!(
            run_id = %report.run_id,
            charts_ok = charts.success,
            charts_skipped = charts.skipped,
            charts_failed = charts.failed,
            fields_ok = fields.success,
            fields_skipped = fields.skipped,
            fields_failed = fields.failed,
            "batch finished"
        );

        if let Some(history) = &self.history {
            if let Err(e) = history.record_run(&report).await {
                warn!(error = %e, "failed to record run history");
            }
        }
        progress.done(&report);
        report
    }

    #[instrument(skip_all, fields(article_id = %article_id))]
    async fn process_article(
        &self,
        article_id: &str,
        run: &RunMode<'_>,
        progress: &dyn BatchProgress,
    ) -> ArticleReport {
        let source = match self.services.articles.fetch_article(article_id).await {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "article fetch failed");
                return ArticleReport {
                    article_id: article_id.to_string(),
                    page: PageMetadata::default(),
                    status: ItemStatus::Failed,
                    reason: Some(e.to_string()),
                    charts: Vec::new(),
                    summary: None,
                    links: LinkReport::default(),
                };
            }
        };

        let (mut page, descriptors) = chartdoc_content::extract(&source.html, source.base_url.as_ref());
        if page.title == chartdoc_content::DEFAULT_TITLE && !source.title.is_empty() {
            page.title = source.title.clone();
        }
        if page.category.is_empty() {
            page.category = self.settings.defaults.category.clone();
        }
        info!(charts = descriptors.len(), category = %page.category, "article parsed");

        let mut charts = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            progress.chart_started(&descriptor.title, index + 1, descriptors.len());
            let report = self.process_chart(descriptor, &page, run, progress).await;
            progress.item_finished(&report.outcome);
            charts.push(report);
        }

        let summary = self
            .publish_summary(article_id, &page, &descriptors, &charts, run)
            .await;
        progress.item_finished(&summary);

        let links = self.link_batch(&page, &charts, &summary, run).await;
        for outcome in links.fields.iter().chain(&links.charts) {
            progress.item_finished(outcome);
        }

        ArticleReport {
            article_id: article_id.to_string(),
            page,
            status: ItemStatus::Success,
            reason: None,
            charts,
            summary: Some(summary),
            links,
        }
    }

    // -----------------------------------------------------------------------
    // Chart machine
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(view = %chart.view_id, view_name = %chart.view_name))]
    async fn process_chart(
        &self,
        chart: &ChartDescriptor,
        page: &PageMetadata,
        run: &RunMode<'_>,
        progress: &dyn BatchProgress,
    ) -> ChartReport {
        let raw_title = if chart.title.trim().is_empty() {
            &chart.view_name
        } else {
            &chart.title
        };
        let title = smart_title(raw_title);
        let mut fields = Vec::new();

        let outcome = match self
            .chart_steps(chart, &title, page, run, &mut fields, progress)
            .await
        {
            Ok(outcome) => outcome,
            Err(halt) => {
                warn!(stage = %halt.stage, error = %halt.error, "chart failed");
                ItemOutcome::failed(&chart.view_id, &title, halt.stage, halt.error.to_string())
            }
        };
        debug!(status = ?outcome.status, stage = %outcome.stage, "chart finished");
        ChartReport { outcome, fields }
    }

    async fn chart_steps(
        &self,
        chart: &ChartDescriptor,
        title: &str,
        page: &PageMetadata,
        run: &RunMode<'_>,
        fields: &mut Vec<ItemOutcome>,
        progress: &dyn BatchProgress,
    ) -> std::result::Result<ItemOutcome, Halt<ChartStage>> {
        let key = chart.view_id.as_str();
        let ledger = self.services.ledger.as_ref();

        let existing = ledger
            .lookup(LedgerSheet::ChartLibrary, key)
            .await
            .at(ChartStage::DuplicateCheck)?;
        if let Some(record) = &existing {
            if !run.mode.updates_existing() {
                info!("chart already published");
                return Ok(duplicate(key, record, ChartStage::DuplicateCheck));
            }
        }

        let view_name = if chart.view_name.trim().is_empty() {
            title
        } else {
            chart.view_name.as_str()
        };
        let Some(workbook_id) = self
            .services
            .workbooks
            .find_workbook(view_name, &self.settings.project_id)
            .await
            .at(ChartStage::WorkbookLookup)?
        else {
            return Ok(ItemOutcome::skipped(
                key,
                title,
                ChartStage::WorkbookLookup,
                format!("no workbook in the configured project carries view '{view_name}'"),
            ));
        };

        let bytes = self
            .services
            .workbooks
            .download_workbook(&workbook_id)
            .await
            .at(ChartStage::XmlFetch)?;
        let (workbook, summary) =
            chartdoc_workbook::extract(&bytes, view_name).at(ChartStage::XmlFetch)?;

        let answer = analyze_chart(
            self.services.model.as_ref(),
            &chart.image_url,
            &summary.render(),
        )
        .await
        .at(ChartStage::AiChartAnalysis)?;
        let layout = answer.layout();
        let names = answer.field_names();
        info!(fields = names.len(), "chart analysed");

        let mut links = FieldLinks::new();
        for name in &names {
            let outcome = self.process_field(name, &workbook, run).await;
            progress.item_finished(&outcome);
            links.insert(
                norm_key(name),
                FieldLink {
                    name: outcome.name.clone(),
                    url: outcome.url.clone(),
                },
            );
            fields.push(outcome);
        }

        let html = chart_html(&ChartPage {
            title,
            image_url: &chart.image_url,
            category: &page.category,
            availability: &self.settings.defaults.availability,
            shows: &chart.caption,
            placeholder: &self.settings.defaults.placeholder,
            layout: &layout,
            links: &links,
        });

        self.publish(
            Rendered {
                sheet: LedgerSheet::ChartLibrary,
                key,
                name: title,
                html,
            },
            existing,
            run,
            ChartStage::Done,
        )
        .await
        .at(ChartStage::ChartPublish)
    }

    // -----------------------------------------------------------------------
    // Field machine
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(field = %name))]
    async fn process_field(&self, name: &str, workbook: &Workbook, run: &RunMode<'_>) -> ItemOutcome {
        // Ledger keys use the workbook's spelling so casing variants share a row.
        let key = workbook.field(name).map_or(name, |f| f.name.as_str());
        match self.field_steps(name, key, workbook, run).await {
            Ok(outcome) => outcome,
            Err(halt) => {
                warn!(stage = %halt.stage, error = %halt.error, "field failed");
                ItemOutcome::failed(key, name, halt.stage, halt.error.to_string())
            }
        }
    }

    async fn field_steps(
        &self,
        name: &str,
        key: &str,
        workbook: &Workbook,
        run: &RunMode<'_>,
    ) -> std::result::Result<ItemOutcome, Halt<FieldStage>> {
        let model = self.services.model.as_ref();

        let existing = self
            .services
            .ledger
            .lookup(LedgerSheet::DataDictionary, key)
            .await
            .at(FieldStage::DuplicateCheck)?;
        if let Some(record) = &existing {
            if !run.mode.updates_existing() {
                debug!("field already documented");
                return Ok(duplicate(key, record, FieldStage::DuplicateCheck));
            }
        }

        let context = resolve_context(name, workbook).render();

        let analysis = analyze_field(model, name, &context)
            .await
            .at(FieldStage::AiFieldAnalysis)?;

        let display = human_name(model, name, &context).await;

        let html = field_html(&display, &analysis);

        self.publish(
            Rendered {
                sheet: LedgerSheet::DataDictionary,
                key,
                name: &display,
                html,
            },
            existing,
            run,
            FieldStage::Done,
        )
        .await
        .at(FieldStage::Publish)
    }

    // -----------------------------------------------------------------------
    // Summary page and links
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(article_id = %article_id))]
    async fn publish_summary(
        &self,
        article_id: &str,
        page: &PageMetadata,
        descriptors: &[ChartDescriptor],
        charts: &[ChartReport],
        run: &RunMode<'_>,
    ) -> ItemOutcome {
        let existing = match self
            .services
            .ledger
            .lookup(LedgerSheet::ArticleLibrary, article_id)
            .await
        {
            Ok(existing) => existing,
            Err(e) => return ItemOutcome::failed(article_id, &page.title, SUMMARY_STAGE, e.to_string()),
        };
        if let Some(record) = &existing {
            if !run.mode.updates_existing() {
                return duplicate(article_id, record, SUMMARY_STAGE);
            }
        }

        let listed: Vec<SummaryChart> = descriptors
            .iter()
            .zip(charts)
            .filter(|(_, report)| report.outcome.url.is_some() || report.outcome.is_success())
            .map(|(descriptor, report)| SummaryChart {
                title: report.outcome.name.clone(),
                image_url: descriptor.image_url.clone(),
                shows: descriptor.caption.clone(),
                url: report.outcome.url.clone(),
            })
            .collect();
        if listed.is_empty() {
            return ItemOutcome::skipped(article_id, &page.title, SUMMARY_STAGE, "no published charts");
        }

        let html = summary_html(&page.category, &page.technology, &listed);
        let rendered = Rendered {
            sheet: LedgerSheet::ArticleLibrary,
            key: article_id,
            name: &page.title,
            html,
        };
        match self.publish(rendered, existing, run, SUMMARY_STAGE).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "summary publish failed");
                ItemOutcome::failed(article_id, &page.title, SUMMARY_STAGE, e.to_string())
            }
        }
    }

    /// Field -> chart and chart -> article backlinks for one article.
    async fn link_batch(
        &self,
        page: &PageMetadata,
        charts: &[ChartReport],
        summary: &ItemOutcome,
        run: &RunMode<'_>,
    ) -> LinkReport {
        let mut field_requests: Vec<LinkRequest> = Vec::new();
        let mut chart_requests: Vec<LinkRequest> = Vec::new();

        for chart in charts {
            let Some(chart_url) = &chart.outcome.url else {
                continue;
            };
            for field in chart.fields.iter().filter(|f| f.url.is_some()) {
                let index = match field_requests.iter().position(|r| r.key == field.key) {
                    Some(index) => index,
                    None => {
                        field_requests.push(LinkRequest::new(
                            LedgerSheet::DataDictionary,
                            Section::Charts,
                            &field.key,
                        ));
                        field_requests.len() - 1
                    }
                };
                field_requests[index].push(RelatedLink::new(&chart.outcome.name, chart_url));
            }

            if let Some(article_url) = &summary.url {
                let mut request =
                    LinkRequest::new(LedgerSheet::ChartLibrary, Section::Articles, &chart.outcome.key);
                request.push(RelatedLink::new(&page.title, article_url));
                chart_requests.push(request);
            }
        }

        let ledger = self.services.ledger.as_ref();
        let publisher = self.services.publisher.as_ref();
        LinkReport {
            fields: link_all(ledger, publisher, run.mode, run.confirm, &field_requests).await,
            charts: link_all(ledger, publisher, run.mode, run.confirm, &chart_requests).await,
        }
    }

    // -----------------------------------------------------------------------
    // Publish / log
    // -----------------------------------------------------------------------

    /// Create, update, or preview one document and keep the ledger in step.
    ///
    /// `existing` is only `Some` in modes that update existing records.
    async fn publish(
        &self,
        doc: Rendered<'_>,
        existing: Option<PublishedRecord>,
        run: &RunMode<'_>,
        done: impl fmt::Display,
    ) -> Result<ItemOutcome> {
        let html = match &existing {
            Some(record) => carry_sections(&record.html, &doc.html),
            None => doc.html,
        };

        if !run.mode.is_mutating() {
            let diff = content_diff(existing.as_ref().map(|r| r.html.as_str()), &html);
            let mut outcome = ItemOutcome::success(doc.key, doc.name, done).with_preview(diff);
            if let Some(record) = &existing {
                outcome = outcome
                    .with_url(&record.url)
                    .with_external_id(&record.external_id);
            }
            return Ok(outcome);
        }

        if !run.confirmed(doc.key) {
            let url = existing.as_ref().map(|r| r.url.clone()).unwrap_or_default();
            return Ok(ItemOutcome::skipped(doc.key, doc.name, done, "not confirmed").with_url(url));
        }

        let ledger = self.services.ledger.as_ref();
        let publisher = self.services.publisher.as_ref();

        let document = match &existing {
            Some(record) if record.html == html && record.display_name == doc.name => {
                return Ok(ItemOutcome::skipped(doc.key, doc.name, done, "unchanged")
                    .with_url(&record.url)
                    .with_external_id(&record.external_id));
            }
            Some(record) => publisher.update(&record.external_id, doc.name, &html).await?,
            None => {
                publisher
                    .create(&NewDocument {
                        title: doc.name.to_string(),
                        body: html.clone(),
                        collection_id: self.settings.collections.for_sheet(doc.sheet).to_string(),
                    })
                    .await?
            }
        };

        let record = PublishedRecord {
            key: doc.key.to_string(),
            display_name: doc.name.to_string(),
            url: document.url.clone(),
            external_id: document.id.clone(),
            html,
        };
        let logged = if existing.is_some() {
            ledger.replace(doc.sheet, &record).await
        } else {
            ledger.append(doc.sheet, &record).await
        };
        if let Err(e) = logged {
            warn!(key = doc.key, sheet = %doc.sheet, error = %e, "published but not logged");
            return Ok(ItemOutcome::failed(doc.key, doc.name, "log", e.to_string())
                .with_url(document.url)
                .with_external_id(document.id));
        }

        info!(key = doc.key, sheet = %doc.sheet, url = %document.url, "published");
        Ok(ItemOutcome::success(doc.key, doc.name, done)
            .with_url(document.url)
            .with_external_id(document.id))
    }
}

fn duplicate(key: &str, record: &PublishedRecord, stage: impl fmt::Display) -> ItemOutcome {
    let name = if record.display_name.is_empty() {
        key
    } else {
        record.display_name.as_str()
    };
    ItemOutcome::skipped(key, name, stage, "duplicate: already published")
        .with_url(&record.url)
        .with_external_id(&record.external_id)
}
