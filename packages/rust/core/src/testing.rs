//! In-memory fakes of the client and ledger traits.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use chartdoc_clients::{
    ArticleSource, CompletionRequest, LanguageModel, NewDocument, PublishedDocument, Publisher,
    SourceArticle, WorkbookSource,
};
use chartdoc_shared::{ChartDocError, LedgerSheet, PublishedRecord, Result};
use chartdoc_storage::Ledger;

/// Two worksheets over one datasource with a single calculated measure.
pub const SOLAR_TWB: &str = r#"<?xml version='1.0' encoding='utf-8' ?>
<workbook version='18.1'>
  <datasources>
    <datasource name='federated.0abc' caption='Installs'>
      <column datatype='string' name='[State]' role='dimension' type='nominal' />
      <column datatype='real' name='[kW]' role='measure' type='quantitative' />
      <column caption='Capacity' datatype='real' name='[Calculation_111]' role='measure' type='quantitative'>
        <calculation class='tableau' formula='SUM([kW]) / 1000' />
      </column>
    </datasource>
  </datasources>
  <worksheets>
    <worksheet name='Monthly Output'>
      <table>
        <view />
        <rows>[federated.0abc].[sum:Calculation_111:qk]</rows>
        <cols>[federated.0abc].[none:State:nk]</cols>
      </table>
    </worksheet>
    <worksheet name='Regional Split'>
      <table>
        <view />
        <rows>[federated.0abc].[sum:Calculation_111:qk]</rows>
        <cols>[federated.0abc].[none:State:nk]</cols>
      </table>
    </worksheet>
  </worksheets>
</workbook>
"#;

/// Replies in order, then repeats the last one.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().expect("lock");
        if let Some(next) = self.replies.lock().expect("lock").pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

/// Answers with the first rule whose needle occurs in the user prompt.
pub struct RuleModel {
    rules: Vec<(String, String)>,
    calls: AtomicUsize,
}

impl RuleModel {
    pub fn new(rules: &[(&str, &str)]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|(n, r)| (n.to_string(), r.to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for RuleModel {
    fn model(&self) -> &str {
        "rules"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rules
            .iter()
            .find(|(needle, _)| request.user.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| ChartDocError::Llm("no scripted reply".into()))
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<(LedgerSheet, PublishedRecord)>>,
    writes: AtomicUsize,
    /// Keys whose next append fails once.
    fail_once: Mutex<Vec<String>>,
}

impl MemoryLedger {
    pub fn failing_append(self, key: &str) -> Self {
        self.fail_once.lock().expect("lock").push(key.to_string());
        self
    }

    pub fn with(self, sheet: LedgerSheet, record: PublishedRecord) -> Self {
        self.rows.lock().expect("lock").push((sheet, record));
        self
    }

    pub fn get(&self, sheet: LedgerSheet, key: &str) -> Option<PublishedRecord> {
        self.rows
            .lock()
            .expect("lock")
            .iter()
            .find(|(s, r)| *s == sheet && r.key == key)
            .map(|(_, r)| r.clone())
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn lookup(&self, sheet: LedgerSheet, key: &str) -> Result<Option<PublishedRecord>> {
        Ok(self.get(sheet, key))
    }

    async fn append(&self, sheet: LedgerSheet, record: &PublishedRecord) -> Result<()> {
        {
            let mut fail_once = self.fail_once.lock().expect("lock");
            if let Some(at) = fail_once.iter().position(|k| *k == record.key) {
                fail_once.remove(at);
                return Err(ChartDocError::Storage("transient append failure".into()));
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.rows
            .lock()
            .expect("lock")
            .push((sheet, record.clone()));
        Ok(())
    }

    async fn delete(&self, sheet: LedgerSheet, key: &str) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().expect("lock");
        let before = rows.len();
        rows.retain(|(s, r)| !(*s == sheet && r.key == key));
        Ok(rows.len() != before)
    }
}

/// Records every call as `"create:<title>"`, `"update:<id>"`, `"delete:<id>"`.
#[derive(Default)]
pub struct RecordingPublisher {
    calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl RecordingPublisher {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn url_for(id: &str) -> String {
        format!("https://help.test/articles/{id}")
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn create(&self, doc: &NewDocument) -> Result<PublishedDocument> {
        self.calls
            .lock()
            .expect("lock")
            .push(format!("create:{}", doc.title));
        let id = format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(PublishedDocument {
            url: Self::url_for(&id),
            id,
        })
    }

    async fn update(&self, id: &str, _title: &str, _body: &str) -> Result<PublishedDocument> {
        self.calls.lock().expect("lock").push(format!("update:{id}"));
        Ok(PublishedDocument {
            id: id.to_string(),
            url: Self::url_for(id),
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.calls.lock().expect("lock").push(format!("delete:{id}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeArticles {
    articles: HashMap<String, SourceArticle>,
}

impl FakeArticles {
    pub fn with(mut self, id: &str, title: &str, html: &str) -> Self {
        self.articles.insert(
            id.to_string(),
            SourceArticle {
                id: id.to_string(),
                title: title.to_string(),
                html: html.to_string(),
                base_url: None,
            },
        );
        self
    }
}

#[async_trait]
impl ArticleSource for FakeArticles {
    async fn fetch_article(&self, id: &str) -> Result<SourceArticle> {
        self.articles
            .get(id)
            .cloned()
            .ok_or_else(|| ChartDocError::Network(format!("article {id}: HTTP 404 Not Found")))
    }
}

/// Every view resolves to one workbook unless listed as missing.
pub struct FakeWorkbooks {
    bytes: Vec<u8>,
    missing_views: Vec<String>,
}

impl FakeWorkbooks {
    pub fn new(xml: &str) -> Self {
        Self {
            bytes: xml.as_bytes().to_vec(),
            missing_views: Vec::new(),
        }
    }

    pub fn without_view(mut self, view: &str) -> Self {
        self.missing_views.push(view.to_string());
        self
    }
}

#[async_trait]
impl WorkbookSource for FakeWorkbooks {
    async fn find_workbook(&self, view_name: &str, _project_id: &str) -> Result<Option<String>> {
        if self.missing_views.iter().any(|v| v == view_name) {
            return Ok(None);
        }
        Ok(Some("wb-1".into()))
    }

    async fn download_workbook(&self, _workbook_id: &str) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}
