//! Tableau REST API: sign-in, view search, workbook download.

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use chartdoc_shared::{ChartDocError, Result, TableauConfig, resolve_secret};

use crate::http::{build_client, excerpt, read_json, read_text, trim_slash};

/// Locates and downloads the workbook behind a chart view.
#[async_trait]
pub trait WorkbookSource: Send + Sync {
    /// Workbook ID for `view_name` within `project_id`, or `None` when no
    /// workbook in that project carries the view.
    async fn find_workbook(&self, view_name: &str, project_id: &str) -> Result<Option<String>>;

    /// Raw workbook bytes (`.twb` XML or a `.twbx` zip).
    async fn download_workbook(&self, workbook_id: &str) -> Result<Vec<u8>>;
}

/// Unauthenticated client; call [`TableauClient::sign_in`] once per batch.
pub struct TableauClient {
    client: Client,
    server_url: String,
    username: String,
    password: String,
    site: String,
    api_version: String,
    signin_api_version: String,
}

/// An authenticated session.
pub struct TableauSession {
    client: Client,
    server_url: String,
    api_version: String,
    token: String,
    site_id: String,
}

impl TableauClient {
    pub fn new(config: &TableauConfig) -> Result<Self> {
        if config.server_url.trim().is_empty() {
            return Err(ChartDocError::config("tableau.server_url is not set"));
        }
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            server_url: trim_slash(&config.server_url),
            username: config.username.clone(),
            password: resolve_secret(&config.password_env)?,
            site: config.site.clone(),
            api_version: config.api_version.clone(),
            signin_api_version: config.signin_api_version.clone(),
        })
    }

    /// Exchange credentials for an auth token and site ID.
    #[instrument(skip_all, fields(server = %self.server_url, site = %self.site))]
    pub async fn sign_in(&self) -> Result<TableauSession> {
        let url = format!(
            "{}/api/{}/auth/signin",
            self.server_url, self.signin_api_version
        );
        let payload = format!(
            r#"<tsRequest><credentials name="{}" password="{}"><site contentUrl="{}" /></credentials></tsRequest>"#,
            escape(self.username.as_str()),
            escape(self.password.as_str()),
            escape(self.site.as_str()),
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/xml")
            .header("Accept", "application/xml")
            .body(payload)
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("tableau sign-in: {e}")))?;
        let xml = read_text(response, "tableau sign-in").await?;
        let (token, site_id) = parse_credentials(&xml)?;

        info!(%site_id, "signed in to tableau");
        Ok(TableauSession {
            client: self.client.clone(),
            server_url: self.server_url.clone(),
            api_version: self.api_version.clone(),
            token,
            site_id,
        })
    }
}

/// Pull `credentials@token` and `site@id` out of the sign-in reply.
fn parse_credentials(xml: &str) -> Result<(String, String)> {
    let mut reader = Reader::from_str(xml);
    let mut token = None;
    let mut site_id = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"credentials" => token = attribute(&e, "token")?,
                b"site" => site_id = attribute(&e, "id")?,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ChartDocError::parse(format!("tableau sign-in reply: {e}")));
            }
        }
    }

    match (token, site_id) {
        (Some(token), Some(site_id)) if !token.is_empty() => Ok((token, site_id)),
        _ => Err(ChartDocError::config(
            "tableau sign-in reply carries no token or site id",
        )),
    }
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let attr = e
        .try_get_attribute(name)
        .map_err(|err| ChartDocError::parse(format!("bad attribute: {err}")))?;
    attr.map(|a| {
        a.unescape_value()
            .map(|v| v.into_owned())
            .map_err(|err| ChartDocError::parse(format!("bad attribute value: {err}")))
    })
    .transpose()
}

#[derive(Deserialize)]
struct ViewsReply {
    #[serde(default)]
    views: ViewList,
}

#[derive(Default, Deserialize)]
struct ViewList {
    #[serde(default)]
    view: Vec<ViewEntry>,
}

#[derive(Deserialize)]
struct ViewEntry {
    #[serde(default)]
    workbook: Option<IdRef>,
    #[serde(default)]
    project: Option<IdRef>,
}

#[derive(Deserialize)]
struct IdRef {
    id: String,
}

impl TableauSession {
    fn site_url(&self) -> String {
        format!(
            "{}/api/{}/sites/{}",
            self.server_url, self.api_version, self.site_id
        )
    }
}

#[async_trait]
impl WorkbookSource for TableauSession {
    #[instrument(skip_all, fields(view = %view_name))]
    async fn find_workbook(&self, view_name: &str, project_id: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(format!("{}/views", self.site_url()))
            .query(&[("filter", format!("name:eq:{view_name}"))])
            .header("X-Tableau-Auth", &self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("view search {view_name}: {e}")))?;
        let reply: ViewsReply = read_json(response, &format!("view search {view_name}")).await?;

        let candidates: Vec<(String, String)> = reply
            .views
            .view
            .into_iter()
            .filter_map(|v| Some((v.project?.id, v.workbook?.id)))
            .collect();
        debug!(candidates = candidates.len(), "views matched");

        let project_id = project_id.trim();
        Ok(candidates
            .into_iter()
            .find(|(project, _)| project_id.is_empty() || project == project_id)
            .map(|(_, workbook)| workbook))
    }

    #[instrument(skip_all, fields(workbook = %workbook_id))]
    async fn download_workbook(&self, workbook_id: &str) -> Result<Vec<u8>> {
        let context = format!("workbook {workbook_id}");
        let response = self
            .client
            .get(format!("{}/workbooks/{workbook_id}/content", self.site_url()))
            .header("X-Tableau-Auth", &self.token)
            .header("Accept", "*/*")
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("{context}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChartDocError::Network(format!(
                "{context}: HTTP {status}: {}",
                excerpt(&body)
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChartDocError::Network(format!("{context}: failed to read body: {e}")))?;
        debug!(bytes = bytes.len(), "workbook downloaded");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SIGNIN_REPLY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tsResponse xmlns="http://tableau.com/api">
  <credentials token="tok-123" estimatedTimeToExpiration="365:00:00">
    <site id="site-9" contentUrl="analytics"/>
    <user id="user-1"/>
  </credentials>
</tsResponse>"#;

    fn client_for(server: &MockServer) -> TableauClient {
        TableauClient {
            client: build_client(5).expect("client"),
            server_url: server.uri(),
            username: "ops".into(),
            password: "p<ss".into(),
            site: "analytics".into(),
            api_version: "3.20".into(),
            signin_api_version: "3.19".into(),
        }
    }

    async fn signed_in(server: &MockServer) -> TableauSession {
        Mock::given(method("POST"))
            .and(path("/api/3.19/auth/signin"))
            .and(body_string_contains(r#"password="p&lt;ss""#))
            .respond_with(ResponseTemplate::new(200).set_body_string(SIGNIN_REPLY))
            .mount(server)
            .await;
        client_for(server).sign_in().await.expect("sign in")
    }

    #[tokio::test]
    async fn sign_in_reads_token_and_site() {
        let server = MockServer::start().await;
        let session = signed_in(&server).await;
        assert_eq!(session.token, "tok-123");
        assert_eq!(session.site_id, "site-9");
    }

    #[tokio::test]
    async fn rejected_sign_in_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("<error/>"))
            .mount(&server)
            .await;
        let err = client_for(&server).sign_in().await.err().expect("error");
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn reply_without_token_is_rejected() {
        let err = parse_credentials("<tsResponse><site id=\"s\"/></tsResponse>").unwrap_err();
        assert!(matches!(err, ChartDocError::Config { .. }));
    }

    #[tokio::test]
    async fn workbook_is_selected_by_project() {
        let server = MockServer::start().await;
        let session = signed_in(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/3.20/sites/site-9/views"))
            .and(query_param("filter", "name:eq:Monthly Output"))
            .and(header("X-Tableau-Auth", "tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "views": {"view": [
                    {"workbook": {"id": "wb-sandbox"}, "project": {"id": "proj-sandbox"}},
                    {"workbook": {"id": "wb-global"}, "project": {"id": "proj-global"}}
                ]}
            })))
            .mount(&server)
            .await;

        let found = session
            .find_workbook("Monthly Output", "proj-global")
            .await
            .expect("search");
        assert_eq!(found.as_deref(), Some("wb-global"));

        let missing = session
            .find_workbook("Monthly Output", "proj-other")
            .await
            .expect("search");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn empty_search_finds_nothing() {
        let server = MockServer::start().await;
        let session = signed_in(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/3.20/sites/site-9/views"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pagination": {"totalAvailable": "0"}, "views": {}
            })))
            .mount(&server)
            .await;

        let found = session.find_workbook("Nope", "").await.expect("search");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn download_returns_raw_bytes() {
        let server = MockServer::start().await;
        let session = signed_in(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/3.20/sites/site-9/workbooks/wb-1/content"))
            .and(header("X-Tableau-Auth", "tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04rest".to_vec()))
            .mount(&server)
            .await;

        let bytes = session.download_workbook("wb-1").await.expect("download");
        assert!(bytes.starts_with(b"PK\x03\x04"));
    }
}
