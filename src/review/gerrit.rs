//! Gerrit REST client.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::GerritConfig;
use crate::error::{Error, Result};

use super::{Change, ChangeStatus, ReviewInput, ReviewService, Revision};

/// Prefix Gerrit puts in front of every JSON body against XSSI.
const XSSI_PREFIX: &str = ")]}'";

/// Discovery query: open, mergeable changes of one project that the bot
/// account has already looked at and that carry the verification label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeQuery {
    pub project: String,
    pub reviewed_by: String,
    pub label: String,
}

impl ChangeQuery {
    pub fn from_config(config: &GerritConfig) -> Self {
        Self {
            project: config.project.clone(),
            reviewed_by: config.bot_reviewer.clone(),
            label: config.label.clone(),
        }
    }
}

impl std::fmt::Display for ChangeQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "status:open project:{} reviewedby:{} is:mergeable label:{}",
            self.project, self.reviewed_by, self.label
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChangeInfo {
    change_id: String,
    #[serde(rename = "_number")]
    number: u64,
    #[serde(default)]
    subject: String,
    status: ChangeStatus,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    current_revision: Option<String>,
    #[serde(default)]
    revisions: HashMap<String, RevisionInfo>,
}

#[derive(Debug, Deserialize)]
struct RevisionInfo {
    #[serde(rename = "_number")]
    number: u32,
    #[serde(rename = "ref")]
    fetch_ref: String,
}

impl From<ChangeInfo> for Change {
    fn from(mut info: ChangeInfo) -> Self {
        let revision = info
            .current_revision
            .as_ref()
            .and_then(|sha| info.revisions.remove(sha))
            .map(|rev| Revision {
                patch_number: rev.number,
                fetch_ref: rev.fetch_ref,
            });
        Change {
            change_id: info.change_id,
            number: info.number,
            subject: info.subject,
            status: info.status,
            mergeable: info.mergeable,
            revision,
        }
    }
}

/// Strips the XSSI guard line and parses the remaining JSON.
fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    let json = body.trim_start().strip_prefix(XSSI_PREFIX).unwrap_or(body);
    serde_json::from_str(json).map_err(|e| Error::Network(format!("malformed response: {}", e)))
}

/// [`ReviewService`] backed by a Gerrit server.
pub struct GerritClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl GerritClient {
    /// Builds a client with the configured request timeout and credentials.
    pub fn new(config: &GerritConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("patch-verifier/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Authenticated endpoints live under `/a/`.
    fn endpoint(&self, path: &str) -> String {
        if self.credentials.is_some() {
            format!("{}/a/{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    async fn get_changes(&self, params: &[(&str, &str)]) -> Result<Vec<ChangeInfo>> {
        let url = self.endpoint("changes/");
        let response = self
            .authorize(self.http.get(&url).query(params))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        parse_body(&body)
    }
}

#[async_trait]
impl ReviewService for GerritClient {
    async fn query_changes(&self, query: &str) -> Result<Vec<Change>> {
        let changes: Vec<Change> = self
            .get_changes(&[("q", query)])
            .await?
            .into_iter()
            .map(Change::from)
            .collect();
        tracing::debug!(query = %query, count = changes.len(), "queried changes");
        Ok(changes)
    }

    async fn current_revision(&self, number: u64) -> Result<Revision> {
        let number_str = number.to_string();
        let info = self
            .get_changes(&[("q", number_str.as_str()), ("o", "CURRENT_REVISION")])
            .await?
            .into_iter()
            .find(|info| info.number == number)
            .ok_or_else(|| Error::Network(format!("change {} not found", number)))?;

        Change::from(info)
            .revision
            .ok_or_else(|| Error::Network(format!("change {} has no current revision", number)))
    }

    async fn is_open(&self, number: u64) -> Result<bool> {
        let query = format!("status:open {}", number);
        let open = self
            .get_changes(&[("q", query.as_str())])
            .await?
            .iter()
            .any(|info| info.number == number);
        Ok(open)
    }

    async fn post_review(
        &self,
        number: u64,
        patch_number: u32,
        review: &ReviewInput,
    ) -> Result<()> {
        if self.credentials.is_none() {
            return Err(Error::Network(
                "posting a review requires Gerrit credentials".to_string(),
            ));
        }

        let url = self.endpoint(&format!(
            "changes/{}/revisions/{}/review",
            number, patch_number
        ));
        self.authorize(self.http.post(&url).json(review))
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(change = number, patch = patch_number, "review posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{basic_auth, body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHANGES: &str = r#")]}'
[
  {
    "id": "NLSR~master~I1111",
    "project": "NLSR",
    "change_id": "I1111",
    "subject": "route: fix FIB update",
    "status": "NEW",
    "mergeable": true,
    "_number": 4567
  },
  {
    "id": "NLSR~master~I2222",
    "project": "NLSR",
    "change_id": "I2222",
    "subject": "docs: typo",
    "status": "NEW",
    "_number": 4570
  }
]
"#;

    const CURRENT: &str = r#")]}'
[
  {
    "change_id": "I1111",
    "subject": "route: fix FIB update",
    "status": "NEW",
    "_number": 4567,
    "current_revision": "abc123",
    "revisions": {
      "abc123": { "_number": 3, "ref": "refs/changes/67/4567/3" }
    }
  }
]
"#;

    fn config(server: &MockServer, authenticated: bool) -> GerritConfig {
        let mut config = GerritConfig {
            url: server.uri(),
            ..GerritConfig::default()
        };
        if authenticated {
            config.username = Some("verifier".to_string());
            config.password = Some("secret".to_string());
        }
        config
    }

    #[test]
    fn discovery_query_has_all_filters() {
        let query = ChangeQuery::from_config(&GerritConfig::default());
        assert_eq!(
            query.to_string(),
            "status:open project:NLSR reviewedby:jenkins is:mergeable label:Verified"
        );
    }

    #[test]
    fn parse_body_strips_xssi_prefix() {
        let values: Vec<u32> = parse_body(")]}'\n[1, 2]").unwrap();
        assert_eq!(values, vec![1, 2]);
        let plain: Vec<u32> = parse_body("[3]").unwrap();
        assert_eq!(plain, vec![3]);
        assert!(parse_body::<Vec<u32>>(")]}'\nnot json").is_err());
    }

    #[tokio::test]
    async fn query_changes_uses_authenticated_endpoint() {
        let server = MockServer::start().await;
        let query = "status:open project:NLSR";
        Mock::given(method("GET"))
            .and(path("/a/changes/"))
            .and(query_param("q", query))
            .and(basic_auth("verifier", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CHANGES))
            .expect(1)
            .mount(&server)
            .await;

        let client = GerritClient::new(&config(&server, true)).unwrap();
        let changes = client.query_changes(query).await.unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_id, "I1111");
        assert_eq!(changes[0].number, 4567);
        assert!(changes[0].is_open());
        assert_eq!(changes[0].mergeable, Some(true));
        assert!(changes[0].revision.is_none());
        assert_eq!(changes[1].mergeable, None);
    }

    #[tokio::test]
    async fn anonymous_client_queries_public_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/changes/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(")]}'\n[]"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GerritClient::new(&config(&server, false)).unwrap();
        assert!(client.query_changes("status:open").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn current_revision_resolves_fetch_ref() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/changes/"))
            .and(query_param("q", "4567"))
            .and(query_param("o", "CURRENT_REVISION"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CURRENT))
            .mount(&server)
            .await;

        let client = GerritClient::new(&config(&server, true)).unwrap();
        let revision = client.current_revision(4567).await.unwrap();

        assert_eq!(
            revision,
            Revision {
                patch_number: 3,
                fetch_ref: "refs/changes/67/4567/3".to_string()
            }
        );
    }

    #[tokio::test]
    async fn current_revision_of_unknown_change_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/changes/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(")]}'\n[]"))
            .mount(&server)
            .await;

        let client = GerritClient::new(&config(&server, true)).unwrap();
        let err = client.current_revision(1).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn is_open_checks_status_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/changes/"))
            .and(query_param("q", "status:open 4567"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CHANGES))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a/changes/"))
            .and(query_param("q", "status:open 9999"))
            .respond_with(ResponseTemplate::new(200).set_body_string(")]}'\n[]"))
            .mount(&server)
            .await;

        let client = GerritClient::new(&config(&server, true)).unwrap();
        assert!(client.is_open(4567).await.unwrap());
        assert!(!client.is_open(9999).await.unwrap());
    }

    #[tokio::test]
    async fn post_review_sends_message_and_label() {
        let server = MockServer::start().await;
        let review = ReviewInput {
            message: "All tests passed!".to_string(),
            labels: BTreeMap::from([("Verified".to_string(), 1)]),
        };
        Mock::given(method("POST"))
            .and(path("/a/changes/4567/revisions/3/review"))
            .and(basic_auth("verifier", "secret"))
            .and(body_json(serde_json::json!({
                "message": "All tests passed!",
                "labels": { "Verified": 1 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(")]}'\n{}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GerritClient::new(&config(&server, true)).unwrap();
        client.post_review(4567, 3, &review).await.unwrap();
    }

    #[tokio::test]
    async fn server_error_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = GerritClient::new(&config(&server, true)).unwrap();
        let review = ReviewInput {
            message: "x".to_string(),
            labels: BTreeMap::new(),
        };
        let err = client.post_review(1, 1, &review).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn posting_without_credentials_fails_early() {
        let server = MockServer::start().await;
        let client = GerritClient::new(&config(&server, false)).unwrap();
        let review = ReviewInput {
            message: "x".to_string(),
            labels: BTreeMap::new(),
        };

        assert!(client.post_review(1, 1, &review).await.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
