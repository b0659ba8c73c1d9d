use async_trait::async_trait;
use hdc_core::{CaseSummary, EscalationStatus};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("escalation {0} not found")]
    NotFound(String),
    #[error("unexpected status {status} from {path}")]
    Status { status: u16, path: String },
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub case_number: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub concern: String,
    #[serde(default)]
    pub status: EscalationStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub business_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl EscalationRecord {
    pub fn summary(&self) -> CaseSummary {
        CaseSummary {
            customer_name: self.customer_name.clone(),
            concern: self.concern.clone(),
            case_number: self.case_number.clone(),
            session_id: self.session_id.clone(),
            business_id: self.business_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationQuery {
    pub status: Option<EscalationStatus>,
    pub page: u32,
    pub limit: u32,
}

impl Default for EscalationQuery {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// The slice of the case backend the workspace core talks to.
#[async_trait]
pub trait EscalationApi: Send + Sync {
    async fn summary(&self, escalation_id: &str) -> Result<CaseSummary, LookupError>;

    async fn list(
        &self,
        business_id: &str,
        query: &EscalationQuery,
    ) -> Result<Vec<EscalationRecord>, LookupError>;

    async fn count(&self, business_id: &str) -> Result<u64, LookupError>;

    async fn update_status(
        &self,
        escalation_id: &str,
        status: EscalationStatus,
    ) -> Result<EscalationStatus, LookupError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Body<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Body<T> {
    fn into_inner(self) -> T {
        match self {
            Body::Wrapped { data } => data,
            Body::Bare(value) => value,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CountBody {
    count: u64,
}

#[derive(Debug, Serialize)]
struct StatusPatch {
    status: EscalationStatus,
}

#[derive(Debug, Clone)]
pub struct HttpEscalationClient {
    http: Client,
    base_url: Url,
}

impl HttpEscalationClient {
    pub fn new(
        base_url: &str,
        timeout: Option<Duration>,
        token: Option<&str>,
    ) -> Result<Self, LookupError> {
        let base_url =
            Url::parse(base_url).map_err(|err| LookupError::InvalidBaseUrl(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(LookupError::InvalidBaseUrl(base_url.to_string()));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = token.map(str::trim).filter(|value| !value.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| LookupError::InvalidBaseUrl("invalid api token".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = Client::builder().default_headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            base_url,
        })
    }

    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, LookupError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LookupError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        not_found_id: &str,
    ) -> Result<T, LookupError> {
        debug!(event = "escalation_request", url = %url);
        let response = self.http.get(url.clone()).send().await?;
        let response = check_status(response, &url, not_found_id)?;
        let body: Body<T> = response.json().await?;
        Ok(body.into_inner())
    }
}

fn check_status(
    response: reqwest::Response,
    url: &Url,
    not_found_id: &str,
) -> Result<reqwest::Response, LookupError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(LookupError::NotFound(not_found_id.to_string()));
    }
    if !status.is_success() {
        return Err(LookupError::Status {
            status: status.as_u16(),
            path: url.path().to_string(),
        });
    }
    Ok(response)
}

#[async_trait]
impl EscalationApi for HttpEscalationClient {
    async fn summary(&self, escalation_id: &str) -> Result<CaseSummary, LookupError> {
        let url = self.endpoint(&["escalation", escalation_id])?;
        let record: EscalationRecord = self.get_json(url, escalation_id).await?;
        Ok(record.summary())
    }

    async fn list(
        &self,
        business_id: &str,
        query: &EscalationQuery,
    ) -> Result<Vec<EscalationRecord>, LookupError> {
        let mut url = self.endpoint(&["escalation", "business", business_id])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(status) = query.status {
                pairs.append_pair("status", status.as_str());
            }
            pairs
                .append_pair("page", &query.page.to_string())
                .append_pair("limit", &query.limit.to_string());
        }
        self.get_json(url, business_id).await
    }

    async fn count(&self, business_id: &str) -> Result<u64, LookupError> {
        let url = self.endpoint(&["escalation", "business", business_id, "count"])?;
        let body: CountBody = self.get_json(url, business_id).await?;
        Ok(body.count)
    }

    async fn update_status(
        &self,
        escalation_id: &str,
        status: EscalationStatus,
    ) -> Result<EscalationStatus, LookupError> {
        let url = self.endpoint(&["escalation", escalation_id])?;
        let response = self
            .http
            .patch(url.clone())
            .json(&StatusPatch { status })
            .send()
            .await?;
        let response = check_status(response, &url, escalation_id)?;
        let body: Body<EscalationRecord> = response.json().await?;
        Ok(body.into_inner().status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: EscalationStatus,
    pub requested: EscalationStatus,
}

/// Optimistic case-status edits. A change is applied locally at once and later either
/// confirmed with the server's value or rolled back to the previous one.
#[derive(Debug, Default)]
pub struct CaseStatusBoard {
    statuses: BTreeMap<String, EscalationStatus>,
    in_flight: BTreeMap<String, StatusChange>,
}

impl CaseStatusBoard {
    pub fn seed(&mut self, records: &[EscalationRecord]) {
        for record in records {
            if !self.in_flight.contains_key(&record.id) {
                self.statuses.insert(record.id.clone(), record.status);
            }
        }
    }

    pub fn status(&self, escalation_id: &str) -> Option<EscalationStatus> {
        self.statuses.get(escalation_id).copied()
    }

    pub fn is_in_flight(&self, escalation_id: &str) -> bool {
        self.in_flight.contains_key(escalation_id)
    }

    /// Returns `None` when another change for the same case is still unconfirmed.
    pub fn apply_local(
        &mut self,
        escalation_id: &str,
        requested: EscalationStatus,
    ) -> Option<StatusChange> {
        if self.in_flight.contains_key(escalation_id) {
            return None;
        }
        let previous = self.status(escalation_id).unwrap_or_default();
        let change = StatusChange {
            previous,
            requested,
        };
        self.statuses.insert(escalation_id.to_string(), requested);
        self.in_flight.insert(escalation_id.to_string(), change);
        Some(change)
    }

    pub fn reconcile(
        &mut self,
        escalation_id: &str,
        outcome: Result<EscalationStatus, &LookupError>,
    ) -> EscalationStatus {
        let Some(change) = self.in_flight.remove(escalation_id) else {
            return self.status(escalation_id).unwrap_or_default();
        };
        let settled = match outcome {
            Ok(confirmed) => confirmed,
            Err(err) => {
                warn!(
                    event = "case_status_rolled_back",
                    escalation_id = escalation_id,
                    error = %err
                );
                change.previous
            }
        };
        self.statuses.insert(escalation_id.to_string(), settled);
        settled
    }

    pub async fn set_status<A: EscalationApi + ?Sized>(
        &mut self,
        api: &A,
        escalation_id: &str,
        requested: EscalationStatus,
    ) -> Option<Result<EscalationStatus, LookupError>> {
        self.apply_local(escalation_id, requested)?;
        let outcome = api.update_status(escalation_id, requested).await;
        let settled = self.reconcile(escalation_id, outcome.as_ref().copied());
        Some(outcome.map(|_| settled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpEscalationClient {
        HttpEscalationClient::new("https://api.example.test/v1/", None, Some("tok"))
            .expect("client")
    }

    #[test]
    fn endpoints_escape_path_segments() {
        let url = client().endpoint(&["escalation", "a/b c"]).expect("url");
        assert_eq!(url.as_str(), "https://api.example.test/v1/escalation/a%2Fb%20c");

        let count = client()
            .endpoint(&["escalation", "business", "biz-1", "count"])
            .expect("url");
        assert_eq!(count.path(), "/v1/escalation/business/biz-1/count");
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(matches!(
            HttpEscalationClient::new("mailto:desk@example.test", None, None),
            Err(LookupError::InvalidBaseUrl(_))
        ));
        assert!(HttpEscalationClient::new("not a url", None, None).is_err());
    }

    #[test]
    fn body_accepts_wrapped_and_bare_records() {
        let wrapped: Body<EscalationRecord> = serde_json::from_str(
            r#"{"data":{"_id":"E1","caseNumber":"42","customerName":"Ada","concern":"Refund","status":"pending"}}"#,
        )
        .expect("wrapped");
        let bare: Body<EscalationRecord> =
            serde_json::from_str(r#"{"id":"E1","caseNumber":"42"}"#).expect("bare");

        let wrapped = wrapped.into_inner();
        assert_eq!(wrapped.id, "E1");
        assert_eq!(wrapped.status, EscalationStatus::Pending);
        assert_eq!(wrapped.summary().customer_name, "Ada");
        assert_eq!(bare.into_inner().case_number, "42");
    }

    struct FakeApi {
        confirm: Option<EscalationStatus>,
    }

    #[async_trait]
    impl EscalationApi for FakeApi {
        async fn summary(&self, escalation_id: &str) -> Result<CaseSummary, LookupError> {
            Err(LookupError::NotFound(escalation_id.to_string()))
        }

        async fn list(
            &self,
            _business_id: &str,
            _query: &EscalationQuery,
        ) -> Result<Vec<EscalationRecord>, LookupError> {
            Ok(Vec::new())
        }

        async fn count(&self, _business_id: &str) -> Result<u64, LookupError> {
            Ok(0)
        }

        async fn update_status(
            &self,
            escalation_id: &str,
            _status: EscalationStatus,
        ) -> Result<EscalationStatus, LookupError> {
            self.confirm
                .ok_or_else(|| LookupError::NotFound(escalation_id.to_string()))
        }
    }

    fn seeded_board() -> CaseStatusBoard {
        let mut board = CaseStatusBoard::default();
        board.seed(&[EscalationRecord {
            id: "E1".to_string(),
            status: EscalationStatus::Open,
            ..EscalationRecord::default()
        }]);
        board
    }

    #[tokio::test]
    async fn confirmed_change_takes_server_value() {
        let mut board = seeded_board();
        let api = FakeApi {
            confirm: Some(EscalationStatus::Resolved),
        };
        let result = board
            .set_status(&api, "E1", EscalationStatus::Pending)
            .await
            .expect("not in flight");
        assert_eq!(result.expect("confirmed"), EscalationStatus::Resolved);
        assert_eq!(board.status("E1"), Some(EscalationStatus::Resolved));
        assert!(!board.is_in_flight("E1"));
    }

    #[tokio::test]
    async fn failed_change_rolls_back() {
        let mut board = seeded_board();
        let api = FakeApi { confirm: None };
        let result = board
            .set_status(&api, "E1", EscalationStatus::Closed)
            .await
            .expect("not in flight");
        assert!(result.is_err());
        assert_eq!(board.status("E1"), Some(EscalationStatus::Open));
    }

    #[test]
    fn overlapping_changes_are_refused_and_seed_does_not_clobber() {
        let mut board = seeded_board();
        let change = board
            .apply_local("E1", EscalationStatus::Pending)
            .expect("first change");
        assert_eq!(change.previous, EscalationStatus::Open);
        assert_eq!(board.status("E1"), Some(EscalationStatus::Pending));
        assert_eq!(board.apply_local("E1", EscalationStatus::Closed), None);

        board.seed(&[EscalationRecord {
            id: "E1".to_string(),
            status: EscalationStatus::Open,
            ..EscalationRecord::default()
        }]);
        assert_eq!(board.status("E1"), Some(EscalationStatus::Pending));
    }
}
