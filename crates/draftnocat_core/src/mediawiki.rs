use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BotConfig;

pub const NS_MAIN: i32 = 0;
pub const NS_USER: i32 = 2;
pub const NS_USER_TALK: i32 = 3;
pub const NS_CATEGORY: i32 = 14;
pub const NS_DRAFT: i32 = 118;
pub const NS_DRAFT_TALK: i32 = 119;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePage {
    pub title: String,
    pub namespace: i32,
    pub page_id: i64,
    pub revision_id: i64,
    pub timestamp: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMember {
    pub page_id: i64,
    pub namespace: i32,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct EditRequest {
    pub title: String,
    pub text: String,
    pub summary: String,
    pub minor: bool,
    pub bot: bool,
    /// Revision the new text was derived from. The wiki reports an edit
    /// conflict when the page moved on since then.
    pub base_revision_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Saved { revision_id: Option<i64> },
    NoChange,
}

/// Reads page text.
pub trait PageSource {
    /// Latest revision of the page, or `None` when the page is missing or
    /// has no readable main slot.
    fn fetch_page(&mut self, page_id: i64, follow_redirects: bool) -> Result<Option<RemotePage>>;
    fn request_count(&self) -> usize;
}

/// Writes page text back. Errors (authentication, edit conflicts, rate
/// limits) propagate to the caller.
pub trait PageWriter: PageSource {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn edit_page(&mut self, request: &EditRequest) -> Result<EditOutcome>;
}

/// Lists pages in a category.
pub trait CategoryApi {
    fn category_members(&mut self, category: &str, namespaces: &[i32])
    -> Result<Vec<CategoryMember>>;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
    pub maxlag_seconds: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let api_url = config.api_url().ok_or_else(|| {
            anyhow::anyhow!("wiki API URL is not configured (set WIKI_API_URL or [wiki].api_url)")
        })?;
        Url::parse(&api_url).with_context(|| format!("invalid wiki API URL: {api_url}"))?;
        Ok(Self {
            api_url,
            user_agent: config.user_agent(),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
            maxlag_seconds: env_value_u64("WIKI_MAXLAG", 5),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    fn request_json(
        &mut self,
        method: Method,
        params: &[(&str, String)],
        is_write: bool,
    ) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", self.config.api_url))?;
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };

        let mut pairs = Vec::with_capacity(params.len() + 3);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        if self.config.maxlag_seconds > 0 {
            pairs.push(("maxlag".to_string(), self.config.maxlag_seconds.to_string()));
        }
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let request: RequestBuilder = match method {
                Method::Get => self.client.get(base_url.clone()).query(&pairs),
                Method::Post => self.client.post(base_url.clone()).form(&pairs),
            };

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            warn!(%status, attempt, "retrying MediaWiki request");
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some((code, info)) = api_error(&payload) {
                        if attempt < max_retries && is_retryable_api_code(&code) {
                            warn!(code = %code, attempt, "retrying throttled MediaWiki request");
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        warn!(%error, attempt, "retrying MediaWiki request");
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json(
            Method::Get,
            &[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
            ],
            false,
        )?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

impl PageSource for MediaWikiClient {
    fn fetch_page(&mut self, page_id: i64, follow_redirects: bool) -> Result<Option<RemotePage>> {
        let params = vec![
            ("action", "query".to_string()),
            ("pageids", page_id.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content|timestamp|ids".to_string()),
            ("rvslots", "main".to_string()),
            (
                "redirects",
                if follow_redirects { "1" } else { "" }.to_string(),
            ),
        ];
        let response = self.request_json(Method::Get, &params, false)?;
        parse_page_response(response)
            .with_context(|| format!("failed to decode revisions response for page {page_id}"))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl PageWriter for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json(
            Method::Get,
            &[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", "login".to_string()),
            ],
            false,
        )?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json(
            Method::Post,
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                debug!(user = username, "logged in to MediaWiki");
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn edit_page(&mut self, request: &EditRequest) -> Result<EditOutcome> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json(
            Method::Post,
            &[
                ("action", "edit".to_string()),
                ("title", request.title.clone()),
                ("text", request.text.clone()),
                ("summary", request.summary.clone()),
                (
                    if request.minor { "minor" } else { "notminor" },
                    "1".to_string(),
                ),
                ("bot", if request.bot { "1" } else { "" }.to_string()),
                (
                    "baserevid",
                    request
                        .base_revision_id
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                ),
                ("nocreate", "1".to_string()),
                ("watchlist", "nochange".to_string()),
                ("token", token),
            ],
            true,
        )?;
        parse_edit_response(response, &request.title)
    }
}

impl CategoryApi for MediaWikiClient {
    fn category_members(
        &mut self,
        category: &str,
        namespaces: &[i32],
    ) -> Result<Vec<CategoryMember>> {
        let mut members = Vec::new();
        let mut continue_token: Option<String> = None;
        let category_title = format!("Category:{}", category.replace('_', " "));
        let namespace_filter = namespaces
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|");

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "categorymembers".to_string()),
                ("cmtitle", category_title.clone()),
                ("cmnamespace", namespace_filter.clone()),
                ("cmprop", "ids|title".to_string()),
                ("cmtype", "page".to_string()),
                ("cmlimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("cmcontinue", token.clone()));
            }

            let response = self.request_json(Method::Get, &params, false)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode categorymembers API response")?;
            members.extend(parsed.query.categorymembers.into_iter().map(|item| {
                CategoryMember {
                    page_id: item.pageid,
                    namespace: item.ns,
                    title: item.title,
                }
            }));

            continue_token = parsed.continuation.and_then(|cont| cont.cmcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(members)
    }
}

/// Canonical prefix for the namespaces this bot touches.
pub fn namespace_prefix(namespace: i32) -> Option<&'static str> {
    match namespace {
        NS_MAIN => Some(""),
        NS_USER => Some("User:"),
        NS_USER_TALK => Some("User talk:"),
        NS_CATEGORY => Some("Category:"),
        NS_DRAFT => Some("Draft:"),
        NS_DRAFT_TALK => Some("Draft talk:"),
        _ => None,
    }
}

/// Display title for a database row (`page_namespace`, `page_title`).
pub fn full_title(namespace: i32, db_title: &str) -> Result<String> {
    let prefix = namespace_prefix(namespace)
        .ok_or_else(|| anyhow::anyhow!("unsupported namespace {namespace} for {db_title}"))?;
    Ok(format!("{prefix}{}", db_title.replace('_', " ")))
}

fn parse_page_response(response: Value) -> Result<Option<RemotePage>> {
    let parsed: QueryResponse = serde_json::from_value(response)?;
    let Some(page) = parsed.query.pages.into_iter().next() else {
        return Ok(None);
    };
    if page.missing.unwrap_or(false) || page.invalid.unwrap_or(false) {
        return Ok(None);
    }
    let (Some(page_id), Some(revision)) = (page.pageid, page.revisions.into_iter().next()) else {
        return Ok(None);
    };
    let Some(content) = revision.slots.and_then(|slots| slots.main).and_then(|main| main.content)
    else {
        return Ok(None);
    };

    Ok(Some(RemotePage {
        title: page.title,
        namespace: page.ns,
        page_id,
        revision_id: revision.revid,
        timestamp: revision.timestamp,
        content,
    }))
}

fn parse_edit_response(response: Value, title: &str) -> Result<EditOutcome> {
    let edit_payload: EditResponse =
        serde_json::from_value(response).context("failed to decode edit response")?;
    let edit = edit_payload
        .edit
        .ok_or_else(|| anyhow::anyhow!("missing edit payload in API response"))?;
    if edit.result.as_deref() != Some("Success") {
        bail!(
            "MediaWiki edit failed for {}: {}",
            title,
            edit.result.unwrap_or_else(|| "unknown".to_string())
        );
    }
    if edit.nochange.unwrap_or(false) {
        return Ok(EditOutcome::NoChange);
    }
    Ok(EditOutcome::Saved {
        revision_id: edit.newrevid,
    })
}

fn api_error(payload: &Value) -> Option<(String, String)> {
    let error = payload.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    let info = error
        .get("info")
        .and_then(Value::as_str)
        .unwrap_or("unknown info");
    Some((code.to_string(), info.to_string()))
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_api_code(code: &str) -> bool {
    matches!(code, "ratelimited" | "maxlag" | "readonly")
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    categorymembers: Vec<CategoryMemberItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryMemberItem {
    pageid: i64,
    ns: i32,
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    #[serde(default)]
    ns: i32,
    #[serde(default)]
    title: String,
    missing: Option<bool>,
    invalid: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: String,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
    nochange: Option<bool>,
    newrevid: Option<i64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        EditOutcome, NS_DRAFT, NS_USER, api_error, full_title, is_retryable_api_code,
        parse_edit_response, parse_page_response,
    };

    #[test]
    fn full_title_prefixes_namespace_and_restores_spaces() {
        assert_eq!(
            full_title(NS_DRAFT, "Some_new_band").expect("draft title"),
            "Draft:Some new band"
        );
        assert_eq!(
            full_title(NS_USER, "Example/sandbox").expect("user title"),
            "User:Example/sandbox"
        );
        assert!(full_title(4, "Village_pump").is_err());
    }

    #[test]
    fn parse_page_response_reads_main_slot() {
        let payload = json!({
            "batchcomplete": true,
            "query": {
                "pages": [{
                    "pageid": 42,
                    "ns": 118,
                    "title": "Draft:Foo",
                    "revisions": [{
                        "revid": 7,
                        "parentid": 6,
                        "timestamp": "2026-01-02T03:04:05Z",
                        "slots": {"main": {"contentmodel": "wikitext", "content": "[[Category:Foo]]"}}
                    }]
                }]
            }
        });
        let page = parse_page_response(payload)
            .expect("parse")
            .expect("page present");
        assert_eq!(page.page_id, 42);
        assert_eq!(page.namespace, 118);
        assert_eq!(page.revision_id, 7);
        assert_eq!(page.content, "[[Category:Foo]]");
    }

    #[test]
    fn parse_page_response_treats_missing_page_as_none() {
        let payload = json!({
            "query": {"pages": [{"pageid": 42, "missing": true}]}
        });
        assert!(parse_page_response(payload).expect("parse").is_none());
        assert!(parse_page_response(json!({})).expect("parse").is_none());
    }

    #[test]
    fn parse_edit_response_distinguishes_nochange() {
        let saved = json!({"edit": {"result": "Success", "pageid": 42, "newrevid": 8}});
        assert_eq!(
            parse_edit_response(saved, "Draft:Foo").expect("saved"),
            EditOutcome::Saved {
                revision_id: Some(8)
            }
        );
        let unchanged = json!({"edit": {"result": "Success", "nochange": true}});
        assert_eq!(
            parse_edit_response(unchanged, "Draft:Foo").expect("nochange"),
            EditOutcome::NoChange
        );
        let failed = json!({"edit": {"result": "Failure"}});
        let error = parse_edit_response(failed, "Draft:Foo").expect_err("must fail");
        assert!(error.to_string().contains("Draft:Foo"));
    }

    #[test]
    fn api_error_extracts_code_and_info() {
        let payload = json!({"error": {"code": "editconflict", "info": "Edit conflict."}});
        assert_eq!(
            api_error(&payload),
            Some(("editconflict".to_string(), "Edit conflict.".to_string()))
        );
        assert_eq!(api_error(&json!({"query": {}})), None);
    }

    #[test]
    fn throttling_codes_are_retryable() {
        assert!(is_retryable_api_code("ratelimited"));
        assert!(is_retryable_api_code("maxlag"));
        assert!(!is_retryable_api_code("editconflict"));
        assert!(!is_retryable_api_code("badtoken"));
    }
}
