use crate::config;
use crate::llm::cache::PromptCache;
use common::error::GitRepickError;
use common::utils::debug_log;
use std::time::Duration;

/// The opaque request/response channel to the model. Production uses the
/// HTTP transport; tests substitute a scripted one.
pub trait LlmTransport {
    fn model_id(&self) -> &str;
    fn send(&self, prompt: &str) -> Result<String, GitRepickError>;
}

/// JSON POST to an inference endpoint. Credentials and proxies come from the
/// ambient process environment, matching how git itself is configured.
pub struct HttpTransport {
    endpoint: String,
    model: String,
    region: String,
    timeout_secs: u64,
    max_tokens: u32,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn from_options(
        model: Option<&str>,
        region: Option<&str>,
    ) -> Result<Self, GitRepickError> {
        let cfg = config::Config::get();
        let endpoint = cfg.llm_endpoint().map(|s| s.to_string()).ok_or_else(|| {
            GitRepickError::LlmTransport(
                "no LLM endpoint configured; set GIT_REPICK_LLM_ENDPOINT or llm_endpoint in the config file"
                    .to_string(),
            )
        })?;
        Ok(HttpTransport {
            endpoint,
            model: model.unwrap_or(cfg.llm_model()).to_string(),
            region: region.unwrap_or(cfg.llm_region()).to_string(),
            timeout_secs: cfg.llm_timeout_secs(),
            max_tokens: cfg.llm_max_tokens(),
            auth_token: std::env::var("GIT_REPICK_LLM_TOKEN").ok(),
        })
    }
}

impl LlmTransport for HttpTransport {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn send(&self, prompt: &str) -> Result<String, GitRepickError> {
        let body = serde_json::json!({
            "model": self.model,
            "region": self.region,
            "temperature": 0.0,
            "max_tokens": self.max_tokens,
            "prompt": prompt,
        });

        let mut request = minreq::post(self.endpoint.as_str())
            .with_header("Content-Type", "application/json")
            .with_header(
                "User-Agent",
                format!("git-repick/{}", env!("CARGO_PKG_VERSION")),
            )
            .with_timeout(self.timeout_secs)
            .with_body(body.to_string());
        if let Some(token) = &self.auth_token {
            request = request.with_header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .map_err(|e| GitRepickError::LlmTransport(format!("request failed: {}", e)))?;

        if !(200..300).contains(&response.status_code) {
            return Err(GitRepickError::LlmTransport(format!(
                "endpoint returned HTTP {} {}",
                response.status_code, response.reason_phrase
            )));
        }

        let text = response
            .as_str()
            .map_err(|e| GitRepickError::LlmTransport(format!("non-UTF-8 response: {}", e)))?;
        extract_completion(text)
    }
}

/// Pull the completion text out of the endpoint's JSON reply. Accepts the
/// handful of field spellings inference gateways use.
fn extract_completion(body: &str) -> Result<String, GitRepickError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| GitRepickError::LlmTransport(format!("malformed response body: {}", e)))?;

    let candidates = [
        value.pointer("/output/message/content/0/text"),
        value.pointer("/completion"),
        value.pointer("/output_text"),
        value.pointer("/text"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(text) = candidate.as_str() {
            return Ok(text.to_string());
        }
    }
    Err(GitRepickError::LlmTransport(
        "response body carries no completion text".to_string(),
    ))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LlmStats {
    pub calls: u64,
    pub cache_hits: u64,
    pub submitted_words: u64,
    pub received_words: u64,
}

/// Stateless request/response client with a disk-backed response cache.
///
/// Every query consults the cache with the byte-exact prompt fingerprint;
/// every miss is written back before the response is used. Transient
/// transport failures are retried with exponential backoff.
pub struct LlmClient {
    transport: Box<dyn LlmTransport>,
    cache: Option<PromptCache>,
    max_retries: u32,
    retry_delay: Duration,
    stats: LlmStats,
}

impl LlmClient {
    pub fn new(transport: Box<dyn LlmTransport>, cache: Option<PromptCache>) -> Self {
        let cfg = config::Config::get();
        LlmClient {
            transport,
            cache,
            max_retries: cfg.llm_max_retries(),
            retry_delay: Duration::from_millis(cfg.llm_retry_delay_ms()),
            stats: LlmStats::default(),
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn model_id(&self) -> &str {
        self.transport.model_id()
    }

    /// Short identifier of the model for commit annotations.
    pub fn model_prefix(&self) -> String {
        self.transport
            .model_id()
            .split('-')
            .next()
            .unwrap_or("uninitialized")
            .to_string()
    }

    pub fn stats(&self) -> LlmStats {
        self.stats
    }

    pub fn query(&mut self, prompt: &str) -> Result<String, GitRepickError> {
        if prompt.is_empty() {
            return Err(GitRepickError::Generic("refusing to send an empty prompt".to_string()));
        }

        if let Some(cache) = &self.cache {
            if let Some(answer) = cache.lookup(self.transport.model_id(), prompt) {
                self.stats.cache_hits += 1;
                return Ok(answer);
            }
        }

        let answer = self.send_with_retry(prompt)?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(self.transport.model_id(), prompt, &answer) {
                eprintln!(
                    "git-repick: failed writing LLM cache file {}: {}",
                    cache.path().display(),
                    e
                );
            }
        }

        self.stats.received_words += answer.split_whitespace().count() as u64;
        Ok(answer)
    }

    fn send_with_retry(&mut self, prompt: &str) -> Result<String, GitRepickError> {
        self.stats.calls += 1;
        self.stats.submitted_words += prompt.split_whitespace().count() as u64;

        let mut last_err: Option<GitRepickError> = None;
        for attempt in 0..=self.max_retries {
            debug_log(&format!(
                "LLM query attempt {}/{}",
                attempt + 1,
                self.max_retries + 1
            ));
            match self.transport.send(prompt) {
                Ok(answer) => {
                    if attempt > 0 {
                        debug_log(&format!("LLM request succeeded after {} retries", attempt));
                    }
                    return Ok(answer);
                }
                Err(e) => {
                    let retryable = is_retryable(&e);
                    if attempt == self.max_retries || !retryable {
                        if !retryable {
                            debug_log(&format!("non-retryable LLM error: {}", e));
                        }
                        last_err = Some(e);
                        break;
                    }
                    let delay = self.retry_delay * 2u32.saturating_pow(attempt);
                    eprintln!(
                        "git-repick: retryable LLM error (attempt {}/{}): {}; retrying in {:.1}s",
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay.as_secs_f32()
                    );
                    std::thread::sleep(delay);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| GitRepickError::LlmTransport("no attempt was made".to_string())))
    }
}

fn is_retryable(err: &GitRepickError) -> bool {
    let text = err.to_string().to_lowercase();
    [
        "throttl",
        "rate exceeded",
        "too many requests",
        "service unavailable",
        "internal server error",
        "timeout",
        "timed out",
        "connection",
        "temporary failure",
        "http 429",
        "http 500",
        "http 502",
        "http 503",
    ]
    .iter()
    .any(|needle| text.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ScriptedTransport {
        replies: RefCell<Vec<Result<String, String>>>,
        sent: RefCell<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<String, String>>) -> Self {
            ScriptedTransport {
                replies: RefCell::new(replies),
                sent: RefCell::new(Vec::new()),
            }
        }
    }

    impl LlmTransport for ScriptedTransport {
        fn model_id(&self) -> &str {
            "test-model-v1"
        }

        fn send(&self, prompt: &str) -> Result<String, GitRepickError> {
            self.sent.borrow_mut().push(prompt.to_string());
            let mut replies = self.replies.borrow_mut();
            if replies.is_empty() {
                return Err(GitRepickError::LlmTransport("script exhausted".to_string()));
            }
            replies.remove(0).map_err(GitRepickError::LlmTransport)
        }
    }

    fn client(replies: Vec<Result<String, String>>, cache: Option<PromptCache>) -> LlmClient {
        LlmClient::new(Box::new(ScriptedTransport::new(replies)), cache)
            .with_retry(2, Duration::from_millis(1))
    }

    #[test]
    fn test_query_returns_answer_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        let mut c = client(
            vec![Ok("the answer".to_string())],
            Some(PromptCache::new(cache_path.clone())),
        );
        assert_eq!(c.query("a prompt").unwrap(), "the answer");

        // Second query is served from the cache: the scripted transport is
        // exhausted, so a network attempt would fail loudly.
        let mut c2 = client(vec![], Some(PromptCache::new(cache_path)));
        assert_eq!(c2.query("a prompt").unwrap(), "the answer");
        assert_eq!(c2.stats().cache_hits, 1);
        assert_eq!(c2.stats().calls, 0);
    }

    #[test]
    fn test_retries_transient_errors() {
        let mut c = client(
            vec![
                Err("HTTP 503 service unavailable".to_string()),
                Err("timeout".to_string()),
                Ok("recovered".to_string()),
            ],
            None,
        );
        assert_eq!(c.query("p").unwrap(), "recovered");
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut c = client(
            vec![
                Err("timeout".to_string()),
                Err("timeout".to_string()),
                Err("timeout".to_string()),
            ],
            None,
        );
        assert!(matches!(
            c.query("p").unwrap_err(),
            GitRepickError::LlmTransport(_)
        ));
    }

    #[test]
    fn test_non_retryable_fails_fast() {
        let mut c = client(
            vec![
                Err("HTTP 401 unauthorized".to_string()),
                Ok("never reached".to_string()),
            ],
            None,
        );
        assert!(c.query("p").is_err());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let mut c = client(vec![], None);
        assert!(c.query("").is_err());
    }

    #[test]
    fn test_extract_completion_field_spellings() {
        let converse = r#"{"output":{"message":{"content":[{"text":"hi"}]}}}"#;
        assert_eq!(extract_completion(converse).unwrap(), "hi");
        let flat = r#"{"completion":"hello"}"#;
        assert_eq!(extract_completion(flat).unwrap(), "hello");
        assert!(extract_completion(r#"{"other":1}"#).is_err());
        assert!(extract_completion("not json").is_err());
    }

    #[test]
    fn test_model_prefix() {
        let c = client(vec![], None);
        assert_eq!(c.model_prefix(), "test");
    }
}
