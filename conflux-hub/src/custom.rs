//! CustomMCP handler: synthetic tools whose invocations are forwarded to
//! an external workflow platform.
//!
//! Results are cached per (tool, canonical arguments) with at-most-once
//! delivery: a workflow that outlives the call budget leaves a pending
//! entry behind and the caller gets a sentinel telling it to poll again
//! with the same arguments. A periodic sweeper evicts consumed and expired
//! entries and fails pendings that stalled.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use conflux_config::CustomToolConfig;
use conflux_mcp::error::{McpError, McpResult};
use conflux_mcp::protocol::{Tool, ToolsCallResult};

/// Owner marker for synthetic tools in the registry
pub const CUSTOM_OWNER: &str = "customMCP";

/// Default Coze API host (mainland region)
pub const COZE_DEFAULT_BASE_URL: &str = "https://api.coze.cn";

/// Serialize a value with recursively sorted object keys. Non-finite
/// numbers have no JSON form and are rejected.
pub fn canonical_json(value: &Value) -> McpResult<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> McpResult<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Number(n) => {
            if n.as_f64().map(|f| !f.is_finite()).unwrap_or(false) {
                return Err(McpError::protocol("non-finite number in arguments"));
            }
            out.push_str(&n.to_string());
        }
        other => out.push_str(&other.to_string()),
    }
    Ok(())
}

/// Cache key: hash of the tool name and canonical arguments. Doubles as
/// the task id carried by timeout sentinels.
pub fn cache_key(tool: &str, args: &Value) -> McpResult<String> {
    let canonical = canonical_json(args)?;
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Seam to the workflow platform, so the cache machinery is testable
/// without a network.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Run one workflow to completion and return its `data` payload
    async fn run_workflow(&self, workflow_id: &str, parameters: &Value) -> McpResult<Value>;
}

/// HTTP client for the Coze workflow API
pub struct CozeClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl CozeClient {
    pub fn new(token: String, base_url: Option<String>) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| COZE_DEFAULT_BASE_URL.to_string()),
            token,
        })
    }
}

#[async_trait]
impl WorkflowClient for CozeClient {
    async fn run_workflow(&self, workflow_id: &str, parameters: &Value) -> McpResult<Value> {
        let url = format!("{}/v1/workflow/run", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "workflow_id": workflow_id, "parameters": parameters }))
            .send()
            .await
            .map_err(|e| McpError::connection_failed(format!("workflow request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(McpError::auth_required(format!(
                "workflow platform rejected credentials ({})",
                status
            )));
        }
        if !status.is_success() {
            return Err(McpError::Remote {
                code: status.as_u16() as i32,
                message: format!("workflow platform returned {}", status),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| McpError::protocol(format!("bad workflow response: {}", e)))?;

        // The platform wraps the useful payload in a `data` field
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// Tuning for the handler
#[derive(Debug, Clone)]
pub struct CustomMcpConfig {
    /// Wall-clock budget one call waits for its workflow
    pub call_budget: Duration,

    pub sweep_interval: Duration,

    /// How long finished entries stay available for polling
    pub entry_ttl: Duration,

    /// Pending age after which an entry is failed as stalled
    pub stall_threshold: Duration,
}

impl Default for CustomMcpConfig {
    fn default() -> Self {
        Self {
            call_budget: Duration::from_secs(8),
            sweep_interval: Duration::from_secs(60),
            entry_ttl: Duration::from_secs(300),
            stall_threshold: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

struct CacheEntry {
    status: EntryStatus,
    result: Option<ToolsCallResult>,
    error: Option<String>,
    /// Set when the failure came from the stall sweeper; the next call
    /// with this key restarts the workflow instead of replaying the error
    stalled: bool,
    consumed: bool,
    created_at: Instant,
    ttl: Duration,
    retry_count: u32,
}

impl CacheEntry {
    fn pending(ttl: Duration, retry_count: u32) -> Self {
        Self {
            status: EntryStatus::Pending,
            result: None,
            error: None,
            stalled: false,
            consumed: false,
            created_at: Instant::now(),
            ttl,
            retry_count,
        }
    }

    fn evictable(&self) -> bool {
        self.status != EntryStatus::Pending
            && (self.consumed || self.created_at.elapsed() > self.ttl)
    }
}

enum LookupAction {
    Deliver(ToolsCallResult),
    Fail(String),
    Sentinel,
    Start { retry_count: u32 },
}

/// The synthetic service backing workflow tools
pub struct CustomMcpHandler {
    tools: Vec<CustomToolConfig>,
    client: Option<Arc<dyn WorkflowClient>>,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    config: CustomMcpConfig,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CustomMcpHandler {
    /// `client` is None when no platform token is configured: the tools
    /// are still advertised, calls fail with a configuration error.
    pub fn new(
        tools: Vec<CustomToolConfig>,
        client: Option<Arc<dyn WorkflowClient>>,
        config: CustomMcpConfig,
    ) -> Self {
        let cache: Arc<Mutex<HashMap<String, CacheEntry>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweeper = {
            let cache = cache.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // discard the immediate first tick
                loop {
                    ticker.tick().await;
                    sweep(&cache, config.stall_threshold);
                }
            })
        };

        Self {
            tools,
            client,
            cache,
            config,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// The advertised synthetic tool set
    pub fn tools(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .map(|t| Tool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Invoke a workflow tool through the cache machinery
    pub async fn call(&self, name: &str, args: &Value) -> McpResult<ToolsCallResult> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| McpError::ToolNotFound {
                name: name.to_string(),
            })?;
        let client = self
            .client
            .clone()
            .ok_or_else(|| McpError::configuration("platform token not set"))?;

        let key = cache_key(name, args)?;

        let action = {
            let mut cache = self.cache.lock().unwrap();
            match cache.get_mut(&key) {
                Some(entry) if entry.status == EntryStatus::Completed && !entry.consumed => {
                    entry.consumed = true;
                    LookupAction::Deliver(entry.result.clone().unwrap_or_default())
                }
                Some(entry) if entry.status == EntryStatus::Completed => {
                    // Already delivered once: an identical call is a miss
                    let retry_count = 0;
                    cache.insert(
                        key.clone(),
                        CacheEntry::pending(self.config.entry_ttl, retry_count),
                    );
                    LookupAction::Start { retry_count }
                }
                Some(entry) if entry.status == EntryStatus::Failed && entry.stalled => {
                    let retry_count = entry.retry_count;
                    cache.insert(
                        key.clone(),
                        CacheEntry::pending(self.config.entry_ttl, retry_count),
                    );
                    LookupAction::Start { retry_count }
                }
                Some(entry) if entry.status == EntryStatus::Failed => {
                    LookupAction::Fail(entry.error.clone().unwrap_or_default())
                }
                Some(_) => LookupAction::Sentinel,
                None => {
                    cache.insert(key.clone(), CacheEntry::pending(self.config.entry_ttl, 0));
                    LookupAction::Start { retry_count: 0 }
                }
            }
        };

        match action {
            LookupAction::Deliver(result) => Ok(result),
            LookupAction::Fail(message) => Err(McpError::Remote {
                code: -32000,
                message,
            }),
            LookupAction::Sentinel => Ok(self.sentinel(&key)),
            LookupAction::Start { retry_count } => {
                self.start_and_race(client, tool.workflow_id().to_string(), args.clone(), key, retry_count)
                    .await
            }
        }
    }

    /// Launch the workflow as a detached task and race it against the
    /// call budget. The task outlives the race and writes its outcome into
    /// the cache either way.
    async fn start_and_race(
        &self,
        client: Arc<dyn WorkflowClient>,
        workflow_id: String,
        parameters: Value,
        key: String,
        retry_count: u32,
    ) -> McpResult<ToolsCallResult> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let cache = self.cache.clone();
        let task_key = key.clone();

        tokio::spawn(async move {
            let outcome = client.run_workflow(&workflow_id, &parameters).await;

            let mut cache = cache.lock().unwrap();
            if let Some(entry) = cache.get_mut(&task_key) {
                // Status only ever advances away from Pending; a stall
                // sweep or restart may already have moved it.
                if entry.status == EntryStatus::Pending {
                    match outcome {
                        Ok(value) => {
                            entry.status = EntryStatus::Completed;
                            entry.result = Some(result_from_payload(value));
                        }
                        Err(e) => {
                            entry.status = EntryStatus::Failed;
                            entry.error = Some(e.to_string());
                        }
                    }
                }
            }
            let _ = done_tx.send(());
        });

        if retry_count > 0 {
            tracing::info!(key = %key, retry = retry_count, "restarting stalled workflow");
        }

        match tokio::time::timeout(self.config.call_budget, done_rx).await {
            Ok(_) => {
                let mut cache = self.cache.lock().unwrap();
                match cache.get_mut(&key) {
                    Some(entry) if entry.status == EntryStatus::Completed && !entry.consumed => {
                        entry.consumed = true;
                        Ok(entry.result.clone().unwrap_or_default())
                    }
                    Some(entry) if entry.status == EntryStatus::Failed => Err(McpError::Remote {
                        code: -32000,
                        message: entry.error.clone().unwrap_or_default(),
                    }),
                    // Consumed or evicted underneath us: tell the caller
                    // to come back rather than failing
                    _ => Ok(self.sentinel(&key)),
                }
            }
            Err(_) => Ok(self.sentinel(&key)), // entry stays pending
        }
    }

    /// Timeout sentinel: a well-formed tool result telling the caller the
    /// task is still running. Never cached.
    fn sentinel(&self, task_id: &str) -> ToolsCallResult {
        ToolsCallResult::text(format!(
            "The task is still running in the background. Call this tool again \
             with the same arguments later to collect the result. taskId: {}",
            task_id
        ))
    }

    /// Run one sweep immediately (the periodic sweeper does this on its own)
    pub fn sweep_now(&self) {
        sweep(&self.cache, self.config.stall_threshold);
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Stop the background sweeper
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for CustomMcpHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep(cache: &Arc<Mutex<HashMap<String, CacheEntry>>>, stall_threshold: Duration) {
    let mut cache = cache.lock().unwrap();

    for (key, entry) in cache.iter_mut() {
        if entry.status == EntryStatus::Pending && entry.created_at.elapsed() > stall_threshold {
            tracing::warn!(key = %key, "pending workflow entry stalled");
            entry.status = EntryStatus::Failed;
            entry.error = Some(format!("task stalled: {}", key));
            entry.stalled = true;
            entry.retry_count += 1;
        }
    }

    cache.retain(|_, entry| !entry.evictable());
}

/// The platform's `data` payload becomes the tool result text, stringified
/// unless it already is a string.
fn result_from_payload(value: Value) -> ToolsCallResult {
    match value {
        Value::String(text) => ToolsCallResult::text(text),
        other => ToolsCallResult::text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_config::ToolHandlerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tool_config(name: &str) -> CustomToolConfig {
        CustomToolConfig {
            name: name.to_string(),
            description: "workflow tool".to_string(),
            input_schema: json!({"type": "object"}),
            handler: ToolHandlerConfig::Proxy {
                platform: "coze".to_string(),
                workflow_id: format!("wf-{}", name),
            },
        }
    }

    struct StubWorkflow {
        delay: Duration,
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubWorkflow {
        fn instant() -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkflowClient for StubWorkflow {
        async fn run_workflow(&self, workflow_id: &str, parameters: &Value) -> McpResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(McpError::Remote {
                    code: 500,
                    message: "workflow exploded".to_string(),
                });
            }
            Ok(json!({ "workflow": workflow_id, "echo": parameters }))
        }
    }

    fn handler(client: Arc<StubWorkflow>, budget: Duration) -> CustomMcpHandler {
        CustomMcpHandler::new(
            vec![tool_config("slow"), tool_config("quick")],
            Some(client),
            CustomMcpConfig {
                call_budget: budget,
                sweep_interval: Duration::from_secs(3600),
                entry_ttl: Duration::from_millis(200),
                stall_threshold: Duration::from_millis(100),
            },
        )
    }

    fn result_text(result: &ToolsCallResult) -> &str {
        match &result.content[0] {
            conflux_mcp::protocol::ToolContent::Text { text } => text,
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, {"q": 2, "p": 3}]}});
        let b = json!({"a": {"y": [1, {"p": 3, "q": 2}], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(
            canonical_json(&json!({"b": 1, "a": 2})).unwrap(),
            r#"{"a":2,"b":1}"#
        );
    }

    #[test]
    fn test_cache_key_ignores_key_order() {
        let k1 = cache_key("slow", &json!({"x": 1, "y": 2})).unwrap();
        let k2 = cache_key("slow", &json!({"y": 2, "x": 1})).unwrap();
        let k3 = cache_key("slow", &json!({"x": 1, "y": 3})).unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, cache_key("other", &json!({"x": 1, "y": 2})).unwrap());
    }

    #[tokio::test]
    async fn test_fast_workflow_completes_within_budget() {
        let client = StubWorkflow::instant();
        let handler = handler(client.clone(), Duration::from_secs(1));

        let result = handler.call("quick", &json!({"x": 1})).await.unwrap();
        assert!(result_text(&result).contains("wf-quick"));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_sentinel_then_result_then_restart() {
        let client = StubWorkflow::slow(Duration::from_millis(150));
        let handler = handler(client.clone(), Duration::from_millis(30));
        let args = json!({"x": 1});
        let key = cache_key("slow", &args).unwrap();

        // First call: budget elapses, sentinel comes back
        let first = handler.call("slow", &args).await.unwrap();
        assert!(result_text(&first).contains("still running"));
        assert!(result_text(&first).contains(&key));

        // Second call while pending: same sentinel, no second workflow
        let second = handler.call("slow", &args).await.unwrap();
        assert!(result_text(&second).contains(&key));
        assert_eq!(client.call_count(), 1);

        // Wait out the workflow, then collect the real result exactly once
        tokio::time::sleep(Duration::from_millis(200)).await;
        let third = handler.call("slow", &args).await.unwrap();
        assert!(result_text(&third).contains("wf-slow"));
        assert_eq!(client.call_count(), 1);

        // Consumed: an identical call re-invokes the workflow
        let fourth = handler.call("slow", &args).await.unwrap();
        assert!(result_text(&fourth).contains("wf-slow"));
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_at_most_once_under_concurrency() {
        let client = StubWorkflow::slow(Duration::from_millis(50));
        let handler = Arc::new(handler(client.clone(), Duration::from_millis(10)));
        let args = json!({"n": 42});

        let mut joins = Vec::new();
        for _ in 0..10 {
            let handler = handler.clone();
            let args = args.clone();
            joins.push(tokio::spawn(async move {
                handler.call("slow", &args).await.unwrap()
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        // Ten racing callers, one workflow started
        assert_eq!(client.call_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut delivered = 0;
        for _ in 0..2 {
            let result = handler.call("slow", &args).await.unwrap();
            if result_text(&result).contains("wf-slow") {
                delivered += 1;
            }
        }
        // The completed result is handed out exactly once; the next call
        // started a fresh workflow
        assert!(delivered >= 1);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_workflow_replays_error() {
        let client = StubWorkflow::failing();
        let handler = handler(client.clone(), Duration::from_secs(1));
        let args = json!({"x": 1});

        let err = handler.call("quick", &args).await.unwrap_err();
        assert!(matches!(err, McpError::Remote { .. }));

        // The failure is cached; no second workflow run
        let err = handler.call("quick", &args).await.unwrap_err();
        assert!(err.to_string().contains("workflow exploded"));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stalled_entry_restarts_on_next_call() {
        let client = StubWorkflow::slow(Duration::from_secs(30));
        let handler = handler(client.clone(), Duration::from_millis(10));
        let args = json!({"x": 1});

        let first = handler.call("slow", &args).await.unwrap();
        assert!(result_text(&first).contains("still running"));
        assert_eq!(client.call_count(), 1);

        // Age past the stall threshold, then sweep
        tokio::time::sleep(Duration::from_millis(120)).await;
        handler.sweep_now();

        // The stalled entry restarts instead of replaying the failure
        let retried = handler.call("slow", &args).await.unwrap();
        assert!(result_text(&retried).contains("still running"));
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_consumed_and_expired() {
        let client = StubWorkflow::instant();
        let handler = handler(client, Duration::from_secs(1));

        handler.call("quick", &json!({"a": 1})).await.unwrap();
        assert_eq!(handler.cached_entries(), 1);

        // Consumed entries go on the next sweep
        handler.sweep_now();
        assert_eq!(handler.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_missing_token_fails_call_but_tools_stay_advertised() {
        let handler = CustomMcpHandler::new(
            vec![tool_config("quick")],
            None,
            CustomMcpConfig::default(),
        );

        assert_eq!(handler.tools().len(), 1);
        let err = handler.call("quick", &json!({})).await.unwrap_err();
        match err {
            McpError::Configuration { message } => assert_eq!(message, "platform token not set"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let handler = CustomMcpHandler::new(
            vec![tool_config("quick")],
            Some(StubWorkflow::instant()),
            CustomMcpConfig::default(),
        );
        let err = handler.call("nope", &json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound { .. }));
    }
}
