//! Built-in diagnostic tools and the cluster backend seam.
//!
//! Concrete kubectl / log-store / metrics clients live in wrapper programs;
//! the runtime only sees the [`ClusterBackend`] trait. The default
//! [`UnconfiguredBackend`] answers every call with a structured "not
//! configured" error so agents can replan instead of crashing.

use std::sync::Arc;

use serde_json::Value;

use ps_domain::config::BackendFlags;
use ps_domain::error::{Error, Result};
use ps_store::EventStore;

use super::registry::{SafetyClass, ToolContext, ToolInvoker, ToolOutcome, ToolRegistry, ToolSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct PodLogsRequest {
    pub pod_name: String,
    pub namespace: String,
    pub container: Option<String>,
    pub tail: Option<u32>,
    pub previous: bool,
}

/// Read access to a cluster and its observability stack. Every method takes
/// the active kubecontext so one backend can serve multiple clusters.
#[async_trait::async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn list_resources(
        &self,
        kind: &str,
        namespace: Option<&str>,
        kubecontext: Option<&str>,
    ) -> Result<Value>;

    async fn resource_yaml(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        kubecontext: Option<&str>,
    ) -> Result<String>;

    async fn resource_dependency(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        kubecontext: Option<&str>,
    ) -> Result<Value>;

    async fn recent_events(
        &self,
        namespace: Option<&str>,
        kubecontext: Option<&str>,
    ) -> Result<Value>;

    async fn pod_logs(&self, req: &PodLogsRequest, kubecontext: Option<&str>) -> Result<String>;

    /// Query the log aggregation backend (Loki-style).
    async fn search_logs(
        &self,
        query: &str,
        range_minutes: u32,
        kubecontext: Option<&str>,
    ) -> Result<Value>;

    /// Query the metrics backend (Prometheus-style).
    async fn query_metrics(
        &self,
        query: &str,
        range_minutes: u32,
        kubecontext: Option<&str>,
    ) -> Result<Value>;

    async fn active_alerts(&self, kubecontext: Option<&str>) -> Result<Value>;

    /// Run a read-oriented diagnostic command. Gated behind approval.
    async fn run_command(&self, command: &str, kubecontext: Option<&str>) -> Result<String>;
}

/// Placeholder backend used until a wrapper wires real clients in.
pub struct UnconfiguredBackend;

impl UnconfiguredBackend {
    fn unavailable(what: &str) -> Error {
        Error::Other(format!(
            "{what} is not configured on this daemon; \
             connect a cluster backend and retry"
        ))
    }
}

#[async_trait::async_trait]
impl ClusterBackend for UnconfiguredBackend {
    async fn list_resources(&self, _: &str, _: Option<&str>, _: Option<&str>) -> Result<Value> {
        Err(Self::unavailable("cluster access"))
    }

    async fn resource_yaml(
        &self,
        _: &str,
        _: &str,
        _: Option<&str>,
        _: Option<&str>,
    ) -> Result<String> {
        Err(Self::unavailable("cluster access"))
    }

    async fn resource_dependency(
        &self,
        _: &str,
        _: &str,
        _: Option<&str>,
        _: Option<&str>,
    ) -> Result<Value> {
        Err(Self::unavailable("cluster access"))
    }

    async fn recent_events(&self, _: Option<&str>, _: Option<&str>) -> Result<Value> {
        Err(Self::unavailable("cluster access"))
    }

    async fn pod_logs(&self, _: &PodLogsRequest, _: Option<&str>) -> Result<String> {
        Err(Self::unavailable("cluster access"))
    }

    async fn search_logs(&self, _: &str, _: u32, _: Option<&str>) -> Result<Value> {
        Err(Self::unavailable("the log aggregation backend"))
    }

    async fn query_metrics(&self, _: &str, _: u32, _: Option<&str>) -> Result<Value> {
        Err(Self::unavailable("the metrics backend"))
    }

    async fn active_alerts(&self, _: Option<&str>) -> Result<Value> {
        Err(Self::unavailable("the metrics backend"))
    }

    async fn run_command(&self, _: &str, _: Option<&str>) -> Result<String> {
        Err(Self::unavailable("command execution"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invokers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy)]
enum BuiltinKind {
    ListResources,
    ResourceYaml,
    ResourceDependency,
    RecentEvents,
    PodLogs,
    SearchLogs,
    QueryMetrics,
    ActiveAlerts,
    RunCommand,
}

struct BuiltinInvoker {
    backend: Arc<dyn ClusterBackend>,
    kind: BuiltinKind,
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn arg_u32(args: &Value, key: &str, default: u32) -> u32 {
    args.get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(default)
}

#[async_trait::async_trait]
impl ToolInvoker for BuiltinInvoker {
    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> ToolOutcome {
        let kctx = ctx.current_kubecontext();
        let kctx = kctx.as_deref();
        let namespace = arg_str(args, "namespace");

        let result: Result<ToolOutcome> = match self.kind {
            BuiltinKind::ListResources => self
                .backend
                .list_resources(arg_str(args, "kind").unwrap_or("pod"), namespace, kctx)
                .await
                .map(ToolOutcome::structured),
            BuiltinKind::ResourceYaml => self
                .backend
                .resource_yaml(
                    arg_str(args, "kind").unwrap_or("pod"),
                    arg_str(args, "name").unwrap_or_default(),
                    namespace,
                    kctx,
                )
                .await
                .map(ToolOutcome::text),
            BuiltinKind::ResourceDependency => self
                .backend
                .resource_dependency(
                    arg_str(args, "kind").unwrap_or("pod"),
                    arg_str(args, "name").unwrap_or_default(),
                    namespace,
                    kctx,
                )
                .await
                .map(ToolOutcome::structured),
            BuiltinKind::RecentEvents => self
                .backend
                .recent_events(namespace, kctx)
                .await
                .map(ToolOutcome::structured),
            BuiltinKind::PodLogs => {
                let req = PodLogsRequest {
                    pod_name: arg_str(args, "pod_name").unwrap_or_default().to_string(),
                    namespace: arg_str(args, "namespace").unwrap_or("default").to_string(),
                    container: arg_str(args, "container").map(String::from),
                    tail: args.get("tail").and_then(|v| v.as_u64()).map(|v| v as u32),
                    previous: args
                        .get("previous")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                };
                self.backend.pod_logs(&req, kctx).await.map(ToolOutcome::text)
            }
            BuiltinKind::SearchLogs => self
                .backend
                .search_logs(
                    arg_str(args, "query").unwrap_or_default(),
                    arg_u32(args, "range_minutes", 15),
                    kctx,
                )
                .await
                .map(ToolOutcome::structured),
            BuiltinKind::QueryMetrics => self
                .backend
                .query_metrics(
                    arg_str(args, "query").unwrap_or_default(),
                    arg_u32(args, "range_minutes", 15),
                    kctx,
                )
                .await
                .map(ToolOutcome::structured),
            BuiltinKind::ActiveAlerts => self
                .backend
                .active_alerts(kctx)
                .await
                .map(ToolOutcome::structured),
            BuiltinKind::RunCommand => self
                .backend
                .run_command(arg_str(args, "command").unwrap_or_default(), kctx)
                .await
                .map(ToolOutcome::text),
        };

        result.unwrap_or_else(|e| ToolOutcome::failure(e.to_string()))
    }
}

/// Switches the trace's active kubecontext.
struct SetKubecontext;

#[async_trait::async_trait]
impl ToolInvoker for SetKubecontext {
    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(context) = arg_str(args, "context") else {
            return ToolOutcome::failure("missing required argument: context");
        };
        *ctx.kubecontext.write() = Some(context.to_string());
        ToolOutcome::text(format!("kubecontext set to {context}"))
    }
}

/// Looks up prior investigations so recurring issues reuse past findings.
struct PastInvestigations {
    store: Arc<EventStore>,
}

#[async_trait::async_trait]
impl ToolInvoker for PastInvestigations {
    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> ToolOutcome {
        let keywords = arg_str(args, "keywords").unwrap_or_default();
        let limit = arg_u32(args, "limit", 5) as usize;
        match self.store.search_tasks(keywords, limit) {
            Ok(hits) => {
                let total = hits.len();
                ToolOutcome::structured(serde_json::json!({
                    "investigations": hits,
                    "total_found": total,
                }))
            }
            Err(e) => ToolOutcome::failure(format!("past investigation lookup failed: {e}")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn obj_schema(properties: Value, required: &[&str]) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn ns(args: &Value) -> String {
    arg_str(args, "namespace").unwrap_or("default").to_string()
}

/// Register every built-in diagnostic tool. Tools backed by a disabled
/// observability backend are left out, so agents never see them.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    backend: Arc<dyn ClusterBackend>,
    store: Arc<EventStore>,
    flags: &BackendFlags,
) {
    let builtin = |kind: BuiltinKind| -> Arc<dyn ToolInvoker> {
        Arc::new(BuiltinInvoker {
            backend: backend.clone(),
            kind,
        })
    };

    registry.register(ToolSpec {
        name: "list_resources".into(),
        description: "List Kubernetes resources of a kind, optionally scoped to a namespace."
            .into(),
        parameters: obj_schema(
            serde_json::json!({
                "kind": { "type": "string", "description": "Resource kind, e.g. pod, deployment" },
                "namespace": { "type": "string", "description": "Namespace (omit for all)" },
            }),
            &["kind"],
        ),
        safety: SafetyClass::Auto,
        ui_component: Some("resource_list".into()),
        agents: vec!["discovery".into()],
        title: Some(|args| format!("Listing {}s in {}", arg_str(args, "kind").unwrap_or("resource"), ns(args))),
        invoker: builtin(BuiltinKind::ListResources),
    });

    registry.register(ToolSpec {
        name: "get_events".into(),
        description: "Fetch recent cluster events, optionally scoped to a namespace.".into(),
        parameters: obj_schema(
            serde_json::json!({
                "namespace": { "type": "string", "description": "Namespace (omit for all)" },
            }),
            &[],
        ),
        safety: SafetyClass::Auto,
        ui_component: None,
        agents: vec!["discovery".into()],
        title: Some(|args| format!("Checking recent events in {}", ns(args))),
        invoker: builtin(BuiltinKind::RecentEvents),
    });

    registry.register(ToolSpec {
        name: "get_resource_yaml".into(),
        description: "Fetch the full YAML manifest of one resource.".into(),
        parameters: obj_schema(
            serde_json::json!({
                "kind": { "type": "string" },
                "name": { "type": "string" },
                "namespace": { "type": "string" },
            }),
            &["kind", "name"],
        ),
        safety: SafetyClass::Auto,
        ui_component: None,
        agents: vec!["discovery".into(), "supervisor".into()],
        title: Some(|args| {
            format!(
                "Analyzing {}/{}",
                arg_str(args, "kind").unwrap_or("resource"),
                arg_str(args, "name").unwrap_or("unknown")
            )
        }),
        invoker: builtin(BuiltinKind::ResourceYaml),
    });

    registry.register(ToolSpec {
        name: "get_resource_dependency".into(),
        description: "Map the owners, dependents, and referenced objects of one resource.".into(),
        parameters: obj_schema(
            serde_json::json!({
                "kind": { "type": "string" },
                "name": { "type": "string" },
                "namespace": { "type": "string" },
            }),
            &["kind", "name"],
        ),
        safety: SafetyClass::Auto,
        ui_component: None,
        agents: vec!["discovery".into(), "supervisor".into()],
        title: Some(|args| {
            format!(
                "Mapping dependencies for {}/{}",
                arg_str(args, "kind").unwrap_or("resource"),
                arg_str(args, "name").unwrap_or("unknown")
            )
        }),
        invoker: builtin(BuiltinKind::ResourceDependency),
    });

    registry.register(ToolSpec {
        name: "get_pod_logs".into(),
        description: "Read logs from one pod/container, with tail and previous-instance options."
            .into(),
        parameters: obj_schema(
            serde_json::json!({
                "pod_name": { "type": "string" },
                "namespace": { "type": "string" },
                "container": { "type": "string" },
                "tail": { "type": "integer", "description": "Number of trailing lines" },
                "previous": { "type": "boolean", "description": "Logs of the previous instance" },
            }),
            &["pod_name"],
        ),
        safety: SafetyClass::Auto,
        ui_component: None,
        agents: vec!["logs".into()],
        title: Some(|args| {
            format!(
                "Parsing logs for {}",
                arg_str(args, "pod_name").unwrap_or("unknown")
            )
        }),
        invoker: builtin(BuiltinKind::PodLogs),
    });

    if flags.logs {
        registry.register(ToolSpec {
            name: "search_logs".into(),
            description: "Search the log aggregation backend with a label/filter query.".into(),
            parameters: obj_schema(
                serde_json::json!({
                    "query": { "type": "string", "description": "Log query expression" },
                    "range_minutes": { "type": "integer", "description": "Lookback window" },
                }),
                &["query"],
            ),
            safety: SafetyClass::Auto,
            ui_component: None,
            agents: vec!["logs".into()],
            title: Some(|args| {
                format!(
                    "Searching logs for: {}",
                    super::excerpt(arg_str(args, "query").unwrap_or("unknown"), 30)
                )
            }),
            invoker: builtin(BuiltinKind::SearchLogs),
        });
    }

    if flags.metrics {
        registry.register(ToolSpec {
            name: "query_metrics".into(),
            description: "Run a range query against the metrics backend.".into(),
            parameters: obj_schema(
                serde_json::json!({
                    "query": { "type": "string", "description": "PromQL-style expression" },
                    "range_minutes": { "type": "integer", "description": "Lookback window" },
                }),
                &["query"],
            ),
            safety: SafetyClass::Auto,
            ui_component: Some("metrics_chart".into()),
            agents: vec!["metrics".into()],
            title: Some(|args| {
                format!(
                    "Querying metrics: {}",
                    super::excerpt(arg_str(args, "query").unwrap_or("unknown"), 40)
                )
            }),
            invoker: builtin(BuiltinKind::QueryMetrics),
        });

        registry.register(ToolSpec {
            name: "get_alerts".into(),
            description: "Fetch currently firing alerts from the metrics backend.".into(),
            parameters: obj_schema(serde_json::json!({}), &[]),
            safety: SafetyClass::Auto,
            ui_component: None,
            agents: vec!["metrics".into()],
            title: Some(|_| "Fetching active alerts".into()),
            invoker: builtin(BuiltinKind::ActiveAlerts),
        });
    }

    registry.register(ToolSpec {
        name: "run_command".into(),
        description: "Run a diagnostic shell command against the cluster. Requires approval."
            .into(),
        parameters: obj_schema(
            serde_json::json!({
                "command": { "type": "string", "description": "Command line to execute" },
            }),
            &["command"],
        ),
        safety: SafetyClass::Gated,
        ui_component: None,
        agents: vec!["discovery".into(), "supervisor".into()],
        title: Some(|args| {
            format!(
                "Running: {}",
                super::excerpt(arg_str(args, "command").unwrap_or("command"), 40)
            )
        }),
        invoker: builtin(BuiltinKind::RunCommand),
    });

    registry.register(ToolSpec {
        name: "set_kubecontext".into(),
        description: "Switch the Kubernetes context used by subsequent tool calls.".into(),
        parameters: obj_schema(
            serde_json::json!({
                "context": { "type": "string", "description": "Context name from kubeconfig" },
            }),
            &["context"],
        ),
        safety: SafetyClass::Auto,
        ui_component: None,
        agents: vec!["supervisor".into()],
        title: Some(|args| {
            format!(
                "Switching context to {}",
                arg_str(args, "context").unwrap_or("unknown")
            )
        }),
        invoker: Arc::new(SetKubecontext),
    });

    registry.register(ToolSpec {
        name: "get_past_investigations".into(),
        description: "Search previous investigations by keywords to spot recurring issues."
            .into(),
        parameters: obj_schema(
            serde_json::json!({
                "keywords": { "type": "string" },
                "limit": { "type": "integer" },
            }),
            &["keywords"],
        ),
        safety: SafetyClass::Auto,
        ui_component: None,
        agents: vec!["supervisor".into()],
        title: Some(|args| {
            format!(
                "Looking up past investigations: {}",
                super::excerpt(arg_str(args, "keywords").unwrap_or(""), 30)
            )
        }),
        invoker: Arc::new(PastInvestigations { store }),
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
