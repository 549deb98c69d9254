//! Shared application state passed to all API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use ps_domain::config::Config;
use ps_providers::ProviderRegistry;
use ps_store::EventStore;

use crate::runtime::approval::ApprovalBroker;
use crate::runtime::cancel::AbortRegistry;
use crate::runtime::kube::{register_builtin_tools, ClusterBackend};
use crate::runtime::mux::EventMux;
use crate::runtime::registry::ToolRegistry;
use crate::runtime::todo::{todo_tools, TodoBoard};

/// task_id → trace_id for the investigations currently in flight. Entries
/// are created on start and removed after `done`, so abort/approval routes
/// can find the session from the client-visible task id.
#[derive(Default)]
pub struct TraceIndex {
    map: RwLock<HashMap<String, String>>,
}

impl TraceIndex {
    pub fn bind(&self, task_id: &str, trace_id: &str) {
        self.map
            .write()
            .insert(task_id.to_owned(), trace_id.to_owned());
    }

    pub fn resolve(&self, task_id: &str) -> Option<String> {
        self.map.read().get(task_id).cloned()
    }

    pub fn unbind(&self, task_id: &str) {
        self.map.write().remove(task_id);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<ProviderRegistry>,
    pub store: Arc<EventStore>,
    pub registry: Arc<ToolRegistry>,
    pub mux: Arc<EventMux>,
    pub aborts: Arc<AbortRegistry>,
    pub approvals: Arc<ApprovalBroker>,
    pub todos: Arc<TodoBoard>,
    pub traces: Arc<TraceIndex>,
}

impl AppState {
    /// Wire the full runtime. The cluster backend is injected by the
    /// wrapper binary; the bundled daemon uses the unconfigured stub.
    pub fn build(
        config: Arc<Config>,
        store: Arc<EventStore>,
        backend: Arc<dyn ClusterBackend>,
    ) -> Self {
        let llm = Arc::new(ProviderRegistry::from_config(&config.llm));
        Self::with_providers(config, store, backend, llm)
    }

    /// Like [`AppState::build`] but with an explicit provider registry —
    /// the seam tests use to inject scripted LLMs.
    pub fn with_providers(
        config: Arc<Config>,
        store: Arc<EventStore>,
        backend: Arc<dyn ClusterBackend>,
        llm: Arc<ProviderRegistry>,
    ) -> Self {
        let todos = Arc::new(TodoBoard::new(config.storage.todo_dir()));

        let mut registry = ToolRegistry::new(&config.tools.deny_patterns);
        // Backend flags follow the configured default kubecontext; agents
        // can still switch contexts at runtime via set_kubecontext.
        let flags = *config.observability.for_context(None);
        register_builtin_tools(&mut registry, backend, store.clone(), &flags);
        for spec in todo_tools(todos.clone()) {
            registry.register(spec);
        }

        Self {
            config,
            llm,
            mux: Arc::new(EventMux::new(store.clone())),
            store,
            registry: Arc::new(registry),
            aborts: Arc::new(AbortRegistry::new()),
            approvals: Arc::new(ApprovalBroker::new()),
            todos,
            traces: Arc::new(TraceIndex::default()),
        }
    }
}
