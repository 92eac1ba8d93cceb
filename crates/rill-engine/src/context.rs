use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use rill_backend::{Backend, InitData};
use rill_cache::CacheIndex;
use rill_core::{WorkflowId, WorkflowOptions};
use rill_io::PathIo;
use rill_metadata::MetadataPublisher;
use rill_store::Store;

use crate::config::EngineConfig;

/// Shared engine services, passed explicitly into every task.
///
/// The dispatch semaphore is the only global coordination point for
/// throughput; everything else here is either immutable configuration or an
/// internally synchronized service.
pub struct EngineContext {
  pub config: EngineConfig,
  pub store: Arc<dyn Store>,
  pub cache: Arc<dyn CacheIndex>,
  pub backend: Arc<Backend>,
  pub io: PathIo,
  pub publisher: Arc<dyn MetadataPublisher>,
  /// Bounds calls concurrently dispatched to the backend.
  pub dispatch_permits: Arc<Semaphore>,
}

impl EngineContext {
  pub fn new(
    config: EngineConfig,
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheIndex>,
    backend: Arc<Backend>,
    io: PathIo,
    publisher: Arc<dyn MetadataPublisher>,
  ) -> Arc<Self> {
    let dispatch_permits = Arc::new(Semaphore::new(config.max_dispatched_calls));
    Arc::new(Self {
      config,
      store,
      cache,
      backend,
      io,
      publisher,
      dispatch_permits,
    })
  }
}

/// Calls to resume instead of re-dispatching after a restart, keyed by
/// (call name, shard).
pub(crate) type ResumePlan =
  std::collections::HashMap<(String, Option<u32>), (rill_store::CallRow, String)>;

/// Per-workflow environment shared by all of the workflow's node and call
/// tasks. The task graph is owned by the workflow state machine; call tasks
/// only read from this. Cloned with a child cancellation token to scope
/// abort to a scatter group.
#[derive(Clone)]
pub(crate) struct WorkflowEnv {
  pub id: WorkflowId,
  /// Resolved workflow root (a path string routed through the IO layer).
  pub root: String,
  pub document: rill_core::WorkflowDocument,
  pub options: WorkflowOptions,
  pub init: InitData,
  /// Raw workflow-level inputs.
  pub inputs: serde_json::Map<String, serde_json::Value>,
  pub cancel: CancellationToken,
  pub resume: Arc<ResumePlan>,
}

/// Outputs of one completed node, keyed by output name.
pub(crate) type NodeOutputs = BTreeMap<String, rill_core::Value>;
