//! Exec session registry.
//!
//! Maps exec ids to sessions for the lifetime of the daemon. Sessions are
//! never removed: an exited session stays inspectable.

use crate::service::exec::state::ExecSession;
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::ExecConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of exec sessions.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<ExecSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session under a fresh id.
    ///
    /// The id is chosen while holding the write lock, so concurrent creates
    /// never hand out the same id.
    pub async fn create(&self, container_id: &str, config: ExecConfig) -> Arc<ExecSession> {
        let mut sessions = self.sessions.write().await;

        let id = loop {
            let candidate = generate_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(ExecSession::new(
            id.clone(),
            container_id.to_string(),
            config,
        ));
        sessions.insert(id, session.clone());
        session
    }

    pub async fn get(&self, exec_id: &str) -> ExecdResult<Arc<ExecSession>> {
        self.sessions
            .read()
            .await
            .get(exec_id)
            .cloned()
            .ok_or_else(|| ExecdError::NotFound(format!("no such exec instance: {}", exec_id)))
    }

    /// Number of sessions ever created.
    pub(crate) async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
