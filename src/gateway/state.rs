use std::sync::Arc;

use crate::branch_transfer::TransferCoordinator;
use crate::db::Database;

use super::auth::JwtVerifier;

/// Gateway application state (shared)
#[derive(Clone)]
pub struct AppState {
    /// Owner of every request status transition
    pub coordinator: Arc<TransferCoordinator>,
    /// Bearer token verification
    pub jwt: Arc<JwtVerifier>,
    /// PostgreSQL pool, absent in in-memory mode
    pub pg_db: Option<Arc<Database>>,
}

impl AppState {
    pub fn new(coordinator: Arc<TransferCoordinator>, jwt: Arc<JwtVerifier>) -> Self {
        Self {
            coordinator,
            jwt,
            pg_db: None,
        }
    }

    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.pg_db = Some(db);
        self
    }
}
