use std::sync::Arc;

use fulltext_core::auth::TokenVerifier;
use fulltext_core::{Coordinator, DocumentSource, ExtractionEngine, Store};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<Store>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub engine: Arc<dyn ExtractionEngine>,
    /// Used to resolve submission ownership during authorization.
    pub owner_lookup: Arc<dyn DocumentSource>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        store: Arc<Store>,
        verifier: Arc<dyn TokenVerifier>,
        engine: Arc<dyn ExtractionEngine>,
        owner_lookup: Arc<dyn DocumentSource>,
    ) -> Self {
        Self {
            coordinator,
            store,
            verifier,
            engine,
            owner_lookup,
        }
    }
}
