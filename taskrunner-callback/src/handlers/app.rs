use std::sync::Arc;

use axum::{routing, Router};
use taskrunner_core::store::JobStore;

use super::callback;

pub fn add_routes(router: Router<Arc<dyn JobStore>>, store: Arc<dyn JobStore>) -> Router {
    router.route("/", routing::post(callback::post)).with_state(store)
}

pub async fn index() -> &'static str {
    "taskrunner callback server"
}
