//! API router configuration.

use axum::routing::{get, post};
use axum::Router;
use fault_relay_core::ProxyCollection;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Create the control API router.
pub fn create_router(proxies: ProxyCollection) -> Router {
    let api_routes = Router::new()
        .route("/version", get(handlers::version))
        .route("/reset", post(handlers::reset))
        .route("/populate", post(handlers::populate))
        .route(
            "/proxies",
            get(handlers::list_proxies)
                .post(handlers::create_proxy)
                .delete(handlers::destroy_all),
        )
        .route(
            "/proxies/{proxy}",
            get(handlers::get_proxy)
                .post(handlers::update_proxy)
                .patch(handlers::update_proxy)
                .delete(handlers::delete_proxy),
        )
        .route("/proxies/{proxy}/links", get(handlers::list_links))
        .route(
            "/proxies/{proxy}/toxics",
            get(handlers::list_toxics).post(handlers::create_toxic),
        )
        .route(
            "/proxies/{proxy}/toxics/{toxic}",
            get(handlers::get_toxic)
                .post(handlers::update_toxic)
                .patch(handlers::update_toxic)
                .delete(handlers::delete_toxic),
        )
        .with_state(proxies);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api_routes.layer(cors).layer(TraceLayer::new_for_http())
}
