//! API routes

pub mod billing;
pub mod health;
pub mod license;

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // All billing/license routes require a session
    let protected_routes = Router::new()
        .route("/license", get(license::list_licenses))
        .route("/license", post(license::create_license))
        .route("/license/:license_id", delete(license::delete_license))
        .route("/billing-v2", get(billing::get_billing))
        .route("/billing-v2", patch(billing::update_billing))
        .route("/billing-v2/license", get(billing::get_license))
        .route("/billing-v2/license", post(billing::attach_license))
        .route("/billing-v2/activate", get(billing::activate_subscription))
        .route("/billing-v2/usage", get(billing::get_usage))
        .route("/billing-v2/spend", get(billing::get_spend))
        .route("/billing-v2/invoices", get(billing::get_invoices))
        .route("/billing-v2/portal", get(billing::get_portal))
        .route("/billing-v2/credits/purchase", post(billing::purchase_credits))
        .route("/billing-v2/trials/activate", post(billing::activate_trial))
        .route("/billing-v2/startups/apply", post(billing::apply_startup_program))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(health_routes)
        .nest("/api", protected_routes)
        .with_state(state)
}
