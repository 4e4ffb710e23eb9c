use axum::{routing::get, Router};

use crate::state::AppState;

pub mod admin;
pub mod autopay;
pub mod documents;
pub mod health;
pub mod invitations;
pub mod late_fees;
pub mod leases;
pub mod ledger;
pub mod maintenance;
pub mod notifications;
pub mod payments;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(ledger::router())
        .merge(late_fees::router())
        .merge(leases::router())
        .merge(payments::router())
        .merge(autopay::router())
        .merge(maintenance::router())
        .merge(documents::router())
        .merge(invitations::router())
        .merge(notifications::router())
        .merge(admin::router())
}
