pub mod audit;
pub mod autopay;
pub mod late_fees;
pub mod ledger;
pub mod messaging;
pub mod notification_center;
pub mod payments;
pub mod proration;
pub mod scheduler;
pub mod storage;
pub mod stripe_webhooks;
