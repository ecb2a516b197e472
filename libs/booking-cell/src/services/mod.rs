pub mod booking;
pub mod confirm;
pub mod hold;
pub mod notify;
pub mod plans;
pub mod reconcile;
pub mod sweeper;

pub use booking::BookingService;
pub use confirm::PaymentFinalizer;
pub use hold::HoldManager;
pub use plans::PlanService;
pub use reconcile::WebhookReconciler;
pub use sweeper::ExpirySweeper;
