pub mod notifier;
pub mod payment_processor;
