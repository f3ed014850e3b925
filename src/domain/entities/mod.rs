pub mod audit;
pub mod lifecycle_event;
pub mod side_effect;
pub mod subscription;
