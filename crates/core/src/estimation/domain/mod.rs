pub mod estimation_adapter;
pub mod estimation_backend;
pub mod reconciler;
pub mod retry_policy;
pub mod vitals_estimate;
