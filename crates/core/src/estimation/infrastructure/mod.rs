pub mod pos_estimator;
pub mod remote_estimator;
