pub mod detector_worker;
pub mod execution_provider;
pub mod onnx_blazeface_detector;
pub mod shared_model_cache;
