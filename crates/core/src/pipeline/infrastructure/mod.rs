pub mod estimation_worker;
pub mod frame_pump;
