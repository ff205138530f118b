pub mod detection;
pub mod estimation;
pub mod pipeline;
pub mod shared;
pub mod video;
pub mod windowing;
