mod differencer;
mod gate;

pub use differencer::{
    DifferencerConfig, FrameDifferencer, MotionRegion, MotionScore, DEFAULT_BLUR_SIGMA,
    DEFAULT_DIFF_THRESHOLD, DEFAULT_DILATE_ITERATIONS, DEFAULT_MIN_AREA,
};
pub use gate::{should_capture, MotionGate, DEFAULT_COOLDOWN};
