mod correlator;
mod resolver;
mod speed;

pub use correlator::SessionCorrelator;
pub use resolver::ResolverCache;
pub use speed::SpeedTracker;
