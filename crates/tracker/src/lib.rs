pub mod dashboard;
pub mod detector;
pub mod feed;
pub mod journal;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod sync;
pub mod window;
