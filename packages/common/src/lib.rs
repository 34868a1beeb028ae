pub mod media;
pub mod retry;
pub mod storage;

pub use media::TypeClass;
pub use retry::RetryPolicy;
