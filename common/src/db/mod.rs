// Persistence adapters: connection pools and the job repository

pub mod pool;
pub mod redis;
pub mod repositories;

pub use pool::DbPool;
pub use redis::RedisPool;
