//! Mail service implementations

pub mod memory;

pub use memory::InMemoryMailService;
