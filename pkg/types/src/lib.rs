pub mod config;
pub mod namespace;
pub mod pod;
pub mod quantity;
pub mod quota;
pub mod selector;
pub mod service;
pub mod validate;
pub mod volume;
