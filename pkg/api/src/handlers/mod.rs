pub mod quotas;
pub mod resources;
