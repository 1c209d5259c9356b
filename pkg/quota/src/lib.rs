pub mod accessor;
pub mod evaluator;
pub mod locks;
pub mod pod;
pub mod pvc;
pub mod registry;
pub mod service;

#[cfg(test)]
pub(crate) mod fixtures;
