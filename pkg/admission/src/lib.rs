pub mod evaluator;

pub use evaluator::{AdmissionAttributes, AdmissionError, QuotaAdmission};
